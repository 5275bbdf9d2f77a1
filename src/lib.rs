//! Connection-aware client-side load balancer for agents that must stay
//! connected to one of several interchangeable control-plane servers.

pub mod config;
pub mod dialer;
pub mod lifecycle;
pub mod load_balancer;
pub mod net;
pub mod observability;

pub use config::AgentConfig;
pub use dialer::{Dialer, DialerHandle, ProxyConfigurator, ProxyEnvironment, ProxyError};
pub use lifecycle::{Agent, Shutdown};
pub use load_balancer::{LoadBalancer, LoadBalancerError, TrackedConnection, TrackedServer};
