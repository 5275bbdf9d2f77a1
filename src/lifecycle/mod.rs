//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Config → Proxy dialer → Load balancer → Initial reconcile → Listener
//!
//! Running:
//!     Config reload → reconcile server list
//!
//! Shutdown (shutdown.rs, signals.rs):
//!     SIGTERM/SIGINT → broadcast → forwarder and reload loop exit
//! ```
//!
//! # Design Decisions
//! - `Agent` is the composition root; it owns the dialer handle and passes it down
//! - Fail fast: any startup error is fatal
//! - Listeners start last (traffic only when ready)

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::Agent;
