//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via `tracing`)
//!     → metrics.rs (gauges and counters via the `metrics` facade)
//!
//! Consumers:
//!     → stdout (fmt layer)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Service name and server address are attached as fields, not baked into messages
//! - Metric updates are cheap; without an installed recorder they are no-ops

pub mod logging;
pub mod metrics;
