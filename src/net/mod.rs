//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Local client connection
//!     → listener.rs (accept loop, connection limits)
//!     → forward.rs (dial selected server with failover)
//!     → bidirectional copy until either side closes
//! ```

pub mod forward;
pub mod listener;
