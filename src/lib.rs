//! tunnelkeeper: ephemeral-PKI bootstrap and lifecycle supervision for a
//! mutual-TLS tunnel server.
//!
//! One run of the supervisor creates a self-cleaning credential workspace,
//! issues a root authority plus server/client leaf certificates into it,
//! starts the tunnel server bound to that material, waits for a termination
//! signal, and tears everything down in reverse acquisition order.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod pki;
pub mod server;
pub mod workspace;

// Re-export the types most callers need
pub use config::RunConfig;
pub use error::{SupervisorError, SupervisorResult};
pub use lifecycle::{LifecycleController, LifecyclePhase};
