//! Error types for the supervisor core.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::pki::{CertRole, IssuerError};

/// Result type for supervisor operations.
pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Error types that can occur during a supervisor run.
///
/// Errors from the forward sequence (workspace, issuance, server start) are
/// fatal and propagate to the caller. `ServerStop` and `Cleanup` only arise
/// during teardown and are logged, never escalated.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Ephemeral credential workspace could not be created
    #[error("Workspace error: {0}")]
    Workspace(#[source] io::Error),

    /// Authority or leaf certificate issuance failed
    #[error("Failed to issue {role} material: {source}")]
    Issuance {
        role: CertRole,
        #[source]
        source: IssuerError,
    },

    /// Leaf issuance was attempted before authority material existed
    #[error("{role} material requested before authority material was issued")]
    Dependency { role: CertRole },

    /// Tunnel server could not be configured or started
    #[error("Server start error: {0}")]
    ServerStart(String),

    /// Graceful shutdown of the tunnel server did not complete cleanly
    #[error("Server stop error: {0}")]
    ServerStop(String),

    /// Workspace removal left residue behind
    #[error("Cleanup left residue at {path}: {source}")]
    Cleanup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
