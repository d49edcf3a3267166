//! Ephemeral credential workspace management.
//!
//! All PKI material for one run lives in a single uniquely named directory
//! under the system temp root. The directory is created before any credential
//! is issued and removed after the server has stopped (or failed to start).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;
use uuid::Uuid;

use crate::error::{SupervisorError, SupervisorResult};

/// Directory name prefix for workspaces created by this process.
const WORKSPACE_PREFIX: &str = "tunnelkeeper";

/// Attempts before giving up on finding an unused directory name.
const ACQUIRE_ATTEMPTS: u32 = 4;

/// A uniquely named, process-exclusive scratch directory holding the PKI
/// material for one run.
#[derive(Debug)]
pub struct CredentialWorkspace {
    root: PathBuf,
}

impl CredentialWorkspace {
    /// Create a fresh workspace directory under the system temp root.
    ///
    /// The directory is owner-only on unix since it will hold private keys.
    pub fn acquire() -> SupervisorResult<Self> {
        let base = std::env::temp_dir();
        for _ in 0..ACQUIRE_ATTEMPTS {
            let candidate = base.join(format!("{}-{}", WORKSPACE_PREFIX, Uuid::new_v4()));
            match fs::create_dir(&candidate) {
                Ok(()) => {
                    restrict_to_owner(&candidate).map_err(SupervisorError::Workspace)?;
                    debug!(path = %candidate.display(), "created credential workspace");
                    return Ok(CredentialWorkspace { root: candidate });
                }
                // Vanishingly unlikely with uuid names, but retry anyway.
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(SupervisorError::Workspace(e)),
            }
        }
        Err(SupervisorError::Workspace(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "could not find an unused workspace name",
        )))
    }

    /// Path to the workspace root directory.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Recursively remove the workspace and everything in it.
    ///
    /// Releasing a workspace that is already gone is a success no-op. Partial
    /// removal reports the offending path; callers treat this as a logged
    /// warning since teardown is best-effort and the process is exiting.
    pub fn release(&self) -> SupervisorResult<()> {
        if !self.root.exists() {
            debug!(path = %self.root.display(), "workspace already removed");
            return Ok(());
        }
        fs::remove_dir_all(&self.root).map_err(|e| SupervisorError::Cleanup {
            path: self.root.clone(),
            source: e,
        })?;
        debug!(path = %self.root.display(), "removed credential workspace");
        Ok(())
    }
}

fn restrict_to_owner(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut permissions = fs::metadata(path)?.permissions();
        permissions.set_mode(0o700);
        fs::set_permissions(path, permissions)?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_creates_unique_directories() {
        let a = CredentialWorkspace::acquire().unwrap();
        let b = CredentialWorkspace::acquire().unwrap();

        assert!(a.path().is_dir());
        assert!(b.path().is_dir());
        assert_ne!(a.path(), b.path());

        a.release().unwrap();
        b.release().unwrap();
    }

    #[test]
    fn release_removes_contents() {
        let workspace = CredentialWorkspace::acquire().unwrap();
        fs::write(workspace.path().join("ca.crt"), b"pem").unwrap();
        fs::write(workspace.path().join("ca.key"), b"pem").unwrap();

        workspace.release().unwrap();
        assert!(!workspace.path().exists());
    }

    #[test]
    fn release_is_a_noop_when_already_gone() {
        let workspace = CredentialWorkspace::acquire().unwrap();
        workspace.release().unwrap();

        // A second release must still report success.
        workspace.release().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn workspace_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let workspace = CredentialWorkspace::acquire().unwrap();
        let mode = fs::metadata(workspace.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);

        workspace.release().unwrap();
    }
}
