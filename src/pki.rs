//! Certificate roles, material paths, and the ordered PKI bootstrap.
//!
//! Credentials live at fixed, well-known filenames inside the workspace so
//! the server supervisor can be constructed from the workspace path alone,
//! with no knowledge of how the material was produced.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::error::{SupervisorError, SupervisorResult};

const AUTHORITY_CERT: &str = "ca.crt";
const AUTHORITY_KEY: &str = "ca.key";
const SERVER_CERT: &str = "server.crt";
const SERVER_KEY: &str = "server.key";
const CLIENT_CERT: &str = "client.crt";
const CLIENT_KEY: &str = "client.key";

/// Role of a certificate/key pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertRole {
    /// Self-signed trust root for the run
    Authority,
    /// Leaf presented by the tunnel server
    Server,
    /// Leaf presented by tunnel clients
    Client,
}

impl fmt::Display for CertRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CertRole::Authority => "authority",
            CertRole::Server => "server",
            CertRole::Client => "client",
        };
        write!(f, "{}", name)
    }
}

/// Errors reported by a certificate issuer implementation.
#[derive(Debug, Error)]
pub enum IssuerError {
    /// I/O error writing or reading credential files
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Certificate generation or signing error
    #[error("Certificate generation error: {0}")]
    Generation(#[from] rcgen::RcgenError),
}

/// A logical (certificate, private key) pair on disk.
#[derive(Debug, Clone)]
pub struct CertificateMaterial {
    pub role: CertRole,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl CertificateMaterial {
    fn new(role: CertRole, dir: &Path, cert_name: &str, key_name: &str) -> Self {
        CertificateMaterial {
            role,
            cert_path: dir.join(cert_name),
            key_path: dir.join(key_name),
        }
    }

    /// Both files exist on disk.
    pub fn exists(&self) -> bool {
        self.cert_path.is_file() && self.key_path.is_file()
    }
}

/// The full credential set for one run, at fixed workspace-relative names.
#[derive(Debug, Clone)]
pub struct CredentialSet {
    pub authority: CertificateMaterial,
    pub server: CertificateMaterial,
    pub client: CertificateMaterial,
}

impl CredentialSet {
    /// Lay out the credential paths inside a workspace directory.
    pub fn in_workspace(root: &Path) -> Self {
        CredentialSet {
            authority: CertificateMaterial::new(
                CertRole::Authority,
                root,
                AUTHORITY_CERT,
                AUTHORITY_KEY,
            ),
            server: CertificateMaterial::new(CertRole::Server, root, SERVER_CERT, SERVER_KEY),
            client: CertificateMaterial::new(CertRole::Client, root, CLIENT_CERT, CLIENT_KEY),
        }
    }
}

/// Collaborator contract for certificate issuance.
///
/// Implementations must not partially write: either both output files land
/// or neither does.
pub trait CertificateIssuer: Send + Sync {
    /// Issue the self-signed root authority pair at the given paths.
    fn issue_authority(&self, cert_out: &Path, key_out: &Path) -> Result<(), IssuerError>;

    /// Issue a leaf pair for `role`, signed by the authority material.
    fn issue_signed(
        &self,
        role: CertRole,
        authority_cert: &Path,
        authority_key: &Path,
        cert_out: &Path,
        key_out: &Path,
    ) -> Result<(), IssuerError>;
}

/// Issue authority, then server, then client material into the workspace.
///
/// Fail-fast: the first issuer error aborts the bootstrap with no retry.
/// Leaf issuance double-checks that the authority artifacts exist first;
/// with the fixed sequencing here that check should be unreachable.
pub fn bootstrap(issuer: &dyn CertificateIssuer, set: &CredentialSet) -> SupervisorResult<()> {
    info!("issuing authority material");
    issuer
        .issue_authority(&set.authority.cert_path, &set.authority.key_path)
        .map_err(|source| SupervisorError::Issuance {
            role: CertRole::Authority,
            source,
        })?;

    issue_leaf(issuer, &set.authority, &set.server)?;
    issue_leaf(issuer, &set.authority, &set.client)?;

    info!("credential bootstrap complete");
    Ok(())
}

fn issue_leaf(
    issuer: &dyn CertificateIssuer,
    authority: &CertificateMaterial,
    material: &CertificateMaterial,
) -> SupervisorResult<()> {
    if !authority.exists() {
        return Err(SupervisorError::Dependency {
            role: material.role,
        });
    }

    debug!(role = %material.role, "issuing leaf material");
    issuer
        .issue_signed(
            material.role,
            &authority.cert_path,
            &authority.key_path,
            &material.cert_path,
            &material.key_path,
        )
        .map_err(|source| SupervisorError::Issuance {
            role: material.role,
            source,
        })
}

/// Certificate issuer backed by `rcgen`.
///
/// Produces PEM-encoded certificates and PKCS#8 private keys usable directly
/// as rustls credentials.
#[derive(Debug, Default)]
pub struct RcgenIssuer;

impl RcgenIssuer {
    pub fn new() -> Self {
        RcgenIssuer
    }

    fn write_pair(
        cert_out: &Path,
        key_out: &Path,
        cert_pem: &str,
        key_pem: &str,
    ) -> Result<(), IssuerError> {
        fs::write(cert_out, cert_pem)?;
        if let Err(e) = write_key(key_out, key_pem) {
            // Do not leave a certificate without its key behind.
            let _ = fs::remove_file(cert_out);
            return Err(e.into());
        }
        Ok(())
    }
}

impl CertificateIssuer for RcgenIssuer {
    fn issue_authority(&self, cert_out: &Path, key_out: &Path) -> Result<(), IssuerError> {
        let mut params = rcgen::CertificateParams::new(Vec::new());
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "tunnelkeeper authority");
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::KeyCertSign,
            rcgen::KeyUsagePurpose::CrlSign,
        ];

        let cert = rcgen::Certificate::from_params(params)?;
        let cert_pem = cert.serialize_pem()?;
        let key_pem = cert.serialize_private_key_pem();

        Self::write_pair(cert_out, key_out, &cert_pem, &key_pem)
    }

    fn issue_signed(
        &self,
        role: CertRole,
        authority_cert: &Path,
        authority_key: &Path,
        cert_out: &Path,
        key_out: &Path,
    ) -> Result<(), IssuerError> {
        let authority = load_authority(authority_cert, authority_key)?;

        let mut params = match role {
            CertRole::Server => {
                let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()]);
                params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];
                params
            }
            _ => {
                let mut params = rcgen::CertificateParams::new(Vec::new());
                params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];
                params
            }
        };
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, format!("tunnelkeeper {}", role));

        let leaf = rcgen::Certificate::from_params(params)?;
        let cert_pem = leaf.serialize_pem_with_signer(&authority)?;
        let key_pem = leaf.serialize_private_key_pem();

        Self::write_pair(cert_out, key_out, &cert_pem, &key_pem)
    }
}

/// Reconstruct the signing authority from its on-disk PEM material.
fn load_authority(cert_path: &Path, key_path: &Path) -> Result<rcgen::Certificate, IssuerError> {
    let cert_pem = fs::read_to_string(cert_path)?;
    let key_pem = fs::read_to_string(key_path)?;
    let key_pair = rcgen::KeyPair::from_pem(&key_pem)?;
    let params = rcgen::CertificateParams::from_ca_cert_pem(&cert_pem, key_pair)?;
    Ok(rcgen::Certificate::from_params(params)?)
}

fn write_key(path: &Path, pem: &str) -> io::Result<()> {
    fs::write(path, pem)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut permissions = fs::metadata(path)?.permissions();
        permissions.set_mode(0o600);
        fs::set_permissions(path, permissions)?;
    }
    Ok(())
}
