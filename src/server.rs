//! Tunnel server construction and supervision.
//!
//! The supervisor owns the single live server handle per process and tracks
//! liveness as explicit state so teardown can never double-stop. The
//! transport itself sits behind the [`TunnelServer`] / [`TunnelServerFactory`]
//! traits; the shipping implementation is a QUIC endpoint with mutual TLS.

use std::fs::File;
use std::io::{self, BufReader};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use quinn::Endpoint;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::error::{SupervisorError, SupervisorResult};
use crate::pki::CredentialSet;

/// ALPN protocol identifier for tunnel connections.
const ALPN_TUNNEL: &[u8] = b"tunnelkeeper";

/// Errors reported by a tunnel server implementation.
#[derive(Debug, Error)]
pub enum ServerError {
    /// I/O error binding the endpoint or reading credentials
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS configuration error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// A credential file exists but is not usable
    #[error("Credential file {path} is not usable: {message}")]
    Credential { path: PathBuf, message: String },

    /// Graceful shutdown error
    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

/// Everything needed to construct and start the tunnel server.
#[derive(Debug, Clone)]
pub struct ServerBinding {
    pub listen_address: IpAddr,
    pub listen_port: u16,
    /// Virtual network the tunnel serves; routing and address assignment
    /// are owned by the data-plane layer.
    pub network: Ipv4Net,
    /// Interface name override; `None` lets the implementation choose.
    pub interface_name: Option<String>,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    pub authority_cert: PathBuf,
}

/// A running tunnel server instance.
#[async_trait]
pub trait TunnelServer: Send {
    /// Begin accepting connections in the background. Non-blocking.
    fn run(&mut self);

    /// Gracefully stop; returns once listening resources are released.
    async fn close(&mut self) -> Result<(), ServerError>;

    /// Address the server is actually bound to.
    fn local_addr(&self) -> SocketAddr;
}

/// Constructs tunnel server instances from a binding.
#[async_trait]
pub trait TunnelServerFactory: Send + Sync {
    async fn build(&self, binding: &ServerBinding) -> Result<Box<dyn TunnelServer>, ServerError>;
}

/// Holds the single live server handle and drives start/stop.
pub struct ServerSupervisor {
    factory: Arc<dyn TunnelServerFactory>,
    server: Option<Box<dyn TunnelServer>>,
    live: bool,
}

impl ServerSupervisor {
    pub fn new(factory: Arc<dyn TunnelServerFactory>) -> Self {
        ServerSupervisor {
            factory,
            server: None,
            live: false,
        }
    }

    /// Whether a server was started and has not yet been stopped.
    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Validate the binding parameters and start the tunnel server.
    ///
    /// On success the server is accepting connections before this returns;
    /// its accept loop runs as a background task.
    pub async fn start(
        &mut self,
        config: &RunConfig,
        credentials: &CredentialSet,
    ) -> SupervisorResult<()> {
        let network: Ipv4Net = config.network.parse().map_err(|e| {
            SupervisorError::ServerStart(format!(
                "invalid network CIDR {:?}: {}",
                config.network, e
            ))
        })?;
        let listen_address: IpAddr = config.listen_address.parse().map_err(|e| {
            SupervisorError::ServerStart(format!(
                "invalid listen address {:?}: {}",
                config.listen_address, e
            ))
        })?;

        for path in [
            &credentials.server.cert_path,
            &credentials.server.key_path,
            &credentials.authority.cert_path,
        ] {
            File::open(path).map_err(|e| {
                SupervisorError::ServerStart(format!(
                    "credential file {} is not readable: {}",
                    path.display(),
                    e
                ))
            })?;
        }

        let binding = ServerBinding {
            listen_address,
            listen_port: config.listen_port,
            network,
            interface_name: config.interface_override().map(str::to_string),
            server_cert: credentials.server.cert_path.clone(),
            server_key: credentials.server.key_path.clone(),
            authority_cert: credentials.authority.cert_path.clone(),
        };

        let mut server = self
            .factory
            .build(&binding)
            .await
            .map_err(|e| SupervisorError::ServerStart(e.to_string()))?;
        server.run();

        info!(
            listen = %server.local_addr(),
            network = %binding.network,
            "tunnel server accepting connections"
        );
        self.server = Some(server);
        self.live = true;
        Ok(())
    }

    /// Request graceful shutdown and wait for listening resources to be
    /// released. A stop without a live server is a no-op.
    pub async fn stop(&mut self) -> SupervisorResult<()> {
        if !self.live {
            debug!("stop requested but no server is live");
            return Ok(());
        }
        self.live = false;

        if let Some(mut server) = self.server.take() {
            server
                .close()
                .await
                .map_err(|e| SupervisorError::ServerStop(e.to_string()))?;
        }
        Ok(())
    }
}

/// QUIC tunnel server: a quinn endpoint with mutual TLS.
///
/// Clients must present a certificate signed by the run's authority. Each
/// accepted connection is logged and held until the peer closes; packet
/// routing and address assignment belong to the data-plane layer.
pub struct QuicTunnelServer {
    endpoint: Endpoint,
    local_addr: SocketAddr,
    network: Ipv4Net,
    interface_name: Option<String>,
    accept_task: Option<JoinHandle<()>>,
}

impl QuicTunnelServer {
    /// Bind an endpoint with TLS built from the issued credentials.
    pub async fn bind(binding: &ServerBinding) -> Result<Self, ServerError> {
        let tls = build_server_tls(
            &binding.server_cert,
            &binding.server_key,
            &binding.authority_cert,
        )?;

        let mut server_config = quinn::ServerConfig::with_crypto(tls);
        let mut transport_config = quinn::TransportConfig::default();
        transport_config
            .max_idle_timeout(Some(Duration::from_secs(30).try_into().unwrap()));
        transport_config.keep_alive_interval(Some(Duration::from_secs(5)));
        server_config.transport = Arc::new(transport_config);

        let bind_addr = SocketAddr::new(binding.listen_address, binding.listen_port);
        let endpoint = Endpoint::server(server_config, bind_addr)?;
        let local_addr = endpoint.local_addr()?;

        Ok(QuicTunnelServer {
            endpoint,
            local_addr,
            network: binding.network,
            interface_name: binding.interface_name.clone(),
            accept_task: None,
        })
    }

    async fn handle_connection(connecting: quinn::Connecting) {
        match connecting.await {
            Ok(connection) => {
                info!(peer = %connection.remote_address(), "tunnel client connected");
                let reason = connection.closed().await;
                debug!(peer = %connection.remote_address(), %reason, "tunnel client disconnected");
            }
            Err(e) => {
                warn!(error = %e, "client handshake failed");
            }
        }
    }
}

#[async_trait]
impl TunnelServer for QuicTunnelServer {
    fn run(&mut self) {
        debug!(
            network = %self.network,
            interface = self.interface_name.as_deref().unwrap_or("<auto>"),
            "starting accept loop"
        );
        let endpoint = self.endpoint.clone();
        self.accept_task = Some(tokio::spawn(async move {
            while let Some(connecting) = endpoint.accept().await {
                tokio::spawn(Self::handle_connection(connecting));
            }
            debug!("endpoint closed, accept loop exiting");
        }));
    }

    async fn close(&mut self) -> Result<(), ServerError> {
        self.endpoint.close(0u32.into(), b"server shutting down");
        self.endpoint.wait_idle().await;

        if let Some(task) = self.accept_task.take() {
            task.await
                .map_err(|e| ServerError::Shutdown(e.to_string()))?;
        }
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Production factory building QUIC tunnel servers.
#[derive(Debug, Default)]
pub struct QuicServerFactory;

#[async_trait]
impl TunnelServerFactory for QuicServerFactory {
    async fn build(&self, binding: &ServerBinding) -> Result<Box<dyn TunnelServer>, ServerError> {
        Ok(Box::new(QuicTunnelServer::bind(binding).await?))
    }
}

/// Build the rustls server config: present the issued server chain, require
/// client certificates signed by the run's authority.
fn build_server_tls(
    cert_path: &Path,
    key_path: &Path,
    authority_path: &Path,
) -> Result<Arc<rustls::ServerConfig>, ServerError> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let mut roots = rustls::RootCertStore::empty();
    for authority in load_certs(authority_path)? {
        roots.add(&authority)?;
    }
    let verifier = rustls::server::AllowAnyAuthenticatedClient::new(roots);

    let mut config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_client_cert_verifier(Arc::new(verifier))
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![ALPN_TUNNEL.to_vec()];

    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> Result<Vec<rustls::Certificate>, ServerError> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader)?;
    if certs.is_empty() {
        return Err(ServerError::Credential {
            path: path.to_path_buf(),
            message: "no certificates found".to_string(),
        });
    }
    Ok(certs.into_iter().map(rustls::Certificate).collect())
}

fn load_key(path: &Path) -> Result<rustls::PrivateKey, ServerError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader)?;
    match keys.pop() {
        Some(key) => Ok(rustls::PrivateKey(key)),
        None => Err(ServerError::Credential {
            path: path.to_path_buf(),
            message: "no PKCS#8 private key found".to_string(),
        }),
    }
}
