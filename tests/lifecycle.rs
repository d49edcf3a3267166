//! Lifecycle ordering and teardown contracts, driven through recording
//! collaborators plus one run against the real issuer and QUIC server.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use tunnelkeeper::config::RunConfig;
use tunnelkeeper::error::SupervisorError;
use tunnelkeeper::lifecycle::{LifecycleController, LifecyclePhase};
use tunnelkeeper::pki::{CertRole, CertificateIssuer, IssuerError, RcgenIssuer};
use tunnelkeeper::server::{
    QuicServerFactory, ServerBinding, ServerError, TunnelServer, TunnelServerFactory,
};

/// Shared event log plus the workspace path observed during issuance.
#[derive(Clone, Default)]
struct Trace {
    events: Arc<Mutex<Vec<String>>>,
    workspace: Arc<Mutex<Option<PathBuf>>>,
}

impl Trace {
    fn push(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn set_workspace(&self, path: &Path) {
        *self.workspace.lock().unwrap() = Some(path.to_path_buf());
    }

    fn workspace(&self) -> Option<PathBuf> {
        self.workspace.lock().unwrap().clone()
    }
}

/// Issuer that records call order and writes placeholder files.
struct ScriptedIssuer {
    trace: Trace,
    fail_on: Option<CertRole>,
}

impl ScriptedIssuer {
    fn record(&self, role: CertRole) -> Result<(), IssuerError> {
        self.trace.push(format!("issue {}", role));
        if self.fail_on == Some(role) {
            return Err(IssuerError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "injected issuance failure",
            )));
        }
        Ok(())
    }
}

impl CertificateIssuer for ScriptedIssuer {
    fn issue_authority(&self, cert_out: &Path, key_out: &Path) -> Result<(), IssuerError> {
        if let Some(parent) = cert_out.parent() {
            self.trace.set_workspace(parent);
        }
        self.record(CertRole::Authority)?;
        std::fs::write(cert_out, b"cert")?;
        std::fs::write(key_out, b"key")?;
        Ok(())
    }

    fn issue_signed(
        &self,
        role: CertRole,
        _authority_cert: &Path,
        _authority_key: &Path,
        cert_out: &Path,
        key_out: &Path,
    ) -> Result<(), IssuerError> {
        self.record(role)?;
        std::fs::write(cert_out, b"cert")?;
        std::fs::write(key_out, b"key")?;
        Ok(())
    }
}

/// Wraps the real issuer so tests can learn the workspace path.
struct SpyIssuer {
    inner: RcgenIssuer,
    trace: Trace,
}

impl CertificateIssuer for SpyIssuer {
    fn issue_authority(&self, cert_out: &Path, key_out: &Path) -> Result<(), IssuerError> {
        if let Some(parent) = cert_out.parent() {
            self.trace.set_workspace(parent);
        }
        self.inner.issue_authority(cert_out, key_out)
    }

    fn issue_signed(
        &self,
        role: CertRole,
        authority_cert: &Path,
        authority_key: &Path,
        cert_out: &Path,
        key_out: &Path,
    ) -> Result<(), IssuerError> {
        self.inner
            .issue_signed(role, authority_cert, authority_key, cert_out, key_out)
    }
}

struct ScriptedServer {
    trace: Trace,
    fail_close: bool,
}

#[async_trait]
impl TunnelServer for ScriptedServer {
    fn run(&mut self) {
        self.trace.push("server run");
    }

    async fn close(&mut self) -> Result<(), ServerError> {
        // Record whether the credential workspace still existed at stop
        // time; teardown must stop the server before removing it.
        let workspace_present = self
            .trace
            .workspace()
            .map(|path| path.exists())
            .unwrap_or(false);
        self.trace
            .push(format!("server close (workspace present: {})", workspace_present));
        if self.fail_close {
            return Err(ServerError::Shutdown("injected close failure".to_string()));
        }
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        "127.0.0.1:3234".parse().unwrap()
    }
}

struct ScriptedFactory {
    trace: Trace,
    fail: bool,
    fail_close: bool,
}

#[async_trait]
impl TunnelServerFactory for ScriptedFactory {
    async fn build(
        &self,
        _binding: &ServerBinding,
    ) -> Result<Box<dyn TunnelServer>, ServerError> {
        if self.fail {
            return Err(ServerError::Io(io::Error::new(
                io::ErrorKind::AddrInUse,
                "injected bind failure",
            )));
        }
        self.trace.push("server build");
        Ok(Box::new(ScriptedServer {
            trace: self.trace.clone(),
            fail_close: self.fail_close,
        }))
    }
}

fn scripted_controller(
    trace: &Trace,
    fail_issuance_on: Option<CertRole>,
    fail_server: bool,
) -> (LifecycleController, oneshot::Sender<&'static str>) {
    let (tx, rx) = oneshot::channel();
    let controller = LifecycleController::new(
        RunConfig::default(),
        Arc::new(ScriptedIssuer {
            trace: trace.clone(),
            fail_on: fail_issuance_on,
        }),
        Arc::new(ScriptedFactory {
            trace: trace.clone(),
            fail: fail_server,
            fail_close: false,
        }),
        rx,
    );
    (controller, tx)
}

#[tokio::test]
async fn clean_run_tears_down_in_order() {
    let trace = Trace::default();
    let (mut controller, tx) = scripted_controller(&trace, None, false);

    // A buffered signal unblocks the controller as soon as it starts serving.
    tx.send("SIGINT").unwrap();
    controller.execute().await.unwrap();

    assert_eq!(
        trace.events(),
        vec![
            "issue authority",
            "issue server",
            "issue client",
            "server build",
            "server run",
            "server close (workspace present: true)",
        ]
    );
    assert!(!trace.workspace().unwrap().exists());
    assert_eq!(controller.phase(), LifecyclePhase::Done);
}

#[tokio::test]
async fn signal_during_serving_stops_server_exactly_once() {
    let trace = Trace::default();
    let (mut controller, tx) = scripted_controller(&trace, None, false);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = tx.send("SIGTERM");
    });
    controller.execute().await.unwrap();

    let closes = trace
        .events()
        .iter()
        .filter(|event| event.starts_with("server close"))
        .count();
    assert_eq!(closes, 1);
    assert!(!trace.workspace().unwrap().exists());
}

#[tokio::test]
async fn authority_failure_skips_leaves_and_removes_workspace() {
    let trace = Trace::default();
    let (mut controller, _tx) = scripted_controller(&trace, Some(CertRole::Authority), false);

    let err = controller.execute().await.unwrap_err();

    assert!(matches!(
        err,
        SupervisorError::Issuance {
            role: CertRole::Authority,
            ..
        }
    ));
    // No leaf issuance, no server activity.
    assert_eq!(trace.events(), vec!["issue authority"]);
    assert!(!trace.workspace().unwrap().exists());
    assert_eq!(controller.phase(), LifecyclePhase::Done);
}

#[tokio::test]
async fn server_start_failure_still_removes_workspace() {
    let trace = Trace::default();
    let (mut controller, _tx) = scripted_controller(&trace, None, true);

    let err = controller.execute().await.unwrap_err();

    assert!(matches!(err, SupervisorError::ServerStart(_)));
    // The server never came up, so nothing may be stopped.
    assert!(!trace.events().iter().any(|e| e.starts_with("server close")));
    assert!(!trace.workspace().unwrap().exists());
    assert_eq!(controller.phase(), LifecyclePhase::Done);
}

#[tokio::test]
async fn malformed_network_fails_before_the_factory_runs() {
    let trace = Trace::default();
    let (tx, rx) = oneshot::channel::<&'static str>();
    drop(tx);

    let config = RunConfig {
        network: "not-a-cidr".to_string(),
        ..RunConfig::default()
    };
    let mut controller = LifecycleController::new(
        config,
        Arc::new(ScriptedIssuer {
            trace: trace.clone(),
            fail_on: None,
        }),
        Arc::new(ScriptedFactory {
            trace: trace.clone(),
            fail: false,
            fail_close: false,
        }),
        rx,
    );

    let err = controller.execute().await.unwrap_err();

    assert!(matches!(err, SupervisorError::ServerStart(_)));
    assert!(!trace.events().contains(&"server build".to_string()));
    assert!(!trace.workspace().unwrap().exists());
}

#[tokio::test]
async fn failed_server_stop_is_not_escalated_and_workspace_is_removed() {
    let trace = Trace::default();
    let (tx, rx) = oneshot::channel();

    let mut controller = LifecycleController::new(
        RunConfig::default(),
        Arc::new(ScriptedIssuer {
            trace: trace.clone(),
            fail_on: None,
        }),
        Arc::new(ScriptedFactory {
            trace: trace.clone(),
            fail: false,
            fail_close: true,
        }),
        rx,
    );

    tx.send("SIGINT").unwrap();
    // A dirty server stop during teardown must not become the run's result.
    controller.execute().await.unwrap();

    assert_eq!(
        trace
            .events()
            .iter()
            .filter(|event| event.starts_with("server close"))
            .count(),
        1
    );
    assert!(!trace.workspace().unwrap().exists());
    assert_eq!(controller.phase(), LifecyclePhase::Done);
}

#[tokio::test]
async fn end_to_end_with_real_collaborators() {
    let trace = Trace::default();
    let (tx, rx) = oneshot::channel();

    let config = RunConfig {
        listen_address: "127.0.0.1".to_string(),
        listen_port: 0,
        ..RunConfig::default()
    };
    let mut controller = LifecycleController::new(
        config,
        Arc::new(SpyIssuer {
            inner: RcgenIssuer::new(),
            trace: trace.clone(),
        }),
        Arc::new(QuicServerFactory),
        rx,
    );

    tx.send("SIGINT").unwrap();
    controller.execute().await.unwrap();

    assert!(!trace.workspace().unwrap().exists());
    assert_eq!(controller.phase(), LifecyclePhase::Done);
}
