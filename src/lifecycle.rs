//! Lifecycle orchestration: workspace → credentials → server → signal wait
//! → ordered teardown.
//!
//! The controller drives every other component exactly once per process
//! invocation. Compensating cleanup runs in reverse acquisition order on
//! every exit path, and the controller always reaches `Done`.

use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::config::RunConfig;
use crate::error::SupervisorResult;
use crate::pki::{self, CertificateIssuer, CredentialSet};
use crate::server::{ServerSupervisor, TunnelServerFactory};
use crate::workspace::CredentialWorkspace;

/// Phases of one supervisor run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Init,
    WorkspaceReady,
    CredentialsReady,
    Serving,
    ShuttingDown,
    Done,
}

/// Drives the one-shot bootstrap/serve/teardown sequence.
///
/// All collaborators are passed in at construction; the controller holds the
/// only compensating cleanup logic in the system.
pub struct LifecycleController {
    config: RunConfig,
    issuer: Arc<dyn CertificateIssuer>,
    supervisor: ServerSupervisor,
    shutdown: oneshot::Receiver<&'static str>,
    phase: LifecyclePhase,
}

impl LifecycleController {
    pub fn new(
        config: RunConfig,
        issuer: Arc<dyn CertificateIssuer>,
        factory: Arc<dyn TunnelServerFactory>,
        shutdown: oneshot::Receiver<&'static str>,
    ) -> Self {
        LifecycleController {
            config,
            issuer,
            supervisor: ServerSupervisor::new(factory),
            shutdown,
            phase: LifecyclePhase::Init,
        }
    }

    /// Current phase of the run.
    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    /// Run the full sequence.
    ///
    /// Returns the first fatal error from the forward path (workspace,
    /// issuance, server start); teardown failures are logged, never
    /// escalated. A clean signal-driven shutdown returns `Ok(())`.
    pub async fn execute(&mut self) -> SupervisorResult<()> {
        // Workspace acquisition failure leaves nothing to compensate.
        let workspace = match CredentialWorkspace::acquire() {
            Ok(workspace) => workspace,
            Err(e) => {
                self.phase = LifecyclePhase::Done;
                return Err(e);
            }
        };
        self.phase = LifecyclePhase::WorkspaceReady;

        let credentials = CredentialSet::in_workspace(workspace.path());
        if let Err(e) = pki::bootstrap(self.issuer.as_ref(), &credentials) {
            self.teardown(&workspace).await;
            return Err(e);
        }
        self.phase = LifecyclePhase::CredentialsReady;

        if let Err(e) = self.supervisor.start(&self.config, &credentials).await {
            self.teardown(&workspace).await;
            return Err(e);
        }
        self.phase = LifecyclePhase::Serving;

        // Block until the signal listener hands off. A dropped sender is
        // treated the same as a delivered signal.
        match (&mut self.shutdown).await {
            Ok(sig) => info!(signal = sig, "termination signal received"),
            Err(_) => warn!("shutdown channel closed without a signal"),
        }

        self.teardown(&workspace).await;
        Ok(())
    }

    /// Compensating cleanup in reverse acquisition order: stop the server
    /// (if live) before releasing the workspace. Each step's failure is
    /// logged and never prevents the next from running.
    async fn teardown(&mut self, workspace: &CredentialWorkspace) {
        self.phase = LifecyclePhase::ShuttingDown;

        if self.supervisor.is_live() {
            match self.supervisor.stop().await {
                Ok(()) => info!("tunnel server stopped"),
                Err(e) => error!(error = %e, "tunnel server did not stop cleanly"),
            }
        }

        if let Err(e) = workspace.release() {
            warn!(error = %e, "credential workspace cleanup left residue");
        }

        self.phase = LifecyclePhase::Done;
    }
}

/// Spawn the background task that waits for SIGINT/SIGTERM and performs the
/// one-shot handoff to the controller's wait point.
pub fn spawn_signal_listener() -> std::io::Result<oneshot::Receiver<&'static str>> {
    let (tx, rx) = oneshot::channel();
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        let _ = tx.send(name);
    });

    Ok(rx)
}
