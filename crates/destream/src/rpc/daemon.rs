use std::{
    net::TcpListener,
    path::{Path, PathBuf},
    process::Stdio,
};

use tokio::{
    process::Command,
    sync::{oneshot, watch},
};

use crate::error::{DestreamError, DestreamResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Running,
    Exited(Option<i32>),
}

/// A supervised `aria2c` process with its JSON-RPC interface enabled.
pub struct Aria2Daemon {
    port: u16,
    state: watch::Receiver<DaemonState>,
    kill: Option<oneshot::Sender<()>>,
}

impl Aria2Daemon {
    /// Finds the `aria2c` executable, either the given one or the one on `PATH`.
    pub fn locate(binary: Option<&Path>) -> DestreamResult<PathBuf> {
        match binary {
            Some(binary) => which::which(binary),
            None => which::which("aria2c"),
        }
        .map_err(DestreamError::MissingDaemon)
    }

    /// Asks the OS for a port nobody is listening on.
    pub fn free_port() -> DestreamResult<u16> {
        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        Ok(listener.local_addr()?.port())
    }

    pub fn spawn(binary: &Path, port: u16, extra_args: &[String]) -> DestreamResult<Self> {
        let mut child = Command::new(binary)
            .arg("--enable-rpc")
            .arg(format!("--rpc-listen-port={port}"))
            .arg("--allow-overwrite=true")
            .arg("--auto-file-renaming=false")
            .arg("--console-log-level=warn")
            .args(extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        tracing::debug!("Spawned aria2c (pid {:?}) on port {port}", child.id());

        let (state_tx, state) = watch::channel(DaemonState::Running);
        let (kill, kill_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        tracing::warn!("Failed to kill aria2c: {e}");
                    }
                    child.wait().await
                }
            };

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::error!("Failed to wait for aria2c: {e}");
                    None
                }
            };
            tracing::debug!("aria2c exited with code {code:?}");
            let _ = state_tx.send(DaemonState::Exited(code));
        });

        Ok(Self {
            port,
            state,
            kill: Some(kill),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn endpoint(&self) -> String {
        format!("ws://127.0.0.1:{}/jsonrpc", self.port)
    }

    /// Receiver notified once the process exits.
    pub fn exit_watch(&self) -> watch::Receiver<DaemonState> {
        self.state.clone()
    }

    pub fn state(&self) -> DaemonState {
        *self.state.borrow()
    }

    /// Terminates the process and waits for it to exit.
    pub async fn kill(mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        let _ = self
            .state
            .wait_for(|state| matches!(state, DaemonState::Exited(_)))
            .await;
    }
}
