use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, watch},
    time::Instant,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::{
    daemon::DaemonState,
    dispatch::{Action, Dispatcher, DownloadReport},
    message::{DaemonEvent, RpcRequest},
    SegmentDownloader,
};
use crate::error::{DestreamError, DestreamResult};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct OrchestratorBuilder {
    endpoint: String,
    max_attempts: u32,
    backoff: Duration,
    connect_budget: Option<Duration>,
    attempt_timeout: Duration,
    max_retries: u32,
    retry_budget: Option<usize>,
    shutdown_timeout: Duration,
    daemon_exit: Option<watch::Receiver<DaemonState>>,
}

impl OrchestratorBuilder {
    pub fn new<S>(endpoint: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            endpoint: endpoint.into(),
            max_attempts: 10,
            backoff: Duration::from_secs(1),
            connect_budget: None,
            attempt_timeout: Duration::from_secs(5),
            max_retries: 1,
            retry_budget: None,
            shutdown_timeout: Duration::from_secs(10),
            daemon_exit: None,
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Base delay between connection attempts. The n-th retry waits `n * backoff`.
    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Overall time allowed for connecting, on top of the attempt limit.
    pub fn connect_budget(mut self, budget: Duration) -> Self {
        self.connect_budget = Some(budget);
        self
    }

    /// Upper bound for a single connection attempt, handshake included.
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn retry_budget(mut self, budget: usize) -> Self {
        self.retry_budget = Some(budget);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Watches the daemon process so that a crash fails the running download.
    pub fn supervise(mut self, daemon_exit: watch::Receiver<DaemonState>) -> Self {
        self.daemon_exit = Some(daemon_exit);
        self
    }

    /// The error to give up with when the supervised daemon is already gone.
    fn daemon_gone(&self, attempts: u32) -> Option<DestreamError> {
        match *self.daemon_exit.as_ref()?.borrow() {
            DaemonState::Exited(Some(0)) => Some(DestreamError::NoConnect { attempts }),
            DaemonState::Exited(code) => Some(DestreamError::DaemonCrashed { code }),
            DaemonState::Running => None,
        }
    }

    pub async fn connect(self) -> DestreamResult<Orchestrator> {
        let deadline = self.connect_budget.map(|budget| Instant::now() + budget);

        let mut attempt = 0;
        let socket = loop {
            if let Some(error) = self.daemon_gone(attempt) {
                return Err(error);
            }
            attempt += 1;

            let limit = match deadline {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .min(self.attempt_timeout),
                None => self.attempt_timeout,
            };
            let handshake = connect_async(self.endpoint.as_str());
            let error = match tokio::time::timeout(limit, handshake).await {
                Ok(Ok((socket, _))) => break socket,
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("no handshake within {limit:?}"),
            };
            tracing::debug!(
                "Connection attempt {attempt} to {} failed: {error}",
                self.endpoint
            );

            let delay = self.backoff * attempt;
            let out_of_time = deadline.is_some_and(|d| Instant::now() + delay >= d);
            if attempt >= self.max_attempts || out_of_time {
                return Err(self
                    .daemon_gone(attempt)
                    .unwrap_or(DestreamError::NoConnect { attempts: attempt }));
            }
            tokio::time::sleep(delay).await;
        };
        tracing::info!("Connected to aria2c at {}", self.endpoint);

        let (commands, receiver) = mpsc::channel(8);
        let event_loop = EventLoop {
            socket,
            connected: true,
            dispatcher: Dispatcher::new(self.max_retries, self.retry_budget),
            pending: None,
            shutdown: None,
            daemon_exit: self.daemon_exit.clone(),
            finished: false,
        };
        tokio::spawn(event_loop.run(receiver));

        Ok(Orchestrator {
            commands,
            shutdown_timeout: self.shutdown_timeout,
            daemon_exit: self.daemon_exit,
        })
    }
}

enum Command {
    Configure(HashMap<String, String>),
    Download {
        urls: Vec<String>,
        output_dir: PathBuf,
        reply: oneshot::Sender<DestreamResult<DownloadReport>>,
    },
    Shutdown(oneshot::Sender<DestreamResult<()>>),
    Close,
}

/// Client side of the aria2 control channel.
///
/// All daemon messages are handled by one background task, so job state is
/// never touched concurrently. Dropping the orchestrator closes the channel.
pub struct Orchestrator {
    commands: mpsc::Sender<Command>,
    shutdown_timeout: Duration,
    daemon_exit: Option<watch::Receiver<DaemonState>>,
}

impl Orchestrator {
    pub fn builder<S>(endpoint: S) -> OrchestratorBuilder
    where
        S: Into<String>,
    {
        OrchestratorBuilder::new(endpoint)
    }

    fn closed_error(&self) -> DestreamError {
        match self.daemon_exit.as_ref().map(|state| *state.borrow()) {
            Some(DaemonState::Exited(code)) if code != Some(0) => {
                DestreamError::DaemonCrashed { code }
            }
            _ => DestreamError::ChannelClosed,
        }
    }

    async fn send(&self, command: Command) -> DestreamResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| self.closed_error())
    }

    /// Sends global options to the daemon. Failures are only logged.
    pub async fn configure(&self, options: HashMap<String, String>) {
        if options.is_empty() {
            return;
        }
        if let Err(e) = self.send(Command::Configure(options)).await {
            tracing::warn!("Failed to configure aria2c: {e}");
        }
    }

    /// Asks the daemon to shut down and waits for it to exit.
    ///
    /// On [`DestreamError::ShutdownTimeout`] the caller has to kill the process.
    pub async fn shutdown(self) -> DestreamResult<()> {
        let (reply, receiver) = oneshot::channel();
        self.send(Command::Shutdown(reply)).await?;
        match tokio::time::timeout(self.shutdown_timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => Err(DestreamError::ShutdownTimeout),
        }
    }
}

impl SegmentDownloader for Orchestrator {
    async fn download_all(
        &mut self,
        urls: Vec<String>,
        output_dir: &Path,
    ) -> DestreamResult<DownloadReport> {
        if urls.is_empty() {
            return Ok(DownloadReport::default());
        }
        tokio::fs::create_dir_all(output_dir).await?;
        let output_dir = tokio::fs::canonicalize(output_dir).await?;

        let (reply, receiver) = oneshot::channel();
        self.send(Command::Download {
            urls,
            output_dir,
            reply,
        })
        .await?;
        receiver.await.map_err(|_| self.closed_error())?
    }

    async fn abort(&mut self) {
        let _ = self.commands.send(Command::Close).await;
    }
}

struct EventLoop {
    socket: Socket,
    connected: bool,
    dispatcher: Dispatcher,
    pending: Option<oneshot::Sender<DestreamResult<DownloadReport>>>,
    shutdown: Option<oneshot::Sender<DestreamResult<()>>>,
    daemon_exit: Option<watch::Receiver<DaemonState>>,
    finished: bool,
}

async fn daemon_exited(daemon_exit: &mut Option<watch::Receiver<DaemonState>>) -> Option<i32> {
    let Some(state) = daemon_exit else {
        return std::future::pending().await;
    };
    let state = state
        .wait_for(|state| matches!(state, DaemonState::Exited(_)))
        .await
        .map(|state| *state);
    match state {
        Ok(DaemonState::Exited(code)) => code,
        Ok(DaemonState::Running) => None,
        // supervisor gone, nothing left to watch
        Err(_) => std::future::pending().await,
    }
}

impl EventLoop {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        while !self.finished {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => self.finished = true,
                },
                message = self.socket.next(), if self.connected => match message {
                    Some(Ok(Message::Text(text))) => self.on_message(&text).await,
                    Some(Ok(Message::Close(_))) | None => self.on_disconnect(None),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => self.on_disconnect(Some(e.into())),
                },
                code = daemon_exited(&mut self.daemon_exit) => self.on_daemon_exit(code),
            }
        }

        if self.connected {
            let _ = self.socket.close(None).await;
        }
    }

    async fn send(&mut self, request: RpcRequest) -> DestreamResult<()> {
        if !self.connected {
            return Err(DestreamError::ChannelClosed);
        }
        tracing::trace!("Sending {} ({})", request.method(), request.id());
        if let Err(e) = self.socket.send(Message::Text(request.to_json())).await {
            self.on_disconnect(Some(e.into()));
            return Err(DestreamError::ChannelClosed);
        }
        Ok(())
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Configure(options) => {
                if let Err(e) = self.send(RpcRequest::change_global_option(&options)).await {
                    tracing::warn!("Failed to configure aria2c: {e}");
                    return;
                }
                let _ = self.send(RpcRequest::global_option()).await;
            }
            Command::Download {
                urls,
                output_dir,
                reply,
            } => {
                if self.dispatcher.is_busy() {
                    tracing::warn!("Starting a new batch before the previous one drained");
                }
                let request = self.dispatcher.start_batch(&urls, &output_dir);
                match self.send(request).await {
                    Ok(()) => self.pending = Some(reply),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::Shutdown(reply) => match self.send(RpcRequest::shutdown()).await {
                Ok(()) => self.shutdown = Some(reply),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Close => {
                self.dispatcher.cancel();
                if let Some(pending) = self.pending.take() {
                    let _ = pending.send(Err(DestreamError::Interrupted));
                }
                self.finished = true;
            }
        }
    }

    async fn on_message(&mut self, text: &str) {
        let event = DaemonEvent::parse(text);
        if matches!(event, DaemonEvent::ShutdownAck) {
            tracing::info!("aria2c is shutting down");
            // without a process to watch the ack is all we get
            if self.daemon_exit.is_none() {
                if let Some(reply) = self.shutdown.take() {
                    let _ = reply.send(Ok(()));
                }
                self.finished = true;
            }
            return;
        }

        for action in self.dispatcher.handle(event) {
            match action {
                Action::Send(request) => {
                    if let Err(e) = self.send(request).await {
                        tracing::error!("Failed to send request to aria2c: {e}");
                    }
                }
                Action::Resolve(report) => match self.pending.take() {
                    Some(pending) => {
                        let _ = pending.send(Ok(report));
                    }
                    None => tracing::debug!("Batch drained without a waiting caller"),
                },
            }
        }
    }

    /// A lost connection is not recovered. The running download stays pending
    /// until the daemon exits or the caller gives up.
    fn on_disconnect(&mut self, error: Option<DestreamError>) {
        self.connected = false;
        if self.shutdown.is_some() {
            if self.daemon_exit.is_none() {
                if let Some(reply) = self.shutdown.take() {
                    let _ = reply.send(Ok(()));
                }
                self.finished = true;
            }
            return;
        }

        match error {
            Some(e) => tracing::error!("Lost connection to aria2c: {e}"),
            None => tracing::error!("aria2c closed the connection"),
        }
    }

    fn on_daemon_exit(&mut self, code: Option<i32>) {
        self.finished = true;
        if let Some(reply) = self.shutdown.take() {
            let _ = reply.send(Ok(()));
            return;
        }

        let error = match code {
            Some(0) => DestreamError::ChannelClosed,
            code => DestreamError::DaemonCrashed { code },
        };
        tracing::error!("{error}");
        if let Some(pending) = self.pending.take() {
            let _ = pending.send(Err(error));
        }
    }
}
