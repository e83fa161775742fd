use std::{sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::{
    sync::{mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
    time::{sleep_until, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ChannelConfig;
use crate::subscriptions::{Registry, TopicRequest};
use crate::synchronizer::{CacheSynchronizer, SyncOutcome};
use crate::transport::{Connector, FrameSink, FrameStream};
use crate::types::{ClientFrame, ServerFrame};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("authentication rejected: {0}")]
    Authentication(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("not connected")]
    NotConnected,
    #[error("malformed frame: {0}")]
    Frame(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub attempt: u32,
    pub last_error: Option<String>,
}

impl ConnectionStatus {
    fn disconnected() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempt: 0,
            last_error: None,
        }
    }
}

enum Command {
    Send {
        frame: ClientFrame,
        ack: oneshot::Sender<Result<(), ChannelError>>,
    },
    RefreshToken(String),
}

struct Mailbox {
    commands: mpsc::UnboundedReceiver<Command>,
    topics: mpsc::UnboundedReceiver<TopicRequest>,
}

impl Mailbox {
    fn drain(&mut self, sync: &CacheSynchronizer) {
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Send { ack, .. } = command {
                let _ = ack.send(Err(ChannelError::NotConnected));
            }
        }
        self.discard_topics(sync);
    }

    fn discard_topics(&mut self, sync: &CacheSynchronizer) {
        while let Ok(request) = self.topics.try_recv() {
            forget_unsubscribed(sync, &request);
        }
    }
}

fn forget_unsubscribed(sync: &CacheSynchronizer, request: &TopicRequest) {
    if let TopicRequest::Unsubscribe(topic) = request {
        sync.forget(topic);
    }
}

struct Shared {
    config: ChannelConfig,
    connector: Arc<dyn Connector>,
    registry: Arc<Registry>,
    sync: Arc<CacheSynchronizer>,
    status: watch::Sender<ConnectionStatus>,
    mailbox: Mutex<Mailbox>,
}

impl Shared {
    fn publish(&self, state: ConnectionState, attempt: u32, last_error: Option<String>) {
        self.status.send_replace(ConnectionStatus {
            state,
            attempt,
            last_error,
        });
    }
}

struct Worker {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct ChannelClient {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    worker: Mutex<Option<Worker>>,
}

impl ChannelClient {
    pub fn new(
        config: ChannelConfig,
        connector: Arc<dyn Connector>,
        sync: Arc<CacheSynchronizer>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (topic_tx, topic_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionStatus::disconnected());

        let shared = Arc::new(Shared {
            config,
            connector,
            registry: Arc::new(Registry::new(topic_tx)),
            sync,
            status,
            mailbox: Mutex::new(Mailbox {
                commands: command_rx,
                topics: topic_rx,
            }),
        });

        Self {
            shared,
            commands,
            worker: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.shared.registry
    }

    pub fn synchronizer(&self) -> &Arc<CacheSynchronizer> {
        &self.shared.sync
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.borrow().clone()
    }

    pub fn status_changes(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    pub async fn connect(&self, token: impl Into<String>) -> Result<(), ChannelError> {
        self.disconnect().await;

        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(run_connection(
            self.shared.clone(),
            token.into(),
            cancel.clone(),
            ready_tx,
        ));
        *self.worker.lock().await = Some(Worker { cancel, task });

        ready_rx.await.unwrap_or(Err(ChannelError::NotConnected))
    }

    pub async fn disconnect(&self) {
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            worker.cancel.cancel();
            if let Err(e) = worker.task.await {
                error!(error = %e, "channel task panicked");
            }
            info!("channel disconnected");
        }
        self.shared.publish(ConnectionState::Disconnected, 0, None);
    }

    pub async fn refresh_token(&self, token: impl Into<String>) -> Result<(), ChannelError> {
        let running = matches!(
            self.worker.lock().await.as_ref(),
            Some(worker) if !worker.task.is_finished()
        );
        if !running {
            return Err(ChannelError::NotConnected);
        }
        self.commands
            .send(Command::RefreshToken(token.into()))
            .map_err(|_| ChannelError::NotConnected)
    }

    /// Sends an outbound frame. Only valid while authenticated; nothing is queued.
    pub async fn send(&self, frame: ClientFrame) -> Result<(), ChannelError> {
        if self.status().state != ConnectionState::Authenticated {
            return Err(ChannelError::NotConnected);
        }

        let (ack, ack_rx) = oneshot::channel();
        self.commands
            .send(Command::Send { frame, ack })
            .map_err(|_| ChannelError::NotConnected)?;
        ack_rx.await.unwrap_or(Err(ChannelError::NotConnected))
    }
}

impl Drop for ChannelClient {
    fn drop(&mut self) {
        if let Ok(mut worker) = self.worker.try_lock() {
            if let Some(worker) = worker.take() {
                worker.cancel.cancel();
            }
        }
    }
}

enum Exit {
    Shutdown,
    TokenRefreshed(String),
    Revoked(String),
    Lost(ChannelError),
}

enum Wake {
    Elapsed,
    Shutdown,
    TokenRefreshed(String),
}

async fn run_connection(
    shared: Arc<Shared>,
    mut token: String,
    cancel: CancellationToken,
    ready: oneshot::Sender<Result<(), ChannelError>>,
) {
    let mut mailbox = shared.mailbox.lock().await;
    mailbox.drain(&shared.sync);

    let mut ready = Some(ready);
    let mut attempt: u32 = 0;
    let mut last_error: Option<String> = None;

    loop {
        let established = tokio::select! {
            _ = cancel.cancelled() => break,
            res = establish(&shared, &token, attempt, &last_error) => res,
        };

        match established {
            Ok((sink, stream)) => {
                attempt = 0;
                last_error = None;
                shared.publish(ConnectionState::Authenticated, 0, None);
                info!("channel authenticated");
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(()));
                }

                match pump(&shared, &mut mailbox, sink, stream, &cancel).await {
                    Exit::Shutdown => break,
                    Exit::TokenRefreshed(fresh) => {
                        info!("token refreshed, reconnecting");
                        token = fresh;
                        continue;
                    }
                    Exit::Revoked(reason) => {
                        error!(%reason, "credential revoked by server");
                        shared.publish(
                            ConnectionState::Failed,
                            0,
                            Some(ChannelError::Authentication(reason).to_string()),
                        );
                        mailbox.drain(&shared.sync);
                        return;
                    }
                    Exit::Lost(e) => {
                        warn!(error = %e, "channel lost");
                        last_error = Some(e.to_string());
                    }
                }
            }
            Err(e @ ChannelError::Authentication(_)) => {
                error!(error = %e, "handshake rejected");
                shared.publish(ConnectionState::Failed, attempt, Some(e.to_string()));
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(e));
                }
                mailbox.drain(&shared.sync);
                return;
            }
            Err(e) => {
                if let Some(ready) = ready.take() {
                    warn!(error = %e, "initial connect failed");
                    shared.publish(ConnectionState::Disconnected, 0, Some(e.to_string()));
                    let _ = ready.send(Err(e));
                    mailbox.drain(&shared.sync);
                    return;
                }
                warn!(attempt, error = %e, "reconnect attempt failed");
                last_error = Some(e.to_string());
            }
        }

        attempt += 1;
        if shared.config.retry.exhausted(attempt) {
            error!(attempts = attempt - 1, "giving up on channel");
            shared.publish(ConnectionState::Failed, attempt - 1, last_error);
            mailbox.drain(&shared.sync);
            return;
        }

        let delay = shared.config.retry.delay_for_attempt(attempt);
        shared.publish(ConnectionState::Reconnecting, attempt, last_error.clone());
        info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");

        match wait_backoff(&shared.sync, &mut mailbox, delay, &cancel).await {
            Wake::Elapsed => {}
            Wake::Shutdown => break,
            Wake::TokenRefreshed(fresh) => token = fresh,
        }
    }

    shared.publish(ConnectionState::Disconnected, 0, None);
    mailbox.drain(&shared.sync);
}

async fn establish(
    shared: &Shared,
    token: &str,
    attempt: u32,
    last_error: &Option<String>,
) -> Result<(FrameSink, FrameStream), ChannelError> {
    let limit = shared.config.handshake_timeout;
    tokio::time::timeout(limit, handshake(shared, token, attempt, last_error))
        .await
        .unwrap_or(Err(ChannelError::HandshakeTimeout(limit)))
}

async fn handshake(
    shared: &Shared,
    token: &str,
    attempt: u32,
    last_error: &Option<String>,
) -> Result<(FrameSink, FrameStream), ChannelError> {
    shared.publish(ConnectionState::Connecting, attempt, last_error.clone());
    let (mut sink, mut stream) = shared.connector.open().await?;
    shared.publish(ConnectionState::Connected, attempt, last_error.clone());

    sink.send(ClientFrame::Auth {
        token: token.to_string(),
    })
    .await?;
    shared.publish(ConnectionState::Authenticating, attempt, last_error.clone());

    loop {
        match stream.next().await {
            Some(Ok(ServerFrame::AuthOk { user_id })) => {
                debug!(?user_id, "auth acknowledged");
                return Ok((sink, stream));
            }
            Some(Ok(ServerFrame::AuthRejected { reason })) => {
                return Err(ChannelError::Authentication(reason));
            }
            Some(Ok(frame)) => debug!(?frame, "ignoring frame before auth ack"),
            Some(Err(ChannelError::Frame(e))) => warn!(error = %e, "malformed frame during handshake"),
            Some(Err(e)) => return Err(e),
            None => {
                return Err(ChannelError::Connection(
                    "closed during handshake".into(),
                ))
            }
        }
    }
}

async fn pump(
    shared: &Shared,
    mailbox: &mut Mailbox,
    mut sink: FrameSink,
    mut stream: FrameStream,
    cancel: &CancellationToken,
) -> Exit {
    mailbox.discard_topics(&shared.sync);
    for topic in shared.registry.active_topics() {
        debug!(%topic, "resubscribing");
        if let Err(e) = sink.send(ClientFrame::Subscribe { topic }).await {
            return Exit::Lost(e);
        }
    }

    let period = shared.config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut nonce: u64 = 0;
    let mut pong_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = sink.close().await;
                return Exit::Shutdown;
            }
            Some(request) = mailbox.topics.recv() => {
                forget_unsubscribed(&shared.sync, &request);
                let frame = match request {
                    TopicRequest::Subscribe(topic) => ClientFrame::Subscribe { topic },
                    TopicRequest::Unsubscribe(topic) => ClientFrame::Unsubscribe { topic },
                };
                if let Err(e) = sink.send(frame).await {
                    return Exit::Lost(e);
                }
            }
            command = mailbox.commands.recv() => match command {
                None => return Exit::Shutdown,
                Some(Command::Send { frame, ack }) => {
                    if let Err(e) = sink.send(frame).await {
                        let _ = ack.send(Err(ChannelError::Connection(e.to_string())));
                        return Exit::Lost(e);
                    }
                    let _ = ack.send(Ok(()));
                }
                Some(Command::RefreshToken(token)) => {
                    let _ = sink.close().await;
                    return Exit::TokenRefreshed(token);
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(frame)) => {
                    if let Some(exit) = handle_frame(shared, frame, &mut pong_deadline).await {
                        return exit;
                    }
                }
                Some(Err(ChannelError::Frame(e))) => warn!(error = %e, "dropping malformed frame"),
                Some(Err(e)) => return Exit::Lost(e),
                None => return Exit::Lost(ChannelError::Connection("stream ended".into())),
            },
            _ = heartbeat.tick() => {
                nonce += 1;
                if let Err(e) = sink.send(ClientFrame::Ping { nonce }).await {
                    return Exit::Lost(e);
                }
                if pong_deadline.is_none() {
                    pong_deadline = Some(Instant::now() + shared.config.pong_timeout);
                }
            }
            _ = sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
                return Exit::Lost(ChannelError::Connection("heartbeat timed out".into()));
            }
        }
    }
}

async fn handle_frame(
    shared: &Shared,
    frame: ServerFrame,
    pong_deadline: &mut Option<Instant>,
) -> Option<Exit> {
    match frame {
        ServerFrame::Event(envelope) => {
            let outcome = shared.sync.apply(&envelope).await;
            if outcome == SyncOutcome::Duplicate {
                debug!(topic = %envelope.topic, seq = envelope.seq, "duplicate event");
            } else {
                shared.registry.dispatch(&envelope);
            }
        }
        ServerFrame::Pong { .. } => *pong_deadline = None,
        ServerFrame::Subscribed { topic } => debug!(%topic, "subscription confirmed"),
        ServerFrame::SubscriptionRejected { topic, reason } => {
            warn!(%topic, %reason, "subscription rejected");
            shared.registry.reject(&topic, &reason);
        }
        ServerFrame::AuthRejected { reason } => return Some(Exit::Revoked(reason)),
        ServerFrame::AuthOk { .. } => debug!("late auth ack"),
        ServerFrame::Error { message } => warn!(%message, "server error"),
    }
    None
}

async fn wait_backoff(
    sync: &CacheSynchronizer,
    mailbox: &mut Mailbox,
    delay: Duration,
    cancel: &CancellationToken,
) -> Wake {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Wake::Shutdown,
            _ = &mut sleep => return Wake::Elapsed,
            Some(request) = mailbox.topics.recv() => forget_unsubscribed(sync, &request),
            command = mailbox.commands.recv() => match command {
                None => return Wake::Shutdown,
                Some(Command::Send { ack, .. }) => {
                    let _ = ack.send(Err(ChannelError::NotConnected));
                }
                Some(Command::RefreshToken(token)) => return Wake::TokenRefreshed(token),
            },
        }
    }
}
