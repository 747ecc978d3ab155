//! Connection manager for the veadotube control socket.
//!
//! A [`VeadotubeConnection`] owns one live socket at a time and two workers:
//! the read loop, which keeps the state map current and reconnects when the
//! socket drops, and the dispatcher, which drains the event queue one event
//! at a time. Nothing here is global; the owner constructs the connection
//! and hands out references.

mod dispatch;

use crate::model::StateEvent;
use crate::protocol::{self, Request, WireMessage};
use crate::state_map::{StateMap, StateMapCell, StateMapSnapshot};
use crate::transport::{Connector, FrameReader, FrameWriter, Socket, WebSocketConnector};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

const DEFAULT_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConnectionError {
    #[error("failed to connect to {uri} after {attempts} attempt(s): {reason}")]
    Connect {
        uri: String,
        attempts: u32,
        reason: String,
    },
    #[error("lost connection to veadotube and reconnection is disabled")]
    Disconnected,
    #[error("socket is not connected")]
    NotConnected,
    #[error("send failed: {0}")]
    Send(String),
    #[error("event queue is closed")]
    QueueClosed,
    #[error("connection is already open")]
    AlreadyOpen,
    #[error("connection has been closed")]
    Closed,
    #[error("invalid duration {duration} for state {state}")]
    InvalidDuration { state: String, duration: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closing,
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub uri: String,
    pub default_duration: Duration,
    pub reconnect: bool,
    /// 0 means unlimited.
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl ConnectionSettings {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            default_duration: DEFAULT_DURATION,
            reconnect: true,
            reconnect_attempts: 0,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    fn max_attempts(&self) -> u32 {
        if self.reconnect {
            self.reconnect_attempts
        } else {
            1
        }
    }
}

struct AttemptLimit(u32);

impl fmt::Display for AttemptLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0 => write!(f, "unlimited"),
            n => write!(f, "{n}"),
        }
    }
}

#[derive(Debug)]
struct QueuedEvent {
    job: Uuid,
    event: StateEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Opening,
    Open,
    Closed,
}

enum ReadOutcome {
    Shutdown,
    Lost,
}

/// State shared by the owner handle and both workers.
struct Shared {
    settings: ConnectionSettings,
    connector: Arc<dyn Connector>,
    writer: tokio::sync::Mutex<Option<Box<dyn FrameWriter>>>,
    /// Raised when a write fails so the read loop drops the socket.
    write_failed: Notify,
    state_map: StateMapCell,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    failure: watch::Sender<Option<ConnectionError>>,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = ?previous, to = ?next, "connection state changed");
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn shutdown_requested(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }

    /// Returns false if shutdown interrupted the sleep.
    async fn sleep_unless_shutdown(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.shutdown_requested() => false,
        }
    }

    async fn connect_with_retry(&self, waiting: ConnectionState) -> Result<Socket, ConnectionError> {
        let uri = self.settings.uri.as_str();
        let max = self.settings.max_attempts();
        let mut attempt = 0u32;
        loop {
            if self.is_shutting_down() {
                return Err(ConnectionError::Closed);
            }
            attempt += 1;
            self.set_state(ConnectionState::Connecting);
            let result = tokio::select! {
                result = self.connector.connect(uri) => result,
                _ = self.shutdown_requested() => return Err(ConnectionError::Closed),
            };
            match result {
                Ok(socket) => {
                    tracing::info!(uri, attempt, "opened veadotube websocket");
                    return Ok(socket);
                }
                Err(err) if max != 0 && attempt >= max => {
                    tracing::error!(uri, attempt, error = %err, "giving up on veadotube websocket");
                    return Err(ConnectionError::Connect {
                        uri: uri.to_string(),
                        attempts: attempt,
                        reason: err.to_string(),
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        uri,
                        attempt,
                        max_attempts = %AttemptLimit(max),
                        retry_in = ?self.settings.reconnect_delay,
                        error = %err,
                        "failed to connect to veadotube websocket"
                    );
                    self.set_state(waiting);
                    if !self.sleep_unless_shutdown(self.settings.reconnect_delay).await {
                        return Err(ConnectionError::Closed);
                    }
                }
            }
        }
    }

    /// Installs a fresh writer and asks for the state list on it.
    async fn install_writer(&self, mut writer: Box<dyn FrameWriter>) {
        if let Err(err) = writer.send_text(&Request::List.encode()).await {
            // The read loop notices the dead socket and reconnects.
            tracing::warn!(error = %err, "failed to request state list");
        }
        *self.writer.lock().await = Some(writer);
        self.set_state(ConnectionState::Connected);
    }

    async fn send(&self, request: &Request) -> Result<(), ConnectionError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ConnectionError::NotConnected)?;
        match writer.send_text(&request.encode()).await {
            Ok(()) => {
                tracing::debug!(op = request.op(), state = ?request.state_id(), "sent request");
                Ok(())
            }
            Err(err) => {
                guard.take();
                self.write_failed.notify_one();
                Err(ConnectionError::Send(err.to_string()))
            }
        }
    }

    fn handle_frame(&self, raw: &str) {
        match protocol::decode(raw) {
            Ok(WireMessage::List(entries)) => {
                self.state_map.rebuild(&entries);
            }
            // veadotube acks every request with a peek
            Ok(WireMessage::Peek) => {}
            Ok(WireMessage::Unknown(message)) => {
                tracing::warn!(%message, "unknown message from veadotube");
            }
            Err(err) => {
                tracing::warn!(error = %err, frame = %raw.trim_end(), "dropping malformed frame");
            }
        }
    }

    async fn pump(&self, reader: &mut Box<dyn FrameReader>) -> ReadOutcome {
        loop {
            let frame = tokio::select! {
                frame = reader.recv() => frame,
                _ = self.write_failed.notified() => {
                    // a permit left over from the previous socket
                    if self.writer.lock().await.is_some() {
                        continue;
                    }
                    tracing::warn!("write to veadotube websocket failed, dropping socket");
                    return ReadOutcome::Lost;
                }
                _ = self.shutdown_requested() => return ReadOutcome::Shutdown,
            };
            match frame {
                Some(Ok(raw)) => self.handle_frame(&raw),
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "failed to read from veadotube websocket");
                    return ReadOutcome::Lost;
                }
                None => {
                    tracing::warn!("veadotube websocket closed");
                    return ReadOutcome::Lost;
                }
            }
        }
    }

    fn fail(&self, err: ConnectionError) {
        tracing::error!(error = %err, "veadotube connection failed permanently");
        self.set_state(ConnectionState::Disconnected);
        self.failure.send_replace(Some(err));
        self.shutdown.send_replace(true);
    }
}

async fn read_loop(shared: Arc<Shared>, mut reader: Box<dyn FrameReader>) {
    loop {
        if let ReadOutcome::Shutdown = shared.pump(&mut reader).await {
            return;
        }
        if shared.is_shutting_down() {
            return;
        }
        shared.writer.lock().await.take();

        if !shared.settings.reconnect {
            shared.fail(ConnectionError::Disconnected);
            return;
        }
        shared.set_state(ConnectionState::Reconnecting);
        match shared.connect_with_retry(ConnectionState::Reconnecting).await {
            Ok((writer, next_reader)) => {
                shared.install_writer(writer).await;
                reader = next_reader;
            }
            Err(ConnectionError::Closed) => return,
            Err(err) => {
                shared.fail(err);
                return;
            }
        }
    }
}

pub struct VeadotubeConnection {
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
    queue_tx: Mutex<Option<mpsc::UnboundedSender<QueuedEvent>>>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<QueuedEvent>>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl VeadotubeConnection {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self::with_connector(settings, Arc::new(WebSocketConnector))
    }

    pub fn with_connector(settings: ConnectionSettings, connector: Arc<dyn Connector>) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        let (failure, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                settings,
                connector,
                writer: tokio::sync::Mutex::new(None),
                write_failed: Notify::new(),
                state_map: StateMapCell::new(),
                state,
                shutdown,
                failure,
            }),
            lifecycle: Mutex::new(Lifecycle::Idle),
            queue_tx: Mutex::new(Some(queue_tx)),
            queue_rx: Mutex::new(Some(queue_rx)),
            workers: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.shared.settings
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn state_map(&self) -> StateMapSnapshot {
        self.shared.state_map.current()
    }

    /// Connects (retrying per the reconnect policy), requests the state
    /// list and starts the read loop and the dispatcher.
    pub async fn open(&self) -> Result<(), ConnectionError> {
        {
            let mut lifecycle = lock(&self.lifecycle);
            match *lifecycle {
                Lifecycle::Idle => *lifecycle = Lifecycle::Opening,
                Lifecycle::Opening | Lifecycle::Open => return Err(ConnectionError::AlreadyOpen),
                Lifecycle::Closed => return Err(ConnectionError::Closed),
            }
        }

        let (writer, reader) = match self
            .shared
            .connect_with_retry(ConnectionState::Connecting)
            .await
        {
            Ok(socket) => socket,
            Err(err) => {
                let mut lifecycle = lock(&self.lifecycle);
                if *lifecycle == Lifecycle::Opening {
                    *lifecycle = Lifecycle::Idle;
                    self.shared.set_state(ConnectionState::Disconnected);
                }
                return Err(err);
            }
        };

        let mut workers = self.workers.lock().await;
        let queue = {
            let mut lifecycle = lock(&self.lifecycle);
            if *lifecycle != Lifecycle::Opening {
                None
            } else {
                *lifecycle = Lifecycle::Open;
                lock(&self.queue_rx).take()
            }
        };
        let Some(queue) = queue else {
            drop(workers);
            let mut writer = writer;
            if let Err(err) = writer.close().await {
                tracing::debug!(error = %err, "error while closing veadotube websocket");
            }
            return Err(ConnectionError::Closed);
        };

        self.shared.install_writer(writer).await;
        workers.push(tokio::spawn(read_loop(self.shared.clone(), reader)));
        workers.push(tokio::spawn(dispatch::run(self.shared.clone(), queue)));
        Ok(())
    }

    /// Appends an event to the queue; does not wait for it to be dispatched.
    pub fn enqueue(&self, event: StateEvent) -> Result<(), ConnectionError> {
        if !event.has_valid_duration() {
            return Err(ConnectionError::InvalidDuration {
                state: event.state,
                duration: event.duration.unwrap_or_default(),
            });
        }
        let job = Uuid::new_v4();
        let queue = lock(&self.queue_tx);
        let tx = queue.as_ref().ok_or(ConnectionError::QueueClosed)?;
        let (state, duration, revert) = (event.state.clone(), event.duration, event.revert);
        tx.send(QueuedEvent { job, event })
            .map_err(|_| ConnectionError::QueueClosed)?;
        tracing::info!(job = %job, state = %state, ?duration, revert, "added event to queue");
        Ok(())
    }

    pub async fn send(&self, request: &Request) -> Result<(), ConnectionError> {
        self.shared.send(request).await
    }

    /// Waits for the first state list; `None` if the connection shuts down
    /// first.
    pub async fn state_map_ready(&self) -> Option<Arc<StateMap>> {
        dispatch::wait_for_state_map(&self.shared).await
    }

    /// Resolves once the connection has stopped: with the terminal error if
    /// it failed, or [`ConnectionError::Closed`] after `close()`.
    pub async fn terminated(&self) -> ConnectionError {
        let mut failures = self.shared.failure.subscribe();
        tokio::select! {
            _ = failures.wait_for(Option::is_some) => {}
            _ = self.shared.shutdown_requested() => {}
        }
        let failure = self.shared.failure.borrow().clone();
        failure.unwrap_or(ConnectionError::Closed)
    }

    /// Stops both workers and closes the socket. An event mid-revert is
    /// abandoned, leaving the avatar pushed.
    pub async fn close(&self) {
        {
            let mut lifecycle = lock(&self.lifecycle);
            if *lifecycle == Lifecycle::Closed {
                return;
            }
            *lifecycle = Lifecycle::Closed;
        }
        lock(&self.queue_tx).take();
        self.shared.set_state(ConnectionState::Closing);
        self.shared.shutdown.send_replace(true);

        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if let Err(err) = worker.await {
                tracing::warn!(error = %err, "connection worker ended abnormally");
            }
        }

        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            if let Err(err) = writer.close().await {
                tracing::debug!(error = %err, "error while closing veadotube websocket");
            }
        }
        self.shared.set_state(ConnectionState::Disconnected);
        tracing::info!(uri = %self.shared.settings.uri, "closed veadotube websocket");
    }
}

impl Drop for VeadotubeConnection {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
