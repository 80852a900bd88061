//! Client session: handshake, subscriptions, transactions and dispatch.
//!
//! A [`Session`] is a cheap handle; clones share one connection. Outbound
//! frames are encoded and handed to the channel while holding the session
//! lock, so bytes of two frames never interleave. Inbound bytes are decoded
//! by a reader task strictly in arrival order and the resulting callbacks
//! run on a dispatcher task (see [`crate::dispatch`]).
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use stompkit_protocol::{
    header::{self, Header},
    AckMode, Command, Frame, FrameCodec, HeartBeat, Version, HEARTBEAT,
};
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::{
    bytes::{Bytes, BytesMut},
    codec::{Decoder, Encoder},
};

use crate::{
    channel::{Channel, ChannelEvent, EventSink, NORMAL_CLOSURE, PROTOCOL_ERROR},
    config::SessionConfig,
    dispatch::{Callbacks, Dispatcher},
    error::{self, SessionError},
    registry::{SubscriptionHandle, SubscriptionRegistry},
    transaction::TransactionManager,
};

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum SessionState {
    Starting,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Starting => "STARTING",
            SessionState::Connecting => "CONNECTING",
            SessionState::Connected => "CONNECTED",
            SessionState::Disconnecting => "DISCONNECTING",
            SessionState::Disconnected => "DISCONNECTED",
            SessionState::Failed => "FAILED",
        })
    }
}

/// A STOMP session over one [`Channel`].
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

struct Shared {
    channel: Arc<dyn Channel>,
    config: SessionConfig,
    core: Mutex<Core>,
    dropped: Arc<AtomicU64>,
}

/// Everything guarded by the session lock.
struct Core {
    state: SessionState,
    encoder: FrameCodec,
    version: Option<Version>,
    heart_beat: HeartBeat,
    registry: SubscriptionRegistry,
    transactions: TransactionManager,
    /// Waiters for RECEIPT frames, by receipt id.
    receipts: HashMap<String, oneshot::Sender<Frame>>,
    next_receipt: u64,
    heartbeat_task: Option<JoinHandle<()>>,
}

impl Core {
    fn require(&self, operation: &'static str, state: SessionState) -> Result<(), SessionError> {
        if self.state != state {
            return Err(SessionError::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    fn transmit(&mut self, channel: &dyn Channel, frame: &Frame) -> Result<(), SessionError> {
        let mut buffer = BytesMut::new();
        self.encoder.encode(frame, &mut buffer)?;
        tracing::debug!(command = %frame.command(), bytes = buffer.len(), "sending frame");
        channel.send(buffer.freeze())?;
        Ok(())
    }

    fn with_transaction(&self, frame: Frame) -> Frame {
        match self.transactions.current_id() {
            Some(id) => frame.header(header::TRANSACTION, id),
            None => frame,
        }
    }

    /// Release everything tied to the connection; dropping the receipt
    /// waiters wakes a pending `disconnect`.
    fn teardown(&mut self) {
        self.registry.clear();
        self.transactions.clear();
        self.receipts.clear();
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock()
    }

    fn fail(&self, core: &mut Core, code: u16) {
        core.state = SessionState::Failed;
        core.teardown();
        self.channel.disconnect(code);
    }
}

impl Session {
    pub fn new(channel: impl Channel, config: SessionConfig) -> Self {
        let core = Core {
            state: SessionState::Starting,
            encoder: FrameCodec::default(),
            version: None,
            heart_beat: HeartBeat::default(),
            registry: SubscriptionRegistry::new(),
            transactions: TransactionManager::new(),
            receipts: HashMap::new(),
            next_receipt: 0,
            heartbeat_task: None,
        };
        Self {
            shared: Arc::new(Shared {
                channel: Arc::new(channel),
                config,
                core: Mutex::new(core),
                dropped: Arc::new(AtomicU64::new(0)),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    /// Version the broker selected, once connected
    pub fn version(&self) -> Option<Version> {
        self.shared.lock().version
    }

    /// Negotiated heart-beat intervals, from our side of the connection
    pub fn heart_beat(&self) -> HeartBeat {
        self.shared.lock().heart_beat
    }

    pub fn transaction_id(&self) -> Option<String> {
        self.shared.lock().transactions.current_id().map(String::from)
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.lock().registry.len()
    }

    /// Messages discarded because the handler queue was full
    pub fn dropped_deliveries(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Open the channel and start the handshake.
    ///
    /// `on_connected` runs once with the broker's CONNECTED frame. `on_error`
    /// receives every asynchronously detected problem: decode errors,
    /// dispatch misses, ERROR frames and transport failures. Must be called
    /// from within a Tokio runtime.
    pub fn connect<C, E>(&self, on_connected: C, on_error: E) -> Result<(), SessionError>
    where
        C: Fn(Frame) + Send + Sync + 'static,
        E: Fn(SessionError) + Send + Sync + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| SessionError::NoRuntime)?;
        let config = &self.shared.config;
        let events = {
            let mut core = self.shared.lock();
            core.require("connect", SessionState::Starting)?;
            core.state = SessionState::Connecting;

            let callbacks = Callbacks {
                on_connected: Box::new(on_connected),
                on_error: Box::new(on_error),
            };
            let dispatcher = Dispatcher::spawn(
                &runtime,
                config.delivery_capacity,
                config.overflow_policy,
                self.shared.dropped.clone(),
                callbacks,
            );
            let (tx, rx) = mpsc::channel(config.event_capacity.max(1));
            let reader = Reader {
                shared: self.shared.clone(),
                dispatcher,
                decoder: FrameCodec::default().with_max_length(config.max_frame_length),
                buffer: BytesMut::new(),
            };
            runtime.spawn(reader.run(rx));
            EventSink::new(tx)
        };

        tracing::debug!(host = %config.host, "connecting channel");
        if let Err(e) = self.shared.channel.connect(events) {
            let mut core = self.shared.lock();
            core.state = SessionState::Failed;
            return Err(e.into());
        }
        Ok(())
    }

    /// Subscribe to `destination`; `handler` runs for each MESSAGE delivered to it
    pub fn subscribe<F>(
        &self,
        destination: &str,
        ack_mode: AckMode,
        handler: F,
    ) -> Result<SubscriptionHandle, SessionError>
    where
        F: Fn(Frame) + Send + Sync + 'static,
    {
        let mut core = self.shared.lock();
        core.require("subscribe", SessionState::Connected)?;
        let handle = core
            .registry
            .register(destination, ack_mode, Arc::new(handler));
        let frame = Frame::new(Command::Subscribe)
            .header(header::ID, handle.id())
            .header(header::DESTINATION, destination)
            .header(header::ACK, ack_mode.as_str());
        if let Err(e) = core.transmit(&*self.shared.channel, &frame) {
            core.registry.unregister(handle.id());
            return Err(e);
        }
        tracing::debug!(id = %handle, destination, "subscribed");
        Ok(handle)
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), SessionError> {
        let mut core = self.shared.lock();
        core.require("unsubscribe", SessionState::Connected)?;
        core.registry
            .unregister(handle.id())
            .ok_or_else(|| SessionError::UnknownSubscription(handle.id().to_string()))?;
        let frame = Frame::new(Command::Unsubscribe).header(header::ID, handle.id());
        core.transmit(&*self.shared.channel, &frame)
    }

    /// Send `body` to `destination`, inside the active transaction if any
    pub fn send(
        &self,
        destination: &str,
        body: impl Into<Bytes>,
        content_type: &str,
    ) -> Result<(), SessionError> {
        self.send_with_headers(destination, body, content_type, std::iter::empty::<Header>())
    }

    /// Like [`Session::send`], passing `headers` through after the standard ones
    pub fn send_with_headers<I, H>(
        &self,
        destination: &str,
        body: impl Into<Bytes>,
        content_type: &str,
        headers: I,
    ) -> Result<(), SessionError>
    where
        I: IntoIterator<Item = H>,
        H: Into<Header>,
    {
        let body = body.into();
        let mut core = self.shared.lock();
        core.require("send", SessionState::Connected)?;
        let frame = Frame::new(Command::Send)
            .header(header::DESTINATION, destination)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CONTENT_LENGTH, body.len().to_string());
        let frame = core.with_transaction(frame).headers_from(headers).body(body);
        core.transmit(&*self.shared.channel, &frame)
    }

    /// Acknowledge a MESSAGE received on a `client` or `client-individual` subscription
    pub fn ack(&self, message: &Frame) -> Result<(), SessionError> {
        self.acknowledge(Command::Ack, message)
    }

    pub fn nack(&self, message: &Frame) -> Result<(), SessionError> {
        self.acknowledge(Command::Nack, message)
    }

    fn acknowledge(&self, command: Command, message: &Frame) -> Result<(), SessionError> {
        let operation = if command == Command::Ack { "ack" } else { "nack" };
        let mut core = self.shared.lock();
        core.require(operation, SessionState::Connected)?;
        let require = |key: &'static str| message.get(key).ok_or(SessionError::MissingHeader(key));

        let version = core.version.unwrap_or_default();
        let frame = match version {
            Version::V1_2 => Frame::new(command).header(header::ID, require(header::ACK)?),
            Version::V1_1 => Frame::new(command)
                .header(header::MESSAGE_ID, require(header::MESSAGE_ID)?)
                .header(header::SUBSCRIPTION, require(header::SUBSCRIPTION)?),
            Version::V1_0 => {
                if command == Command::Nack {
                    return Err(SessionError::Unsupported("NACK", version));
                }
                Frame::new(command).header(header::MESSAGE_ID, require(header::MESSAGE_ID)?)
            }
        };
        let frame = core.with_transaction(frame);
        core.transmit(&*self.shared.channel, &frame)
    }

    /// Start a transaction; returns its id
    pub fn begin_transaction(&self) -> Result<String, SessionError> {
        let mut core = self.shared.lock();
        core.require("begin a transaction", SessionState::Connected)?;
        let id = core.transactions.begin()?;
        let frame = Frame::new(Command::Begin).header(header::TRANSACTION, &id);
        if let Err(e) = core.transmit(&*self.shared.channel, &frame) {
            core.transactions.clear();
            return Err(e);
        }
        Ok(id)
    }

    pub fn commit(&self) -> Result<(), SessionError> {
        self.finish_transaction(Command::Commit, "commit")
    }

    pub fn abort(&self) -> Result<(), SessionError> {
        self.finish_transaction(Command::Abort, "abort")
    }

    fn finish_transaction(
        &self,
        command: Command,
        operation: &'static str,
    ) -> Result<(), SessionError> {
        let mut core = self.shared.lock();
        core.require(operation, SessionState::Connected)?;
        let id = core
            .transactions
            .current_id()
            .ok_or(SessionError::NoTransaction)?
            .to_string();
        let frame = Frame::new(command).header(header::TRANSACTION, id);
        core.transmit(&*self.shared.channel, &frame)?;
        core.transactions.clear();
        Ok(())
    }

    /// Send DISCONNECT and wait for the broker's RECEIPT, bounded by
    /// `receipt_timeout`. The channel is closed and the session ends
    /// DISCONNECTED either way; a timeout is reported as `ReceiptTimeout`.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let (receipt, waiter) = {
            let mut core = self.shared.lock();
            core.require("disconnect", SessionState::Connected)?;
            core.next_receipt += 1;
            let receipt = format!("receipt-{}", core.next_receipt);
            let (tx, rx) = oneshot::channel();
            core.receipts.insert(receipt.clone(), tx);
            let frame = Frame::new(Command::Disconnect).header(header::RECEIPT, &receipt);
            if let Err(e) = core.transmit(&*self.shared.channel, &frame) {
                core.receipts.remove(&receipt);
                return Err(e);
            }
            core.state = SessionState::Disconnecting;
            (receipt, rx)
        };

        let timeout = self.shared.config.receipt_timeout;
        let outcome = tokio::time::timeout(timeout, waiter).await;

        let mut core = self.shared.lock();
        let result = match outcome {
            Ok(Ok(_)) => {
                tracing::debug!(%receipt, "disconnect acknowledged");
                Ok(())
            }
            // waiter dropped: the channel closed first, or the session failed
            Ok(Err(_)) if core.state == SessionState::Failed => {
                return Err(SessionError::InvalidState {
                    operation: "disconnect",
                    state: core.state,
                });
            }
            Ok(Err(_)) => Ok(()),
            Err(_) => {
                tracing::warn!(%receipt, ?timeout, "no receipt for DISCONNECT, closing anyway");
                core.receipts.remove(&receipt);
                Err(SessionError::ReceiptTimeout(receipt))
            }
        };
        if core.state != SessionState::Disconnected {
            core.state = SessionState::Disconnected;
            core.teardown();
            self.shared.channel.disconnect(NORMAL_CLOSURE);
        }
        tracing::info!("disconnected");
        result
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.shared.lock();
        f.debug_struct("Session")
            .field("host", &self.shared.config.host)
            .field("state", &core.state)
            .field("version", &core.version)
            .field("subscriptions", &core.registry.len())
            .finish()
    }
}

/// The single reader flow: decodes channel data in order and routes frames.
struct Reader {
    shared: Arc<Shared>,
    dispatcher: Dispatcher,
    decoder: FrameCodec,
    buffer: BytesMut,
}

impl Reader {
    async fn run(mut self, mut events: mpsc::Receiver<ChannelEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Connected => self.on_channel_connected().await,
                ChannelEvent::Data(bytes) => self.on_data(&bytes).await,
                ChannelEvent::Disconnected { reason, code } => {
                    self.flush().await;
                    self.on_channel_closed(SessionError::Disconnected { reason, code })
                        .await;
                }
                ChannelEvent::Error(message) => {
                    let error = std::io::Error::new(std::io::ErrorKind::Other, message);
                    self.on_channel_closed(SessionError::Channel(error)).await;
                }
            }
            if self.shared.lock().state.is_terminal() {
                break;
            }
        }
        tracing::debug!("reader finished");
    }

    async fn on_channel_connected(&mut self) {
        let failure = {
            let mut core = self.shared.lock();
            if core.state != SessionState::Connecting {
                tracing::warn!(state = %core.state, "ignoring channel connected event");
                return;
            }
            let frame = self.shared.config.connect_frame();
            match core.transmit(&*self.shared.channel, &frame) {
                Ok(()) => None,
                Err(e) => {
                    self.shared.fail(&mut core, PROTOCOL_ERROR);
                    Some(e)
                }
            }
        };
        if let Some(e) = failure {
            tracing::error!(error = %e, "could not send CONNECT");
            self.dispatcher.error(e).await;
        }
    }

    async fn on_data(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        loop {
            match self.decoder.decode(&mut self.buffer) {
                Ok(Some(frame)) => self.on_frame(frame).await,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "discarding undecodable frame");
                    self.dispatcher.error(error::from_decode(e)).await;
                }
            }
            if self.shared.lock().state.is_terminal() {
                self.buffer.clear();
                break;
            }
        }
    }

    // Report a frame cut short by the channel closing
    async fn flush(&mut self) {
        match self.decoder.decode_eof(&mut self.buffer) {
            Ok(Some(frame)) => self.on_frame(frame).await,
            Ok(None) => {}
            Err(e) => self.dispatcher.error(error::from_decode(e)).await,
        }
    }

    async fn on_frame(&mut self, frame: Frame) {
        tracing::debug!(command = %frame.command(), "received frame");
        let state = self.shared.lock().state;
        match frame.command() {
            Command::Connected => self.on_connected(frame).await,
            Command::Error => self.on_error(frame).await,
            // only CONNECTED or ERROR may answer a CONNECT
            Command::Message if state != SessionState::Connecting => self.on_message(frame).await,
            Command::Receipt if state != SessionState::Connecting => self.on_receipt(frame).await,
            command => {
                tracing::warn!(%command, %state, "unexpected frame");
                let error = SessionError::UnexpectedFrame {
                    command: command.clone(),
                    state,
                };
                self.dispatcher.error(error).await;
            }
        }
    }

    async fn on_connected(&mut self, frame: Frame) {
        let outcome = {
            let mut core = self.shared.lock();
            if core.state != SessionState::Connecting {
                Err(SessionError::UnexpectedFrame {
                    command: Command::Connected,
                    state: core.state,
                })
            } else {
                match self.negotiate(&frame) {
                    Ok((version, heart_beat)) => {
                        core.state = SessionState::Connected;
                        core.version = Some(version);
                        core.heart_beat = heart_beat;
                        core.encoder.set_version(version);
                        if let Some(interval) = heart_beat.send_interval() {
                            core.heartbeat_task =
                                Some(tokio::spawn(send_heartbeats(self.shared.clone(), interval)));
                        }
                        Ok(version)
                    }
                    Err(e) => {
                        self.shared.fail(&mut core, PROTOCOL_ERROR);
                        Err(e)
                    }
                }
            }
        };
        match outcome {
            Ok(version) => {
                self.decoder.set_version(version);
                tracing::info!(%version, server = frame.get(header::SERVER), "connected");
                self.dispatcher.connected(frame).await;
            }
            Err(e) => self.dispatcher.error(e).await,
        }
    }

    fn negotiate(&self, frame: &Frame) -> Result<(Version, HeartBeat), SessionError> {
        let config = &self.shared.config;
        // a 1.0 broker does not send a version header
        let version = match frame.get(header::VERSION) {
            Some(text) => text
                .parse::<Version>()
                .map_err(|_| SessionError::VersionMismatch(text.to_string()))?,
            None => Version::V1_0,
        };
        if !config.offers(version) {
            return Err(SessionError::VersionMismatch(version.to_string()));
        }
        let server = match frame.get(header::HEART_BEAT).map(str::parse::<HeartBeat>) {
            Some(Ok(server)) => server,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "ignoring heart-beat header");
                HeartBeat::default()
            }
            None => HeartBeat::default(),
        };
        Ok((version, HeartBeat::negotiate(config.heart_beat, server)))
    }

    async fn on_message(&mut self, frame: Frame) {
        let lookup = {
            let core = self.shared.lock();
            match (core.state, frame.get(header::SUBSCRIPTION)) {
                (SessionState::Connected | SessionState::Disconnecting, Some(id)) => {
                    core.registry.handler_for(id)
                }
                (SessionState::Connected | SessionState::Disconnecting, None)
                    if core.version == Some(Version::V1_0) =>
                {
                    let destination = frame.get(header::DESTINATION).unwrap_or_default();
                    core.registry
                        .find_by_destination(destination)
                        .map(|sub| sub.handler().clone())
                        .ok_or_else(|| SessionError::DispatchMiss(destination.to_string()))
                }
                (SessionState::Connected | SessionState::Disconnecting, None) => {
                    Err(SessionError::MissingHeader(header::SUBSCRIPTION))
                }
                (state, _) => Err(SessionError::UnexpectedFrame {
                    command: Command::Message,
                    state,
                }),
            }
        };
        match lookup {
            Ok(handler) => self.dispatcher.message(handler, frame).await,
            Err(e) => {
                tracing::warn!(error = %e, "message not dispatched");
                self.dispatcher.error(e).await;
            }
        }
    }

    async fn on_receipt(&mut self, frame: Frame) {
        let Some(receipt) = frame.get(header::RECEIPT_ID).map(String::from) else {
            self.dispatcher
                .error(SessionError::MissingHeader(header::RECEIPT_ID))
                .await;
            return;
        };
        let waiter = self.shared.lock().receipts.remove(&receipt);
        match waiter {
            Some(tx) => {
                let _ = tx.send(frame);
            }
            None => tracing::debug!(%receipt, "no one waiting for receipt"),
        }
    }

    async fn on_error(&mut self, frame: Frame) {
        {
            let mut core = self.shared.lock();
            tracing::error!(
                message = frame.get(header::MESSAGE),
                state = %core.state,
                "broker sent ERROR"
            );
            if !core.state.is_terminal() {
                self.shared.fail(&mut core, PROTOCOL_ERROR);
            }
        }
        self.dispatcher
            .error(SessionError::ErrorFrame(Box::new(frame)))
            .await;
    }

    async fn on_channel_closed(&mut self, error: SessionError) {
        let report = {
            let mut core = self.shared.lock();
            match core.state {
                SessionState::Disconnecting => {
                    core.state = SessionState::Disconnected;
                    core.teardown();
                    false
                }
                SessionState::Disconnected | SessionState::Failed => false,
                _ => {
                    core.state = SessionState::Failed;
                    core.teardown();
                    true
                }
            }
        };
        if report {
            tracing::error!(%error, "channel lost");
            self.dispatcher.error(error).await;
        }
    }
}

async fn send_heartbeats(shared: Arc<Shared>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let core = shared.lock();
        if !matches!(
            core.state,
            SessionState::Connected | SessionState::Disconnecting
        ) {
            break;
        }
        if let Err(e) = shared.channel.send(Bytes::from_static(HEARTBEAT)) {
            tracing::warn!(error = %e, "could not send heart-beat");
            break;
        }
        tracing::trace!("heart-beat sent");
    }
}
