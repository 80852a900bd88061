//! Transport abstraction the session runs over.
//!
//! A [`Channel`] moves opaque bytes; it knows nothing about frames. The
//! session hands it an [`EventSink`] on `connect`, and the channel reports
//! everything that happens on the wire through it, in order.
use std::{fmt, io};

use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;

/// Close code for an orderly shutdown
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code used when the broker reported an error or broke the protocol
pub const PROTOCOL_ERROR: u16 = 1002;

/// A bidirectional byte channel, typically a WebSocket.
///
/// Methods must not block: `send` queues bytes for the transport and
/// returns. Calls to `send` are already serialized by the session, so an
/// implementation may write each buffer as it arrives.
pub trait Channel: Send + Sync + 'static {
    fn connect(&self, events: EventSink) -> io::Result<()>;

    fn send(&self, bytes: Bytes) -> io::Result<()>;

    fn disconnect(&self, code: u16);
}

#[derive(Debug)]
pub(crate) enum ChannelEvent {
    Connected,
    Disconnected { reason: String, code: u16 },
    Data(Bytes),
    Error(String),
}

/// Handle a [`Channel`] uses to report transport events to its session.
///
/// Events land in a bounded queue; when it is full the reporting call
/// waits, pushing back on the transport.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::Sender<ChannelEvent>,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::Sender<ChannelEvent>) -> Self {
        Self { tx }
    }

    pub async fn on_connected(&self) {
        self.deliver(ChannelEvent::Connected).await
    }

    pub async fn on_disconnected(&self, reason: impl Into<String>, code: u16) {
        let reason = reason.into();
        self.deliver(ChannelEvent::Disconnected { reason, code }).await
    }

    /// Raw bytes as received, text or binary alike
    pub async fn on_data(&self, bytes: impl Into<Bytes>) {
        self.deliver(ChannelEvent::Data(bytes.into())).await
    }

    pub async fn on_error(&self, error: impl fmt::Display) {
        self.deliver(ChannelEvent::Error(error.to_string())).await
    }

    /// Whether the session stopped listening
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn deliver(&self, event: ChannelEvent) {
        if self.tx.send(event).await.is_err() {
            tracing::debug!("session no longer listening, channel event dropped");
        }
    }
}
