//! Hand-off of callbacks from the reader to a dedicated dispatcher task.
//!
//! ```text
//! Channel ─► reader (decode) ─► bounded queue ─► dispatcher ─► handlers
//! ```
//!
//! The single dispatcher preserves frame order while keeping slow handlers
//! off the reader, so RECEIPT and CONNECTED processing never wait on them.
//! Handlers are plain blocking closures, so the drain loop runs on the
//! runtime's blocking pool rather than on an async worker.
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use stompkit_protocol::Frame;
use tokio::{runtime::Handle, sync::mpsc};

use crate::{config::OverflowPolicy, error::SessionError, registry::MessageHandler};

pub(crate) type ConnectedCallback = Box<dyn Fn(Frame) + Send + Sync>;
pub(crate) type ErrorCallback = Box<dyn Fn(SessionError) + Send + Sync>;

pub(crate) struct Callbacks {
    pub on_connected: ConnectedCallback,
    pub on_error: ErrorCallback,
}

enum Delivery {
    Connected(Frame),
    Message(MessageHandler, Frame),
    Error(SessionError),
}

#[derive(Clone)]
pub(crate) struct Dispatcher {
    tx: mpsc::Sender<Delivery>,
    policy: OverflowPolicy,
    dropped: Arc<AtomicU64>,
}

impl Dispatcher {
    pub fn spawn(
        runtime: &Handle,
        capacity: usize,
        policy: OverflowPolicy,
        dropped: Arc<AtomicU64>,
        callbacks: Callbacks,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        runtime.spawn_blocking(move || run(rx, callbacks));
        Self {
            tx,
            policy,
            dropped,
        }
    }

    pub async fn connected(&self, frame: Frame) {
        self.deliver(Delivery::Connected(frame)).await
    }

    pub async fn error(&self, error: SessionError) {
        self.deliver(Delivery::Error(error)).await
    }

    pub async fn message(&self, handler: MessageHandler, frame: Frame) {
        match self.policy {
            OverflowPolicy::Block => self.deliver(Delivery::Message(handler, frame)).await,
            OverflowPolicy::DropNewest => {
                if let Err(e) = self.tx.try_send(Delivery::Message(handler, frame)) {
                    let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    match e {
                        mpsc::error::TrySendError::Full(_) => {
                            tracing::warn!(total, "handler queue full, message dropped")
                        }
                        mpsc::error::TrySendError::Closed(_) => {
                            tracing::warn!(total, "dispatcher stopped, message dropped")
                        }
                    }
                }
            }
        }
    }

    async fn deliver(&self, delivery: Delivery) {
        if self.tx.send(delivery).await.is_err() {
            tracing::warn!("dispatcher stopped, delivery dropped");
        }
    }
}

fn run(mut rx: mpsc::Receiver<Delivery>, callbacks: Callbacks) {
    while let Some(delivery) = rx.blocking_recv() {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match delivery {
            Delivery::Connected(frame) => (callbacks.on_connected)(frame),
            Delivery::Message(handler, frame) => handler(frame),
            Delivery::Error(error) => (callbacks.on_error)(error),
        }));
        if outcome.is_err() {
            tracing::error!("callback panicked");
        }
    }
    tracing::debug!("dispatcher finished");
}
