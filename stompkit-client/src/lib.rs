//! STOMP client session over a pluggable byte [`Channel`].
//!
//! ```no_run
//! # use stompkit_client::{Channel, EventSink, Session, SessionConfig};
//! # use stompkit_client::protocol::AckMode;
//! # fn example(channel: impl Channel) -> Result<(), stompkit_client::SessionError> {
//! let session = Session::new(channel, SessionConfig::new("broker"));
//! let handle = session.clone();
//! session.connect(
//!     move |_connected| {
//!         let _ = handle.subscribe("/topic/news", AckMode::Auto, |message| {
//!             println!("{}", message.body_text().unwrap_or_default());
//!         });
//!     },
//!     |error| eprintln!("session error: {error}"),
//! )?;
//! # Ok(())
//! # }
//! ```
mod channel;
mod config;
mod dispatch;
mod error;
mod registry;
mod session;
mod transaction;

pub use stompkit_protocol as protocol;

pub use channel::{Channel, EventSink, NORMAL_CLOSURE, PROTOCOL_ERROR};
pub use config::{
    OverflowPolicy, SessionConfig, DEFAULT_DELIVERY_CAPACITY, DEFAULT_EVENT_CAPACITY,
    DEFAULT_RECEIPT_TIMEOUT,
};
pub use error::SessionError;
pub use registry::{MessageHandler, Subscription, SubscriptionHandle, SubscriptionRegistry};
pub use session::{Session, SessionState};
pub use transaction::TransactionManager;
