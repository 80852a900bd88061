//! Subscription registry for dispatching MESSAGE frames by subscription id.
//!
//! Ids are `sub-N` with `N` taken from a counter owned by the registry. They
//! are never reused, so a MESSAGE still in flight for a removed subscription
//! can't reach a newer one.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use stompkit_protocol::{AckMode, Frame};

use crate::error::SessionError;

/// Callback invoked with each MESSAGE for a subscription.
pub type MessageHandler = Arc<dyn Fn(Frame) + Send + Sync>;

/// Token returned by `subscribe`, needed to `unsubscribe`.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct SubscriptionHandle(String);

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Entry for a registered subscription.
pub struct Subscription {
    seq: u64,
    id: String,
    destination: String,
    ack_mode: AckMode,
    handler: MessageHandler,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    pub fn handler(&self) -> &MessageHandler {
        &self.handler
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("ack_mode", &self.ack_mode)
            .finish_non_exhaustive()
    }
}

/// Registry mapping subscription ids to destinations and handlers.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    /// Last sequence number handed out.
    next_seq: AtomicU64,
    /// Subscriptions by id.
    entries: HashMap<String, Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription under a fresh id.
    pub fn register(
        &mut self,
        destination: &str,
        ack_mode: AckMode,
        handler: MessageHandler,
    ) -> SubscriptionHandle {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("sub-{seq}");
        self.entries.insert(
            id.clone(),
            Subscription {
                seq,
                id: id.clone(),
                destination: destination.to_string(),
                ack_mode,
                handler,
            },
        );
        SubscriptionHandle(id)
    }

    pub fn unregister(&mut self, id: &str) -> Option<Subscription> {
        self.entries.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Subscription> {
        self.entries.get(id)
    }

    /// Handler for a MESSAGE's `subscription` header value.
    pub fn handler_for(&self, id: &str) -> Result<MessageHandler, SessionError> {
        self.entries
            .get(id)
            .map(|sub| sub.handler.clone())
            .ok_or_else(|| SessionError::DispatchMiss(id.to_string()))
    }

    /// Oldest subscription to `destination`; STOMP 1.0 brokers may omit the
    /// `subscription` header on MESSAGE frames.
    pub fn find_by_destination(&self, destination: &str) -> Option<&Subscription> {
        self.entries
            .values()
            .filter(|sub| sub.destination == destination)
            .min_by_key(|sub| sub.seq)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every subscription; ids keep counting up.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod test {
    use super::{MessageHandler, SubscriptionRegistry};
    use crate::SessionError;
    use std::sync::Arc;
    use stompkit_protocol::AckMode;

    fn noop() -> MessageHandler {
        Arc::new(|_| {})
    }

    #[test]
    fn test_ids_are_not_reused() {
        let mut registry = SubscriptionRegistry::new();
        let first = registry.register("/topic/a", AckMode::Auto, noop());
        let second = registry.register("/topic/b", AckMode::Client, noop());
        assert_eq!(first.id(), "sub-1");
        assert_eq!(second.id(), "sub-2");

        assert!(registry.unregister(first.id()).is_some());
        assert!(registry.unregister(first.id()).is_none());
        let third = registry.register("/topic/a", AckMode::Auto, noop());
        assert_eq!(third.id(), "sub-3");
        assert_eq!(registry.len(), 2);

        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(registry.register("/topic/c", AckMode::Auto, noop()).id(), "sub-4");
    }

    #[test]
    fn test_handler_lookup() {
        let mut registry = SubscriptionRegistry::new();
        let handle = registry.register("/queue/work", AckMode::ClientIndividual, noop());
        let sub = registry.get(handle.id()).unwrap();
        assert_eq!(sub.destination(), "/queue/work");
        assert_eq!(sub.ack_mode(), AckMode::ClientIndividual);
        assert!(registry.handler_for(handle.id()).is_ok());

        match registry.handler_for("sub-99") {
            Err(SessionError::DispatchMiss(id)) => assert_eq!(id, "sub-99"),
            other => panic!("unexpected lookup result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_find_by_destination_prefers_oldest() {
        let mut registry = SubscriptionRegistry::new();
        registry.register("/topic/x", AckMode::Auto, noop());
        let a = registry.register("/topic/a", AckMode::Auto, noop());
        registry.register("/topic/a", AckMode::Client, noop());
        assert_eq!(registry.find_by_destination("/topic/a").unwrap().id(), a.id());
        assert!(registry.find_by_destination("/topic/none").is_none());
    }
}
