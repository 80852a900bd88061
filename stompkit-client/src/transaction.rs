//! Tracks the session's single active transaction.
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::SessionError;

#[derive(Debug, Default)]
pub struct TransactionManager {
    next_seq: AtomicU64,
    current: Option<String>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a transaction under a fresh `trx-N` id
    pub fn begin(&mut self) -> Result<String, SessionError> {
        if let Some(active) = &self.current {
            return Err(SessionError::TransactionActive(active.clone()));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("trx-{seq}");
        self.current = Some(id.clone());
        Ok(id)
    }

    pub fn current_id(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn clear(&mut self) -> Option<String> {
        self.current.take()
    }
}

#[cfg(test)]
mod test {
    use super::TransactionManager;
    use crate::SessionError;

    #[test]
    fn test_single_active_transaction() {
        let mut transactions = TransactionManager::new();
        assert_eq!(transactions.current_id(), None);

        let id = transactions.begin().unwrap();
        assert_eq!(id, "trx-1");
        assert_eq!(transactions.current_id(), Some("trx-1"));
        assert!(matches!(
            transactions.begin(),
            Err(SessionError::TransactionActive(active)) if active == "trx-1"
        ));

        assert_eq!(transactions.clear(), Some(id));
        assert_eq!(transactions.clear(), None);
        assert_eq!(transactions.begin().unwrap(), "trx-2");
    }
}
