//! Replicated client session table.
//!
//! Every replica of a shard applies the same session entries in the same
//! order, so the table (and the outcomes it caches) is identical everywhere
//! and travels with snapshots.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use merope_types::{ClientId, CommandOutcome, DbError, SessionTag};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct ClientSession {
    responded_to: u64,
    /// Log index of the last entry that touched this session; drives LRU
    /// eviction deterministically on every replica.
    last_used: u64,
    history: BTreeMap<u64, CommandOutcome>,
}

/// Verdict for a tagged command about to be applied.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCheck {
    Apply,
    Cached(CommandOutcome),
    Reject(DbError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionTable {
    clients: BTreeMap<ClientId, ClientSession>,
    capacity: usize,
}

impl SessionTable {
    pub fn new(capacity: usize) -> Self {
        SessionTable { clients: BTreeMap::new(), capacity: capacity.max(1) }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        self.clients.contains_key(&client_id)
    }

    /// Register `client_id` at log `index`, evicting the least recently used
    /// client when the table is full.
    pub fn register(&mut self, client_id: ClientId, index: u64) -> Result<(), DbError> {
        if self.clients.contains_key(&client_id) {
            return Err(DbError::AlreadyExists(format!("session for client {client_id}")));
        }
        if self.clients.len() >= self.capacity {
            let lru = self
                .clients
                .iter()
                .min_by_key(|(id, s)| (s.last_used, **id))
                .map(|(id, _)| *id);
            if let Some(evicted) = lru {
                tracing::debug!(client = evicted, "session table full, evicting");
                self.clients.remove(&evicted);
            }
        }
        self.clients.insert(client_id, ClientSession { last_used: index, ..Default::default() });
        Ok(())
    }

    pub fn unregister(&mut self, client_id: ClientId) -> Result<(), DbError> {
        self.clients
            .remove(&client_id)
            .map(|_| ())
            .ok_or_else(|| DbError::NotFound(format!("session for client {client_id}")))
    }

    pub fn check(&mut self, tag: &SessionTag, index: u64) -> SessionCheck {
        let Some(session) = self.clients.get_mut(&tag.client_id) else {
            return SessionCheck::Reject(DbError::UnknownSession { client_id: tag.client_id });
        };
        session.last_used = index;
        if tag.series_id <= session.responded_to {
            return SessionCheck::Reject(DbError::DuplicateCommand {
                client_id: tag.client_id,
                series_id: tag.series_id,
            });
        }
        match session.history.get(&tag.series_id) {
            Some(outcome) => SessionCheck::Cached(outcome.clone()),
            None => SessionCheck::Apply,
        }
    }

    /// Cache the outcome of a freshly applied command and drop outcomes the
    /// client has acknowledged. A command never acknowledges itself or
    /// anything after it.
    pub fn record(&mut self, tag: &SessionTag, outcome: CommandOutcome) {
        if let Some(session) = self.clients.get_mut(&tag.client_id) {
            session.history.insert(tag.series_id, outcome);
            let acked = tag.responded_to.min(tag.series_id.saturating_sub(1));
            session.responded_to = session.responded_to.max(acked);
            let acked = session.responded_to;
            session.history.retain(|series, _| *series > acked);
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, DbError> {
        merope_storage::encode(&self.clients)
    }

    pub fn restore(bytes: &[u8], capacity: usize) -> Result<Self, DbError> {
        let clients =
            if bytes.is_empty() { BTreeMap::new() } else { merope_storage::decode(bytes)? };
        Ok(SessionTable { clients, capacity: capacity.max(1) })
    }
}

#[cfg(test)]
mod tests {
    use merope_types::KvResponse;

    use super::*;

    fn tag(client_id: u64, series_id: u64, responded_to: u64) -> SessionTag {
        SessionTag { client_id, series_id, responded_to }
    }

    #[test]
    fn unknown_client_is_rejected() {
        let mut table = SessionTable::new(8);
        assert_eq!(
            table.check(&tag(42, 1, 0), 1),
            SessionCheck::Reject(DbError::UnknownSession { client_id: 42 })
        );
    }

    #[test]
    fn register_twice_fails() {
        let mut table = SessionTable::new(8);
        table.register(42, 1).unwrap();
        assert!(matches!(table.register(42, 2), Err(DbError::AlreadyExists(_))));
        table.unregister(42).unwrap();
        assert!(matches!(table.unregister(42), Err(DbError::NotFound(_))));
    }

    #[test]
    fn retried_command_returns_cached_outcome() {
        let mut table = SessionTable::new(8);
        table.register(42, 1).unwrap();
        assert_eq!(table.check(&tag(42, 1, 0), 2), SessionCheck::Apply);
        let outcome: CommandOutcome = Ok(vec![KvResponse::KeyDeleted { found: true }]);
        table.record(&tag(42, 1, 0), outcome.clone());

        assert_eq!(table.check(&tag(42, 1, 0), 3), SessionCheck::Cached(outcome));
    }

    #[test]
    fn acknowledgement_cannot_reach_past_the_command() {
        let mut table = SessionTable::new(8);
        table.register(42, 1).unwrap();
        let outcome: CommandOutcome = Ok(vec![KvResponse::KeyDeleted { found: false }]);
        table.record(&tag(42, 3, 9), outcome.clone());

        assert_eq!(table.check(&tag(42, 3, 2), 2), SessionCheck::Cached(outcome));
        assert_eq!(table.check(&tag(42, 4, 3), 3), SessionCheck::Apply);
        assert!(matches!(table.check(&tag(42, 2, 0), 4), SessionCheck::Reject(_)));
    }

    #[test]
    fn acknowledged_commands_are_duplicates() {
        let mut table = SessionTable::new(8);
        table.register(42, 1).unwrap();
        table.record(&tag(42, 1, 0), Ok(vec![]));
        table.record(&tag(42, 2, 1), Ok(vec![]));

        assert_eq!(
            table.check(&tag(42, 1, 0), 4),
            SessionCheck::Reject(DbError::DuplicateCommand { client_id: 42, series_id: 1 })
        );
        assert!(matches!(table.check(&tag(42, 2, 1), 5), SessionCheck::Cached(_)));
    }

    #[test]
    fn full_table_evicts_least_recently_used() {
        let mut table = SessionTable::new(2);
        table.register(1, 1).unwrap();
        table.register(2, 2).unwrap();
        // touch client 1 so client 2 becomes the eviction victim
        let _ = table.check(&tag(1, 1, 0), 3);
        table.register(3, 4).unwrap();

        assert!(table.contains(1));
        assert!(!table.contains(2));
        assert!(table.contains(3));
    }

    #[test]
    fn encoded_table_restores_cached_outcomes() {
        let mut table = SessionTable::new(8);
        table.register(7, 1).unwrap();
        table.record(&tag(7, 1, 0), Err(DbError::NotFound("bucket".into())));

        let mut restored = SessionTable::restore(&table.encode().unwrap(), 8).unwrap();
        assert_eq!(restored, table);
        assert_eq!(
            restored.check(&tag(7, 1, 0), 2),
            SessionCheck::Cached(Err(DbError::NotFound("bucket".into())))
        );
    }
}
