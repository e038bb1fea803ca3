mod apply;
pub mod fjall;
pub mod keys;
pub mod mem;
pub mod traits;
pub mod types;

pub use traits::{LogStorage, StateMachineStore};
pub use types::{EntryId, HardState, LogEntry, LogState, Snapshot, SnapshotMeta, VoteRecord};

use merope_types::DbError;

pub fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, DbError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| DbError::Storage(e.to_string()))
}

pub fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, DbError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| DbError::Storage(e.to_string()))
}
