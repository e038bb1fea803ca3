use merope_types::ShardId;

/// `raft_log` keyspace: `shard(8) ++ index(8)`, fixed 16 bytes.
/// Big-endian on both components → lexicographic order = numeric order.
pub fn raft_log_key(shard_id: ShardId, index: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&shard_id.to_be_bytes());
    key[8..].copy_from_slice(&index.to_be_bytes());
    key
}

/// 8-byte prefix shared by every key of a shard, in every keyspace.
pub fn shard_prefix(shard_id: ShardId) -> [u8; 8] {
    shard_id.to_be_bytes()
}

/// `accounts` keyspace: `shard(8) ++ account(8)`
pub fn account_key(shard_id: ShardId, account_id: u64) -> [u8; 16] {
    raft_log_key(shard_id, account_id)
}

/// `buckets` keyspace: `shard(8) ++ account(8) ++ name_utf8`
pub fn bucket_key(shard_id: ShardId, account_id: u64, name: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + name.len());
    buf.extend_from_slice(&account_key(shard_id, account_id));
    buf.extend_from_slice(name.as_bytes());
    buf
}

/// `kv` keyspace: `shard(8) ++ account(8) ++ len(bucket)(2) ++ bucket ++ key`
///
/// The length prefix keeps bucket "ab" + key "c" apart from bucket "a" +
/// key "bc".
pub fn kv_key(shard_id: ShardId, account_id: u64, bucket: &str, key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(18 + bucket.len() + key.len());
    buf.extend_from_slice(&account_key(shard_id, account_id));
    buf.extend_from_slice(&(bucket.len() as u16).to_be_bytes());
    buf.extend_from_slice(bucket.as_bytes());
    buf.extend_from_slice(key);
    buf
}

/// `meta` keyspace: `shard(8) ++ label_utf8`
pub fn meta_key(shard_id: ShardId, label: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + label.len());
    buf.extend_from_slice(&shard_id.to_be_bytes());
    buf.extend_from_slice(label.as_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raft_log_keys_sort_by_index() {
        let a = raft_log_key(0, 1);
        let b = raft_log_key(0, 2);
        let c = raft_log_key(0, 1000);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn raft_log_key_different_shards_dont_interleave() {
        let shard0_high = raft_log_key(0, u64::MAX);
        let shard1_low = raft_log_key(1, 0);
        assert!(shard0_high < shard1_low);
        assert!(shard0_high.starts_with(&shard_prefix(0)));
    }

    #[test]
    fn kv_key_bucket_boundary_is_unambiguous() {
        let ab_c = kv_key(1, 7, "ab", b"c");
        let a_bc = kv_key(1, 7, "a", b"bc");
        assert_ne!(ab_c, a_bc);
    }

    #[test]
    fn bucket_keys_stay_within_account() {
        let key = bucket_key(3, 9, "photos");
        assert_eq!(&key[..8], &3u64.to_be_bytes());
        assert_eq!(&key[8..16], &9u64.to_be_bytes());
        assert_eq!(&key[16..], b"photos");
    }

    #[test]
    fn meta_key_is_shard_prefixed() {
        let key = meta_key(0, "last_purged");
        assert_eq!(&key[..8], &0u64.to_be_bytes());
        assert_eq!(&key[8..], b"last_purged");
    }
}
