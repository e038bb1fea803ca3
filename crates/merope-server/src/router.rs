use merope_types::ShardId;
use serde::{Deserialize, Serialize};

/// `[routing]` section: the shards that hold KV data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub kv_shards: Vec<ShardId>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        RoutingConfig { kv_shards: vec![1] }
    }
}

/// Maps accounts onto KV shards by hashing the account id onto `kv_shards`.
#[derive(Debug, Clone)]
pub struct ShardRouter {
    kv_shards: Vec<ShardId>,
}

impl ShardRouter {
    pub fn new(config: &RoutingConfig) -> Result<Self, String> {
        if config.kv_shards.is_empty() {
            return Err("routing.kv_shards must name at least one shard".into());
        }
        if config.kv_shards.contains(&0) {
            return Err("routing.kv_shards must not contain shard 0".into());
        }
        Ok(ShardRouter { kv_shards: config.kv_shards.clone() })
    }

    pub fn shard_for_account(&self, account_id: u64) -> ShardId {
        let key = fnv1a(&account_id.to_be_bytes());
        let bucket = jump_consistent_hash(key, self.kv_shards.len() as u32);
        self.kv_shards[bucket as usize]
    }

    /// Shard for a request on `account_id`.
    ///
    /// `pinned` is the shard a session or transaction handle belongs to
    /// (zero means unpinned). A handle from any other shard is refused.
    pub fn route(&self, account_id: u64, pinned: Option<ShardId>) -> Result<ShardId, String> {
        let shard_id = self.shard_for_account(account_id);
        match pinned {
            Some(other) if other != 0 && other != shard_id => Err(format!(
                "account {account_id} lives on shard {shard_id}, handle belongs to shard {other}"
            )),
            _ => Ok(shard_id),
        }
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes.iter().fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

fn jump_consistent_hash(mut key: u64, num_buckets: u32) -> u32 {
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < i64::from(num_buckets) {
        b = j;
        key = key.wrapping_mul(2862933555777941757).wrapping_add(1);
        let scale = (1i64 << 31) as f64 / ((key >> 33).wrapping_add(1) as f64);
        j = ((b.wrapping_add(1) as f64) * scale) as i64;
    }
    b as u32
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn router(shards: &[ShardId]) -> ShardRouter {
        ShardRouter::new(&RoutingConfig { kv_shards: shards.to_vec() }).unwrap()
    }

    #[test]
    fn rejects_empty_or_zero_shards() {
        assert!(ShardRouter::new(&RoutingConfig { kv_shards: vec![] }).is_err());
        assert!(ShardRouter::new(&RoutingConfig { kv_shards: vec![1, 0] }).is_err());
    }

    #[test]
    fn routing_is_stable_and_spread() {
        let r = router(&[10, 20, 30, 40]);
        let mut counts: HashMap<ShardId, usize> = HashMap::new();
        for account in 1..=4000u64 {
            let shard = r.shard_for_account(account);
            assert_eq!(shard, r.shard_for_account(account));
            *counts.entry(shard).or_default() += 1;
        }
        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|&n| n > 700), "{counts:?}");
    }

    #[test]
    fn growing_shard_set_moves_few_accounts() {
        let before = router(&[1, 2, 3]);
        let after = router(&[1, 2, 3, 4]);
        let moved = (1..=3000u64)
            .filter(|a| before.shard_for_account(*a) != after.shard_for_account(*a))
            .count();
        // ideally a quarter of the accounts move to the new shard
        assert!(moved < 1100, "moved {moved}");
        assert!((1..=3000u64)
            .filter(|a| before.shard_for_account(*a) != after.shard_for_account(*a))
            .all(|a| after.shard_for_account(a) == 4));
    }

    #[test]
    fn handles_from_other_shards_are_refused() {
        let r = router(&[1, 2]);
        let home = r.shard_for_account(5);
        let other = if home == 1 { 2 } else { 1 };
        assert_eq!(r.route(5, None), Ok(home));
        assert_eq!(r.route(5, Some(0)), Ok(home));
        assert_eq!(r.route(5, Some(home)), Ok(home));
        assert!(r.route(5, Some(other)).is_err());
        assert!(r.route(5, Some(9)).is_err());
    }
}
