//! Partition function for the word dictionary.
//!
//! A word is routed by the CRC-32 of its UTF-8 bytes modulo the partition
//! count. CRC-32 is fixed by definition, so routing is stable across
//! processes, platforms and compiler versions.

use crate::error::{IndexError, Result};

/// Handle naming one word partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardId(pub usize);

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "words-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    partitions: usize,
}

impl ShardRouter {
    pub fn new(partitions: usize) -> Result<Self> {
        if partitions == 0 {
            return Err(IndexError::Config("shard router needs at least one partition".into()));
        }
        Ok(Self { partitions })
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    pub fn shard_for(&self, word: &str) -> ShardId {
        let hash = crc32fast::hash(word.as_bytes()) as usize;
        ShardId(hash % self.partitions)
    }

    /// Every partition, in index order.
    pub fn all_shards(&self) -> impl Iterator<Item = ShardId> {
        (0..self.partitions).map(ShardId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_partitions_is_fatal() {
        assert!(matches!(ShardRouter::new(0), Err(IndexError::Config(_))));
    }

    #[test]
    fn routing_is_total_and_deterministic() {
        for n in 1..=9 {
            let router = ShardRouter::new(n).unwrap();
            for word in ["", "a", "rust", "søgning", "ünïcödé", "a much longer word than usual"] {
                let first = router.shard_for(word);
                assert!(first.0 < n);
                assert_eq!(first, router.shard_for(word));
            }
        }
    }

    #[test]
    fn single_partition_takes_everything() {
        let router = ShardRouter::new(1).unwrap();
        assert_eq!(router.shard_for("anything"), ShardId(0));
        assert_eq!(router.all_shards().collect::<Vec<_>>(), vec![ShardId(0)]);
    }

    #[test]
    fn routing_is_pinned() {
        // crc32("rust") = 0xe13282a0
        let router = ShardRouter::new(4).unwrap();
        assert_eq!(router.shard_for("rust"), ShardId(0xe132_82a0 % 4));
    }

    #[test]
    fn spreads_words_over_partitions() {
        let router = ShardRouter::new(4).unwrap();
        let mut seen = [0usize; 4];
        for i in 0..400 {
            seen[router.shard_for(&format!("word{i}")).0] += 1;
        }
        assert!(seen.iter().all(|&c| c > 0));
    }
}
