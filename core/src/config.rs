use crate::error::{IndexError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

fn default_partitions() -> usize { 4 }
fn default_op_timeout_ms() -> u64 { 5_000 }
fn default_attempts() -> usize { 3 }
fn default_base_delay_ms() -> u64 { 150 }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_attempts")]
    pub attempts: usize,
    /// First backoff delay; doubled after every failed attempt.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: default_attempts(), base_delay_ms: default_base_delay_ms() }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self { attempts: 1, base_delay_ms: 0 }
    }

    pub fn delay_for(&self, attempt: usize) -> Duration {
        let factor = 1u64 << attempt.min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub root: PathBuf,
    #[serde(default = "default_partitions")]
    pub partitions: usize,
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl IndexConfig {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            partitions: default_partitions(),
            op_timeout_ms: default_op_timeout_ms(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.partitions == 0 {
            return Err(IndexError::Config("partition count must be at least 1".into()));
        }
        if self.op_timeout_ms == 0 {
            return Err(IndexError::Config("operation timeout must be non-zero".into()));
        }
        if self.retry.attempts == 0 {
            return Err(IndexError::Config("retry attempts must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let cfg: IndexConfig = serde_json::from_str(r#"{"root": "/tmp/idx"}"#).unwrap();
        assert_eq!(cfg.partitions, 4);
        assert_eq!(cfg.op_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.retry, RetryPolicy::default());
        cfg.validate().unwrap();
    }

    #[test]
    fn zero_partitions_is_rejected() {
        let cfg = IndexConfig::new("/tmp/idx").with_partitions(0);
        assert!(matches!(cfg.validate(), Err(IndexError::Config(_))));
    }

    #[test]
    fn backoff_doubles() {
        let p = RetryPolicy { attempts: 4, base_delay_ms: 10 };
        assert_eq!(p.delay_for(0), Duration::from_millis(10));
        assert_eq!(p.delay_for(2), Duration::from_millis(40));
    }
}
