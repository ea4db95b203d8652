//! Configuration for the radix store and the event engine.
//!
//! Both cores are configured entirely at construction time; nothing here is
//! mutable after `new()`.

use std::time::Duration;

use crate::error::{BurrowError, BurrowResult};

/// Radix store configuration.
///
/// `key_len` and `key_bits` fix the trie geometry: every key is exactly
/// `key_len` bytes and each level consumes `key_bits` bits of it, so the
/// trie is at most `ceil(8 * key_len / key_bits)` levels deep.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Exact key length in bytes
    pub key_len: usize,
    /// Key bits consumed per trie level (1..=8)
    pub key_bits: u8,
    /// Lifespan after which an entry becomes eligible for expiry
    pub lifespan: Duration,
}

impl StoreConfig {
    pub fn new(key_len: usize, key_bits: u8, lifespan: Duration) -> Self {
        Self {
            key_len,
            key_bits,
            lifespan,
        }
    }

    /// Validate all configuration parameters.
    pub fn validate(&self) -> BurrowResult<()> {
        if self.key_len == 0 {
            return Err(BurrowError::Config {
                parameter: "key_len",
                reason: "must be >= 1".into(),
            });
        }
        if !(1..=8).contains(&self.key_bits) {
            return Err(BurrowError::Config {
                parameter: "key_bits",
                reason: "must be in [1, 8]".into(),
            });
        }
        if self.lifespan.is_zero() {
            return Err(BurrowError::Config {
                parameter: "lifespan",
                reason: "must be > 0".into(),
            });
        }
        Ok(())
    }

    /// Trie depth implied by the key geometry.
    pub fn max_depth(&self) -> usize {
        (self.key_len * 8).div_ceil(self.key_bits as usize)
    }
}

/// Event engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of session worker threads (>= 1)
    pub workers: usize,
    /// How often the maintenance thread reclaims removed listeners
    pub maintenance_period: Duration,
}

impl EngineConfig {
    pub fn new(workers: usize, maintenance_period: Duration) -> Self {
        Self {
            workers,
            maintenance_period,
        }
    }

    /// Validate all configuration parameters.
    pub fn validate(&self) -> BurrowResult<()> {
        if self.workers == 0 {
            return Err(BurrowError::Config {
                parameter: "workers",
                reason: "must be >= 1".into(),
            });
        }
        if self.maintenance_period.is_zero() {
            return Err(BurrowError::Config {
                parameter: "maintenance_period",
                reason: "must be > 0".into(),
            });
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            maintenance_period: Duration::from_secs(300),
        }
    }
}
