//! Build configuration
//!
//! Shared knobs of both pipelines: k, thread count, the host memory
//! budget and how aggressively to spend it.

use crate::constants::{DEFAULT_MIN_LV2_BATCH_ITEMS, MAX_K};

/// How the planner spends the host memory budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemPolicy {
    /// Use as little memory as possible, maximising level-1 scans.
    Minimum,
    /// Aim for the default number of level-1 scans.
    Auto,
    /// Use all remaining memory.
    Maximum,
}

/// Configuration shared by the construction pipelines.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// K-mer length of the graph nodes (edges are (k+1)-mers).
    pub kmer_k: usize,

    /// Number of worker threads (0 = all available cores).
    pub num_threads: usize,

    /// Host memory budget in bytes.
    pub host_mem: u64,

    /// Memory policy for the planner.
    pub mem_policy: MemPolicy,

    /// Floor for the number of items in one level-2 batch.
    pub min_lv2_batch_items: i64,

    /// Whether to run mercy-edge augmentation before preprocessing.
    pub need_mercy: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            kmer_k: 21,
            num_threads: 0,
            host_mem: 4 << 30,
            mem_policy: MemPolicy::Auto,
            min_lv2_batch_items: DEFAULT_MIN_LV2_BATCH_ITEMS,
            need_mercy: false,
        }
    }
}

impl BuildConfig {
    /// Create a configuration for a given k, defaults elsewhere.
    pub fn new(kmer_k: usize) -> Result<Self, String> {
        let config = Self {
            kmer_k,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate parameter ranges.
    pub fn validate(&self) -> Result<(), String> {
        if self.kmer_k < 3 || self.kmer_k > MAX_K {
            return Err(format!(
                "k must be in range [3, {}], got k={}",
                MAX_K, self.kmer_k
            ));
        }
        if self.host_mem == 0 {
            return Err("host memory budget must be positive".to_string());
        }
        if self.min_lv2_batch_items <= 0 {
            return Err("min_lv2_batch_items must be positive".to_string());
        }
        Ok(())
    }

    /// Log the configuration via tracing.
    pub fn print(&self) {
        tracing::info!("Build configuration:");
        tracing::info!("  k = {}", self.kmer_k);
        if self.num_threads == 0 {
            tracing::info!("  num_threads = all available cores");
        } else {
            tracing::info!("  num_threads = {}", self.num_threads);
        }
        tracing::info!("  host_mem = {} bytes", self.host_mem);
        tracing::debug!("  mem_policy = {:?}", self.mem_policy);
        tracing::debug!("  min_lv2_batch_items = {}", self.min_lv2_batch_items);
        tracing::info!("  need_mercy = {}", self.need_mercy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BuildConfig::default();
        assert_eq!(config.kmer_k, 21);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_k_out_of_range() {
        assert!(BuildConfig::new(2).is_err());
        assert!(BuildConfig::new(128).is_err());
        assert!(BuildConfig::new(3).is_ok());
        assert!(BuildConfig::new(127).is_ok());
    }

    #[test]
    fn test_zero_budget_rejected() {
        let config = BuildConfig {
            host_mem: 0,
            ..BuildConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
