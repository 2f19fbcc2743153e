//! Per-slot configuration.
//!
//! Each pod slot is configured independently: context window, batch size,
//! thread count, GPU layer split, and the sampler defaults used for every
//! job dispatched to that slot. Configurations deserialize from JSON with
//! per-field defaults, so a config file only needs to name what it changes.

use serde::Deserialize;

use crate::error::Result;
use crate::sampling::SamplerConfig;

use std::path::Path;

/// Maximum number of independent pod slots per process.
pub const MAX_PODS: usize = 8;

/// Minimum batch size on GPU-accelerated slots. Smaller batches are
/// empirically unstable on accelerated paths — an engine-level constraint,
/// not a logic error.
pub const GPU_MIN_BATCH: usize = 512;

/// Configuration for one pod slot.
#[derive(Debug, Clone, Deserialize)]
pub struct SlotConfig {
    /// Context window length in tokens.
    #[serde(default = "default_context_length")]
    pub context_length: usize,

    /// Batch size for prompt evaluation. 0 = derive from context length
    /// (CPU) or the GPU minimum (GPU slots).
    #[serde(default)]
    pub batch_size: usize,

    /// Number of tokens to predict per job.
    #[serde(default = "default_n_predict")]
    pub n_predict: usize,

    /// CPU threads handed to the engine per evaluation call.
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// GPU layer split across devices, in layers per device. Empty = CPU.
    #[serde(default)]
    pub gpu_split: Vec<i32>,

    /// The GPU used for scratch buffers and small tensors.
    #[serde(default)]
    pub main_gpu: usize,

    /// RNG seed for sampling. When set, every job on this slot gets a
    /// reproducible RNG stream; when unset, each job is entropy-seeded.
    /// (The original implementation reseeded from wall-clock time on every
    /// job, which made the configured seed advisory; honoring it here is a
    /// deliberate behavioral change.)
    #[serde(default)]
    pub seed: Option<u64>,

    /// Sampler defaults for jobs on this slot.
    #[serde(default)]
    pub sampler: SamplerConfig,
}

fn default_context_length() -> usize {
    1024
}
fn default_n_predict() -> usize {
    512
}
fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Default for SlotConfig {
    fn default() -> Self {
        SlotConfig {
            context_length: default_context_length(),
            batch_size: 0,
            n_predict: default_n_predict(),
            threads: default_threads(),
            gpu_split: Vec::new(),
            main_gpu: 0,
            seed: None,
            sampler: SamplerConfig::default(),
        }
    }
}

impl SlotConfig {
    /// Whether this slot offloads layers to a GPU.
    pub fn is_gpu(&self) -> bool {
        self.gpu_split.iter().sum::<i32>() > 0
    }

    /// Total number of GPU layers across all devices.
    pub fn gpu_layers(&self) -> i32 {
        self.gpu_split.iter().sum()
    }

    /// The batch size actually used for evaluation.
    ///
    /// GPU slots are forced up to [`GPU_MIN_BATCH`]; CPU slots with no
    /// explicit batch size use the full context length.
    pub fn effective_batch(&self) -> usize {
        if self.is_gpu() {
            self.batch_size.max(GPU_MIN_BATCH)
        } else if self.batch_size == 0 {
            self.context_length
        } else {
            self.batch_size
        }
        .max(1)
    }

    /// Load a slot configuration from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&raw)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = SlotConfig::default();
        assert_eq!(config.context_length, 1024);
        assert_eq!(config.n_predict, 512);
        assert!(!config.is_gpu());
        assert_eq!(config.effective_batch(), 1024);
    }

    #[test]
    fn gpu_slot_forces_large_batch() {
        let config = SlotConfig {
            gpu_split: vec![20, 20],
            batch_size: 32,
            ..Default::default()
        };
        assert!(config.is_gpu());
        assert_eq!(config.gpu_layers(), 40);
        assert_eq!(config.effective_batch(), GPU_MIN_BATCH);
    }

    #[test]
    fn explicit_cpu_batch_is_kept() {
        let config = SlotConfig {
            batch_size: 64,
            ..Default::default()
        };
        assert_eq!(config.effective_batch(), 64);
    }

    #[test]
    fn parses_partial_json() {
        let json = r#"{ "context_length": 2048, "gpu_split": [32] }"#;
        let config: SlotConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.context_length, 2048);
        assert!(config.is_gpu());
        assert_eq!(config.n_predict, 512);
    }
}
