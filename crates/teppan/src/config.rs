//! # Pipeline Configuration
//!
//! [`PipelineConfig`] collects the knobs the pipelines read at construction and
//! on every call. It deserializes from JSON with every field optional, so a
//! deployment only spells out what it changes:
//!
//! ```rust
//! use teppan::config::PipelineConfig;
//!
//! let config = PipelineConfig::from_json_str(r#"{
//!     "max_length": 2048,
//!     "max_num_steps": 8,
//!     "sampling_config": { "enable_structured_output": true },
//!     "safe_vram_usage_limits": { "LlamaForCausalLM": 0.96 }
//! }"#).unwrap();
//!
//! assert_eq!(config.max_num_steps, 8);
//! assert!(config.sampling_config.enable_structured_output);
//! ```
//!
//! Safe VRAM usage limits are keyed by architecture name and injected here
//! rather than looked up from a table inside the crate.

use std::collections::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::error::{PipelineError, Result};
use crate::interfaces::TokenId;

/// Smallest batch size [`PipelineConfig::infer_optimal_batch_size`] returns.
pub const MIN_DEFAULT_BATCH_SIZE: usize = 1;

/// Largest batch size [`PipelineConfig::infer_optimal_batch_size`] returns.
pub const MAX_DEFAULT_BATCH_SIZE: usize = 4096;

/// Sampling options shared by every request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Allow requests to carry a JSON schema and decode under its grammar.
    pub enable_structured_output: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upper bound on prompt plus completion length. `None` uses the model limit.
    pub max_length: Option<usize>,

    /// Upper bound on decode steps run per `next_token` call.
    pub max_num_steps: usize,

    /// Build the executor to return full-sequence logits.
    pub enable_echo: bool,

    /// Embeddings are pooled by the model; otherwise padded rows are trimmed.
    pub pool_embeddings: bool,

    pub sampling_config: SamplingConfig,

    /// Fraction of free device memory the KV cache may use, per architecture.
    pub safe_vram_usage_limits: HashMap<String, f64>,

    /// Fraction used for architectures missing from `safe_vram_usage_limits`.
    pub default_safe_vram_usage_limit: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_length: None,
            max_num_steps: 10,
            enable_echo: false,
            pool_embeddings: true,
            sampling_config: SamplingConfig::default(),
            safe_vram_usage_limits: HashMap::new(),
            default_safe_vram_usage_limit: 1.0,
        }
    }
}

/// Shape of one sequence's KV cache, used to size batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvCacheFootprint {
    pub num_layers: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    pub dtype_size_in_bytes: usize,
}

impl KvCacheFootprint {
    /// Bytes of key and value storage one sequence of `max_seq_len` tokens needs.
    pub fn bytes_per_sequence(&self, max_seq_len: usize) -> u64 {
        2 * self.num_layers as u64
            * self.n_kv_heads as u64
            * self.head_dim as u64
            * self.dtype_size_in_bytes as u64
            * max_seq_len as u64
    }
}

impl PipelineConfig {
    /// Parse and validate a JSON document.
    ///
    /// # Parameters
    ///
    /// * `json` - Configuration document; missing fields take their defaults
    ///
    /// # Returns
    ///
    /// The validated configuration or [`PipelineError::Config`]
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no pipeline can run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_num_steps == 0 {
            return Err(PipelineError::Config("max_num_steps must be at least 1".into()));
        }
        if self.max_length == Some(0) {
            return Err(PipelineError::Config("max_length must be at least 1".into()));
        }
        let limits = self
            .safe_vram_usage_limits
            .iter()
            .map(|(arch, limit)| (arch.as_str(), *limit))
            .chain(std::iter::once(("default", self.default_safe_vram_usage_limit)));
        for (arch, limit) in limits {
            if !(limit > 0.0 && limit <= 1.0) {
                return Err(PipelineError::Config(format!(
                    "safe VRAM usage limit for {} must be in (0, 1], got {}",
                    arch, limit
                )));
            }
        }
        Ok(())
    }

    /// Safe VRAM usage limit for `architecture`.
    pub fn safe_vram_usage_limit(&self, architecture: &str) -> f64 {
        self.safe_vram_usage_limits
            .get(architecture)
            .copied()
            .unwrap_or(self.default_safe_vram_usage_limit)
    }

    /// Estimate how many sequences fit in the KV cache at once.
    ///
    /// Models without a KV cache (`footprint` is `None`) and models placed
    /// only on the host always get a batch size of 1.
    ///
    /// # Parameters
    ///
    /// * `architecture` - Model architecture, used to look up the VRAM limit
    /// * `available_cache_memory` - Free device bytes for the KV cache
    /// * `footprint` - Per-sequence cache shape, if the model uses a KV cache
    /// * `max_seq_len` - Longest sequence the model accepts
    /// * `host_only` - The model runs on a single host device
    ///
    /// # Returns
    ///
    /// A batch size clamped to `[MIN_DEFAULT_BATCH_SIZE, MAX_DEFAULT_BATCH_SIZE]`
    pub fn infer_optimal_batch_size(
        &self,
        architecture: &str,
        available_cache_memory: u64,
        footprint: Option<&KvCacheFootprint>,
        max_seq_len: usize,
        host_only: bool,
    ) -> usize {
        let footprint = match footprint {
            Some(footprint) if !host_only => footprint,
            _ => return MIN_DEFAULT_BATCH_SIZE,
        };

        let usable = available_cache_memory as f64 * self.safe_vram_usage_limit(architecture);
        let per_sequence = footprint.bytes_per_sequence(max_seq_len);
        let inferred = if per_sequence == 0 {
            MAX_DEFAULT_BATCH_SIZE
        } else {
            (usable / per_sequence as f64).floor() as usize
        };
        inferred.clamp(MIN_DEFAULT_BATCH_SIZE, MAX_DEFAULT_BATCH_SIZE)
    }
}

/// Pick `default`, or `upper_bound` when no default is given.
///
/// # Returns
///
/// [`PipelineError::Config`] if `default` exceeds `upper_bound`
pub fn upper_bounded_default(upper_bound: usize, default: Option<usize>) -> Result<usize> {
    match default {
        None => Ok(upper_bound),
        Some(value) if value > upper_bound => Err(PipelineError::Config(format!(
            "default value provided ({}) exceeds the upper bound ({})",
            value, upper_bound
        ))),
        Some(value) => Ok(value),
    }
}

/// Build the set of end-of-sequence ids.
///
/// `model_eos` is the `eos_token_id` entry of the model's configuration, which
/// may be a single id or a list. A list that contains `provided` is used as a
/// whole; anything else falls back to `provided` alone.
pub fn resolve_eos_token_ids(provided: TokenId, model_eos: Option<&Value>) -> HashSet<TokenId> {
    let Some(model_eos) = model_eos else {
        return HashSet::from([provided]);
    };

    match model_eos {
        Value::Number(n) => {
            if n.as_i64() != Some(provided) {
                tracing::warn!(
                    model_eos_token_id = %n,
                    provided,
                    "eos_token_id in model config does not match provided eos_token_id, using provided eos_token_id"
                );
            }
            HashSet::from([provided])
        }
        Value::Array(ids) => {
            let ids: HashSet<TokenId> = ids.iter().filter_map(Value::as_i64).collect();
            if ids.contains(&provided) {
                ids
            } else {
                HashSet::from([provided])
            }
        }
        other => {
            tracing::warn!(model_eos_token_id = %other, "eos_token_id in model config is neither int nor list");
            HashSet::from([provided])
        }
    }
}
