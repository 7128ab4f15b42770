//! # Model Executor Contract
//!
//! [`PipelineModel`] wraps a compiled model graph: it turns a batch of
//! contexts into device inputs, runs the graph, and derives the next step's
//! inputs from sampled tokens without touching host memory. [`Sampler`] maps
//! logits to tokens on the device.
//!
//! What an executor supports is declared once through [`ModelCapabilities`]
//! and read by the pipeline when it is constructed.

use async_trait::async_trait;
use crate::backend::Backend;
use crate::context::InputContext;
use crate::error::Result;
use crate::interfaces::LogProbabilities;
use crate::kv_cache::KvCacheInputs;

/// Device-resident inputs for one decode step.
#[derive(Debug, Clone)]
pub struct ModelInputs<B> {
    /// Flattened token ids of every sequence in the batch.
    pub tokens: B,

    /// Row offsets into `tokens` for ragged batches, or an attention mask for padded ones.
    pub input_row_offsets: B,

    /// Buffers used to synchronize collectives across devices.
    pub signal_buffers: Vec<B>,

    /// Cache handles, one per device. `None` for cache-less executions.
    pub kv_cache_inputs: Option<Vec<KvCacheInputs<B>>>,
}

/// Tensors produced by one model execution.
#[derive(Debug, Clone)]
pub struct ModelOutputs<B> {
    /// Logits for just the next token, `(batch, vocab)`.
    pub next_token_logits: Option<B>,

    /// Logits for the entire token sequence; only returned when echo is enabled.
    pub logits: Option<B>,
}

/// Optional features an executor implements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelCapabilities {
    /// `compute_log_probabilities` is implemented.
    pub log_probabilities: bool,

    /// The graph was built to return full-sequence logits.
    pub echo: bool,
}

/// A compiled model with input preparation and execution.
///
/// ## Type Parameters
///
/// * `B` - Tensor backend shared with the sampler and cache manager
/// * `C` - Request context type the executor reads pending tokens from
#[async_trait]
pub trait PipelineModel<B, C>: Send + Sync
where
    B: Backend,
    C: InputContext,
{
    /// Features this executor supports. Read once by the pipeline.
    fn capabilities(&self) -> ModelCapabilities;

    /// Devices the model runs on; generated tokens live on the first.
    fn devices(&self) -> &[B::Device];

    /// Longest sequence the model accepts.
    fn calculate_max_seq_len(&self) -> usize;

    /// Prepare inputs for the first step of a call.
    ///
    /// Reads each context's pending tokens. `kv_cache_inputs` is `None` when the
    /// caller runs without a KV cache.
    fn prepare_initial_token_inputs(
        &self,
        context_batch: &[C],
        kv_cache_inputs: Option<Vec<KvCacheInputs<B>>>,
    ) -> Result<ModelInputs<B>>;

    /// Prepare inputs for the following step from the tokens just sampled.
    ///
    /// Must reuse device-resident state from `prev_model_inputs` and never
    /// synchronize with the host.
    fn prepare_next_token_inputs(
        &self,
        next_tokens: &B,
        prev_model_inputs: ModelInputs<B>,
    ) -> Result<ModelInputs<B>>;

    /// Run the graph.
    async fn execute(&self, model_inputs: &ModelInputs<B>) -> Result<ModelOutputs<B>>;

    /// Log-probabilities of the sampled tokens for each batch row.
    ///
    /// Only called when [`ModelCapabilities::log_probabilities`] is set. Rows
    /// with a top-n of `0` should be `None`. Returning `Ok(None)` records an
    /// absent result for the whole step.
    fn compute_log_probabilities(
        &self,
        _model_inputs: &ModelInputs<B>,
        _model_outputs: &ModelOutputs<B>,
        _next_tokens: &B,
        _batch_top_n: &[usize],
        _batch_echo: &[bool],
    ) -> Result<Option<Vec<Option<LogProbabilities>>>> {
        Ok(None)
    }
}

/// Maps logits to next tokens on the device.
pub trait Sampler<B>: Send + Sync
where B: Backend
{
    /// Sample one token per row of `logits`, masked by `bitmask` when present.
    ///
    /// Returns the `(batch,)` new tokens and `prev_tokens` with them appended
    /// as a new column. Must not read device values back to the host.
    fn sample(&self, logits: &B, prev_tokens: &B, bitmask: Option<&B>) -> Result<(B, B)>;
}
