//! # Embeddings
//!
//! Single-pass encoding of a batch of contexts.
//!
//! Unlike generation there is no decode loop and no KV cache: inputs are
//! prepared once, the model executes once and the output tensor is copied to
//! the host once. The executor's full-sequence output (`logits`) carries the
//! embeddings, either pooled to `(batch, hidden)` or per position as
//! `(batch, padded_len, hidden)`.

use std::collections::HashMap;
use uuid::Uuid;
use crate::backend::Backend;
use crate::config::PipelineConfig;
use crate::context::InputContext;
use crate::error::{PipelineError, Result};
use crate::interfaces::EmbeddingsResponse;
use crate::model::PipelineModel;

/// Encodes batches of contexts into embeddings.
///
/// ## Type Parameters
///
/// * `B` - Tensor backend of the executor
/// * `C` - Request context type
pub struct EmbeddingsPipeline<B, C>
where
    B: Backend,
    C: InputContext,
{
    config: PipelineConfig,
    model: Box<dyn PipelineModel<B, C>>,
}

impl<B, C> EmbeddingsPipeline<B, C>
where
    B: Backend,
    C: InputContext,
{
    pub fn new(config: PipelineConfig, model: Box<dyn PipelineModel<B, C>>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, model })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Encode every context in `batch`.
    ///
    /// With `pool_embeddings` each response has shape `[hidden]`. Without it
    /// the response keeps one row per active token, `[active_length, hidden]`;
    /// padded positions are dropped.
    ///
    /// # Returns
    ///
    /// Embeddings keyed by request id, or [`PipelineError::InvariantViolation`]
    /// when the executor output does not match the batch
    #[tracing::instrument(name = "encode", skip_all, fields(batch_size = batch.len()))]
    pub async fn encode(&self, batch: &[C]) -> Result<HashMap<Uuid, EmbeddingsResponse>> {
        if batch.is_empty() {
            return Ok(HashMap::new());
        }

        let model_inputs = self.model.prepare_initial_token_inputs(batch, None)?;
        let model_outputs = self.model.execute(&model_inputs).await?;
        let output = model_outputs
            .logits
            .ok_or_else(|| PipelineError::invariant("embeddings model returned no output"))?;

        let shape = output.shape();
        let host = output.to_host_f32()?;
        if shape.first() != Some(&batch.len()) || shape.iter().product::<usize>() != host.len() {
            return Err(PipelineError::invariant(format!(
                "embeddings output shape {:?} does not fit batch size {} and {} values",
                shape,
                batch.len(),
                host.len()
            )));
        }

        if self.config.pool_embeddings {
            split_pooled(batch, &shape, &host)
        } else {
            split_per_token(batch, &shape, &host)
        }
    }
}

fn split_pooled<C>(batch: &[C], shape: &[usize], host: &[f32]) -> Result<HashMap<Uuid, EmbeddingsResponse>>
where C: InputContext
{
    let row_len: usize = shape[1..].iter().product();
    let mut responses = HashMap::with_capacity(batch.len());
    for (row, context) in batch.iter().enumerate() {
        responses.insert(
            context.request_id(),
            EmbeddingsResponse {
                embeddings: host[row * row_len..(row + 1) * row_len].to_vec(),
                shape: shape[1..].to_vec(),
            },
        );
    }
    Ok(responses)
}

fn split_per_token<C>(batch: &[C], shape: &[usize], host: &[f32]) -> Result<HashMap<Uuid, EmbeddingsResponse>>
where C: InputContext
{
    let &[_, padded_len, hidden] = shape else {
        return Err(PipelineError::invariant(format!(
            "unpooled embeddings must be (batch, seq, hidden), got {:?}",
            shape
        )));
    };

    let mut responses = HashMap::with_capacity(batch.len());
    for (row, context) in batch.iter().enumerate() {
        let active_length = context.active_length();
        if active_length > padded_len {
            return Err(PipelineError::invariant(format!(
                "request {} has {} active tokens but the output holds {}",
                context.request_id(),
                active_length,
                padded_len
            )));
        }
        let start = row * padded_len * hidden;
        responses.insert(
            context.request_id(),
            EmbeddingsResponse {
                embeddings: host[start..start + active_length * hidden].to_vec(),
                shape: vec![active_length, hidden],
            },
        );
    }
    Ok(responses)
}
