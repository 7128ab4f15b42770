use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;
use crate::backend::Backend;
use crate::config::upper_bounded_default;
use crate::context::InputContext;
use crate::error::{PipelineError, Result};
use crate::interfaces::{CacheSeqId, TokenId};
use crate::model::ModelInputs;
use crate::tensor::TokenBitmask;
use super::pipeline::TextGenerationPipeline;

/// Everything the decode loop needs from preparation.
#[derive(Debug)]
pub(crate) struct PreparedBatch<B> {
    pub model_inputs: ModelInputs<B>,

    /// Requested steps clamped to what every context can still take.
    pub num_steps: usize,

    /// Host-side constraint mask; `None` when no context is constrained.
    pub bitmask: Option<TokenBitmask>,

    /// Resolved length bound of each context, in batch order.
    pub max_lengths: Vec<usize>,
}

/// Clamp `num_steps` to what `context` can still generate.
///
/// A context is rejected as soon as `current_length` reaches `max_length`,
/// even when cached tokens alone would leave room. Otherwise the result is
/// `min(num_steps, max_length - current_length)`, which never exceeds the
/// room left after cached tokens.
///
/// # Returns
///
/// [`PipelineError::LengthExceeded`] when the context has no room left
pub(crate) fn calculate_num_steps<C>(num_steps: usize, context: &C, max_length: usize) -> Result<usize>
where C: InputContext
{
    let current_length = context.current_length();
    if current_length >= max_length {
        return Err(PipelineError::LengthExceeded {
            request_id: context.request_id(),
            cache_seq_id: context.cache_seq_id(),
            current_length,
            active_length: context.active_length(),
            max_length,
        });
    }
    Ok(num_steps.min(max_length - current_length))
}

impl<B, C> TextGenerationPipeline<B, C>
where
    B: Backend,
    C: InputContext + 'static,
{
    /// Validate the batch, claim cache slots, fetch cache inputs and build the
    /// first step's model inputs.
    ///
    /// Every context is validated before any slot is claimed, so a
    /// configuration error leaves the cache manager untouched.
    pub(crate) fn prepare_batch(&mut self, batch: &mut [C], num_steps: usize) -> Result<PreparedBatch<B>> {
        let span = tracing::debug_span!("prepare_batch", batch_size = batch.len(), num_steps);
        let _entered = span.enter();

        check_unique_cache_ids(batch)?;

        let mut num_steps = num_steps;
        let mut max_lengths = Vec::with_capacity(batch.len());
        for context in batch.iter_mut() {
            self.ensure_matcher(context)?;

            if let Some(tokens) = context.matcher().and_then(|m| m.find_jump_forward_tokens()) {
                tracing::debug!(request_id = %context.request_id(), count = tokens.len(), "jump ahead");
                for token in tokens {
                    context.jump_ahead(token);
                }
            }

            let max_length = upper_bounded_default(self.max_seq_len, context.max_length()).map_err(|_| {
                PipelineError::MaxLengthAboveModelLimit {
                    request_id: context.request_id(),
                    requested: context.max_length().unwrap_or_default(),
                    upper_bound: self.max_seq_len,
                }
            })?;
            num_steps = calculate_num_steps(num_steps, &*context, max_length)?;
            max_lengths.push(max_length);
        }

        tracing::debug!("claim_cache_rows");
        let unclaimed: Vec<CacheSeqId> = batch
            .iter()
            .map(|c| c.cache_seq_id())
            .filter(|id| !self.kv_manager.contains(*id))
            .collect();
        if !unclaimed.is_empty() {
            self.kv_manager.external_claim(&unclaimed)?;
            tracing::debug!(cache_seq_ids = ?unclaimed, "claimed cache slots");
        }

        tracing::debug!("fetch_kv_cache");
        let prompts: BTreeMap<CacheSeqId, Vec<TokenId>> = batch
            .iter()
            .map(|c| (c.cache_seq_id(), c.next_tokens().to_vec()))
            .collect();
        let fetched = self.kv_manager.fetch(&prompts, num_steps)?;

        tracing::debug!("trim_prompt");
        for context in batch.iter_mut() {
            let cache_seq_id = context.cache_seq_id();
            let untrimmed = context.active_length();
            let trimmed = fetched.trimmed.get(&cache_seq_id).ok_or_else(|| {
                PipelineError::invariant(format!("cache manager returned no trim result for cache id {}", cache_seq_id))
            })?;
            if trimmed.tokens.len() + trimmed.bump != untrimmed {
                return Err(PipelineError::invariant(format!(
                    "cache id {} trimmed to {} tokens with bump {}, but {} were pending",
                    cache_seq_id,
                    trimmed.tokens.len(),
                    trimmed.bump,
                    untrimmed
                )));
            }
            if trimmed.bump > 0 {
                context.bump_token_indices(trimmed.bump);
                tracing::debug!(request_id = %context.request_id(), bump = trimmed.bump, "trimmed cached prompt prefix");
            }
        }

        let bitmask = self.fill_bitmask(batch);
        let model_inputs = self
            .model
            .prepare_initial_token_inputs(batch, Some(fetched.kv_cache_inputs))?;

        Ok(PreparedBatch { model_inputs, num_steps, bitmask, max_lengths })
    }

    /// Compile the context's schema the first time it is seen.
    ///
    /// Compile failures disable structured output for the context instead of
    /// failing the batch.
    fn ensure_matcher(&self, context: &mut C) -> Result<()> {
        let Some(schema) = context.json_schema() else {
            return Ok(());
        };
        if context.matcher().is_some() {
            return Ok(());
        }

        let compiler = match &self.grammar_compiler {
            Some(compiler) if self.config.sampling_config.enable_structured_output => compiler,
            _ => return Err(PipelineError::StructuredOutputDisabled { request_id: context.request_id() }),
        };

        match compiler.compile_json_schema(schema) {
            Ok(matcher) => context.set_matcher(matcher),
            Err(err) => {
                tracing::warn!(
                    request_id = %context.request_id(),
                    error = %err,
                    "json schema cannot be compiled to a valid grammar, continuing without structured output"
                );
                context.disable_structured_output();
            }
        }
        Ok(())
    }

    /// Allocate and fill the constraint bitmask if any context has a matcher.
    fn fill_bitmask(&self, batch: &[C]) -> Option<TokenBitmask> {
        let compiler = self.grammar_compiler.as_ref()?;
        if !batch.iter().any(|c| c.matcher().is_some()) {
            return None;
        }

        let mut bitmask = TokenBitmask::permissive(batch.len(), compiler.vocab_size());
        for (row, context) in batch.iter().enumerate() {
            if let Some(matcher) = context.matcher() {
                matcher.fill_next_token_bitmask(&mut bitmask, row);
            }
        }
        Some(bitmask)
    }
}

fn check_unique_cache_ids<C>(batch: &[C]) -> Result<()>
where C: InputContext
{
    let mut seen: HashMap<CacheSeqId, Uuid> = HashMap::with_capacity(batch.len());
    for context in batch {
        if let Some(first) = seen.insert(context.cache_seq_id(), context.request_id()) {
            return Err(PipelineError::DuplicateCacheId {
                cache_seq_id: context.cache_seq_id(),
                first,
                second: context.request_id(),
            });
        }
    }
    Ok(())
}
