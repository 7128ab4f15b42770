use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;
use crate::backend::Backend;
use crate::context::InputContext;
use crate::error::{PipelineError, Result};
use crate::interfaces::{
    CacheSeqId, LogProbabilities, TextGenerationResponse, TextGenerationStatus, TextResponse, TokenId,
};
use super::multistep::MultistepOutput;
use super::pipeline::TextGenerationPipeline;

impl<B, C> TextGenerationPipeline<B, C>
where
    B: Backend,
    C: InputContext + 'static,
{
    /// Copy generated tokens to the host, commit them to the cache manager and
    /// write them into the contexts.
    ///
    /// A context stops consuming its row at the first end-of-sequence token or
    /// when it reaches its length bound. The copied buffer is left untouched.
    pub(crate) fn finalize(
        &mut self,
        batch: &mut [C],
        output: MultistepOutput<B>,
        num_steps: usize,
        max_lengths: &[usize],
    ) -> Result<HashMap<Uuid, TextGenerationResponse>> {
        let span = tracing::debug_span!("finalize", batch_size = batch.len(), num_steps);
        let _entered = span.enter();

        let generated_tokens_host = output.generated_tokens.tokens_to_host()?;
        if generated_tokens_host.len() != batch.len()
            || generated_tokens_host.iter().any(|row| row.len() != num_steps)
        {
            return Err(PipelineError::invariant(format!(
                "generated tokens do not form a [{}, {}] buffer",
                batch.len(),
                num_steps
            )));
        }

        let seq_ids_and_new_tokens: BTreeMap<CacheSeqId, Vec<TokenId>> = batch
            .iter()
            .zip(&generated_tokens_host)
            .map(|(context, row)| (context.cache_seq_id(), row.clone()))
            .collect();
        self.kv_manager.step(&seq_ids_and_new_tokens)?;

        let mut responses = HashMap::with_capacity(batch.len());
        for (batch_index, context) in batch.iter_mut().enumerate() {
            let max_length = max_lengths[batch_index];
            let mut status = TextGenerationStatus::Active;

            for (step, &next_token) in generated_tokens_host[batch_index].iter().enumerate() {
                let log_probs = step_log_probabilities(&output.log_probabilities, step, batch_index);
                let is_eos = self.eos_token_ids.contains(&next_token);
                context.update(next_token, log_probs, is_eos);

                if is_eos {
                    status = TextGenerationStatus::EndOfSequence;
                } else if context.current_length() >= max_length {
                    status = TextGenerationStatus::MaximumLength;
                }
                if status.is_done() {
                    tracing::debug!(request_id = %context.request_id(), ?status, step, "request finished");
                    break;
                }
            }

            let mut response = TextGenerationResponse::new(vec![], status);
            for (token, log_probs) in context.outstanding_completion_tokens() {
                response.append_token(TextResponse::new(token, log_probs));
            }
            responses.insert(context.request_id(), response);
        }
        Ok(responses)
    }
}

fn step_log_probabilities(
    per_step: &[Option<Vec<Option<LogProbabilities>>>],
    step: usize,
    batch_index: usize,
) -> Option<LogProbabilities> {
    per_step
        .get(step)?
        .as_ref()?
        .get(batch_index)
        .cloned()
        .flatten()
}
