use crate::backend::Backend;
use crate::context::InputContext;
use crate::error::{PipelineError, Result};
use crate::interfaces::LogProbabilities;
use crate::kv_cache::KvCacheManager;
use crate::model::{ModelCapabilities, ModelInputs, PipelineModel, Sampler};
use crate::tensor::operations::{expect_generated_tokens, expect_sampled_tokens};

/// Log-probability settings of each batch row.
#[derive(Debug, Clone, Default)]
pub(crate) struct LogProbabilityRequest {
    pub batch_top_n: Vec<usize>,
    pub batch_echo: Vec<bool>,
}

impl LogProbabilityRequest {
    pub fn requested(&self) -> bool {
        self.batch_top_n.iter().any(|n| *n > 0)
    }

    /// Whether any row that asked for log-probabilities also asked for echo.
    pub fn echo(&self) -> bool {
        self.batch_top_n.iter().zip(&self.batch_echo).any(|(top_n, echo)| *top_n > 0 && *echo)
    }
}

/// Borrowed pieces of the pipeline the loop drives.
pub(crate) struct MultistepCollaborators<'a, B, C>
where B: Backend
{
    pub model: &'a dyn PipelineModel<B, C>,
    pub kv_manager: &'a mut dyn KvCacheManager<B>,
    pub sampler: &'a dyn Sampler<B>,
    pub device: &'a B::Device,
    pub capabilities: ModelCapabilities,
}

#[derive(Debug)]
pub(crate) struct MultistepOutput<B> {
    /// `(batch, num_steps)` sampled tokens, still on the device.
    pub generated_tokens: B,

    /// One entry per step when log-probabilities were requested, else empty.
    pub log_probabilities: Vec<Option<Vec<Option<LogProbabilities>>>>,
}

/// Run `num_steps` decode steps without reading anything back to the host.
///
/// Each step executes the model, samples under the optional bitmask and
/// appends to the generated-token buffer. Between steps the cache lengths are
/// incremented and the next inputs are derived from the sampled tokens.
pub(crate) async fn run_multistep<B, C>(
    collaborators: MultistepCollaborators<'_, B, C>,
    model_inputs: ModelInputs<B>,
    num_steps: usize,
    bitmask: Option<B>,
    log_request: &LogProbabilityRequest,
    batch_size: usize,
) -> Result<MultistepOutput<B>>
where
    B: Backend,
    C: InputContext,
{
    let MultistepCollaborators { model, kv_manager, sampler, device, capabilities } = collaborators;

    let mut generated_tokens = B::empty_token_buffer(batch_size, device)?;
    let mut log_probabilities = Vec::new();
    let mut echo_warned = false;
    let mut curr_step_inputs = model_inputs;

    for step in 0..num_steps {
        let span = tracing::trace_span!("step", step);
        let model_outputs = model.execute(&curr_step_inputs).await?;

        let new_tokens = span.in_scope(|| -> Result<B> {
            let logits = model_outputs
                .next_token_logits
                .as_ref()
                .ok_or_else(|| PipelineError::invariant("model returned no next token logits"))?;

            let (new_tokens, new_generated_tokens) = sampler.sample(logits, &generated_tokens, bitmask.as_ref())?;
            expect_sampled_tokens(&new_tokens, batch_size)?;
            expect_generated_tokens(&new_generated_tokens, batch_size, step + 1)?;
            generated_tokens = new_generated_tokens;

            if log_request.requested() {
                let step_log_probabilities = if !capabilities.log_probabilities {
                    None
                } else if log_request.echo() && model_outputs.logits.is_none() {
                    if capabilities.echo {
                        return Err(PipelineError::invariant(
                            "echo was enabled but the model returned no full-sequence logits",
                        ));
                    }
                    if !echo_warned {
                        tracing::warn!("log probabilities with echo need full logits; start the model with echo enabled");
                        echo_warned = true;
                    }
                    None
                } else {
                    model.compute_log_probabilities(
                        &curr_step_inputs,
                        &model_outputs,
                        &new_tokens,
                        &log_request.batch_top_n,
                        &log_request.batch_echo,
                    )?
                };
                log_probabilities.push(step_log_probabilities);
            }
            Ok(new_tokens)
        })?;

        // The last step's inputs are never used.
        if step + 1 == num_steps {
            break;
        }

        curr_step_inputs = span.in_scope(|| -> Result<ModelInputs<B>> {
            if let Some(kv_cache_inputs) = curr_step_inputs.kv_cache_inputs.clone() {
                let incremented = kv_manager.increment_cache_lengths(kv_cache_inputs, &curr_step_inputs)?;
                curr_step_inputs.kv_cache_inputs = Some(incremented);
            }
            model.prepare_next_token_inputs(&new_tokens, curr_step_inputs)
        })?;
    }

    Ok(MultistepOutput { generated_tokens, log_probabilities })
}
