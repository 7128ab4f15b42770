use std::collections::{HashMap, HashSet};
use async_trait::async_trait;
use tracing::Instrument;
use uuid::Uuid;
use crate::backend::Backend;
use crate::config::{upper_bounded_default, PipelineConfig};
use crate::context::InputContext;
use crate::error::{PipelineError, Result};
use crate::grammar::GrammarCompiler;
use crate::interfaces::{CacheSeqId, RequestState, TextGenerationResponse, TextGenerationStatus, TokenId};
use crate::kv_cache::KvCacheManager;
use crate::model::{ModelCapabilities, PipelineModel, Sampler};
use super::core_trait::TokenGenerator;
use super::multistep::{run_multistep, LogProbabilityRequest, MultistepCollaborators};

/// Multi-step token generation over a batch of caller-owned contexts.
///
/// The pipeline owns the executor, the sampler, the KV cache manager and the
/// optional grammar compiler. Every mutating operation takes `&mut self`, so a
/// pipeline (and the cache slots it manages) has exactly one driver at a time.
///
/// ## Type Parameters
///
/// * `B` - Tensor backend shared by every collaborator
/// * `C` - Request context type
pub struct TextGenerationPipeline<B, C>
where
    B: Backend,
    C: InputContext + 'static,
{
    pub(super) config: PipelineConfig,
    pub(super) model: Box<dyn PipelineModel<B, C>>,
    pub(super) kv_manager: Box<dyn KvCacheManager<B>>,
    pub(super) sampler: Box<dyn Sampler<B>>,
    pub(super) grammar_compiler: Option<Box<dyn GrammarCompiler>>,
    pub(super) eos_token_ids: HashSet<TokenId>,
    pub(super) capabilities: ModelCapabilities,
    /// Model limit, already bounded by `config.max_length`
    pub(super) max_seq_len: usize,
    pub(super) device: B::Device,
    request_states: HashMap<CacheSeqId, TextGenerationStatus>,
}

impl<B, C> TextGenerationPipeline<B, C>
where
    B: Backend,
    C: InputContext + 'static,
{
    /// Creates a new pipeline.
    ///
    /// The executor's capabilities and sequence limit are read here, once.
    ///
    /// # Parameters
    ///
    /// * `config` - Pipeline configuration
    /// * `model` - Compiled model executor
    /// * `kv_manager` - Cache slot manager the pipeline takes ownership of
    /// * `sampler` - Device-side sampler
    /// * `eos_token_ids` - Tokens that end a sequence, see [`resolve_eos_token_ids`](crate::config::resolve_eos_token_ids)
    /// * `grammar_compiler` - Required when structured output is enabled
    ///
    /// # Returns
    ///
    /// [`PipelineError::Config`] if the configuration is invalid, exceeds the
    /// model limit, or asks for structured output without a compiler
    pub fn new(
        config: PipelineConfig,
        model: Box<dyn PipelineModel<B, C>>,
        kv_manager: Box<dyn KvCacheManager<B>>,
        sampler: Box<dyn Sampler<B>>,
        eos_token_ids: HashSet<TokenId>,
        grammar_compiler: Option<Box<dyn GrammarCompiler>>,
    ) -> Result<Self> {
        config.validate()?;

        if config.sampling_config.enable_structured_output && grammar_compiler.is_none() {
            return Err(PipelineError::Config(
                "structured output is enabled but no grammar compiler was provided".into(),
            ));
        }

        let device = model
            .devices()
            .first()
            .cloned()
            .ok_or_else(|| PipelineError::Config("model reports no devices".into()))?;
        let capabilities = model.capabilities();
        let max_seq_len = upper_bounded_default(model.calculate_max_seq_len(), config.max_length)?;

        tracing::debug!(?capabilities, max_seq_len, eos_token_ids = ?eos_token_ids, "text generation pipeline ready");

        Ok(Self {
            config,
            model,
            kv_manager,
            sampler,
            grammar_compiler,
            eos_token_ids,
            capabilities,
            max_seq_len,
            device,
            request_states: HashMap::new(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn capabilities(&self) -> ModelCapabilities {
        self.capabilities
    }

    /// Longest sequence any request may reach.
    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    pub fn kv_manager(&self) -> &dyn KvCacheManager<B> {
        self.kv_manager.as_ref()
    }

    /// Lifecycle state of the slot keyed by `cache_seq_id`.
    pub fn request_state(&self, cache_seq_id: CacheSeqId) -> RequestState {
        match self.request_states.get(&cache_seq_id) {
            Some(status) => RequestState::from(*status),
            None if self.kv_manager.contains(cache_seq_id) => RequestState::Active,
            None => RequestState::Unclaimed,
        }
    }

    /// Run up to `num_steps` decode steps for every context in `batch`.
    ///
    /// The step count is clamped to `max_num_steps` and so that no context
    /// passes its length bound. All steps run on the device; generated tokens
    /// are copied to the host once, committed to the cache manager and written
    /// into the contexts.
    ///
    /// # Parameters
    ///
    /// * `batch` - Contexts to advance; each must have a distinct cache id
    /// * `num_steps` - Requested number of decode steps
    ///
    /// # Returns
    ///
    /// A response per request id holding its new tokens and status. A
    /// configuration error aborts the whole call and names the request.
    #[tracing::instrument(name = "next_token", skip_all, fields(batch_size = batch.len(), num_steps = num_steps))]
    pub async fn next_token(
        &mut self,
        batch: &mut [C],
        num_steps: usize,
    ) -> Result<HashMap<Uuid, TextGenerationResponse>> {
        if batch.is_empty() {
            return Ok(HashMap::new());
        }
        if num_steps == 0 {
            return Err(PipelineError::Config("num_steps must be at least 1".into()));
        }
        let num_steps = if num_steps > self.config.max_num_steps {
            tracing::debug!(requested = num_steps, max_num_steps = self.config.max_num_steps, "clamping step count");
            self.config.max_num_steps
        } else {
            num_steps
        };

        let log_request = self.log_probability_request(batch);

        let prepared = self.prepare_batch(batch, num_steps)?;
        for context in batch.iter() {
            self.request_states.insert(context.cache_seq_id(), TextGenerationStatus::Active);
        }

        let bitmask = prepared
            .bitmask
            .as_ref()
            .map(|mask| B::from_mask(mask.to_bool_mask(), mask.batch_size(), mask.vocab_size(), &self.device))
            .transpose()?;

        let max_lengths = prepared.max_lengths;
        let steps = prepared.num_steps;
        let collaborators = MultistepCollaborators {
            model: self.model.as_ref(),
            kv_manager: self.kv_manager.as_mut(),
            sampler: self.sampler.as_ref(),
            device: &self.device,
            capabilities: self.capabilities,
        };
        let output = run_multistep(collaborators, prepared.model_inputs, steps, bitmask, &log_request, batch.len())
            .instrument(tracing::debug_span!("multistep_execution_loop", num_steps = steps))
            .await?;

        let responses = self.finalize(batch, output, steps, &max_lengths)?;
        for context in batch.iter() {
            if let Some(response) = responses.get(&context.request_id()) {
                self.request_states.insert(context.cache_seq_id(), response.final_status());
            }
        }
        Ok(responses)
    }

    /// Free the cache slot held by `context`.
    ///
    /// Releasing a context that holds no slot is a no-op.
    pub fn release(&mut self, context: &C) -> Result<()> {
        let cache_seq_id = context.cache_seq_id();
        self.request_states.remove(&cache_seq_id);
        if !self.kv_manager.contains(cache_seq_id) {
            tracing::debug!(request_id = %context.request_id(), cache_seq_id, "release of unclaimed cache slot ignored");
            return Ok(());
        }
        self.kv_manager.release(cache_seq_id)?;
        tracing::debug!(request_id = %context.request_id(), cache_seq_id, "released cache slot");
        Ok(())
    }

    /// Collect per-context log-probability settings, disabling them up front
    /// when the executor cannot compute them.
    fn log_probability_request(&self, batch: &mut [C]) -> LogProbabilityRequest {
        let request = LogProbabilityRequest {
            batch_top_n: batch.iter().map(|c| c.log_probabilities()).collect(),
            batch_echo: batch.iter().map(|c| c.log_probabilities_echo()).collect(),
        };
        if request.requested() && !self.capabilities.log_probabilities {
            tracing::warn!("log probabilities were requested but the model cannot compute them");
            for context in batch.iter_mut().filter(|c| c.log_probabilities() > 0) {
                context.disable_log_probabilities();
            }
        }
        request
    }
}

#[async_trait]
impl<B, C> TokenGenerator<C> for TextGenerationPipeline<B, C>
where
    B: Backend,
    C: InputContext + 'static,
{
    async fn next_token(
        &mut self,
        batch: &mut [C],
        num_steps: usize,
    ) -> Result<HashMap<Uuid, TextGenerationResponse>> {
        TextGenerationPipeline::next_token(self, batch, num_steps).await
    }

    fn release(&mut self, context: &C) -> Result<()> {
        TextGenerationPipeline::release(self, context)
    }
}
