//! Mock collaborators for unit tests.
//!
//! Every mock records what it does on a shared [`MockDevice`], so tests can
//! assert the order of executions, cache increments and host reads.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use serde_json::Value;
use crate::autoregressive::TextGenerationPipeline;
use crate::backend::mock_tensor::{MockDevice, MockTensor};
use crate::backend::Backend;
use crate::config::PipelineConfig;
use crate::context::{InputContext, TextContext};
use crate::error::{GrammarError, PipelineError, Result};
use crate::grammar::{GrammarCompiler, GrammarMatcher};
use crate::interfaces::{CacheSeqId, LogProbabilities, TokenId};
use crate::kv_cache::{FetchedCache, KvCacheInputs, KvCacheManager, TrimmedPrompt};
use crate::model::{ModelCapabilities, ModelInputs, ModelOutputs, PipelineModel, Sampler};
use crate::tensor::TokenBitmask;

pub(crate) const VOCAB_SIZE: usize = 64;
pub(crate) const MAX_SEQ_LEN: usize = 128;
pub(crate) const EOS: TokenId = 2;

pub(crate) struct MockModel {
    devices: Vec<MockDevice>,
    max_seq_len: usize,
    capabilities: ModelCapabilities,
    full_logits: bool,
    fail_execute: Arc<AtomicBool>,
}

impl MockModel {
    pub fn new(device: &MockDevice) -> Self {
        Self {
            devices: vec![device.clone()],
            max_seq_len: MAX_SEQ_LEN,
            capabilities: ModelCapabilities::default(),
            full_logits: false,
            fail_execute: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_capabilities(mut self, capabilities: ModelCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_full_logits(mut self) -> Self {
        self.full_logits = true;
        self
    }

    /// Flag that makes every later `execute` fail.
    pub fn fail_switch(&self) -> Arc<AtomicBool> {
        self.fail_execute.clone()
    }

    fn device(&self) -> &MockDevice {
        &self.devices[0]
    }
}

#[async_trait]
impl<C> PipelineModel<MockTensor, C> for MockModel
where C: InputContext
{
    fn capabilities(&self) -> ModelCapabilities {
        self.capabilities
    }

    fn devices(&self) -> &[MockDevice] {
        &self.devices
    }

    fn calculate_max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    fn prepare_initial_token_inputs(
        &self,
        context_batch: &[C],
        kv_cache_inputs: Option<Vec<KvCacheInputs<MockTensor>>>,
    ) -> Result<ModelInputs<MockTensor>> {
        self.device().record("prepare_initial");
        let tokens: Vec<TokenId> = context_batch.iter().flat_map(|c| c.next_tokens().to_vec()).collect();
        let mut offsets = vec![0];
        for context in context_batch {
            offsets.push(offsets[offsets.len() - 1] + context.active_length() as TokenId);
        }
        Ok(ModelInputs {
            tokens: MockTensor::from_tokens(&tokens, self.device()),
            input_row_offsets: MockTensor::from_tokens(&offsets, self.device()),
            signal_buffers: vec![],
            kv_cache_inputs,
        })
    }

    fn prepare_next_token_inputs(
        &self,
        next_tokens: &MockTensor,
        prev_model_inputs: ModelInputs<MockTensor>,
    ) -> Result<ModelInputs<MockTensor>> {
        self.device().record("prepare_next");
        let batch_size = next_tokens.shape()[0];
        let offsets: Vec<TokenId> = (0..=batch_size as TokenId).collect();
        Ok(ModelInputs {
            tokens: next_tokens.clone(),
            input_row_offsets: MockTensor::from_tokens(&offsets, self.device()),
            signal_buffers: prev_model_inputs.signal_buffers,
            kv_cache_inputs: prev_model_inputs.kv_cache_inputs,
        })
    }

    async fn execute(&self, model_inputs: &ModelInputs<MockTensor>) -> Result<ModelOutputs<MockTensor>> {
        self.device().record("execute");
        if self.fail_execute.load(Ordering::SeqCst) {
            return Err(PipelineError::Execution("device lost".into()));
        }
        let batch_size = model_inputs.input_row_offsets.shape()[0] - 1;
        let total_tokens = model_inputs.tokens.shape()[0];
        Ok(ModelOutputs {
            next_token_logits: Some(MockTensor::zeros(vec![batch_size, VOCAB_SIZE], self.device())),
            logits: self
                .full_logits
                .then(|| MockTensor::zeros(vec![total_tokens, VOCAB_SIZE], self.device())),
        })
    }

    fn compute_log_probabilities(
        &self,
        _model_inputs: &ModelInputs<MockTensor>,
        _model_outputs: &ModelOutputs<MockTensor>,
        _next_tokens: &MockTensor,
        batch_top_n: &[usize],
        _batch_echo: &[bool],
    ) -> Result<Option<Vec<Option<LogProbabilities>>>> {
        self.device().record("log_probabilities");
        Ok(Some(
            batch_top_n
                .iter()
                .map(|n| {
                    (*n > 0).then(|| LogProbabilities {
                        token_log_probabilities: vec![-0.5],
                        top_log_probabilities: vec![HashMap::new()],
                    })
                })
                .collect(),
        ))
    }
}

/// Masks seen by the sampler, one entry per `sample` call.
pub(crate) type SeenMasks = Arc<Mutex<Vec<Option<Vec<u8>>>>>;

/// Emits scripted tokens per row. Unscripted positions emit `10 + row`.
///
/// When a mask forbids the scripted token the first allowed token is used.
pub(crate) struct ScriptedSampler {
    device: MockDevice,
    script: HashMap<usize, Vec<TokenId>>,
    masks: SeenMasks,
    malformed: bool,
}

impl ScriptedSampler {
    pub fn new(device: &MockDevice) -> Self {
        Self { device: device.clone(), script: HashMap::new(), masks: Default::default(), malformed: false }
    }

    pub fn with_script(mut self, row: usize, tokens: Vec<TokenId>) -> Self {
        self.script.insert(row, tokens);
        self
    }

    /// Return next tokens with an extra dimension.
    pub fn malformed(mut self) -> Self {
        self.malformed = true;
        self
    }

    pub fn masks(&self) -> SeenMasks {
        self.masks.clone()
    }
}

impl Sampler<MockTensor> for ScriptedSampler {
    fn sample(
        &self,
        logits: &MockTensor,
        prev_tokens: &MockTensor,
        bitmask: Option<&MockTensor>,
    ) -> Result<(MockTensor, MockTensor)> {
        self.device.record("sample");
        let (batch_size, vocab_size) = (logits.shape[0], logits.shape[1]);
        let step = prev_tokens.shape[1];
        self.masks
            .lock()
            .unwrap()
            .push(bitmask.map(|m| m.data.iter().map(|v| *v as u8).collect()));

        let tokens: Vec<TokenId> = (0..batch_size)
            .map(|row| {
                let scripted = self
                    .script
                    .get(&row)
                    .and_then(|s| s.get(step))
                    .copied()
                    .unwrap_or(10 + row as TokenId);
                match bitmask {
                    Some(mask) => {
                        let allowed = &mask.data[row * vocab_size..(row + 1) * vocab_size];
                        if allowed.get(scripted as usize) == Some(&1.0) {
                            scripted
                        } else {
                            allowed.iter().position(|v| *v == 1.0).unwrap_or(0) as TokenId
                        }
                    }
                    None => scripted,
                }
            })
            .collect();

        let generated = prev_tokens.append_column(&tokens);
        if self.malformed {
            return Ok((MockTensor::zeros(vec![batch_size, 1], &self.device), generated));
        }
        Ok((MockTensor::from_tokens(&tokens, &self.device), generated))
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct KvState {
    pub claimed: BTreeSet<CacheSeqId>,
    pub claim_calls: Vec<Vec<CacheSeqId>>,
    pub cached_prefix: HashMap<CacheSeqId, usize>,
    pub fetch_calls: Vec<BTreeMap<CacheSeqId, Vec<TokenId>>>,
    pub increments: usize,
    pub committed: BTreeMap<CacheSeqId, Vec<TokenId>>,
    pub released: Vec<CacheSeqId>,
}

/// Cache manager whose state is shared with the test that built it.
#[derive(Clone)]
pub(crate) struct MockKvManager {
    device: MockDevice,
    state: Arc<Mutex<KvState>>,
}

impl MockKvManager {
    pub fn new(device: &MockDevice) -> Self {
        Self { device: device.clone(), state: Default::default() }
    }

    pub fn state(&self) -> KvState {
        self.state.lock().unwrap().clone()
    }

    /// Make the next fetch of `seq_id` report `len` tokens as already cached.
    pub fn set_cached_prefix(&self, seq_id: CacheSeqId, len: usize) {
        self.state.lock().unwrap().cached_prefix.insert(seq_id, len);
    }
}

impl KvCacheManager<MockTensor> for MockKvManager {
    fn contains(&self, seq_id: CacheSeqId) -> bool {
        self.state.lock().unwrap().claimed.contains(&seq_id)
    }

    fn external_claim(&mut self, seq_ids: &[CacheSeqId]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for seq_id in seq_ids {
            if !state.claimed.insert(*seq_id) {
                return Err(PipelineError::Cache(format!("cache id {} claimed twice", seq_id)));
            }
        }
        state.claim_calls.push(seq_ids.to_vec());
        Ok(())
    }

    fn fetch(
        &mut self,
        seq_ids_and_prompts: &BTreeMap<CacheSeqId, Vec<TokenId>>,
        _num_steps: usize,
    ) -> Result<FetchedCache<MockTensor>> {
        let mut state = self.state.lock().unwrap();
        state.fetch_calls.push(seq_ids_and_prompts.clone());

        let mut trimmed = BTreeMap::new();
        for (seq_id, prompt) in seq_ids_and_prompts {
            if !state.claimed.contains(seq_id) {
                return Err(PipelineError::Cache(format!("fetch of unclaimed cache id {}", seq_id)));
            }
            let prefix = state.cached_prefix.remove(seq_id).unwrap_or(0);
            let bump = prefix.min(prompt.len().saturating_sub(1));
            trimmed.insert(*seq_id, TrimmedPrompt::new(prompt[bump..].to_vec(), bump));
        }
        Ok(FetchedCache {
            kv_cache_inputs: vec![KvCacheInputs::new(vec![MockTensor::zeros(vec![1], &self.device)])],
            trimmed,
        })
    }

    fn increment_cache_lengths(
        &mut self,
        kv_cache_inputs: Vec<KvCacheInputs<MockTensor>>,
        _prev_model_inputs: &ModelInputs<MockTensor>,
    ) -> Result<Vec<KvCacheInputs<MockTensor>>> {
        self.device.record("increment");
        self.state.lock().unwrap().increments += 1;
        Ok(kv_cache_inputs)
    }

    fn step(&mut self, seq_ids_and_new_tokens: &BTreeMap<CacheSeqId, Vec<TokenId>>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for (seq_id, tokens) in seq_ids_and_new_tokens {
            state.committed.entry(*seq_id).or_default().extend(tokens);
        }
        Ok(())
    }

    fn release(&mut self, seq_id: CacheSeqId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.claimed.remove(&seq_id) {
            return Err(PipelineError::Cache(format!("release of unclaimed cache id {}", seq_id)));
        }
        state.released.push(seq_id);
        Ok(())
    }
}

/// Compiles schemas of the form `{"enum": [ids...], "prefix": [ids...]}`.
///
/// `enum` lists the tokens the matcher allows; `prefix` is reported once as
/// jump-ahead tokens. Anything else fails to compile.
pub(crate) struct MockGrammarCompiler;

impl GrammarCompiler for MockGrammarCompiler {
    fn vocab_size(&self) -> usize {
        VOCAB_SIZE
    }

    fn compile_json_schema(&self, schema: &str) -> std::result::Result<Box<dyn GrammarMatcher>, GrammarError> {
        let value: Value = serde_json::from_str(schema).map_err(|e| GrammarError(e.to_string()))?;
        let ids = |key: &str| -> Option<Vec<TokenId>> {
            value.get(key)?.as_array().map(|a| a.iter().filter_map(Value::as_i64).collect())
        };
        let allowed = ids("enum").ok_or_else(|| GrammarError("schema has no enum".into()))?;
        Ok(Box::new(MockMatcher { allowed, jump: ids("prefix").unwrap_or_default(), accepted: vec![] }))
    }
}

#[derive(Debug)]
pub(crate) struct MockMatcher {
    allowed: Vec<TokenId>,
    jump: Vec<TokenId>,
    accepted: Vec<TokenId>,
}

impl GrammarMatcher for MockMatcher {
    fn fill_next_token_bitmask(&self, bitmask: &mut TokenBitmask, row: usize) {
        bitmask.allow_only(row, &self.allowed);
    }

    fn find_jump_forward_tokens(&self) -> Option<Vec<TokenId>> {
        (self.accepted.is_empty() && !self.jump.is_empty()).then(|| self.jump.clone())
    }

    fn accept_token(&mut self, token: TokenId) -> bool {
        self.accepted.push(token);
        true
    }
}

pub(crate) struct Harness {
    pub pipeline: TextGenerationPipeline<MockTensor, TextContext>,
    pub kv: MockKvManager,
    pub masks: SeenMasks,
    pub device: MockDevice,
}

/// A pipeline over default mocks.
pub(crate) fn text_pipeline(config: PipelineConfig) -> Harness {
    let device = MockDevice::default();
    let model = MockModel::new(&device);
    let sampler = ScriptedSampler::new(&device);
    text_pipeline_with(config, model, sampler)
}

/// A pipeline over the given model and sampler, sharing the model's device.
pub(crate) fn text_pipeline_with(config: PipelineConfig, model: MockModel, sampler: ScriptedSampler) -> Harness {
    let device = model.device().clone();
    let kv = MockKvManager::new(&device);
    let masks = sampler.masks();
    let pipeline = TextGenerationPipeline::new(
        config,
        Box::new(model),
        Box::new(kv.clone()),
        Box::new(sampler),
        HashSet::from([EOS]),
        Some(Box::new(MockGrammarCompiler)),
    )
    .unwrap();
    Harness { pipeline, kv, masks, device }
}

/// Config with structured output switched on.
pub(crate) fn structured_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.sampling_config.enable_structured_output = true;
    config
}
