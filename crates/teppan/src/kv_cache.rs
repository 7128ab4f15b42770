//! # KV Cache Contract
//!
//! The pipeline consumes the cache storage engine only through
//! [`KvCacheManager`]. Slots are keyed by [`CacheSeqId`] and exclusively owned
//! between `external_claim` and `release`.
//!
//! Callers must serialize access to one manager: every mutating operation
//! takes `&mut self`, and the pipeline that owns the manager exposes the same
//! single-writer requirement through `&mut self` on `next_token`.

use std::collections::BTreeMap;
use crate::backend::Backend;
use crate::error::Result;
use crate::interfaces::{CacheSeqId, TokenId};
use crate::model::ModelInputs;

/// Opaque per-device cache handles passed to the model executor.
#[derive(Debug, Clone)]
pub struct KvCacheInputs<B> {
    pub tensors: Vec<B>,
}

impl<B> KvCacheInputs<B> {
    pub fn new(tensors: Vec<B>) -> Self {
        Self { tensors }
    }
}

/// How much of one pending prompt the cache already held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrimmedPrompt {
    /// Tokens that still need to run through the model.
    pub tokens: Vec<TokenId>,

    /// Number of leading tokens dropped because their KV entries already exist.
    pub bump: usize,
}

impl TrimmedPrompt {
    pub fn new(tokens: Vec<TokenId>, bump: usize) -> Self {
        Self { tokens, bump }
    }
}

/// Result of [`KvCacheManager::fetch`].
#[derive(Debug, Clone)]
pub struct FetchedCache<B> {
    /// One entry per device.
    pub kv_cache_inputs: Vec<KvCacheInputs<B>>,

    /// The trimmed pending tokens of every fetched sequence.
    pub trimmed: BTreeMap<CacheSeqId, TrimmedPrompt>,
}

/// Claim/fetch/increment/step/release contract of the cache storage engine.
pub trait KvCacheManager<B>: Send
where B: Backend
{
    /// Whether `seq_id` currently owns a slot.
    fn contains(&self, seq_id: CacheSeqId) -> bool;

    /// Reserve slots for ids that do not own one yet.
    fn external_claim(&mut self, seq_ids: &[CacheSeqId]) -> Result<()>;

    /// Build cache inputs for the pending tokens of each claimed sequence.
    ///
    /// Prompt prefixes already resident in cache are trimmed; the trimmed
    /// tokens and the number dropped are returned per id.
    fn fetch(
        &mut self,
        seq_ids_and_prompts: &BTreeMap<CacheSeqId, Vec<TokenId>>,
        num_steps: usize,
    ) -> Result<FetchedCache<B>>;

    /// Extend every fetched slot by the tokens consumed in `prev_model_inputs`.
    ///
    /// Called between decode steps; must not read device values back to the host.
    fn increment_cache_lengths(
        &mut self,
        kv_cache_inputs: Vec<KvCacheInputs<B>>,
        prev_model_inputs: &ModelInputs<B>,
    ) -> Result<Vec<KvCacheInputs<B>>>;

    /// Commit the tokens generated during a call.
    fn step(&mut self, seq_ids_and_new_tokens: &BTreeMap<CacheSeqId, Vec<TokenId>>) -> Result<()>;

    /// Free the slot owned by `seq_id`.
    fn release(&mut self, seq_id: CacheSeqId) -> Result<()>;
}
