//! # Request Context
//!
//! The pipeline never creates or destroys contexts. Callers own them and pass
//! them into each `next_token` call; the pipeline reads lengths and pending
//! tokens and writes generated tokens back through [`InputContext`].
//!
//! [`TextContext`] is the standard implementation: a token history with three
//! cursors.
//!
//! ```text
//!  tokens: [ p0 p1 p2 p3 | g0 g1 g2 ]
//!                  ^start_idx        ^current_length
//!           next_tokens = tokens[start_idx..current_length]
//! ```

use std::collections::HashMap;
use uuid::Uuid;
use crate::grammar::GrammarMatcher;
use crate::interfaces::{CacheSeqId, LogProbabilities, TokenId};

/// Per-request state consumed and mutated by the pipeline.
pub trait InputContext: Send {
    /// Id the response for this request is keyed by.
    fn request_id(&self) -> Uuid;

    /// Key of this request's slot in the KV cache manager.
    fn cache_seq_id(&self) -> CacheSeqId;

    /// Total number of tokens in the history, pending ones included.
    fn current_length(&self) -> usize;

    /// Number of pending tokens that have not run through the model yet.
    fn active_length(&self) -> usize;

    /// Requested length bound, if any.
    fn max_length(&self) -> Option<usize>;

    /// The pending tokens.
    fn next_tokens(&self) -> &[TokenId];

    /// Top-n log-probabilities requested per token; `0` disables them.
    fn log_probabilities(&self) -> usize;

    /// Whether log-probabilities should cover the prompt as well.
    fn log_probabilities_echo(&self) -> bool;

    /// Stop asking for log-probabilities for the rest of this request.
    fn disable_log_probabilities(&mut self);

    /// Schema the output must conform to.
    fn json_schema(&self) -> Option<&str>;

    /// Drop the schema so compilation is never retried.
    fn disable_structured_output(&mut self);

    fn matcher(&self) -> Option<&dyn GrammarMatcher>;

    fn set_matcher(&mut self, matcher: Box<dyn GrammarMatcher>);

    /// Append a token decided by the grammar as pending context.
    fn jump_ahead(&mut self, new_token: TokenId);

    /// Skip `start_idx` pending tokens whose KV entries already exist.
    fn bump_token_indices(&mut self, start_idx: usize);

    /// Record a generated token. All pending tokens count as consumed.
    fn update(&mut self, new_token: TokenId, log_probabilities: Option<LogProbabilities>, is_eos: bool);

    /// Completion tokens not yet handed back, oldest first. Drains the queue.
    fn outstanding_completion_tokens(&mut self) -> Vec<(TokenId, Option<LogProbabilities>)>;
}

/// A text generation request: prompt, generated tokens and generation settings.
#[derive(Debug)]
pub struct TextContext {
    /// Unique identifier of the request
    id: Uuid,

    cache_seq_id: CacheSeqId,

    /// Prompt followed by every completion token so far
    tokens: Vec<TokenId>,

    /// First pending token
    start_idx: usize,

    /// Next completion token to hand back to the caller
    completion_end: usize,

    max_length: Option<usize>,

    log_probabilities: usize,
    log_probabilities_echo: bool,

    /// Log-probabilities keyed by token index
    log_probabilities_data: HashMap<usize, LogProbabilities>,

    json_schema: Option<String>,
    matcher: Option<Box<dyn GrammarMatcher>>,

    is_eos: bool,
}

impl TextContext {
    /// Creates a new context whose whole prompt is pending.
    ///
    /// # Parameters
    ///
    /// * `cache_seq_id` - Slot key in the KV cache manager
    /// * `prompt` - Encoded prompt tokens
    /// * `max_length` - Optional bound on prompt plus completion length
    pub fn new(cache_seq_id: CacheSeqId, prompt: Vec<TokenId>, max_length: Option<usize>) -> Self {
        let completion_end = prompt.len();
        Self {
            id: Uuid::new_v4(),
            cache_seq_id,
            tokens: prompt,
            start_idx: 0,
            completion_end,
            max_length,
            log_probabilities: 0,
            log_probabilities_echo: false,
            log_probabilities_data: HashMap::new(),
            json_schema: None,
            matcher: None,
            is_eos: false,
        }
    }

    /// Request top-n log-probabilities, optionally echoing the prompt.
    pub fn with_log_probabilities(mut self, top_n: usize, echo: bool) -> Self {
        self.log_probabilities = top_n;
        self.log_probabilities_echo = echo;
        self
    }

    /// Constrain the completion to a JSON schema.
    pub fn with_json_schema(mut self, schema: impl Into<String>) -> Self {
        self.json_schema = Some(schema.into());
        self
    }

    /// Full token history.
    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    /// Whether the last recorded token was an end-of-sequence token.
    pub fn is_eos(&self) -> bool {
        self.is_eos
    }

    fn accept_into_matcher(&mut self, token: TokenId) {
        if let Some(matcher) = self.matcher.as_mut() {
            if !matcher.accept_token(token) {
                tracing::debug!(request_id = %self.id, token, "grammar matcher rejected token");
            }
        }
    }
}

impl InputContext for TextContext {
    fn request_id(&self) -> Uuid {
        self.id
    }

    fn cache_seq_id(&self) -> CacheSeqId {
        self.cache_seq_id
    }

    fn current_length(&self) -> usize {
        self.tokens.len()
    }

    fn active_length(&self) -> usize {
        self.tokens.len() - self.start_idx
    }

    fn max_length(&self) -> Option<usize> {
        self.max_length
    }

    fn next_tokens(&self) -> &[TokenId] {
        &self.tokens[self.start_idx..]
    }

    fn log_probabilities(&self) -> usize {
        self.log_probabilities
    }

    fn log_probabilities_echo(&self) -> bool {
        self.log_probabilities_echo
    }

    fn disable_log_probabilities(&mut self) {
        self.log_probabilities = 0;
        self.log_probabilities_echo = false;
    }

    fn json_schema(&self) -> Option<&str> {
        self.json_schema.as_deref()
    }

    fn disable_structured_output(&mut self) {
        self.json_schema = None;
        self.matcher = None;
    }

    fn matcher(&self) -> Option<&dyn GrammarMatcher> {
        self.matcher.as_deref()
    }

    fn set_matcher(&mut self, matcher: Box<dyn GrammarMatcher>) {
        self.matcher = Some(matcher);
    }

    fn jump_ahead(&mut self, new_token: TokenId) {
        self.tokens.push(new_token);
        self.accept_into_matcher(new_token);
    }

    fn bump_token_indices(&mut self, start_idx: usize) {
        self.start_idx = (self.start_idx + start_idx).min(self.tokens.len());
    }

    fn update(&mut self, new_token: TokenId, log_probabilities: Option<LogProbabilities>, is_eos: bool) {
        self.start_idx = self.tokens.len();
        if let Some(log_probabilities) = log_probabilities {
            self.log_probabilities_data.insert(self.tokens.len(), log_probabilities);
        }
        self.tokens.push(new_token);
        self.accept_into_matcher(new_token);
        self.is_eos = is_eos;
    }

    fn outstanding_completion_tokens(&mut self) -> Vec<(TokenId, Option<LogProbabilities>)> {
        let end = self.tokens.len();
        let outstanding = (self.completion_end..end)
            .map(|idx| (self.tokens[idx], self.log_probabilities_data.remove(&idx)))
            .collect();
        self.completion_end = end;
        outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TokenBitmask;

    #[derive(Debug, Default)]
    struct CountingMatcher {
        accepted: Vec<TokenId>,
    }

    impl GrammarMatcher for CountingMatcher {
        fn fill_next_token_bitmask(&self, _bitmask: &mut TokenBitmask, _row: usize) {}

        fn find_jump_forward_tokens(&self) -> Option<Vec<TokenId>> {
            None
        }

        fn accept_token(&mut self, token: TokenId) -> bool {
            self.accepted.push(token);
            true
        }
    }

    #[test]
    fn test_new_context_has_whole_prompt_pending() {
        let ctx = TextContext::new(4, vec![10, 11, 12], Some(16));
        assert_eq!(ctx.cache_seq_id(), 4);
        assert_eq!(ctx.current_length(), 3);
        assert_eq!(ctx.active_length(), 3);
        assert_eq!(ctx.next_tokens(), &[10, 11, 12]);
        assert_eq!(ctx.max_length(), Some(16));
    }

    #[test]
    fn test_bump_trims_cached_prefix() {
        let mut ctx = TextContext::new(0, vec![1, 2, 3, 4], None);
        ctx.bump_token_indices(3);
        assert_eq!(ctx.next_tokens(), &[4]);
        assert_eq!(ctx.active_length(), 1);
        assert_eq!(ctx.current_length(), 4);
    }

    #[test]
    fn test_update_consumes_pending_tokens() {
        let mut ctx = TextContext::new(0, vec![1, 2, 3], None);
        ctx.update(7, None, false);
        assert_eq!(ctx.next_tokens(), &[7]);
        assert_eq!(ctx.current_length(), 4);

        ctx.update(8, None, true);
        assert_eq!(ctx.next_tokens(), &[8]);
        assert!(ctx.is_eos());
    }

    #[test]
    fn test_jump_ahead_extends_pending_tokens() {
        let mut ctx = TextContext::new(0, vec![1], None);
        ctx.set_matcher(Box::new(CountingMatcher::default()));
        ctx.jump_ahead(5);
        ctx.jump_ahead(6);
        assert_eq!(ctx.next_tokens(), &[1, 5, 6]);
        assert_eq!(ctx.active_length(), 3);
    }

    #[test]
    fn test_outstanding_completion_tokens_drains_once() {
        let mut ctx = TextContext::new(0, vec![1, 2], None);
        ctx.jump_ahead(3);
        let log_probs = LogProbabilities {
            token_log_probabilities: vec![-0.25],
            top_log_probabilities: vec![HashMap::from([(4, -0.25)])],
        };
        ctx.update(4, Some(log_probs.clone()), false);

        let outstanding = ctx.outstanding_completion_tokens();
        assert_eq!(outstanding, vec![(3, None), (4, Some(log_probs))]);
        assert!(ctx.outstanding_completion_tokens().is_empty());

        ctx.update(9, None, false);
        assert_eq!(ctx.outstanding_completion_tokens(), vec![(9, None)]);
    }

    #[test]
    fn test_disable_features() {
        let mut ctx = TextContext::new(0, vec![1], None)
            .with_log_probabilities(3, true)
            .with_json_schema("{\"type\": \"object\"}");
        ctx.set_matcher(Box::new(CountingMatcher::default()));
        assert_eq!(ctx.log_probabilities(), 3);
        assert!(ctx.json_schema().is_some());

        ctx.disable_log_probabilities();
        ctx.disable_structured_output();
        assert_eq!(ctx.log_probabilities(), 0);
        assert!(!ctx.log_probabilities_echo());
        assert!(ctx.json_schema().is_none());
        assert!(ctx.matcher().is_none());
    }
}
