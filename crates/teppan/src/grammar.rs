//! # Structured Output
//!
//! Contracts consumed from the grammar engine. The pipeline never builds
//! grammars itself; it compiles a request's JSON schema once, caches the
//! resulting matcher on the request, and asks it for a bitmask row and for
//! forced ("jump-ahead") tokens before each call.

use std::fmt::Debug;
use crate::error::GrammarError;
use crate::interfaces::TokenId;
use crate::tensor::TokenBitmask;

/// Compiles JSON schemas into per-request matchers.
pub trait GrammarCompiler: Send + Sync {
    /// Size of the vocabulary the compiled grammars are expressed over.
    fn vocab_size(&self) -> usize;

    /// Compile `schema` into a fresh matcher.
    fn compile_json_schema(&self, schema: &str) -> Result<Box<dyn GrammarMatcher>, GrammarError>;
}

/// Runtime state of one grammar for one request.
pub trait GrammarMatcher: Debug + Send + Sync {
    /// Write the legal next tokens into `row` of `bitmask`.
    fn fill_next_token_bitmask(&self, bitmask: &mut TokenBitmask, row: usize);

    /// Tokens the grammar forces next, if the continuation is deterministic.
    fn find_jump_forward_tokens(&self) -> Option<Vec<TokenId>>;

    /// Advance the matcher past `token`. Returns `false` if it was rejected.
    fn accept_token(&mut self, token: TokenId) -> bool;
}
