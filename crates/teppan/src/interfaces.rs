//! # Interfaces
//!
//! Plain data types exchanged between the pipeline and its callers.

use std::collections::HashMap;
use serde::{Deserialize, Serialize};

/// A vocabulary token id.
pub type TokenId = i64;

/// Key of a request's slot in the KV cache manager.
pub type CacheSeqId = u64;

/// Log-probabilities for one generated position.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LogProbabilities {
    /// Log-probability of each sampled token (more than one when echoing).
    pub token_log_probabilities: Vec<f32>,

    /// The top-n alternatives considered at each position.
    pub top_log_probabilities: Vec<HashMap<TokenId, f32>>,
}

/// Per-request status reported after each `next_token` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextGenerationStatus {
    Active,
    EndOfSequence,
    MaximumLength,
}

impl TextGenerationStatus {
    /// Whether the request reached a terminal condition.
    pub fn is_done(&self) -> bool {
        !matches!(self, TextGenerationStatus::Active)
    }
}

/// One token handed back to a requester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextResponse {
    pub next_token: TokenId,
    pub log_probabilities: Option<LogProbabilities>,
}

impl TextResponse {
    pub fn new(next_token: TokenId, log_probabilities: Option<LogProbabilities>) -> Self {
        Self { next_token, log_probabilities }
    }
}

/// Tokens produced for one request by a single `next_token` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextGenerationResponse {
    tokens: Vec<TextResponse>,
    final_status: TextGenerationStatus,
}

impl TextGenerationResponse {
    pub fn new(tokens: Vec<TextResponse>, final_status: TextGenerationStatus) -> Self {
        Self { tokens, final_status }
    }

    pub fn tokens(&self) -> &[TextResponse] {
        &self.tokens
    }

    /// Token ids only, in generation order.
    pub fn token_ids(&self) -> Vec<TokenId> {
        self.tokens.iter().map(|t| t.next_token).collect()
    }

    pub fn final_status(&self) -> TextGenerationStatus {
        self.final_status
    }

    pub fn is_done(&self) -> bool {
        self.final_status.is_done()
    }

    pub fn append_token(&mut self, token: TextResponse) {
        self.tokens.push(token);
    }

    pub fn update_status(&mut self, status: TextGenerationStatus) {
        self.final_status = status;
    }
}

/// Lifecycle of a request's cache slot.
///
/// `Active` loops across decode steps and `next_token` calls. Terminal states
/// only return to `Unclaimed` through an explicit release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    Unclaimed,
    Active,
    EndOfSequence,
    MaximumLength,
}

impl From<TextGenerationStatus> for RequestState {
    fn from(status: TextGenerationStatus) -> Self {
        match status {
            TextGenerationStatus::Active => RequestState::Active,
            TextGenerationStatus::EndOfSequence => RequestState::EndOfSequence,
            TextGenerationStatus::MaximumLength => RequestState::MaximumLength,
        }
    }
}

/// Embeddings for one request, row-major with the given shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingsResponse {
    pub embeddings: Vec<f32>,
    pub shape: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_is_done() {
        assert!(!TextGenerationStatus::Active.is_done());
        assert!(TextGenerationStatus::EndOfSequence.is_done());
        assert!(TextGenerationStatus::MaximumLength.is_done());
    }

    #[test]
    fn test_response_accumulates_tokens() {
        let mut response = TextGenerationResponse::new(vec![], TextGenerationStatus::Active);
        response.append_token(TextResponse::new(3, None));
        response.append_token(TextResponse::new(9, None));
        response.update_status(TextGenerationStatus::EndOfSequence);

        assert_eq!(response.token_ids(), vec![3, 9]);
        assert!(response.is_done());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&TextGenerationStatus::EndOfSequence).unwrap();
        assert_eq!(json, "\"end_of_sequence\"");
    }

    #[test]
    fn test_request_state_from_status() {
        assert_eq!(RequestState::from(TextGenerationStatus::MaximumLength), RequestState::MaximumLength);
        assert_eq!(RequestState::from(TextGenerationStatus::Active), RequestState::Active);
    }
}
