use std::collections::HashMap;
use async_trait::async_trait;
use uuid::Uuid;
use crate::communication::ItemStream;
use crate::context::InputContext;
use crate::error::Result;
use crate::interfaces::TextGenerationResponse;

/// A component that advances batches of requests by one or more tokens.
///
/// This is the contract the continuous batching driver is written against.
/// [`TextGenerationPipeline`](super::TextGenerationPipeline) is the standard
/// implementation.
///
/// # Type Parameters
///
/// * `C` - The request context type
#[async_trait]
pub trait TokenGenerator<C>: Send
where C: InputContext + 'static
{
    /// Advance every context in `batch` by up to `num_steps` tokens.
    ///
    /// # Parameters
    ///
    /// * `batch` - Contexts to advance
    /// * `num_steps` - Requested number of decode steps
    ///
    /// # Returns
    ///
    /// The tokens and status of each request, keyed by request id
    async fn next_token(
        &mut self,
        batch: &mut [C],
        num_steps: usize,
    ) -> Result<HashMap<Uuid, TextGenerationResponse>>;

    /// Free any resources held for `context`.
    fn release(&mut self, context: &C) -> Result<()>;
}

/// A component that accepts generation requests and streams their progress.
///
/// Each call to [`run`](Self::run) queues one request. The returned stream
/// yields one response per decode iteration the request took part in, and
/// ends after a response whose status is terminal or after an error.
///
/// Dropping the stream abandons the request; its cache slot is released on
/// the next iteration.
///
/// # Type Parameters
///
/// * `C` - The request context type
#[async_trait]
pub trait ContinuousBatcher<C> {
    /// Queue `context` for generation.
    ///
    /// # Parameters
    ///
    /// * `context` - The request to generate for
    ///
    /// # Returns
    ///
    /// A stream of per-iteration results for this request
    async fn run(&self, context: C) -> ItemStream<Result<TextGenerationResponse>>;
}
