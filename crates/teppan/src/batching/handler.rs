use std::sync::Arc;
use async_trait::async_trait;
use tokio::sync::Mutex;

/// One iteration of work over the active requests, plus the bookkeeping after it.
///
/// The batching loop owns the active request list and the active count; a
/// handler decides what an iteration does and which requests leave the batch.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    /// A request admitted into the batch
    type Request: Send;

    /// Whatever one iteration produces for the whole batch
    type ModelOutput: Send;

    /// Run one iteration over every active request.
    ///
    /// # Parameters
    ///
    /// * `batch` - The active requests; order must be preserved
    async fn forward(&self, batch: &mut Vec<Self::Request>) -> Self::ModelOutput;

    /// Deliver results and drop finished requests from the batch.
    ///
    /// Implementations must decrement `active_count` by the number of
    /// requests they remove.
    ///
    /// # Parameters
    ///
    /// * `batch` - The active requests
    /// * `output` - What [`forward`](Self::forward) returned
    /// * `active_count` - Counter of admitted requests shared with the loop
    async fn handle_outputs(
        &self,
        batch: &mut Vec<Self::Request>,
        output: Self::ModelOutput,
        active_count: Arc<Mutex<usize>>,
    );
}
