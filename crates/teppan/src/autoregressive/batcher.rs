use std::sync::Arc;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use crate::communication::{ItemStream, QueueItem};
use crate::context::InputContext;
use crate::batching::batch::batching_loop;
use crate::batching::worker::BatchWorkerHandle;
use crate::error::Result;
use crate::interfaces::TextGenerationResponse;
use super::core_trait::{ContinuousBatcher, TokenGenerator};
use super::handler::ContinuousBatchHandler;

/// Continuous batching front end over a [`TokenGenerator`].
///
/// Requests queue up until the background loop has room for them; at most
/// `S` requests are decoded together. Each loop iteration asks the generator
/// for up to `num_steps` tokens per request and streams the result to the
/// request's [`ItemStream`].
///
/// The loop task is stopped when this value is dropped.
///
/// # Type Parameters
///
/// * `C` - The request context type
/// * `S` - Maximum number of concurrently active requests
pub struct ContinuousBatchInference<C, const S: usize>
where C: InputContext + 'static
{
    waiting_requests: Arc<Mutex<Vec<QueueItem<C>>>>,
    handle: BatchWorkerHandle,
}

impl<C, const S: usize> ContinuousBatchInference<C, S>
where C: InputContext + 'static
{
    /// Start the batching loop on the current Tokio runtime.
    ///
    /// # Parameters
    ///
    /// * `generator` - Produces tokens for each iteration; owned by the loop
    /// * `num_steps` - Decode steps requested per iteration
    pub fn new<G>(generator: G, num_steps: usize) -> Self
    where G: TokenGenerator<C> + 'static
    {
        let waiting_requests = Arc::new(Mutex::new(vec![]));

        let handle = BatchWorkerHandle::new({
            let waiting_requests = waiting_requests.clone();
            move |running, notifier| {
                tokio::spawn(async move {
                    let handler = ContinuousBatchHandler::new(generator, num_steps);
                    batching_loop::<ContinuousBatchHandler<G, C>, S>(&handler, running, notifier, waiting_requests)
                        .await;
                    tracing::debug!("batching loop exited");
                })
            }
        });

        Self { waiting_requests, handle }
    }

    /// Whether the background loop is still accepting work.
    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    /// Number of requests queued but not yet admitted to the batch.
    pub async fn waiting(&self) -> usize {
        self.waiting_requests.lock().await.len()
    }
}

#[async_trait]
impl<C, const S: usize> ContinuousBatcher<C> for ContinuousBatchInference<C, S>
where C: InputContext + 'static
{
    async fn run(&self, context: C) -> ItemStream<Result<TextGenerationResponse>> {
        let (tx, rx) = mpsc::unbounded_channel();
        tracing::debug!(request_id = %context.request_id(), cache_seq_id = context.cache_seq_id(), "queued request");
        {
            let mut waiting = self.waiting_requests.lock().await;
            waiting.push(QueueItem::new(context, tx));
        }
        self.handle.notify();
        ItemStream::new(rx)
    }
}
