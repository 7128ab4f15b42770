use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;
use crate::communication::QueueItem;
use crate::context::InputContext;
use crate::batching::handler::BatchHandler;
use crate::error::{PipelineError, Result};
use crate::interfaces::TextGenerationResponse;
use super::core_trait::TokenGenerator;

/// Drives a [`TokenGenerator`] from the batching loop.
///
/// Each iteration advances every active request by up to `num_steps` tokens,
/// streams the responses and retires finished requests. A request leaves the
/// batch when it reaches a terminal status, when its stream was dropped, or
/// when an error names it; its cache slot is released each time.
///
/// # Type Parameters
///
/// * `G` - The token generator, usually a [`TextGenerationPipeline`](super::TextGenerationPipeline)
/// * `C` - The request context type
pub struct ContinuousBatchHandler<G, C> {
    /// Exclusive access to the generator; only the loop task uses it
    pub generator: Mutex<G>,

    /// Steps requested per iteration
    pub num_steps: usize,

    _context: PhantomData<fn(C) -> C>,
}

impl<G, C> ContinuousBatchHandler<G, C>
where
    G: TokenGenerator<C>,
    C: InputContext + 'static,
{
    pub fn new(generator: G, num_steps: usize) -> Self {
        Self { generator: Mutex::new(generator), num_steps, _context: PhantomData }
    }

    /// Release the slot of a request leaving the batch.
    fn release(generator: &mut G, item: &QueueItem<C>) {
        if let Err(err) = generator.release(item.context()) {
            tracing::warn!(request_id = %item.id(), error = %err, "failed to release cache slot");
        }
    }
}

#[async_trait]
impl<G, C> BatchHandler for ContinuousBatchHandler<G, C>
where
    G: TokenGenerator<C> + 'static,
    C: InputContext + 'static,
{
    type Request = QueueItem<C>;
    type ModelOutput = Result<HashMap<Uuid, TextGenerationResponse>>;

    /// Run one `next_token` call over the active contexts.
    ///
    /// Contexts are taken out of their queue items for the call and put back
    /// in the same order afterwards.
    async fn forward(&self, batch: &mut Vec<Self::Request>) -> Self::ModelOutput {
        let (mut contexts, senders): (Vec<C>, Vec<_>) = batch.drain(..).map(QueueItem::into_parts).unzip();

        let output = {
            let mut generator = self.generator.lock().await;
            generator.next_token(&mut contexts, self.num_steps).await
        };

        batch.extend(contexts.into_iter().zip(senders).map(|(context, sender)| QueueItem::from_parts(context, sender)));
        output
    }

    /// Stream responses and retire finished, abandoned or failing requests.
    async fn handle_outputs(
        &self,
        batch: &mut Vec<Self::Request>,
        output: Self::ModelOutput,
        active_count: Arc<Mutex<usize>>,
    ) {
        let mut generator = self.generator.lock().await;
        let before = batch.len();

        match output {
            Ok(mut responses) => {
                batch.retain(|item| {
                    let Some(response) = responses.remove(&item.id()) else {
                        return !item.sender().is_closed();
                    };
                    let done = response.is_done();
                    let delivered = item.send(Ok(response));
                    if !delivered {
                        tracing::debug!(request_id = %item.id(), "requester went away");
                    }
                    if done || !delivered {
                        Self::release(&mut generator, item);
                        return false;
                    }
                    true
                });
            }
            Err(err) => match err.request_id() {
                Some(offender) => {
                    tracing::warn!(request_id = %offender, error = %err, "evicting request");
                    // A slot still addressed by another request in the batch belongs to that request.
                    let slot_shared = batch
                        .iter()
                        .find(|item| item.id() == offender)
                        .map(|evicted| evicted.context().cache_seq_id())
                        .is_some_and(|cache_seq_id| {
                            batch.iter().filter(|item| item.context().cache_seq_id() == cache_seq_id).count() > 1
                        });
                    batch.retain(|item| {
                        if item.id() != offender {
                            return true;
                        }
                        item.send(Err(err.clone()));
                        if slot_shared {
                            tracing::debug!(request_id = %offender, "cache slot kept for the request that owns it");
                        } else {
                            Self::release(&mut generator, item);
                        }
                        false
                    });
                }
                None => {
                    tracing::warn!(error = %err, batch_size = batch.len(), "batch failed, aborting every request");
                    for item in batch.drain(..) {
                        item.send(Err(PipelineError::Aborted(err.to_string())));
                        Self::release(&mut generator, &item);
                    }
                }
            },
        }

        let retired = before - batch.len();
        if retired > 0 {
            let mut active = active_count.lock().await;
            *active = active.saturating_sub(retired);
        }
    }
}
