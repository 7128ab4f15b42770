use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::error::Elapsed;
use super::handler::BatchHandler;

/// How long an idle loop sleeps before re-checking the queue.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Continuous batching loop.
///
/// Runs until `running` is cleared. Each pass admits waiting requests while
/// fewer than `S` are active, then runs one handler iteration over everything
/// active. When nothing is queued or active it parks on `notifier`.
///
/// # Type Parameters
///
/// * `BH` - The handler that performs iterations
/// * `S` - Maximum number of concurrently active requests
pub async fn batching_loop<BH, const S: usize>(
    handler: &BH,
    running: Arc<AtomicBool>,
    notifier: Arc<Notify>,
    waiting_requests: Arc<Mutex<Vec<BH::Request>>>,
)
where BH: BatchHandler
{
    let active_count = Arc::new(Mutex::new(0));
    let mut active_requests: Vec<BH::Request> = vec![];

    while running.load(Ordering::SeqCst) {
        if !should_process(&active_count, &waiting_requests).await {
            // Either woken by new work or timed out; both re-check the queue.
            let _ = timeout_await_notifier(&notifier).await;
            continue;
        }

        let admitted = drain_possible_requests(S, &waiting_requests, &active_count).await;
        if !admitted.is_empty() {
            tracing::debug!(admitted = admitted.len(), "admitted waiting requests");
        }
        active_requests.extend(admitted);

        if active_requests.is_empty() {
            continue;
        }
        let output = handler.forward(&mut active_requests).await;
        handler.handle_outputs(&mut active_requests, output, active_count.clone()).await;
    }
}

async fn should_process<T>(active_count: &Mutex<usize>, waiting_requests: &Mutex<Vec<T>>) -> bool {
    if *active_count.lock().await > 0 {
        return true;
    }
    !waiting_requests.lock().await.is_empty()
}

async fn timeout_await_notifier(notifier: &Notify) -> Result<(), Elapsed> {
    tokio::time::timeout(IDLE_POLL_INTERVAL, notifier.notified()).await
}

/// Move up to `batch_size - active` waiting requests into the batch.
async fn drain_possible_requests<T>(
    batch_size: usize,
    waiting_requests: &Mutex<Vec<T>>,
    active_count: &Mutex<usize>,
) -> Vec<T> {
    let mut requests = waiting_requests.lock().await;
    let mut active = active_count.lock().await;
    let available_slots = batch_size.saturating_sub(*active);
    let take = available_slots.min(requests.len());
    if take == 0 {
        return vec![];
    }
    *active += take;
    requests.drain(0..take).collect()
}
