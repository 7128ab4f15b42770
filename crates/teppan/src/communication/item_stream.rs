use std::pin::Pin;
use std::task::{Context, Poll};
use futures::Stream;
use tokio::sync::mpsc;

/// # ItemStream
///
/// The receiving end handed to a caller of the batching driver.
///
/// Implements [`Stream`] over a Tokio unbounded channel, so results can be
/// consumed with `StreamExt::next` or any other stream combinator. The stream
/// ends once the driver drops the matching sender, which happens when the
/// request finishes, fails, or the driver shuts down.
///
/// Dropping an `ItemStream` is how a caller abandons a request: the driver
/// notices the closed channel on its next send and frees the request's slot.
pub struct ItemStream<T> {
    receiver: mpsc::UnboundedReceiver<T>,
}

impl<T> ItemStream<T> {
    pub(crate) fn new(receiver: mpsc::UnboundedReceiver<T>) -> Self {
        Self { receiver }
    }
}

impl<T> Stream for ItemStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}
