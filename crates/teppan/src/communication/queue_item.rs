//! # Queue Item
//!
//! A request waiting for, or holding, a place in the running batch: the
//! caller's context plus the channel its responses are streamed on.

use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;
use crate::context::InputContext;
use crate::error::Result;
use crate::interfaces::TextGenerationResponse;

/// Channel end the driver streams one request's results into.
pub type ResponseSender = UnboundedSender<Result<TextGenerationResponse>>;

#[derive(Debug)]
pub struct QueueItem<C> {
    context: C,
    sender: ResponseSender,
}

impl<C> QueueItem<C>
where C: InputContext
{
    pub fn new(context: C, sender: ResponseSender) -> Self {
        Self { context, sender }
    }

    /// Request id of the wrapped context.
    pub fn id(&self) -> Uuid {
        self.context.request_id()
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn sender(&self) -> &ResponseSender {
        &self.sender
    }

    /// Send `result` to the requester.
    ///
    /// # Returns
    ///
    /// `false` if the requester dropped its stream
    pub fn send(&self, result: Result<TextGenerationResponse>) -> bool {
        self.sender.send(result).is_ok()
    }

    pub fn into_parts(self) -> (C, ResponseSender) {
        (self.context, self.sender)
    }

    pub fn from_parts(context: C, sender: ResponseSender) -> Self {
        Self::new(context, sender)
    }
}
