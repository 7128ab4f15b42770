//! Types that carry requests into the batching loop and results back out.

mod item_stream;
mod queue_item;

pub use item_stream::ItemStream;
pub(crate) use queue_item::QueueItem;
