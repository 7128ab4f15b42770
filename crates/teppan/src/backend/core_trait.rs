use std::fmt::Debug;
use crate::error::Result;
use crate::interfaces::TokenId;

/// The backend trait that must be fulfilled by any tensor library driving the pipeline.
///
/// Tensors handed through the pipeline are assumed to live on a compute device.
/// Only [`Backend::shape`] may be called freely inside the decode loop; it reads
/// metadata and never synchronizes. The `*_to_host` methods block until the
/// device has produced the values and are reserved for finalization.
pub trait Backend: Debug + Clone + Send + Sync + 'static {
    /// Device handle tensors are allocated on
    type Device: Debug + Clone + Send + Sync + 'static;

    /// Return the shape of this tensor
    fn shape(&self) -> Vec<usize>;

    /// Allocate an empty `(batch_size, 0)` integer buffer for generated tokens
    fn empty_token_buffer(batch_size: usize, device: &Self::Device) -> Result<Self>;

    /// Upload a row-major `(rows, cols)` boolean mask, one byte per entry
    fn from_mask(mask: Vec<u8>, rows: usize, cols: usize, device: &Self::Device) -> Result<Self>;

    /// Copy a rank 2 integer tensor back to host memory, one `Vec` per row
    fn tokens_to_host(&self) -> Result<Vec<Vec<TokenId>>>;

    /// Copy a floating point tensor back to host memory, flattened row-major
    fn to_host_f32(&self) -> Result<Vec<f32>>;
}
