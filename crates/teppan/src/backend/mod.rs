//! # Tensor Backend
//!
//! This module provides a unified interface for different tensor backends,
//! allowing the decode loop to stay device-agnostic.
//!
//! ## Feature Flags
//!
//! - `candle`: Enables support for the Candle tensor library
//!
//! ## Usage
//!
//! Model executors, samplers and cache managers agree on one [`Backend`] type.
//! The pipeline only allocates the generated-token buffer, uploads constraint
//! masks and performs the single host copy at the end of a call; everything
//! else is opaque to it.

mod core_trait;

#[cfg_attr(docsrs, doc(cfg(feature = "candle")))]
#[cfg(feature = "candle")]
/// Candle tensor backend implementation.
///
/// This module is only available when the `candle` feature flag is enabled.
pub mod candle;

// Re-export the core traits for convenient imports
pub use core_trait::*;


#[cfg(test)]
/// Mock tensor implementation.
///
/// Host-backed tensors that record every host read on their device.
pub(crate) mod mock_tensor;
