//! Host-side tensor helpers: reserved dimensions, the packed constraint
//! bitmask and shape checks applied to sampler output.

pub mod constant;
mod bitmask;
#[cfg(feature = "autoregressive")]
pub(crate) mod operations;

pub use bitmask::TokenBitmask;
