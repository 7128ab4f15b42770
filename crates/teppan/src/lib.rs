//! # Teppan
//!
//! Multi-step continuous batching for autoregressive token generation.
//!
//! ## Overview
//!
//! Teppan sits between a serving loop and a compiled model. Each call to
//! [`TextGenerationPipeline::next_token`](autoregressive::TextGenerationPipeline::next_token)
//! takes the requests currently in flight, claims KV cache slots for the
//! new ones, and runs several decode steps on the device before a single
//! host synchronization commits the generated tokens. Requests join and
//! leave the batch between calls.
//!
//! Key components include:
//!
//! - Contracts for the collaborators the pipeline drives: the model
//!   executor, the sampler, the KV cache manager and the grammar engine
//! - A multi-step generation pipeline with structured output and
//!   log-probability support
//! - A background continuous batching driver that streams responses
//! - A single-pass embeddings pipeline
//!
//! ## Architecture
//!
//! ### Assumptions
//! Regardless of backend used, teppan reserves two dimensions with special meanings:
//!  - The `0th` dimension is reserved as the batch dimension
//!  - The `1st` dimension is reserved as the sequence (or step) dimension
//!
//! ### Backend Traits
//!
//! The [`Backend`](backend::Backend) trait is the only view the pipeline has
//! of device tensors. Tensors stay opaque during the decode loop; only the
//! final copy of generated tokens reads device memory.
//!
//! ### Request Contexts
//!
//! Callers own their contexts. The pipeline mutates them through
//! [`InputContext`](context::InputContext), writing generated tokens,
//! log-probabilities and cached grammar matchers back into them.
//! [`TextContext`](context::TextContext) is a ready-made implementation.
//!
//! ## Features
//!
//! - **autoregressive** - Enables the generation pipeline and batching driver
//! - **embeddings** - Enables the embeddings pipeline
//! - **candle** - Enables candle backend
//!
//! ## Logging
//!
//! Every phase of a call runs inside a [`tracing`] span (`next_token`,
//! `prepare_batch`, `multistep_execution_loop`, `step`, `finalize`).
//! Recoverable degradations are reported at `warn`. No subscriber is
//! installed by the library.

#[cfg(feature = "autoregressive")]
mod batching;
#[cfg(feature = "autoregressive")]
mod communication;
mod tensor;

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod grammar;
pub mod interfaces;
pub mod kv_cache;
pub mod logprobs;
pub mod model;

/// Constants for client reference
pub use tensor::constant;
pub use tensor::TokenBitmask;
#[cfg(feature = "autoregressive")]
pub use communication::ItemStream;
pub use error::{PipelineError, Result};

#[cfg(feature = "autoregressive")]
pub mod autoregressive;

#[cfg(feature = "embeddings")]
pub mod embeddings;

#[cfg(all(test, feature = "autoregressive"))]
mod testing;
