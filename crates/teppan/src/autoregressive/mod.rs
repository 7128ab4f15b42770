//! # Autoregressive Generation
//!
//! Multi-step continuous batching for token generation.
//!
//! ## Overview
//!
//! A [`TextGenerationPipeline`] advances a batch of caller-owned contexts by
//! up to `num_steps` tokens per call. All steps of a call run on the device:
//! the model executes, the sampler picks tokens under an optional grammar
//! bitmask, the cache lengths grow and the next inputs are derived from the
//! sampled tokens. Generated tokens reach the host once, at the end of the
//! call, where they are committed to the KV cache manager and written into
//! the contexts.
//!
//! Requests join and leave between calls. The batch passed to each call may
//! differ from the previous one; cache slots are claimed on first sight and
//! released explicitly.
//!
//! ## Key Components
//!
//! * [`TokenGenerator`] - The generation contract the driver is written against
//! * [`TextGenerationPipeline`] - The multi-step generator
//! * [`ContinuousBatcher`] - Accepts requests and streams their progress
//! * [`ContinuousBatchInference`] - Background batching loop over any generator
//!
//! ## Step Budget
//!
//! The requested step count is clamped, for the whole batch, to what the
//! tightest context can still take: `max_length - current_length`, where
//! `max_length` is the context's own bound or the model limit. A context that
//! is already at its bound fails the call with
//! [`PipelineError::LengthExceeded`](crate::error::PipelineError::LengthExceeded).
//!
//! # Example
//!
//! ```rust,ignore
//! use teppan::autoregressive::{ContinuousBatchInference, ContinuousBatcher, TextGenerationPipeline};
//! use teppan::context::TextContext;
//! use futures::StreamExt;
//!
//! let pipeline = TextGenerationPipeline::new(config, model, kv_manager, sampler, eos, None)?;
//! let batcher = ContinuousBatchInference::<TextContext, 32>::new(pipeline, 8);
//!
//! let mut stream = batcher.run(TextContext::new(0, prompt, Some(256))).await;
//! while let Some(response) = stream.next().await {
//!     let response = response?;
//!     print_tokens(response.token_ids());
//! }
//! ```

mod batcher;
mod core_trait;
mod handler;
mod multistep;
mod pipeline;
mod prepare;
mod response;

pub use batcher::ContinuousBatchInference;
pub use core_trait::{ContinuousBatcher, TokenGenerator};
pub use pipeline::TextGenerationPipeline;
