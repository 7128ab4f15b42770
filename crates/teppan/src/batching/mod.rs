//! # Batching Core
//!
//! Model-agnostic machinery behind the continuous batching driver.
//!
//! * [`worker`] - Owns the background task and its shutdown signal.
//! * [`handler`] - The [`BatchHandler`](handler::BatchHandler) trait a concrete driver implements.
//! * [`batch`] - The loop that admits waiting requests and runs iterations.

pub mod worker;
pub mod batch;
pub mod handler;
