//! Ephemeral container environments for integration tests.
//!
//! - [`engine`]: the container engine surface and its Docker implementation
//! - [`environment`]: network, image, container and readiness management,
//!   sequenced by the [`environment::Orchestrator`]
//! - [`config`]: settings resolved from environment variables
//! - [`testing`]: in-memory doubles for tests

pub mod cli;
pub mod config;
pub mod engine;
pub mod environment;
pub mod error;
pub mod testing;
