//! Shared test utilities for arkflow integration tests.
//!
//! This module provides:
//! - `TestHarness`, an orchestrator wired to in-process collaborators
//! - fakes for the presigner, workers and the embedding sink

pub mod fakes;
pub mod harness;

pub use fakes::*;
pub use harness::TestHarness;
