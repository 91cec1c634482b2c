//! Test Helper Utilities
//!
//! Shared fixtures for the pipeline integration tests

#![allow(dead_code)]

pub mod audio_generator;
pub mod mock_processors;

pub use audio_generator::{generate_test_library, generate_test_wav, AudioConfig};
pub use mock_processors::{CountingProcessor, test_config};
