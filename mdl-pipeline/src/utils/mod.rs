//! Utility modules

pub mod audio_stream;

pub use audio_stream::AudioChunkSource;
