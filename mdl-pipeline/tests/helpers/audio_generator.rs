//! WAV fixture generator

use std::path::{Path, PathBuf};

/// Shape of a generated file
#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    /// Peak amplitude as a fraction of full scale
    pub amplitude: f32,
    pub frequency_hz: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            duration_seconds: 2.0,
            sample_rate: 44_100,
            channels: 2,
            amplitude: 0.3,
            frequency_hz: 440.0,
        }
    }
}

/// Write a sine tone WAV
pub fn generate_test_wav(path: &Path, config: &AudioConfig) -> anyhow::Result<PathBuf> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let spec = hound::WavSpec {
        channels: config.channels,
        sample_rate: config.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(path, spec)?;
    let total_frames = (config.duration_seconds * config.sample_rate as f64) as usize;

    for i in 0..total_frames {
        let t = i as f32 / config.sample_rate as f32;
        let value = config.amplitude * (2.0 * std::f32::consts::PI * config.frequency_hz * t).sin();
        let sample = (value * i16::MAX as f32) as i16;
        for _ in 0..config.channels {
            writer.write_sample(sample)?;
        }
    }

    writer.finalize()?;
    Ok(path.to_path_buf())
}

/// Write `count` tones named `track_001.wav`, `track_002.wav`, ...
///
/// Each file gets a different frequency so content hashes differ.
pub fn generate_test_library(
    dir: &Path,
    count: usize,
    config: &AudioConfig,
) -> anyhow::Result<Vec<PathBuf>> {
    (0..count)
        .map(|i| {
            let file_config = AudioConfig {
                frequency_hz: config.frequency_hz + 110.0 * i as f32,
                ..config.clone()
            };
            generate_test_wav(&dir.join(format!("track_{:03}.wav", i + 1)), &file_config)
        })
        .collect()
}
