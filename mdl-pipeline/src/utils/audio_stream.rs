//! Streaming audio decoding
//!
//! **Purpose:** Yield mono f32 windows from an audio file without decoding
//! the whole file into memory.
//!
//! Uses symphonia for format-agnostic decoding (MP3, FLAC, AAC, WAV, OGG).

use crate::services::chunked_analysis::{AnalysisError, ChunkSource};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Packet-at-a-time decoder producing mono windows
pub struct AudioChunkSource {
    path: PathBuf,
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    channels: usize,
    /// Decoded mono samples not yet handed out (at most one packet's worth)
    pending: VecDeque<f32>,
    finished: bool,
}

impl AudioChunkSource {
    /// Open and probe `path`
    ///
    /// **Algorithm:**
    /// 1. Probe the container (extension used as hint)
    /// 2. Pick the first track with a real codec
    /// 3. Build a decoder for it
    ///
    /// # Errors
    /// `AnalysisError::Open` for unreadable files, unknown formats and
    /// tracks without a sample rate
    pub fn open(path: &Path) -> Result<Self, AnalysisError> {
        let open_err = |reason: String| AnalysisError::Open {
            path: path.display().to_string(),
            reason,
        };

        let file = std::fs::File::open(path).map_err(|e| open_err(e.to_string()))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(extension) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(extension);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| open_err(format!("probe failed: {}", e)))?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| open_err("no audio track found".into()))?;

        let track_id = track.id;
        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| open_err("sample rate unknown".into()))?;
        let channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(1);

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| open_err(format!("no decoder: {}", e)))?;

        tracing::debug!(
            path = %path.display(),
            sample_rate,
            channels,
            "Audio stream opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            format,
            decoder,
            track_id,
            sample_rate,
            channels,
            pending: VecDeque::new(),
            finished: false,
        })
    }

    /// Original channel count (windows are always mono)
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Decode the next packet of our track into `pending`
    ///
    /// Sets `finished` at end of stream.
    fn decode_next_packet(&mut self) -> Result<(), AnalysisError> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    self.finished = true;
                    return Ok(());
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.finished = true;
                    return Ok(());
                }
                Err(e) => return Err(AnalysisError::Decode(format!("Error reading packet: {}", e))),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) => {
                    // Corrupt packet: drop it and keep the stream going
                    tracing::debug!(path = %self.path.display(), error = %e, "Packet skipped");
                    continue;
                }
                Err(e) => {
                    return Err(AnalysisError::Decode(format!(
                        "Failed to decode packet in {}: {}",
                        self.path.display(),
                        e
                    )))
                }
            };

            let spec = *decoded.spec();
            let channels = spec.channels.count().max(1);
            let mut interleaved = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
            interleaved.copy_interleaved_ref(decoded);

            for frame in interleaved.samples().chunks(channels) {
                let sum: f32 = frame.iter().sum();
                self.pending.push_back(sum / channels as f32);
            }
            return Ok(());
        }
    }
}

impl ChunkSource for AudioChunkSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read_chunk(&mut self, buf: &mut Vec<f32>, max_samples: usize) -> Result<bool, AnalysisError> {
        buf.clear();

        while buf.len() < max_samples {
            if self.pending.is_empty() {
                if self.finished {
                    break;
                }
                self.decode_next_packet()?;
                continue;
            }
            let take = (max_samples - buf.len()).min(self.pending.len());
            buf.extend(self.pending.drain(..take));
        }

        Ok(!buf.is_empty())
    }
}
