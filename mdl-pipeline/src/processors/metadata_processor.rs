//! Metadata extraction processor
//!
//! Reads container properties and tags with lofty and writes one
//! `<stem>_metadata.json` document per file into the metadata directory.
//! Files sharing a stem share a document location; the last one written
//! wins and the replacement is logged.

use crate::services::content_hasher::ContentHasher;
use crate::types::{Processor, ProcessorError};
use async_trait::async_trait;
use lofty::file::{FileType, TaggedFileExt};
use lofty::prelude::*;
use lofty::probe::Probe;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub filename: String,
    pub path: String,
    pub size_bytes: u64,
    pub format: String,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioInfo {
    pub duration: f64,
    pub sample_rate: Option<u32>,
    pub channels: Option<u8>,
    pub bit_depth: Option<u8>,
    /// Kilobits per second
    pub bitrate: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagInfo {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
    pub year: Option<u32>,
    pub track: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingInfo {
    pub processed_date: chrono::DateTime<chrono::Utc>,
    pub processor_version: String,
}

/// Metadata document of one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataDocument {
    pub file_info: FileInfo,
    pub audio_info: AudioInfo,
    pub tags: TagInfo,
    pub processing_info: ProcessingInfo,
}

/// Metadata processor
#[derive(Debug, Clone)]
pub struct MetadataProcessor {
    metadata_dir: PathBuf,
    hasher: ContentHasher,
}

impl MetadataProcessor {
    pub fn new(metadata_dir: impl Into<PathBuf>) -> Self {
        Self {
            metadata_dir: metadata_dir.into(),
            hasher: ContentHasher::new(),
        }
    }

    /// Where the document for `input` is written
    pub fn document_path(&self, input: &Path) -> PathBuf {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        self.metadata_dir.join(format!("{}_metadata.json", stem))
    }

    /// Source path recorded in the document at `input`'s location, when
    /// that document was written for a different file
    pub fn existing_owner(&self, input: &Path) -> Option<String> {
        let content = std::fs::read_to_string(self.document_path(input)).ok()?;
        let document: serde_json::Value = serde_json::from_str(&content).ok()?;
        let owner = document["file_info"]["path"].as_str()?;
        (owner != input.display().to_string()).then(|| owner.to_string())
    }

    /// Read properties and tags of `input`
    ///
    /// Missing tags are not an error; an unreadable container is.
    pub fn extract(&self, input: &Path) -> Result<MetadataDocument, ProcessorError> {
        let size_bytes = std::fs::metadata(input)?.len();

        let tagged_file = Probe::open(input)
            .map_err(|e| ProcessorError::Unsupported(e.to_string()))?
            .read()
            .map_err(|e| ProcessorError::Unsupported(e.to_string()))?;

        let properties = tagged_file.properties();
        let audio_info = AudioInfo {
            duration: properties.duration().as_secs_f64(),
            sample_rate: properties.sample_rate(),
            channels: properties.channels(),
            bit_depth: properties.bit_depth(),
            bitrate: properties.audio_bitrate(),
        };

        let tags = match tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
            Some(tag) => TagInfo {
                title: tag.title().map(|s| s.to_string()),
                artist: tag.artist().map(|s| s.to_string()),
                album: tag.album().map(|s| s.to_string()),
                genre: tag.genre().map(|s| s.to_string()),
                year: tag.year(),
                track: tag.track(),
            },
            None => {
                tracing::debug!(file = %input.display(), "No tags found");
                TagInfo::default()
            }
        };

        let format = match tagged_file.file_type() {
            FileType::Mpeg => "mp3",
            FileType::Flac => "flac",
            FileType::Opus => "opus",
            FileType::Vorbis => "ogg",
            FileType::Aac => "aac",
            FileType::Mp4 => "m4a",
            FileType::Wav => "wav",
            FileType::Aiff => "aiff",
            _ => "unknown",
        }
        .to_string();

        Ok(MetadataDocument {
            file_info: FileInfo {
                filename: input
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                path: input.display().to_string(),
                size_bytes,
                format,
                hash: self.hasher.hash_file(input)?,
            },
            audio_info,
            tags,
            processing_info: ProcessingInfo {
                processed_date: mdl_common::time::now(),
                processor_version: env!("CARGO_PKG_VERSION").to_string(),
            },
        })
    }

    fn extract_and_write(&self, input: &Path) -> Result<MetadataDocument, ProcessorError> {
        let document = self.extract(input)?;
        std::fs::create_dir_all(&self.metadata_dir)?;
        if let Some(owner) = self.existing_owner(input) {
            tracing::warn!(
                file = %input.display(),
                replaced = %owner,
                document = %self.document_path(input).display(),
                "Replacing metadata document of another file with the same name"
            );
        }
        mdl_common::fs::write_json_atomic(&self.document_path(input), &document)
            .map_err(|e| ProcessorError::Failed(e.to_string()))?;
        Ok(document)
    }
}

#[async_trait]
impl Processor for MetadataProcessor {
    fn name(&self) -> &'static str {
        "metadata_processor"
    }

    async fn process_file(
        &self,
        input: &Path,
        _output: Option<&Path>,
    ) -> Result<serde_json::Value, ProcessorError> {
        let processor = self.clone();
        let path = input.to_path_buf();

        let document = tokio::task::spawn_blocking(move || processor.extract_and_write(&path))
            .await
            .map_err(|e| ProcessorError::Failed(format!("Metadata task failed: {}", e)))??;

        tracing::info!(file = %input.display(), "Processed metadata");
        Ok(serde_json::to_value(&document)?)
    }
}
