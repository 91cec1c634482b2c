//! Processor doubles and configuration fixtures

use async_trait::async_trait;
use mdl_common::config::PipelineConfig;
use mdl_pipeline::types::{Processor, ProcessorError};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Counts calls; fails for the configured file names
#[derive(Default)]
pub struct CountingProcessor {
    calls: AtomicUsize,
    fail_on: HashSet<String>,
    seen: Mutex<Vec<PathBuf>>,
}

impl CountingProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail with an I/O error for files named `name`
    pub fn failing_on(mut self, name: &str) -> Self {
        self.fail_on.insert(name.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<PathBuf> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Processor for CountingProcessor {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn process_file(
        &self,
        input: &Path,
        output: Option<&Path>,
    ) -> Result<serde_json::Value, ProcessorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(input.to_path_buf());

        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if self.fail_on.contains(&name) {
            return Err(ProcessorError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("cannot read {}", name),
            )));
        }

        if let Some(out) = output {
            std::fs::write(out, b"derived")?;
        }
        Ok(serde_json::json!({ "file": name }))
    }
}

/// Configuration tuned for short generated fixtures
pub fn test_config(keep_temp_files: bool) -> PipelineConfig {
    let toml = format!(
        r#"
        [processing]
        keep_temp_files = {}
        max_workers = 3
        progress_interval_ms = 20

        [download]
        skip_existing = true
        check_modified = false

        [analysis]
        chunk_seconds = 0.5
        workers = 2
        group_size = 2

        [validation]
        min_duration_secs = 1.0
        min_sample_rate = 22050

        [logging]
        level = "debug"
        "#,
        keep_temp_files
    );
    PipelineConfig::from_toml_str(&toml).unwrap()
}
