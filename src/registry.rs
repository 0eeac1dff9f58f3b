// ==============================================================================
// registry.rs - Export Handler Registry
// ==============================================================================
// Description: Compile-time registry of format-specific export handlers,
//              populated at startup; includes the built-in zip archive
//              handler for the final download artifact
// Author: Matt Barham
// Created: 2026-02-03
// Modified: 2026-02-03
// Version: 1.0.0
// ==============================================================================
// When two handlers register under the same format name, the more specific
// one wins; the comparison is an explicit function, not type introspection.
// ==============================================================================

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use zip::{write::SimpleFileOptions, ZipWriter};

use crate::context::JobMetadata;
use crate::error::ExportError;

/// Produces the final user-facing artifact from the fully written set of
/// per-target files plus per-job metadata. Runs after the pipeline, outside
/// of it.
pub trait ExportHandler: Send + Sync {
    /// Format name this handler claims (e.g., "zip")
    fn format_name(&self) -> &str;

    /// Tie-break rank: when two handlers claim the same format name, the
    /// higher specificity wins registration
    fn specificity(&self) -> u32;

    /// Build the artifact in `output_dir`; returns its path
    fn finalize(
        &self,
        target_files: &[PathBuf],
        metadata: &JobMetadata,
        output_dir: &Path,
    ) -> Result<PathBuf, ExportError>;
}

/// Explicit comparison used for registration conflicts
fn more_specific(candidate: &dyn ExportHandler, incumbent: &dyn ExportHandler) -> bool {
    candidate.specificity() > incumbent.specificity()
}

/// Format name -> handler map, populated explicitly at startup
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ExportHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. An existing handler for the same format name is
    /// only replaced by a more specific one; registration order does not
    /// matter.
    pub fn register(&mut self, handler: Arc<dyn ExportHandler>) {
        let name = handler.format_name().to_string();
        match self.handlers.get(&name) {
            Some(incumbent) if !more_specific(handler.as_ref(), incumbent.as_ref()) => {
                debug!(
                    format = %name,
                    kept = incumbent.specificity(),
                    rejected = handler.specificity(),
                    "kept more specific export handler"
                );
            }
            _ => {
                debug!(format = %name, specificity = handler.specificity(), "export handler registered");
                self.handlers.insert(name, handler);
            }
        }
    }

    pub fn resolve(&self, format: &str) -> Option<Arc<dyn ExportHandler>> {
        self.handlers.get(format).cloned()
    }

    pub fn registered_formats(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Built-in handler: packages every per-target file plus a metadata JSON
/// into one deflate-compressed zip archive.
pub struct ZipArchiveHandler;

impl ExportHandler for ZipArchiveHandler {
    fn format_name(&self) -> &str {
        "zip"
    }

    fn specificity(&self) -> u32 {
        0
    }

    fn finalize(
        &self,
        target_files: &[PathBuf],
        metadata: &JobMetadata,
        output_dir: &Path,
    ) -> Result<PathBuf, ExportError> {
        let archive_path = output_dir.join(format!("export-{}.zip", metadata.job_id));
        let file = File::create(&archive_path)?;
        let mut writer = ZipWriter::new(file);
        let options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);

        for path in target_files {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("target.txt");
            writer
                .start_file(name, options)
                .map_err(|e| ExportError::Task(format!("zip entry '{name}' failed: {e}")))?;
            let mut contents = Vec::new();
            File::open(path)?.read_to_end(&mut contents)?;
            writer.write_all(&contents)?;
        }

        writer
            .start_file("metadata.json", options)
            .map_err(|e| ExportError::Task(format!("zip metadata entry failed: {e}")))?;
        let metadata_json = serde_json::to_vec_pretty(metadata)
            .map_err(|e| ExportError::Task(format!("metadata serialization failed: {e}")))?;
        writer.write_all(&metadata_json)?;

        writer
            .finish()
            .map_err(|e| ExportError::Task(format!("zip finalize failed: {e}")))?;

        info!(
            archive = %archive_path.display(),
            files = target_files.len(),
            "export archive written"
        );
        Ok(archive_path)
    }
}
