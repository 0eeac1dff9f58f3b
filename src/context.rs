// ==============================================================================
// context.rs - Export Context and Job Metadata
// ==============================================================================
// Description: Explicit per-process (or per-test-fixture) context handle
//              replacing process-wide static registries; carries job
//              metadata handed to the export handler after the pipeline
// Author: Matt Barham
// Created: 2026-02-03
// Modified: 2026-02-03
// Version: 1.0.0
// ==============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ExportError;
use crate::registry::{ExportHandler, HandlerRegistry, ZipArchiveHandler};
use crate::sink::InclusionFilter;

/// Quality threshold for filtering imputed genotype contributions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityThreshold {
    /// No filtering - include all contributions
    NoFilter,
    /// R² ≥ 0.8
    R080,
    /// R² ≥ 0.9
    R090,
}

impl QualityThreshold {
    /// Get the numeric threshold value
    pub fn value(&self) -> Option<f64> {
        match self {
            QualityThreshold::NoFilter => None,
            QualityThreshold::R080 => Some(0.8),
            QualityThreshold::R090 => Some(0.9),
        }
    }

    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            QualityThreshold::NoFilter => "No filtering (all contributions)",
            QualityThreshold::R080 => "R² ≥ 0.8 (good quality)",
            QualityThreshold::R090 => "R² ≥ 0.9 (high quality)",
        }
    }

    /// Inclusion filter for the writer sink: records carrying an "r2"
    /// annotation below the threshold are excluded; records without the
    /// annotation (directly genotyped) always pass.
    pub fn inclusion_filter(&self) -> InclusionFilter {
        let threshold = *self;
        Arc::new(move |record, _sample| match threshold.value() {
            None => true,
            Some(min) => record
                .annotations
                .get("r2")
                .and_then(|v| v.parse::<f64>().ok())
                .map_or(true, |quality| quality >= min),
        })
    }
}

impl Default for QualityThreshold {
    fn default() -> Self {
        QualityThreshold::NoFilter
    }
}

/// Per-job metadata handed to the export handler with the written files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    pub job_id: Uuid,
    pub created_at: DateTime<Utc>,

    /// Variant key -> display synonym, rendered into the final artifact
    #[serde(default)]
    pub synonym_map: HashMap<String, String>,

    /// Individuals excluded from the export by the caller
    #[serde(default)]
    pub filtered_individuals: Vec<String>,

    #[serde(default)]
    pub quality_threshold: QualityThreshold,
}

impl JobMetadata {
    pub fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            created_at: Utc::now(),
            synonym_map: HashMap::new(),
            filtered_individuals: Vec::new(),
            quality_threshold: QualityThreshold::default(),
        }
    }
}

/// Explicit context passed to pipeline construction instead of process-wide
/// static maps. Owns the handler registry and the job metadata; scoped to
/// the process or to a test fixture with defined init/teardown.
pub struct ExportContext {
    registry: HandlerRegistry,
    metadata: JobMetadata,
}

impl ExportContext {
    /// Context with the built-in handlers registered
    pub fn new(metadata: JobMetadata) -> Self {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(ZipArchiveHandler));
        Self { registry, metadata }
    }

    /// Context without built-in handlers (test fixtures)
    pub fn empty(metadata: JobMetadata) -> Self {
        Self {
            registry: HandlerRegistry::new(),
            metadata,
        }
    }

    pub fn metadata(&self) -> &JobMetadata {
        &self.metadata
    }

    pub fn register_handler(&mut self, handler: Arc<dyn ExportHandler>) {
        self.registry.register(handler);
    }

    pub fn registered_formats(&self) -> Vec<String> {
        self.registry.registered_formats()
    }

    /// Resolve the handler for `format` and build the final artifact from
    /// the written per-target files
    pub fn finalize(
        &self,
        format: &str,
        target_files: &[PathBuf],
        output_dir: &Path,
    ) -> Result<PathBuf, ExportError> {
        let handler = self
            .registry
            .resolve(format)
            .ok_or_else(|| ExportError::Task(format!("no export handler for format '{format}'")))?;
        handler.finalize(target_files, &self.metadata, output_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GenotypeRecord, VariantKey};
    use std::collections::BTreeMap;

    fn record_with_r2(r2: Option<&str>) -> GenotypeRecord {
        let mut annotations = BTreeMap::new();
        if let Some(value) = r2 {
            annotations.insert("r2".to_string(), value.to_string());
        }
        GenotypeRecord {
            key: VariantKey::positioned("chr1", 100),
            record_id: "r".to_string(),
            project_id: "p1".to_string(),
            run_id: "r1".to_string(),
            sample_set_id: "e1".to_string(),
            genotypes: BTreeMap::new(),
            annotations,
        }
    }

    #[test]
    fn test_threshold_values() {
        assert_eq!(QualityThreshold::NoFilter.value(), None);
        assert_eq!(QualityThreshold::R080.value(), Some(0.8));
        assert_eq!(QualityThreshold::R090.value(), Some(0.9));
    }

    #[test]
    fn test_threshold_filter_excludes_low_quality() {
        let filter = QualityThreshold::R090.inclusion_filter();
        assert!(filter(&record_with_r2(Some("0.95")), "s1"));
        assert!(!filter(&record_with_r2(Some("0.5")), "s1"));
        // Genotyped records (no annotation) always pass
        assert!(filter(&record_with_r2(None), "s1"));
    }

    #[test]
    fn test_no_filter_passes_everything() {
        let filter = QualityThreshold::NoFilter.inclusion_filter();
        assert!(filter(&record_with_r2(Some("0.01")), "s1"));
    }

    #[test]
    fn test_context_registers_builtin_zip_handler() {
        let context = ExportContext::new(JobMetadata::new(Uuid::new_v4()));
        assert_eq!(context.registered_formats(), vec!["zip".to_string()]);
    }

    #[test]
    fn test_unknown_format_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let context = ExportContext::empty(JobMetadata::new(Uuid::new_v4()));
        let err = context.finalize("zip", &[], dir.path()).unwrap_err();
        assert!(err.to_string().contains("no export handler"));
    }

    #[test]
    fn test_metadata_serde_defaults() {
        let json = format!(r#"{{"job_id":"{}","created_at":"2026-02-03T00:00:00Z"}}"#, Uuid::new_v4());
        let metadata: JobMetadata = serde_json::from_str(&json).unwrap();
        assert!(metadata.synonym_map.is_empty());
        assert_eq!(metadata.quality_threshold, QualityThreshold::NoFilter);
    }
}
