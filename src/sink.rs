// ==============================================================================
// sink.rs - Per-Target Output Writing
// ==============================================================================
// Description: Consumes ordered chunks of variant groups, decodes and
//              dedupes genotype representations, and flushes per-individual
//              append-only text files
// Author: Matt Barham
// Created: 2026-02-03
// Modified: 2026-02-03
// Version: 1.0.0
// ==============================================================================
// Output file convention (per target):
//   line 1            target display name
//   one line/variant  decoded values joined by the multi-value separator,
//                     or an empty line when no record contributes (the
//                     missing marker keeps positional alignment)
// ==============================================================================

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::ExportError;
use crate::models::{GenotypeCode, GenotypeRecord, VariantGroup};
use crate::progress::ProgressTracker;

/// Separator between multiple distinct decoded values on one line
pub const DEFAULT_MULTI_VALUE_SEPARATOR: &str = "/";

/// Decodes an encoded genotype code to its display representation.
/// Decoding may be expensive (allele lookup/translation); the sink caches
/// results per variant group so each distinct code decodes at most once.
pub trait GenotypeDecoder: Send + Sync {
    fn decode(&self, code: GenotypeCode) -> Result<String, ExportError>;
}

/// Per-sample inclusion predicate (group-membership/threshold checks)
/// applied before a record contributes to a target.
pub type InclusionFilter = Arc<dyn Fn(&GenotypeRecord, &str) -> bool + Send + Sync>;

/// One addressable output consumer (e.g., one individual's file) with a
/// positional index that is stable for the whole job.
#[derive(Debug)]
pub struct OutputTarget {
    /// Stable position of this target within the job
    pub index: usize,

    /// Written as the file's first line
    pub display_name: String,

    /// Sample identifier whose genotypes feed this target
    pub sample_id: String,

    /// Append-only external resource, opened only while flushing
    pub path: PathBuf,

    buffer: String,
    header_written: bool,
}

impl OutputTarget {
    pub fn new(
        index: usize,
        display_name: impl Into<String>,
        sample_id: impl Into<String>,
        path: PathBuf,
    ) -> Self {
        Self {
            index,
            display_name: display_name.into(),
            sample_id: sample_id.into(),
            path,
            buffer: String::new(),
            header_written: false,
        }
    }
}

/// Single-flight writer: consumes one ordered chunk of variant groups at a
/// time. The driver enforces at most one outstanding `write_chunk` call;
/// the sink itself holds no locks.
pub struct WriterSink {
    targets: Vec<OutputTarget>,
    decoder: Arc<dyn GenotypeDecoder>,
    filter: Option<InclusionFilter>,
    separator: String,

    /// Initial-capacity hint seeded from the first target's buffer length
    /// after its first populated entry; reused for all later allocations
    capacity_hint: Option<usize>,

    variants_written: u64,

    /// Remaining flush attempts to fail with a transient error (tests only)
    #[cfg(test)]
    flush_faults: std::sync::atomic::AtomicU32,
}

impl WriterSink {
    pub fn new(targets: Vec<OutputTarget>, decoder: Arc<dyn GenotypeDecoder>) -> Self {
        Self {
            targets,
            decoder,
            filter: None,
            separator: DEFAULT_MULTI_VALUE_SEPARATOR.to_string(),
            capacity_hint: None,
            variants_written: 0,
            #[cfg(test)]
            flush_faults: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub fn with_filter(mut self, filter: InclusionFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    /// Variants rendered so far (== data lines per target)
    pub fn variants_written(&self) -> u64 {
        self.variants_written
    }

    /// Paths of all target files, in positional order
    pub fn target_paths(&self) -> Vec<PathBuf> {
        self.targets.iter().map(|t| t.path.clone()).collect()
    }

    /// Render one ordered chunk of variant groups into the per-target
    /// buffers and flush them. Failures are recorded into the progress
    /// tracker (first error wins); the caller must consult the tracker
    /// before handing off further chunks.
    pub fn write_chunk(&mut self, groups: &[VariantGroup], progress: &ProgressTracker) {
        for group in groups {
            if progress.should_stop() {
                return;
            }
            if let Err(err) = self.append_group(group) {
                progress.set_error(err.to_string());
                return;
            }
        }
        self.flush(progress);
    }

    /// Render one variant group: one line per target, missing marker
    /// (empty line) when nothing contributes.
    fn append_group(&mut self, group: &VariantGroup) -> Result<(), ExportError> {
        // Decode each distinct code at most once per group
        let mut decode_cache: HashMap<GenotypeCode, String> = HashMap::new();

        for index in 0..self.targets.len() {
            let sample_id = self.targets[index].sample_id.clone();
            // Order-preserving dedup of decoded values for this target
            let mut values: Vec<String> = Vec::new();

            for record in &group.records {
                let Some(code) = record.genotypes.get(&sample_id) else {
                    continue;
                };
                if let Some(filter) = &self.filter {
                    if !filter(record, &sample_id) {
                        continue;
                    }
                }
                let decoded = match decode_cache.get(code) {
                    Some(value) => value.clone(),
                    None => {
                        let value = self.decoder.decode(*code)?;
                        decode_cache.insert(*code, value.clone());
                        value
                    }
                };
                if !values.contains(&decoded) {
                    values.push(decoded);
                }
            }

            let target = &mut self.targets[index];
            if target.buffer.is_empty() {
                if let Some(hint) = self.capacity_hint {
                    target.buffer.reserve(hint);
                }
            }
            if !values.is_empty() {
                target.buffer.push_str(&values.join(&self.separator));
            }
            target.buffer.push('\n');

            // Seed the capacity hint from the first target's first
            // populated entry; amortizes reallocation without a size estimate
            if self.capacity_hint.is_none() && index == 0 && !values.is_empty() {
                self.capacity_hint = Some(self.targets[0].buffer.len());
            }
        }

        self.variants_written += 1;
        Ok(())
    }

    /// Flush every target's buffer to its append-only file. Resources are
    /// opened per flush and closed again so descriptor usage stays bounded
    /// for large target counts. A failed flush is retried once, then
    /// recorded into the tracker.
    fn flush(&mut self, progress: &ProgressTracker) {
        let hint = self.capacity_hint.unwrap_or(0);
        for index in 0..self.targets.len() {
            if let Err(first) = self.try_flush(index, hint) {
                warn!(
                    target_name = %self.targets[index].display_name,
                    error = %first,
                    "flush failed, retrying once"
                );
                if let Err(second) = self.try_flush(index, hint) {
                    let err = ExportError::Flush {
                        target: self.targets[index].display_name.clone(),
                        source: second,
                    };
                    progress.set_error(err.to_string());
                    return;
                }
            }
        }
        debug!(targets = self.targets.len(), "chunk flushed");
    }

    /// One flush attempt for the target at `index`
    fn try_flush(&mut self, index: usize, hint: usize) -> std::io::Result<()> {
        #[cfg(test)]
        if self
            .flush_faults
            .fetch_update(
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
                |n| n.checked_sub(1),
            )
            .is_ok()
        {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "transient flush fault",
            ));
        }
        Self::flush_target(&mut self.targets[index], hint)
    }

    fn flush_target(target: &mut OutputTarget, hint: usize) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&target.path)?;

        if !target.header_written {
            writeln!(file, "{}", target.display_name)?;
            target.header_written = true;
        }
        // Empty buffer writes nothing; earlier missing markers stay intact
        file.write_all(target.buffer.as_bytes())?;

        target.buffer = String::with_capacity(hint);
        Ok(())
    }

    /// Flush any remaining buffered lines at end of job
    pub fn finish(&mut self, progress: &ProgressTracker) {
        self.flush(progress);
        info!(
            targets = self.targets.len(),
            variants = self.variants_written,
            "writer sink finished"
        );
    }
}
