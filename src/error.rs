// ==============================================================================
// error.rs - Export Error Taxonomy
// ==============================================================================
// Description: Typed errors for the export pipeline and store collaborators
// Author: Matt Barham
// Created: 2026-02-03
// Modified: 2026-02-03
// Version: 1.0.0
// ==============================================================================

use thiserror::Error;

/// Errors surfaced by the store collaborators (cursor, restricted fetch).
///
/// Only `MissingIndex` is treated as self-healable (create the supporting
/// index, retry the query exactly once); everything else is fatal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("query requires a supporting index: {0}")]
    MissingIndex(String),

    #[error("store query failed: {0}")]
    Query(String),
}

impl StoreError {
    /// True for the one transient class the pipeline self-heals
    pub fn is_missing_index(&self) -> bool {
        matches!(self, StoreError::MissingIndex(_))
    }
}

/// Errors that can occur during an export job
#[derive(Error, Debug)]
pub enum ExportError {
    // Configuration errors fail the job before any work starts
    #[error("export source is empty: the key cursor returned no variants")]
    EmptyCursor,

    #[error("invalid chunk size: {0} (must be at least 1)")]
    InvalidChunkSize(usize),

    #[error("invalid worker bounds: min {min}, initial {initial}, max {max}")]
    InvalidWorkerBounds {
        min: usize,
        initial: usize,
        max: usize,
    },

    #[error("no output targets configured")]
    NoOutputTargets,

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Invariant violation: the restricted fetch did not cover every
    /// requested key. Carries which keys were requested vs. returned.
    #[error(
        "restricted fetch covered {returned} of {requested} requested keys; missing: {missing:?}"
    )]
    KeyCoverageMismatch {
        requested: usize,
        returned: usize,
        missing: Vec<String>,
    },

    /// Invariant violation: the writer ran out of input with chunks outstanding
    #[error("writer consumed {written} of {total_chunks} expected chunks before input ended")]
    MissingChunks { written: u64, total_chunks: u64 },

    #[error("duplicate chunk sequence number {0} inserted into reorder buffer")]
    DuplicateSequence(u64),

    #[error("genotype decode failed for code {code}: {message}")]
    Decode { code: i32, message: String },

    #[error("flush to output target '{target}' failed: {source}")]
    Flush {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// First error recorded in the progress tracker, surfaced at job end
    #[error("export failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("pipeline task failed: {0}")]
    Task(String),
}
