// ==============================================================================
// lib.rs - Genotype Exporter Library
// ==============================================================================
// Description: Chunked streaming export pipeline turning an ordered store
//              cursor into strictly-ordered per-individual output files
// Author: Matt Barham
// Created: 2026-02-03
// Modified: 2026-02-03
// Version: 1.0.0
// ==============================================================================

pub mod concurrency;
pub mod context;
pub mod error;
pub mod grouper;
pub mod models;
pub mod pipeline;
pub mod producer;
pub mod progress;
pub mod registry;
pub mod reorder;
pub mod sink;
pub mod store;

pub use context::{ExportContext, JobMetadata, QualityThreshold};
pub use error::{ExportError, StoreError};
pub use models::{Chunk, GenotypeCode, GenotypeRecord, VariantGroup, VariantKey};
pub use pipeline::{run_adaptive, run_single_flight, ExportConfig, ExportJob, ExportSummary};
pub use progress::ProgressTracker;
pub use sink::{GenotypeDecoder, OutputTarget, WriterSink};
