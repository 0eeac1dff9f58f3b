// ==============================================================================
// pipeline.rs - Export Pipeline Drivers
// ==============================================================================
// Description: Job configuration plus the two supported drivers: the
//              adaptive mode (parallel restricted re-fetch reconciled
//              through the reorder buffer) and the single-flight mode
//              (ordered record cursor, at most one in-flight write)
// Author: Matt Barham
// Created: 2026-02-03
// Modified: 2026-02-03
// Version: 1.0.0
// ==============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::concurrency::{ConcurrencyController, WorkerBounds};
use crate::error::ExportError;
use crate::grouper::group_records;
use crate::models::Chunk;
use crate::producer::{derive_chunk_size, ChunkFetcher, DirectChunkProducer, KeyPageProducer};
use crate::progress::ProgressTracker;
use crate::reorder::ReorderBuffer;
use crate::sink::WriterSink;
use crate::store::{OrderedKeyCursor, OrderedRecordSource, RecordFetcher, VariantKeySource};

/// Per-job pipeline configuration, validated fail-fast before any work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Explicit chunk size; derived from `desired_records_in_flight` and
    /// the output target count when None. Zero is a configuration error.
    pub chunk_size: Option<usize>,

    /// Target number of records in flight across the pipeline
    pub desired_records_in_flight: usize,

    /// Bounds for the adaptive worker limit
    pub worker_bounds: WorkerBounds,

    /// Interval at which loops observe the cooperative abort flag
    pub poll_interval_ms: u64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            chunk_size: None,
            desired_records_in_flight: 2000,
            worker_bounds: WorkerBounds::default(),
            poll_interval_ms: 50,
        }
    }
}

impl ExportConfig {
    pub(crate) fn resolve_chunk_size(&self, target_count: usize) -> Result<usize, ExportError> {
        if target_count == 0 {
            return Err(ExportError::NoOutputTargets);
        }
        self.worker_bounds.validate()?;
        match self.chunk_size {
            Some(0) => Err(ExportError::InvalidChunkSize(0)),
            Some(size) => Ok(size),
            None => Ok(derive_chunk_size(
                self.desired_records_in_flight,
                target_count,
            )),
        }
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// One export job: stable identity plus its configuration
#[derive(Debug, Clone)]
pub struct ExportJob {
    pub job_id: Uuid,
    pub config: ExportConfig,
}

impl ExportJob {
    pub fn new(config: ExportConfig) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            config,
        }
    }
}

/// Outcome of a finished (or aborted) export job
#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub job_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_chunks: u64,
    pub chunks_written: u64,
    pub variants_exported: u64,
    pub aborted: bool,
}

/// Adaptive driver: pages variant keys, fetches full records with gated
/// parallel workers, reconciles completions through the reorder buffer,
/// and writes strictly ordered chunks through the single writer task.
pub async fn run_adaptive<S>(
    job: &ExportJob,
    source: S,
    fetcher: Arc<dyn RecordFetcher>,
    sink: WriterSink,
    progress: Arc<ProgressTracker>,
) -> Result<ExportSummary, ExportError>
where
    S: VariantKeySource,
{
    let started_at = Utc::now();
    let chunk_size = job.config.resolve_chunk_size(sink.target_count())?;
    let poll = job.config.poll_interval();

    let cursor = OrderedKeyCursor::new(source);
    let total_keys = cursor.total_keys().await?;
    if total_keys == 0 {
        return Err(ExportError::EmptyCursor);
    }
    // Key pages are exactly chunk_size long except the last, so the chunk
    // count is known up front
    let total_chunks = total_keys.div_ceil(chunk_size as u64);

    info!(
        job_id = %job.job_id,
        total_keys,
        total_chunks,
        chunk_size,
        "starting adaptive export"
    );

    let controller = Arc::new(ConcurrencyController::with_bounds(job.config.worker_bounds));
    let buffer: Arc<ReorderBuffer<Chunk>> = Arc::new(ReorderBuffer::new());
    let chunk_fetcher = Arc::new(ChunkFetcher::new(fetcher));

    // Single writer: consumes sequence numbers gapless and in order,
    // groups each chunk by variant, and hands it to the sink (single-flight
    // by construction: this is the only task touching the sink)
    let writer = {
        let buffer = Arc::clone(&buffer);
        let progress = Arc::clone(&progress);
        let mut sink = sink;
        tokio::spawn(async move {
            let mut written: u64 = 0;
            while written < total_chunks {
                if progress.should_stop() {
                    break;
                }
                // Bounded wait so the abort flag is observed within one
                // polling interval even while the expected chunk is missing
                match timeout(poll, buffer.take_next(written)).await {
                    Ok(chunk) => {
                        let groups = group_records(chunk.records);
                        sink.write_chunk(&groups, &progress);
                        if progress.should_stop() {
                            break;
                        }
                        written += 1;
                        progress.set_current_step_progress((written * 100 / total_chunks) as u8);
                    }
                    Err(_elapsed) => continue,
                }
            }
            (sink, written)
        })
    };

    // Production loop: admission-checked fetch workers. The first worker
    // runs synchronously to avoid a startup burst.
    let mut producer = KeyPageProducer::new(cursor, chunk_size);
    let mut first_worker = true;

    loop {
        if progress.should_stop() {
            break;
        }
        if !controller.may_launch(buffer.len()) {
            tokio::time::sleep(poll).await;
            continue;
        }

        let page = match producer.next_page().await {
            Ok(Some(page)) => page,
            Ok(None) => break,
            Err(err) => {
                progress.set_error(err.to_string());
                break;
            }
        };

        controller.on_worker_launched();
        let sequence = page.sequence;

        if first_worker {
            first_worker = false;
            match chunk_fetcher.fetch(page).await {
                Ok(chunk) => {
                    if let Err(err) = buffer.insert(sequence, chunk) {
                        progress.set_error(err.to_string());
                    }
                }
                Err(err) => progress.set_error(err.to_string()),
            }
            controller.on_worker_completed(sequence);
        } else {
            let chunk_fetcher = Arc::clone(&chunk_fetcher);
            let buffer = Arc::clone(&buffer);
            let controller = Arc::clone(&controller);
            let progress = Arc::clone(&progress);
            tokio::spawn(async move {
                match chunk_fetcher.fetch(page).await {
                    Ok(chunk) => {
                        if let Err(err) = buffer.insert(sequence, chunk) {
                            progress.set_error(err.to_string());
                        }
                    }
                    Err(err) => progress.set_error(err.to_string()),
                }
                controller.on_worker_completed(sequence);
            });
        }
    }

    // Cursor exhausted early: chunks the writer is still expecting will
    // never arrive, which is an invariant violation, not a normal end
    let produced = producer.produced();
    if produced < total_chunks && !progress.should_stop() {
        let err = ExportError::MissingChunks {
            written: produced,
            total_chunks,
        };
        warn!(%err, "cursor ended before all expected chunks were produced");
        progress.set_error(err.to_string());
    }

    let (mut sink, written) = writer
        .await
        .map_err(|err| ExportError::Task(err.to_string()))?;

    if let Some(message) = progress.error() {
        return Err(ExportError::Failed(message));
    }
    if progress.is_aborted() {
        info!(job_id = %job.job_id, written, "export aborted cooperatively");
        return Ok(ExportSummary {
            job_id: job.job_id,
            started_at,
            finished_at: Utc::now(),
            total_chunks,
            chunks_written: written,
            variants_exported: sink.variants_written(),
            aborted: true,
        });
    }

    sink.finish(&progress);
    if let Some(message) = progress.error() {
        return Err(ExportError::Failed(message));
    }
    progress.set_current_step_progress(100);

    info!(job_id = %job.job_id, written, "adaptive export complete");
    Ok(ExportSummary {
        job_id: job.job_id,
        started_at,
        finished_at: Utc::now(),
        total_chunks,
        chunks_written: written,
        variants_exported: sink.variants_written(),
        aborted: false,
    })
}

/// Single-flight driver: the source cursor is already totally ordered, so
/// no reorder buffer is needed. At most one write operation is in flight;
/// memory is bounded to one chunk being written plus one being assembled.
pub async fn run_single_flight<S>(
    job: &ExportJob,
    source: S,
    sink: WriterSink,
    progress: Arc<ProgressTracker>,
) -> Result<ExportSummary, ExportError>
where
    S: OrderedRecordSource,
{
    let started_at = Utc::now();
    let chunk_size = job.config.resolve_chunk_size(sink.target_count())?;

    let mut producer = DirectChunkProducer::new(source, chunk_size);
    let total_keys = producer.total_keys().await?;
    if total_keys == 0 {
        return Err(ExportError::EmptyCursor);
    }
    // Look-ahead may merge a boundary-straddling key run into the previous
    // chunk, so this is an upper bound used only for progress reporting
    let estimated_chunks = total_keys.div_ceil(chunk_size as u64);

    info!(
        job_id = %job.job_id,
        total_keys,
        estimated_chunks,
        chunk_size,
        "starting single-flight export"
    );

    let mut sink_slot: Option<WriterSink> = Some(sink);
    let mut in_flight: Option<tokio::task::JoinHandle<WriterSink>> = None;
    let mut written: u64 = 0;

    loop {
        if progress.should_stop() {
            break;
        }

        let chunk = match producer.next_chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(err) => {
                progress.set_error(err.to_string());
                break;
            }
        };

        // Wait for the previous write before dispatching the next one
        let mut sink = match in_flight.take() {
            Some(handle) => {
                let sink = handle
                    .await
                    .map_err(|err| ExportError::Task(err.to_string()))?;
                written += 1;
                progress
                    .set_current_step_progress((written * 100 / estimated_chunks).min(99) as u8);
                sink
            }
            None => sink_slot.take().expect("sink available before first write"),
        };

        if progress.should_stop() {
            sink_slot = Some(sink);
            break;
        }

        debug!(sequence = chunk.sequence, records = chunk.len(), "dispatching write");
        let progress_for_write = Arc::clone(&progress);
        in_flight = Some(tokio::spawn(async move {
            let groups = group_records(chunk.records);
            sink.write_chunk(&groups, &progress_for_write);
            sink
        }));
    }

    // Drain the trailing write
    let mut sink = match in_flight.take() {
        Some(handle) => {
            let sink = handle
                .await
                .map_err(|err| ExportError::Task(err.to_string()))?;
            written += 1;
            sink
        }
        None => sink_slot.take().expect("sink present"),
    };

    if let Some(message) = progress.error() {
        return Err(ExportError::Failed(message));
    }
    if progress.is_aborted() {
        info!(job_id = %job.job_id, written, "export aborted cooperatively");
        return Ok(ExportSummary {
            job_id: job.job_id,
            started_at,
            finished_at: Utc::now(),
            total_chunks: producer.produced(),
            chunks_written: written,
            variants_exported: sink.variants_written(),
            aborted: true,
        });
    }

    sink.finish(&progress);
    if let Some(message) = progress.error() {
        return Err(ExportError::Failed(message));
    }
    progress.set_current_step_progress(100);

    info!(job_id = %job.job_id, written, "single-flight export complete");
    Ok(ExportSummary {
        job_id: job.job_id,
        started_at,
        finished_at: Utc::now(),
        total_chunks: producer.produced(),
        chunks_written: written,
        variants_exported: sink.variants_written(),
        aborted: false,
    })
}
