// ==============================================================================
// producer.rs - Chunk Production
// ==============================================================================
// Description: Pages the ordered cursor into sequence-numbered chunks.
//              Direct mode slices an already-ordered record cursor with
//              look-ahead; restricted mode pages keys and re-fetches full
//              records with a local re-sort.
// Author: Matt Barham
// Created: 2026-02-03
// Modified: 2026-02-03
// Version: 1.0.0
// ==============================================================================

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{ExportError, StoreError};
use crate::models::{Chunk, GenotypeRecord, VariantKey};
use crate::store::{OrderedKeyCursor, OrderedRecordSource, RecordFetcher, VariantKeySource};

/// Floor for the derived chunk size
pub const MIN_CHUNK_SIZE: usize = 10;

/// Derive the chunk size from the desired number of records in flight and
/// the number of output targets: more consumers means smaller chunks,
/// clamped to a sane floor.
pub fn derive_chunk_size(desired_in_flight: usize, target_count: usize) -> usize {
    (desired_in_flight / target_count.max(1)).max(MIN_CHUNK_SIZE)
}

/// One page of variant keys with its assigned sequence number
#[derive(Debug, Clone)]
pub struct KeyPage {
    pub sequence: u64,
    pub keys: Vec<VariantKey>,
}

/// Pages the ordered key cursor into fixed-size key batches, assigning each
/// batch the next dense sequence number.
pub struct KeyPageProducer<S: VariantKeySource> {
    cursor: OrderedKeyCursor<S>,
    chunk_size: usize,
    next_sequence: u64,
}

impl<S: VariantKeySource> KeyPageProducer<S> {
    pub fn new(cursor: OrderedKeyCursor<S>, chunk_size: usize) -> Self {
        Self {
            cursor,
            chunk_size,
            next_sequence: 0,
        }
    }

    /// Next key page, or None once the cursor is exhausted
    pub async fn next_page(&mut self) -> Result<Option<KeyPage>, ExportError> {
        let keys = self.cursor.next_page(self.chunk_size).await?;
        if keys.is_empty() {
            return Ok(None);
        }
        let page = KeyPage {
            sequence: self.next_sequence,
            keys,
        };
        self.next_sequence += 1;
        debug!(sequence = page.sequence, keys = page.keys.len(), "key page produced");
        Ok(Some(page))
    }

    /// Sequence numbers handed out so far (== chunks produced)
    pub fn produced(&self) -> u64 {
        self.next_sequence
    }
}

/// Fetches full genotype records for a key page via the restricted query.
///
/// The restricted query cannot always reuse the collation-aware ordering
/// index, so the returned batch is re-sorted locally by (key, record id)
/// before grouping. A missing supporting index is healed once for the
/// whole job; the failed query is retried exactly once.
pub struct ChunkFetcher {
    fetcher: Arc<dyn RecordFetcher>,
    index_created: tokio::sync::Mutex<bool>,
}

impl ChunkFetcher {
    pub fn new(fetcher: Arc<dyn RecordFetcher>) -> Self {
        Self {
            fetcher,
            index_created: tokio::sync::Mutex::new(false),
        }
    }

    /// Fetch, re-sort, and verify the records for one key page
    pub async fn fetch(&self, page: KeyPage) -> Result<Chunk, ExportError> {
        let mut records = match self.fetcher.fetch_by_keys(&page.keys).await {
            Ok(records) => records,
            Err(err) if err.is_missing_index() => {
                self.heal_index(&err).await?;
                self.fetcher.fetch_by_keys(&page.keys).await?
            }
            Err(err) => return Err(err.into()),
        };

        records.sort_by(GenotypeRecord::chunk_order);
        verify_key_coverage(&page.keys, &records)?;

        Ok(Chunk {
            sequence: page.sequence,
            records,
        })
    }

    /// Create the supporting index at most once per job; concurrent workers
    /// that hit the same failure wait here and then retry their own query.
    async fn heal_index(&self, err: &StoreError) -> Result<(), ExportError> {
        let mut created = self.index_created.lock().await;
        if !*created {
            warn!(%err, "restricted fetch lacks its supporting index, creating it");
            self.fetcher.create_supporting_index().await?;
            *created = true;
        }
        Ok(())
    }
}

/// Invariant check: every requested key must be covered by at least one
/// fetched record. A mismatch is fatal and reports which keys went missing.
fn verify_key_coverage(
    requested: &[VariantKey],
    records: &[GenotypeRecord],
) -> Result<(), ExportError> {
    let returned: BTreeSet<&VariantKey> = records.iter().map(|r| &r.key).collect();
    if returned.len() == requested.len() {
        return Ok(());
    }
    let missing: Vec<String> = requested
        .iter()
        .filter(|key| !returned.contains(key))
        .map(|key| key.to_string())
        .collect();
    Err(ExportError::KeyCoverageMismatch {
        requested: requested.len(),
        returned: returned.len(),
        missing,
    })
}

/// Slices an already-ordered record cursor into chunks without ever
/// splitting one variant key's contiguous run across two chunks: at the
/// nominal size boundary it looks one record ahead and keeps extending the
/// chunk while the next record shares the current key.
pub struct DirectChunkProducer<S: OrderedRecordSource> {
    source: S,
    chunk_size: usize,
    next_sequence: u64,
    lookahead: Option<GenotypeRecord>,
    index_created: bool,
}

impl<S: OrderedRecordSource> DirectChunkProducer<S> {
    pub fn new(source: S, chunk_size: usize) -> Self {
        Self {
            source,
            chunk_size,
            next_sequence: 0,
            lookahead: None,
            index_created: false,
        }
    }

    /// Total number of distinct keys the source will yield
    pub async fn total_keys(&self) -> Result<u64, StoreError> {
        self.source.total_keys().await
    }

    async fn next_record(&mut self) -> Result<Option<GenotypeRecord>, ExportError> {
        if let Some(record) = self.lookahead.take() {
            return Ok(Some(record));
        }
        match self.source.next_record().await {
            Ok(record) => Ok(record),
            Err(err) if err.is_missing_index() && !self.index_created => {
                warn!(%err, "ordered record scan lacks its supporting index, creating it and retrying once");
                self.index_created = true;
                self.source.create_ordering_index().await?;
                Ok(self.source.next_record().await?)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Next chunk of fully materialized records, or None once exhausted
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>, ExportError> {
        let mut records: Vec<GenotypeRecord> = Vec::with_capacity(self.chunk_size);

        while records.len() < self.chunk_size {
            match self.next_record().await? {
                Some(record) => records.push(record),
                None => break,
            }
        }

        // Look-ahead: extend past the nominal size while the next record
        // still belongs to the chunk's last variant
        if records.len() >= self.chunk_size {
            loop {
                match self.next_record().await? {
                    Some(next) => {
                        let last_key = &records.last().expect("chunk non-empty").key;
                        if next.key == *last_key {
                            records.push(next);
                        } else {
                            self.lookahead = Some(next);
                            break;
                        }
                    }
                    None => break,
                }
            }
        }

        if records.is_empty() {
            return Ok(None);
        }

        let chunk = Chunk {
            sequence: self.next_sequence,
            records,
        };
        self.next_sequence += 1;
        debug!(sequence = chunk.sequence, records = chunk.len(), "direct chunk produced");
        Ok(Some(chunk))
    }

    pub fn produced(&self) -> u64 {
        self.next_sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    fn record(seq: &str, pos: u64, id: &str) -> GenotypeRecord {
        GenotypeRecord {
            key: VariantKey::positioned(seq, pos),
            record_id: id.to_string(),
            project_id: "p1".to_string(),
            run_id: "r1".to_string(),
            sample_set_id: "e1".to_string(),
            genotypes: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    struct VecRecordSource {
        records: Vec<GenotypeRecord>,
        offset: usize,
    }

    #[async_trait]
    impl OrderedRecordSource for VecRecordSource {
        async fn total_keys(&self) -> Result<u64, StoreError> {
            let keys: BTreeSet<_> = self.records.iter().map(|r| &r.key).collect();
            Ok(keys.len() as u64)
        }

        async fn next_record(&mut self) -> Result<Option<GenotypeRecord>, StoreError> {
            let next = self.records.get(self.offset).cloned();
            self.offset += 1;
            Ok(next)
        }

        async fn create_ordering_index(&mut self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    /// Fetcher that returns records shuffled and optionally drops keys
    struct ScrambledFetcher {
        drop_key: Option<VariantKey>,
        missing_index_failures: std::sync::atomic::AtomicUsize,
        index_builds: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl RecordFetcher for ScrambledFetcher {
        async fn fetch_by_keys(
            &self,
            keys: &[VariantKey],
        ) -> Result<Vec<GenotypeRecord>, StoreError> {
            use std::sync::atomic::Ordering;
            if self
                .missing_index_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::MissingIndex("run.start_restricted".to_string()));
            }

            // Two records per key, returned in reverse order
            let mut out = Vec::new();
            for (i, key) in keys.iter().enumerate().rev() {
                if self.drop_key.as_ref() == Some(key) {
                    continue;
                }
                out.push(GenotypeRecord {
                    key: key.clone(),
                    record_id: format!("r{i}-b"),
                    ..record("x", 0, "unused")
                });
                out.push(GenotypeRecord {
                    key: key.clone(),
                    record_id: format!("r{i}-a"),
                    ..record("x", 0, "unused")
                });
            }
            Ok(out)
        }

        async fn create_supporting_index(&self) -> Result<(), StoreError> {
            self.index_builds
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    fn scrambled(drop_key: Option<VariantKey>, failures: usize) -> ChunkFetcher {
        ChunkFetcher::new(Arc::new(ScrambledFetcher {
            drop_key,
            missing_index_failures: std::sync::atomic::AtomicUsize::new(failures),
            index_builds: std::sync::atomic::AtomicUsize::new(0),
        }))
    }

    fn page(positions: &[u64]) -> KeyPage {
        KeyPage {
            sequence: 0,
            keys: positions
                .iter()
                .map(|p| VariantKey::positioned("chr1", *p))
                .collect(),
        }
    }

    #[test]
    fn test_chunk_size_derivation() {
        // More consumers => smaller chunks
        assert_eq!(derive_chunk_size(2000, 4), 500);
        assert_eq!(derive_chunk_size(2000, 100), 20);
        // Clamped to the floor
        assert_eq!(derive_chunk_size(2000, 1000), MIN_CHUNK_SIZE);
        assert_eq!(derive_chunk_size(0, 1), MIN_CHUNK_SIZE);
    }

    #[tokio::test]
    async fn test_restricted_fetch_resorts_locally() {
        let fetcher = scrambled(None, 0);
        let chunk = fetcher.fetch(page(&[100, 200, 300])).await.unwrap();

        // (key, record id) order despite the scrambled store response
        let order: Vec<String> = chunk
            .records
            .iter()
            .map(|r| format!("{}/{}", r.key, r.record_id))
            .collect();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order, sorted);
        assert_eq!(chunk.len(), 6);
    }

    #[tokio::test]
    async fn test_missing_key_coverage_is_fatal_with_detail() {
        let dropped = VariantKey::positioned("chr1", 200);
        let fetcher = scrambled(Some(dropped), 0);
        let err = fetcher.fetch(page(&[100, 200, 300])).await.unwrap_err();

        match err {
            ExportError::KeyCoverageMismatch {
                requested,
                returned,
                missing,
            } => {
                assert_eq!(requested, 3);
                assert_eq!(returned, 2);
                assert_eq!(missing, vec!["chr1:200".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_restricted_fetch_heals_index_once() {
        let fetcher = scrambled(None, 1);
        let chunk = fetcher.fetch(page(&[100, 200])).await.unwrap();
        assert_eq!(chunk.len(), 4);
    }

    #[tokio::test]
    async fn test_direct_producer_never_splits_a_key_run() {
        // Key runs: 100 x1, 200 x3, 300 x1 with nominal chunk size 2:
        // the look-ahead must keep all three 200-records in chunk 0
        let source = VecRecordSource {
            records: vec![
                record("chr1", 100, "a"),
                record("chr1", 200, "b1"),
                record("chr1", 200, "b2"),
                record("chr1", 200, "b3"),
                record("chr1", 300, "c"),
            ],
            offset: 0,
        };
        let mut producer = DirectChunkProducer::new(source, 2);

        let first = producer.next_chunk().await.unwrap().unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(
            first
                .records
                .iter()
                .map(|r| r.record_id.as_str())
                .collect::<Vec<_>>(),
            vec!["a", "b1", "b2", "b3"]
        );

        let second = producer.next_chunk().await.unwrap().unwrap();
        assert_eq!(second.sequence, 1);
        assert_eq!(second.records[0].record_id, "c");

        assert!(producer.next_chunk().await.unwrap().is_none());
        assert_eq!(producer.produced(), 2);
    }

    #[tokio::test]
    async fn test_direct_producer_sequences_are_dense() {
        let source = VecRecordSource {
            records: (0..7)
                .map(|i| record("chr1", (i + 1) * 10, &format!("r{i}")))
                .collect(),
            offset: 0,
        };
        let mut producer = DirectChunkProducer::new(source, 3);

        let mut sizes = Vec::new();
        let mut expected_seq = 0;
        while let Some(chunk) = producer.next_chunk().await.unwrap() {
            assert_eq!(chunk.sequence, expected_seq);
            expected_seq += 1;
            sizes.push(chunk.len());
        }
        assert_eq!(sizes, vec![3, 3, 1]);
    }
}
