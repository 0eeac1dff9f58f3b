// ==============================================================================
// store.rs - Document Store Collaborator Interfaces
// ==============================================================================
// Description: Narrow async traits over the variant store plus the
//              self-healing ordered key cursor adapter
// Author: Matt Barham
// Created: 2026-02-03
// Modified: 2026-02-03
// Version: 1.0.0
// ==============================================================================
// The concrete store client (query/index/collation mechanics) lives outside
// this crate; the pipeline only consumes the traits below. Documents arrive
// pre-sorted by the numeric-aware collation on (sequence name, position),
// see models::natural_cmp.
// ==============================================================================

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::models::{GenotypeRecord, VariantKey};

/// Paged source of variant keys in collation order.
#[async_trait]
pub trait VariantKeySource: Send {
    /// Total number of keys the cursor will yield. Drives the total chunk
    /// count; zero fails the job before any work starts.
    async fn total_keys(&self) -> Result<u64, StoreError>;

    /// Next page of at most `max` keys; an empty page means exhaustion.
    async fn next_keys(&mut self, max: usize) -> Result<Vec<VariantKey>, StoreError>;

    /// Create the compound collation index backing the ordered scan
    async fn create_ordering_index(&mut self) -> Result<(), StoreError>;
}

/// Source of fully materialized genotype records, already in collation
/// order (direct mode: no restricted re-fetch or local re-sort needed).
#[async_trait]
pub trait OrderedRecordSource: Send {
    /// Total number of distinct variant keys the cursor will yield
    async fn total_keys(&self) -> Result<u64, StoreError>;

    /// Next record in collation order, or None when exhausted
    async fn next_record(&mut self) -> Result<Option<GenotypeRecord>, StoreError>;

    /// Create the compound collation index backing the ordered scan
    async fn create_ordering_index(&mut self) -> Result<(), StoreError>;
}

/// Restricted fetch collaborator: all records whose key is in a given page.
/// The returned order is NOT guaranteed to match the global collation;
/// callers must re-sort locally before grouping.
#[async_trait]
pub trait RecordFetcher: Send + Sync {
    async fn fetch_by_keys(&self, keys: &[VariantKey]) -> Result<Vec<GenotypeRecord>, StoreError>;

    /// Create the supporting index for the restricted query
    async fn create_supporting_index(&self) -> Result<(), StoreError>;
}

/// Ordered key cursor over a `VariantKeySource` that self-heals a missing
/// supporting index: on the first `MissingIndex` failure it creates the
/// index and retries the same page exactly once. Any further store error
/// propagates as fatal.
pub struct OrderedKeyCursor<S: VariantKeySource> {
    source: S,
    index_created: bool,
    exhausted: bool,
}

impl<S: VariantKeySource> OrderedKeyCursor<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            index_created: false,
            exhausted: false,
        }
    }

    /// Total number of keys the underlying source will yield
    pub async fn total_keys(&self) -> Result<u64, StoreError> {
        self.source.total_keys().await
    }

    /// Next page of at most `max` keys; empty once the cursor is exhausted
    pub async fn next_page(&mut self, max: usize) -> Result<Vec<VariantKey>, StoreError> {
        if self.exhausted {
            return Ok(Vec::new());
        }

        let keys = match self.source.next_keys(max).await {
            Ok(keys) => keys,
            Err(err) if err.is_missing_index() && !self.index_created => {
                warn!(%err, "ordered scan lacks its supporting index, creating it and retrying once");
                self.index_created = true;
                self.source.create_ordering_index().await?;
                self.source.next_keys(max).await?
            }
            Err(err) => return Err(err),
        };

        if keys.is_empty() {
            debug!("key cursor exhausted");
            self.exhausted = true;
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Key source that fails with MissingIndex a configurable number of
    /// times before serving pages of keys.
    struct FlakySource {
        keys: Vec<VariantKey>,
        offset: usize,
        failures_left: usize,
        index_builds: usize,
    }

    impl FlakySource {
        fn new(count: usize, failures: usize) -> Self {
            let keys = (0..count)
                .map(|i| VariantKey::positioned("chr1", (i as u64 + 1) * 100))
                .collect();
            Self {
                keys,
                offset: 0,
                failures_left: failures,
                index_builds: 0,
            }
        }
    }

    #[async_trait]
    impl VariantKeySource for FlakySource {
        async fn total_keys(&self) -> Result<u64, StoreError> {
            Ok(self.keys.len() as u64)
        }

        async fn next_keys(&mut self, max: usize) -> Result<Vec<VariantKey>, StoreError> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(StoreError::MissingIndex("run.start".to_string()));
            }
            let end = (self.offset + max).min(self.keys.len());
            let page = self.keys[self.offset..end].to_vec();
            self.offset = end;
            Ok(page)
        }

        async fn create_ordering_index(&mut self) -> Result<(), StoreError> {
            self.index_builds += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_missing_index_heals_once_and_retries() {
        let mut cursor = OrderedKeyCursor::new(FlakySource::new(5, 1));

        let page = cursor.next_page(3).await.unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(cursor.source.index_builds, 1);

        let page = cursor.next_page(3).await.unwrap();
        assert_eq!(page.len(), 2);

        // Exhausted: further pages are empty without touching the source
        assert!(cursor.next_page(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_missing_index_failure_is_fatal() {
        // Two consecutive failures: the retry after index creation fails too
        let mut cursor = OrderedKeyCursor::new(FlakySource::new(5, 2));

        let err = cursor.next_page(3).await.unwrap_err();
        assert!(err.is_missing_index());
        assert_eq!(cursor.source.index_builds, 1);
    }

    #[tokio::test]
    async fn test_pages_preserve_collation_order() {
        let mut cursor = OrderedKeyCursor::new(FlakySource::new(4, 0));
        let mut all = Vec::new();
        loop {
            let page = cursor.next_page(3).await.unwrap();
            if page.is_empty() {
                break;
            }
            all.extend(page);
        }
        let mut sorted = all.clone();
        sorted.sort();
        assert_eq!(all, sorted);
    }
}
