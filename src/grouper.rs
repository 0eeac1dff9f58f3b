// ==============================================================================
// grouper.rs - Streaming Variant Grouping
// ==============================================================================
// Description: Turns a key-ordered record sequence into per-variant groups
// Author: Matt Barham
// Created: 2026-02-03
// Modified: 2026-02-03
// Version: 1.0.0
// ==============================================================================
// The producer guarantees a variant key is never split across two chunks
// (look-ahead at the chunk boundary), so grouping needs no carry-over state
// between chunks: each chunk is grouped independently, restartable only
// from the start of a chunk.
// ==============================================================================

use crate::models::{GenotypeRecord, VariantGroup};

/// Streaming group-by over records ordered by variant key.
///
/// Emits one `VariantGroup` per maximal run of equal keys, in input order.
pub struct VariantGrouper<I: Iterator<Item = GenotypeRecord>> {
    records: I,
    /// First record of the next group, read while closing the current one
    pending: Option<GenotypeRecord>,
}

impl<I: Iterator<Item = GenotypeRecord>> VariantGrouper<I> {
    pub fn new(records: I) -> Self {
        Self {
            records,
            pending: None,
        }
    }
}

impl<I: Iterator<Item = GenotypeRecord>> Iterator for VariantGrouper<I> {
    type Item = VariantGroup;

    fn next(&mut self) -> Option<VariantGroup> {
        let first = self.pending.take().or_else(|| self.records.next())?;
        let key = first.key.clone();
        let mut records = vec![first];

        for record in self.records.by_ref() {
            if record.key == key {
                records.push(record);
            } else {
                self.pending = Some(record);
                break;
            }
        }

        Some(VariantGroup { key, records })
    }
}

/// Group a whole chunk's records at once
pub fn group_records(records: Vec<GenotypeRecord>) -> Vec<VariantGroup> {
    VariantGrouper::new(records.into_iter()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VariantKey;
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

    #[test]
    fn test_groups_runs_of_equal_keys() {
        // Keys [A, A, B, B, B, C] -> groups [[A, A], [B, B, B], [C]]
        let records = vec![
            record("chr1", 100, "a1"),
            record("chr1", 100, "a2"),
            record("chr1", 200, "b1"),
            record("chr1", 200, "b2"),
            record("chr1", 200, "b3"),
            record("chr2", 50, "c1"),
        ];

        let groups = group_records(records);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].key, VariantKey::positioned("chr1", 100));
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[1].len(), 3);
        assert_eq!(groups[2].len(), 1);
        assert_eq!(groups[2].records[0].record_id, "c1");
    }

    #[test]
    fn test_single_record_forms_single_group() {
        let groups = group_records(vec![record("chr1", 100, "only")]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 1);
    }

    #[test]
    fn test_empty_input_yields_no_groups() {
        let groups = group_records(Vec::new());
        assert!(groups.is_empty());
    }

    #[test]
    fn test_group_order_matches_input_order() {
        let records = vec![
            record("chr2", 10, "x"),
            record("chr10", 5, "y"),
            record("chr10", 5, "z"),
        ];
        let groups: Vec<_> = VariantGrouper::new(records.into_iter()).collect();
        assert_eq!(groups[0].key, VariantKey::positioned("chr2", 10));
        assert_eq!(groups[1].key, VariantKey::positioned("chr10", 5));
        assert_eq!(groups[1].records.len(), 2);
    }
}
