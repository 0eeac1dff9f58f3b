// ==============================================================================
// models.rs - Export Pipeline Data Models
// ==============================================================================
// Description: Variant keys, genotype records, chunks, and variant groups
// Author: Matt Barham
// Created: 2026-02-03
// Modified: 2026-02-03
// Version: 1.0.0
// ==============================================================================

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Numeric-aware comparison of sequence names, matching the store's collation.
///
/// Digit runs compare by numeric value, everything else case-insensitively,
/// so "chr2" sorts before "chr10" and "chr2" before "chrX".
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (ab, bb) = (a.as_bytes(), b.as_bytes());
    let (mut i, mut j) = (0usize, 0usize);

    while i < ab.len() && j < bb.len() {
        if ab[i].is_ascii_digit() && bb[j].is_ascii_digit() {
            let si = i;
            while i < ab.len() && ab[i].is_ascii_digit() {
                i += 1;
            }
            let sj = j;
            while j < bb.len() && bb[j].is_ascii_digit() {
                j += 1;
            }
            // Compare digit runs by value: strip leading zeros, then
            // longer run wins, then lexicographic on equal length
            let ra = a[si..i].trim_start_matches('0');
            let rb = b[sj..j].trim_start_matches('0');
            let ord = ra.len().cmp(&rb.len()).then_with(|| ra.cmp(rb));
            if ord != Ordering::Equal {
                return ord;
            }
        } else {
            let ord = ab[i]
                .to_ascii_lowercase()
                .cmp(&bb[j].to_ascii_lowercase());
            if ord != Ordering::Equal {
                return ord;
            }
            i += 1;
            j += 1;
        }
    }

    (ab.len() - i).cmp(&(bb.len() - j))
}

/// Total-ordered identifier for a variant within one export job.
///
/// Positioned keys order by (sequence name, start position) under the
/// numeric-aware collation, with the raw sequence string as the final
/// tiebreak so distinct spellings of collation-equal names stay distinct.
/// Keys without a known position sort before all positioned keys and
/// compare by raw key among themselves, mirroring the store's collation
/// so output order equals cursor order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VariantKey {
    /// Sequence (chromosome/contig) name, or the raw key for unpositioned variants
    pub sequence: String,

    /// Start position on the sequence; None for unpositioned variants
    pub position: Option<u64>,
}

impl VariantKey {
    /// Key for a variant with a known genomic position
    pub fn positioned(sequence: impl Into<String>, position: u64) -> Self {
        Self {
            sequence: sequence.into(),
            position: Some(position),
        }
    }

    /// Key for a variant without a known position (raw key ordering applies)
    pub fn unpositioned(raw: impl Into<String>) -> Self {
        Self {
            sequence: raw.into(),
            position: None,
        }
    }
}

impl fmt::Display for VariantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.position {
            Some(pos) => write!(f, "{}:{}", self.sequence, pos),
            None => write!(f, "{}", self.sequence),
        }
    }
}

impl Ord for VariantKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.position, other.position) {
            // The raw tiebreak keeps Ord consistent with the derived Eq when
            // the collation treats two spellings as equal ("chr02" vs "chr2")
            (Some(p), Some(q)) => natural_cmp(&self.sequence, &other.sequence)
                .then(p.cmp(&q))
                .then_with(|| self.sequence.cmp(&other.sequence)),
            // Unpositioned variants sort before positioned ones
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (None, None) => self.sequence.cmp(&other.sequence),
        }
    }
}

impl PartialOrd for VariantKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Compact encoded genotype (allele-index representation) as stored.
///
/// Decoding a code to its display representation may require allele
/// lookup/translation and is deliberately kept out of the data model
/// (see `sink::GenotypeDecoder`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenotypeCode(pub i32);

/// One genotype document as fetched from the store. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenotypeRecord {
    /// The variant this record belongs to
    pub key: VariantKey,

    /// Stable record identifier; secondary sort key within a variant
    pub record_id: String,

    /// Owning project
    pub project_id: String,

    /// Sequencing/genotyping run that produced this record
    pub run_id: String,

    /// Contributing sample-set within the run
    pub sample_set_id: String,

    /// Sample identifier -> encoded genotype code
    pub genotypes: BTreeMap<String, GenotypeCode>,

    /// Optional per-run annotation fields (e.g., imputation quality "r2")
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl GenotypeRecord {
    /// Ordering used by the producer's local re-sort: key first, then the
    /// stable record id so equal-key records keep a deterministic order.
    pub fn chunk_order(a: &GenotypeRecord, b: &GenotypeRecord) -> Ordering {
        a.key
            .cmp(&b.key)
            .then_with(|| a.record_id.cmp(&b.record_id))
    }
}

/// A sequence-numbered batch of records produced by one pagination step.
///
/// The sequence number is the sole ordering authority downstream; fetch
/// completion order is never used for output order.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Dense, 0-based sequence number assigned at production time
    pub sequence: u64,

    /// Records ordered by (key, record id)
    pub records: Vec<GenotypeRecord>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// All genotype records for one variant key, merged across contributing
/// runs/projects. Built once per variant, consumed once by the sink.
#[derive(Debug, Clone)]
pub struct VariantGroup {
    pub key: VariantKey,
    pub records: Vec<GenotypeRecord>,
}

impl VariantGroup {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
