//! Metrics collected while tagging reads.
//!
//! Each [`crate::tagger::ReadTagger`] owns a [`TagStats`] that counts, per read, a set of
//! independent outcomes.  Workers tagging chunks in parallel keep private [`TagStats`] that are
//! combined with [`TagStats::update_with`].  At the end of a run the counts of one or two taggers
//! are written as a [`RunStats`] JSON record.
//!
//! The [`BarcodeTableRow`] describes how many usable and ambiguous patterns each barcode ended
//! up with, which helps to diagnose barcode sets that collide.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;

use ahash::AHashMap;
use anyhow::{Context, Result};
use bstr::ByteSlice;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::barcodes::Barcode;
use crate::matcher::PatternIndex;
use crate::tagger::TaggedRead;
use crate::utils::{open_output, write_tsv};

/// Counters of tagging outcomes.  A read may increment several of them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagStats {
    /// Reads with a barcode but no amplicon beyond the primer.
    pub n_only_primer: u64,
    /// Reads carrying more than one distinct barcode.
    pub n_multiple_bcs: u64,
    /// Reads without any barcode.
    pub n_no_barcode: u64,
    /// Reads whose barcode matched with a substitution.
    pub n_barcode_mismatch: u64,
    /// Reads with bases before the barcode.
    pub n_junk: u64,
    /// Reads with a barcode and an amplicon.
    pub n_regular: u64,
}

impl TagStats {
    /// Count the outcomes of a single tagged read.
    pub fn record(&mut self, read: &TaggedRead) {
        self.n_only_primer += u64::from(read.is_just_primer());
        self.n_multiple_bcs += u64::from(read.has_multiple_barcodes());
        self.n_no_barcode += u64::from(read.barcode().is_none());
        self.n_barcode_mismatch += u64::from(read.barcode_mismatch());
        self.n_junk += u64::from(read.junk().is_some());
        self.n_regular += u64::from(read.is_regular());
    }

    /// Add the counts of `other` to this one.
    pub fn update_with(&mut self, other: &Self) {
        self.n_only_primer += other.n_only_primer;
        self.n_multiple_bcs += other.n_multiple_bcs;
        self.n_no_barcode += other.n_no_barcode;
        self.n_barcode_mismatch += other.n_barcode_mismatch;
        self.n_junk += other.n_junk;
        self.n_regular += other.n_regular;
    }
}

/// The statistics written at the end of a tagging run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    /// The number of reads (or read pairs) processed.
    pub n_reads: u64,
    pub read1: TagStats,
    /// The number of pairs where both reads were regular; paired runs only.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub n_both_regular: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub read2: Option<TagStats>,
}

impl RunStats {
    /// Write the stats as pretty-printed JSON to `path` (`-` for stdout).
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut writer = open_output(path)?;
        serde_json::to_writer_pretty(&mut writer, self)
            .with_context(|| format!("Failed to write stats to {}", path.display()))?;
        writeln!(writer)?;
        writer.flush()?;
        Ok(())
    }
}

/// A per-barcode summary of the pattern index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarcodeTableRow {
    pub id: String,
    pub sequence: String,
    /// The number of patterns that still identify this barcode.
    pub n_patterns: usize,
    /// The number of this barcode's patterns dropped because another barcode shares them.
    pub n_ambiguous: usize,
    /// Comma separated ids of the barcodes sharing a pattern with this one.
    pub collides_with: String,
}

impl BarcodeTableRow {
    /// Summarise `index` per barcode, in barcode file order.
    pub fn from_index(barcodes: &[Barcode], index: &PatternIndex) -> Vec<Self> {
        let mut n_patterns: AHashMap<usize, usize> = AHashMap::new();
        for (_, barcode) in index.iter() {
            *n_patterns.entry(barcode).or_insert(0) += 1;
        }

        let mut n_ambiguous: AHashMap<usize, usize> = AHashMap::new();
        let mut partners: AHashMap<usize, BTreeSet<usize>> = AHashMap::new();
        for (_, pairs) in index.collisions() {
            // Pairs are stored in both orders, so the first element covers every barcode involved
            for barcode in pairs.iter().map(|(a, _)| *a).unique() {
                *n_ambiguous.entry(barcode).or_insert(0) += 1;
            }
            for (a, b) in pairs {
                partners.entry(*a).or_default().insert(*b);
            }
        }

        barcodes
            .iter()
            .enumerate()
            .map(|(i, barcode)| Self {
                id: barcode.id.clone(),
                sequence: barcode.sequence.to_str_lossy().into_owned(),
                n_patterns: n_patterns.get(&i).copied().unwrap_or(0),
                n_ambiguous: n_ambiguous.get(&i).copied().unwrap_or(0),
                collides_with: partners
                    .get(&i)
                    .map(|others| others.iter().map(|o| barcodes[*o].id.as_str()).join(","))
                    .unwrap_or_default(),
            })
            .collect()
    }

    /// Write the rows as a TSV with a header to `path` (`-` for stdout).
    pub fn write_tsv<P: AsRef<Path>>(path: P, rows: Vec<Self>) -> Result<()> {
        let path = path.as_ref();
        write_tsv(path, rows)
            .with_context(|| format!("Failed to write barcode table to {}", path.display()))
    }
}
