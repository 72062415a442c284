//! Count barcode pairs per amplicon from paired, tagged and amplicon-annotated reads.
//!
//! Each mate of a pair carries a barcode (from its tagged FASTQ header) and an amplicon call
//! (from an external mapping step).  Pairs are keyed by their two barcode ids in sorted order, so
//! `(A, B)` and `(B, A)` count together, and accumulate into two tables:
//!
//! - `both` counts every pair, under the shared amplicon when both mates agree or under one of the
//!   categories [`CountTarget::Unmapped`], [`CountTarget::OneMapped`] or [`CountTarget::Mismatch`].
//! - `one` counts only pairs where a concrete amplicon can be credited: both mates agree, or
//!   exactly one of them was mapped.

use std::fmt::{self, Display};
use std::path::Path;
use std::str::FromStr;

use ahash::AHashMap;
use anyhow::{anyhow, Context, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::utils::write_tsv;

/// The amplicon id used by mapping files for reads that could not be mapped.
pub const UNMAPPED_AMPLICON: &str = "*";

/// The amplicon call for a single read, parsed from a mapping file line of the form
/// `<amplicon id or *>\t<matched sequence>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmpliconCall {
    /// The amplicon, `None` when unmapped.
    pub amplicon: Option<String>,
    /// The length of the sequence that supported the call.
    pub match_length: usize,
}

impl FromStr for AmpliconCall {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim_end_matches(|c| c == '\n' || c == '\r');
        let (amplicon, matched) = line
            .split_once('\t')
            .ok_or_else(|| anyhow!("Expected `<amplicon>\\t<match>` but found: {}", line))?;
        let amplicon = match amplicon.trim() {
            "" => return Err(anyhow!("Empty amplicon in mapping line: {}", line)),
            UNMAPPED_AMPLICON => None,
            amp => Some(amp.to_string()),
        };
        Ok(Self { amplicon, match_length: matched.trim().len() })
    }
}

/// The information the counter needs about one mate of a pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairSide {
    /// The barcode id, `None` spelled out for reads without a barcode.
    pub barcode: String,
    pub barcode_mismatch: bool,
    pub amplicon: AmpliconCall,
}

/// What a count is credited to: a concrete amplicon or a category of disagreement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CountTarget {
    Amplicon(String),
    /// Neither mate was mapped.
    Unmapped,
    /// Exactly one mate was mapped.
    OneMapped,
    /// Both mates were mapped to different amplicons.
    Mismatch,
}

impl Display for CountTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CountTarget::Amplicon(amplicon) => f.write_str(amplicon),
            CountTarget::Unmapped => f.write_str("-unmapped"),
            CountTarget::OneMapped => f.write_str("-one-mapped"),
            CountTarget::Mismatch => f.write_str("-mismatch"),
        }
    }
}

/// A barcode pair in canonical order together with the count target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CountKey {
    pub bc_l: String,
    pub bc_r: String,
    pub target: CountTarget,
}

impl CountKey {
    /// Build a key, sorting the two barcode ids.
    pub fn new(bc_a: &str, bc_b: &str, target: CountTarget) -> Self {
        let (bc_l, bc_r) = if bc_a <= bc_b { (bc_a, bc_b) } else { (bc_b, bc_a) };
        Self { bc_l: bc_l.to_string(), bc_r: bc_r.to_string(), target }
    }
}

/// A row of an output count table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountRow {
    pub bc_l: String,
    pub bc_r: String,
    pub amp: String,
    pub count: u64,
}

/// A table of counts per [`CountKey`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CountTable(AHashMap<CountKey, u64>);

impl CountTable {
    pub fn increment(&mut self, key: CountKey) {
        *self.0.entry(key).or_insert(0) += 1;
    }

    pub fn get(&self, key: &CountKey) -> u64 {
        self.0.get(key).copied().unwrap_or(0)
    }

    /// The number of distinct keys.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The sum of all counts.
    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    /// Add all counts of `other` into this table.
    pub fn update_with(&mut self, other: &Self) {
        for (key, count) in &other.0 {
            *self.0.entry(key.clone()).or_insert(0) += count;
        }
    }

    /// The table's rows sorted by key.
    pub fn rows(&self) -> Vec<CountRow> {
        self.0
            .iter()
            .sorted_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(key, count)| CountRow {
                bc_l: key.bc_l.clone(),
                bc_r: key.bc_r.clone(),
                amp: key.target.to_string(),
                count: *count,
            })
            .collect()
    }

    /// Write the table as a TSV with a `bc_l bc_r amp count` header to `path` (`-` for stdout).
    pub fn write_tsv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        write_tsv(path, self.rows())
            .with_context(|| format!("Failed to write counts to {}", path.display()))
    }
}

/// The `both` and `one` tables filled by a [`PairCounter`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CountTables {
    pub both: CountTable,
    pub one: CountTable,
}

impl CountTables {
    pub fn update_with(&mut self, other: &Self) {
        self.both.update_with(&other.both);
        self.one.update_with(&other.one);
    }
}

/// Policies applied while counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairCounterConfig {
    /// Count pairs whose barcodes matched through a substitution.
    pub allow_mismatch: bool,
    /// Treat amplicon calls supported by fewer bases as unmapped.
    pub min_amplicon_match: Option<usize>,
}

impl Default for PairCounterConfig {
    fn default() -> Self {
        Self { allow_mismatch: true, min_amplicon_match: None }
    }
}

/// Accumulates [`CountTables`] from read pairs.
#[derive(Debug, Default)]
pub struct PairCounter {
    config: PairCounterConfig,
    tables: CountTables,
    /// Pairs counted.
    pub n_pairs: u64,
    /// Pairs skipped because a barcode matched with a substitution.
    pub n_skipped_mismatch: u64,
}

impl PairCounter {
    pub fn new(config: PairCounterConfig) -> Self {
        Self { config, ..Self::default() }
    }

    /// Apply the minimum match length to an amplicon call.
    fn resolve<'c>(&self, call: &'c AmpliconCall) -> Option<&'c str> {
        match self.config.min_amplicon_match {
            Some(min) if call.match_length < min => None,
            _ => call.amplicon.as_deref(),
        }
    }

    /// Count one read pair.
    pub fn count(&mut self, left: &PairSide, right: &PairSide) {
        if !self.config.allow_mismatch && (left.barcode_mismatch || right.barcode_mismatch) {
            self.n_skipped_mismatch += 1;
            return;
        }
        let key = |target| CountKey::new(&left.barcode, &right.barcode, target);

        match (self.resolve(&left.amplicon), self.resolve(&right.amplicon)) {
            (Some(l), Some(r)) if l == r => {
                self.tables.both.increment(key(CountTarget::Amplicon(l.to_string())));
                self.tables.one.increment(key(CountTarget::Amplicon(l.to_string())));
            }
            (Some(_), Some(_)) => self.tables.both.increment(key(CountTarget::Mismatch)),
            (Some(amp), None) | (None, Some(amp)) => {
                self.tables.both.increment(key(CountTarget::OneMapped));
                self.tables.one.increment(key(CountTarget::Amplicon(amp.to_string())));
            }
            (None, None) => self.tables.both.increment(key(CountTarget::Unmapped)),
        }
        self.n_pairs += 1;
    }

    pub fn tables(&self) -> &CountTables {
        &self.tables
    }

    pub fn into_tables(self) -> CountTables {
        self.tables
    }
}
