#![forbid(unsafe_code)]

use std::{num::NonZeroUsize, path::PathBuf};

use anyhow::{ensure, Result};
use clap::{Args, Parser, Subcommand};
use env_logger::Env;

use crate::{
    counter::PairCounterConfig,
    utils::{built_info, is_stdio, NUM_CPU},
};

pub static TOOL_NAME: &str = "bartseq";

static SHORT_USAGE: &str =
    "Tags amplicon sequencing reads with their barcodes and counts barcode pairs per amplicon.";

static LONG_USAGE: &str = "
Tags amplicon sequencing reads with their barcodes and counts barcode pairs per amplicon.

Reads are expected to be laid out as `junk | barcode | linker | amplicon`.  Barcodes are found
anywhere in a read, allowing a single substitution.  Substituted patterns shared by two
barcodes are reported and not used.

The workflow has three steps:

  1. `tag` finds the barcode in each read, trims barcode and linker, and writes the amplicon
     with the tagging results appended to the read header.
  2. The amplicons are mapped by an external tool to a TSV with one `<amplicon|*>\\t<match>`
     line per read.
  3. `count` combines tagged reads and mappings of both mates into barcode pair counts.

`browse` joins tagged reads and mappings into a single TSV for inspection.

Inputs may be plain or BGZF (bgzip) compressed.  Outputs ending in `.gz` are BGZF compressed.
Use `-` for stdin or stdout.

Example invocation:

bartseq tag \\
  --bc-file barcodes.fa \\
  --stats-file lib1_stats.json \\
  --in-2 lib1_R2.fastq.gz --out-2 tagged/lib1_R2.fastq.gz \\
  lib1_R1.fastq.gz tagged/lib1_R1.fastq.gz
";

#[derive(Parser, Debug, Clone)]
#[clap(name = TOOL_NAME, version = built_info::VERSION.as_str(), about=SHORT_USAGE, long_about=LONG_USAGE, term_width=0)]
pub struct Opts {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Tag reads with their barcode and trim them to the amplicon.
    Tag(TagOpts),
    /// Count barcode pairs per amplicon from tagged and mapped read pairs.
    Count(CountOpts),
    /// Join tagged reads and their mappings into one TSV.
    Browse(BrowseOpts),
}

#[derive(Args, Debug, Clone)]
pub struct TagOpts {
    /// Input FASTQ, or the first read of pairs.
    #[clap(display_order = 1)]
    pub in_1: PathBuf,

    /// Output FASTQ for `in-1`.
    #[clap(display_order = 2)]
    pub out_1: PathBuf,

    /// Input FASTQ with the second read of pairs.
    ///
    /// When given, only pairs where both reads carry a barcode and an amplicon are written.
    #[clap(long, requires = "out_2", display_order = 3)]
    pub in_2: Option<PathBuf>,

    /// Output FASTQ for `in-2`.
    #[clap(long, requires = "in_2", display_order = 4)]
    pub out_2: Option<PathBuf>,

    /// Barcode file: FASTA, or a TSV of `<id>\t<sequence>` with a header line.
    #[clap(long, short = 'b', display_order = 5)]
    pub bc_file: PathBuf,

    /// Where to write the tagging statistics as JSON.
    #[clap(long, short = 's', display_order = 6)]
    pub stats_file: PathBuf,

    /// Where to write a TSV with usable and ambiguous patterns per barcode.
    #[clap(long, display_order = 7)]
    pub bc_table: Option<PathBuf>,

    /// Length of the primer following the linker.
    ///
    /// Reads with no more than this many bases after the linker are "just primer".
    #[clap(long, default_value = "27", display_order = 11)]
    pub len_primer: usize,

    /// Length of the linker between barcode and amplicon.
    #[clap(long, default_value = "10", display_order = 11)]
    pub len_linker: usize,

    /// Number of threads for tagging.
    #[clap(long, short = 't', default_value = NUM_CPU.as_str(), display_order = 31)]
    pub threads: usize,

    /// The number of reads to extract from a FASTQ at one time.
    ///
    /// A "chunk" is the unit of parallelization for tagging.
    #[clap(long, short = 'c', default_value = "1000", display_order = 31, hide = true)]
    pub chunksize: NonZeroUsize,

    /// The number of threads to use for decompression for each reader.
    #[clap(long, default_value = "4", display_order = 31, hide = true)]
    pub decompression_threads_per_reader: usize,
}

impl TagOpts {
    /// True when tagging read pairs.
    pub fn is_paired(&self) -> bool {
        self.in_2.is_some()
    }

    /// Check option combinations that clap cannot express.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.threads > 0, "--threads must be at least 1");
        ensure!(
            self.in_2.is_some() == self.out_2.is_some(),
            "--in-2 and --out-2 must be given together"
        );
        if let (Some(in_2), Some(out_2)) = (&self.in_2, &self.out_2) {
            ensure!(
                !(is_stdio(&self.in_1) && is_stdio(in_2)),
                "Only one of in-1 and --in-2 may be read from stdin"
            );
            ensure!(
                !(is_stdio(&self.out_1) && is_stdio(out_2)),
                "Only one of out-1 and --out-2 may be written to stdout"
            );
            ensure!(&self.in_1 != in_2, "in-1 and --in-2 must differ");
            ensure!(&self.out_1 != out_2, "out-1 and --out-2 must differ");
        }
        Ok(())
    }
}

#[derive(Args, Debug, Clone)]
pub struct CountOpts {
    /// The tagged FASTQs of both reads.
    #[clap(long, required = true, number_of_values = 2, value_names = &["R1", "R2"], display_order = 1)]
    pub tagged: Vec<PathBuf>,

    /// The amplicon mappings of both reads: one `<amplicon|*>\t<match>` line per read.
    #[clap(long, required = true, number_of_values = 2, value_names = &["M1", "M2"], display_order = 2)]
    pub mapped: Vec<PathBuf>,

    /// Where to write counts of all pairs, including the `-unmapped`, `-one-mapped` and
    /// `-mismatch` categories.
    #[clap(long, display_order = 3)]
    pub both: PathBuf,

    /// Where to write counts of pairs credited to a single amplicon.
    #[clap(long, display_order = 4)]
    pub one: PathBuf,

    /// Skip pairs where either barcode matched with a substitution.
    #[clap(long, display_order = 11)]
    pub no_mismatch: bool,

    /// Treat amplicon calls supported by fewer matched bases as unmapped.
    ///
    /// [default: None]
    #[clap(long, display_order = 11)]
    pub amp_min: Option<usize>,

    /// The number of threads to use for decompression for each reader.
    #[clap(long, default_value = "4", display_order = 31, hide = true)]
    pub decompression_threads_per_reader: usize,
}

impl CountOpts {
    /// Extract a [`PairCounterConfig`] from the CLI opts.
    pub fn as_counter_config(&self) -> PairCounterConfig {
        PairCounterConfig { allow_mismatch: !self.no_mismatch, min_amplicon_match: self.amp_min }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.tagged.len() == 2, "--tagged takes exactly two FASTQs");
        ensure!(self.mapped.len() == 2, "--mapped takes exactly two mapping files");
        Ok(())
    }
}

#[derive(Args, Debug, Clone)]
pub struct BrowseOpts {
    /// The tagged FASTQs of both reads.
    #[clap(long, required = true, number_of_values = 2, value_names = &["R1", "R2"], display_order = 1)]
    pub tagged: Vec<PathBuf>,

    /// The amplicon mappings of both reads.
    #[clap(long, required = true, number_of_values = 2, value_names = &["M1", "M2"], display_order = 2)]
    pub mapped: Vec<PathBuf>,

    /// Where to write the joined TSV.  A `.gz` suffix writes BGZF.
    #[clap(long, short = 'o', default_value = "-", display_order = 3)]
    pub output: PathBuf,

    /// The number of threads to use for decompression for each reader.
    #[clap(long, default_value = "4", display_order = 31, hide = true)]
    pub decompression_threads_per_reader: usize,
}

impl BrowseOpts {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.tagged.len() == 2, "--tagged takes exactly two FASTQs");
        ensure!(self.mapped.len() == 2, "--mapped takes exactly two mapping files");
        Ok(())
    }
}

/// Implement defaults that match the CLI options to allow for easier testing.
///
/// Note that these defaults exist only within test code.
#[cfg(test)]
impl Default for TagOpts {
    fn default() -> Self {
        Self {
            in_1: PathBuf::default(),
            out_1: PathBuf::default(),
            in_2: None,
            out_2: None,
            bc_file: PathBuf::default(),
            stats_file: PathBuf::default(),
            bc_table: None,
            len_primer: 27,
            len_linker: 10,
            threads: 2,
            chunksize: NonZeroUsize::new(1000).unwrap(),
            decompression_threads_per_reader: 2,
        }
    }
}

#[cfg(test)]
impl Default for CountOpts {
    fn default() -> Self {
        Self {
            tagged: vec![],
            mapped: vec![],
            both: PathBuf::default(),
            one: PathBuf::default(),
            no_mismatch: false,
            amp_min: None,
            decompression_threads_per_reader: 2,
        }
    }
}

/// Parse args and set up logging / tracing
pub fn setup() -> Opts {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    Opts::parse()
}
