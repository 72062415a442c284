use std::{
    io::{BufRead, BufReader, Lines, Read, Write},
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, ensure, Context, Result};
use bstr::ByteSlice;
use gzp::BUFSIZE;
use itertools::Itertools;
use log::{debug, info, warn};
use rayon::{prelude::*, ThreadPool};
use seq_io::{
    fastq::{self, Record, RecordSet, RefRecord},
    BaseRecord,
};
use serde::Serialize;

use crate::{
    barcodes,
    counter::{AmpliconCall, CountTables, PairCounter, PairSide, UNMAPPED_AMPLICON},
    matcher::{BarcodeMatcher, PatternIndex},
    metrics::{BarcodeTableRow, RunStats, TagStats},
    opts::{BrowseOpts, Command, CountOpts, Opts, TagOpts},
    tagger::{bool_str, ReadTagger, TagAnnotations, TaggedRead},
    thread_reader::ThreadReader,
    utils::{is_broken_pipe, open_input, open_output},
};

/// Log progress every this many reads or pairs.
const PROGRESS_INTERVAL: u64 = 1_000_000;

/// Run the subcommand selected on the command line.
#[cfg(not(tarpaulin_include))]
pub fn run(opts: Opts) -> Result<(), anyhow::Error> {
    match opts.command {
        Command::Tag(opts) => run_tag(&opts).map(|_| ()),
        Command::Count(opts) => run_count(&opts).map(|_| ()),
        Command::Browse(opts) => run_browse(&opts),
    }
}

/// Tag the reads of one or two FASTQs, write the trimmed reads and the stats.
pub fn run_tag(opts: &TagOpts) -> Result<RunStats> {
    opts.validate()?;

    info!("Loading barcodes from {}", opts.bc_file.display());
    let barcodes = barcodes::from_path(&opts.bc_file)
        .with_context(|| format!("Failed to load barcodes from {}", opts.bc_file.display()))?;
    let index = PatternIndex::new(&barcodes);
    info!("Loaded {} barcodes with {} usable patterns", barcodes.len(), index.len());
    if index.is_empty() {
        warn!("Every barcode pattern is ambiguous, no read will be tagged");
    }

    if let Some(bc_table) = &opts.bc_table {
        info!("Writing barcode table to {}", bc_table.display());
        BarcodeTableRow::write_tsv(bc_table, BarcodeTableRow::from_index(&barcodes, &index))?;
    }

    let matcher = BarcodeMatcher::from_index(&index);
    debug!("Built matcher with {} patterns", matcher.num_patterns());
    drop(index);

    let inputs: Vec<PathBuf> =
        std::iter::once(opts.in_1.clone()).chain(opts.in_2.iter().cloned()).collect();
    let outputs: Vec<PathBuf> =
        std::iter::once(opts.out_1.clone()).chain(opts.out_2.iter().cloned()).collect();

    let mut writers = outputs.iter().map(|path| open_output(path)).collect::<Result<Vec<_>>>()?;
    let mut taggers = inputs
        .iter()
        .map(|_| ReadTagger::new(&barcodes, &matcher, opts.len_linker, opts.len_primer))
        .collect::<Vec<_>>();

    info!("Creating reader threads");
    let readers = inputs
        .iter()
        .map(|f| {
            ThreadReader::new(f.clone(), opts.chunksize, opts.decompression_threads_per_reader)
        })
        .collect::<Vec<_>>();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.threads)
        .build()
        .context("Failed to create the tagging thread pool")?;

    info!("Processing data");
    let outcome = tag_all(&readers, &mut taggers, &mut writers, &pool, &inputs);

    info!("Joining reader threads");
    for reader in readers {
        reader.join()?;
    }
    let progress = outcome?;
    if progress.stopped_early {
        info!("Stats cover the {} reads processed before the output was closed", progress.n_reads);
    }

    for (writer, path) in writers.iter_mut().zip(&outputs) {
        let flushed = writer
            .flush()
            .map_err(anyhow::Error::from)
            .with_context(|| format!("Failed to flush {}", path.display()));
        match flushed {
            Err(e) if is_broken_pipe(&e) => debug!("Output {} was closed", path.display()),
            other => other?,
        }
    }
    drop(writers);

    let stats = RunStats {
        n_reads: progress.n_reads,
        read1: *taggers[0].stats(),
        n_both_regular: opts.is_paired().then(|| progress.n_both_regular),
        read2: taggers.get(1).map(|t| *t.stats()),
    };
    info!("Writing stats to {}", opts.stats_file.display());
    stats.write(&opts.stats_file)?;
    Ok(stats)
}

/// The counts the tagging loop keeps besides the taggers' stats.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct TagProgress {
    n_reads: u64,
    n_both_regular: u64,
    /// True if an output was closed before all input was consumed.
    stopped_early: bool,
}

/// Receive one chunk from every reader, or `None` once all inputs are exhausted.
fn next_chunks(readers: &[ThreadReader], inputs: &[PathBuf]) -> Result<Option<Vec<RecordSet>>> {
    let chunks = readers.iter().map(|r| r.rx.recv().ok()).collect::<Vec<_>>();
    if chunks.iter().all(Option::is_none) {
        return Ok(None);
    }
    chunks
        .into_iter()
        .zip(inputs)
        .map(|(chunk, path)| {
            chunk.ok_or_else(|| {
                anyhow!("{} ended before the other input (uneven input FASTQs)", path.display())
            })
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

/// Tag all chunks from `readers`, one tagger and writer per reader, until the inputs are
/// exhausted or an output is closed.
fn tag_all<W: Write>(
    readers: &[ThreadReader],
    taggers: &mut [ReadTagger],
    writers: &mut [W],
    pool: &ThreadPool,
    inputs: &[PathBuf],
) -> Result<TagProgress> {
    let mut progress = TagProgress::default();

    while let Some(chunks) = next_chunks(readers, inputs)? {
        let records: Vec<Vec<RefRecord>> =
            chunks.iter().map(|chunk| chunk.into_iter().collect()).collect();
        ensure!(
            records.iter().map(Vec::len).all_equal(),
            "Unequal number of reads in each record set (likely uneven input FASTQs)"
        );

        let tagged: Vec<(Vec<TaggedRead>, TagStats)> = records
            .iter()
            .zip(taggers.iter())
            .map(|(records, tagger)| pool.install(|| tag_chunk(tagger, records)))
            .collect();
        for (tagger, (_, chunk_stats)) in taggers.iter_mut().zip(&tagged) {
            tagger.merge_stats(chunk_stats);
        }

        let before = progress.n_reads;
        progress.n_reads += records[0].len() as u64;
        let result = write_tagged(&tagged, writers, &mut progress);

        if progress.n_reads / PROGRESS_INTERVAL > before / PROGRESS_INTERVAL {
            info!("Processed {} reads", progress.n_reads);
        }
        match result {
            Err(e) if is_broken_pipe(&e) => {
                warn!("Output was closed, stopping after {} reads", progress.n_reads);
                progress.stopped_early = true;
                break;
            }
            other => other?,
        }
    }
    Ok(progress)
}

/// Tag a chunk of reads in parallel, keeping read order, and count the outcomes.
fn tag_chunk<'r>(
    tagger: &ReadTagger<'r>,
    records: &'r [RefRecord],
) -> (Vec<TaggedRead<'r>>, TagStats) {
    let tagged: Vec<TaggedRead> =
        records.par_iter().map(|r| tagger.tag(r.head(), r.seq(), r.qual())).collect();
    let stats = tagged
        .par_iter()
        .fold(TagStats::default, |mut stats, read| {
            stats.record(read);
            stats
        })
        .reduce(TagStats::default, |mut a, b| {
            a.update_with(&b);
            a
        });
    (tagged, stats)
}

/// Write one tagged chunk per output.  With two outputs only pairs of regular reads are written.
fn write_tagged<W: Write>(
    tagged: &[(Vec<TaggedRead>, TagStats)],
    writers: &mut [W],
    progress: &mut TagProgress,
) -> Result<()> {
    match (tagged, writers) {
        ([(reads, _)], [writer]) => {
            for read in reads {
                read.write(writer).context("Failed to write tagged read")?;
            }
        }
        ([(reads_1, _), (reads_2, _)], [writer_1, writer_2]) => {
            for (read_1, read_2) in reads_1.iter().zip(reads_2) {
                if read_1.is_regular() && read_2.is_regular() {
                    read_1.write(writer_1).context("Failed to write tagged read 1")?;
                    read_2.write(writer_2).context("Failed to write tagged read 2")?;
                    progress.n_both_regular += 1;
                }
            }
        }
        _ => bail!("Expected one or two inputs with matching outputs"),
    }
    Ok(())
}

/// A tagged FASTQ read joined with its line from a mapping file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AnnotatedRead {
    /// The header without annotations.
    header: String,
    sequence: Vec<u8>,
    quality: Vec<u8>,
    annotations: TagAnnotations,
    call: AmpliconCall,
}

/// Reads a tagged FASTQ and its mapping file in lockstep.
struct AnnotatedReads {
    fastq: fastq::Reader<Box<dyn Read>>,
    mapping: Lines<BufReader<Box<dyn Read>>>,
    fastq_path: PathBuf,
    mapping_path: PathBuf,
}

impl AnnotatedReads {
    fn open(fastq_path: &Path, mapping_path: &Path, decompression_threads: usize) -> Result<Self> {
        Ok(Self {
            fastq: fastq::Reader::with_capacity(
                open_input(fastq_path, decompression_threads)?,
                BUFSIZE,
            ),
            mapping: BufReader::new(open_input(mapping_path, decompression_threads)?).lines(),
            fastq_path: fastq_path.to_path_buf(),
            mapping_path: mapping_path.to_path_buf(),
        })
    }

    fn next_read(&mut self) -> Result<Option<AnnotatedRead>> {
        match (self.fastq.next(), self.mapping.next()) {
            (None, None) => Ok(None),
            (Some(record), Some(line)) => {
                let record = record
                    .with_context(|| format!("Failed reading from {}", self.fastq_path.display()))?;
                let line = line
                    .with_context(|| format!("Failed reading from {}", self.mapping_path.display()))?;
                let (header, annotations) = TagAnnotations::parse(record.head())
                    .with_context(|| format!("Invalid header in {}", self.fastq_path.display()))?;
                let call = line
                    .parse::<AmpliconCall>()
                    .with_context(|| format!("Invalid line in {}", self.mapping_path.display()))?;
                Ok(Some(AnnotatedRead {
                    header: header.to_str_lossy().into_owned(),
                    sequence: record.seq().to_vec(),
                    quality: record.qual().to_vec(),
                    annotations,
                    call,
                }))
            }
            (Some(_), None) => bail!(
                "{} has more records than {} has lines",
                self.fastq_path.display(),
                self.mapping_path.display()
            ),
            (None, Some(_)) => bail!(
                "{} has more lines than {} has records",
                self.mapping_path.display(),
                self.fastq_path.display()
            ),
        }
    }
}

impl From<AnnotatedRead> for PairSide {
    fn from(read: AnnotatedRead) -> Self {
        PairSide {
            barcode: read.annotations.barcode_or_none().to_string(),
            barcode_mismatch: read.annotations.barcode_mismatch,
            amplicon: read.call,
        }
    }
}

/// Count barcode pairs from both tagged reads and their mappings, and write the tables.
pub fn run_count(opts: &CountOpts) -> Result<CountTables> {
    opts.validate()?;
    let threads = opts.decompression_threads_per_reader;
    let mut left = AnnotatedReads::open(&opts.tagged[0], &opts.mapped[0], threads)?;
    let mut right = AnnotatedReads::open(&opts.tagged[1], &opts.mapped[1], threads)?;

    info!("Counting barcode pairs");
    let mut counter = PairCounter::new(opts.as_counter_config());
    let mut n_read = 0u64;
    loop {
        match (left.next_read()?, right.next_read()?) {
            (Some(l), Some(r)) => counter.count(&l.into(), &r.into()),
            (None, None) => break,
            _ => bail!(
                "{} and {} have different numbers of reads",
                opts.tagged[0].display(),
                opts.tagged[1].display()
            ),
        }
        n_read += 1;
        if n_read % PROGRESS_INTERVAL == 0 {
            info!("Processed {} pairs", n_read);
        }
    }
    info!(
        "Counted {} pairs, skipped {} with barcode mismatches",
        counter.n_pairs, counter.n_skipped_mismatch
    );

    let tables = counter.into_tables();
    info!("Writing {} and {}", opts.both.display(), opts.one.display());
    tables.both.write_tsv(&opts.both)?;
    tables.one.write_tsv(&opts.one)?;
    Ok(tables)
}

/// A row of the read browser table.
#[derive(Debug, Serialize)]
struct BrowseRow<'a> {
    read: usize,
    header: &'a str,
    read_seq: &'a str,
    quality_seq: &'a str,
    amplicon: &'a str,
    match_len: usize,
    barcode: &'a str,
    linker: &'a str,
    has_multiple_bcs: &'a str,
    is_just_primer: &'a str,
    other_bcs: &'a str,
    has_bc_mismatch: &'a str,
    junk: &'a str,
}

/// Write one browser row for `read`, taken from read number `side` (1 or 2).
fn write_browse_row<W: Write>(
    writer: &mut csv::Writer<W>,
    side: usize,
    read: &AnnotatedRead,
) -> Result<()> {
    let ann = &read.annotations;
    let other_bcs = ann.other_barcodes.join(",");
    let sequence = read.sequence.to_str_lossy();
    let quality = read.quality.to_str_lossy();
    writer.serialize(BrowseRow {
        read: side,
        header: &read.header,
        read_seq: &sequence,
        quality_seq: &quality,
        amplicon: read.call.amplicon.as_deref().unwrap_or(UNMAPPED_AMPLICON),
        match_len: read.call.match_length,
        barcode: ann.barcode.as_deref().unwrap_or_default(),
        linker: ann.linker.as_deref().unwrap_or_default(),
        has_multiple_bcs: bool_str(ann.multiple_barcodes),
        is_just_primer: bool_str(ann.just_primer),
        other_bcs: &other_bcs,
        has_bc_mismatch: bool_str(ann.barcode_mismatch),
        junk: ann.junk.as_deref().unwrap_or_default(),
    })?;
    Ok(())
}

/// Join both tagged reads with their mappings into one TSV, alternating between the reads.
pub fn run_browse(opts: &BrowseOpts) -> Result<()> {
    opts.validate()?;
    let threads = opts.decompression_threads_per_reader;
    let mut sources = vec![
        Some(AnnotatedReads::open(&opts.tagged[0], &opts.mapped[0], threads)?),
        Some(AnnotatedReads::open(&opts.tagged[1], &opts.mapped[1], threads)?),
    ];
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .quote_style(csv::QuoteStyle::Never)
        .from_writer(open_output(&opts.output)?);

    info!("Writing reads to {}", opts.output.display());
    let mut n_rows = 0u64;
    'rows: while sources.iter().any(Option::is_some) {
        for (i, slot) in sources.iter_mut().enumerate() {
            let read = match slot {
                Some(source) => source.next_read()?,
                None => continue,
            };
            let result = match read {
                Some(read) => write_browse_row(&mut writer, i + 1, &read),
                None => {
                    *slot = None;
                    continue;
                }
            };
            match result {
                Err(e) if is_broken_pipe(&e) => {
                    warn!("Output was closed, stopping after {} rows", n_rows);
                    break 'rows;
                }
                other => other?,
            }
            n_rows += 1;
        }
    }

    match writer.flush().map_err(anyhow::Error::from) {
        Err(e) if is_broken_pipe(&e) => debug!("Output {} was closed", opts.output.display()),
        other => other?,
    }
    info!("Wrote {} rows", n_rows);
    Ok(())
}

#[cfg(test)]
mod test {
    use std::{fs, num::NonZeroUsize, path::Path};

    use rstest::rstest;
    use seq_io::{fastq::OwnedRecord, BaseRecord};
    use tempfile::tempdir;

    use super::{run_browse, run_count, run_tag, tag_all, ThreadReader};
    use crate::{
        barcodes::Barcode,
        counter::{CountKey, CountTarget},
        matcher::BarcodeMatcher,
        opts::{BrowseOpts, CountOpts, TagOpts},
        tagger::{ReadTagger, TagAnnotations},
        utils::test_commons::{fq, slurp_fastq, write_lines, write_reads_to_file},
    };

    const BC_1: &str = "ACGTACGT";
    const BC_2: &str = "TTGGCCAA";
    const LINKER: &[u8] = b"GGGG";
    const AMPLICON: &[u8] = b"CATCATCATCATCATCATCAT";

    fn write_barcodes(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("barcodes.fa");
        write_lines(&[">bc1", BC_1, ">bc2", BC_2], &path);
        path
    }

    /// A read of `junk | barcode | linker | amplicon`.
    fn read(name: &str, junk: &[u8], barcode: &[u8], amplicon: &[u8]) -> OwnedRecord {
        fq(name, &[junk, barcode, LINKER, amplicon].concat())
    }

    fn header_annotations(record: &OwnedRecord) -> TagAnnotations {
        TagAnnotations::parse(record.head()).unwrap().1
    }

    fn tag_opts(dir: &Path, in_1: &str, out_1: &str) -> TagOpts {
        TagOpts {
            in_1: dir.join(in_1),
            out_1: dir.join(out_1),
            bc_file: write_barcodes(dir),
            stats_file: dir.join("stats.json"),
            len_linker: LINKER.len(),
            len_primer: 5,
            chunksize: NonZeroUsize::new(2).unwrap(),
            ..TagOpts::default()
        }
    }

    #[rstest]
    fn test_tag_single_end(
        #[values("in.fastq", "in.fastq.gz")] input: &str,
        #[values("out.fastq", "out.fastq.gz")] output: &str,
        #[values(1, 2)] threads: usize,
    ) {
        let dir = tempdir().unwrap();
        let reads = vec![
            read("exact", b"", BC_1.as_bytes(), AMPLICON),
            read("mismatch_junk", b"TT", b"ACGTTCGT", AMPLICON),
            fq("nothing", b"CCCCCCCCCCCCCCCCCCCCCC"),
            read("primer", b"", BC_2.as_bytes(), b"CAT"),
            read("multi", b"", BC_2.as_bytes(), &[AMPLICON, BC_1.as_bytes()].concat()),
        ];
        write_reads_to_file(reads.clone().into_iter(), dir.path().join(input));

        let opts = TagOpts { threads, ..tag_opts(dir.path(), input, output) };
        let stats = run_tag(&opts).unwrap();

        let tagged = slurp_fastq(dir.path().join(output));
        assert_eq!(tagged.len(), 5);

        let names =
            tagged.iter().map(|r| TagAnnotations::parse(r.head()).unwrap().0.to_string()).collect::<Vec<_>>();
        assert_eq!(names, vec!["exact", "mismatch_junk", "nothing", "primer", "multi"]);

        let exact = header_annotations(&tagged[0]);
        assert_eq!(exact.barcode.as_deref(), Some("bc1"));
        assert_eq!(exact.linker.as_deref(), Some("GGGG"));
        assert!(!exact.barcode_mismatch);
        assert_eq!(tagged[0].seq(), AMPLICON);
        assert_eq!(tagged[0].qual(), &reads[0].qual()[BC_1.len() + LINKER.len()..]);

        let mismatch = header_annotations(&tagged[1]);
        assert_eq!(mismatch.barcode.as_deref(), Some("bc1"));
        assert_eq!(mismatch.junk.as_deref(), Some("TT"));
        assert!(mismatch.barcode_mismatch);

        let nothing = header_annotations(&tagged[2]);
        assert_eq!(nothing.barcode, None);
        assert_eq!(tagged[2].seq(), reads[2].seq());

        assert!(header_annotations(&tagged[3]).just_primer);
        let multi = header_annotations(&tagged[4]);
        assert!(multi.multiple_barcodes);
        assert_eq!(multi.other_barcodes, vec!["bc1".to_string()]);

        assert_eq!(stats.n_reads, 5);
        assert_eq!(stats.read1.n_regular, 3);
        assert_eq!(stats.read1.n_no_barcode, 1);
        assert_eq!(stats.read1.n_barcode_mismatch, 1);
        assert_eq!(stats.read1.n_junk, 1);
        assert_eq!(stats.read1.n_only_primer, 1);
        assert_eq!(stats.read1.n_multiple_bcs, 1);
        assert_eq!(stats.n_both_regular, None);
        assert_eq!(stats.read2, None);

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&opts.stats_file).unwrap()).unwrap();
        assert_eq!(json["n_reads"], 5);
        assert!(json.get("read2").is_none());
    }

    #[rstest]
    fn test_tag_paired_writes_only_regular_pairs(#[values(1, 3)] threads: usize) {
        let dir = tempdir().unwrap();
        let r1 = vec![
            read("p1", b"", BC_1.as_bytes(), AMPLICON),
            read("p2", b"", BC_1.as_bytes(), AMPLICON),
            read("p3", b"", BC_1.as_bytes(), b"C"),
        ];
        let r2 = vec![
            read("p1", b"A", BC_2.as_bytes(), AMPLICON),
            fq("p2", b"CCCCCCCCCCCCCCCCCCCCCC"),
            read("p3", b"", BC_2.as_bytes(), AMPLICON),
        ];
        write_reads_to_file(r1.into_iter(), dir.path().join("r1.fastq.gz"));
        write_reads_to_file(r2.into_iter(), dir.path().join("r2.fastq.gz"));

        let opts = TagOpts {
            in_2: Some(dir.path().join("r2.fastq.gz")),
            out_2: Some(dir.path().join("t2.fastq")),
            bc_table: Some(dir.path().join("bc_table.tsv")),
            threads,
            ..tag_opts(dir.path(), "r1.fastq.gz", "t1.fastq")
        };
        let stats = run_tag(&opts).unwrap();

        let t1 = slurp_fastq(dir.path().join("t1.fastq"));
        let t2 = slurp_fastq(dir.path().join("t2.fastq"));
        assert_eq!(t1.len(), 1);
        assert_eq!(t2.len(), 1);
        assert_eq!(header_annotations(&t1[0]).barcode.as_deref(), Some("bc1"));
        assert_eq!(header_annotations(&t2[0]).barcode.as_deref(), Some("bc2"));
        assert_eq!(header_annotations(&t2[0]).junk.as_deref(), Some("A"));

        assert_eq!(stats.n_reads, 3);
        assert_eq!(stats.n_both_regular, Some(1));
        assert_eq!(stats.read1.n_regular, 2);
        assert_eq!(stats.read1.n_only_primer, 1);
        let read2 = stats.read2.unwrap();
        assert_eq!(read2.n_regular, 2);
        assert_eq!(read2.n_no_barcode, 1);

        let table = fs::read_to_string(dir.path().join("bc_table.tsv")).unwrap();
        let lines = table.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], "id\tsequence\tn_patterns\tn_ambiguous\tcollides_with");
        assert_eq!(lines[1], "bc1\tACGTACGT\t25\t0\t");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_tag_uneven_inputs_fail() {
        let dir = tempdir().unwrap();
        let make = |n: usize| (0..n).map(|i| read(&format!("r{}", i), b"", BC_1.as_bytes(), AMPLICON));
        write_reads_to_file(make(3), dir.path().join("r1.fastq"));
        write_reads_to_file(make(4), dir.path().join("r2.fastq"));

        let opts = TagOpts {
            in_2: Some(dir.path().join("r2.fastq")),
            out_2: Some(dir.path().join("t2.fastq")),
            ..tag_opts(dir.path(), "r1.fastq", "t1.fastq")
        };
        let err = run_tag(&opts).unwrap_err();
        assert!(format!("{:#}", err).contains("uneven input FASTQs"));
    }

    #[test]
    fn test_tag_rejects_invalid_barcode() {
        let dir = tempdir().unwrap();
        let mut opts = tag_opts(dir.path(), "in.fastq", "out.fastq");
        write_reads_to_file(std::iter::once(fq("r", b"ACGT")), &opts.in_1);
        opts.bc_file = dir.path().join("bad_barcodes.fa");
        write_lines(&[">bc1", "ACGTNCGT"], &opts.bc_file);

        assert!(run_tag(&opts).is_err());
        assert!(!opts.stats_file.exists());
    }

    /// A writer standing in for a pipe whose reader has gone away.
    struct ClosedPipe;

    impl std::io::Write for ClosedPipe {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_closed_output_stops_tagging_cleanly() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.fastq");
        let reads = (0..10).map(|i| read(&format!("r{}", i), b"", BC_1.as_bytes(), AMPLICON));
        write_reads_to_file(reads, &input);

        let barcodes = vec![Barcode::new("bc1".to_string(), BC_1.into(), 0, None).unwrap()];
        let matcher = BarcodeMatcher::new(&barcodes);
        let mut taggers = vec![ReadTagger::new(&barcodes, &matcher, LINKER.len(), 5)];
        let readers = vec![ThreadReader::new(input.clone(), NonZeroUsize::new(4).unwrap(), 1)];
        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();

        let progress =
            tag_all(&readers, &mut taggers, &mut [ClosedPipe], &pool, &[input]).unwrap();
        assert!(progress.stopped_early);
        assert_eq!(progress.n_reads, 4);
        assert_eq!(taggers[0].stats().n_regular, 4);
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn test_closed_output_does_not_count_unwritten_pair() {
        let dir = tempdir().unwrap();
        let inputs = vec![dir.path().join("r1.fastq"), dir.path().join("r2.fastq")];
        for input in &inputs {
            let reads = (0..10).map(|i| read(&format!("r{}", i), b"", BC_1.as_bytes(), AMPLICON));
            write_reads_to_file(reads, input);
        }

        let barcodes = vec![Barcode::new("bc1".to_string(), BC_1.into(), 0, None).unwrap()];
        let matcher = BarcodeMatcher::new(&barcodes);
        let mut taggers = vec![
            ReadTagger::new(&barcodes, &matcher, LINKER.len(), 5),
            ReadTagger::new(&barcodes, &matcher, LINKER.len(), 5),
        ];
        let readers = inputs
            .iter()
            .map(|input| ThreadReader::new(input.clone(), NonZeroUsize::new(4).unwrap(), 1))
            .collect::<Vec<_>>();
        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let mut writers: Vec<Box<dyn std::io::Write>> =
            vec![Box::new(Vec::new()), Box::new(ClosedPipe)];

        let progress = tag_all(&readers, &mut taggers, &mut writers, &pool, &inputs).unwrap();
        assert!(progress.stopped_early);
        assert_eq!(progress.n_reads, 4);
        assert_eq!(progress.n_both_regular, 0);
        for reader in readers {
            reader.join().unwrap();
        }
    }

    fn write_tagged_fastq(path: &Path, headers: &[&str]) {
        let records = headers.iter().enumerate().map(|(i, h)| fq(&format!("q{} {}", i, h), b"ACGT"));
        write_reads_to_file(records, path);
    }

    fn count_opts(dir: &Path) -> CountOpts {
        write_tagged_fastq(
            &dir.join("t1.fastq.gz"),
            &[
                "barcode=L3 barcode-mismatch=False",
                "barcode=R4 barcode-mismatch=False",
                "barcode=L3 barcode-mismatch=True",
                "barcode=None barcode-mismatch=False",
                "barcode=L3 barcode-mismatch=False",
            ],
        );
        write_tagged_fastq(
            &dir.join("t2.fastq.gz"),
            &[
                "barcode=R4 barcode-mismatch=False",
                "barcode=L3 barcode-mismatch=False",
                "barcode=R4 barcode-mismatch=False",
                "barcode=R4 barcode-mismatch=False",
                "barcode=R4 barcode-mismatch=False",
            ],
        );
        write_lines(&["X\tACGTACGTAC", "X\tACGTACGTAC", "X\tACGTACGTAC", "*\tAC", "X\tACG"], dir.join("m1.tsv"));
        write_lines(&["X\tACGTACGTAC", "X\tACGTACGTAC", "*\tAC", "Y\tACGTACGTAC", "Y\tACGTACGT"], dir.join("m2.tsv"));

        CountOpts {
            tagged: vec![dir.join("t1.fastq.gz"), dir.join("t2.fastq.gz")],
            mapped: vec![dir.join("m1.tsv"), dir.join("m2.tsv")],
            both: dir.join("both.tsv"),
            one: dir.join("one.tsv"),
            ..CountOpts::default()
        }
    }

    #[test]
    fn test_count_end_to_end() {
        let dir = tempdir().unwrap();
        let opts = count_opts(dir.path());
        let tables = run_count(&opts).unwrap();

        let key = |a: &str, b: &str, t: CountTarget| CountKey::new(a, b, t);
        let x = || CountTarget::Amplicon("X".to_string());
        assert_eq!(tables.both.get(&key("L3", "R4", x())), 2);
        assert_eq!(tables.both.get(&key("L3", "R4", CountTarget::OneMapped)), 1);
        assert_eq!(tables.both.get(&key("None", "R4", CountTarget::OneMapped)), 1);
        assert_eq!(tables.both.get(&key("L3", "R4", CountTarget::Mismatch)), 1);
        assert_eq!(tables.both.total(), 5);
        assert_eq!(tables.one.get(&key("L3", "R4", x())), 3);
        assert_eq!(tables.one.get(&key("None", "R4", CountTarget::Amplicon("Y".to_string()))), 1);
        assert_eq!(tables.one.total(), 4);

        let both = fs::read_to_string(&opts.both).unwrap();
        assert_eq!(
            both,
            "bc_l\tbc_r\tamp\tcount\n\
             L3\tR4\tX\t2\n\
             L3\tR4\t-one-mapped\t1\n\
             L3\tR4\t-mismatch\t1\n\
             None\tR4\t-one-mapped\t1\n"
        );
    }

    #[test]
    fn test_count_with_filters() {
        let dir = tempdir().unwrap();
        let opts = CountOpts { no_mismatch: true, amp_min: Some(5), ..count_opts(dir.path()) };
        let tables = run_count(&opts).unwrap();

        // The third pair is skipped; the fifth pair's left call is too short to count
        let key = |t: CountTarget| CountKey::new("L3", "R4", t);
        assert_eq!(tables.both.get(&key(CountTarget::Amplicon("X".to_string()))), 2);
        assert_eq!(tables.both.get(&key(CountTarget::OneMapped)), 1);
        assert_eq!(tables.both.total(), 4);
        assert_eq!(tables.one.get(&key(CountTarget::Amplicon("Y".to_string()))), 1);
    }

    #[test]
    fn test_count_uneven_mapping_fails() {
        let dir = tempdir().unwrap();
        let opts = count_opts(dir.path());
        write_lines(&["X\tACGT"], &opts.mapped[1]);
        let err = run_count(&opts).unwrap_err();
        assert!(format!("{:#}", err).contains("more records"));
    }

    #[test]
    fn test_browse_interleaves_until_exhausted() {
        let dir = tempdir().unwrap();
        write_tagged_fastq(
            &dir.path().join("t1.fastq"),
            &[
                "barcode=A linker=GG multi-bc=True just-primer=False other-bcs=B,C barcode-mismatch=False junk=TT",
                "barcode=A linker=GG multi-bc=False just-primer=False other-bcs=None barcode-mismatch=True junk=None",
            ],
        );
        write_tagged_fastq(
            &dir.path().join("t2.fastq"),
            &["barcode=None linker=None multi-bc=False just-primer=False other-bcs=None barcode-mismatch=False junk=None"],
        );
        write_lines(&["amp1\tACGTAC", "*\t"], dir.path().join("m1.tsv"));
        write_lines(&["amp2\tAC"], dir.path().join("m2.tsv"));

        let output = dir.path().join("browse.tsv");
        let opts = BrowseOpts {
            tagged: vec![dir.path().join("t1.fastq"), dir.path().join("t2.fastq")],
            mapped: vec![dir.path().join("m1.tsv"), dir.path().join("m2.tsv")],
            output: output.clone(),
            decompression_threads_per_reader: 1,
        };
        run_browse(&opts).unwrap();

        let contents = fs::read_to_string(&output).unwrap();
        let lines = contents.lines().collect::<Vec<_>>();
        assert_eq!(
            lines,
            vec![
                "read\theader\tread_seq\tquality_seq\tamplicon\tmatch_len\tbarcode\tlinker\t\
                 has_multiple_bcs\tis_just_primer\tother_bcs\thas_bc_mismatch\tjunk",
                "1\tq0\tACGT\t!\"#$\tamp1\t6\tA\tGG\tTrue\tFalse\tB,C\tFalse\tTT",
                "2\tq0\tACGT\t!\"#$\tamp2\t2\t\t\tFalse\tFalse\t\tFalse\t",
                "1\tq1\tACGT\t!\"#$\t*\t0\tA\tGG\tFalse\tFalse\t\tTrue\t",
            ]
        );
    }
}
