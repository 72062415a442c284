//! Utility functions.
use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, ErrorKind, Read, Write},
    path::Path,
};

use anyhow::{anyhow, Context};
use core::fmt::Display;
use gzp::{
    deflate::Bgzf, par::decompress::ParDecompressBuilder, BgzfSyncWriter, BlockFormatSpec,
    Compression, GzpError, BUFSIZE,
};
use lazy_static::lazy_static;
use serde::Serialize;

lazy_static! {
    /// Return the number of cpus as a String
    pub static ref NUM_CPU: String = num_cpus::get().to_string();
}

/// The path standing for stdin or stdout.
pub const STDIO_PATH: &str = "-";

/// The compression level for BGZF outputs.
const OUTPUT_COMPRESSION_LEVEL: u32 = 3;

pub mod built_info {
    use lazy_static::lazy_static;
    include!(concat!(env!("OUT_DIR"), "/built.rs"));

    /// Get a software version string including
    ///   - Git commit hash
    ///   - Git dirty info (whether the repo had uncommitted changes)
    ///   - Cargo package version if no git info found
    fn get_software_version() -> String {
        let prefix = if let Some(s) = GIT_COMMIT_HASH {
            format!("{}-{}", PKG_VERSION, s[0..8].to_owned())
        } else {
            PKG_VERSION.to_string()
        };
        let suffix = match GIT_DIRTY {
            Some(true) => "-dirty",
            _ => "",
        };
        format!("{}{}", prefix, suffix)
    }

    lazy_static! {
        /// Version of the software with git hash
        pub static ref VERSION: String = get_software_version();
    }
}

/// True if `path` stands for stdin or stdout.
pub fn is_stdio(path: &Path) -> bool {
    path.as_os_str() == STDIO_PATH
}

/// How an input stream is encoded, judged from its first bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Plain,
    /// GZIP that is not block compressed, which cannot be read.
    Gzip,
    Bgzf,
}

impl InputFormat {
    /// Classify a stream from (up to) its first [`Bgzf::HEADER_SIZE`] bytes.
    pub fn detect(header: &[u8]) -> Self {
        if header.len() < 3 || header[0] != 31 || header[1] != 139 || header[2] != 8 {
            InputFormat::Plain
        } else if header.len() < 14 || header[3] & 4 != 4 || header[12] != b'B' || header[13] != b'C'
        {
            InputFormat::Gzip
        } else {
            InputFormat::Bgzf
        }
    }
}

/// Open `path` (or stdin for `-`) for reading, transparently decompressing BGZF with
/// `decompression_threads` threads.
///
/// Plain GZIP is rejected with a hint on how to re-compress with `bgzip`.
pub fn open_input(path: &Path, decompression_threads: usize) -> anyhow::Result<Box<dyn Read>> {
    if is_stdio(path) {
        wrap_input(BufReader::with_capacity(BUFSIZE, std::io::stdin()), path, decompression_threads)
    } else {
        let file = File::open(path)
            .with_context(|| format!("Failed to open {}", path.to_string_lossy()))?;
        wrap_input(BufReader::with_capacity(BUFSIZE, file), path, decompression_threads)
    }
}

fn wrap_input<R>(
    mut reader: R,
    path: &Path,
    decompression_threads: usize,
) -> anyhow::Result<Box<dyn Read>>
where
    R: BufRead + Send + 'static,
{
    let header = reader
        .fill_buf()
        .with_context(|| format!("Error reading from: {}", path.to_string_lossy()))?;
    let format = InputFormat::detect(&header[..header.len().min(Bgzf::HEADER_SIZE)]);
    match format {
        InputFormat::Plain => Ok(Box::new(reader)),
        InputFormat::Gzip => Err(report_bgzf_error(
            path,
            GzpError::InvalidHeader("Header in GZIP but not BGZF format"),
        )),
        InputFormat::Bgzf => {
            let decompressor = ParDecompressBuilder::<Bgzf>::new()
                .num_threads(decompression_threads.max(1))
                .with_context(|| {
                    format!(
                        "Error in setting threads when creating decompressor for {}",
                        path.to_string_lossy()
                    )
                })?
                .from_reader(reader);
            Ok(Box::new(decompressor))
        }
    }
}

/// Creates an error message when a GZIP input is not block compressed.
fn report_bgzf_error<C>(file: &Path, context: C) -> anyhow::Error
where
    C: Display + Send + Sync + 'static,
{
    let filename = file.to_string_lossy();
    let message = format!(
        "
Error reading from: {}

GZIP compressed input must be in BGZF (bgzip) format!

To re-compress a GZIP file with bgzip:
  1. install with `conda install -c bioconda htslib`
     or from http://www.htslib.org/download/
  2. `gunzip -c {} > tmp.fastq`
  3. `bgzip --stdout --threads tmp.fastq > {}`

Alternatively, decompress it and provide the plain file.
",
        filename, filename, filename,
    );
    anyhow!(message).context(context)
}

/// Create the parent directory of `path` if needed.
pub fn ensure_parent_dir(path: &Path) -> anyhow::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.exists() => {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))
        }
        _ => Ok(()),
    }
}

/// Open `path` (or stdout for `-`) for writing.  Paths ending in `.gz` are BGZF compressed.
///
/// Callers must `flush` the writer; BGZF output is finished when the writer is dropped.
pub fn open_output(path: &Path) -> anyhow::Result<Box<dyn Write>> {
    if is_stdio(path) {
        return Ok(Box::new(BufWriter::with_capacity(BUFSIZE, std::io::stdout())));
    }
    ensure_parent_dir(path)?;
    let file = File::create(path)
        .with_context(|| format!("Failed to create {}", path.to_string_lossy()))?;
    let writer = BufWriter::with_capacity(BUFSIZE, file);
    if path.extension().map_or(false, |ext| ext == "gz") {
        Ok(Box::new(BgzfSyncWriter::new(writer, Compression::new(OUTPUT_COMPRESSION_LEVEL))))
    } else {
        Ok(Box::new(writer))
    }
}

/// Write `rows` as a TSV with a header taken from the row's field names.
pub fn write_tsv_rows<W, S>(writer: W, rows: impl IntoIterator<Item = S>) -> anyhow::Result<()>
where
    W: Write,
    S: Serialize,
{
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_writer(writer);
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Write `rows` as a TSV to `path` (or stdout for `-`), see [`open_output`].
pub fn write_tsv<S: Serialize>(
    path: &Path,
    rows: impl IntoIterator<Item = S>,
) -> anyhow::Result<()> {
    write_tsv_rows(open_output(path)?, rows)
        .with_context(|| format!("Failed to write {}", path.to_string_lossy()))
}

/// True if `error` was caused by writing to a closed pipe, i.e. the consumer went away.
pub fn is_broken_pipe(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        cause.downcast_ref::<std::io::Error>().map_or(false, |e| e.kind() == ErrorKind::BrokenPipe)
    })
}

#[cfg(not(tarpaulin_include))]
#[cfg(test)]
pub mod test_commons {
    //! Common utility methods for testing tagging and counting.

    use std::{
        fs::File,
        io::{BufWriter, Write},
        path::Path,
        sync::Mutex,
    };

    use bgzf::CompressionLevel;
    use lazy_static::lazy_static;
    use log::{Level, LevelFilter, Log, Metadata, Record};
    use seq_io::{
        fastq::{OwnedRecord, Reader},
        BaseRecord,
    };

    use super::open_input;

    lazy_static! {
        static ref CAPTURED_LOGS: Mutex<Vec<(Level, String)>> = Mutex::new(vec![]);
    }

    /// A logger keeping every record in memory.
    struct CapturingLogger;

    impl Log for CapturingLogger {
        fn enabled(&self, _metadata: &Metadata) -> bool {
            true
        }

        fn log(&self, record: &Record) {
            if let Ok(mut logs) = CAPTURED_LOGS.lock() {
                logs.push((record.level(), record.args().to_string()));
            }
        }

        fn flush(&self) {}
    }

    static LOGGER: CapturingLogger = CapturingLogger;

    /// Install the capturing logger for the test process.  Safe to call from many tests.
    pub fn init_log_capture() {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(LevelFilter::Debug);
        }
    }

    /// True if a message at `level` containing `needle` was logged since capture started.
    pub fn logged(level: Level, needle: &str) -> bool {
        CAPTURED_LOGS.lock().unwrap().iter().any(|(l, msg)| *l == level && msg.contains(needle))
    }

    /// Build a record with qualities of increasing value so that slicing is visible.
    pub fn fq(name: &str, bases: &[u8]) -> OwnedRecord {
        let qual = (0..bases.len()).map(|i| b'!' + (i % 40) as u8).collect();
        OwnedRecord { head: name.as_bytes().to_vec(), seq: bases.to_vec(), qual }
    }

    /// Write a set of fastq reads to a file, returning the number of reads written.
    ///
    /// If the file extension is `gz` the reads will be BGZF compressed
    pub fn write_reads_to_file(
        reads: impl Iterator<Item = OwnedRecord>,
        file: impl AsRef<Path>,
    ) -> usize {
        let mut num_written = 0;
        let mut writer: Box<dyn Write> =
            if file.as_ref().extension().map_or(false, |ext| ext == "gz") {
                Box::new(bgzf::Writer::new(
                    BufWriter::new(File::create(file).unwrap()),
                    CompressionLevel::new(3).unwrap(),
                ))
            } else {
                Box::new(BufWriter::new(File::create(file).unwrap()))
            };
        for read in reads {
            read.write(&mut writer).unwrap();
            num_written += 1;
        }
        writer.flush().unwrap();
        num_written
    }

    /// Write lines to a file, each followed by a newline.
    pub fn write_lines(lines: &[&str], file: impl AsRef<Path>) {
        let mut contents = lines.join("\n");
        contents.push('\n');
        std::fs::write(file, contents).unwrap();
    }

    /// Slurp all records out of a plain or BGZF FASTQ file
    pub fn slurp_fastq(file: impl AsRef<Path>) -> Vec<OwnedRecord> {
        let reader = open_input(file.as_ref(), 2)
            .unwrap_or_else(|_| panic!("Unable to open {:?}", &file.as_ref()));
        let mut reader = Reader::new(reader);
        let mut records = vec![];
        for r in reader.records() {
            let r = r.unwrap();
            records.push(r);
        }
        records
    }

    /// A more generic way to create reads that allows for unique name for each read
    pub fn generate_reads(read_name: &str, num_reads: usize) -> Vec<OwnedRecord> {
        (1..=num_reads)
            .map(|i| fq(&format!("read_{}_of_{}_{}", i, num_reads, read_name), &[b'A'; 150]))
            .collect()
    }
}
