//! A [`ThreadReader`] allows for pushing the reading of a FASTQ file onto a separate thread.
//!
//! The input may be plain or BGZF compressed (see [`crate::utils::open_input`]), and may be
//! stdin.  BGZF inputs are decompressed with a pool of threads.  The reader thread parses the
//! FASTQ into chunks of N records that are handed over a bounded channel.

use std::{num::NonZeroUsize, path::PathBuf, thread::JoinHandle};

use anyhow::{Context, Result};
use flume::{bounded, Receiver};
use gzp::BUFSIZE;
use seq_io::fastq::{self, RecordSet};

use crate::utils::open_input;

/// The number of chunks to allow in the reader channel at one time.
const READER_CHANNEL_SIZE: usize = 100;

/// A struct to hold onto the handle for a thread that is reading chunks of FASTQ from a file.
pub struct ThreadReader {
    /// The [`JoinHandle`] for the thread that is reading.
    pub handle: JoinHandle<Result<()>>,
    /// The channel that will be receiving [`RecordSet`]s.
    pub rx: Receiver<RecordSet>,
}

impl ThreadReader {
    /// Create a new [`ThreadReader`] for a given file that will read `chunksize` records at a time.
    ///
    /// Errors opening or parsing the file are returned when joining `handle`.  The thread stops
    /// early, without error, if the receiving end of the channel is dropped.
    // Chunksize can't be zero or `seq_io` would try to read the whole file into one record set.
    pub fn new(file: PathBuf, chunksize: NonZeroUsize, decompression_threads: usize) -> Self {
        let (tx, rx) = bounded(READER_CHANNEL_SIZE);
        let handle = std::thread::spawn(move || {
            let mut reader =
                fastq::Reader::with_capacity(open_input(&file, decompression_threads)?, BUFSIZE);

            loop {
                let mut record_set = RecordSet::default();
                let filled_set = reader
                    .read_record_set_exact(&mut record_set, usize::from(chunksize))
                    .with_context(|| {
                        format!("Failed reading record set from {}", file.to_string_lossy())
                    })?;
                if !filled_set || tx.send(record_set).is_err() {
                    break;
                }
            }
            Ok(())
        });

        Self { handle, rx }
    }

    /// Wait for the reader thread to finish, propagating its error or panic.
    pub fn join(self) -> Result<()> {
        drop(self.rx);
        match self.handle.join() {
            Ok(result) => result,
            Err(e) => std::panic::resume_unwind(e),
        }
    }
}

#[cfg(test)]
mod test {
    use std::num;

    use rstest::rstest;
    use seq_io::fastq::OwnedRecord;
    use tempfile::tempdir;

    use crate::utils::test_commons::{generate_reads, write_lines, write_reads_to_file};

    #[rstest]
    #[case(1, 10, "reads.fastq.gz")]
    #[case(10, 1, "reads.fastq.gz")]
    #[case(0, 100, "reads.fastq.gz")]
    #[should_panic]
    #[case(100, 0, "reads.fastq.gz")] // 0 is an illegal chunksize
    #[case(100, 1, "reads.fastq")]
    #[case(10_000, 1000, "reads.fastq.gz")] // 1000 is the default chunksize
    #[case(10_000, 1000, "reads.fastq")]
    fn test_thread_reader(
        #[case] reads_in_file: usize,
        #[case] chunksize: usize,
        #[case] name: &str,
    ) {
        let dir = tempdir().unwrap();
        let file = dir.path().join(name);
        let reads = generate_reads("frag", reads_in_file);
        write_reads_to_file(reads.clone().into_iter(), &file);

        let reader = super::ThreadReader::new(file, num::NonZeroUsize::new(chunksize).unwrap(), 4);
        let seen_reads: Vec<OwnedRecord> = reader
            .rx
            .iter()
            .flat_map(|chunk| {
                chunk.into_iter().map(|record| record.to_owned_record()).collect::<Vec<_>>()
            })
            .collect();
        assert_eq!(seen_reads, reads);
        assert!(reader.join().is_ok());
    }

    #[test]
    fn test_thread_reader_truncated_record_fails() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("truncated.fastq");
        write_lines(&["@r1", "ACGT", "+", "IIII", "@r2", "ACGT"], &file);

        let reader = super::ThreadReader::new(file, num::NonZeroUsize::new(10).unwrap(), 1);
        let chunks = reader.rx.iter().count();
        assert_eq!(chunks, 0);
        assert!(reader.join().is_err());
    }
}
