#![forbid(unsafe_code)]
#![allow(clippy::must_use_candidate)]
//! Loading of the barcode definitions used for tagging reads.
//!
//! Two formats are accepted:
//!
//! - a tab-separated file with a header line followed by `<id>\t<sequence>` lines
//! - a FASTA-style file with `>id` lines each followed by the barcode sequence; anything after
//!   the first whitespace of a `>` line is a description and is ignored
//!
//! The format is chosen by looking at the first non-empty line: a leading `>` means FASTA.

use std::{collections::HashSet, fmt::Display, path::Path};

use bstr::{BStr, BString, ByteSlice};
use csv::{ReaderBuilder, StringRecord, Trim};
use fgoxide::io::Io;
use log::debug;
use thiserror::Error;

use crate::tagger::NONE_VALUE;

/// The bases that are allowed in a [`Barcode::sequence`].
pub const DNA_BASES: &[u8] = b"ATGC";

/// The optional line number from the barcode file where an error ocurred.
#[derive(Debug)]
pub struct ErrorLine(pub Option<usize>);

impl Display for ErrorLine {
    /// Writes the line number if present, nothing if it is not None.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(number) => write!(f, "Line {}", number),
            None => Ok(()),
        }
    }
}

/// The reason that a barcode has been deemed invalid.
#[derive(Debug)]
#[non_exhaustive]
pub enum ReasonBarcodeInvalid {
    EmptyString,
    InvalidBase(char),
}

impl Display for ReasonBarcodeInvalid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyString => write!(f, "Barcode is an empty string"),
            Self::InvalidBase(base) => write!(f, "Barcode contains the non-ACGT base '{}'", base),
        }
    }
}

/// The error that may occur when loading the barcode file.
#[derive(Error, Debug)]
pub enum BarcodeFileError {
    #[error("Io error occurred")]
    Io(#[from] std::io::Error),

    #[error("Io error occurred")]
    FgError(#[from] fgoxide::FgError),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error("The barcode file was empty")]
    Empty,

    #[error("The barcode file must include at least one barcode")]
    ZeroBarcodes,

    #[error(
        "The header line of the barcode file looks like sequence data: `{header}`. \
         Were the barcode file and the read file swapped?"
    )]
    HeaderIsSequence { header: String },

    #[error("Expected 2 tab-separated fields but found {actual} on line {line}: {content}")]
    InvalidNumberOfColumns { actual: usize, line: usize, content: String },

    #[error("The FASTA record `{id}` on line {line} has no sequence")]
    MissingSequence { id: String, line: usize },

    #[error("Invalid barcode sequence for {id} `{barcode}` - {reason}. {line}")]
    InvalidBarcode { barcode: String, id: String, reason: ReasonBarcodeInvalid, line: ErrorLine },

    #[error(
        "Invalid barcode id `{id}`: ids must be non-empty, must not be `None` and must not \
         contain whitespace, `,` or `=`. {line}"
    )]
    InvalidBarcodeId { id: String, line: ErrorLine },

    #[error("Duplicate barcode id found: {id}")]
    DuplicateBarcodeId { id: String },
}

/// A barcode with its identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Barcode {
    /// The unique identifier of the barcode (e.g. `L01`).
    pub id: String,
    /// The canonical (zero-mismatch) barcode sequence.
    pub sequence: BString,
    /// The position of the barcode in the barcode file, starts at 0.
    pub ordinal: usize,
    /// The line number in the input on which the barcode was defined.
    pub line_number: Option<usize>,
}

impl Barcode {
    /// Create a new [`Barcode`], upper-casing and validating the sequence.
    ///
    /// # Errors
    ///
    /// - [`BarcodeFileError::InvalidBarcodeId`] if the id cannot be written into a read header
    /// - [`BarcodeFileError::InvalidBarcode`] if the sequence is empty or has a non-ACGT base
    pub fn new(
        id: String,
        sequence: &BStr,
        ordinal: usize,
        line_number: Option<usize>,
    ) -> Result<Self, BarcodeFileError> {
        Self::validate_id(&id, line_number)?;
        let sequence = BString::from(sequence.to_ascii_uppercase());
        Self::validate_sequence(sequence.as_ref(), &id, line_number)?;
        Ok(Self { id, sequence, ordinal, line_number })
    }

    /// Check that an id survives the `key=value` header annotations unchanged.
    pub fn validate_id(id: &str, line_number: Option<usize>) -> Result<(), BarcodeFileError> {
        let unwritable = id.is_empty()
            || id == NONE_VALUE
            || id.chars().any(|c| c.is_whitespace() || c == ',' || c == '=');
        if unwritable {
            return Err(BarcodeFileError::InvalidBarcodeId {
                id: id.to_owned(),
                line: ErrorLine(line_number),
            });
        }
        Ok(())
    }

    /// Check that a barcode is non-empty and made of [`DNA_BASES`] only.
    pub fn validate_sequence(
        sequence: &BStr,
        id: &str,
        line_number: Option<usize>,
    ) -> Result<(), BarcodeFileError> {
        let reason = if sequence.is_empty() {
            Some(ReasonBarcodeInvalid::EmptyString)
        } else {
            sequence
                .iter()
                .find(|b| !DNA_BASES.contains(b))
                .map(|b| ReasonBarcodeInvalid::InvalidBase(char::from(*b)))
        };
        match reason {
            None => Ok(()),
            Some(reason) => Err(BarcodeFileError::InvalidBarcode {
                barcode: sequence.to_string(),
                id: id.to_owned(),
                reason,
                line: ErrorLine(line_number),
            }),
        }
    }
}

/// Returns true if every whitespace-separated field of `line` is a non-empty DNA sequence.
fn looks_like_sequence(line: &str) -> bool {
    let mut fields = line.split_whitespace().peekable();
    fields.peek().is_some()
        && fields.all(|field| field.bytes().all(|b| DNA_BASES.contains(&b.to_ascii_uppercase())))
}

/// Read the barcodes from the file at the given path.
///
/// # Errors
///
/// Any [`BarcodeFileError`]; a header line made only of DNA sequence is rejected as a sign of
/// swapped arguments.
pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Vec<Barcode>, BarcodeFileError> {
    let io = Io::default();
    let lines = io.read_lines(&path)?;
    from_lines(&lines)
}

/// Parse barcodes from the lines of a barcode file.
pub fn from_lines(lines: &[String]) -> Result<Vec<Barcode>, BarcodeFileError> {
    let first = lines.iter().find(|l| !l.trim().is_empty()).ok_or(BarcodeFileError::Empty)?;
    let barcodes = if first.starts_with('>') {
        debug!("Reading barcodes in FASTA format");
        from_fasta_lines(lines)?
    } else {
        debug!("Reading barcodes in tab-separated format");
        from_tsv_reader(lines.join("\n").as_bytes())?
    };
    validate_barcodes(barcodes)
}

/// Reads barcodes from a tab-separated file with a header line.
fn from_tsv_reader<R: std::io::Read>(reader: R) -> Result<Vec<Barcode>, BarcodeFileError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(reader);

    let mut records = reader.records();
    let header: StringRecord = match records.next() {
        Some(record) => record?,
        None => return Err(BarcodeFileError::Empty),
    };
    let header_line = header.iter().collect::<Vec<_>>().join("\t");
    if looks_like_sequence(&header_line) {
        return Err(BarcodeFileError::HeaderIsSequence { header: header_line });
    }

    let mut barcodes = vec![];
    for record in records {
        let record = record?;
        let line = record.position().map_or(0, |p| p.line() as usize);
        if record.iter().all(str::is_empty) {
            continue;
        }
        if record.len() != 2 {
            return Err(BarcodeFileError::InvalidNumberOfColumns {
                actual: record.len(),
                line,
                content: record.iter().collect::<Vec<_>>().join("\t"),
            });
        }
        barcodes.push(Barcode::new(
            record[0].to_string(),
            record[1].as_bytes().as_bstr(),
            barcodes.len(),
            Some(line),
        )?);
    }
    Ok(barcodes)
}

/// Reads barcodes from `>id` / sequence line pairs.  Sequences may wrap over several lines.
fn from_fasta_lines(lines: &[String]) -> Result<Vec<Barcode>, BarcodeFileError> {
    let mut barcodes = vec![];
    let mut current: Option<(String, usize, BString)> = None;

    for (index, line) in lines.iter().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(name) = line.strip_prefix('>') {
            push_fasta_record(current.take(), &mut barcodes)?;
            let id = name.split_whitespace().next().unwrap_or_default();
            current = Some((id.to_string(), index + 1, BString::from("")));
        } else if let Some((_, _, sequence)) = current.as_mut() {
            sequence.extend_from_slice(line.as_bytes());
        } else {
            return Err(BarcodeFileError::InvalidNumberOfColumns {
                actual: 1,
                line: index + 1,
                content: line.to_string(),
            });
        }
    }
    push_fasta_record(current.take(), &mut barcodes)?;
    Ok(barcodes)
}

/// Converts a finished `(id, line, sequence)` FASTA entry into a [`Barcode`].
fn push_fasta_record(
    entry: Option<(String, usize, BString)>,
    barcodes: &mut Vec<Barcode>,
) -> Result<(), BarcodeFileError> {
    if let Some((id, line, sequence)) = entry {
        if sequence.is_empty() {
            return Err(BarcodeFileError::MissingSequence { id, line });
        }
        let ordinal = barcodes.len();
        barcodes.push(Barcode::new(id, sequence.as_ref(), ordinal, Some(line))?);
    }
    Ok(())
}

/// Checks that at least one barcode was found and that ids are unique.
fn validate_barcodes(barcodes: Vec<Barcode>) -> Result<Vec<Barcode>, BarcodeFileError> {
    if barcodes.is_empty() {
        return Err(BarcodeFileError::ZeroBarcodes);
    }
    let mut ids = HashSet::new();
    for barcode in &barcodes {
        if !ids.insert(barcode.id.as_str()) {
            return Err(BarcodeFileError::DuplicateBarcodeId { id: barcode.id.clone() });
        }
    }
    Ok(barcodes)
}
