//! Tag reads with the barcode they carry and split them into junk, barcode, linker and amplicon.
//!
//! A read is laid out as `junk | barcode | linker | amplicon`, where the barcode is found anywhere
//! in the read by the [`BarcodeMatcher`] and the linker has a fixed length.  The annotations
//! describing the split are appended to the FASTQ header as `key=value` pairs (see
//! [`TagAnnotations`]) so that downstream steps can recover them.

use std::collections::BTreeSet;
use std::fmt::{self, Display};
use std::io::Write;
use std::ops::Range;

use ahash::AHashSet;
use bstr::{BStr, ByteSlice};
use lazy_static::lazy_static;
use regex::bytes::Regex;
use thiserror::Error;

use crate::barcodes::Barcode;
use crate::matcher::BarcodeMatcher;
use crate::metrics::TagStats;

/// The value written for absent annotations.
pub const NONE_VALUE: &str = "None";

lazy_static! {
    static ref ANNOTATION_RE: Regex = Regex::new(
        r" (barcode|linker|multi-bc|just-primer|other-bcs|barcode-mismatch|junk)=([^ ]*)"
    )
    .expect("annotation pattern is valid");
}

/// Errors when recovering annotations from a tagged FASTQ header.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AnnotationError {
    #[error("Header has no `{field}=` annotation: {header}")]
    MissingField { field: &'static str, header: String },

    #[error("Invalid boolean `{value}` for `{field}` in header: {header}")]
    InvalidBool { field: String, value: String, header: String },
}

/// The result of tagging a single read, borrowing from the read and from the barcode list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedRead<'a> {
    header: &'a [u8],
    sequence: &'a [u8],
    quality: &'a [u8],
    primer_length: usize,
    /// The primary barcode, if any pattern was found.
    barcode: Option<&'a Barcode>,
    /// Where the primary barcode matched; empty at 0 when there is no barcode.
    barcode_span: Range<usize>,
    /// Where the amplicon starts; 0 when there is no barcode.
    amplicon_start: usize,
    other_barcodes: BTreeSet<&'a str>,
    barcode_mismatch: bool,
}

impl<'a> TaggedRead<'a> {
    /// The original header, without the leading `@`.
    pub fn header(&self) -> &'a [u8] {
        self.header
    }

    /// The primary barcode.
    pub fn barcode(&self) -> Option<&'a Barcode> {
        self.barcode
    }

    /// The id of the primary barcode.
    pub fn barcode_id(&self) -> Option<&'a str> {
        self.barcode.map(|b| b.id.as_str())
    }

    /// The part of the read that matched the primary barcode.
    pub fn matched(&self) -> Option<&'a [u8]> {
        self.barcode.map(|_| &self.sequence[self.barcode_span.clone()])
    }

    /// Bases before the barcode, `None` when the barcode starts the read.
    pub fn junk(&self) -> Option<&'a [u8]> {
        self.barcode.and(Some(&self.sequence[..self.barcode_span.start])).filter(|j| !j.is_empty())
    }

    /// Bases between the barcode and the amplicon.  Shorter than the linker length when the read
    /// ends early, `None` when nothing follows the barcode.
    pub fn linker(&self) -> Option<&'a [u8]> {
        self.barcode
            .and(Some(&self.sequence[self.barcode_span.end..self.amplicon_start]))
            .filter(|l| !l.is_empty())
    }

    /// Bases after the linker, or the whole read when there is no barcode.
    pub fn amplicon(&self) -> &'a [u8] {
        &self.sequence[self.amplicon_start..]
    }

    /// Qualities of the amplicon bases.
    pub fn amplicon_quality(&self) -> &'a [u8] {
        self.quality.get(self.amplicon_start..).unwrap_or(&[])
    }

    /// Ids of all barcodes other than the primary one found in the read, sorted.
    pub fn other_barcodes(&self) -> &BTreeSet<&'a str> {
        &self.other_barcodes
    }

    pub fn has_multiple_barcodes(&self) -> bool {
        !self.other_barcodes.is_empty()
    }

    /// True if a barcode was found but nothing beyond the primer remains.
    pub fn is_just_primer(&self) -> bool {
        self.barcode.is_some() && self.amplicon().len() <= self.primer_length
    }

    /// True if a barcode was found and an amplicon follows the primer.
    pub fn is_regular(&self) -> bool {
        self.barcode.is_some() && !self.is_just_primer()
    }

    /// True if the barcode matched through a substitution rather than exactly.
    pub fn barcode_mismatch(&self) -> bool {
        self.barcode_mismatch
    }

    /// The header annotations describing this read.
    pub fn annotations(&self) -> TagAnnotations {
        let lossy = |bytes: &[u8]| bytes.to_str_lossy().into_owned();
        TagAnnotations {
            barcode: self.barcode_id().map(str::to_string),
            linker: self.linker().map(lossy),
            multiple_barcodes: self.has_multiple_barcodes(),
            just_primer: self.is_just_primer(),
            other_barcodes: self.other_barcodes.iter().map(|id| (*id).to_string()).collect(),
            barcode_mismatch: self.barcode_mismatch,
            junk: self.junk().map(lossy),
        }
    }

    /// Write the read as a FASTQ record holding only the amplicon, with the annotations appended
    /// to the header.
    pub fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(b"@")?;
        writer.write_all(self.header)?;
        write!(writer, " {}", self.annotations())?;
        writer.write_all(b"\n")?;
        writer.write_all(self.amplicon())?;
        writer.write_all(b"\n+\n")?;
        writer.write_all(self.amplicon_quality())?;
        writer.write_all(b"\n")
    }
}

/// Tags reads using a shared [`BarcodeMatcher`], accumulating [`TagStats`].
#[derive(Debug)]
pub struct ReadTagger<'a> {
    barcodes: &'a [Barcode],
    matcher: &'a BarcodeMatcher,
    linker_length: usize,
    primer_length: usize,
    stats: TagStats,
}

impl<'a> ReadTagger<'a> {
    /// Create a tagger.  The matcher must have been built from `barcodes`.
    pub fn new(
        barcodes: &'a [Barcode],
        matcher: &'a BarcodeMatcher,
        linker_length: usize,
        primer_length: usize,
    ) -> Self {
        Self { barcodes, matcher, linker_length, primer_length, stats: TagStats::default() }
    }

    /// Tag a read without touching the statistics.
    pub fn tag<'r>(&self, header: &'r [u8], sequence: &'r [u8], quality: &'r [u8]) -> TaggedRead<'r>
    where
        'a: 'r,
    {
        let barcodes = self.barcodes;
        let mut seen = AHashSet::new();
        let mut hits = self.matcher.find_iter(sequence).filter(|hit| seen.insert(*hit));

        let mut read = TaggedRead {
            header,
            sequence,
            quality,
            primer_length: self.primer_length,
            barcode: None,
            barcode_span: 0..0,
            amplicon_start: 0,
            other_barcodes: BTreeSet::new(),
            barcode_mismatch: false,
        };

        if let Some(primary) = hits.next() {
            let barcode = &barcodes[primary.barcode];
            read.other_barcodes = hits
                .filter(|hit| hit.barcode != primary.barcode)
                .map(|hit| barcodes[hit.barcode].id.as_str())
                .collect();
            read.barcode_mismatch = sequence[primary.start..primary.end] != barcode.sequence[..];
            read.barcode = Some(barcode);
            read.barcode_span = primary.start..primary.end;
            read.amplicon_start = (primary.end + self.linker_length).min(sequence.len());
        }
        read
    }

    /// Tag a read and record it in the statistics.
    pub fn tag_read<'r>(
        &mut self,
        header: &'r [u8],
        sequence: &'r [u8],
        quality: &'r [u8],
    ) -> TaggedRead<'r>
    where
        'a: 'r,
    {
        let read = self.tag(header, sequence, quality);
        self.stats.record(&read);
        read
    }

    /// Fold statistics gathered elsewhere (e.g. by workers calling [`ReadTagger::tag`]) into
    /// this tagger's statistics.
    pub fn merge_stats(&mut self, other: &TagStats) {
        self.stats.update_with(other);
    }

    pub fn stats(&self) -> &TagStats {
        &self.stats
    }
}

/// The annotations appended to a tagged read's header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagAnnotations {
    pub barcode: Option<String>,
    pub linker: Option<String>,
    pub multiple_barcodes: bool,
    pub just_primer: bool,
    pub other_barcodes: Vec<String>,
    pub barcode_mismatch: bool,
    pub junk: Option<String>,
}

/// Formats booleans the way existing tagged files spell them.
pub(crate) fn bool_str(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

fn parse_bool(field: &[u8], value: &[u8], header: &[u8]) -> Result<bool, AnnotationError> {
    if value.eq_ignore_ascii_case(b"true") {
        Ok(true)
    } else if value.eq_ignore_ascii_case(b"false") {
        Ok(false)
    } else {
        Err(AnnotationError::InvalidBool {
            field: field.to_str_lossy().into_owned(),
            value: value.to_str_lossy().into_owned(),
            header: header.to_str_lossy().into_owned(),
        })
    }
}

fn parse_optional(value: &[u8]) -> Option<String> {
    if value.is_empty() || value == NONE_VALUE.as_bytes() {
        None
    } else {
        Some(value.to_str_lossy().into_owned())
    }
}

impl TagAnnotations {
    /// Split a tagged header into the original header and its annotations.
    ///
    /// Only `barcode=` is required; other missing annotations take their default.
    pub fn parse(header: &[u8]) -> Result<(&BStr, Self), AnnotationError> {
        let mut annotations = Self::default();
        let mut original_end = None;
        let mut has_barcode = false;

        for caps in ANNOTATION_RE.captures_iter(header) {
            let (whole, field, value) = match (caps.get(0), caps.get(1), caps.get(2)) {
                (Some(w), Some(f), Some(v)) => (w, f.as_bytes(), v.as_bytes()),
                _ => continue,
            };
            original_end.get_or_insert(whole.start());
            match field {
                b"barcode" => {
                    has_barcode = true;
                    annotations.barcode = parse_optional(value);
                }
                b"linker" => annotations.linker = parse_optional(value),
                b"multi-bc" => annotations.multiple_barcodes = parse_bool(field, value, header)?,
                b"just-primer" => annotations.just_primer = parse_bool(field, value, header)?,
                b"other-bcs" => {
                    annotations.other_barcodes = parse_optional(value)
                        .map(|ids| ids.split(',').map(str::to_string).collect())
                        .unwrap_or_default();
                }
                b"barcode-mismatch" => {
                    annotations.barcode_mismatch = parse_bool(field, value, header)?;
                }
                b"junk" => annotations.junk = parse_optional(value),
                _ => unreachable!("field alternatives are fixed by the pattern"),
            }
        }

        if !has_barcode {
            return Err(AnnotationError::MissingField {
                field: "barcode",
                header: header.to_str_lossy().into_owned(),
            });
        }
        let original = &header[..original_end.unwrap_or(header.len())];
        Ok((original.as_bstr(), annotations))
    }

    /// The barcode id, or `None` spelled out, for keying count tables.
    pub fn barcode_or_none(&self) -> &str {
        self.barcode.as_deref().unwrap_or(NONE_VALUE)
    }
}

impl Display for TagAnnotations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let other_bcs = if self.other_barcodes.is_empty() {
            NONE_VALUE.to_string()
        } else {
            self.other_barcodes.join(",")
        };
        write!(
            f,
            "barcode={} linker={} multi-bc={} just-primer={} other-bcs={} barcode-mismatch={} junk={}",
            self.barcode.as_deref().unwrap_or(NONE_VALUE),
            self.linker.as_deref().unwrap_or(NONE_VALUE),
            bool_str(self.multiple_barcodes),
            bool_str(self.just_primer),
            other_bcs,
            bool_str(self.barcode_mismatch),
            self.junk.as_deref().unwrap_or(NONE_VALUE),
        )
    }
}
