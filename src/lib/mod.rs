//! A library for tagging amplicon reads with their barcodes and counting barcode pairs.
//!
//! # Overview
//!
//! Tagging flows as follows:
//!
//! - [`barcodes`] loads the barcode list and [`matcher::PatternIndex`] expands every barcode into
//!   its exact and single-substitution patterns, dropping patterns shared by two barcodes.
//! - The [`matcher::BarcodeMatcher`] finds all pattern occurrences in a read in one pass.
//! - The [`thread_reader::ThreadReader`] extracts chunks of FASTQs from input files, and the
//!   chunks of both reads are tagged in parallel by a [`tagger::ReadTagger`].
//! - Tagged reads are written with their annotations in the header, and [`metrics`] are collated
//!   from every chunk.
//!
//! Counting reads the tagged FASTQs of both reads back together with their amplicon mappings and
//! accumulates the [`counter::CountTables`].
#![deny(unsafe_code)]
#![allow(
    clippy::must_use_candidate,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions
)]
pub mod barcodes;
pub mod counter;
pub mod matcher;
pub mod metrics;
pub mod opts;
pub mod run;
pub mod tagger;
pub mod thread_reader;
pub mod utils;
