//! Locate barcodes, allowing up to one substitution, anywhere within a read.
//!
//! Every barcode is expanded into its canonical sequence plus all single-substitution variants
//! ([`single_mismatches`]).  The [`PatternIndex`] maps each of those patterns back to the barcode
//! that owns it, dropping any pattern that more than one barcode claims.  Finally the
//! [`BarcodeMatcher`] compiles the surviving patterns into an Aho-Corasick automaton so that a
//! read is scanned for all patterns in a single pass.

use std::collections::VecDeque;
use std::iter::FusedIterator;

use ahash::{AHashMap, AHashSet};
use bstr::ByteSlice;
use itertools::Itertools;
use log::{debug, warn};

use crate::barcodes::{Barcode, DNA_BASES};

/// The index of the root node of the automaton.
const ROOT: usize = 0;

/// Generate the given sequence followed by every sequence that differs from it by exactly one
/// base substitution, in position order.
///
/// For a sequence of length `n` made of [`DNA_BASES`] this yields `1 + 3n` patterns.  No
/// de-duplication is done against other barcodes; that happens in [`PatternIndex::new`].
pub fn single_mismatches(sequence: &[u8]) -> impl Iterator<Item = Vec<u8>> + '_ {
    std::iter::once(sequence.to_vec()).chain((0..sequence.len()).flat_map(move |i| {
        DNA_BASES.iter().filter(move |&&base| base != sequence[i]).map(move |&base| {
            let mut variant = sequence.to_vec();
            variant[i] = base;
            variant
        })
    }))
}

/// All patterns that may be used to recognise a barcode, keyed to the barcode that owns them.
///
/// Barcodes are referred to by their index in the slice the index was built from.
#[derive(Debug, Default)]
pub struct PatternIndex {
    /// Patterns owned by exactly one barcode.
    patterns: AHashMap<Vec<u8>, usize>,
    /// Patterns claimed by more than one barcode, with every colliding `(a, b)` pair in both
    /// orders.
    collisions: AHashMap<Vec<u8>, AHashSet<(usize, usize)>>,
}

impl PatternIndex {
    /// Build the index for the given barcodes.
    ///
    /// A pattern claimed by two different barcodes is removed for both of them and recorded as a
    /// collision.  Each collision is logged as a warning but is not an error: the barcodes stay
    /// usable, only with less mismatch tolerance at the affected positions.
    pub fn new(barcodes: &[Barcode]) -> Self {
        let mut claims: AHashMap<Vec<u8>, usize> = AHashMap::new();
        let mut collisions: AHashMap<Vec<u8>, AHashSet<(usize, usize)>> = AHashMap::new();

        for (index, barcode) in barcodes.iter().enumerate() {
            for pattern in single_mismatches(&barcode.sequence) {
                match claims.get(&pattern) {
                    None => {
                        claims.insert(pattern, index);
                    }
                    Some(&owner) if owner == index => (),
                    Some(&owner) => {
                        warn!(
                            "Pattern {} is ambiguous between barcodes {} and {}, it will not be used",
                            pattern.as_bstr(),
                            barcodes[owner].id,
                            barcode.id
                        );
                        let pairs = collisions.entry(pattern).or_insert_with(AHashSet::new);
                        pairs.insert((owner, index));
                        pairs.insert((index, owner));
                    }
                }
            }
        }

        claims.retain(|pattern, _| !collisions.contains_key(pattern));
        debug!(
            "Indexed {} unambiguous patterns for {} barcodes ({} ambiguous)",
            claims.len(),
            barcodes.len(),
            collisions.len()
        );
        Self { patterns: claims, collisions }
    }

    /// The number of usable patterns.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// True if no usable patterns remain.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// The barcode owning `pattern`, if the pattern is usable.
    pub fn get(&self, pattern: &[u8]) -> Option<usize> {
        self.patterns.get(pattern).copied()
    }

    /// Iterate over all usable `(pattern, barcode)` pairs in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], usize)> {
        self.patterns.iter().map(|(pattern, barcode)| (pattern.as_slice(), *barcode))
    }

    /// True if `pattern` was claimed by more than one barcode.
    pub fn is_ambiguous(&self, pattern: &[u8]) -> bool {
        self.collisions.contains_key(pattern)
    }

    /// The colliding barcode pairs for an ambiguous pattern.  Both `(a, b)` and `(b, a)` are
    /// present.
    pub fn colliding_pairs(&self, pattern: &[u8]) -> Option<&AHashSet<(usize, usize)>> {
        self.collisions.get(pattern)
    }

    /// Iterate over all ambiguous patterns and their colliding barcode pairs.
    pub fn collisions(&self) -> impl Iterator<Item = (&[u8], &AHashSet<(usize, usize)>)> {
        self.collisions.iter().map(|(pattern, pairs)| (pattern.as_slice(), pairs))
    }
}

/// A located pattern hit inside a read: `text[start..end]` matched a pattern owned by `barcode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatchOccurrence {
    /// The 0-based start of the hit.
    pub start: usize,
    /// The exclusive end of the hit.
    pub end: usize,
    /// The index of the barcode owning the matched pattern.
    pub barcode: usize,
}

/// A pattern that ends at a given automaton node.
#[derive(Debug, Clone, Copy)]
struct PatternEnd {
    barcode: usize,
    len: usize,
}

/// A node of the automaton, stored in a flat arena and referred to by index.
#[derive(Debug, Default, Clone)]
struct Node {
    /// Outgoing trie edges.  The alphabet is tiny so a linear scan beats hashing.
    transitions: Vec<(u8, usize)>,
    /// The node for the longest proper suffix of this node's string that is also in the trie.
    failure: usize,
    /// The pattern spelled by the path to this node, if any.
    terminal: Option<PatternEnd>,
    /// The closest node along the failure chain (excluding this node) that ends a pattern.
    output: Option<usize>,
}

impl Node {
    #[inline]
    fn next(&self, byte: u8) -> Option<usize> {
        self.transitions.iter().find(|(b, _)| *b == byte).map(|(_, node)| *node)
    }
}

/// An Aho-Corasick automaton over all usable barcode patterns.
///
/// The matcher is immutable once built and may be shared across threads.
#[derive(Debug, Clone)]
pub struct BarcodeMatcher {
    nodes: Vec<Node>,
    num_patterns: usize,
}

impl BarcodeMatcher {
    /// Build a matcher for the given barcodes, tolerating one substitution.
    pub fn new(barcodes: &[Barcode]) -> Self {
        Self::from_index(&PatternIndex::new(barcodes))
    }

    /// Build a matcher from the usable patterns of a [`PatternIndex`].
    pub fn from_index(index: &PatternIndex) -> Self {
        // Sorting keeps node numbering independent of hash iteration order
        Self::from_patterns(index.iter().sorted())
    }

    /// Build a matcher from arbitrary `(pattern, barcode)` pairs.  Empty patterns are ignored.
    fn from_patterns<'p>(patterns: impl Iterator<Item = (&'p [u8], usize)>) -> Self {
        let mut nodes = vec![Node::default()];
        let mut num_patterns = 0;

        for (pattern, barcode) in patterns {
            if pattern.is_empty() {
                continue;
            }
            let mut state = ROOT;
            for &byte in pattern {
                state = match nodes[state].next(byte) {
                    Some(next) => next,
                    None => {
                        nodes.push(Node::default());
                        let next = nodes.len() - 1;
                        nodes[state].transitions.push((byte, next));
                        next
                    }
                };
            }
            nodes[state].terminal = Some(PatternEnd { barcode, len: pattern.len() });
            num_patterns += 1;
        }

        Self::link(&mut nodes);
        Self { nodes, num_patterns }
    }

    /// Compute failure and output links breadth-first so that every node's failure target is
    /// final before its children are visited.
    fn link(nodes: &mut [Node]) {
        let mut queue: VecDeque<usize> =
            nodes[ROOT].transitions.iter().map(|(_, child)| *child).collect();

        while let Some(state) = queue.pop_front() {
            let transitions = nodes[state].transitions.clone();
            for (byte, child) in transitions {
                let mut fallback = nodes[state].failure;
                let failure = loop {
                    if let Some(next) = nodes[fallback].next(byte) {
                        break next;
                    }
                    if fallback == ROOT {
                        break ROOT;
                    }
                    fallback = nodes[fallback].failure;
                };
                nodes[child].failure = failure;
                nodes[child].output =
                    if nodes[failure].terminal.is_some() { Some(failure) } else { nodes[failure].output };
                queue.push_back(child);
            }
        }
    }

    /// Advance the automaton from `state` on `byte`.
    #[inline]
    fn step(&self, mut state: usize, byte: u8) -> usize {
        loop {
            if let Some(next) = self.nodes[state].next(byte) {
                return next;
            }
            if state == ROOT {
                return ROOT;
            }
            state = self.nodes[state].failure;
        }
    }

    /// The number of patterns compiled into the automaton.
    pub fn num_patterns(&self) -> usize {
        self.num_patterns
    }

    /// Lazily find all (overlapping) pattern occurrences in `text`.
    ///
    /// Occurrences are yielded by increasing end position, and for a shared end position from
    /// the longest pattern to the shortest.
    pub fn find_iter<'m, 't>(&'m self, text: &'t [u8]) -> Matches<'m, 't> {
        Matches { matcher: self, text, position: 0, state: ROOT, pending: None }
    }
}

/// Iterator over the [`MatchOccurrence`]s of a [`BarcodeMatcher`] in a text.
#[derive(Debug)]
pub struct Matches<'m, 't> {
    matcher: &'m BarcodeMatcher,
    text: &'t [u8],
    /// The number of bytes of `text` consumed so far.
    position: usize,
    state: usize,
    /// The next node on the output chain whose pattern has not been reported yet.
    pending: Option<usize>,
}

impl<'m, 't> Iterator for Matches<'m, 't> {
    type Item = MatchOccurrence;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(node) = self.pending {
                let node = &self.matcher.nodes[node];
                self.pending = node.output;
                if let Some(end) = node.terminal {
                    return Some(MatchOccurrence {
                        start: self.position - end.len,
                        end: self.position,
                        barcode: end.barcode,
                    });
                }
                continue;
            }

            let byte = *self.text.get(self.position)?;
            self.state = self.matcher.step(self.state, byte);
            self.position += 1;
            let node = &self.matcher.nodes[self.state];
            self.pending = if node.terminal.is_some() { Some(self.state) } else { node.output };
        }
    }
}

impl<'m, 't> FusedIterator for Matches<'m, 't> {}
