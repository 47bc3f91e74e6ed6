//! Merge-sorted iteration over any number of ordered posting sources.
//!
//! [`merge`] folds the sources into a balanced binary tree of two-way merge
//! nodes by pairing adjacent sources until a single root remains, keeping
//! per-element work logarithmic in the source count. Ties between heads go
//! to the earlier source, which is what read-time deduplication leans on:
//! sources are listed newest-first, so the surviving duplicate is the
//! newest one.

use std::iter::Peekable;

use crate::posting::Entry;
use crate::Result;

/// An ordered, fallible stream of entries.
pub(crate) type EntryIter = Box<dyn Iterator<Item = Result<Entry>> + Send>;

/// Merge `sources` into one ordered stream.
///
/// Each source must already yield entries in composite-key order. Errors
/// pass through as `Err` items at the point they are encountered.
pub(crate) fn merge(mut sources: Vec<EntryIter>) -> EntryIter {
    if sources.is_empty() {
        return Box::new(std::iter::empty());
    }
    while sources.len() > 1 {
        let mut paired: Vec<EntryIter> = Vec::with_capacity((sources.len() + 1) / 2);
        let mut rest = sources.into_iter();
        while let Some(left) = rest.next() {
            match rest.next() {
                Some(right) => paired.push(Box::new(MergeNode::new(left, right))),
                None => paired.push(left),
            }
        }
        sources = paired;
    }
    sources.pop().expect("one source remains")
}

/// A two-way merge over ordered sources; ties yield the left side first.
struct MergeNode {
    left: Peekable<EntryIter>,
    right: Peekable<EntryIter>,
}

impl MergeNode {
    fn new(left: EntryIter, right: EntryIter) -> MergeNode {
        MergeNode {
            left: left.peekable(),
            right: right.peekable(),
        }
    }
}

impl Iterator for MergeNode {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        let take_left = match (self.left.peek(), self.right.peek()) {
            (None, None) => return None,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            // surface errors as soon as they become the head
            (Some(Err(_)), _) => true,
            (Some(Ok(_)), Some(Err(_))) => false,
            (Some(Ok((l, _))), Some(Ok((r, _)))) => l <= r,
        };
        if take_left {
            self.left.next()
        } else {
            self.right.next()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posting::EntryKey;

    fn entry(term: &[u8], value: &[u8], timestamp: u64, props: &[u8]) -> Entry {
        (
            EntryKey {
                index: b"i".to_vec(),
                field: b"f".to_vec(),
                term: term.to_vec(),
                value: value.to_vec(),
                timestamp,
            },
            Some(props.to_vec()),
        )
    }

    fn source(entries: Vec<Entry>) -> EntryIter {
        Box::new(entries.into_iter().map(Ok))
    }

    #[test]
    fn merges_in_composite_order() {
        let merged: Vec<Entry> = merge(vec![
            source(vec![entry(b"a", b"d1", 5, b"x"), entry(b"c", b"d1", 1, b"x")]),
            source(vec![entry(b"b", b"d9", 2, b"x")]),
            source(vec![entry(b"a", b"d2", 9, b"x")]),
        ])
        .map(|e| e.unwrap())
        .collect();

        let terms: Vec<&[u8]> = merged.iter().map(|(k, _)| k.term.as_slice()).collect();
        assert_eq!(terms, [&b"a"[..], &b"a"[..], &b"b"[..], &b"c"[..]]);
        // within term "a", values ascend
        assert_eq!(merged[0].0.value, b"d1");
        assert_eq!(merged[1].0.value, b"d2");
    }

    #[test]
    fn newest_timestamp_surfaces_first() {
        let merged: Vec<Entry> = merge(vec![
            source(vec![entry(b"t", b"d1", 1, b"old")]),
            source(vec![entry(b"t", b"d1", 7, b"new")]),
        ])
        .map(|e| e.unwrap())
        .collect();

        assert_eq!(merged[0].0.timestamp, 7);
        assert_eq!(merged[1].0.timestamp, 1);
    }

    #[test]
    fn ties_prefer_the_earlier_source() {
        let merged: Vec<Entry> = merge(vec![
            source(vec![entry(b"t", b"d1", 3, b"first")]),
            source(vec![entry(b"t", b"d1", 3, b"second")]),
        ])
        .map(|e| e.unwrap())
        .collect();

        assert_eq!(merged[0].1.as_deref(), Some(&b"first"[..]));
        assert_eq!(merged[1].1.as_deref(), Some(&b"second"[..]));
    }

    #[test]
    fn empty_and_uneven_sources() {
        let merged: Vec<Entry> = merge(vec![
            source(vec![]),
            source(vec![entry(b"t", b"d1", 1, b"x")]),
            source(vec![]),
        ])
        .map(|e| e.unwrap())
        .collect();
        assert_eq!(merged.len(), 1);

        assert_eq!(merge(Vec::new()).count(), 0);
    }
}
