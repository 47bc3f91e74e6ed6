//! The posting data model and its composite ordering.
//!
//! Everything the store holds is a [`Posting`]: a single indexed fact
//! `(index, field, term, value, timestamp, props)`. Buffers, segments and
//! the merge combinator all order postings by the composite key
//! `(index, field, term, value)` ascending, then timestamp *descending*,
//! so that the newest write for a `(key, value)` pair is the first one a
//! merged iteration encounters.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// A term key: the unit of lookup and of adjacency in segments.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key {
    /// Index name.
    pub index: Vec<u8>,
    /// Field name.
    pub field: Vec<u8>,
    /// Term within the field.
    pub term: Vec<u8>,
}

impl Key {
    /// Build a key from byte slices.
    pub fn new(index: &[u8], field: &[u8], term: &[u8]) -> Key {
        Key {
            index: index.to_vec(),
            field: field.to_vec(),
            term: term.to_vec(),
        }
    }
}

/// A single indexed fact.
///
/// `props` is an opaque payload; `None` is the tombstone sentinel that
/// deletes every lower-timestamp posting for the same `(key, value)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    /// Index name.
    pub index: Vec<u8>,
    /// Field name.
    pub field: Vec<u8>,
    /// Term within the field.
    pub term: Vec<u8>,
    /// The posted value, typically a document id.
    pub value: Vec<u8>,
    /// Writer-assigned monotone timestamp.
    pub timestamp: u64,
    /// Opaque properties, or `None` for a tombstone.
    pub props: Option<Vec<u8>>,
}

impl Posting {
    /// Split into the sortable composite key and the props payload.
    pub(crate) fn into_entry(self) -> Entry {
        (
            EntryKey {
                index: self.index,
                field: self.field,
                term: self.term,
                value: self.value,
                timestamp: self.timestamp,
            },
            self.props,
        )
    }

    pub(crate) fn from_entry(key: EntryKey, props: Option<Vec<u8>>) -> Posting {
        Posting {
            index: key.index,
            field: key.field,
            term: key.term,
            value: key.value,
            timestamp: key.timestamp,
            props,
        }
    }
}

/// Props payload of an entry; `None` marks a tombstone.
pub(crate) type Props = Option<Vec<u8>>;

/// A posting split into its sortable key and its payload.
pub(crate) type Entry = (EntryKey, Props);

/// The composite sort key of a posting.
///
/// Ordering: `(index, field, term, value)` ascending, then `timestamp`
/// descending. The descending timestamp leg must stay consistent across
/// buffers, segments and the merge combinator; read-time deduplication
/// relies on the newest write surfacing first.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) struct EntryKey {
    pub index: Vec<u8>,
    pub field: Vec<u8>,
    pub term: Vec<u8>,
    pub value: Vec<u8>,
    pub timestamp: u64,
}

impl EntryKey {
    /// First possible entry for `key`: empty value, maximal timestamp.
    pub fn lower_bound(key: &Key) -> EntryKey {
        EntryKey {
            index: key.index.clone(),
            field: key.field.clone(),
            term: key.term.clone(),
            value: Vec::new(),
            timestamp: u64::MAX,
        }
    }

    pub fn matches(&self, key: &Key) -> bool {
        self.index == key.index && self.field == key.field && self.term == key.term
    }
}

impl Ord for EntryKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index
            .cmp(&other.index)
            .then_with(|| self.field.cmp(&other.field))
            .then_with(|| self.term.cmp(&other.term))
            .then_with(|| self.value.cmp(&other.value))
            .then_with(|| other.timestamp.cmp(&self.timestamp))
    }
}

impl PartialOrd for EntryKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: &[u8], value: &[u8], timestamp: u64) -> EntryKey {
        EntryKey {
            index: b"i".to_vec(),
            field: b"f".to_vec(),
            term: term.to_vec(),
            value: value.to_vec(),
            timestamp,
        }
    }

    #[test]
    fn newer_timestamp_sorts_first() {
        let older = entry(b"t", b"v", 1);
        let newer = entry(b"t", b"v", 2);
        assert!(newer < older);
    }

    #[test]
    fn key_components_sort_ascending() {
        assert!(entry(b"a", b"z", 1) < entry(b"b", b"a", 9));
        assert!(entry(b"t", b"d1", 1) < entry(b"t", b"d2", 9));
    }

    #[test]
    fn lower_bound_precedes_all_entries_of_key() {
        let key = Key::new(b"i", b"f", b"t");
        let bound = EntryKey::lower_bound(&key);
        assert!(bound <= entry(b"t", b"", u64::MAX));
        assert!(bound < entry(b"t", b"d1", 0));
        assert!(bound < entry(b"t", b"d1", u64::MAX));
    }

    #[test]
    fn wire_round_trip() {
        let posting = Posting {
            index: b"i".to_vec(),
            field: b"f".to_vec(),
            term: b"t".to_vec(),
            value: b"d1".to_vec(),
            timestamp: 42,
            props: None,
        };
        let json = serde_json::to_string(&posting).unwrap();
        let back: Posting = serde_json::from_str(&json).unwrap();
        assert_eq!(posting, back);
    }
}
