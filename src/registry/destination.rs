//! Destination sets and expiry deadlines
//!
//! A `DestinationSet` is the pure-data registry of interested targets for one
//! source. It is owned by exactly one holder at a time: the subscription's
//! pending buffer, or the connection once it has been established.

use std::collections::btree_map::{self, BTreeMap};

use chrono::{DateTime, Utc};

use super::data::DestinationId;

/// Deadline after which a destination no longer receives dispatches
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Expiry(DateTime<Utc>);

impl Expiry {
    /// Never expires
    pub const NEVER: Expiry = Expiry(DateTime::<Utc>::MAX_UTC);

    /// Expire at the given instant
    pub fn at(deadline: DateTime<Utc>) -> Self {
        Self(deadline)
    }

    /// The deadline
    pub fn deadline(&self) -> DateTime<Utc> {
        self.0
    }

    pub fn is_never(&self) -> bool {
        *self == Self::NEVER
    }

    /// Whether a dispatch taken at `now` may still reach this destination
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now <= self.0
    }
}

impl Default for Expiry {
    fn default() -> Self {
        Self::NEVER
    }
}

impl From<DateTime<Utc>> for Expiry {
    fn from(deadline: DateTime<Utc>) -> Self {
        Self(deadline)
    }
}

impl std::fmt::Display for Expiry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_never() {
            f.write_str("never")
        } else {
            write!(f, "{}", self.0.to_rfc3339())
        }
    }
}

/// Outcome of inserting into a `DestinationSet`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// The destination was not present
    Added,
    /// The destination was present with a different expiry
    Updated,
    /// The destination was present with the same expiry
    Unchanged,
}

impl Upsert {
    /// Whether the set was modified
    pub fn changed(self) -> bool {
        self != Upsert::Unchanged
    }
}

/// Mapping of destination to expiry, unique by destination
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestinationSet {
    entries: BTreeMap<DestinationId, Expiry>,
}

impl DestinationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a destination or update its expiry in place
    pub fn upsert(&mut self, dest: DestinationId, expiry: Expiry) -> Upsert {
        match self.entries.insert(dest, expiry) {
            None => Upsert::Added,
            Some(previous) if previous == expiry => Upsert::Unchanged,
            Some(_) => Upsert::Updated,
        }
    }

    /// Remove a destination, returning its expiry if it was present
    pub fn remove(&mut self, dest: &DestinationId) -> Option<Expiry> {
        self.entries.remove(dest)
    }

    pub fn get(&self, dest: &DestinationId) -> Option<Expiry> {
        self.entries.get(dest).copied()
    }

    pub fn contains(&self, dest: &DestinationId) -> bool {
        self.entries.contains_key(dest)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over destinations in id order
    pub fn iter(&self) -> btree_map::Iter<'_, DestinationId, Expiry> {
        self.entries.iter()
    }

    /// Split destinations into those still valid at `now` and those expired
    pub fn partition_at(&self, now: DateTime<Utc>) -> (Vec<DestinationId>, Vec<DestinationId>) {
        let (valid, expired): (Vec<_>, Vec<_>) =
            self.entries.iter().partition(|(_, expiry)| expiry.is_valid_at(now));

        (
            valid.into_iter().map(|(dest, _)| dest.clone()).collect(),
            expired.into_iter().map(|(dest, _)| dest.clone()).collect(),
        )
    }
}

impl IntoIterator for DestinationSet {
    type Item = (DestinationId, Expiry);
    type IntoIter = btree_map::IntoIter<DestinationId, Expiry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a DestinationSet {
    type Item = (&'a DestinationId, &'a Expiry);
    type IntoIter = btree_map::Iter<'a, DestinationId, Expiry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl FromIterator<(DestinationId, Expiry)> for DestinationSet {
    fn from_iter<I: IntoIterator<Item = (DestinationId, Expiry)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
