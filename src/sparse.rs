//! sparse.rs
//!
//! Packed small-integer-key → long-value map stored inside a single field.
//! Both realizations persist it as `key,value|key,value` and decode it here,
//! so a document-store row and a relational row read back identically.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::errors::QueryError;

const PAIR_SPLIT: char = '|';
const KEY_VALUE_SPLIT: char = ',';

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntKeyLongMap {
    entries: BTreeMap<i32, i64>,
}

impl IntKeyLongMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a stored field. `field` only feeds the error message.
    pub fn decode(field: &str, raw: &str) -> Result<Self, QueryError> {
        let mut entries = BTreeMap::new();
        for pair in raw.split(PAIR_SPLIT).map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once(KEY_VALUE_SPLIT)
                .ok_or_else(|| QueryError::decode(field, format!("pair `{pair}` has no `,`")))?;
            let key = key
                .trim()
                .parse::<i32>()
                .map_err(|e| QueryError::decode(field, format!("key in `{pair}`: {e}")))?;
            let value = value
                .trim()
                .parse::<i64>()
                .map_err(|e| QueryError::decode(field, format!("value in `{pair}`: {e}")))?;
            entries.insert(key, value);
        }
        Ok(Self { entries })
    }

    pub fn insert(&mut self, key: i32, value: i64) {
        self.entries.insert(key, value);
    }

    /// Absent keys read as zero.
    pub fn get(&self, key: i32) -> i64 {
        self.entries.get(&key).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, i64)> + '_ {
        self.entries.iter().map(|(k, v)| (*k, *v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromStr for IntKeyLongMap {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode("value", s)
    }
}

impl fmt::Display for IntKeyLongMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, "{PAIR_SPLIT}")?;
            }
            write!(f, "{key}{KEY_VALUE_SPLIT}{value}")?;
        }
        Ok(())
    }
}

impl FromIterator<(i32, i64)> for IntKeyLongMap {
    fn from_iter<T: IntoIterator<Item = (i32, i64)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
