//! Stream Entry Types
//!
//! Identifiers and entries of the durable, append-only stream buffer.
//!
//! Entry ids have the form `<ms>-<seq>`: a millisecond timestamp and a
//! sequence number within that millisecond. Ids are assigned by the buffer,
//! are unique within a stream, and increase monotonically. Ordering compares
//! the numeric parts, so `1-10` sorts after `1-9`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// =============================================================================
// Entry Id
// =============================================================================

/// Identifier of a stream entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[derive(Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntryId {
    ms: u64,
    seq: u64,
}

impl EntryId {
    /// The smallest possible id (`0-0`). Never assigned to an entry.
    pub const ZERO: Self = Self { ms: 0, seq: 0 };

    /// Create an id from its parts.
    #[must_use]
    pub const fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Millisecond part.
    #[must_use]
    pub const fn ms(&self) -> u64 {
        self.ms
    }

    /// Sequence part.
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    /// Next id to assign after `self`, given the current clock in ms.
    ///
    /// Uses the clock when it has advanced past `self`, otherwise bumps the
    /// sequence so ids stay strictly increasing even if the clock goes back.
    #[must_use]
    pub const fn successor(&self, now_ms: u64) -> Self {
        if now_ms > self.ms {
            Self { ms: now_ms, seq: 0 }
        } else {
            Self {
                ms: self.ms,
                seq: self.seq.saturating_add(1),
            }
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = EntryIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ms, seq) = s
            .split_once('-')
            .ok_or_else(|| EntryIdError(s.to_string()))?;
        let ms = ms.parse().map_err(|_| EntryIdError(s.to_string()))?;
        let seq = seq.parse().map_err(|_| EntryIdError(s.to_string()))?;
        Ok(Self { ms, seq })
    }
}

impl TryFrom<String> for EntryId {
    type Error = EntryIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntryId> for String {
    fn from(id: EntryId) -> Self {
        id.to_string()
    }
}

/// Invalid entry id text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid stream entry id: {0:?}")]
pub struct EntryIdError(pub String);

// =============================================================================
// Entries
// =============================================================================

/// Immutable entry of the stream buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Buffer-assigned id.
    pub id: EntryId,
    /// JSON payload, stored under the `data` field.
    pub payload: String,
}

impl StreamEntry {
    /// Create a new entry.
    #[must_use]
    pub fn new(id: EntryId, payload: impl Into<String>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }
}

/// Name of the single field holding an entry's payload.
pub const PAYLOAD_FIELD: &str = "data";

// =============================================================================
// Consumer Groups
// =============================================================================

/// Where a newly created consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupStart {
    /// Deliver every retained entry (`0`).
    #[default]
    Beginning,
    /// Deliver only entries appended after creation (`$`).
    Latest,
}

impl GroupStart {
    /// Parse from a configuration string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "latest" | "$" => Self::Latest,
            _ => Self::Beginning,
        }
    }

    /// Id argument used when creating the group.
    #[must_use]
    pub const fn as_start_id(&self) -> &'static str {
        match self {
            Self::Beginning => "0",
            Self::Latest => "$",
        }
    }
}

/// Snapshot of the stream's retained range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamInfo {
    /// Retained entry count.
    pub length: u64,
    /// Oldest retained id.
    pub first_id: Option<EntryId>,
    /// Newest retained id.
    pub last_id: Option<EntryId>,
    /// Configured length cap.
    pub max_len: u64,
}

/// Result of reclaiming idle pending entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimResult {
    /// Entries now owned by the claiming consumer, in id order.
    pub entries: Vec<StreamEntry>,
    /// Pending ids whose entries were trimmed before they could be claimed.
    pub deleted: Vec<EntryId>,
}

impl ClaimResult {
    /// True if nothing was claimed or cleaned up.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.deleted.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test_case("0-0", EntryId::ZERO ; "zero")]
    #[test_case("1526919030474-55", EntryId::new(1_526_919_030_474, 55) ; "redis style")]
    #[test_case("5-18446744073709551615", EntryId::new(5, u64::MAX) ; "max sequence")]
    fn parses_valid_ids(text: &str, expected: EntryId) {
        assert_eq!(text.parse::<EntryId>().unwrap(), expected);
    }

    #[test_case("" ; "empty")]
    #[test_case("12" ; "no separator")]
    #[test_case("a-1" ; "non numeric ms")]
    #[test_case("1-" ; "missing sequence")]
    #[test_case("-1-2" ; "negative")]
    fn rejects_invalid_ids(text: &str) {
        assert!(text.parse::<EntryId>().is_err());
    }

    #[test]
    fn ordering_is_numeric_not_lexicographic() {
        let a: EntryId = "1-9".parse().unwrap();
        let b: EntryId = "1-10".parse().unwrap();
        let c: EntryId = "2-0".parse().unwrap();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn successor_uses_clock_when_it_advances() {
        let id = EntryId::new(100, 4);
        assert_eq!(id.successor(101), EntryId::new(101, 0));
        assert_eq!(id.successor(100), EntryId::new(100, 5));
        assert_eq!(id.successor(42), EntryId::new(100, 5));
    }

    #[test]
    fn serializes_as_string() {
        let id = EntryId::new(7, 3);
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"7-3\"");
        let back: EntryId = serde_json::from_str("\"7-3\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn group_start_ids() {
        assert_eq!(GroupStart::Beginning.as_start_id(), "0");
        assert_eq!(GroupStart::Latest.as_start_id(), "$");
        assert_eq!(
            GroupStart::from_str_case_insensitive("LATEST"),
            GroupStart::Latest
        );
        assert_eq!(
            GroupStart::from_str_case_insensitive("anything"),
            GroupStart::Beginning
        );
    }

    proptest! {
        #[test]
        fn successor_is_strictly_greater(ms in 0u64..u64::MAX, seq in 0u64..u64::MAX, now in 0u64..u64::MAX) {
            let id = EntryId::new(ms, seq);
            prop_assert!(id.successor(now) > id);
        }

        #[test]
        fn display_parse_preserves_order(a in (0u64..1_000_000, 0u64..1_000), b in (0u64..1_000_000, 0u64..1_000)) {
            let x = EntryId::new(a.0, a.1);
            let y = EntryId::new(b.0, b.1);
            let px: EntryId = x.to_string().parse().unwrap();
            let py: EntryId = y.to_string().parse().unwrap();
            prop_assert_eq!(px.cmp(&py), a.cmp(&b));
        }
    }
}
