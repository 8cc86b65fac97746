//! Namespace burst policy table.
//!
//! Maps a namespace name to the CFS burst percentage declared by its
//! [`BURST_PERCENT_ANNOTATION`]. The namespace watcher is the only writer, the
//! pod reconciler reads it for every pod event. The lock is held only for the
//! duration of a map access, never across I/O.

use std::collections::HashMap;
use std::sync::PoisonError;
use std::sync::RwLock;

use tracing::debug;
use tracing::warn;

/// Namespace annotation carrying the burst percentage, e.g. `cfs.io/burst_percent: "50"`.
pub const BURST_PERCENT_ANNOTATION: &str = "cfs.io/burst_percent";

/// Errors raised when a policy value cannot be accepted.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum PolicyError {
    #[display("{namespace}: burst percentage {value:?} is not an integer")]
    InvalidValue { namespace: String, value: String },
    #[display("{namespace}: burst percentage {percent} is invalid (max={max})")]
    OutOfRange {
        namespace: String,
        percent: i64,
        max: u32,
    },
}

impl core::error::Error for PolicyError {}

/// Result of applying a namespace's annotation state to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyChange {
    /// The namespace now carries this percentage.
    Set(u32),
    /// The annotation is absent, any previous entry is gone.
    Removed,
    /// The annotation is present but unusable, the previous entry (if any) is kept.
    Rejected,
}

#[derive(Debug)]
pub struct PolicyTable {
    entries: RwLock<HashMap<String, u32>>,
    max_burst_percent: u32,
}

impl PolicyTable {
    pub fn new(max_burst_percent: u32) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_burst_percent,
        }
    }

    pub fn max_burst_percent(&self) -> u32 {
        self.max_burst_percent
    }

    /// Upsert the burst percentage of `namespace`, returning the stored value.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::OutOfRange`] if `percent` is outside `[0, max_burst_percent]`;
    ///   the table is left untouched.
    pub fn set(&self, namespace: &str, percent: i64) -> Result<u32, PolicyError> {
        let percent = match u32::try_from(percent) {
            Ok(p) if p <= self.max_burst_percent => p,
            _ => {
                let err = PolicyError::OutOfRange {
                    namespace: namespace.to_string(),
                    percent,
                    max: self.max_burst_percent,
                };
                warn!("{err}");
                return Err(err);
            }
        };

        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(namespace.to_string(), percent);
        Ok(percent)
    }

    /// Remove the entry of `namespace`, no-op if absent.
    pub fn remove(&self, namespace: &str) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(namespace);
    }

    /// Burst percentage of `namespace`, `0` when it has no policy.
    pub fn get(&self, namespace: &str) -> u32 {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .copied()
            .unwrap_or(0)
    }

    /// Copy of the whole table, for diagnostics.
    pub fn snapshot(&self) -> HashMap<String, u32> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply the current annotation value of a namespace.
    ///
    /// An absent annotation clears the entry. A present but non-numeric or
    /// out-of-range value is logged and ignored, so a typo never drops a
    /// namespace back to zero burst.
    pub fn apply_annotation(&self, namespace: &str, value: Option<&str>) -> PolicyChange {
        let Some(value) = value else {
            debug!(namespace, "no burst annotation, clearing policy");
            self.remove(namespace);
            return PolicyChange::Removed;
        };

        let percent = match value.trim().parse::<i64>() {
            Ok(percent) => percent,
            Err(_) => {
                warn!(
                    "{}",
                    PolicyError::InvalidValue {
                        namespace: namespace.to_string(),
                        value: value.to_string(),
                    }
                );
                return PolicyChange::Rejected;
            }
        };

        match self.set(namespace, percent) {
            Ok(percent) => {
                debug!(namespace, percent, "burst policy updated");
                PolicyChange::Set(percent)
            }
            Err(_) => PolicyChange::Rejected,
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn every_in_range_percentage_round_trips() {
        let table = PolicyTable::new(200);
        for p in 0..=200u32 {
            let stored = table
                .set("team-a", i64::from(p))
                .expect("in-range value should be accepted");
            assert_eq!(stored, p);
            assert_eq!(table.get("team-a"), p);
        }
    }

    #[test]
    fn out_of_range_leaves_entry_untouched() {
        let table = PolicyTable::new(200);
        table.set("team-a", 50).unwrap();

        let err = table.set("team-a", 201).unwrap_err();
        assert_eq!(
            err,
            PolicyError::OutOfRange {
                namespace: "team-a".to_string(),
                percent: 201,
                max: 200,
            }
        );
        assert!(table.set("team-a", -1).is_err());
        assert_eq!(table.get("team-a"), 50);
    }

    #[test]
    fn absent_namespace_reads_zero() {
        let table = PolicyTable::new(200);
        assert_eq!(table.get("nobody"), 0);
        table.remove("nobody");
        assert!(table.is_empty());
    }

    #[test]
    fn annotation_rules() {
        let table = PolicyTable::new(100);

        assert_eq!(table.apply_annotation("ns", Some("40")), PolicyChange::Set(40));
        assert_eq!(table.get("ns"), 40);

        assert_eq!(table.apply_annotation("ns", Some("abc")), PolicyChange::Rejected);
        assert_eq!(table.get("ns"), 40, "non-numeric value keeps prior entry");

        assert_eq!(table.apply_annotation("ns", Some("150")), PolicyChange::Rejected);
        assert_eq!(table.get("ns"), 40, "out-of-range value keeps prior entry");

        assert_eq!(table.apply_annotation("ns", None), PolicyChange::Removed);
        assert_eq!(table.get("ns"), 0);
        assert!(table.is_empty());
    }

    #[test]
    fn rejected_annotation_on_unknown_namespace_creates_nothing() {
        let table = PolicyTable::new(200);
        assert_eq!(table.apply_annotation("ns", Some("-3")), PolicyChange::Rejected);
        assert!(table.snapshot().is_empty());
    }

    #[test]
    fn snapshot_is_a_copy() {
        let table = PolicyTable::new(200);
        table.set("a", 10).unwrap();
        table.set("b", 20).unwrap();

        let snapshot = table.snapshot();
        table.remove("a");

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get("a"), Some(&10));
        assert_eq!(table.len(), 1);
    }
}
