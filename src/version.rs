//! Schema versioning utilities
//!
//! Versions are per-(table, column) integers starting at 1. Engine paths
//! never move a version backwards: every candidate is reconciled against the
//! stored version with [`SchemaVersion::reconcile`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonic version of a single JSONB column schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaVersion(u32);

impl SchemaVersion {
    /// Version assigned to a freshly bootstrapped schema
    pub const INITIAL: SchemaVersion = SchemaVersion(1);

    /// Create a version, clamping anything below 1 up to [`Self::INITIAL`]
    pub fn new(version: u32) -> Self {
        Self(version.max(1))
    }

    /// Raw version number
    pub fn get(&self) -> u32 {
        self.0
    }

    /// The next version (current + 1)
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Reconcile a proposed version with the stored one.
    ///
    /// Extension proposes `current.next()`, rehydration proposes the highest
    /// persisted version; both resolve through the same max rule.
    pub fn reconcile(current: SchemaVersion, candidate: SchemaVersion) -> SchemaVersion {
        current.max(candidate)
    }
}

impl Default for SchemaVersion {
    fn default() -> Self {
        Self::INITIAL
    }
}

impl From<u32> for SchemaVersion {
    fn from(version: u32) -> Self {
        Self::new(version)
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_floor() {
        assert_eq!(SchemaVersion::new(0), SchemaVersion::INITIAL);
        assert_eq!(SchemaVersion::from(7).get(), 7);
    }

    #[test]
    fn test_version_bump() {
        let v = SchemaVersion::new(3);
        assert_eq!(v.next().get(), 4);
        assert_eq!(v.to_string(), "v3");
    }

    #[test]
    fn test_reconcile_never_regresses() {
        let current = SchemaVersion::new(5);
        assert_eq!(SchemaVersion::reconcile(current, SchemaVersion::new(2)).get(), 5);
        assert_eq!(SchemaVersion::reconcile(current, current.next()).get(), 6);
    }
}
