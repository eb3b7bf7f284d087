//! Session snapshots and pure state diffing

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One object in the modeled document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentObject {
    /// Object name, unique within the document
    pub name: String,
    /// Object kind (e.g. "solid", "sketch")
    pub kind: String,
    /// Axis-aligned bounding box as (min_x, min_y, min_z, max_x, max_y, max_z)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<[f64; 6]>,
    /// Enclosed volume, when the object is a solid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
}

/// A point-in-time snapshot of a session's modeling state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Owning session
    pub session_id: String,
    /// Objects present in the document
    #[serde(default)]
    pub objects: Vec<DocumentObject>,
    /// Whether the document currently has errors
    #[serde(default)]
    pub has_errors: bool,
    /// Pipeline status at capture time, if a pipeline was active
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_status: Option<String>,
    /// Pipeline iteration at capture time
    #[serde(default)]
    pub iteration: u32,
    /// Capture timestamp
    pub captured_at: DateTime<Utc>,
}

impl SessionSnapshot {
    /// An empty snapshot for a session
    pub fn empty(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            objects: Vec::new(),
            has_errors: false,
            pipeline_status: None,
            iteration: 0,
            captured_at: Utc::now(),
        }
    }

    /// Number of objects in the document
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// A short digest-friendly summary used in decision fingerprints
    ///
    /// Only the document contents participate: two sessions whose
    /// documents are identical fingerprint identically regardless of how
    /// many pipeline passes produced them.
    pub fn summary(&self) -> String {
        let mut names: Vec<&str> = self.objects.iter().map(|o| o.name.as_str()).collect();
        names.sort_unstable();
        format!("objects={};errors={}", names.join(","), self.has_errors)
    }
}

/// Structural difference between two snapshots
///
/// Computed, never stored. The add/remove lists are sufficient to
/// reconstruct the target object set from the base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDiff {
    /// Object names present after but not before, sorted
    pub objects_added: Vec<String>,
    /// Object names present before but not after, sorted
    pub objects_removed: Vec<String>,
    /// Change in object count
    pub object_count_delta: i64,
    /// Whether the operation introduced document errors
    pub error_introduced: bool,
}

impl StateDiff {
    /// Whether the two snapshots were structurally identical
    pub fn is_empty(&self) -> bool {
        self.objects_added.is_empty()
            && self.objects_removed.is_empty()
            && self.object_count_delta == 0
            && !self.error_introduced
    }
}

/// Compute the structural diff between two snapshots
///
/// Pure function: no storage or clock access.
pub fn diff(before: &SessionSnapshot, after: &SessionSnapshot) -> StateDiff {
    let before_names: BTreeSet<&str> = before.objects.iter().map(|o| o.name.as_str()).collect();
    let after_names: BTreeSet<&str> = after.objects.iter().map(|o| o.name.as_str()).collect();

    StateDiff {
        objects_added: after_names
            .difference(&before_names)
            .map(|s| s.to_string())
            .collect(),
        objects_removed: before_names
            .difference(&after_names)
            .map(|s| s.to_string())
            .collect(),
        object_count_delta: after.object_count() as i64 - before.object_count() as i64,
        error_introduced: !before.has_errors && after.has_errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(name: &str) -> DocumentObject {
        DocumentObject {
            name: name.to_string(),
            kind: "solid".to_string(),
            bounding_box: None,
            volume: None,
        }
    }

    fn snapshot(names: &[&str], has_errors: bool) -> SessionSnapshot {
        SessionSnapshot {
            objects: names.iter().map(|n| obj(n)).collect(),
            has_errors,
            ..SessionSnapshot::empty("s1")
        }
    }

    #[test]
    fn diff_of_identical_snapshots_is_empty() {
        let a = snapshot(&["box", "hole"], false);
        assert!(diff(&a, &a).is_empty());
    }

    #[test]
    fn diff_reports_adds_removes_and_delta() {
        let a = snapshot(&["box", "hole"], false);
        let b = snapshot(&["box", "fillet", "pattern"], false);

        let d = diff(&a, &b);
        assert_eq!(d.objects_added, vec!["fillet", "pattern"]);
        assert_eq!(d.objects_removed, vec!["hole"]);
        assert_eq!(d.object_count_delta, 1);
        assert!(!d.error_introduced);
    }

    #[test]
    fn diff_detects_error_introduction() {
        let clean = snapshot(&["box"], false);
        let broken = snapshot(&["box"], true);

        assert!(diff(&clean, &broken).error_introduced);
        // Errors clearing is not an "introduction"
        assert!(!diff(&broken, &clean).error_introduced);
        // Already-broken stays non-introduced
        assert!(!diff(&broken, &broken).error_introduced);
    }

    mod diff_properties {
        use super::*;
        use proptest::prelude::*;

        fn snapshot_from(names: Vec<String>) -> SessionSnapshot {
            let mut unique: Vec<String> = names;
            unique.sort();
            unique.dedup();
            SessionSnapshot {
                objects: unique.iter().map(|n| obj(n)).collect(),
                ..SessionSnapshot::empty("s1")
            }
        }

        proptest! {
            /// diff(s, s) is always empty
            #[test]
            fn self_diff_is_empty(names in proptest::collection::vec("[a-z]{1,6}", 0..8)) {
                let s = snapshot_from(names);
                prop_assert!(diff(&s, &s).is_empty());
            }

            /// Applying the diff lists to the base reproduces the target
            #[test]
            fn diff_reconstructs_target(
                before in proptest::collection::vec("[a-z]{1,6}", 0..8),
                after in proptest::collection::vec("[a-z]{1,6}", 0..8),
            ) {
                let a = snapshot_from(before);
                let b = snapshot_from(after);
                let d = diff(&a, &b);

                let mut rebuilt: BTreeSet<String> =
                    a.objects.iter().map(|o| o.name.clone()).collect();
                for removed in &d.objects_removed {
                    rebuilt.remove(removed);
                }
                for added in &d.objects_added {
                    rebuilt.insert(added.clone());
                }
                let target: BTreeSet<String> =
                    b.objects.iter().map(|o| o.name.clone()).collect();
                prop_assert_eq!(rebuilt, target);
                prop_assert_eq!(
                    d.object_count_delta,
                    b.object_count() as i64 - a.object_count() as i64
                );
            }
        }
    }

    #[test]
    fn diff_lists_reconstruct_target() {
        let a = snapshot(&["box", "hole", "rib"], false);
        let b = snapshot(&["box", "boss"], false);
        let d = diff(&a, &b);

        let mut rebuilt: BTreeSet<String> =
            a.objects.iter().map(|o| o.name.clone()).collect();
        for r in &d.objects_removed {
            rebuilt.remove(r);
        }
        for add in &d.objects_added {
            rebuilt.insert(add.clone());
        }

        let target: BTreeSet<String> = b.objects.iter().map(|o| o.name.clone()).collect();
        assert_eq!(rebuilt, target);
        assert_eq!(
            d.object_count_delta,
            b.object_count() as i64 - a.object_count() as i64
        );
    }
}
