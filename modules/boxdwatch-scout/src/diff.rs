//! Changeset computation between a scraped record set and persisted state.

use std::collections::HashSet;

use chrono::Utc;

use boxdwatch_common::{Changeset, WatchlistRecord};

/// Diff an incoming scrape against the currently live external ids.
///
/// `added` keeps the incoming observation order and drops duplicate
/// sightings (adjacent pages can overlap when the list shifts under
/// the scrape). A record present on both sides is never re-emitted,
/// even if other fields changed — membership is the only thing
/// compared, which keeps this O(n) set work.
pub fn diff(
    target_user: &str,
    incoming: &[WatchlistRecord],
    existing_ids: &HashSet<String>,
) -> Changeset {
    let mut seen: HashSet<&str> = HashSet::with_capacity(incoming.len());
    let mut added = Vec::new();

    for record in incoming {
        if !seen.insert(record.external_id.as_str()) {
            continue;
        }
        if !existing_ids.contains(&record.external_id) {
            added.push(record.clone());
        }
    }

    let mut removed: Vec<String> = existing_ids
        .iter()
        .filter(|id| !seen.contains(id.as_str()))
        .cloned()
        .collect();
    removed.sort();

    Changeset {
        target_user: target_user.to_string(),
        added,
        removed,
        computed_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::record;

    fn ids(values: &[&str]) -> HashSet<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn fresh_user_adds_everything_in_order() {
        // Pages [{A,B}, {B,C}] against empty state: added = [A,B,C].
        let incoming = vec![
            record("A", "user"),
            record("B", "user"),
            record("B", "user"),
            record("C", "user"),
        ];
        let changeset = diff("user", &incoming, &HashSet::new());

        let added: Vec<&str> = changeset
            .added
            .iter()
            .map(|r| r.external_id.as_str())
            .collect();
        assert_eq!(added, vec!["A", "B", "C"]);
        assert!(changeset.removed.is_empty());
    }

    #[test]
    fn membership_diff_against_prior_state() {
        // Prior {A,B,C}, new {A,C,D}: added [D], removed {B}.
        let incoming = vec![
            record("A", "user"),
            record("C", "user"),
            record("D", "user"),
        ];
        let changeset = diff("user", &incoming, &ids(&["A", "B", "C"]));

        let added: Vec<&str> = changeset
            .added
            .iter()
            .map(|r| r.external_id.as_str())
            .collect();
        assert_eq!(added, vec!["D"]);
        assert_eq!(changeset.removed, vec!["B".to_string()]);
    }

    #[test]
    fn unchanged_state_yields_empty_changeset() {
        let incoming = vec![record("A", "user"), record("B", "user")];
        let changeset = diff("user", &incoming, &ids(&["A", "B"]));
        assert!(changeset.is_empty());
    }

    #[test]
    fn added_and_removed_never_intersect() {
        let incoming = vec![
            record("A", "user"),
            record("B", "user"),
            record("A", "user"),
        ];
        let changeset = diff("user", &incoming, &ids(&["B", "C"]));

        let added: HashSet<&str> = changeset
            .added
            .iter()
            .map(|r| r.external_id.as_str())
            .collect();
        for removed in &changeset.removed {
            assert!(!added.contains(removed.as_str()));
        }
    }

    #[test]
    fn empty_incoming_removes_all() {
        let changeset = diff("user", &[], &ids(&["A", "B"]));
        assert!(changeset.added.is_empty());
        assert_eq!(changeset.removed, vec!["A".to_string(), "B".to_string()]);
    }
}
