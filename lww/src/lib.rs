//! The pure merge core: fold a [`Change`] into the materialized state of one
//! entity, last-writer-wins per field by HLC order.
//!
//! [`merge`] is deterministic, commutative and idempotent over changes
//! targeting the same entity, which is what lets replicas converge no matter
//! the order changes arrive in. It performs no I/O and never fails; callers
//! validate changes before handing them over.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use data_types::{Change, ChangeKind};
use hlc::Hlc;
use serde_json::Value;
use std::collections::BTreeMap;

/// The materialized state of a single entity row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntityState {
    /// Latest accepted value per field.
    pub values: BTreeMap<String, Value>,
    /// The tag under which each value was accepted; same key set as `values`.
    pub tags: BTreeMap<String, Hlc>,
    /// Whether the entity is currently tombstoned.
    pub deleted: bool,
    /// The tag of the last accepted delete. Retained across revivals so that
    /// late-arriving deletes older than it stay swallowed.
    pub deleted_tag: Option<Hlc>,
}

/// What [`merge`] decided about a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The state changed; persist it.
    Saved,
    /// The entity was tombstoned; mark it removed.
    Removed,
    /// The change lost everywhere; nothing to persist.
    Noop,
}

/// Fold `change` into `prior`, producing the next state and the outcome.
pub fn merge(prior: Option<&EntityState>, change: &Change) -> (EntityState, MergeOutcome) {
    match change.kind {
        ChangeKind::Delete => merge_delete(prior, change),
        ChangeKind::Upsert => merge_upsert(prior, change),
    }
}

fn merge_delete(prior: Option<&EntityState>, change: &Change) -> (EntityState, MergeOutcome) {
    let dominates = prior
        .and_then(|p| p.deleted_tag.as_ref())
        .map_or(true, |deleted_tag| change.hlc > *deleted_tag);

    let mut next = prior.cloned().unwrap_or_default();
    if !dominates {
        return (next, MergeOutcome::Noop);
    }

    next.deleted = true;
    next.deleted_tag = Some(change.hlc.clone());
    (next, MergeOutcome::Removed)
}

fn merge_upsert(prior: Option<&EntityState>, change: &Change) -> (EntityState, MergeOutcome) {
    let mut next = prior.cloned().unwrap_or_default();

    // A tombstoned entity only takes updates when some patched field's tag
    // beats the tombstone; anything older loses wholesale.
    let mut revived = false;
    if next.deleted {
        let deleted_tag = next.deleted_tag.as_ref();
        let beats_tombstone = change
            .tags
            .values()
            .any(|tag| deleted_tag.map_or(true, |dt| tag > dt));
        if !beats_tombstone {
            return (next, MergeOutcome::Noop);
        }
        // deleted_tag stays put: it gates future late-arriving deletes
        next.deleted = false;
        revived = true;
    }

    let mut changed = false;
    for (field, value) in &change.patch {
        let tag = match change.tags.get(field) {
            Some(tag) => tag,
            None => continue,
        };
        let accept = next.tags.get(field).map_or(true, |current| tag > current);
        if accept {
            next.values.insert(field.clone(), value.clone());
            next.tags.insert(field.clone(), tag.clone());
            changed = true;
        }
    }

    if changed || revived {
        (next, MergeOutcome::Saved)
    } else {
        (next, MergeOutcome::Noop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn hlc(text: &str) -> Hlc {
        text.parse().unwrap()
    }

    fn upsert(fields: &[(&str, Value)], at: &str) -> Change {
        Change::upsert(
            "user-1",
            "todos",
            "t1",
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            hlc(at),
        )
    }

    fn delete(at: &str) -> Change {
        Change::delete("user-1", "todos", "t1", hlc(at))
    }

    fn apply_all(changes: &[&Change]) -> EntityState {
        let mut state: Option<EntityState> = None;
        for change in changes {
            let (next, _) = merge(state.as_ref(), change);
            state = Some(next);
        }
        state.unwrap_or_default()
    }

    #[test]
    fn upsert_on_empty_state() {
        let change = upsert(&[("title", json!("A")), ("done", json!(false))], "100:0:n1");
        let (next, outcome) = merge(None, &change);

        assert_eq!(outcome, MergeOutcome::Saved);
        assert_eq!(next.values["title"], json!("A"));
        assert_eq!(next.values["done"], json!(false));
        assert_eq!(next.tags["title"], hlc("100:0:n1"));
        assert!(!next.deleted);
        assert_eq!(next.deleted_tag, None);
    }

    #[test]
    fn newer_field_wins_older_field_keeps() {
        let first = upsert(&[("title", json!("A")), ("done", json!(false))], "100:0:n1");
        let second = upsert(&[("done", json!(true))], "101:0:n1");

        let (state, _) = merge(None, &first);
        let (state, outcome) = merge(Some(&state), &second);

        assert_eq!(outcome, MergeOutcome::Saved);
        assert_eq!(state.values["title"], json!("A"));
        assert_eq!(state.values["done"], json!(true));
        assert_eq!(state.tags["title"], hlc("100:0:n1"));
        assert_eq!(state.tags["done"], hlc("101:0:n1"));
    }

    #[test]
    fn older_upsert_is_swallowed_per_field() {
        let newer = upsert(&[("title", json!("new"))], "200:0:n1");
        let older = upsert(&[("title", json!("old")), ("done", json!(true))], "150:0:n2");

        let (state, _) = merge(None, &newer);
        let (state, outcome) = merge(Some(&state), &older);

        // the losing field keeps the newer value, the fresh field lands
        assert_eq!(outcome, MergeOutcome::Saved);
        assert_eq!(state.values["title"], json!("new"));
        assert_eq!(state.values["done"], json!(true));
    }

    #[test]
    fn equal_tags_do_not_overwrite() {
        let a = upsert(&[("title", json!("A"))], "100:0:n1");
        let (state, _) = merge(None, &a);
        let (state, outcome) = merge(Some(&state), &a);

        assert_eq!(outcome, MergeOutcome::Noop);
        assert_eq!(state.values["title"], json!("A"));
    }

    #[test]
    fn delete_tombstones_missing_entity() {
        let (state, outcome) = merge(None, &delete("100:0:n1"));

        assert_eq!(outcome, MergeOutcome::Removed);
        assert!(state.deleted);
        assert_eq!(state.deleted_tag, Some(hlc("100:0:n1")));
        assert!(state.values.is_empty());
    }

    #[test]
    fn delete_keeps_values_and_tags_for_future_merges() {
        let (state, _) = merge(None, &upsert(&[("title", json!("A"))], "100:0:n1"));
        let (state, outcome) = merge(Some(&state), &delete("101:0:n2"));

        assert_eq!(outcome, MergeOutcome::Removed);
        assert!(state.deleted);
        assert_eq!(state.values["title"], json!("A"));
        assert_eq!(state.tags["title"], hlc("100:0:n1"));
    }

    #[test]
    fn older_delete_is_swallowed() {
        let (state, _) = merge(None, &upsert(&[("title", json!("A"))], "100:0:n1"));
        let (state, _) = merge(Some(&state), &delete("101:0:n2"));

        // a second, older delete cannot move the tombstone back
        let (state, outcome) = merge(Some(&state), &delete("99:0:n3"));
        assert_eq!(outcome, MergeOutcome::Noop);
        assert_eq!(state.deleted_tag, Some(hlc("101:0:n2")));

        // nor can an equal one
        let (state, outcome) = merge(Some(&state), &delete("101:0:n2"));
        assert_eq!(outcome, MergeOutcome::Noop);
        assert!(state.deleted);
    }

    #[test]
    fn newer_delete_advances_the_tombstone() {
        let (state, _) = merge(None, &delete("100:0:n1"));
        let (state, outcome) = merge(Some(&state), &delete("105:0:n2"));

        assert_eq!(outcome, MergeOutcome::Removed);
        assert_eq!(state.deleted_tag, Some(hlc("105:0:n2")));
    }

    #[test]
    fn upsert_below_tombstone_is_swallowed() {
        let (state, _) = merge(None, &upsert(&[("title", json!("A"))], "100:0:n1"));
        let (state, _) = merge(Some(&state), &delete("101:0:n2"));

        // 100:5 sorts above the field tag but below the tombstone
        let (state, outcome) = merge(Some(&state), &upsert(&[("title", json!("B"))], "100:5:n3"));

        assert_eq!(outcome, MergeOutcome::Noop);
        assert!(state.deleted);
        assert_eq!(state.values["title"], json!("A"));
    }

    #[test]
    fn upsert_above_tombstone_revives() {
        let (state, _) = merge(None, &upsert(&[("title", json!("A"))], "100:0:n1"));
        let (state, _) = merge(Some(&state), &delete("101:0:n2"));
        let (state, outcome) = merge(Some(&state), &upsert(&[("title", json!("B"))], "102:0:n3"));

        assert_eq!(outcome, MergeOutcome::Saved);
        assert!(!state.deleted);
        assert_eq!(state.values["title"], json!("B"));
        // the tombstone tag is retained as history
        assert_eq!(state.deleted_tag, Some(hlc("101:0:n2")));
    }

    #[test]
    fn retained_tombstone_gates_late_deletes_after_revival() {
        let (state, _) = merge(None, &delete("101:0:n2"));
        let (state, _) = merge(Some(&state), &upsert(&[("title", json!("B"))], "102:0:n3"));
        assert!(!state.deleted);

        // a delete older than the retained tombstone tag stays swallowed
        let (state, outcome) = merge(Some(&state), &delete("100:9:n4"));
        assert_eq!(outcome, MergeOutcome::Noop);
        assert!(!state.deleted);

        // a newer one tombstones again
        let (state, outcome) = merge(Some(&state), &delete("103:0:n4"));
        assert_eq!(outcome, MergeOutcome::Removed);
        assert!(state.deleted);
    }

    #[test]
    fn merge_is_idempotent() {
        let changes = [
            upsert(&[("title", json!("A")), ("done", json!(false))], "100:0:n1"),
            delete("101:0:n2"),
            upsert(&[("title", json!("B"))], "102:0:n3"),
        ];

        let mut state: Option<EntityState> = None;
        for change in &changes {
            let (once, _) = merge(state.as_ref(), change);
            let (twice, outcome) = merge(Some(&once), change);
            assert_eq!(once, twice);
            assert_eq!(outcome, MergeOutcome::Noop);
            state = Some(once);
        }
    }

    #[test]
    fn merge_is_commutative_across_arrival_orders() {
        let c1 = upsert(&[("title", json!("A")), ("done", json!(false))], "100:0:n1");
        let c2 = upsert(&[("done", json!(true))], "101:0:n1");
        let c3 = upsert(&[("title", json!("B"))], "100:0:n2");
        let c4 = upsert(&[("priority", json!(2))], "99:0:n3");

        let changes = [&c1, &c2, &c3, &c4];
        let expected = apply_all(&changes);
        assert_eq!(expected.values["title"], json!("B"));
        assert_eq!(expected.values["done"], json!(true));
        assert_eq!(expected.values["priority"], json!(2));

        // all 24 arrival orders converge to the same state
        let permutations = [
            [0usize, 1, 2, 3], [0, 1, 3, 2], [0, 2, 1, 3], [0, 2, 3, 1], [0, 3, 1, 2],
            [0, 3, 2, 1], [1, 0, 2, 3], [1, 0, 3, 2], [1, 2, 0, 3], [1, 2, 3, 0],
            [1, 3, 0, 2], [1, 3, 2, 0], [2, 0, 1, 3], [2, 0, 3, 1], [2, 1, 0, 3],
            [2, 1, 3, 0], [2, 3, 0, 1], [2, 3, 1, 0], [3, 0, 1, 2], [3, 0, 2, 1],
            [3, 1, 0, 2], [3, 1, 2, 0], [3, 2, 0, 1], [3, 2, 1, 0],
        ];

        for order in permutations {
            let reordered: Vec<_> = order.iter().map(|&i| changes[i]).collect();
            assert_eq!(apply_all(&reordered), expected, "order {order:?} diverged");
        }
    }

    #[test]
    fn noop_leaves_state_equal_to_prior() {
        let (state, _) = merge(None, &upsert(&[("title", json!("A"))], "100:0:n1"));
        let (next, outcome) = merge(Some(&state), &upsert(&[("title", json!("B"))], "99:0:n2"));

        assert_eq!(outcome, MergeOutcome::Noop);
        assert_eq!(next, state);
    }
}
