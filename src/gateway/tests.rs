//! Gateway Integration Tests
//!
//! Engines run against a shared in-memory remote store.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;

use super::{Notice, Organizer};
use crate::config::EngineConfig;
use crate::domain::{
    Action, FieldDef, FieldType, GroupDraft, GroupId, GroupPatch, ItemCandidate, ItemId, PermissionSet, Visibility,
};
use crate::error::{OrganizerError, ValidationError};
use crate::repository::{MemoryRemote, RemoteOp};
use crate::tree::find_node;

const PROJECT: &str = "p1";
const ALICE: &str = "alice@site";
const BOB: &str = "bob@site";

type Engine = (Organizer<MemoryRemote>, UnboundedReceiver<Notice>);

async fn setup(remote: &Arc<MemoryRemote>, principal: &str) -> Engine {
    setup_with(remote, EngineConfig::new(PROJECT, principal)).await
}

async fn setup_with(remote: &Arc<MemoryRemote>, config: EngineConfig) -> Engine {
    let (mut organizer, notices) = Organizer::new(remote.clone(), config);
    organizer.load().await.expect("Failed to load");
    (organizer, notices)
}

fn candidates(refs: &[&str]) -> Vec<ItemCandidate> {
    refs.iter().map(|r| ItemCandidate::new(*r)).collect()
}

fn elements(organizer: &Organizer<MemoryRemote>, group: GroupId) -> Vec<String> {
    organizer
        .store()
        .items_of(group)
        .iter()
        .map(|i| i.element_ref.clone())
        .collect()
}

fn item_ids(organizer: &Organizer<MemoryRemote>, group: GroupId) -> Vec<ItemId> {
    organizer.store().items_of(group).iter().map(|i| i.id).collect()
}

fn drain(notices: &mut UnboundedReceiver<Notice>) -> Vec<Notice> {
    let mut seen = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        seen.push(notice);
    }
    seen
}

fn status_field() -> FieldDef {
    FieldDef::new("status", "Status", FieldType::Select).with_options(["open", "done"])
}

// ========================
// Items
// ========================

#[tokio::test]
async fn test_moved_item_weight_rolls_up() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut org, _notices) = setup(&remote, ALICE).await;

    let a = org.create_group(GroupDraft::named("A")).await.unwrap();
    let outcome = org
        .add_items(a, vec![ItemCandidate::new("X").with_weight(10.0)])
        .await
        .unwrap();
    let b = org.create_group(GroupDraft::named("B").under(a)).await.unwrap();
    org.move_items(&outcome.added, b).await.unwrap();

    let forest = org.forest();
    let a_node = find_node(&forest, a).unwrap();
    let b_node = find_node(&forest, b).unwrap();
    assert_eq!(a_node.total_weight, 10.0);
    assert_eq!(a_node.direct_item_count, 0);
    assert_eq!(b_node.total_weight, 10.0);
}

#[tokio::test]
async fn test_remove_then_undo_restores_items_in_order() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut org, _notices) = setup(&remote, ALICE).await;

    let g = org.create_group(GroupDraft::named("G")).await.unwrap();
    org.add_items(g, candidates(&["E1", "E2", "E3", "E4", "E5"])).await.unwrap();
    let before = org.store().items_of(g).to_vec();

    let doomed = [before[0].id, before[2].id, before[4].id];
    let removed = org.remove_items(&doomed).await.unwrap();
    assert_eq!(removed, 3);
    assert_eq!(elements(&org, g), vec!["E2", "E4"]);

    assert_eq!(org.undo().await.unwrap(), "remove items");
    assert_eq!(org.store().items_of(g), before.as_slice());
    assert_eq!(remote.items().await.len(), 5);
}

#[tokio::test]
async fn test_second_client_skips_element_already_added_remotely() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut alice, _a) = setup(&remote, ALICE).await;
    let scope = alice.create_group(GroupDraft::named("Unique").unique()).await.unwrap();

    // Bob loads before Alice adds and never processes her notification
    let (mut bob, _b) = setup(&remote, BOB).await;
    alice.add_items(scope, candidates(&["E1"])).await.unwrap();

    let outcome = bob.add_items(scope, candidates(&["E1", "E2"])).await.unwrap();
    assert_eq!(outcome.skipped, 1);
    assert_eq!(outcome.added.len(), 1);
    assert_eq!(elements(&bob, scope), vec!["E2"]);

    let stored: Vec<String> = remote.items().await.into_iter().map(|i| i.element_ref).collect();
    assert_eq!(stored.iter().filter(|e| *e == "E1").count(), 1);
}

#[tokio::test]
async fn test_add_skips_elements_already_in_scope() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut org, _notices) = setup(&remote, ALICE).await;

    let root = org.create_group(GroupDraft::named("Root").unique()).await.unwrap();
    let left = org.create_group(GroupDraft::named("Left").under(root)).await.unwrap();
    let right = org.create_group(GroupDraft::named("Right").under(root)).await.unwrap();
    org.add_items(left, candidates(&["E1"])).await.unwrap();

    let outcome = org.add_items(right, candidates(&["E1", "E2", "E2"])).await.unwrap();
    assert_eq!(outcome.skipped, 2);
    assert_eq!(elements(&org, right), vec!["E2"]);
}

#[tokio::test]
async fn test_same_element_twice_without_uniqueness() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut org, _notices) = setup(&remote, ALICE).await;
    let g = org.create_group(GroupDraft::named("Loose")).await.unwrap();
    org.add_items(g, candidates(&["E1"])).await.unwrap();

    let outcome = org.add_items(g, candidates(&["E1"])).await.unwrap();
    assert_eq!(outcome.skipped, 0);
    assert_eq!(outcome.added.len(), 1);
    assert_eq!(elements(&org, g), vec!["E1", "E1"]);
    assert_eq!(remote.items().await.len(), 2);
}

#[tokio::test]
async fn test_move_items_rejects_duplicate_in_target_scope() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut org, _notices) = setup(&remote, ALICE).await;

    let unique = org.create_group(GroupDraft::named("U").unique()).await.unwrap();
    let child = org.create_group(GroupDraft::named("C").under(unique)).await.unwrap();
    let loose = org.create_group(GroupDraft::named("V")).await.unwrap();
    org.add_items(child, candidates(&["E1"])).await.unwrap();
    let stray = org.add_items(loose, candidates(&["E1"])).await.unwrap();

    let err = org.move_items(&stray.added, unique).await.unwrap_err();
    assert!(matches!(
        err,
        OrganizerError::Validation(ValidationError::UniquenessConflict { ref element }) if element == "E1"
    ));
    assert_eq!(elements(&org, loose), vec!["E1"]);
}

#[tokio::test]
async fn test_move_items_undo_returns_to_source() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut org, _notices) = setup(&remote, ALICE).await;

    let from = org.create_group(GroupDraft::named("From")).await.unwrap();
    let to = org.create_group(GroupDraft::named("To")).await.unwrap();
    org.add_items(from, candidates(&["E1", "E2", "E3"])).await.unwrap();
    let before = item_ids(&org, from);

    org.move_items(&[before[1]], to).await.unwrap();
    assert_eq!(elements(&org, from), vec!["E1", "E3"]);
    assert_eq!(elements(&org, to), vec!["E2"]);

    org.undo().await.unwrap();
    assert_eq!(item_ids(&org, from), before);
    assert!(org.store().items_of(to).is_empty());
}

// ========================
// Remote failures
// ========================

#[tokio::test]
async fn test_rejected_write_rolls_back() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut org, mut notices) = setup(&remote, ALICE).await;
    let g = org.create_group(GroupDraft::named("G")).await.unwrap();
    let depth = org.undo_depth();
    drain(&mut notices);

    remote.fail_next(RemoteOp::Insert).await;
    let err = org.add_items(g, candidates(&["E1", "E2"])).await.unwrap_err();

    assert!(matches!(err, OrganizerError::RemoteWrite(_)));
    assert!(org.store().items_of(g).is_empty());
    assert_eq!(org.undo_depth(), depth);
    assert_eq!(org.pending_echoes(), 0);
    assert!(matches!(
        drain(&mut notices).as_slice(),
        [Notice::RolledBack { operation: "add items", .. }]
    ));
}

#[tokio::test]
async fn test_partial_batch_keeps_confirmed_chunks() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut org, mut notices) = setup_with(&remote, EngineConfig::new(PROJECT, ALICE).with_batch_size(2)).await;
    let g = org.create_group(GroupDraft::named("G")).await.unwrap();
    drain(&mut notices);

    remote.fail_after(RemoteOp::Insert, 1).await;
    let err = org.add_items(g, candidates(&["E1", "E2", "E3", "E4", "E5"])).await.unwrap_err();

    assert!(matches!(err, OrganizerError::PartialBatch { confirmed: 2, failed: 3, .. }));
    assert_eq!(elements(&org, g), vec!["E1", "E2"]);
    assert_eq!(remote.items().await.len(), 2);

    let seen = drain(&mut notices);
    assert_eq!(
        seen[0],
        Notice::Progress {
            operation: "add items",
            done: 2,
            total: 5
        }
    );
    assert!(matches!(seen[1], Notice::RolledBack { .. }));

    // The confirmed part is undoable
    org.undo().await.unwrap();
    assert!(org.store().items_of(g).is_empty());
    assert!(remote.items().await.is_empty());
}

#[tokio::test]
async fn test_large_batch_reports_progress_per_chunk() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut org, mut notices) = setup_with(&remote, EngineConfig::new(PROJECT, ALICE).with_batch_size(2)).await;
    let g = org.create_group(GroupDraft::named("G")).await.unwrap();
    drain(&mut notices);

    org.add_items(g, candidates(&["E1", "E2", "E3", "E4", "E5"])).await.unwrap();

    let done: Vec<usize> = drain(&mut notices)
        .into_iter()
        .filter_map(|n| match n {
            Notice::Progress { done, total: 5, .. } => Some(done),
            _ => None,
        })
        .collect();
    assert_eq!(done, vec![2, 4, 5]);
    assert_eq!(remote.calls(RemoteOp::Insert).await, 4);
}

#[tokio::test]
async fn test_failed_undo_is_pushed_back() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut org, _notices) = setup(&remote, ALICE).await;
    let g = org.create_group(GroupDraft::named("G")).await.unwrap();
    org.add_items(g, candidates(&["E1"])).await.unwrap();

    remote.fail_next(RemoteOp::Delete).await;
    let err = org.undo().await.unwrap_err();
    assert!(matches!(err, OrganizerError::RemoteWrite(_)));
    assert_eq!(elements(&org, g), vec!["E1"]);
    assert_eq!(org.next_undo(), Some("add items"));

    org.undo().await.unwrap();
    assert!(org.store().items_of(g).is_empty());
}

#[tokio::test]
async fn test_optimistic_apply_is_visible_before_the_write_lands() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut org, _notices) = setup(&remote, ALICE).await;
    let g = org.create_group(GroupDraft::named("G")).await.unwrap();

    let mut forest = org.watch_forest();
    remote.hold_writes().await;

    let (result, seen) = tokio::join!(org.add_items(g, candidates(&["E1"])), async {
        forest.changed().await.unwrap();
        let shown = forest.borrow().first().map(|node| node.item_count);
        let stored = remote.items().await.len();
        remote.release_writes().await;
        (shown, stored)
    });

    result.unwrap();
    assert_eq!(seen, (Some(1), 0));
    assert_eq!(remote.items().await.len(), 1);
}

#[tokio::test]
async fn test_regenerated_ids_are_adopted() {
    let remote = Arc::new(MemoryRemote::new());
    remote.set_regenerate_ids(true).await;
    let (mut org, _notices) = setup(&remote, ALICE).await;

    let g = org.create_group(GroupDraft::named("G")).await.unwrap();
    assert!(remote.groups().await.iter().any(|row| row.id == g));

    let outcome = org.add_items(g, candidates(&["E1", "E2"])).await.unwrap();
    let mut local = item_ids(&org, g);
    let mut stored: Vec<ItemId> = remote.items().await.into_iter().map(|i| i.id).collect();
    local.sort();
    stored.sort();
    assert_eq!(local, stored);
    assert_eq!(outcome.added.len(), 2);

    org.undo().await.unwrap();
    assert!(remote.items().await.is_empty());
}

// ========================
// Groups
// ========================

#[tokio::test]
async fn test_cyclic_move_is_rejected_without_change() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut org, _notices) = setup(&remote, ALICE).await;

    let a = org.create_group(GroupDraft::named("A")).await.unwrap();
    let b = org.create_group(GroupDraft::named("B").under(a)).await.unwrap();
    let c = org.create_group(GroupDraft::named("C").under(b)).await.unwrap();
    let revision = org.store().revision();
    let forest = org.forest();

    let err = org.move_group(a, Some(c)).await.unwrap_err();
    assert!(matches!(err, OrganizerError::Validation(ValidationError::CyclicMove)));
    let err = org.move_group(a, Some(a)).await.unwrap_err();
    assert!(matches!(err, OrganizerError::Validation(ValidationError::CyclicMove)));

    assert_eq!(org.store().revision(), revision);
    assert_eq!(org.forest(), forest);
}

#[tokio::test]
async fn test_depth_limit() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut org, _notices) = setup(&remote, ALICE).await;

    let a = org.create_group(GroupDraft::named("A")).await.unwrap();
    let b = org.create_group(GroupDraft::named("B").under(a)).await.unwrap();
    let c = org.create_group(GroupDraft::named("C").under(b)).await.unwrap();

    let err = org.create_group(GroupDraft::named("D").under(c)).await.unwrap_err();
    assert!(matches!(
        err,
        OrganizerError::Validation(ValidationError::DepthExceeded { depth: 3, max: 2 })
    ));

    // A two-level tree cannot go below a level-1 group
    let d = org.create_group(GroupDraft::named("D")).await.unwrap();
    org.create_group(GroupDraft::named("E").under(d)).await.unwrap();
    let err = org.move_group(d, Some(b)).await.unwrap_err();
    assert!(matches!(
        err,
        OrganizerError::Validation(ValidationError::DepthExceeded { depth: 3, .. })
    ));
}

#[tokio::test]
async fn test_move_group_recomputes_levels_and_undoes() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut org, _notices) = setup(&remote, ALICE).await;

    let a = org.create_group(GroupDraft::named("A")).await.unwrap();
    let d = org.create_group(GroupDraft::named("D")).await.unwrap();
    let e = org.create_group(GroupDraft::named("E").under(d)).await.unwrap();

    org.move_group(d, Some(a)).await.unwrap();
    let level = |org: &Organizer<MemoryRemote>, id| org.store().group(id).map(|g| g.level);
    assert_eq!(level(&org, d), Some(1));
    assert_eq!(level(&org, e), Some(2));
    assert_eq!(org.store().group(d).and_then(|g| g.parent_id), Some(a));

    assert_eq!(org.undo().await.unwrap(), "update group");
    assert_eq!(level(&org, d), Some(0));
    assert_eq!(level(&org, e), Some(1));
    assert_eq!(org.store().group(d).and_then(|g| g.parent_id), None);

    let stored = remote.groups().await;
    assert!(stored.iter().any(|g| g.id == e && g.level == 1));
}

#[tokio::test]
async fn test_child_groups_cannot_define_fields() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut org, _notices) = setup(&remote, ALICE).await;
    let root = org.create_group(GroupDraft::named("Root")).await.unwrap();

    let draft = GroupDraft::named("Child").under(root).with_fields(vec![status_field()]);
    let err = org.create_group(draft).await.unwrap_err();
    assert!(matches!(err, OrganizerError::Validation(ValidationError::SchemaNotInheritable)));
}

#[tokio::test]
async fn test_update_group_undo_restores_previous_row() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut org, _notices) = setup(&remote, ALICE).await;
    let g = org.create_group(GroupDraft::named("Before")).await.unwrap();

    org.update_group(g, GroupPatch::rename("After")).await.unwrap();
    assert_eq!(org.store().group(g).map(|g| g.name.as_str()), Some("After"));

    org.undo().await.unwrap();
    assert_eq!(org.store().group(g).map(|g| g.name.as_str()), Some("Before"));
    assert!(remote.groups().await.iter().any(|row| row.name == "Before"));
}

#[tokio::test]
async fn test_update_group_undo_keeps_later_lock() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut org, _notices) = setup(&remote, ALICE).await;
    let g = org.create_group(GroupDraft::named("Before")).await.unwrap();

    org.update_group(g, GroupPatch::rename("After")).await.unwrap();
    org.set_lock(g, true).await.unwrap();

    assert_eq!(org.undo().await.unwrap(), "update group");
    let row = org.store().group(g).unwrap();
    assert_eq!(row.name, "Before");
    assert_eq!(row.lock.as_ref().map(|l| l.locked_by.as_str()), Some(ALICE));

    let stored = remote.groups().await;
    let stored = stored.iter().find(|row| row.id == g).unwrap();
    assert_eq!(stored.name, "Before");
    assert!(stored.lock.is_some());
}

#[tokio::test]
async fn test_clone_group_picks_next_free_name() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut org, _notices) = setup(&remote, ALICE).await;
    let bay = org.create_group(GroupDraft::named("Bay").unique()).await.unwrap();
    org.add_items(bay, candidates(&["E1"])).await.unwrap();

    let first = org.clone_group(bay).await.unwrap();
    let second = org.clone_group(bay).await.unwrap();
    let name = |id| org.store().group(id).map(|g| g.name.clone());
    assert_eq!(name(first).as_deref(), Some("Bay (1)"));
    assert_eq!(name(second).as_deref(), Some("Bay (2)"));
    assert_eq!(org.store().group(first).map(|g| g.unique_elements), Some(true));
    assert!(org.store().items_of(first).is_empty());

    assert_eq!(org.undo().await.unwrap(), "clone group");
    assert!(org.store().group(second).is_none());
}

#[tokio::test]
async fn test_delete_group_undo_restores_subtree() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut org, _notices) = setup(&remote, ALICE).await;

    let a = org.create_group(GroupDraft::named("A")).await.unwrap();
    let b = org.create_group(GroupDraft::named("B").under(a)).await.unwrap();
    org.add_items(a, candidates(&["E1"])).await.unwrap();
    org.add_items(b, candidates(&["E2", "E3"])).await.unwrap();

    org.delete_group(a).await.unwrap();
    assert_eq!(org.store().group_count(), 0);
    assert!(remote.items().await.is_empty());

    org.undo().await.unwrap();
    assert_eq!(org.store().group(b).and_then(|g| g.parent_id), Some(a));
    assert_eq!(elements(&org, a), vec!["E1"]);
    assert_eq!(elements(&org, b), vec!["E2", "E3"]);
    assert_eq!(remote.groups().await.len(), 2);
    assert_eq!(remote.items().await.len(), 3);
}

#[tokio::test]
async fn test_delete_group_undo_with_regenerated_ids() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut org, _notices) = setup(&remote, ALICE).await;

    let a = org.create_group(GroupDraft::named("A")).await.unwrap();
    let b = org.create_group(GroupDraft::named("B").under(a)).await.unwrap();
    org.add_items(b, candidates(&["E1"])).await.unwrap();
    org.delete_group(a).await.unwrap();

    remote.set_regenerate_ids(true).await;
    org.undo().await.unwrap();

    let forest = org.forest();
    assert_eq!(forest.len(), 1);
    let root = &forest[0];
    assert_eq!(root.group.name, "A");
    assert_ne!(root.group.id, a);
    assert_eq!(root.children[0].group.name, "B");
    assert_eq!(root.children[0].group.parent_id, Some(root.group.id));
    assert_eq!(root.item_count, 1);
}

// ========================
// Locks and permissions
// ========================

#[tokio::test]
async fn test_lock_blocks_other_principals() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut alice, _a) = setup(&remote, ALICE).await;
    let a = alice.create_group(GroupDraft::named("A")).await.unwrap();
    let b = alice.create_group(GroupDraft::named("B").under(a)).await.unwrap();
    let patch = GroupPatch {
        default_permissions: Some(PermissionSet {
            add_items: true,
            ..PermissionSet::read_only()
        }),
        ..Default::default()
    };
    alice.update_group(a, patch).await.unwrap();
    alice.set_lock(a, true).await.unwrap();

    let (mut bob, _b) = setup(&remote, BOB).await;

    // The lock on the ancestor covers the child
    let err = bob.add_items(b, candidates(&["E1"])).await.unwrap_err();
    assert!(matches!(
        err,
        OrganizerError::Validation(ValidationError::Locked { group, ref by }) if group == a && by == ALICE
    ));

    let err = bob.set_lock(a, false).await.unwrap_err();
    assert!(matches!(
        err,
        OrganizerError::Validation(ValidationError::PermissionDenied { action: Action::ManageGroup, .. })
    ));

    // The locker may keep working and unlock
    alice.add_items(b, candidates(&["E1"])).await.unwrap();
    alice.set_lock(a, false).await.unwrap();
    assert!(alice.store().group(a).map_or(false, |g| g.lock.is_none()));
}

#[tokio::test]
async fn test_read_only_collaborator_cannot_add() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut alice, _a) = setup(&remote, ALICE).await;
    let g = alice
        .create_group(GroupDraft {
            default_permissions: PermissionSet::read_only(),
            ..GroupDraft::named("G")
        })
        .await
        .unwrap();

    let (mut bob, _b) = setup(&remote, BOB).await;
    let err = bob.add_items(g, candidates(&["E1"])).await.unwrap_err();
    assert!(matches!(
        err,
        OrganizerError::Validation(ValidationError::PermissionDenied { ref principal, .. }) if principal == BOB
    ));
    assert!(remote.items().await.is_empty());
}

#[tokio::test]
async fn test_private_trees_are_not_loaded_for_others() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut alice, _a) = setup(&remote, ALICE).await;
    let mine = alice
        .create_group(GroupDraft {
            visibility: Visibility::Private,
            ..GroupDraft::named("Mine")
        })
        .await
        .unwrap();
    alice.create_group(GroupDraft::named("Inner").under(mine)).await.unwrap();
    alice.create_group(GroupDraft::named("Shared")).await.unwrap();

    let (bob, _b) = setup(&remote, BOB).await;
    assert_eq!(bob.store().group_count(), 1);

    let (alice_again, _c) = setup(&remote, ALICE).await;
    assert_eq!(alice_again.store().group_count(), 3);
}

// ========================
// Custom fields
// ========================

#[tokio::test]
async fn test_bulk_edit_requires_confirmation_to_overwrite() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut org, _notices) = setup(&remote, ALICE).await;
    let root = org
        .create_group(GroupDraft::named("Root").with_fields(vec![status_field()]))
        .await
        .unwrap();
    let child = org.create_group(GroupDraft::named("Child").under(root)).await.unwrap();
    let added = org.add_items(child, candidates(&["E1", "E2"])).await.unwrap().added;
    org.update_item_field(added[0], "status", json!("open")).await.unwrap();

    let fields = BTreeMap::from([("status".to_string(), json!("done"))]);
    let err = org.bulk_edit_fields(&added, fields.clone(), false).await.unwrap_err();
    match err {
        OrganizerError::Validation(ValidationError::ConfirmationRequired { conflicts }) => {
            assert_eq!(conflicts, vec![added[0]]);
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(org.bulk_edit_fields(&added, fields, true).await.unwrap(), 2);
    let status = |org: &Organizer<MemoryRemote>, id| org.store().item(id).and_then(|i| i.property("status").cloned());
    assert_eq!(status(&org, added[1]), Some(json!("done")));

    org.undo().await.unwrap();
    assert_eq!(status(&org, added[0]), Some(json!("open")));
    assert_eq!(status(&org, added[1]), None);
}

#[tokio::test]
async fn test_field_values_are_type_checked() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut org, _notices) = setup(&remote, ALICE).await;
    let checked = FieldDef::new("checked", "Checked", FieldType::Checkbox).required();
    let root = org
        .create_group(GroupDraft::named("Root").with_fields(vec![status_field(), checked]))
        .await
        .unwrap();
    let item = org.add_items(root, candidates(&["E1"])).await.unwrap().added[0];

    let bad_option = org.update_item_field(item, "status", json!("lost")).await;
    let unknown = org.update_item_field(item, "colour", json!("red")).await;
    let cleared = org.update_item_field(item, "checked", json!(null)).await;
    for result in [bad_option, unknown, cleared] {
        assert!(matches!(
            result,
            Err(OrganizerError::Validation(ValidationError::InvalidInput(_)))
        ));
    }

    org.update_item_field(item, "checked", json!(true)).await.unwrap();
    assert_eq!(org.store().item(item).and_then(|i| i.property("checked").cloned()), Some(json!(true)));
}

// ========================
// Undo stack
// ========================

#[tokio::test]
async fn test_nothing_to_undo() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut org, _notices) = setup(&remote, ALICE).await;
    assert!(matches!(org.undo().await, Err(OrganizerError::NothingToUndo)));
}

#[tokio::test]
async fn test_undo_capacity_evicts_oldest() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut org, _notices) = setup_with(&remote, EngineConfig::new(PROJECT, ALICE).with_undo_capacity(3)).await;

    let mut ids = Vec::new();
    for name in ["G0", "G1", "G2", "G3", "G4"] {
        ids.push(org.create_group(GroupDraft::named(name)).await.unwrap());
    }
    assert_eq!(org.undo_depth(), 3);

    for _ in 0..3 {
        org.undo().await.unwrap();
    }
    assert!(matches!(org.undo().await, Err(OrganizerError::NothingToUndo)));
    assert!(org.store().group(ids[0]).is_some());
    assert!(org.store().group(ids[1]).is_some());
    assert!(org.store().group(ids[2]).is_none());
}

#[tokio::test]
async fn test_undo_does_not_record_itself() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut org, _notices) = setup(&remote, ALICE).await;
    let g = org.create_group(GroupDraft::named("G")).await.unwrap();
    org.add_items(g, candidates(&["E1"])).await.unwrap();
    assert_eq!(org.undo_depth(), 2);

    org.undo().await.unwrap();
    assert_eq!(org.undo_depth(), 1);
    assert_eq!(org.next_undo(), Some("create group"));
}

// ========================
// Undo after remote changes
// ========================

#[tokio::test]
async fn test_update_group_undo_keeps_other_clients_edits() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut alice, _a) = setup(&remote, ALICE).await;
    let g = alice.create_group(GroupDraft::named("Walls")).await.unwrap();
    alice.update_group(g, GroupPatch::rename("Slabs")).await.unwrap();

    let (mut bob, _b) = setup(&remote, BOB).await;
    let patch = GroupPatch {
        description: Some(Some("level 2 only".to_string())),
        ..Default::default()
    };
    bob.update_group(g, patch).await.unwrap();

    alice.process_pending().await;
    alice.undo().await.unwrap();

    let row = alice.store().group(g).unwrap();
    assert_eq!(row.name, "Walls");
    assert_eq!(row.description.as_deref(), Some("level 2 only"));
    let stored = remote.groups().await;
    assert!(stored
        .iter()
        .any(|row| row.name == "Walls" && row.description.as_deref() == Some("level 2 only")));
}

#[tokio::test]
async fn test_remove_undo_skips_element_placed_elsewhere_in_scope() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut alice, _a) = setup(&remote, ALICE).await;
    let scope = alice.create_group(GroupDraft::named("U").unique()).await.unwrap();
    let left = alice.create_group(GroupDraft::named("L").under(scope)).await.unwrap();
    let right = alice.create_group(GroupDraft::named("R").under(scope)).await.unwrap();
    let added = alice.add_items(left, candidates(&["E1", "E2"])).await.unwrap();
    alice.remove_items(&added.added).await.unwrap();

    let (mut bob, _b) = setup(&remote, BOB).await;
    bob.add_items(right, candidates(&["E1"])).await.unwrap();

    alice.process_pending().await;
    assert_eq!(alice.undo().await.unwrap(), "remove items");
    assert_eq!(elements(&alice, left), vec!["E2"]);
    assert_eq!(elements(&alice, right), vec!["E1"]);

    let stored: Vec<String> = remote.items().await.into_iter().map(|i| i.element_ref).collect();
    assert_eq!(stored.iter().filter(|e| *e == "E1").count(), 1);
    assert_eq!(stored.len(), 2);
}

#[tokio::test]
async fn test_remove_undo_checks_remote_before_notification_arrives() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut alice, _a) = setup(&remote, ALICE).await;
    let scope = alice.create_group(GroupDraft::named("U").unique()).await.unwrap();
    let left = alice.create_group(GroupDraft::named("L").under(scope)).await.unwrap();
    let right = alice.create_group(GroupDraft::named("R").under(scope)).await.unwrap();
    let added = alice.add_items(left, candidates(&["E1"])).await.unwrap();
    alice.remove_items(&added.added).await.unwrap();

    let (mut bob, _b) = setup(&remote, BOB).await;
    bob.add_items(right, candidates(&["E1"])).await.unwrap();

    // Alice has not seen Bob's add yet
    alice.undo().await.unwrap();
    assert!(alice.store().items_of(left).is_empty());
    assert_eq!(remote.items().await.len(), 1);
}

#[tokio::test]
async fn test_move_items_undo_leaves_item_when_scope_already_has_element() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut alice, _a) = setup(&remote, ALICE).await;
    let scope = alice.create_group(GroupDraft::named("U").unique()).await.unwrap();
    let left = alice.create_group(GroupDraft::named("L").under(scope)).await.unwrap();
    let right = alice.create_group(GroupDraft::named("R").under(scope)).await.unwrap();
    let outside = alice.create_group(GroupDraft::named("V")).await.unwrap();
    let added = alice.add_items(left, candidates(&["E1"])).await.unwrap();
    alice.move_items(&added.added, outside).await.unwrap();

    let (mut bob, _b) = setup(&remote, BOB).await;
    bob.add_items(right, candidates(&["E1"])).await.unwrap();

    alice.process_pending().await;
    assert_eq!(alice.undo().await.unwrap(), "move items");
    assert_eq!(elements(&alice, outside), vec!["E1"]);
    assert!(alice.store().items_of(left).is_empty());
    assert_eq!(alice.store().subtree_element_refs(scope), vec!["E1"]);
}

#[tokio::test]
async fn test_move_group_undo_rejects_depth_grown_by_other_client() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut alice, _a) = setup(&remote, ALICE).await;
    let a = alice.create_group(GroupDraft::named("A")).await.unwrap();
    let b = alice.create_group(GroupDraft::named("B").under(a)).await.unwrap();
    alice.move_group(b, None).await.unwrap();

    let (mut bob, _b) = setup(&remote, BOB).await;
    let c = bob.create_group(GroupDraft::named("C").under(b)).await.unwrap();
    let d = bob.create_group(GroupDraft::named("D").under(c)).await.unwrap();

    alice.process_pending().await;
    let err = alice.undo().await.unwrap_err();
    assert!(matches!(
        err,
        OrganizerError::Validation(ValidationError::DepthExceeded { depth: 3, max: 2 })
    ));

    // Nothing moved and the entry is gone
    let level = |id| alice.store().group(id).map(|g| (g.parent_id, g.level));
    assert_eq!(level(b), Some((None, 0)));
    assert_eq!(level(c), Some((Some(b), 1)));
    assert_eq!(level(d), Some((Some(c), 2)));
    assert_eq!(alice.next_undo(), Some("create group"));
}

#[tokio::test]
async fn test_move_group_undo_recomputes_levels_of_new_children() {
    let remote = Arc::new(MemoryRemote::new());
    let (mut alice, _a) = setup(&remote, ALICE).await;
    let a = alice.create_group(GroupDraft::named("A")).await.unwrap();
    let b = alice.create_group(GroupDraft::named("B").under(a)).await.unwrap();
    alice.move_group(b, None).await.unwrap();

    let (mut bob, _b) = setup(&remote, BOB).await;
    let c = bob.create_group(GroupDraft::named("C").under(b)).await.unwrap();

    alice.process_pending().await;
    assert_eq!(alice.undo().await.unwrap(), "update group");

    let row = alice.store().group(b).unwrap();
    assert_eq!((row.parent_id, row.level), (Some(a), 1));
    assert_eq!(alice.store().group(c).map(|g| g.level), Some(2));
    let stored = remote.groups().await;
    assert!(stored.iter().any(|g| g.id == c && g.level == 2));
}
