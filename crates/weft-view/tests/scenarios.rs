//! End-to-end dependence scenarios through the public `InstanceView` API.

use std::collections::BTreeSet;
use weft_event::EventTable;
use weft_expr::RowSet;
use weft_types::{
    Coherence, EventId, FieldMask, InstanceId, OperationId, RegionUsage, RequirementIndex,
};
use weft_view::{InstanceView, ViewConfig, ViewKind};

fn fields(indices: &[usize]) -> FieldMask {
    FieldMask::from_indices(indices).expect("valid field indices")
}

fn rows(start: u64, end: u64) -> RowSet {
    RowSet::interval(start, end).expect("valid interval")
}

fn materialized(domain: RowSet) -> InstanceView {
    InstanceView::new(
        InstanceId(1),
        domain,
        ViewKind::Materialized,
        EventTable::new(),
        ViewConfig::default(),
    )
}

#[test]
fn whole_domain_write_blocks_field_overlapping_read() {
    let view = materialized(rows(0, 128));
    let write_done = view.events().create();
    view.add_internal_task_user(
        RegionUsage::read_write(),
        fields(&[0, 1]),
        &rows(0, 128),
        OperationId(1),
        RequirementIndex(0),
        write_done,
    );

    let seen = view.find_copy_preconditions(true, fields(&[0]), &rows(0, 128));
    assert_eq!(seen.into_iter().collect::<Vec<_>>(), vec![write_done]);
}

#[test]
fn disjoint_halves_both_block_whole_domain_read() {
    let view = materialized(rows(0, 100));
    let left_done = view.events().create();
    let right_done = view.events().create();
    let zero = fields(&[0]);
    view.add_internal_task_user(
        RegionUsage::write_only(),
        zero,
        &rows(0, 50),
        OperationId(1),
        RequirementIndex(0),
        left_done,
    );
    view.add_internal_task_user(
        RegionUsage::write_only(),
        zero,
        &rows(50, 100),
        OperationId(2),
        RequirementIndex(0),
        right_done,
    );

    let seen: BTreeSet<EventId> = view.find_copy_preconditions(true, zero, &rows(0, 100));
    assert!(seen.contains(&left_done));
    assert!(seen.contains(&right_done));
    assert_eq!(seen.len(), 2);
}

#[test]
fn superseded_and_triggered_writer_disappears_after_clean() {
    let view = materialized(rows(0, 64));
    let zero = fields(&[0]);
    let first_done = view.events().create();
    let second_done = view.events().create();
    view.register_user(
        RegionUsage::read_write(),
        zero,
        &rows(0, 64),
        OperationId(1),
        RequirementIndex(0),
        first_done,
    );
    // The second writer's own query dominates and supersedes the first.
    view.register_user(
        RegionUsage::read_write(),
        zero,
        &rows(0, 64),
        OperationId(2),
        RequirementIndex(0),
        second_done,
    );

    view.events().trigger(first_done);
    assert!(view.prune());

    let seen = view.find_copy_preconditions(false, zero, &rows(0, 64));
    assert_eq!(seen.into_iter().collect::<Vec<_>>(), vec![second_done]);
}

#[test]
fn simultaneous_readers_share_but_block_writers() {
    let view = materialized(rows(0, 64));
    let zero = fields(&[0]);
    let reader_usage = RegionUsage::read_only().with_coherence(Coherence::Simultaneous);
    let first = view.events().create();
    let second = view.events().create();
    view.add_internal_task_user(
        reader_usage,
        zero,
        &rows(0, 64),
        OperationId(1),
        RequirementIndex(0),
        first,
    );
    view.add_internal_task_user(
        reader_usage,
        zero,
        &rows(0, 64),
        OperationId(2),
        RequirementIndex(0),
        second,
    );

    // A writer conflicts with both simultaneous readers.
    let writer_term = view.events().create();
    let writer_wait = view.register_user(
        RegionUsage::read_write().with_coherence(Coherence::Exclusive),
        zero,
        &rows(0, 64),
        OperationId(3),
        RequirementIndex(0),
        writer_term,
    );
    assert!(!view.events().has_triggered(writer_wait));
    view.events().trigger(first);
    assert!(!view.events().has_triggered(writer_wait));
    view.events().trigger(second);
    assert!(view.events().has_triggered(writer_wait));
}

#[test]
fn simultaneous_readers_do_not_wait_on_each_other() {
    let view = materialized(rows(0, 64));
    let zero = fields(&[0]);
    let reader_usage = RegionUsage::read_only().with_coherence(Coherence::Simultaneous);
    let first = view.events().create();
    let second = view.events().create();
    view.add_internal_task_user(
        reader_usage,
        zero,
        &rows(0, 64),
        OperationId(1),
        RequirementIndex(0),
        first,
    );
    view.add_internal_task_user(
        reader_usage,
        zero,
        &rows(0, 64),
        OperationId(2),
        RequirementIndex(0),
        second,
    );

    let third_term = view.events().create();
    let third_wait = view.register_user(
        reader_usage,
        zero,
        &rows(0, 64),
        OperationId(3),
        RequirementIndex(0),
        third_term,
    );
    assert!(view.events().has_triggered(third_wait));
}

#[test]
fn triggering_event_clears_all_tree_references() {
    let view = materialized(rows(0, 100));
    let done = view.events().create();
    let zero = fields(&[0]);
    // Same event across several nodes of the tree.
    view.add_internal_task_user(
        RegionUsage::read_write(),
        zero,
        &rows(0, 100),
        OperationId(1),
        RequirementIndex(0),
        done,
    );
    view.add_internal_task_user(
        RegionUsage::read_write(),
        zero,
        &rows(0, 30),
        OperationId(1),
        RequirementIndex(1),
        done,
    );
    view.add_internal_copy_user(
        false,
        zero,
        &rows(40, 90),
        OperationId(1),
        RequirementIndex(2),
        done,
    );
    assert!(view.tree().root().references_event(done));

    view.events().trigger(done);
    assert!(!view.tree().root().references_event(done));
    assert_eq!(view.tree().pending_refs().collection_refs(), 0);
    assert!(view
        .find_copy_preconditions(false, zero, &rows(0, 100))
        .is_empty());
}

#[test]
fn repeated_congruent_insertion_stays_single() {
    let view = materialized(rows(0, 64));
    let done = view.events().create();
    let zero = fields(&[0]);
    for index in 0..3_u32 {
        view.add_internal_task_user(
            RegionUsage::read_write(),
            zero,
            &rows(0, 16),
            OperationId(1),
            RequirementIndex(index),
            done,
        );
    }
    // One event entry for the subset node plus none elsewhere; a query sees
    // exactly one precondition.
    let seen = view.find_copy_preconditions(false, zero, &rows(0, 16));
    assert_eq!(seen.len(), 1);
    assert_eq!(view.tree().registered_events(), 1);
    assert_eq!(view.tree().pending_refs().collection_refs(), 1);
}

#[test]
fn partial_copy_records_remainder_at_parent() {
    let view = materialized(rows(0, 100));
    let zero = fields(&[0]);
    let task_done = view.events().create();
    view.add_internal_task_user(
        RegionUsage::read_write(),
        zero,
        &rows(0, 50),
        OperationId(1),
        RequirementIndex(0),
        task_done,
    );

    // Rows 60..90 match no tracked domain and no child covers them: the
    // copy lands at the root as an inexact record.
    let copy_done = view.events().create();
    view.add_internal_copy_user(
        false,
        zero,
        &rows(60, 90),
        OperationId(2),
        RequirementIndex(0),
        copy_done,
    );
    assert_eq!(view.tree().root().current_fields_for(copy_done), zero);

    // Rows 10..40 are covered by the 0..50 child: recorded below the root.
    let covered_done = view.events().create();
    view.add_internal_copy_user(
        false,
        zero,
        &rows(10, 40),
        OperationId(3),
        RequirementIndex(0),
        covered_done,
    );
    assert_eq!(
        view.tree().root().current_fields_for(covered_done),
        FieldMask::EMPTY
    );

    // Both are still found by a whole-domain query.
    let seen = view.find_copy_preconditions(false, zero, &rows(0, 100));
    assert!(seen.contains(&copy_done));
    assert!(seen.contains(&covered_done));
}

#[test]
fn merged_precondition_of_nothing_is_already_triggered() {
    let view = materialized(rows(0, 64));
    let term = view.events().create();
    let wait = view.register_user(
        RegionUsage::read_write(),
        fields(&[3]),
        &rows(0, 64),
        OperationId(1),
        RequirementIndex(0),
        term,
    );
    assert!(view.events().has_triggered(wait));
}

#[test]
fn register_user_never_waits_on_its_own_term_event() {
    let view = materialized(rows(0, 64));
    let zero = fields(&[0]);
    let term = view.events().create();
    view.add_internal_task_user(
        RegionUsage::read_write(),
        zero,
        &rows(0, 64),
        OperationId(1),
        RequirementIndex(0),
        term,
    );
    // Same op registering a second requirement under the same term event.
    let wait = view.register_user(
        RegionUsage::read_write(),
        zero,
        &rows(0, 64),
        OperationId(2),
        RequirementIndex(1),
        term,
    );
    assert!(view.events().has_triggered(wait));
}

#[test]
fn prune_survives_live_records_and_drops_dead_ones() {
    let view = materialized(rows(0, 100));
    let zero = fields(&[0]);
    let live = view.events().create();
    let dead = view.events().create();
    view.add_internal_task_user(
        RegionUsage::read_write(),
        zero,
        &rows(0, 40),
        OperationId(1),
        RequirementIndex(0),
        live,
    );
    view.add_internal_task_user(
        RegionUsage::read_write(),
        zero,
        &rows(60, 100),
        OperationId(2),
        RequirementIndex(0),
        dead,
    );
    view.events().trigger(dead);
    assert!(view.prune());

    let seen = view.find_copy_preconditions(false, zero, &rows(0, 100));
    assert_eq!(seen.into_iter().collect::<Vec<_>>(), vec![live]);

    // The pruned subtree can be repopulated afterwards.
    let reborn = view.events().create();
    view.add_internal_task_user(
        RegionUsage::read_write(),
        zero,
        &rows(60, 100),
        OperationId(3),
        RequirementIndex(0),
        reborn,
    );
    let seen = view.find_copy_preconditions(false, zero, &rows(60, 100));
    assert!(seen.contains(&reborn));
}
