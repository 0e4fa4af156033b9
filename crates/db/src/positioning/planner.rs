//! Pure index planning.
//!
//! Each function takes the current state of the collection(s) involved and
//! returns the minimal [`DeltaSet`] that keeps them dense after the change.
//! Only rows whose index or parent actually changes are listed.

use uuid::Uuid;

use super::{DeltaSet, IndexDelta, PlanError, PositionedCollection};

fn check_range(index: i64, max: i64) -> Result<(), PlanError> {
    if index < 0 || index > max {
        return Err(PlanError::InvalidIndex { index, max });
    }
    Ok(())
}

fn check_at(collection: &PositionedCollection, entity_id: Uuid, at: i64) -> Result<(), PlanError> {
    match collection.entity_at(at) {
        Some(found) if found == entity_id => Ok(()),
        _ if collection.contains(entity_id) => Err(PlanError::StalePosition {
            entity_id,
            index: at,
        }),
        _ => Err(PlanError::UnknownEntity(entity_id)),
    }
}

/// Resolve a requested destination index against the live destination count.
///
/// Valid requests are `0..=dest_count`. Within one collection the entity is
/// already counted, so `to == dest_count` is the explicit "move to the end"
/// request and lands on the last slot. Nothing is ever clamped.
pub fn resolve_target(to: i64, dest_count: i64, same_parent: bool) -> Result<i64, PlanError> {
    check_range(to, dest_count)?;
    if same_parent && to == dest_count {
        return Ok((dest_count - 1).max(0));
    }
    Ok(to)
}

/// Insert a new entity at `at`, or append when `at` is `None`.
pub fn plan_insert(
    collection: &PositionedCollection,
    entity_id: Uuid,
    at: Option<i64>,
) -> Result<DeltaSet, PlanError> {
    if collection.contains(entity_id) {
        return Err(PlanError::DuplicateEntity(entity_id));
    }

    let count = collection.count();
    let at = at.unwrap_or(count);
    check_range(at, count)?;

    let parent_id = collection.parent_id();
    let mut deltas: Vec<IndexDelta> = collection
        .indexed()
        .skip(at as usize)
        .map(|(id, index)| IndexDelta::stay(id, parent_id, index + 1))
        .collect();
    deltas.push(IndexDelta::reparent(entity_id, parent_id, at));

    DeltaSet::new(deltas, Vec::new())
}

/// Relocate an entity inside its own collection. This is an array move, not a
/// swap: everything between the two slots shifts by one.
pub fn plan_move_within(
    collection: &PositionedCollection,
    entity_id: Uuid,
    from: i64,
    to: i64,
) -> Result<DeltaSet, PlanError> {
    check_at(collection, entity_id, from)?;
    check_range(to, collection.count() - 1)?;

    if to == from {
        return Ok(DeltaSet::empty());
    }

    let parent_id = collection.parent_id();
    let mut deltas = Vec::with_capacity((to - from).unsigned_abs() as usize + 1);

    if to > from {
        for index in (from + 1)..=to {
            if let Some(id) = collection.entity_at(index) {
                deltas.push(IndexDelta::stay(id, parent_id, index - 1));
            }
        }
    } else {
        for index in to..from {
            if let Some(id) = collection.entity_at(index) {
                deltas.push(IndexDelta::stay(id, parent_id, index + 1));
            }
        }
    }
    deltas.push(IndexDelta::stay(entity_id, parent_id, to));

    DeltaSet::new(deltas, Vec::new())
}

/// Move an entity from `source` into `dest` at `to`.
///
/// When both collections share a parent this is a within-parent move.
pub fn plan_move_across(
    source: &PositionedCollection,
    entity_id: Uuid,
    from: i64,
    dest: &PositionedCollection,
    to: i64,
) -> Result<DeltaSet, PlanError> {
    if source.parent_id() == dest.parent_id() {
        return plan_move_within(source, entity_id, from, to);
    }

    check_at(source, entity_id, from)?;
    if dest.contains(entity_id) {
        return Err(PlanError::DuplicateEntity(entity_id));
    }
    check_range(to, dest.count())?;

    let mut deltas: Vec<IndexDelta> = source
        .indexed()
        .skip(from as usize + 1)
        .map(|(id, index)| IndexDelta::stay(id, source.parent_id(), index - 1))
        .collect();
    deltas.extend(
        dest.indexed()
            .skip(to as usize)
            .map(|(id, index)| IndexDelta::stay(id, dest.parent_id(), index + 1)),
    );
    deltas.push(IndexDelta::reparent(entity_id, dest.parent_id(), to));

    DeltaSet::new(deltas, Vec::new())
}

/// Remove the entity at `at` and close the gap it leaves.
pub fn plan_remove(
    collection: &PositionedCollection,
    entity_id: Uuid,
    at: i64,
) -> Result<DeltaSet, PlanError> {
    check_at(collection, entity_id, at)?;

    let parent_id = collection.parent_id();
    let deltas = collection
        .indexed()
        .skip(at as usize + 1)
        .map(|(id, index)| IndexDelta::stay(id, parent_id, index - 1))
        .collect();

    DeltaSet::new(deltas, vec![entity_id])
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn collection(n: usize) -> (PositionedCollection, Vec<Uuid>) {
        let members: Vec<Uuid> = (0..n).map(|_| Uuid::new_v4()).collect();
        let collection = PositionedCollection::new(Uuid::new_v4(), members.clone()).unwrap();
        (collection, members)
    }

    fn applied(mut collection: PositionedCollection, plan: &DeltaSet) -> Vec<Uuid> {
        collection.apply(plan).unwrap();
        collection.members().to_vec()
    }

    #[test]
    fn test_move_forward_is_array_relocation() {
        let (cards, ids) = collection(3);
        let (c1, c2, c3) = (ids[0], ids[1], ids[2]);

        let plan = plan_move_within(&cards, c1, 0, 2).unwrap();

        assert_eq!(plan.len(), 3);
        assert_eq!(plan.delta_for(c1).map(|d| d.new_index), Some(2));
        assert_eq!(plan.delta_for(c2).map(|d| d.new_index), Some(0));
        assert_eq!(plan.delta_for(c3).map(|d| d.new_index), Some(1));
        assert_eq!(applied(cards, &plan), vec![c2, c3, c1]);
    }

    #[test]
    fn test_move_backward_shifts_range_up() {
        let (cards, ids) = collection(4);

        let plan = plan_move_within(&cards, ids[3], 3, 1).unwrap();

        // ids[0] keeps its slot and is not listed.
        assert!(plan.delta_for(ids[0]).is_none());
        assert_eq!(applied(cards, &plan), vec![ids[0], ids[3], ids[1], ids[2]]);
    }

    #[test]
    fn test_move_to_same_slot_is_noop() {
        let (cards, ids) = collection(3);

        let plan = plan_move_within(&cards, ids[1], 1, 1).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_move_round_trip_restores_order() {
        let (mut cards, ids) = collection(5);

        let there = plan_move_within(&cards, ids[1], 1, 4).unwrap();
        cards.apply(&there).unwrap();
        let back = plan_move_within(&cards, ids[1], 4, 1).unwrap();
        cards.apply(&back).unwrap();

        assert_eq!(cards.members(), ids.as_slice());
    }

    #[test]
    fn test_resubmitted_move_is_stale() {
        let (mut cards, ids) = collection(3);

        let plan = plan_move_within(&cards, ids[0], 0, 2).unwrap();
        cards.apply(&plan).unwrap();

        let err = plan_move_within(&cards, ids[0], 0, 2).unwrap_err();
        assert_eq!(
            err,
            PlanError::StalePosition {
                entity_id: ids[0],
                index: 0
            }
        );
    }

    #[test]
    fn test_move_within_rejects_out_of_range() {
        let (cards, ids) = collection(3);

        assert_eq!(
            plan_move_within(&cards, ids[0], 0, 3).unwrap_err(),
            PlanError::InvalidIndex { index: 3, max: 2 }
        );
        assert_eq!(
            plan_move_within(&cards, ids[0], 0, -1).unwrap_err(),
            PlanError::InvalidIndex { index: -1, max: 2 }
        );
    }

    #[test]
    fn test_move_unknown_entity() {
        let (cards, _) = collection(2);
        let stranger = Uuid::new_v4();

        assert_eq!(
            plan_move_within(&cards, stranger, 0, 1).unwrap_err(),
            PlanError::UnknownEntity(stranger)
        );
    }

    #[test]
    fn test_remove_compacts_siblings() {
        let (cards, ids) = collection(3);

        let plan = plan_remove(&cards, ids[1], 1).unwrap();

        assert_eq!(plan.detached(), &[ids[1]]);
        assert_eq!(plan.len(), 1);
        assert_eq!(applied(cards.clone(), &plan), vec![ids[0], ids[2]]);

        let mut after = cards;
        after.apply(&plan).unwrap();
        assert_eq!(after.index_of(ids[2]), Some(1));
    }

    #[test]
    fn test_remove_last_needs_no_shift() {
        let (cards, ids) = collection(3);

        let plan = plan_remove(&cards, ids[2], 2).unwrap();
        assert_eq!(plan.len(), 0);
        assert!(!plan.is_empty());
    }

    #[test]
    fn test_move_across_parents() {
        let (list_a, a) = collection(2);
        let (list_b, b) = collection(2);

        let plan = plan_move_across(&list_a, a[0], 0, &list_b, 1).unwrap();

        let moved = plan.delta_for(a[0]).unwrap();
        assert_eq!(moved.new_parent_id(), Some(list_b.parent_id()));
        assert_eq!(moved.new_index, 1);

        assert_eq!(applied(list_a, &plan), vec![a[1]]);
        assert_eq!(applied(list_b, &plan), vec![b[0], a[0], b[1]]);
    }

    #[test]
    fn test_move_across_append_and_empty_destination() {
        let (list_a, a) = collection(1);
        let list_b = PositionedCollection::empty(Uuid::new_v4());

        let plan = plan_move_across(&list_a, a[0], 0, &list_b, 0).unwrap();
        assert_eq!(applied(list_a, &plan), Vec::<Uuid>::new());
        assert_eq!(applied(list_b, &plan), vec![a[0]]);
    }

    #[test]
    fn test_move_across_rejects_past_end() {
        let (list_a, a) = collection(2);
        let (list_b, _) = collection(2);

        assert_eq!(
            plan_move_across(&list_a, a[0], 0, &list_b, 3).unwrap_err(),
            PlanError::InvalidIndex { index: 3, max: 2 }
        );
    }

    #[test]
    fn test_insert_defaults_to_append() {
        let (cards, ids) = collection(2);
        let new_id = Uuid::new_v4();

        let plan = plan_insert(&cards, new_id, None).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(applied(cards, &plan), vec![ids[0], ids[1], new_id]);
    }

    #[test]
    fn test_insert_at_front_shifts_everyone() {
        let (cards, ids) = collection(2);
        let new_id = Uuid::new_v4();

        let plan = plan_insert(&cards, new_id, Some(0)).unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(applied(cards, &plan), vec![new_id, ids[0], ids[1]]);
    }

    #[test]
    fn test_insert_rejects_out_of_range_and_duplicates() {
        let (cards, ids) = collection(2);

        assert_eq!(
            plan_insert(&cards, Uuid::new_v4(), Some(3)).unwrap_err(),
            PlanError::InvalidIndex { index: 3, max: 2 }
        );
        assert!(matches!(
            plan_insert(&cards, Uuid::new_v4(), Some(-1)),
            Err(PlanError::InvalidIndex { index: -1, .. })
        ));
        assert_eq!(
            plan_insert(&cards, ids[0], None).unwrap_err(),
            PlanError::DuplicateEntity(ids[0])
        );
    }

    #[test]
    fn test_resolve_target() {
        assert_eq!(resolve_target(3, 3, true), Ok(2));
        assert_eq!(resolve_target(3, 3, false), Ok(3));
        assert_eq!(resolve_target(0, 3, true), Ok(0));
        assert_eq!(
            resolve_target(4, 3, true),
            Err(PlanError::InvalidIndex { index: 4, max: 3 })
        );
        assert_eq!(
            resolve_target(-1, 3, false),
            Err(PlanError::InvalidIndex { index: -1, max: 3 })
        );
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(usize),
        Move(usize, usize),
        Cross(usize, usize),
        Remove(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<usize>().prop_map(Op::Insert),
            (any::<usize>(), any::<usize>()).prop_map(|(a, b)| Op::Move(a, b)),
            (any::<usize>(), any::<usize>()).prop_map(|(a, b)| Op::Cross(a, b)),
            any::<usize>().prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn prop_operations_keep_both_collections_dense(ops in prop::collection::vec(op(), 1..60)) {
            let mut left = PositionedCollection::empty(Uuid::new_v4());
            let mut right = PositionedCollection::empty(Uuid::new_v4());

            for op in ops {
                let plan = match op.clone() {
                    Op::Insert(at) => {
                        let at = (at % (left.len() + 1)) as i64;
                        plan_insert(&left, Uuid::new_v4(), Some(at)).unwrap()
                    }
                    Op::Move(from, to) if !left.is_empty() => {
                        let from = (from % left.len()) as i64;
                        let to = (to % left.len()) as i64;
                        let id = left.entity_at(from).unwrap();
                        plan_move_within(&left, id, from, to).unwrap()
                    }
                    Op::Cross(from, to) if !left.is_empty() => {
                        let from = (from % left.len()) as i64;
                        let to = (to % (right.len() + 1)) as i64;
                        let id = left.entity_at(from).unwrap();
                        let plan = plan_move_across(&left, id, from, &right, to).unwrap();
                        // Keep traffic flowing back the other way too.
                        std::mem::swap(&mut left, &mut right);
                        plan
                    }
                    Op::Remove(at) if !left.is_empty() => {
                        let at = (at % left.len()) as i64;
                        let id = left.entity_at(at).unwrap();
                        plan_remove(&left, id, at).unwrap()
                    }
                    _ => continue,
                };

                let before = left.len() + right.len();
                let inserted = matches!(op, Op::Insert(_)) as usize;
                let removed = plan.detached().len();

                prop_assert!(left.apply(&plan).is_ok());
                prop_assert!(right.apply(&plan).is_ok());
                prop_assert_eq!(left.len() + right.len(), before + inserted - removed);

                for (expected, (_, index)) in left.indexed().enumerate() {
                    prop_assert_eq!(index, expected as i64);
                }
                for (expected, (_, index)) in right.indexed().enumerate() {
                    prop_assert_eq!(index, expected as i64);
                }
            }
        }
    }
}
