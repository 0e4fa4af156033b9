use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use super::{DeltaSet, PlanError};

/// The live members of one parent, in index order.
///
/// A member's index is its offset in `members`, so the collection is dense by
/// construction. Anything that cannot be expressed that way is rejected when
/// the collection is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionedCollection {
    parent_id: Uuid,
    members: Vec<Uuid>,
}

impl PositionedCollection {
    pub fn new(parent_id: Uuid, members: Vec<Uuid>) -> Result<Self, PlanError> {
        let mut seen = HashSet::with_capacity(members.len());
        for id in &members {
            if !seen.insert(*id) {
                return Err(PlanError::DuplicateEntity(*id));
            }
        }
        Ok(Self { parent_id, members })
    }

    pub fn empty(parent_id: Uuid) -> Self {
        Self {
            parent_id,
            members: Vec::new(),
        }
    }

    /// Build from stored `(id, index)` rows, verifying the rows are dense.
    pub fn from_indexed<I>(parent_id: Uuid, rows: I) -> Result<Self, PlanError>
    where
        I: IntoIterator<Item = (Uuid, i64)>,
    {
        let mut rows: Vec<(Uuid, i64)> = rows.into_iter().collect();
        rows.sort_by_key(|(_, index)| *index);

        for (expected, (_, found)) in rows.iter().enumerate() {
            let expected = expected as i64;
            if *found != expected {
                if expected > 0 && *found == expected - 1 {
                    return Err(PlanError::IndexCollision {
                        parent_id,
                        index: *found,
                    });
                }
                return Err(PlanError::NotDense {
                    parent_id,
                    expected,
                    found: *found,
                });
            }
        }

        Self::new(parent_id, rows.into_iter().map(|(id, _)| id).collect())
    }

    pub fn parent_id(&self) -> Uuid {
        self.parent_id
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Live count as an index value.
    pub fn count(&self) -> i64 {
        self.members.len() as i64
    }

    pub fn members(&self) -> &[Uuid] {
        &self.members
    }

    pub fn contains(&self, entity_id: Uuid) -> bool {
        self.members.contains(&entity_id)
    }

    pub fn index_of(&self, entity_id: Uuid) -> Option<i64> {
        self.members
            .iter()
            .position(|id| *id == entity_id)
            .map(|i| i as i64)
    }

    pub fn entity_at(&self, index: i64) -> Option<Uuid> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.members.get(i))
            .copied()
    }

    pub fn indexed(&self) -> impl Iterator<Item = (Uuid, i64)> + '_ {
        self.members
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i as i64))
    }

    /// Apply a plan to this collection.
    ///
    /// Deltas for other parents are ignored, except that a member reparented
    /// elsewhere leaves this collection. The result must still be dense; if it
    /// is not, the collection is left untouched.
    pub fn apply(&mut self, plan: &DeltaSet) -> Result<(), PlanError> {
        let mut positions: HashMap<Uuid, i64> = self.indexed().collect();

        for id in plan.detached() {
            positions.remove(id);
        }

        for delta in plan.iter() {
            if delta.parent_id == self.parent_id {
                positions.insert(delta.entity_id, delta.new_index);
            } else if delta.reparented {
                positions.remove(&delta.entity_id);
            }
        }

        *self = Self::from_indexed(self.parent_id, positions)?;
        Ok(())
    }
}
