//! Dense positional indices for ordered child collections.
//!
//! Lists inside a board and cards inside a list are kept in a
//! [`PositionedCollection`]: the live members of a parent occupy exactly
//! `0..len` with no gaps or duplicates. The [`planner`] functions compute the
//! [`DeltaSet`] that keeps this true for inserts, moves and removals, without
//! touching storage. Persisting a plan is the job of
//! [`TransactionalStore`](crate::store::TransactionalStore).

mod collection;
pub mod planner;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

pub use collection::PositionedCollection;
pub use planner::{plan_insert, plan_move_across, plan_move_within, plan_remove, resolve_target};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("index {index} is out of range 0..={max}")]
    InvalidIndex { index: i64, max: i64 },
    #[error("entity {entity_id} is not at index {index}")]
    StalePosition { entity_id: Uuid, index: i64 },
    #[error("entity {0} is not a live member of this collection")]
    UnknownEntity(Uuid),
    #[error("entity {0} appears more than once")]
    DuplicateEntity(Uuid),
    #[error("index {index} is claimed twice in parent {parent_id}")]
    IndexCollision { parent_id: Uuid, index: i64 },
    #[error("indices in parent {parent_id} are not dense: expected {expected}, found {found}")]
    NotDense {
        parent_id: Uuid,
        expected: i64,
        found: i64,
    },
}

/// One row's new placement.
///
/// `parent_id` is the parent the entity ends up in. `reparented` is set when
/// that parent differs from the entity's current one (cross-parent move) or
/// when the entity is brand new.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct IndexDelta {
    pub entity_id: Uuid,
    pub parent_id: Uuid,
    pub new_index: i64,
    pub reparented: bool,
}

impl IndexDelta {
    pub fn stay(entity_id: Uuid, parent_id: Uuid, new_index: i64) -> Self {
        Self {
            entity_id,
            parent_id,
            new_index,
            reparented: false,
        }
    }

    pub fn reparent(entity_id: Uuid, parent_id: Uuid, new_index: i64) -> Self {
        Self {
            entity_id,
            parent_id,
            new_index,
            reparented: true,
        }
    }

    /// The foreign key to write, if it changes.
    pub fn new_parent_id(&self) -> Option<Uuid> {
        self.reparented.then_some(self.parent_id)
    }
}

/// A validated set of placements that is applied all-or-nothing.
///
/// `detached` lists entities leaving their collection without a new
/// placement (soft deletes).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaSet {
    deltas: Vec<IndexDelta>,
    detached: Vec<Uuid>,
}

impl DeltaSet {
    pub fn new(deltas: Vec<IndexDelta>, detached: Vec<Uuid>) -> Result<Self, PlanError> {
        let mut entities = std::collections::HashSet::new();
        let mut slots = std::collections::HashSet::new();

        for delta in &deltas {
            if delta.new_index < 0 {
                return Err(PlanError::InvalidIndex {
                    index: delta.new_index,
                    max: i64::MAX,
                });
            }
            if !entities.insert(delta.entity_id) {
                return Err(PlanError::DuplicateEntity(delta.entity_id));
            }
            if !slots.insert((delta.parent_id, delta.new_index)) {
                return Err(PlanError::IndexCollision {
                    parent_id: delta.parent_id,
                    index: delta.new_index,
                });
            }
        }
        for id in &detached {
            if !entities.insert(*id) {
                return Err(PlanError::DuplicateEntity(*id));
            }
        }

        Ok(Self { deltas, detached })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty() && self.detached.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexDelta> {
        self.deltas.iter()
    }

    pub fn deltas(&self) -> &[IndexDelta] {
        &self.deltas
    }

    pub fn detached(&self) -> &[Uuid] {
        &self.detached
    }

    pub fn delta_for(&self, entity_id: Uuid) -> Option<&IndexDelta> {
        self.deltas.iter().find(|d| d.entity_id == entity_id)
    }

    /// Distinct parents touched by this plan, in first-seen order.
    pub fn parents(&self) -> Vec<Uuid> {
        let mut parents = Vec::new();
        for delta in &self.deltas {
            if !parents.contains(&delta.parent_id) {
                parents.push(delta.parent_id);
            }
        }
        parents
    }
}
