//! Atomic application of index plans.
//!
//! A [`UnitOfWork`] holds the advisory locks for the parents it was opened
//! with and one SQLite transaction. Everything the caller reads through
//! [`UnitOfWork::conn`] and every [`ChangeSet`] it applies commits together,
//! or not at all if the unit is dropped without [`UnitOfWork::commit`].
//!
//! Two checks guard against planning on stale data even when the locks are
//! bypassed (another process on the same file, a caller that locked the wrong
//! parent):
//!
//! - every parent collection touched by a plan must carry the version the
//!   plan was computed against, and that version is compared and bumped in a
//!   single `UPDATE`;
//! - rows are written in two phases, first parked at `-1 - index` and then
//!   flipped to `index`, so the live-position unique index can only fire on
//!   a genuine duplicate, which is reported as a concurrent modification.

use std::collections::HashMap;

use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction, pool::PoolConnection};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    locks::{ParentKey, ParentLockGuard, ParentLocks},
    models::activity::{ActivityRepository, NewActivity},
    positioning::{DeltaSet, PlanError},
    retry::{Retryable, is_retryable_error},
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{parent} was modified concurrently")]
    ConcurrentModification { parent: ParentKey },
    #[error("plan touches {0} without a version check")]
    MissingVersion(ParentKey),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Database(e) if is_retryable_error(e))
    }
}

/// Which ordered collection a change set targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    /// Lists of a board.
    Lists,
    /// Cards of a list.
    Cards,
}

impl CollectionKind {
    fn table(self) -> &'static str {
        match self {
            CollectionKind::Lists => "lists",
            CollectionKind::Cards => "cards",
        }
    }

    fn parent_column(self) -> &'static str {
        match self {
            CollectionKind::Lists => "board_id",
            CollectionKind::Cards => "list_id",
        }
    }

    fn parent_table(self) -> &'static str {
        match self {
            CollectionKind::Lists => "boards",
            CollectionKind::Cards => "lists",
        }
    }

    fn version_column(self) -> &'static str {
        match self {
            CollectionKind::Lists => "lists_version",
            CollectionKind::Cards => "cards_version",
        }
    }

    pub fn parent_key(self, parent_id: Uuid) -> ParentKey {
        match self {
            CollectionKind::Lists => ParentKey::Board(parent_id),
            CollectionKind::Cards => ParentKey::List(parent_id),
        }
    }
}

/// A plan plus everything needed to commit it safely.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    kind: CollectionKind,
    plan: DeltaSet,
    versions: Vec<(Uuid, i64)>,
    deleted_by: Option<Uuid>,
    activity: Option<NewActivity>,
}

impl ChangeSet {
    pub fn new(kind: CollectionKind, plan: DeltaSet) -> Self {
        Self {
            kind,
            plan,
            versions: Vec::new(),
            deleted_by: None,
            activity: None,
        }
    }

    /// Require `parent_id`'s collection to still be at `version`, and bump it.
    pub fn expect_version(mut self, parent_id: Uuid, version: i64) -> Self {
        if !self.versions.iter().any(|(id, _)| *id == parent_id) {
            self.versions.push((parent_id, version));
        }
        self
    }

    /// Actor recorded on rows the plan detaches.
    pub fn deleted_by(mut self, actor_id: Option<Uuid>) -> Self {
        self.deleted_by = actor_id;
        self
    }

    pub fn with_activity(mut self, activity: NewActivity) -> Self {
        self.activity = Some(activity);
        self
    }

    pub fn plan(&self) -> &DeltaSet {
        &self.plan
    }

    fn primary_parent(&self) -> ParentKey {
        let id = self
            .versions
            .first()
            .map(|(id, _)| *id)
            .unwrap_or_else(Uuid::nil);
        self.kind.parent_key(id)
    }
}

/// Result of a successful [`UnitOfWork::apply`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedChange {
    versions: HashMap<Uuid, i64>,
    pub activity_seq: Option<i64>,
}

impl AppliedChange {
    /// The version a parent's collection moved to.
    pub fn version(&self, parent_id: Uuid) -> Option<i64> {
        self.versions.get(&parent_id).copied()
    }
}

#[derive(Clone)]
pub struct TransactionalStore {
    pool: SqlitePool,
    locks: ParentLocks,
}

impl TransactionalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            locks: ParentLocks::new(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn locks(&self) -> &ParentLocks {
        &self.locks
    }

    /// A pooled connection for unlocked reads.
    pub async fn reader(&self) -> Result<PoolConnection<Sqlite>, StoreError> {
        Ok(self.pool.acquire().await?)
    }

    /// Lock `keys` (in canonical order) and open a transaction.
    ///
    /// The locks are taken first, so the transaction's snapshot already sees
    /// whatever the previous holder committed.
    pub async fn begin<I>(&self, keys: I) -> Result<UnitOfWork, StoreError>
    where
        I: IntoIterator<Item = ParentKey>,
    {
        let guard = self.locks.acquire(keys).await;
        let tx = self.pool.begin().await?;
        Ok(UnitOfWork { tx, guard })
    }

    /// A transaction that holds no parent locks. For consistent multi-query
    /// reads and for writes that never touch an order.
    pub async fn begin_unlocked(&self) -> Result<UnitOfWork, StoreError> {
        self.begin(std::iter::empty::<ParentKey>()).await
    }
}

/// Locked transaction scope. Dropping it rolls back and then unlocks.
pub struct UnitOfWork {
    // Declared first so the rollback happens before the locks are released.
    tx: Transaction<'static, Sqlite>,
    guard: ParentLockGuard,
}

impl UnitOfWork {
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    pub fn is_locked(&self, key: ParentKey) -> bool {
        self.guard.keys().any(|held| held == key)
    }

    pub async fn apply(&mut self, change: ChangeSet) -> Result<AppliedChange, StoreError> {
        let kind = change.kind;

        for parent_id in change.plan.parents() {
            if !change.versions.iter().any(|(id, _)| *id == parent_id) {
                return Err(StoreError::MissingVersion(kind.parent_key(parent_id)));
            }
        }

        let mut applied = AppliedChange::default();
        for (parent_id, expected) in &change.versions {
            let version = self.bump_version(kind, *parent_id, *expected).await?;
            applied.versions.insert(*parent_id, version);
        }

        // Detach first so the freed slot is not counted by the unique index.
        for entity_id in change.plan.detached() {
            let rows = sqlx::query(&format!(
                "UPDATE {table}
                 SET deleted_at = datetime('now', 'subsec'),
                     deleted_by = $2,
                     updated_at = datetime('now', 'subsec')
                 WHERE id = $1 AND deleted_at IS NULL",
                table = kind.table(),
            ))
            .bind(entity_id)
            .bind(change.deleted_by)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();

            if rows == 0 {
                return Err(StoreError::ConcurrentModification {
                    parent: change.primary_parent(),
                });
            }
        }

        for delta in change.plan.iter() {
            let parked = -1 - delta.new_index;
            let result = sqlx::query(&format!(
                "UPDATE {table}
                 SET position = $2,
                     {parent} = COALESCE($3, {parent}),
                     updated_at = datetime('now', 'subsec')
                 WHERE id = $1 AND deleted_at IS NULL",
                table = kind.table(),
                parent = kind.parent_column(),
            ))
            .bind(delta.entity_id)
            .bind(parked)
            .bind(delta.new_parent_id())
            .execute(&mut *self.tx)
            .await;

            let rows = map_collision(result, kind.parent_key(delta.parent_id))?.rows_affected();
            if rows == 0 {
                return Err(StoreError::ConcurrentModification {
                    parent: kind.parent_key(delta.parent_id),
                });
            }
        }

        for delta in change.plan.iter() {
            let result = sqlx::query(&format!(
                "UPDATE {table} SET position = $2 WHERE id = $1",
                table = kind.table(),
            ))
            .bind(delta.entity_id)
            .bind(delta.new_index)
            .execute(&mut *self.tx)
            .await;
            map_collision(result, kind.parent_key(delta.parent_id))?;
        }

        if let Some(activity) = &change.activity {
            let seq = ActivityRepository::new(&mut self.tx).insert(activity).await?;
            applied.activity_seq = Some(seq);
        }

        tracing::debug!(
            collection = kind.table(),
            deltas = change.plan.len(),
            detached = change.plan.detached().len(),
            "Applied index plan"
        );

        Ok(applied)
    }

    /// Record an event without any index change.
    pub async fn record(&mut self, activity: &NewActivity) -> Result<i64, StoreError> {
        Ok(ActivityRepository::new(&mut self.tx).insert(activity).await?)
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        let UnitOfWork { tx, guard } = self;
        tx.commit().await?;
        drop(guard);
        Ok(())
    }

    async fn bump_version(
        &mut self,
        kind: CollectionKind,
        parent_id: Uuid,
        expected: i64,
    ) -> Result<i64, StoreError> {
        let version = sqlx::query_scalar::<_, i64>(&format!(
            "UPDATE {table}
             SET {column} = {column} + 1,
                 updated_at = datetime('now', 'subsec')
             WHERE id = $1 AND {column} = $2 AND deleted_at IS NULL
             RETURNING {column}",
            table = kind.parent_table(),
            column = kind.version_column(),
        ))
        .bind(parent_id)
        .bind(expected)
        .fetch_optional(&mut *self.tx)
        .await?;

        version.ok_or(StoreError::ConcurrentModification {
            parent: kind.parent_key(parent_id),
        })
    }
}

fn map_collision<T>(result: Result<T, sqlx::Error>, parent: ParentKey) -> Result<T, StoreError> {
    match result {
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            Err(StoreError::ConcurrentModification { parent })
        }
        other => Ok(other?),
    }
}
