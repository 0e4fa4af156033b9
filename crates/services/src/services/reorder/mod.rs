//! Server-side ordering authority.
//!
//! Every mutation of a list order or a card order goes through here. The
//! shape of each operation is the same:
//!
//! 1. resolve public ids on a plain pooled connection,
//! 2. lock the affected parents and open a [`UnitOfWork`],
//! 3. re-read everything the plan depends on inside that transaction,
//! 4. plan with [`db::positioning`], apply with a version check, commit.
//!
//! Each whole attempt runs under [`with_retry`], so a busy or stale SQLite
//! snapshot simply reruns the cycle from the top.

mod boards;
mod cards;
mod lists;

use db::{
    ParentKey, RetryConfig, Retryable, StoreError, TransactionalStore, UnitOfWork,
    is_retryable_error,
    models::{
        board::{Board, BoardRepository},
        card::{Card, CardRepository},
        label::Label,
        list::{List, ListRepository},
    },
    positioning::{PlanError, PositionedCollection},
    validation::ValidationError,
};
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

/// Times a card lookup is repeated when the card changes lists between the
/// unlocked resolve and the locked re-read.
const RESOLVE_ATTEMPTS: usize = 3;

pub const DEFAULT_ACTIVITY_LIMIT: i64 = 100;
pub const MAX_ACTIVITY_LIMIT: i64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityKind {
    Board,
    List,
    Card,
    Label,
}

#[derive(Debug, Error)]
pub enum ReorderError {
    #[error("{0} not found")]
    NotFound(EntityKind),
    #[error("invalid index: {0}")]
    InvalidIndex(String),
    #[error("collection was modified concurrently; refetch and retry")]
    ConcurrentModification,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<PlanError> for ReorderError {
    fn from(err: PlanError) -> Self {
        match err {
            // The collection was re-read under lock, so a misplaced or
            // missing entity means the stored order moved underneath us.
            PlanError::StalePosition { .. } | PlanError::UnknownEntity(_) => {
                ReorderError::ConcurrentModification
            }
            PlanError::InvalidIndex { .. }
            | PlanError::DuplicateEntity(_)
            | PlanError::IndexCollision { .. }
            | PlanError::NotDense { .. } => ReorderError::InvalidIndex(err.to_string()),
        }
    }
}

impl From<StoreError> for ReorderError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConcurrentModification { .. } => ReorderError::ConcurrentModification,
            StoreError::Plan(e) => e.into(),
            StoreError::Database(e) => ReorderError::Database(e),
            StoreError::MissingVersion(_) | StoreError::Serialization(_) => {
                ReorderError::Internal(err.to_string())
            }
        }
    }
}

impl Retryable for ReorderError {
    fn is_retryable(&self) -> bool {
        matches!(self, ReorderError::Database(e) if is_retryable_error(e))
    }
}

/// The committed order of one collection and the version it is at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct CollectionState {
    pub parent_id: Uuid,
    pub version: i64,
    pub order: Vec<Uuid>,
}

impl CollectionState {
    fn of(collection: &PositionedCollection, version: i64) -> Self {
        Self {
            parent_id: collection.parent_id(),
            version,
            order: collection.members().to_vec(),
        }
    }
}

/// A created or moved list together with the board's resulting list order.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct ListMutation {
    pub list: List,
    pub lists: CollectionState,
}

/// A created or moved card together with the resulting order of its source
/// and destination lists. The two are equal for same-list operations.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct CardMutation {
    pub card: Card,
    pub source: CollectionState,
    pub dest: CollectionState,
}

/// Acknowledges a delete with the collection the entity left.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct DeleteAck {
    pub id: Uuid,
    pub collection: CollectionState,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct CardView {
    #[serde(flatten)]
    pub card: Card,
    pub label_ids: Vec<Uuid>,
    pub member_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct ListView {
    #[serde(flatten)]
    pub list: List,
    pub cards: Vec<CardView>,
}

/// A board with its lists and cards in index order, read in one transaction.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct BoardSnapshot {
    pub board: Board,
    pub lists: Vec<ListView>,
    pub labels: Vec<Label>,
}

#[derive(Clone)]
pub struct ReorderService {
    store: TransactionalStore,
    retry: RetryConfig,
}

impl ReorderService {
    pub fn new(store: TransactionalStore) -> Self {
        Self {
            store,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &TransactionalStore {
        &self.store
    }

    async fn resolve_board(&self, public_id: &str) -> Result<Board, ReorderError> {
        let mut conn = self.store.reader().await?;
        BoardRepository::new(&mut conn)
            .find_by_public_id(public_id)
            .await?
            .ok_or(ReorderError::NotFound(EntityKind::Board))
    }

    async fn resolve_list(&self, public_id: &str) -> Result<List, ReorderError> {
        let mut conn = self.store.reader().await?;
        ListRepository::new(&mut conn)
            .find_by_public_id(public_id)
            .await?
            .ok_or(ReorderError::NotFound(EntityKind::List))
    }

    async fn resolve_card(&self, public_id: &str) -> Result<Card, ReorderError> {
        let mut conn = self.store.reader().await?;
        CardRepository::new(&mut conn)
            .find_by_public_id(public_id)
            .await?
            .ok_or(ReorderError::NotFound(EntityKind::Card))
    }

    /// Lock `keys` and re-read `card` inside the new transaction.
    ///
    /// `keys` is computed from an unlocked read of the card, so the card may
    /// have moved to another list before the lock was granted. In that case
    /// the lookup starts over.
    async fn lock_card<F>(
        &self,
        public_id: &str,
        keys: F,
    ) -> Result<(UnitOfWork, Card), ReorderError>
    where
        F: Fn(&Card) -> Vec<ParentKey>,
    {
        for _ in 0..RESOLVE_ATTEMPTS {
            let seen = self.resolve_card(public_id).await?;
            let mut uow = self.store.begin(keys(&seen)).await?;
            let card = CardRepository::new(uow.conn())
                .find_by_id(seen.id)
                .await?
                .ok_or(ReorderError::NotFound(EntityKind::Card))?;
            if card.list_id == seen.list_id {
                return Ok((uow, card));
            }
            tracing::debug!(card_id = %card.id, "Card changed lists before lock; resolving again");
        }
        Err(ReorderError::ConcurrentModification)
    }
}

/// Live lists of a board plus the board's list-order version.
async fn load_lists(
    uow: &mut UnitOfWork,
    board_id: Uuid,
) -> Result<(PositionedCollection, i64), ReorderError> {
    let version = BoardRepository::new(uow.conn())
        .lists_version(board_id)
        .await?
        .ok_or(ReorderError::NotFound(EntityKind::Board))?;
    let rows = ListRepository::new(uow.conn())
        .live_positions(board_id)
        .await?;
    Ok((PositionedCollection::from_indexed(board_id, rows)?, version))
}

/// Live cards of a list plus the list's card-order version.
async fn load_cards(
    uow: &mut UnitOfWork,
    list_id: Uuid,
) -> Result<(PositionedCollection, i64), ReorderError> {
    let version = ListRepository::new(uow.conn())
        .cards_version(list_id)
        .await?
        .ok_or(ReorderError::NotFound(EntityKind::List))?;
    let rows = CardRepository::new(uow.conn())
        .live_positions(list_id)
        .await?;
    Ok((PositionedCollection::from_indexed(list_id, rows)?, version))
}

/// A caller-supplied version must match the one read under lock.
fn check_expected(expected: Option<i64>, actual: i64) -> Result<(), ReorderError> {
    match expected {
        Some(v) if v != actual => Err(ReorderError::ConcurrentModification),
        _ => Ok(()),
    }
}

/// Insert position for a new entity: `0..=count`, append when absent.
fn insert_at(at: Option<i64>, count: i64) -> Result<i64, ReorderError> {
    let at = at.unwrap_or(count);
    if !(0..=count).contains(&at) {
        return Err(PlanError::InvalidIndex {
            index: at,
            max: count,
        }
        .into());
    }
    Ok(at)
}
