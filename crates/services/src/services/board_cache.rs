//! Client-side optimistic projection of one board.
//!
//! A mutation splices the local projection with the same planner the server
//! uses, then sends the request. The projection is reconciled along one
//! path only: on success the server's returned collection state replaces the
//! speculative order, on any error the pre-splice collections are restored
//! and the board is refetched.
//!
//! Each mutation is tracked as a [`MutationRecord`] moving through
//! [`MutationState`]:
//!
//! ```text
//! Speculative -> Pending -> Committed
//!                       \-> RolledBack
//! ```
//!
//! Only one mutation per collection is in flight at a time; a second one on
//! the same list order or card order waits for the first to settle.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use db::{
    ParentKey, ParentLocks,
    models::{
        card::{Card, CreateCard, MoveCard},
        list::{CreateList, List, MoveList},
    },
    positioning::{
        DeltaSet, PlanError, PositionedCollection, plan_insert, plan_move_across,
        plan_move_within, plan_remove, resolve_target,
    },
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};
use ts_rs::TS;
use uuid::Uuid;

use super::{
    board_api::{BoardApi, BoardApiError},
    reorder::{BoardSnapshot, CardMutation, CollectionState, DeleteAck, ListMutation},
};

/// Settled records kept for inspection.
const MAX_RECORDS: usize = 256;

/// Attempts to lock a consistent set of collections before giving up.
const LOCK_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error(transparent)]
    Api(#[from] BoardApiError),
    #[error("board is not loaded")]
    NotLoaded,
    #[error("unknown list {0}")]
    UnknownList(Uuid),
    #[error("unknown card {0}")]
    UnknownCard(Uuid),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error("unexpected response to {0}")]
    UnexpectedResponse(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
pub enum MutationState {
    Speculative,
    Pending,
    Committed,
    RolledBack,
}

/// What the user asked for, in client ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Intent {
    CreateList {
        name: String,
        at_index: Option<i64>,
    },
    ReorderList {
        list_id: Uuid,
        to_index: i64,
    },
    DeleteList {
        list_id: Uuid,
    },
    CreateCard {
        list_id: Uuid,
        title: String,
        at_index: Option<i64>,
    },
    ReorderCard {
        card_id: Uuid,
        dest_list_id: Uuid,
        to_index: i64,
    },
    DeleteCard {
        card_id: Uuid,
    },
}

impl Intent {
    fn name(&self) -> &'static str {
        match self {
            Intent::CreateList { .. } => "create_list",
            Intent::ReorderList { .. } => "reorder_list",
            Intent::DeleteList { .. } => "delete_list",
            Intent::CreateCard { .. } => "create_card",
            Intent::ReorderCard { .. } => "reorder_card",
            Intent::DeleteCard { .. } => "delete_card",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct MutationRecord {
    pub id: Uuid,
    pub intent: Intent,
    pub state: MutationState,
    /// Requests sent so far. Two means the stale-version retry was used.
    pub attempts: u32,
    #[ts(optional)]
    pub error: Option<String>,
}

/// Transient notifications for the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Committed { mutation_id: Uuid },
    RolledBack { mutation_id: Uuid, error: String },
    Refetched { lists_version: i64 },
}

/// A server response to any mutation.
#[derive(Debug, Clone)]
pub enum Outcome {
    List(ListMutation),
    Card(CardMutation),
    Deleted(DeleteAck),
}

/// Request built from an [`Intent`] against the current projection.
#[derive(Debug, Clone)]
enum Request {
    CreateList { board: String, body: CreateList },
    ReorderList { list: String, body: MoveList },
    DeleteList { list: String },
    CreateCard { list: String, body: CreateCard },
    ReorderCard { card: String, body: MoveCard },
    DeleteCard { card: String },
}

/// Pre-splice copies of the collections a mutation touches.
#[derive(Debug, Clone)]
struct Saved {
    lists: Option<(PositionedCollection, i64)>,
    cards: Vec<(Uuid, Option<PositionedCollection>, Option<i64>)>,
}

/// The board as this client currently believes it to be.
#[derive(Debug, Clone)]
struct Projection {
    board_public_id: String,
    board_id: Uuid,
    lists: PositionedCollection,
    lists_version: i64,
    cards: HashMap<Uuid, PositionedCollection>,
    cards_versions: HashMap<Uuid, i64>,
    list_entries: HashMap<Uuid, List>,
    card_entries: HashMap<Uuid, Card>,
    card_parent: HashMap<Uuid, Uuid>,
}

impl Projection {
    fn from_snapshot(snapshot: BoardSnapshot) -> Result<Self, CacheError> {
        let board_id = snapshot.board.id;
        let lists = PositionedCollection::new(
            board_id,
            snapshot.lists.iter().map(|view| view.list.id).collect(),
        )?;

        let mut projection = Projection {
            board_public_id: snapshot.board.public_id,
            board_id,
            lists,
            lists_version: snapshot.board.lists_version,
            cards: HashMap::new(),
            cards_versions: HashMap::new(),
            list_entries: HashMap::new(),
            card_entries: HashMap::new(),
            card_parent: HashMap::new(),
        };

        for view in snapshot.lists {
            let list_id = view.list.id;
            let order = view.cards.iter().map(|c| c.card.id).collect();
            projection
                .cards
                .insert(list_id, PositionedCollection::new(list_id, order)?);
            projection
                .cards_versions
                .insert(list_id, view.list.cards_version);
            for card_view in view.cards {
                projection.card_parent.insert(card_view.card.id, list_id);
                projection
                    .card_entries
                    .insert(card_view.card.id, card_view.card);
            }
            projection.list_entries.insert(list_id, view.list);
        }
        Ok(projection)
    }

    fn parent_of(&self, card_id: Uuid) -> Result<Uuid, CacheError> {
        self.card_parent
            .get(&card_id)
            .copied()
            .ok_or(CacheError::UnknownCard(card_id))
    }

    fn list_public_id(&self, list_id: Uuid) -> Result<String, CacheError> {
        self.list_entries
            .get(&list_id)
            .map(|l| l.public_id.clone())
            .ok_or(CacheError::UnknownList(list_id))
    }

    fn card_public_id(&self, card_id: Uuid) -> Result<String, CacheError> {
        self.card_entries
            .get(&card_id)
            .map(|c| c.public_id.clone())
            .ok_or(CacheError::UnknownCard(card_id))
    }

    fn cards_of(&self, list_id: Uuid) -> Result<(&PositionedCollection, i64), CacheError> {
        let cards = self
            .cards
            .get(&list_id)
            .ok_or(CacheError::UnknownList(list_id))?;
        let version = self.cards_versions.get(&list_id).copied().unwrap_or(0);
        Ok((cards, version))
    }

    /// Collections an intent mutates, as lock keys.
    fn keys_for(&self, intent: &Intent) -> Result<Vec<ParentKey>, CacheError> {
        let board = ParentKey::Board(self.board_id);
        Ok(match intent {
            Intent::CreateList { .. } | Intent::ReorderList { .. } => vec![board],
            Intent::DeleteList { list_id } => vec![board, ParentKey::List(*list_id)],
            Intent::CreateCard { list_id, .. } => vec![ParentKey::List(*list_id)],
            Intent::ReorderCard {
                card_id,
                dest_list_id,
                ..
            } => vec![
                ParentKey::List(self.parent_of(*card_id)?),
                ParentKey::List(*dest_list_id),
            ],
            Intent::DeleteCard { card_id } => vec![ParentKey::List(self.parent_of(*card_id)?)],
        })
    }

    fn save(&self, keys: &[ParentKey]) -> Saved {
        let mut saved = Saved {
            lists: None,
            cards: Vec::new(),
        };
        for key in keys {
            match key {
                ParentKey::Board(_) => {
                    saved.lists = Some((self.lists.clone(), self.lists_version));
                }
                ParentKey::List(id) => saved.cards.push((
                    *id,
                    self.cards.get(id).cloned(),
                    self.cards_versions.get(id).copied(),
                )),
            }
        }
        saved
    }

    fn restore(&mut self, saved: Saved) {
        if let Some((lists, version)) = saved.lists {
            self.lists = lists;
            self.lists_version = version;
        }
        for (list_id, cards, version) in saved.cards {
            match cards {
                Some(cards) => {
                    for card_id in cards.members() {
                        self.card_parent.insert(*card_id, list_id);
                    }
                    self.cards.insert(list_id, cards);
                }
                None => {
                    self.cards.remove(&list_id);
                }
            }
            if let Some(version) = version {
                self.cards_versions.insert(list_id, version);
            }
        }
        // Speculative entities exist only in card_parent.
        let cards = &self.cards;
        self.card_parent
            .retain(|card_id, list_id| cards.get(list_id).is_some_and(|c| c.contains(*card_id)));
    }

    /// Apply the intent locally and build the matching request.
    fn splice(&mut self, intent: &Intent) -> Result<Request, CacheError> {
        match intent {
            Intent::CreateList { name, at_index } => {
                let placeholder = Uuid::new_v4();
                let plan = plan_insert(&self.lists, placeholder, *at_index)?;
                self.lists.apply(&plan)?;
                Ok(Request::CreateList {
                    board: self.board_public_id.clone(),
                    body: CreateList {
                        name: name.clone(),
                        at_index: *at_index,
                    },
                })
            }
            Intent::ReorderList { list_id, to_index } => {
                let from = self
                    .lists
                    .index_of(*list_id)
                    .ok_or(CacheError::UnknownList(*list_id))?;
                let to = resolve_target(*to_index, self.lists.count(), true)?;
                let plan = plan_move_within(&self.lists, *list_id, from, to)?;
                self.lists.apply(&plan)?;
                Ok(Request::ReorderList {
                    list: self.list_public_id(*list_id)?,
                    body: MoveList {
                        to_index: *to_index,
                        expected_version: Some(self.lists_version),
                    },
                })
            }
            Intent::DeleteList { list_id } => {
                let at = self
                    .lists
                    .index_of(*list_id)
                    .ok_or(CacheError::UnknownList(*list_id))?;
                let plan = plan_remove(&self.lists, *list_id, at)?;
                self.lists.apply(&plan)?;
                Ok(Request::DeleteList {
                    list: self.list_public_id(*list_id)?,
                })
            }
            Intent::CreateCard {
                list_id,
                title,
                at_index,
            } => {
                let list = self.list_public_id(*list_id)?;
                let placeholder = Uuid::new_v4();
                let (cards, _) = self.cards_of(*list_id)?;
                let plan = plan_insert(cards, placeholder, *at_index)?;
                self.apply_cards(&plan, &[*list_id])?;
                self.card_parent.insert(placeholder, *list_id);
                Ok(Request::CreateCard {
                    list,
                    body: CreateCard {
                        title: title.clone(),
                        description: None,
                        at_index: *at_index,
                    },
                })
            }
            Intent::ReorderCard {
                card_id,
                dest_list_id,
                to_index,
            } => {
                let card = self.card_public_id(*card_id)?;
                let dest_public_id = self.list_public_id(*dest_list_id)?;
                let source_id = self.parent_of(*card_id)?;
                let (source, source_version) = self.cards_of(source_id)?;
                let from = source
                    .index_of(*card_id)
                    .ok_or(CacheError::UnknownCard(*card_id))?;

                let (plan, dest_version) = if source_id == *dest_list_id {
                    let to = resolve_target(*to_index, source.count(), true)?;
                    (plan_move_within(source, *card_id, from, to)?, source_version)
                } else {
                    let (dest, dest_version) = self.cards_of(*dest_list_id)?;
                    let to = resolve_target(*to_index, dest.count(), false)?;
                    (
                        plan_move_across(source, *card_id, from, dest, to)?,
                        dest_version,
                    )
                };
                self.apply_cards(&plan, &[source_id, *dest_list_id])?;
                self.card_parent.insert(*card_id, *dest_list_id);

                Ok(Request::ReorderCard {
                    card,
                    body: MoveCard {
                        dest_list_id: dest_public_id,
                        to_index: *to_index,
                        expected_source_version: Some(source_version),
                        expected_dest_version: Some(dest_version),
                    },
                })
            }
            Intent::DeleteCard { card_id } => {
                let card = self.card_public_id(*card_id)?;
                let list_id = self.parent_of(*card_id)?;
                let (cards, _) = self.cards_of(list_id)?;
                let at = cards
                    .index_of(*card_id)
                    .ok_or(CacheError::UnknownCard(*card_id))?;
                let plan = plan_remove(cards, *card_id, at)?;
                self.apply_cards(&plan, &[list_id])?;
                Ok(Request::DeleteCard { card })
            }
        }
    }

    /// Apply a card plan to each listed collection, all or nothing.
    fn apply_cards(&mut self, plan: &DeltaSet, list_ids: &[Uuid]) -> Result<(), CacheError> {
        let mut updated = Vec::new();
        for list_id in list_ids {
            if updated.iter().any(|(id, _)| id == list_id) {
                continue;
            }
            let mut cards = self.cards_of(*list_id)?.0.clone();
            cards.apply(plan)?;
            updated.push((*list_id, cards));
        }
        for (list_id, cards) in updated {
            self.cards.insert(list_id, cards);
        }
        Ok(())
    }

    /// Adopt a committed list order. Returns false when it names lists this
    /// projection has never seen.
    fn adopt_lists(&mut self, state: &CollectionState) -> Result<bool, CacheError> {
        if state.version < self.lists_version {
            return Ok(true);
        }
        self.lists = PositionedCollection::new(state.parent_id, state.order.clone())?;
        self.lists_version = state.version;
        Ok(state.order.iter().all(|id| self.list_entries.contains_key(id)))
    }

    fn adopt_cards(&mut self, state: &CollectionState) -> Result<bool, CacheError> {
        let current = self.cards_versions.get(&state.parent_id).copied();
        if current.is_some_and(|v| state.version < v) {
            return Ok(true);
        }
        let cards = PositionedCollection::new(state.parent_id, state.order.clone())?;
        for card_id in cards.members() {
            self.card_parent.insert(*card_id, state.parent_id);
        }
        self.cards.insert(state.parent_id, cards);
        self.cards_versions.insert(state.parent_id, state.version);
        Ok(state.order.iter().all(|id| self.card_entries.contains_key(id)))
    }

    /// Fold a committed response into the projection. Returns false when the
    /// projection should be refetched.
    fn adopt(&mut self, intent: &Intent, outcome: &Outcome) -> Result<bool, CacheError> {
        let complete = match outcome {
            Outcome::List(mutation) => {
                let list = &mutation.list;
                self.cards
                    .entry(list.id)
                    .or_insert_with(|| PositionedCollection::empty(list.id));
                self.cards_versions
                    .entry(list.id)
                    .or_insert(list.cards_version);
                self.list_entries.insert(list.id, list.clone());
                self.adopt_lists(&mutation.lists)?
            }
            Outcome::Card(mutation) => {
                self.card_entries
                    .insert(mutation.card.id, mutation.card.clone());
                let source = self.adopt_cards(&mutation.source)?;
                let dest = self.adopt_cards(&mutation.dest)?;
                source && dest
            }
            Outcome::Deleted(ack) => match intent {
                Intent::DeleteList { list_id } => {
                    if let Some(cards) = self.cards.remove(list_id) {
                        for card_id in cards.members() {
                            self.card_parent.remove(card_id);
                            self.card_entries.remove(card_id);
                        }
                    }
                    self.cards_versions.remove(list_id);
                    self.list_entries.remove(list_id);
                    self.adopt_lists(&ack.collection)?
                }
                _ => {
                    self.card_parent.remove(&ack.id);
                    self.card_entries.remove(&ack.id);
                    self.adopt_cards(&ack.collection)?
                }
            },
        };

        // Drop placeholders the committed order replaced.
        let cards = &self.cards;
        self.card_parent
            .retain(|card_id, list_id| cards.get(list_id).is_some_and(|c| c.contains(*card_id)));
        Ok(complete)
    }
}

/// Marks the cache stale if a pending mutation's future is dropped.
struct InFlight {
    mutation_id: Uuid,
    stale: Arc<AtomicBool>,
    records: Arc<Mutex<VecDeque<MutationRecord>>>,
    armed: bool,
}

impl InFlight {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.stale.store(true, Ordering::SeqCst);
        update_record(&self.records, self.mutation_id, |record| {
            record.state = MutationState::RolledBack;
            record.error = Some("abandoned".to_string());
        });
        warn!(mutation_id = %self.mutation_id, "Pending mutation abandoned; board marked stale");
    }
}

fn update_record(
    records: &Mutex<VecDeque<MutationRecord>>,
    mutation_id: Uuid,
    f: impl FnOnce(&mut MutationRecord),
) {
    let mut records = records.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(record) = records.iter_mut().find(|r| r.id == mutation_id) {
        f(record);
    }
}

#[derive(Clone)]
pub struct BoardCache {
    api: Arc<dyn BoardApi>,
    board_public_id: String,
    projection: Arc<RwLock<Option<Projection>>>,
    locks: ParentLocks,
    stale: Arc<AtomicBool>,
    records: Arc<Mutex<VecDeque<MutationRecord>>>,
    events: broadcast::Sender<CacheEvent>,
}

impl BoardCache {
    /// A cache that fetches the board on first use.
    pub fn new(api: Arc<dyn BoardApi>, board_public_id: &str) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            api,
            board_public_id: board_public_id.to_string(),
            projection: Arc::new(RwLock::new(None)),
            locks: ParentLocks::new(),
            stale: Arc::new(AtomicBool::new(true)),
            records: Arc::new(Mutex::new(VecDeque::new())),
            events,
        }
    }

    pub async fn load(api: Arc<dyn BoardApi>, board_public_id: &str) -> Result<Self, CacheError> {
        let cache = Self::new(api, board_public_id);
        cache.ensure_fresh().await?;
        Ok(cache)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    /// Mutation history, oldest first.
    pub fn mutations(&self) -> Vec<MutationRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.iter().cloned().collect()
    }

    /// Replace the projection with the server's canonical state.
    ///
    /// The stale flag is cleared only once the new projection is in place, so
    /// a fetch dropped part way through leaves the cache stale.
    pub async fn refetch(&self) -> Result<(), CacheError> {
        let fetched = match self.api.snapshot(&self.board_public_id).await {
            Ok(snapshot) => Projection::from_snapshot(snapshot),
            Err(e) => Err(e.into()),
        };
        let projection = match fetched {
            Ok(projection) => projection,
            Err(e) => {
                self.stale.store(true, Ordering::SeqCst);
                return Err(e);
            }
        };
        let lists_version = projection.lists_version;
        {
            let mut guard = self.projection.write().await;
            *guard = Some(projection);
            self.stale.store(false, Ordering::SeqCst);
        }

        debug!(board = %self.board_public_id, lists_version, "Refetched board");
        let _ = self.events.send(CacheEvent::Refetched { lists_version });
        Ok(())
    }

    async fn ensure_fresh(&self) -> Result<(), CacheError> {
        if self.stale.load(Ordering::SeqCst) {
            self.refetch().await?;
        }
        Ok(())
    }

    async fn read<T>(&self, f: impl FnOnce(&Projection) -> Result<T, CacheError>) -> Result<T, CacheError> {
        self.ensure_fresh().await?;
        let guard = self.projection.read().await;
        let projection = guard.as_ref().ok_or(CacheError::NotLoaded)?;
        f(projection)
    }

    pub async fn board_id(&self) -> Result<Uuid, CacheError> {
        self.read(|p| Ok(p.board_id)).await
    }

    /// List ids in display order, including speculative placement.
    pub async fn list_order(&self) -> Result<Vec<Uuid>, CacheError> {
        self.read(|p| Ok(p.lists.members().to_vec())).await
    }

    pub async fn card_order(&self, list_id: Uuid) -> Result<Vec<Uuid>, CacheError> {
        self.read(|p| Ok(p.cards_of(list_id)?.0.members().to_vec()))
            .await
    }

    pub async fn lists_version(&self) -> Result<i64, CacheError> {
        self.read(|p| Ok(p.lists_version)).await
    }

    pub async fn cards_version(&self, list_id: Uuid) -> Result<i64, CacheError> {
        self.read(|p| Ok(p.cards_of(list_id)?.1)).await
    }

    pub async fn list(&self, list_id: Uuid) -> Result<Option<List>, CacheError> {
        self.read(|p| Ok(p.list_entries.get(&list_id).cloned()))
            .await
    }

    pub async fn card(&self, card_id: Uuid) -> Result<Option<Card>, CacheError> {
        self.read(|p| Ok(p.card_entries.get(&card_id).cloned()))
            .await
    }

    pub async fn create_list(
        &self,
        name: &str,
        at_index: Option<i64>,
    ) -> Result<ListMutation, CacheError> {
        match self
            .mutate(Intent::CreateList {
                name: name.to_string(),
                at_index,
            })
            .await?
        {
            Outcome::List(mutation) => Ok(mutation),
            _ => Err(CacheError::UnexpectedResponse("create_list")),
        }
    }

    pub async fn reorder_list(&self, list_id: Uuid, to_index: i64) -> Result<ListMutation, CacheError> {
        match self.mutate(Intent::ReorderList { list_id, to_index }).await? {
            Outcome::List(mutation) => Ok(mutation),
            _ => Err(CacheError::UnexpectedResponse("reorder_list")),
        }
    }

    pub async fn delete_list(&self, list_id: Uuid) -> Result<DeleteAck, CacheError> {
        match self.mutate(Intent::DeleteList { list_id }).await? {
            Outcome::Deleted(ack) => Ok(ack),
            _ => Err(CacheError::UnexpectedResponse("delete_list")),
        }
    }

    pub async fn create_card(
        &self,
        list_id: Uuid,
        title: &str,
        at_index: Option<i64>,
    ) -> Result<CardMutation, CacheError> {
        match self
            .mutate(Intent::CreateCard {
                list_id,
                title: title.to_string(),
                at_index,
            })
            .await?
        {
            Outcome::Card(mutation) => Ok(mutation),
            _ => Err(CacheError::UnexpectedResponse("create_card")),
        }
    }

    pub async fn reorder_card(
        &self,
        card_id: Uuid,
        dest_list_id: Uuid,
        to_index: i64,
    ) -> Result<CardMutation, CacheError> {
        match self
            .mutate(Intent::ReorderCard {
                card_id,
                dest_list_id,
                to_index,
            })
            .await?
        {
            Outcome::Card(mutation) => Ok(mutation),
            _ => Err(CacheError::UnexpectedResponse("reorder_card")),
        }
    }

    pub async fn delete_card(&self, card_id: Uuid) -> Result<DeleteAck, CacheError> {
        match self.mutate(Intent::DeleteCard { card_id }).await? {
            Outcome::Deleted(ack) => Ok(ack),
            _ => Err(CacheError::UnexpectedResponse("delete_card")),
        }
    }

    async fn keys_for(&self, intent: &Intent) -> Result<Vec<ParentKey>, CacheError> {
        self.read(|p| p.keys_for(intent)).await
    }

    async fn mutate(&self, intent: Intent) -> Result<Outcome, CacheError> {
        // The keys depend on where the card is now, which can change while we
        // wait behind another mutation.
        let mut locked = None;
        for _ in 0..LOCK_ATTEMPTS {
            let keys = self.keys_for(&intent).await?;
            let guard = self.locks.acquire(keys.clone()).await;
            if self.keys_for(&intent).await? == keys {
                locked = Some((keys, guard));
                break;
            }
        }
        let Some((keys, _guard)) = locked else {
            return Err(BoardApiError::ConcurrentModification.into());
        };

        let mutation_id = Uuid::new_v4();
        self.push_record(MutationRecord {
            id: mutation_id,
            intent: intent.clone(),
            state: MutationState::Speculative,
            attempts: 0,
            error: None,
        });

        let mut retried = false;
        loop {
            let (request, saved) = {
                let mut guard = self.projection.write().await;
                let Some(projection) = guard.as_mut() else {
                    self.settle_rolled_back(mutation_id, "board is not loaded");
                    return Err(CacheError::NotLoaded);
                };
                let current = projection.keys_for(&intent);
                if current.as_ref() != Ok(&keys) {
                    drop(guard);
                    let err = current
                        .err()
                        .unwrap_or(CacheError::Api(BoardApiError::ConcurrentModification));
                    self.settle_rolled_back(mutation_id, &err.to_string());
                    return Err(err);
                }
                let saved = projection.save(&keys);
                match projection.splice(&intent) {
                    Ok(request) => (request, saved),
                    Err(e) => {
                        projection.restore(saved);
                        drop(guard);
                        self.settle_rolled_back(mutation_id, &e.to_string());
                        return Err(e);
                    }
                }
            };

            update_record(&self.records, mutation_id, |record| {
                record.state = MutationState::Pending;
                record.attempts += 1;
            });
            let in_flight = InFlight {
                mutation_id,
                stale: self.stale.clone(),
                records: self.records.clone(),
                armed: true,
            };
            let result = self.dispatch(request).await;

            match result {
                Ok(outcome) => {
                    let complete = {
                        let mut guard = self.projection.write().await;
                        match guard.as_mut() {
                            Some(projection) => projection.adopt(&intent, &outcome).unwrap_or(false),
                            None => false,
                        }
                    };
                    in_flight.disarm();
                    if !complete {
                        self.stale.store(true, Ordering::SeqCst);
                    }
                    update_record(&self.records, mutation_id, |record| {
                        record.state = MutationState::Committed;
                    });
                    info!(mutation_id = %mutation_id, operation = intent.name(), "Mutation committed");
                    let _ = self.events.send(CacheEvent::Committed { mutation_id });
                    return Ok(outcome);
                }
                Err(err) => {
                    if let Some(projection) = self.projection.write().await.as_mut() {
                        projection.restore(saved);
                    }
                    warn!(
                        mutation_id = %mutation_id,
                        operation = intent.name(),
                        error = %err,
                        "Mutation rejected; rolling back"
                    );
                    // Still armed: dropping us here must leave the board stale.
                    if let Err(e) = self.refetch().await {
                        warn!(error = %e, "Refetch after rollback failed");
                    }

                    if err == BoardApiError::ConcurrentModification && !retried {
                        retried = true;
                        in_flight.disarm();
                        continue;
                    }

                    self.settle_rolled_back(mutation_id, &err.to_string());
                    in_flight.disarm();
                    return Err(err.into());
                }
            }
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Outcome, BoardApiError> {
        Ok(match request {
            Request::CreateList { board, body } => {
                Outcome::List(self.api.create_list(&board, &body).await?)
            }
            Request::ReorderList { list, body } => {
                Outcome::List(self.api.reorder_list(&list, &body).await?)
            }
            Request::DeleteList { list } => Outcome::Deleted(self.api.delete_list(&list).await?),
            Request::CreateCard { list, body } => {
                Outcome::Card(self.api.create_card(&list, &body).await?)
            }
            Request::ReorderCard { card, body } => {
                Outcome::Card(self.api.reorder_card(&card, &body).await?)
            }
            Request::DeleteCard { card } => Outcome::Deleted(self.api.delete_card(&card).await?),
        })
    }

    fn push_record(&self, record: MutationRecord) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.len() == MAX_RECORDS {
            records.pop_front();
        }
        records.push_back(record);
    }

    fn settle_rolled_back(&self, mutation_id: Uuid, error: &str) {
        update_record(&self.records, mutation_id, |record| {
            record.state = MutationState::RolledBack;
            record.error = Some(error.to_string());
        });
        let _ = self.events.send(CacheEvent::RolledBack {
            mutation_id,
            error: error.to_string(),
        });
    }
}
