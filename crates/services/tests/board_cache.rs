//! Optimistic projection behaviour of `BoardCache` over an in-process API.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use db::{
    models::{
        board::CreateBoard,
        card::{CreateCard, MoveCard},
        list::{CreateList, MoveList},
    },
    test_utils::create_test_store,
};
use services::services::{
    board_api::{BoardApi, BoardApiError, LocalBoardApi},
    board_cache::{BoardCache, CacheError, CacheEvent, MutationRecord, MutationState},
    reorder::{BoardSnapshot, CardMutation, DeleteAck, ListMutation, ReorderService},
};
use tempfile::TempDir;
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Wraps the local API with injected failures and optional gates that hold
/// every mutation, or every snapshot, until a permit is released.
struct ScriptedApi {
    inner: LocalBoardApi,
    failures: Mutex<VecDeque<BoardApiError>>,
    gate: Option<Arc<Semaphore>>,
    snapshot_gate: Option<Arc<Semaphore>>,
    snapshots_started: AtomicUsize,
}

impl ScriptedApi {
    fn new(inner: LocalBoardApi) -> Self {
        Self {
            inner,
            failures: Mutex::new(VecDeque::new()),
            gate: None,
            snapshot_gate: None,
            snapshots_started: AtomicUsize::new(0),
        }
    }

    fn snapshot_gated(inner: LocalBoardApi, gate: Arc<Semaphore>) -> Self {
        Self {
            snapshot_gate: Some(gate),
            ..Self::new(inner)
        }
    }

    fn snapshots_started(&self) -> usize {
        self.snapshots_started.load(Ordering::SeqCst)
    }

    fn gated(inner: LocalBoardApi, gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(inner)
        }
    }

    fn fail_next(&self, err: BoardApiError) {
        self.failures.lock().unwrap().push_back(err);
    }

    async fn before_mutation(&self) -> Result<(), BoardApiError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        match self.failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BoardApi for ScriptedApi {
    async fn snapshot(&self, board: &str) -> Result<BoardSnapshot, BoardApiError> {
        self.snapshots_started.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.snapshot_gate {
            gate.acquire().await.unwrap().forget();
        }
        self.inner.snapshot(board).await
    }

    async fn create_list(&self, board: &str, req: &CreateList) -> Result<ListMutation, BoardApiError> {
        self.before_mutation().await?;
        self.inner.create_list(board, req).await
    }

    async fn reorder_list(&self, list: &str, req: &MoveList) -> Result<ListMutation, BoardApiError> {
        self.before_mutation().await?;
        self.inner.reorder_list(list, req).await
    }

    async fn delete_list(&self, list: &str) -> Result<DeleteAck, BoardApiError> {
        self.before_mutation().await?;
        self.inner.delete_list(list).await
    }

    async fn create_card(&self, list: &str, req: &CreateCard) -> Result<CardMutation, BoardApiError> {
        self.before_mutation().await?;
        self.inner.create_card(list, req).await
    }

    async fn reorder_card(&self, card: &str, req: &MoveCard) -> Result<CardMutation, BoardApiError> {
        self.before_mutation().await?;
        self.inner.reorder_card(card, req).await
    }

    async fn delete_card(&self, card: &str) -> Result<DeleteAck, BoardApiError> {
        self.before_mutation().await?;
        self.inner.delete_card(card).await
    }
}

/// A board with lists `A` and `B`; `A` holds three cards, `B` one.
struct Fixture {
    service: ReorderService,
    board: String,
    lists: Vec<(Uuid, String)>,
    cards: Vec<(Uuid, String)>,
    _dir: TempDir,
}

impl Fixture {
    async fn new() -> Self {
        let (store, dir) = create_test_store().await;
        let service = ReorderService::new(store);
        let board = service
            .create_board(&CreateBoard { name: "Sprint".into() }, None)
            .await
            .unwrap()
            .public_id;

        let mut lists = Vec::new();
        for name in ["A", "B"] {
            let created = service
                .create_list(
                    &board,
                    &CreateList {
                        name: name.into(),
                        at_index: None,
                    },
                    None,
                )
                .await
                .unwrap();
            lists.push((created.list.id, created.list.public_id));
        }

        let mut cards = Vec::new();
        for (list, title) in [(0, "a1"), (0, "a2"), (0, "a3"), (1, "b1")] {
            let created = service
                .create_card(
                    &lists[list].1,
                    &CreateCard {
                        title: title.into(),
                        description: None,
                        at_index: None,
                    },
                    None,
                )
                .await
                .unwrap();
            cards.push((created.card.id, created.card.public_id));
        }

        Self {
            service,
            board,
            lists,
            cards,
            _dir: dir,
        }
    }

    fn api(&self) -> LocalBoardApi {
        LocalBoardApi::new(self.service.clone(), Some(Uuid::new_v4()))
    }

    fn list(&self, i: usize) -> Uuid {
        self.lists[i].0
    }

    fn card(&self, i: usize) -> Uuid {
        self.cards[i].0
    }

    async fn server_cards(&self, list: usize) -> Vec<Uuid> {
        self.service
            .list_cards(&self.lists[list].1)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect()
    }
}

async fn wait_for_state(cache: &BoardCache, state: MutationState, count: usize) -> Vec<MutationRecord> {
    for _ in 0..400 {
        let records = cache.mutations();
        if records.iter().filter(|r| r.state == state).count() >= count {
            return records;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {count} {state:?} mutation(s)");
}

#[tokio::test]
async fn test_committed_move_adopts_server_state() {
    let fx = Fixture::new().await;
    let cache = BoardCache::load(Arc::new(fx.api()), &fx.board).await.unwrap();
    let mut events = cache.subscribe();

    let moved = cache.reorder_card(fx.card(0), fx.list(0), 2).await.unwrap();

    let expected = vec![fx.card(1), fx.card(2), fx.card(0)];
    assert_eq!(cache.card_order(fx.list(0)).await.unwrap(), expected);
    assert_eq!(fx.server_cards(0).await, expected);
    assert_eq!(
        cache.cards_version(fx.list(0)).await.unwrap(),
        moved.dest.version
    );
    assert!(!cache.is_stale());

    let records = cache.mutations();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, MutationState::Committed);
    assert_eq!(records[0].attempts, 1);
    assert_eq!(
        events.recv().await.unwrap(),
        CacheEvent::Committed {
            mutation_id: records[0].id
        }
    );
}

#[tokio::test]
async fn test_cross_list_move_updates_both_projections() {
    let fx = Fixture::new().await;
    let cache = BoardCache::load(Arc::new(fx.api()), &fx.board).await.unwrap();

    cache.reorder_card(fx.card(0), fx.list(1), 0).await.unwrap();

    assert_eq!(
        cache.card_order(fx.list(0)).await.unwrap(),
        vec![fx.card(1), fx.card(2)]
    );
    assert_eq!(
        cache.card_order(fx.list(1)).await.unwrap(),
        vec![fx.card(0), fx.card(3)]
    );
    let card = cache.card(fx.card(0)).await.unwrap().unwrap();
    assert_eq!(card.list_id, fx.list(1));
    assert_eq!(card.index, 0);
}

#[tokio::test]
async fn test_created_entities_replace_placeholders() {
    let fx = Fixture::new().await;
    let cache = BoardCache::load(Arc::new(fx.api()), &fx.board).await.unwrap();

    let card = cache.create_card(fx.list(1), "b0", Some(0)).await.unwrap();
    assert_eq!(
        cache.card_order(fx.list(1)).await.unwrap(),
        vec![card.card.id, fx.card(3)]
    );
    assert!(cache.card(card.card.id).await.unwrap().is_some());

    let list = cache.create_list("C", None).await.unwrap();
    assert_eq!(
        cache.list_order().await.unwrap(),
        vec![fx.list(0), fx.list(1), list.list.id]
    );
    assert_eq!(cache.card_order(list.list.id).await.unwrap(), Vec::<Uuid>::new());
}

#[tokio::test]
async fn test_deletes_close_gaps_locally() {
    let fx = Fixture::new().await;
    let cache = BoardCache::load(Arc::new(fx.api()), &fx.board).await.unwrap();

    cache.delete_card(fx.card(1)).await.unwrap();
    assert_eq!(
        cache.card_order(fx.list(0)).await.unwrap(),
        vec![fx.card(0), fx.card(2)]
    );
    assert!(cache.card(fx.card(1)).await.unwrap().is_none());

    cache.delete_list(fx.list(0)).await.unwrap();
    assert_eq!(cache.list_order().await.unwrap(), vec![fx.list(1)]);
    assert!(matches!(
        cache.card_order(fx.list(0)).await,
        Err(CacheError::UnknownList(_))
    ));
}

#[tokio::test]
async fn test_rejected_mutation_rolls_back() {
    let fx = Fixture::new().await;
    let api = Arc::new(ScriptedApi::new(fx.api()));
    let cache = BoardCache::load(api.clone(), &fx.board).await.unwrap();
    let original = cache.list_order().await.unwrap();

    for err in [
        BoardApiError::NotFound("list".into()),
        BoardApiError::InvalidIndex("out of range".into()),
        BoardApiError::Transport("connection reset".into()),
    ] {
        api.fail_next(err.clone());
        let result = cache.reorder_list(fx.list(0), 1).await;
        assert_eq!(result.unwrap_err(), CacheError::Api(err));
        assert_eq!(cache.list_order().await.unwrap(), original);
    }

    let records = cache.mutations();
    assert_eq!(records.len(), 3);
    assert!(
        records
            .iter()
            .all(|r| r.state == MutationState::RolledBack && r.error.is_some())
    );
    assert!(!cache.is_stale());
}

#[tokio::test]
async fn test_stale_version_is_retried_once_against_fresh_state() {
    let fx = Fixture::new().await;
    let cache = BoardCache::load(Arc::new(fx.api()), &fx.board).await.unwrap();

    // Another actor appends to list A behind the cache's back.
    let other = fx
        .service
        .create_card(
            &fx.lists[0].1,
            &CreateCard {
                title: "a4".into(),
                description: None,
                at_index: None,
            },
            None,
        )
        .await
        .unwrap();

    cache.reorder_card(fx.card(0), fx.list(0), 2).await.unwrap();

    let expected = vec![fx.card(1), fx.card(2), fx.card(0), other.card.id];
    assert_eq!(fx.server_cards(0).await, expected);
    assert_eq!(cache.card_order(fx.list(0)).await.unwrap(), expected);

    let records = cache.mutations();
    assert_eq!(records[0].state, MutationState::Committed);
    assert_eq!(records[0].attempts, 2);
}

#[tokio::test]
async fn test_second_conflict_is_surfaced() {
    let fx = Fixture::new().await;
    let api = Arc::new(ScriptedApi::new(fx.api()));
    let cache = BoardCache::load(api.clone(), &fx.board).await.unwrap();
    api.fail_next(BoardApiError::ConcurrentModification);
    api.fail_next(BoardApiError::ConcurrentModification);

    let err = cache
        .reorder_card(fx.card(0), fx.list(1), 1)
        .await
        .unwrap_err();

    assert_eq!(err, CacheError::Api(BoardApiError::ConcurrentModification));
    let records = cache.mutations();
    assert_eq!(records[0].state, MutationState::RolledBack);
    assert_eq!(records[0].attempts, 2);
    assert_eq!(
        cache.card_order(fx.list(0)).await.unwrap(),
        fx.server_cards(0).await
    );
}

#[tokio::test]
async fn test_out_of_range_index_never_reaches_the_server() {
    let fx = Fixture::new().await;
    let cache = BoardCache::load(Arc::new(fx.api()), &fx.board).await.unwrap();

    let err = cache.reorder_list(fx.list(0), 5).await.unwrap_err();
    assert!(matches!(err, CacheError::Plan(_)));
    assert_eq!(
        cache.list_order().await.unwrap(),
        vec![fx.list(0), fx.list(1)]
    );
    assert_eq!(cache.mutations()[0].state, MutationState::RolledBack);
    assert_eq!(cache.mutations()[0].attempts, 0);
}

#[tokio::test]
async fn test_pending_mutation_is_visible_before_commit() {
    let fx = Fixture::new().await;
    let gate = Arc::new(Semaphore::new(0));
    let api = Arc::new(ScriptedApi::gated(fx.api(), gate.clone()));
    let cache = BoardCache::load(api, &fx.board).await.unwrap();

    let task = {
        let cache = cache.clone();
        let list = fx.list(0);
        tokio::spawn(async move { cache.reorder_list(list, 1).await })
    };
    wait_for_state(&cache, MutationState::Pending, 1).await;

    assert_eq!(
        cache.list_order().await.unwrap(),
        vec![fx.list(1), fx.list(0)]
    );
    assert_eq!(fx.service.board_snapshot(&fx.board).await.unwrap().lists[0].list.id, fx.list(0));

    gate.add_permits(1);
    task.await.unwrap().unwrap();
    assert_eq!(cache.mutations()[0].state, MutationState::Committed);
}

#[tokio::test]
async fn test_abandoned_mutation_forces_refetch() {
    let fx = Fixture::new().await;
    let gate = Arc::new(Semaphore::new(0));
    let api = Arc::new(ScriptedApi::gated(fx.api(), gate));
    let cache = BoardCache::load(api, &fx.board).await.unwrap();

    let task = {
        let cache = cache.clone();
        let card = fx.card(0);
        let list = fx.list(1);
        tokio::spawn(async move { cache.reorder_card(card, list, 0).await })
    };
    wait_for_state(&cache, MutationState::Pending, 1).await;
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    assert!(cache.is_stale());
    let records = cache.mutations();
    assert_eq!(records[0].state, MutationState::RolledBack);
    assert_eq!(records[0].error.as_deref(), Some("abandoned"));

    // The next read discards the speculative splice.
    assert_eq!(
        cache.card_order(fx.list(0)).await.unwrap(),
        vec![fx.card(0), fx.card(1), fx.card(2)]
    );
    assert!(!cache.is_stale());
}

#[tokio::test]
async fn test_mutations_on_one_collection_run_one_at_a_time() {
    let fx = Fixture::new().await;
    let gate = Arc::new(Semaphore::new(0));
    let api = Arc::new(ScriptedApi::gated(fx.api(), gate.clone()));
    let cache = BoardCache::load(api, &fx.board).await.unwrap();

    let first = {
        let cache = cache.clone();
        let (card, list) = (fx.card(0), fx.list(0));
        tokio::spawn(async move { cache.reorder_card(card, list, 2).await })
    };
    wait_for_state(&cache, MutationState::Pending, 1).await;

    let second = {
        let cache = cache.clone();
        let (card, list) = (fx.card(1), fx.list(0));
        tokio::spawn(async move { cache.reorder_card(card, list, 2).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cache.mutations().len(), 1, "second mutation must wait");

    gate.add_permits(2);
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    let records = cache.mutations();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.state == MutationState::Committed && r.attempts == 1));

    let expected = vec![fx.card(2), fx.card(0), fx.card(1)];
    assert_eq!(fx.server_cards(0).await, expected);
    assert_eq!(cache.card_order(fx.list(0)).await.unwrap(), expected);
}

#[tokio::test]
async fn test_other_collections_are_not_blocked() {
    let fx = Fixture::new().await;
    let gate = Arc::new(Semaphore::new(0));
    let api = Arc::new(ScriptedApi::gated(fx.api(), gate.clone()));
    let cache = BoardCache::load(api, &fx.board).await.unwrap();

    let first = {
        let cache = cache.clone();
        let (card, list) = (fx.card(0), fx.list(0));
        tokio::spawn(async move { cache.reorder_card(card, list, 2).await })
    };
    wait_for_state(&cache, MutationState::Pending, 1).await;

    let second = {
        let cache = cache.clone();
        let list = fx.list(1);
        tokio::spawn(async move { cache.create_card(list, "b2", None).await })
    };
    wait_for_state(&cache, MutationState::Pending, 2).await;

    gate.add_permits(2);
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert_eq!(cache.card_order(fx.list(1)).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_cancelled_first_read_leaves_cache_stale() {
    let fx = Fixture::new().await;
    let gate = Arc::new(Semaphore::new(0));
    let api = Arc::new(ScriptedApi::snapshot_gated(fx.api(), gate.clone()));
    let cache = BoardCache::new(api, &fx.board);

    let first = tokio::time::timeout(Duration::from_millis(50), cache.list_order()).await;
    assert!(first.is_err());
    assert!(cache.is_stale());

    gate.add_permits(1);
    assert_eq!(
        cache.list_order().await.unwrap(),
        vec![fx.list(0), fx.list(1)]
    );
    assert!(!cache.is_stale());
}

#[tokio::test]
async fn test_abandoned_rollback_refetch_settles_the_mutation() {
    let fx = Fixture::new().await;
    let gate = Arc::new(Semaphore::new(1));
    let api = Arc::new(ScriptedApi::snapshot_gated(fx.api(), gate.clone()));
    let cache = BoardCache::load(api.clone(), &fx.board).await.unwrap();
    api.fail_next(BoardApiError::InvalidIndex("out of range".into()));

    let task = {
        let cache = cache.clone();
        let (card, list) = (fx.card(0), fx.list(1));
        tokio::spawn(async move { cache.reorder_card(card, list, 0).await })
    };
    // The rejected move is now blocked in its rollback refetch.
    for _ in 0..400 {
        if api.snapshots_started() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(api.snapshots_started(), 2);
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    assert!(cache.is_stale());
    let records = cache.mutations();
    assert_eq!(records[0].state, MutationState::RolledBack);
    assert_eq!(records[0].error.as_deref(), Some("abandoned"));

    gate.add_permits(1);
    assert_eq!(
        cache.card_order(fx.list(0)).await.unwrap(),
        vec![fx.card(0), fx.card(1), fx.card(2)]
    );
    assert!(!cache.is_stale());
}
