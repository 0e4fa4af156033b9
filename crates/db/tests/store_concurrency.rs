//! Integration tests for concurrent writers on the same parent collection.
//!
//! Every task runs the full load -> plan -> commit cycle under the parent
//! lock, as the service layer does. The lists must stay dense no matter how
//! the tasks interleave.

use std::str::FromStr;

use db::{
    ChangeSet, CollectionKind, ParentKey, RetryConfig, StoreError, TransactionalStore,
    models::{board::BoardRepository, list::ListRepository, new_public_id},
    positioning::{PositionedCollection, plan_insert, plan_move_within, plan_remove},
    with_retry,
};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use tempfile::TempDir;
use uuid::Uuid;

async fn setup_test_pool() -> (SqlitePool, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.db");

    let options =
        SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.to_string_lossy()))
            .expect("Invalid database URL")
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .expect("Failed to create pool");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    (pool, temp_dir)
}

async fn create_board(store: &TransactionalStore) -> Uuid {
    let mut conn = store.reader().await.unwrap();
    BoardRepository::new(&mut conn)
        .create(&new_public_id("brd"), "Board", &new_public_id("slug"), None)
        .await
        .unwrap()
        .id
}

async fn load(uow: &mut db::UnitOfWork, board_id: Uuid) -> (PositionedCollection, i64) {
    let version = BoardRepository::new(uow.conn())
        .lists_version(board_id)
        .await
        .unwrap()
        .unwrap();
    let rows = ListRepository::new(uow.conn())
        .live_positions(board_id)
        .await
        .unwrap();
    (PositionedCollection::from_indexed(board_id, rows).unwrap(), version)
}

async fn append_list(store: &TransactionalStore, board_id: Uuid) -> Result<Uuid, StoreError> {
    let mut uow = store.begin([ParentKey::Board(board_id)]).await?;
    let (lists, version) = load(&mut uow, board_id).await;

    let id = Uuid::new_v4();
    ListRepository::new(uow.conn())
        .insert_parked(id, &new_public_id("lst"), board_id, "list", -1 - lists.count())
        .await?;
    let plan = plan_insert(&lists, id, None)?;
    uow.apply(ChangeSet::new(CollectionKind::Lists, plan).expect_version(board_id, version))
        .await?;
    uow.commit().await?;
    Ok(id)
}

async fn assert_dense(store: &TransactionalStore, board_id: Uuid) -> Vec<Uuid> {
    let mut conn = store.reader().await.unwrap();
    let rows = ListRepository::new(&mut conn)
        .live_positions(board_id)
        .await
        .unwrap();
    let collection = PositionedCollection::from_indexed(board_id, rows)
        .expect("live list positions must be dense");
    collection.members().to_vec()
}

#[tokio::test]
async fn test_concurrent_appends_get_distinct_slots() {
    let (pool, _dir) = setup_test_pool().await;
    let store = TransactionalStore::new(pool);
    let board_id = create_board(&store).await;

    let mut tasks = Vec::new();
    for _ in 0..12 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            with_retry(&RetryConfig::default(), "append_list", || {
                append_list(&store, board_id)
            })
            .await
        }));
    }

    let mut created = Vec::new();
    for task in tasks {
        created.push(task.await.unwrap().unwrap());
    }

    let order = assert_dense(&store, board_id).await;
    assert_eq!(order.len(), 12);
    for id in created {
        assert!(order.contains(&id));
    }
}

#[tokio::test]
async fn test_concurrent_moves_and_removes_keep_density() {
    let (pool, _dir) = setup_test_pool().await;
    let store = TransactionalStore::new(pool);
    let board_id = create_board(&store).await;
    for _ in 0..8 {
        append_list(&store, board_id).await.unwrap();
    }

    let mut tasks = Vec::new();
    for worker in 0..8u64 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            with_retry(&RetryConfig::default(), "shuffle", || {
                let store = store.clone();
                async move {
                    let mut uow = store.begin([ParentKey::Board(board_id)]).await?;
                    let (lists, version) = load(&mut uow, board_id).await;
                    let len = lists.count();

                    let plan = if worker % 4 == 3 && len > 1 {
                        let at = (worker as i64) % len;
                        let id = lists.entity_at(at).unwrap();
                        plan_remove(&lists, id, at)?
                    } else {
                        let from = (worker as i64 * 3) % len;
                        let to = (worker as i64 * 5 + 1) % len;
                        let id = lists.entity_at(from).unwrap();
                        plan_move_within(&lists, id, from, to)?
                    };

                    uow.apply(
                        ChangeSet::new(CollectionKind::Lists, plan).expect_version(board_id, version),
                    )
                    .await?;
                    uow.commit().await
                }
            })
            .await
        }));
    }

    for task in tasks {
        task.await.unwrap().unwrap();
    }

    // Workers 3 and 7 removed one list each.
    assert_eq!(assert_dense(&store, board_id).await.len(), 6);
}

#[tokio::test]
async fn test_plan_from_stale_snapshot_is_rejected() {
    let (pool, _dir) = setup_test_pool().await;
    let store = TransactionalStore::new(pool);
    let board_id = create_board(&store).await;
    for _ in 0..3 {
        append_list(&store, board_id).await.unwrap();
    }

    // Snapshot read outside any lock.
    let mut conn = store.reader().await.unwrap();
    let version = BoardRepository::new(&mut conn)
        .lists_version(board_id)
        .await
        .unwrap()
        .unwrap();
    let rows = ListRepository::new(&mut conn)
        .live_positions(board_id)
        .await
        .unwrap();
    drop(conn);
    let snapshot = PositionedCollection::from_indexed(board_id, rows).unwrap();

    // Someone else commits first.
    append_list(&store, board_id).await.unwrap();

    let first = snapshot.entity_at(0).unwrap();
    let plan = plan_move_within(&snapshot, first, 0, 2).unwrap();
    let mut uow = store.begin([ParentKey::Board(board_id)]).await.unwrap();
    let err = uow
        .apply(ChangeSet::new(CollectionKind::Lists, plan).expect_version(board_id, version))
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::ConcurrentModification { .. }));
    drop(uow);
    assert_eq!(assert_dense(&store, board_id).await.len(), 4);
}
