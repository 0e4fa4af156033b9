pub mod error;
pub mod extract;
pub mod file_logging;
pub mod middleware;
pub mod routes;

use db::{DBService, RetryConfig, TransactionalStore};
use services::services::reorder::ReorderService;
use sqlx::SqlitePool;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    db: DBService,
    reorder: ReorderService,
}

impl AppState {
    /// Retry tuning comes from `TB_RETRY_*`.
    pub fn new(db: DBService) -> Self {
        let reorder = ReorderService::new(db.store()).with_retry_config(RetryConfig::from_env());
        Self { db, reorder }
    }

    /// State over an existing store, as the route tests build it.
    pub fn from_store(store: TransactionalStore) -> Self {
        let db = DBService {
            pool: store.pool().clone(),
        };
        Self {
            db,
            reorder: ReorderService::new(store),
        }
    }

    pub fn reorder(&self) -> &ReorderService {
        &self.reorder
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db.pool
    }
}
