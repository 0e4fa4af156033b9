use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection};
use ts_rs::TS;
use uuid::Uuid;

/// A column on a board.
///
/// `index` is the list's dense position among the board's live lists. It is
/// stored in the `position` column.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct List {
    pub id: Uuid,
    pub public_id: String,
    pub board_id: Uuid,
    pub name: String,
    #[sqlx(rename = "position")]
    pub index: i64,
    /// Bumped on every committed change to the list's card order.
    pub cards_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[ts(optional)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[ts(optional)]
    pub deleted_by: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct CreateList {
    pub name: String,
    #[ts(optional)]
    pub at_index: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct RenameList {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct MoveList {
    pub to_index: i64,
    #[ts(optional)]
    pub expected_version: Option<i64>,
}

const LIST_COLUMNS: &str = "l.id, l.public_id, l.board_id, l.name, l.position, l.cards_version, \
     l.created_at, l.updated_at, l.deleted_at, l.deleted_by";

const LIST_RETURNING: &str = "id, public_id, board_id, name, position, cards_version, \
     created_at, updated_at, deleted_at, deleted_by";

pub struct ListRepository<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> ListRepository<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Live list on a live board, by public id.
    pub async fn find_by_public_id(&mut self, public_id: &str) -> Result<Option<List>, sqlx::Error> {
        sqlx::query_as::<_, List>(&format!(
            "SELECT {LIST_COLUMNS}
             FROM lists l
             JOIN boards b ON b.id = l.board_id
             WHERE l.public_id = $1
               AND l.deleted_at IS NULL
               AND b.deleted_at IS NULL"
        ))
        .bind(public_id)
        .fetch_optional(&mut *self.conn)
        .await
    }

    pub async fn find_by_id(&mut self, id: Uuid) -> Result<Option<List>, sqlx::Error> {
        sqlx::query_as::<_, List>(&format!(
            "SELECT {LIST_COLUMNS}
             FROM lists l
             JOIN boards b ON b.id = l.board_id
             WHERE l.id = $1
               AND l.deleted_at IS NULL
               AND b.deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await
    }

    /// Live lists of a board in index order.
    pub async fn find_by_board(&mut self, board_id: Uuid) -> Result<Vec<List>, sqlx::Error> {
        sqlx::query_as::<_, List>(&format!(
            "SELECT {LIST_COLUMNS}
             FROM lists l
             WHERE l.board_id = $1 AND l.deleted_at IS NULL
             ORDER BY l.position ASC"
        ))
        .bind(board_id)
        .fetch_all(&mut *self.conn)
        .await
    }

    /// `(id, index)` of every live list on the board, in index order.
    pub async fn live_positions(&mut self, board_id: Uuid) -> Result<Vec<(Uuid, i64)>, sqlx::Error> {
        sqlx::query_as::<_, (Uuid, i64)>(
            "SELECT id, position FROM lists
             WHERE board_id = $1 AND deleted_at IS NULL
             ORDER BY position ASC",
        )
        .bind(board_id)
        .fetch_all(&mut *self.conn)
        .await
    }

    /// Current card-order version of a live list.
    pub async fn cards_version(&mut self, id: Uuid) -> Result<Option<i64>, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            "SELECT cards_version FROM lists WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await
    }

    /// Insert a list outside the live index range.
    ///
    /// `parked_position` must be negative; the store moves the row to its
    /// real index when the insert plan is applied.
    pub async fn insert_parked(
        &mut self,
        id: Uuid,
        public_id: &str,
        board_id: Uuid,
        name: &str,
        parked_position: i64,
    ) -> Result<(), sqlx::Error> {
        debug_assert!(parked_position < 0);
        sqlx::query(
            "INSERT INTO lists (id, public_id, board_id, name, position)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(id)
        .bind(public_id)
        .bind(board_id)
        .bind(name)
        .bind(parked_position)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    pub async fn rename(&mut self, id: Uuid, name: &str) -> Result<Option<List>, sqlx::Error> {
        sqlx::query_as::<_, List>(&format!(
            "UPDATE lists
             SET name = $2, updated_at = datetime('now', 'subsec')
             WHERE id = $1 AND deleted_at IS NULL
             RETURNING {LIST_RETURNING}"
        ))
        .bind(id)
        .bind(name)
        .fetch_optional(&mut *self.conn)
        .await
    }
}
