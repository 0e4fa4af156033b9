use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection};
use ts_rs::TS;
use uuid::Uuid;

/// A card inside a list. `index` is stored in the `position` column.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Card {
    pub id: Uuid,
    pub public_id: String,
    pub list_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    #[sqlx(rename = "position")]
    pub index: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[ts(optional)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[ts(optional)]
    pub deleted_by: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct CreateCard {
    pub title: String,
    #[ts(optional)]
    pub description: Option<String>,
    #[ts(optional)]
    pub at_index: Option<i64>,
}

/// Ordering is never touched by an update.
#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
pub struct UpdateCard {
    #[ts(optional)]
    pub title: Option<String>,
    #[ts(optional)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct MoveCard {
    /// Public id of the destination list; may be the card's own list.
    pub dest_list_id: String,
    pub to_index: i64,
    #[ts(optional)]
    pub expected_source_version: Option<i64>,
    #[ts(optional)]
    pub expected_dest_version: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct SetCardMembers {
    pub member_ids: Vec<Uuid>,
}

const CARD_COLUMNS: &str = "c.id, c.public_id, c.list_id, c.title, c.description, c.position, \
     c.created_at, c.updated_at, c.deleted_at, c.deleted_by";

const CARD_RETURNING: &str = "id, public_id, list_id, title, description, position, \
     created_at, updated_at, deleted_at, deleted_by";

pub struct CardRepository<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> CardRepository<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Live card whose list and board are live too.
    pub async fn find_by_public_id(&mut self, public_id: &str) -> Result<Option<Card>, sqlx::Error> {
        sqlx::query_as::<_, Card>(&format!(
            "SELECT {CARD_COLUMNS}
             FROM cards c
             JOIN lists l ON l.id = c.list_id
             JOIN boards b ON b.id = l.board_id
             WHERE c.public_id = $1
               AND c.deleted_at IS NULL
               AND l.deleted_at IS NULL
               AND b.deleted_at IS NULL"
        ))
        .bind(public_id)
        .fetch_optional(&mut *self.conn)
        .await
    }

    pub async fn find_by_id(&mut self, id: Uuid) -> Result<Option<Card>, sqlx::Error> {
        sqlx::query_as::<_, Card>(&format!(
            "SELECT {CARD_COLUMNS}
             FROM cards c
             WHERE c.id = $1 AND c.deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await
    }

    /// Live cards of a list in index order.
    pub async fn find_by_list(&mut self, list_id: Uuid) -> Result<Vec<Card>, sqlx::Error> {
        sqlx::query_as::<_, Card>(&format!(
            "SELECT {CARD_COLUMNS}
             FROM cards c
             WHERE c.list_id = $1 AND c.deleted_at IS NULL
             ORDER BY c.position ASC"
        ))
        .bind(list_id)
        .fetch_all(&mut *self.conn)
        .await
    }

    /// Live cards in every live list of a board, grouped by list then index.
    pub async fn find_by_board(&mut self, board_id: Uuid) -> Result<Vec<Card>, sqlx::Error> {
        sqlx::query_as::<_, Card>(&format!(
            "SELECT {CARD_COLUMNS}
             FROM cards c
             JOIN lists l ON l.id = c.list_id
             WHERE l.board_id = $1
               AND l.deleted_at IS NULL
               AND c.deleted_at IS NULL
             ORDER BY l.position ASC, c.position ASC"
        ))
        .bind(board_id)
        .fetch_all(&mut *self.conn)
        .await
    }

    /// `(id, index)` of every live card in the list, in index order.
    pub async fn live_positions(&mut self, list_id: Uuid) -> Result<Vec<(Uuid, i64)>, sqlx::Error> {
        sqlx::query_as::<_, (Uuid, i64)>(
            "SELECT id, position FROM cards
             WHERE list_id = $1 AND deleted_at IS NULL
             ORDER BY position ASC",
        )
        .bind(list_id)
        .fetch_all(&mut *self.conn)
        .await
    }

    /// Insert a card outside the live index range. See
    /// [`ListRepository::insert_parked`](super::list::ListRepository::insert_parked).
    pub async fn insert_parked(
        &mut self,
        id: Uuid,
        public_id: &str,
        list_id: Uuid,
        title: &str,
        description: Option<&str>,
        parked_position: i64,
    ) -> Result<(), sqlx::Error> {
        debug_assert!(parked_position < 0);
        sqlx::query(
            "INSERT INTO cards (id, public_id, list_id, title, description, position)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(id)
        .bind(public_id)
        .bind(list_id)
        .bind(title)
        .bind(description)
        .bind(parked_position)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    pub async fn update(
        &mut self,
        id: Uuid,
        title: &str,
        description: Option<&str>,
    ) -> Result<Option<Card>, sqlx::Error> {
        sqlx::query_as::<_, Card>(&format!(
            "UPDATE cards
             SET title = $2, description = $3, updated_at = datetime('now', 'subsec')
             WHERE id = $1 AND deleted_at IS NULL
             RETURNING {CARD_RETURNING}"
        ))
        .bind(id)
        .bind(title)
        .bind(description)
        .fetch_optional(&mut *self.conn)
        .await
    }

    /// Soft-delete every live card of a list. Used when the list itself goes;
    /// the cards keep their positions since the whole collection is retired.
    pub async fn soft_delete_by_list(
        &mut self,
        list_id: Uuid,
        deleted_by: Option<Uuid>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE cards
             SET deleted_at = datetime('now', 'subsec'),
                 deleted_by = $2,
                 updated_at = datetime('now', 'subsec')
             WHERE list_id = $1 AND deleted_at IS NULL",
        )
        .bind(list_id)
        .bind(deleted_by)
        .execute(&mut *self.conn)
        .await?;
        Ok(result.rows_affected())
    }

    /// Replace the member set of a card.
    pub async fn set_members(&mut self, card_id: Uuid, member_ids: &[Uuid]) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM card_members WHERE card_id = $1")
            .bind(card_id)
            .execute(&mut *self.conn)
            .await?;

        for member_id in member_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO card_members (card_id, member_id) VALUES ($1, $2)",
            )
            .bind(card_id)
            .bind(member_id)
            .execute(&mut *self.conn)
            .await?;
        }
        Ok(())
    }

    /// `(card_id, member_id)` for every live card on the board.
    pub async fn members_by_board(&mut self, board_id: Uuid) -> Result<Vec<(Uuid, Uuid)>, sqlx::Error> {
        sqlx::query_as::<_, (Uuid, Uuid)>(
            "SELECT cm.card_id, cm.member_id
             FROM card_members cm
             JOIN cards c ON c.id = cm.card_id
             JOIN lists l ON l.id = c.list_id
             WHERE l.board_id = $1
               AND c.deleted_at IS NULL
               AND l.deleted_at IS NULL
             ORDER BY cm.created_at ASC",
        )
        .bind(board_id)
        .fetch_all(&mut *self.conn)
        .await
    }

    pub async fn members_of(&mut self, card_id: Uuid) -> Result<Vec<Uuid>, sqlx::Error> {
        sqlx::query_scalar::<_, Uuid>(
            "SELECT member_id FROM card_members WHERE card_id = $1 ORDER BY created_at ASC",
        )
        .bind(card_id)
        .fetch_all(&mut *self.conn)
        .await
    }
}
