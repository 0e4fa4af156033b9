use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection};
use ts_rs::TS;
use uuid::Uuid;

/// A board-scoped label for visual card categorization.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize, TS)]
pub struct Label {
    pub id: Uuid,
    pub board_id: Uuid,
    pub name: String,
    /// Hex color code (e.g., "#3b82f6")
    pub color: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Serialize, TS)]
pub struct CreateLabel {
    pub name: String,
    #[serde(default = "default_color")]
    pub color: String,
}

fn default_color() -> String {
    "#6b7280".to_string()
}

/// Replaces the label set of a card.
#[derive(Debug, Clone, Deserialize, Serialize, TS)]
pub struct SetCardLabels {
    pub label_ids: Vec<Uuid>,
}

pub struct LabelRepository<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> LabelRepository<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    pub async fn create(
        &mut self,
        board_id: Uuid,
        name: &str,
        color: &str,
    ) -> Result<Label, sqlx::Error> {
        sqlx::query_as::<_, Label>(
            "INSERT INTO labels (id, board_id, name, color)
             VALUES ($1, $2, $3, $4)
             RETURNING id, board_id, name, color, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(board_id)
        .bind(name)
        .bind(color)
        .fetch_one(&mut *self.conn)
        .await
    }

    pub async fn find_by_board(&mut self, board_id: Uuid) -> Result<Vec<Label>, sqlx::Error> {
        sqlx::query_as::<_, Label>(
            "SELECT id, board_id, name, color, created_at
             FROM labels
             WHERE board_id = $1
             ORDER BY name ASC",
        )
        .bind(board_id)
        .fetch_all(&mut *self.conn)
        .await
    }

    /// Labels among `label_ids` that belong to `board_id`.
    pub async fn count_on_board(&mut self, board_id: Uuid, label_ids: &[Uuid]) -> Result<usize, sqlx::Error> {
        let mut found = 0;
        for label_id in label_ids {
            let exists = sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS(SELECT 1 FROM labels WHERE id = $1 AND board_id = $2)",
            )
            .bind(label_id)
            .bind(board_id)
            .fetch_one(&mut *self.conn)
            .await?;
            found += exists as usize;
        }
        Ok(found)
    }

    pub async fn set_for_card(&mut self, card_id: Uuid, label_ids: &[Uuid]) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM card_labels WHERE card_id = $1")
            .bind(card_id)
            .execute(&mut *self.conn)
            .await?;

        for label_id in label_ids {
            sqlx::query("INSERT OR IGNORE INTO card_labels (card_id, label_id) VALUES ($1, $2)")
                .bind(card_id)
                .bind(label_id)
                .execute(&mut *self.conn)
                .await?;
        }
        Ok(())
    }

    pub async fn find_for_card(&mut self, card_id: Uuid) -> Result<Vec<Label>, sqlx::Error> {
        sqlx::query_as::<_, Label>(
            "SELECT l.id, l.board_id, l.name, l.color, l.created_at
             FROM labels l
             JOIN card_labels cl ON cl.label_id = l.id
             WHERE cl.card_id = $1
             ORDER BY l.name ASC",
        )
        .bind(card_id)
        .fetch_all(&mut *self.conn)
        .await
    }

    /// `(card_id, label_id)` pairs for every live card on the board.
    pub async fn card_links_by_board(&mut self, board_id: Uuid) -> Result<Vec<(Uuid, Uuid)>, sqlx::Error> {
        sqlx::query_as::<_, (Uuid, Uuid)>(
            "SELECT cl.card_id, cl.label_id
             FROM card_labels cl
             JOIN cards c ON c.id = cl.card_id
             JOIN lists l ON l.id = c.list_id
             WHERE l.board_id = $1
               AND c.deleted_at IS NULL
               AND l.deleted_at IS NULL",
        )
        .bind(board_id)
        .fetch_all(&mut *self.conn)
        .await
    }
}
