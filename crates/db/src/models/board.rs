use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection};
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Board {
    pub id: Uuid,
    pub public_id: String,
    pub name: String,
    pub slug: String,
    /// Bumped on every committed change to the board's list order.
    pub lists_version: i64,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[ts(optional)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[ts(optional)]
    pub deleted_by: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize, TS)]
pub struct CreateBoard {
    pub name: String,
}

/// Lowercase ASCII slug: alphanumerics kept, every other run collapsed to `-`.
///
/// ```
/// use db::models::board::slugify;
///
/// assert_eq!(slugify("  Q3 Roadmap / Infra "), "q3-roadmap-infra");
/// assert_eq!(slugify("!!!"), "board");
/// ```
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;

    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }

    if slug.is_empty() {
        slug.push_str("board");
    }
    slug
}

const BOARD_COLUMNS: &str = "id, public_id, name, slug, lists_version, created_by, \
     created_at, updated_at, deleted_at, deleted_by";

pub struct BoardRepository<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> BoardRepository<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    pub async fn create(
        &mut self,
        public_id: &str,
        name: &str,
        slug: &str,
        created_by: Option<Uuid>,
    ) -> Result<Board, sqlx::Error> {
        let id = Uuid::new_v4();
        sqlx::query_as::<_, Board>(&format!(
            "INSERT INTO boards (id, public_id, name, slug, created_by)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {BOARD_COLUMNS}"
        ))
        .bind(id)
        .bind(public_id)
        .bind(name)
        .bind(slug)
        .bind(created_by)
        .fetch_one(&mut *self.conn)
        .await
    }

    /// Live board by public id.
    pub async fn find_by_public_id(&mut self, public_id: &str) -> Result<Option<Board>, sqlx::Error> {
        sqlx::query_as::<_, Board>(&format!(
            "SELECT {BOARD_COLUMNS} FROM boards
             WHERE public_id = $1 AND deleted_at IS NULL"
        ))
        .bind(public_id)
        .fetch_optional(&mut *self.conn)
        .await
    }

    pub async fn find_by_id(&mut self, id: Uuid) -> Result<Option<Board>, sqlx::Error> {
        sqlx::query_as::<_, Board>(&format!(
            "SELECT {BOARD_COLUMNS} FROM boards
             WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await
    }

    pub async fn find_all(&mut self) -> Result<Vec<Board>, sqlx::Error> {
        sqlx::query_as::<_, Board>(&format!(
            "SELECT {BOARD_COLUMNS} FROM boards
             WHERE deleted_at IS NULL
             ORDER BY created_at ASC, slug ASC"
        ))
        .fetch_all(&mut *self.conn)
        .await
    }

    /// Slugs stay reserved after a soft delete.
    pub async fn slug_exists(&mut self, slug: &str) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM boards WHERE slug = $1)")
            .bind(slug)
            .fetch_one(&mut *self.conn)
            .await
    }

    /// Current list-order version of a live board.
    pub async fn lists_version(&mut self, id: Uuid) -> Result<Option<i64>, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            "SELECT lists_version FROM boards WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await
    }

    /// Hard delete. Lists, cards, labels and activity go with it.
    pub async fn destroy(&mut self, id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM boards WHERE id = $1")
            .bind(id)
            .execute(&mut *self.conn)
            .await?;
        Ok(result.rows_affected())
    }
}
