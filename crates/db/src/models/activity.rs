use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, SqliteConnection};
use strum_macros::{AsRefStr, Display, EnumString};
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS, EnumString, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityType {
    Board,
    List,
    Card,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS, EnumString, Display, AsRefStr)]
pub enum ActivityKind {
    #[serde(rename = "board.created")]
    #[strum(serialize = "board.created")]
    BoardCreated,
    #[serde(rename = "list.created")]
    #[strum(serialize = "list.created")]
    ListCreated,
    #[serde(rename = "list.renamed")]
    #[strum(serialize = "list.renamed")]
    ListRenamed,
    #[serde(rename = "list.moved")]
    #[strum(serialize = "list.moved")]
    ListMoved,
    #[serde(rename = "list.deleted")]
    #[strum(serialize = "list.deleted")]
    ListDeleted,
    #[serde(rename = "card.created")]
    #[strum(serialize = "card.created")]
    CardCreated,
    #[serde(rename = "card.updated")]
    #[strum(serialize = "card.updated")]
    CardUpdated,
    #[serde(rename = "card.moved")]
    #[strum(serialize = "card.moved")]
    CardMoved,
    #[serde(rename = "card.deleted")]
    #[strum(serialize = "card.deleted")]
    CardDeleted,
}

/// An audit record waiting to be written alongside the change it describes.
#[derive(Debug, Clone)]
pub struct NewActivity {
    pub board_id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub kind: ActivityKind,
    pub actor_id: Option<Uuid>,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

impl NewActivity {
    pub fn new(board_id: Uuid, entity_type: EntityType, entity_id: Uuid, kind: ActivityKind) -> Self {
        Self {
            board_id,
            entity_type,
            entity_id,
            kind,
            actor_id: None,
            before: None,
            after: None,
        }
    }

    pub fn actor(mut self, actor_id: Option<Uuid>) -> Self {
        self.actor_id = actor_id;
        self
    }

    pub fn before(mut self, value: Value) -> Self {
        self.before = Some(value);
        self
    }

    pub fn after(mut self, value: Value) -> Self {
        self.after = Some(value);
        self
    }

    fn payload(&self) -> Value {
        serde_json::json!({
            "before": self.before,
            "after": self.after,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct ActivityEvent {
    pub seq: i64,
    pub event_id: Uuid,
    pub board_id: Uuid,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub event_type: String,
    #[ts(optional)]
    pub actor_id: Option<Uuid>,
    #[ts(type = "unknown")]
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct ActivityRow {
    seq: i64,
    event_id: Uuid,
    board_id: Uuid,
    entity_type: String,
    entity_id: Uuid,
    event_type: String,
    actor_id: Option<Uuid>,
    payload: String,
    created_at: DateTime<Utc>,
}

impl ActivityRow {
    fn into_event(self) -> ActivityEvent {
        let payload = serde_json::from_str(&self.payload).unwrap_or(Value::Null);
        ActivityEvent {
            seq: self.seq,
            event_id: self.event_id,
            board_id: self.board_id,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            event_type: self.event_type,
            actor_id: self.actor_id,
            payload,
            created_at: self.created_at,
        }
    }
}

pub struct ActivityRepository<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> ActivityRepository<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Append an event. Returns its sequence number.
    pub async fn insert(&mut self, activity: &NewActivity) -> Result<i64, sqlx::Error> {
        let payload = activity.payload().to_string();
        sqlx::query_scalar::<_, i64>(
            "INSERT INTO activity
                 (event_id, board_id, entity_type, entity_id, event_type, actor_id, payload)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING seq",
        )
        .bind(Uuid::new_v4())
        .bind(activity.board_id)
        .bind(activity.entity_type.as_ref())
        .bind(activity.entity_id)
        .bind(activity.kind.as_ref())
        .bind(activity.actor_id)
        .bind(payload)
        .fetch_one(&mut *self.conn)
        .await
    }

    pub async fn fetch_since(
        &mut self,
        board_id: Uuid,
        after_seq: Option<i64>,
        limit: i64,
    ) -> Result<Vec<ActivityEvent>, sqlx::Error> {
        let rows = sqlx::query_as::<_, ActivityRow>(
            "SELECT seq, event_id, board_id, entity_type, entity_id, event_type,
                    actor_id, payload, created_at
             FROM activity
             WHERE board_id = $1
               AND ($2 IS NULL OR seq > $2)
             ORDER BY seq ASC
             LIMIT $3",
        )
        .bind(board_id)
        .bind(after_seq)
        .bind(limit)
        .fetch_all(&mut *self.conn)
        .await?;

        Ok(rows.into_iter().map(ActivityRow::into_event).collect())
    }
}
