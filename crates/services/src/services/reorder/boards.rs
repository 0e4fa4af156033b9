use std::collections::HashMap;

use db::{
    ParentKey, with_retry,
    models::{
        activity::{ActivityEvent, ActivityKind, ActivityRepository, EntityType, NewActivity},
        board::{Board, BoardRepository, CreateBoard, slugify},
        card::CardRepository,
        label::{CreateLabel, Label, LabelRepository},
        list::ListRepository,
        new_public_id,
    },
    validation::{validate_color, validate_name},
};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    BoardSnapshot, CardView, DEFAULT_ACTIVITY_LIMIT, EntityKind, ListView, MAX_ACTIVITY_LIMIT,
    ReorderError, ReorderService,
};

/// Slug collisions tolerated on insert before giving up.
const SLUG_ATTEMPTS: usize = 16;

impl ReorderService {
    pub async fn create_board(
        &self,
        req: &CreateBoard,
        actor_id: Option<Uuid>,
    ) -> Result<Board, ReorderError> {
        validate_name(&req.name)?;
        with_retry(&self.retry, "create_board", || {
            self.create_board_once(&req.name, actor_id)
        })
        .await
    }

    async fn create_board_once(
        &self,
        name: &str,
        actor_id: Option<Uuid>,
    ) -> Result<Board, ReorderError> {
        let base = slugify(name);
        let mut uow = self.store.begin_unlocked().await?;

        let mut slug = base.clone();
        let mut suffix = 1;
        while BoardRepository::new(uow.conn()).slug_exists(&slug).await? {
            suffix += 1;
            slug = format!("{base}-{suffix}");
        }

        // Another writer can take the slug between the check and the insert.
        let mut taken = 0;
        let board = loop {
            match BoardRepository::new(uow.conn())
                .create(&new_public_id("brd"), name, &slug, actor_id)
                .await
            {
                Ok(board) => break board,
                Err(sqlx::Error::Database(e))
                    if e.is_unique_violation() && taken < SLUG_ATTEMPTS =>
                {
                    taken += 1;
                    suffix += 1;
                    slug = format!("{base}-{suffix}");
                    debug!(slug = %slug, "Board slug taken; trying next suffix");
                }
                Err(e) => return Err(e.into()),
            }
        };
        uow.record(
            &NewActivity::new(board.id, EntityType::Board, board.id, ActivityKind::BoardCreated)
                .actor(actor_id)
                .after(json!({ "name": board.name, "slug": board.slug })),
        )
        .await?;
        uow.commit().await?;

        info!(board_id = %board.id, slug = %board.slug, "Created board");
        Ok(board)
    }

    pub async fn list_boards(&self) -> Result<Vec<Board>, ReorderError> {
        let mut conn = self.store.reader().await?;
        Ok(BoardRepository::new(&mut conn).find_all().await?)
    }

    pub async fn get_board(&self, public_id: &str) -> Result<Board, ReorderError> {
        self.resolve_board(public_id).await
    }

    /// Hard delete. Lists, cards, labels and the activity log go with it.
    pub async fn destroy_board(&self, public_id: &str) -> Result<(), ReorderError> {
        let board_id = self.resolve_board(public_id).await?.id;
        with_retry(&self.retry, "destroy_board", || async move {
            let mut uow = self.store.begin([ParentKey::Board(board_id)]).await?;
            let rows = BoardRepository::new(uow.conn()).destroy(board_id).await?;
            if rows == 0 {
                return Err(ReorderError::NotFound(EntityKind::Board));
            }
            uow.commit().await?;
            Ok(())
        })
        .await?;

        info!(board_id = %board_id, "Destroyed board");
        Ok(())
    }

    /// The whole board in index order, read from a single snapshot.
    pub async fn board_snapshot(&self, public_id: &str) -> Result<BoardSnapshot, ReorderError> {
        with_retry(&self.retry, "board_snapshot", || self.board_snapshot_once(public_id)).await
    }

    async fn board_snapshot_once(&self, public_id: &str) -> Result<BoardSnapshot, ReorderError> {
        let mut uow = self.store.begin_unlocked().await?;
        let board = BoardRepository::new(uow.conn())
            .find_by_public_id(public_id)
            .await?
            .ok_or(ReorderError::NotFound(EntityKind::Board))?;

        let lists = ListRepository::new(uow.conn()).find_by_board(board.id).await?;
        let cards = CardRepository::new(uow.conn()).find_by_board(board.id).await?;
        let members = CardRepository::new(uow.conn())
            .members_by_board(board.id)
            .await?;
        let mut labels_repo = LabelRepository::new(uow.conn());
        let labels = labels_repo.find_by_board(board.id).await?;
        let label_links = labels_repo.card_links_by_board(board.id).await?;
        drop(uow);

        let mut label_ids: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for (card_id, label_id) in label_links {
            label_ids.entry(card_id).or_default().push(label_id);
        }
        let mut member_ids: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for (card_id, member_id) in members {
            member_ids.entry(card_id).or_default().push(member_id);
        }

        let mut by_list: HashMap<Uuid, Vec<CardView>> = HashMap::new();
        for card in cards {
            let view = CardView {
                label_ids: label_ids.remove(&card.id).unwrap_or_default(),
                member_ids: member_ids.remove(&card.id).unwrap_or_default(),
                card,
            };
            by_list.entry(view.card.list_id).or_default().push(view);
        }

        let lists = lists
            .into_iter()
            .map(|list| ListView {
                cards: by_list.remove(&list.id).unwrap_or_default(),
                list,
            })
            .collect();

        Ok(BoardSnapshot {
            board,
            lists,
            labels,
        })
    }

    /// Events for a board in commit order, strictly after `after_seq`.
    pub async fn activity(
        &self,
        public_id: &str,
        after_seq: Option<i64>,
        limit: Option<i64>,
    ) -> Result<Vec<ActivityEvent>, ReorderError> {
        let board = self.resolve_board(public_id).await?;
        let limit = limit
            .unwrap_or(DEFAULT_ACTIVITY_LIMIT)
            .clamp(1, MAX_ACTIVITY_LIMIT);
        let mut conn = self.store.reader().await?;
        Ok(ActivityRepository::new(&mut conn)
            .fetch_since(board.id, after_seq, limit)
            .await?)
    }

    pub async fn create_label(
        &self,
        board_public_id: &str,
        req: &CreateLabel,
    ) -> Result<Label, ReorderError> {
        validate_name(&req.name)?;
        validate_color(&req.color)?;
        let board = self.resolve_board(board_public_id).await?;
        let mut conn = self.store.reader().await?;
        let label = LabelRepository::new(&mut conn)
            .create(board.id, &req.name, &req.color)
            .await?;
        Ok(label)
    }

    pub async fn list_labels(&self, board_public_id: &str) -> Result<Vec<Label>, ReorderError> {
        let board = self.resolve_board(board_public_id).await?;
        let mut conn = self.store.reader().await?;
        Ok(LabelRepository::new(&mut conn).find_by_board(board.id).await?)
    }
}
