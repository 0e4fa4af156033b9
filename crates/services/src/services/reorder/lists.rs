use db::{
    ChangeSet, CollectionKind, ParentKey, with_retry,
    models::{
        activity::{ActivityKind, EntityType, NewActivity},
        card::CardRepository,
        list::{CreateList, List, ListRepository, MoveList, RenameList},
        new_public_id,
    },
    positioning::{plan_insert, plan_move_within, plan_remove, resolve_target},
    validation::validate_name,
};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::{
    CollectionState, DeleteAck, EntityKind, ListMutation, ReorderError, ReorderService,
    check_expected, insert_at, load_lists,
};

impl ReorderService {
    /// Create a list at `at_index`, or at the end of the board.
    pub async fn create_list(
        &self,
        board_public_id: &str,
        req: &CreateList,
        actor_id: Option<Uuid>,
    ) -> Result<ListMutation, ReorderError> {
        validate_name(&req.name)?;
        let board_id = self.resolve_board(board_public_id).await?.id;
        with_retry(&self.retry, "create_list", || {
            self.create_list_once(board_id, req, actor_id)
        })
        .await
    }

    async fn create_list_once(
        &self,
        board_id: Uuid,
        req: &CreateList,
        actor_id: Option<Uuid>,
    ) -> Result<ListMutation, ReorderError> {
        let mut uow = self.store.begin([ParentKey::Board(board_id)]).await?;
        let (mut lists, version) = load_lists(&mut uow, board_id).await?;
        let at = insert_at(req.at_index, lists.count())?;

        let id = Uuid::new_v4();
        ListRepository::new(uow.conn())
            .insert_parked(id, &new_public_id("lst"), board_id, &req.name, -1 - at)
            .await?;

        let plan = plan_insert(&lists, id, Some(at))?;
        let applied = uow
            .apply(
                ChangeSet::new(CollectionKind::Lists, plan.clone())
                    .expect_version(board_id, version)
                    .with_activity(
                        NewActivity::new(board_id, EntityType::List, id, ActivityKind::ListCreated)
                            .actor(actor_id)
                            .after(json!({ "name": req.name, "index": at })),
                    ),
            )
            .await?;
        lists.apply(&plan)?;

        let list = ListRepository::new(uow.conn())
            .find_by_id(id)
            .await?
            .ok_or(ReorderError::NotFound(EntityKind::List))?;
        uow.commit().await?;

        let version = applied.version(board_id).unwrap_or(version + 1);
        info!(board_id = %board_id, list_id = %id, index = at, version, "Created list");
        Ok(ListMutation {
            list,
            lists: CollectionState::of(&lists, version),
        })
    }

    pub async fn get_list(&self, list_public_id: &str) -> Result<List, ReorderError> {
        self.resolve_list(list_public_id).await
    }

    pub async fn rename_list(
        &self,
        list_public_id: &str,
        req: &RenameList,
        actor_id: Option<Uuid>,
    ) -> Result<List, ReorderError> {
        validate_name(&req.name)?;
        let before = self.resolve_list(list_public_id).await?;
        with_retry(&self.retry, "rename_list", || {
            self.rename_list_once(&before, &req.name, actor_id)
        })
        .await
    }

    async fn rename_list_once(
        &self,
        before: &List,
        name: &str,
        actor_id: Option<Uuid>,
    ) -> Result<List, ReorderError> {
        let mut uow = self.store.begin_unlocked().await?;
        let list = ListRepository::new(uow.conn())
            .rename(before.id, name)
            .await?
            .ok_or(ReorderError::NotFound(EntityKind::List))?;
        uow.record(
            &NewActivity::new(list.board_id, EntityType::List, list.id, ActivityKind::ListRenamed)
                .actor(actor_id)
                .before(json!({ "name": before.name }))
                .after(json!({ "name": list.name })),
        )
        .await?;
        uow.commit().await?;
        Ok(list)
    }

    /// Move a list to `to_index` among the board's lists.
    ///
    /// `to_index` equal to the list count moves the list to the end. Moving a
    /// list onto its own slot is a no-op that commits nothing.
    pub async fn reorder_list(
        &self,
        list_public_id: &str,
        req: &MoveList,
        actor_id: Option<Uuid>,
    ) -> Result<ListMutation, ReorderError> {
        let seen = self.resolve_list(list_public_id).await?;
        with_retry(&self.retry, "reorder_list", || {
            self.reorder_list_once(seen.id, seen.board_id, req, actor_id)
        })
        .await
    }

    async fn reorder_list_once(
        &self,
        list_id: Uuid,
        board_id: Uuid,
        req: &MoveList,
        actor_id: Option<Uuid>,
    ) -> Result<ListMutation, ReorderError> {
        let mut uow = self.store.begin([ParentKey::Board(board_id)]).await?;
        let (mut lists, version) = load_lists(&mut uow, board_id).await?;
        check_expected(req.expected_version, version)?;

        let from = lists
            .index_of(list_id)
            .ok_or(ReorderError::NotFound(EntityKind::List))?;
        let to = resolve_target(req.to_index, lists.count(), true)?;
        let plan = plan_move_within(&lists, list_id, from, to)?;

        if plan.is_empty() {
            let list = ListRepository::new(uow.conn())
                .find_by_id(list_id)
                .await?
                .ok_or(ReorderError::NotFound(EntityKind::List))?;
            return Ok(ListMutation {
                list,
                lists: CollectionState::of(&lists, version),
            });
        }

        let applied = uow
            .apply(
                ChangeSet::new(CollectionKind::Lists, plan.clone())
                    .expect_version(board_id, version)
                    .with_activity(
                        NewActivity::new(board_id, EntityType::List, list_id, ActivityKind::ListMoved)
                            .actor(actor_id)
                            .before(json!({ "index": from }))
                            .after(json!({ "index": to })),
                    ),
            )
            .await?;
        lists.apply(&plan)?;

        let list = ListRepository::new(uow.conn())
            .find_by_id(list_id)
            .await?
            .ok_or(ReorderError::NotFound(EntityKind::List))?;
        uow.commit().await?;

        let version = applied.version(board_id).unwrap_or(version + 1);
        info!(list_id = %list_id, from, to, version, "Moved list");
        Ok(ListMutation {
            list,
            lists: CollectionState::of(&lists, version),
        })
    }

    /// Soft-delete a list and every card on it, closing the gap it leaves.
    pub async fn delete_list(
        &self,
        list_public_id: &str,
        actor_id: Option<Uuid>,
    ) -> Result<DeleteAck, ReorderError> {
        let seen = self.resolve_list(list_public_id).await?;
        with_retry(&self.retry, "delete_list", || {
            self.delete_list_once(seen.id, seen.board_id, actor_id)
        })
        .await
    }

    async fn delete_list_once(
        &self,
        list_id: Uuid,
        board_id: Uuid,
        actor_id: Option<Uuid>,
    ) -> Result<DeleteAck, ReorderError> {
        let mut uow = self
            .store
            .begin([ParentKey::Board(board_id), ParentKey::List(list_id)])
            .await?;
        let (mut lists, version) = load_lists(&mut uow, board_id).await?;
        let at = lists
            .index_of(list_id)
            .ok_or(ReorderError::NotFound(EntityKind::List))?;

        let cards = CardRepository::new(uow.conn())
            .soft_delete_by_list(list_id, actor_id)
            .await?;

        let plan = plan_remove(&lists, list_id, at)?;
        let applied = uow
            .apply(
                ChangeSet::new(CollectionKind::Lists, plan.clone())
                    .expect_version(board_id, version)
                    .deleted_by(actor_id)
                    .with_activity(
                        NewActivity::new(board_id, EntityType::List, list_id, ActivityKind::ListDeleted)
                            .actor(actor_id)
                            .before(json!({ "index": at, "cards": cards })),
                    ),
            )
            .await?;
        lists.apply(&plan)?;
        uow.commit().await?;

        let version = applied.version(board_id).unwrap_or(version + 1);
        info!(list_id = %list_id, cards, version, "Deleted list");
        Ok(DeleteAck {
            id: list_id,
            collection: CollectionState::of(&lists, version),
        })
    }
}
