use std::collections::BTreeSet;

use db::{
    ChangeSet, CollectionKind, ParentKey, UnitOfWork, with_retry,
    models::{
        activity::{ActivityKind, EntityType, NewActivity},
        card::{Card, CardRepository, CreateCard, MoveCard, UpdateCard},
        label::{Label, LabelRepository},
        list::{List, ListRepository},
        new_public_id,
    },
    positioning::{plan_insert, plan_move_across, plan_move_within, plan_remove, resolve_target},
    validation::{validate_description, validate_title},
};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::{
    CardMutation, CollectionState, DeleteAck, EntityKind, ReorderError, ReorderService,
    check_expected, insert_at, load_cards,
};

impl ReorderService {
    /// Create a card at `at_index`, or at the end of the list.
    pub async fn create_card(
        &self,
        list_public_id: &str,
        req: &CreateCard,
        actor_id: Option<Uuid>,
    ) -> Result<CardMutation, ReorderError> {
        validate_title(&req.title)?;
        if let Some(description) = &req.description {
            validate_description(description)?;
        }
        let list = self.resolve_list(list_public_id).await?;
        with_retry(&self.retry, "create_card", || {
            self.create_card_once(&list, req, actor_id)
        })
        .await
    }

    async fn create_card_once(
        &self,
        list: &List,
        req: &CreateCard,
        actor_id: Option<Uuid>,
    ) -> Result<CardMutation, ReorderError> {
        let mut uow = self.store.begin([ParentKey::List(list.id)]).await?;
        let (mut cards, version) = load_cards(&mut uow, list.id).await?;
        let at = insert_at(req.at_index, cards.count())?;

        let id = Uuid::new_v4();
        CardRepository::new(uow.conn())
            .insert_parked(
                id,
                &new_public_id("crd"),
                list.id,
                &req.title,
                req.description.as_deref(),
                -1 - at,
            )
            .await?;

        let plan = plan_insert(&cards, id, Some(at))?;
        let applied = uow
            .apply(
                ChangeSet::new(CollectionKind::Cards, plan.clone())
                    .expect_version(list.id, version)
                    .with_activity(
                        NewActivity::new(list.board_id, EntityType::Card, id, ActivityKind::CardCreated)
                            .actor(actor_id)
                            .after(json!({ "title": req.title, "list_id": list.id, "index": at })),
                    ),
            )
            .await?;
        cards.apply(&plan)?;

        let card = fetch_card(&mut uow, id).await?;
        uow.commit().await?;

        let state = CollectionState::of(&cards, applied.version(list.id).unwrap_or(version + 1));
        info!(list_id = %list.id, card_id = %id, index = at, version = state.version, "Created card");
        Ok(CardMutation {
            card,
            source: state.clone(),
            dest: state,
        })
    }

    pub async fn get_card(&self, card_public_id: &str) -> Result<Card, ReorderError> {
        self.resolve_card(card_public_id).await
    }

    /// Live cards of a list in index order.
    pub async fn list_cards(&self, list_public_id: &str) -> Result<Vec<Card>, ReorderError> {
        let list = self.resolve_list(list_public_id).await?;
        let mut conn = self.store.reader().await?;
        Ok(CardRepository::new(&mut conn).find_by_list(list.id).await?)
    }

    /// Change title and/or description. Ordering is untouched.
    pub async fn update_card(
        &self,
        card_public_id: &str,
        req: &UpdateCard,
        actor_id: Option<Uuid>,
    ) -> Result<Card, ReorderError> {
        if let Some(title) = &req.title {
            validate_title(title)?;
        }
        if let Some(description) = &req.description {
            validate_description(description)?;
        }
        let seen = self.resolve_card(card_public_id).await?;
        with_retry(&self.retry, "update_card", || {
            self.update_card_once(seen.id, req, actor_id)
        })
        .await
    }

    async fn update_card_once(
        &self,
        card_id: Uuid,
        req: &UpdateCard,
        actor_id: Option<Uuid>,
    ) -> Result<Card, ReorderError> {
        let mut uow = self.store.begin_unlocked().await?;
        let before = fetch_card(&mut uow, card_id).await?;
        let board_id = fetch_list(&mut uow, before.list_id).await?.board_id;

        let title = req.title.as_deref().unwrap_or(&before.title);
        let description = match &req.description {
            // An empty description clears it.
            Some(d) if d.is_empty() => None,
            Some(d) => Some(d.as_str()),
            None => before.description.as_deref(),
        };

        let card = CardRepository::new(uow.conn())
            .update(card_id, title, description)
            .await?
            .ok_or(ReorderError::NotFound(EntityKind::Card))?;
        uow.record(
            &NewActivity::new(board_id, EntityType::Card, card_id, ActivityKind::CardUpdated)
                .actor(actor_id)
                .before(json!({ "title": before.title, "description": before.description }))
                .after(json!({ "title": card.title, "description": card.description })),
        )
        .await?;
        uow.commit().await?;
        Ok(card)
    }

    /// Move a card to `to_index` in `dest_list_id`, which may be its own list.
    ///
    /// Both lists are locked in canonical order. The response carries the
    /// resulting order and version of both.
    pub async fn reorder_card(
        &self,
        card_public_id: &str,
        req: &MoveCard,
        actor_id: Option<Uuid>,
    ) -> Result<CardMutation, ReorderError> {
        let dest = self.resolve_list(&req.dest_list_id).await?;
        with_retry(&self.retry, "reorder_card", || {
            self.reorder_card_once(card_public_id, &dest, req, actor_id)
        })
        .await
    }

    async fn reorder_card_once(
        &self,
        card_public_id: &str,
        dest: &List,
        req: &MoveCard,
        actor_id: Option<Uuid>,
    ) -> Result<CardMutation, ReorderError> {
        let dest_id = dest.id;
        let (mut uow, card) = self
            .lock_card(card_public_id, |card| {
                vec![ParentKey::List(card.list_id), ParentKey::List(dest_id)]
            })
            .await?;
        let source_id = card.list_id;
        let board_id = fetch_list(&mut uow, source_id).await?.board_id;
        if board_id != dest.board_id {
            // Cards only move between lists of one board.
            return Err(ReorderError::NotFound(EntityKind::List));
        }

        let (mut source, source_version) = load_cards(&mut uow, source_id).await?;
        check_expected(req.expected_source_version, source_version)?;
        let from = source
            .index_of(card.id)
            .ok_or(ReorderError::NotFound(EntityKind::Card))?;

        if source_id == dest_id {
            check_expected(req.expected_dest_version, source_version)?;
            let to = resolve_target(req.to_index, source.count(), true)?;
            let plan = plan_move_within(&source, card.id, from, to)?;
            if plan.is_empty() {
                let state = CollectionState::of(&source, source_version);
                return Ok(CardMutation {
                    card,
                    source: state.clone(),
                    dest: state,
                });
            }

            let applied = uow
                .apply(
                    ChangeSet::new(CollectionKind::Cards, plan.clone())
                        .expect_version(source_id, source_version)
                        .with_activity(moved(board_id, &card, actor_id, source_id, from, dest_id, to)),
                )
                .await?;
            source.apply(&plan)?;
            let card = fetch_card(&mut uow, card.id).await?;
            uow.commit().await?;

            let state = CollectionState::of(
                &source,
                applied.version(source_id).unwrap_or(source_version + 1),
            );
            info!(card_id = %card.id, list_id = %source_id, from, to, version = state.version, "Moved card");
            return Ok(CardMutation {
                card,
                source: state.clone(),
                dest: state,
            });
        }

        let (mut target, dest_version) = load_cards(&mut uow, dest_id).await?;
        check_expected(req.expected_dest_version, dest_version)?;
        let to = resolve_target(req.to_index, target.count(), false)?;
        let plan = plan_move_across(&source, card.id, from, &target, to)?;

        let applied = uow
            .apply(
                ChangeSet::new(CollectionKind::Cards, plan.clone())
                    .expect_version(source_id, source_version)
                    .expect_version(dest_id, dest_version)
                    .with_activity(moved(board_id, &card, actor_id, source_id, from, dest_id, to)),
            )
            .await?;
        source.apply(&plan)?;
        target.apply(&plan)?;
        let card = fetch_card(&mut uow, card.id).await?;
        uow.commit().await?;

        let source = CollectionState::of(
            &source,
            applied.version(source_id).unwrap_or(source_version + 1),
        );
        let dest = CollectionState::of(&target, applied.version(dest_id).unwrap_or(dest_version + 1));
        info!(
            card_id = %card.id,
            source_list_id = %source_id,
            dest_list_id = %dest_id,
            from,
            to,
            "Moved card across lists"
        );
        Ok(CardMutation { card, source, dest })
    }

    /// Soft-delete a card and close the gap it leaves.
    pub async fn delete_card(
        &self,
        card_public_id: &str,
        actor_id: Option<Uuid>,
    ) -> Result<DeleteAck, ReorderError> {
        with_retry(&self.retry, "delete_card", || {
            self.delete_card_once(card_public_id, actor_id)
        })
        .await
    }

    async fn delete_card_once(
        &self,
        card_public_id: &str,
        actor_id: Option<Uuid>,
    ) -> Result<DeleteAck, ReorderError> {
        let (mut uow, card) = self
            .lock_card(card_public_id, |card| vec![ParentKey::List(card.list_id)])
            .await?;
        let list_id = card.list_id;
        let board_id = fetch_list(&mut uow, list_id).await?.board_id;
        let (mut cards, version) = load_cards(&mut uow, list_id).await?;
        let at = cards
            .index_of(card.id)
            .ok_or(ReorderError::NotFound(EntityKind::Card))?;

        // The plan detaches the card; apply issues the soft delete.
        let plan = plan_remove(&cards, card.id, at)?;
        let applied = uow
            .apply(
                ChangeSet::new(CollectionKind::Cards, plan.clone())
                    .expect_version(list_id, version)
                    .deleted_by(actor_id)
                    .with_activity(
                        NewActivity::new(board_id, EntityType::Card, card.id, ActivityKind::CardDeleted)
                            .actor(actor_id)
                            .before(json!({ "title": card.title, "list_id": list_id, "index": at })),
                    ),
            )
            .await?;
        cards.apply(&plan)?;
        uow.commit().await?;

        let version = applied.version(list_id).unwrap_or(version + 1);
        info!(card_id = %card.id, list_id = %list_id, version, "Deleted card");
        Ok(DeleteAck {
            id: card.id,
            collection: CollectionState::of(&cards, version),
        })
    }

    /// Replace a card's labels. Every label must belong to the card's board.
    pub async fn set_card_labels(
        &self,
        card_public_id: &str,
        label_ids: &[Uuid],
    ) -> Result<Vec<Label>, ReorderError> {
        let card = self.resolve_card(card_public_id).await?;
        let label_ids: Vec<Uuid> = label_ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();

        with_retry(&self.retry, "set_card_labels", || {
            self.set_card_labels_once(card.id, &label_ids)
        })
        .await
    }

    async fn set_card_labels_once(
        &self,
        card_id: Uuid,
        label_ids: &[Uuid],
    ) -> Result<Vec<Label>, ReorderError> {
        let mut uow = self.store.begin_unlocked().await?;
        let card = fetch_card(&mut uow, card_id).await?;
        let board_id = fetch_list(&mut uow, card.list_id).await?.board_id;

        let mut labels = LabelRepository::new(uow.conn());
        if labels.count_on_board(board_id, label_ids).await? != label_ids.len() {
            return Err(ReorderError::NotFound(EntityKind::Label));
        }
        labels.set_for_card(card_id, label_ids).await?;
        let result = labels.find_for_card(card_id).await?;
        uow.commit().await?;
        Ok(result)
    }

    /// Replace a card's members. Member ids are owned by the membership
    /// service and are not checked here.
    pub async fn set_card_members(
        &self,
        card_public_id: &str,
        member_ids: &[Uuid],
    ) -> Result<Vec<Uuid>, ReorderError> {
        let card = self.resolve_card(card_public_id).await?;
        let member_ids: Vec<Uuid> = member_ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();

        with_retry(&self.retry, "set_card_members", || {
            self.set_card_members_once(card.id, &member_ids)
        })
        .await
    }

    async fn set_card_members_once(
        &self,
        card_id: Uuid,
        member_ids: &[Uuid],
    ) -> Result<Vec<Uuid>, ReorderError> {
        let mut uow = self.store.begin_unlocked().await?;
        fetch_card(&mut uow, card_id).await?;
        let mut cards = CardRepository::new(uow.conn());
        cards.set_members(card_id, member_ids).await?;
        let result = cards.members_of(card_id).await?;
        uow.commit().await?;
        Ok(result)
    }
}

async fn fetch_card(uow: &mut UnitOfWork, card_id: Uuid) -> Result<Card, ReorderError> {
    CardRepository::new(uow.conn())
        .find_by_id(card_id)
        .await?
        .ok_or(ReorderError::NotFound(EntityKind::Card))
}

async fn fetch_list(uow: &mut UnitOfWork, list_id: Uuid) -> Result<List, ReorderError> {
    ListRepository::new(uow.conn())
        .find_by_id(list_id)
        .await?
        .ok_or(ReorderError::NotFound(EntityKind::List))
}

fn moved(
    board_id: Uuid,
    card: &Card,
    actor_id: Option<Uuid>,
    source_id: Uuid,
    from: i64,
    dest_id: Uuid,
    to: i64,
) -> NewActivity {
    NewActivity::new(board_id, EntityType::Card, card.id, ActivityKind::CardMoved)
        .actor(actor_id)
        .before(json!({ "list_id": source_id, "index": from }))
        .after(json!({ "list_id": dest_id, "index": to }))
}
