use serde::Deserialize;
use tracing::instrument;

use invoicer_core::events::{ChangeKind, EntityEvent, EntityKind};
use invoicer_core::ids::ItemId;
use invoicer_core::policy::{Ability, Actor};
use invoicer_core::Money;
use invoicer_store::items::{ItemFields, ItemRepo, ItemRow};

use super::{list_scope, non_negative, owned, required_name, ServiceContext};
use crate::error::EngineError;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ItemInput {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub unit_price: Money,
}

impl ItemInput {
    fn validate(&self) -> Result<ItemFields, EngineError> {
        Ok(ItemFields {
            name: required_name("name", &self.name)?,
            description: self.description.trim().to_string(),
            unit_price: non_negative("unit_price", self.unit_price)?,
        })
    }
}

#[derive(Clone)]
pub struct ItemService {
    ctx: ServiceContext,
}

impl ItemService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self, input), fields(actor_id = %actor.user_id))]
    pub fn create(&self, actor: &Actor, input: &ItemInput) -> Result<ItemRow, EngineError> {
        let fields = input.validate()?;
        self.ctx.mutate(|conn| {
            let item = ItemRepo::create(conn, &actor.user_id, &fields)?;
            let event = EntityEvent::new(EntityKind::Item, ChangeKind::Created, item.id.as_str(), item.owner_id.clone(), &item.name)
                .by(&actor.user_id);
            Ok((item, vec![event]))
        })
    }

    pub fn get(&self, actor: &Actor, id: &ItemId) -> Result<ItemRow, EngineError> {
        self.ctx
            .read(|conn| owned(ItemRepo::get(conn, id)?, format!("item {id}"), |i| &i.owner_id, actor, Ability::View))
    }

    pub fn list(&self, actor: &Actor) -> Result<Vec<ItemRow>, EngineError> {
        self.ctx.read(|conn| Ok(ItemRepo::list(conn, list_scope(actor))?))
    }

    #[instrument(skip(self, input), fields(actor_id = %actor.user_id, item_id = %id))]
    pub fn update(&self, actor: &Actor, id: &ItemId, input: &ItemInput) -> Result<ItemRow, EngineError> {
        let fields = input.validate()?;
        self.ctx.mutate(|conn| {
            let existing = owned(ItemRepo::get(conn, id)?, format!("item {id}"), |i| &i.owner_id, actor, Ability::Update)?;
            ItemRepo::update(conn, id, &fields)?;
            let updated = ItemRepo::get(conn, id)?.ok_or_else(|| EngineError::not_found(format!("item {id}")))?;
            let event = EntityEvent::new(EntityKind::Item, ChangeKind::Updated, id.as_str(), existing.owner_id, &updated.name)
                .by(&actor.user_id);
            Ok((updated, vec![event]))
        })
    }

    #[instrument(skip(self), fields(actor_id = %actor.user_id, item_id = %id))]
    pub fn delete(&self, actor: &Actor, id: &ItemId) -> Result<(), EngineError> {
        self.ctx.mutate(|conn| {
            let existing = owned(ItemRepo::get(conn, id)?, format!("item {id}"), |i| &i.owner_id, actor, Ability::Delete)?;
            ItemRepo::delete(conn, id)?;
            let event = EntityEvent::new(EntityKind::Item, ChangeKind::Deleted, id.as_str(), existing.owner_id, &existing.name)
                .by(&actor.user_id);
            Ok(((), vec![event]))
        })
    }
}
