use serde::Deserialize;
use tracing::{info, instrument};

use invoicer_core::events::{ChangeKind, EntityEvent, EntityKind};
use invoicer_core::ids::CustomerId;
use invoicer_core::policy::{Ability, Actor};
use invoicer_store::customers::{CustomerFields, CustomerRepo, CustomerRow};

use super::{list_scope, optional_email, owned, required_name, ServiceContext};
use crate::error::EngineError;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CustomerInput {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

impl CustomerInput {
    fn validate(&self) -> Result<CustomerFields, EngineError> {
        Ok(CustomerFields {
            name: required_name("name", &self.name)?,
            email: optional_email("email", self.email.as_deref())?,
            address: self
                .address
                .as_deref()
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(String::from),
        })
    }
}

#[derive(Clone)]
pub struct CustomerService {
    ctx: ServiceContext,
}

impl CustomerService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self, input), fields(actor_id = %actor.user_id))]
    pub fn create(&self, actor: &Actor, input: &CustomerInput) -> Result<CustomerRow, EngineError> {
        let fields = input.validate()?;
        let customer = self.ctx.mutate(|conn| {
            let customer = CustomerRepo::create(conn, &actor.user_id, &fields)?;
            let event = EntityEvent::new(
                EntityKind::Customer,
                ChangeKind::Created,
                customer.id.as_str(),
                customer.owner_id.clone(),
                &customer.name,
            )
            .by(&actor.user_id);
            Ok((customer, vec![event]))
        })?;
        info!(customer_id = %customer.id, "customer created");
        Ok(customer)
    }

    pub fn get(&self, actor: &Actor, id: &CustomerId) -> Result<CustomerRow, EngineError> {
        self.ctx.read(|conn| {
            owned(CustomerRepo::get(conn, id)?, format!("customer {id}"), |c| &c.owner_id, actor, Ability::View)
        })
    }

    pub fn list(&self, actor: &Actor, search: Option<&str>) -> Result<Vec<CustomerRow>, EngineError> {
        self.ctx
            .read(|conn| Ok(CustomerRepo::list(conn, list_scope(actor), search)?))
    }

    #[instrument(skip(self, input), fields(actor_id = %actor.user_id, customer_id = %id))]
    pub fn update(&self, actor: &Actor, id: &CustomerId, input: &CustomerInput) -> Result<CustomerRow, EngineError> {
        let fields = input.validate()?;
        self.ctx.mutate(|conn| {
            let existing =
                owned(CustomerRepo::get(conn, id)?, format!("customer {id}"), |c| &c.owner_id, actor, Ability::Update)?;
            CustomerRepo::update(conn, id, &fields)?;
            let updated = CustomerRepo::get(conn, id)?.ok_or_else(|| EngineError::not_found(format!("customer {id}")))?;
            let event = EntityEvent::new(
                EntityKind::Customer,
                ChangeKind::Updated,
                id.as_str(),
                existing.owner_id,
                &updated.name,
            )
            .by(&actor.user_id);
            Ok((updated, vec![event]))
        })
    }

    /// Customers referenced by quotes or invoices cannot be deleted.
    #[instrument(skip(self), fields(actor_id = %actor.user_id, customer_id = %id))]
    pub fn delete(&self, actor: &Actor, id: &CustomerId) -> Result<(), EngineError> {
        self.ctx.mutate(|conn| {
            let existing =
                owned(CustomerRepo::get(conn, id)?, format!("customer {id}"), |c| &c.owner_id, actor, Ability::Delete)?;
            CustomerRepo::delete(conn, id)?;
            let event = EntityEvent::new(
                EntityKind::Customer,
                ChangeKind::Deleted,
                id.as_str(),
                existing.owner_id,
                &existing.name,
            )
            .by(&actor.user_id);
            Ok(((), vec![event]))
        })?;
        info!("customer deleted");
        Ok(())
    }
}
