use chrono::Utc;
use tracing::instrument;

use invoicer_core::ids::NotificationId;
use invoicer_core::policy::{Ability, Actor, Forbidden};
use invoicer_store::notifications::{NotificationRepo, NotificationRow};

use super::ServiceContext;
use crate::error::EngineError;

/// A user's own notifications. Reading one is not an audited mutation.
#[derive(Clone)]
pub struct NotificationService {
    ctx: ServiceContext,
}

impl NotificationService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    pub fn list(&self, actor: &Actor, unread_only: bool) -> Result<Vec<NotificationRow>, EngineError> {
        self.ctx
            .read(|conn| Ok(NotificationRepo::list_for(conn, &actor.user_id, unread_only)?))
    }

    pub fn unread_count(&self, actor: &Actor) -> Result<i64, EngineError> {
        self.ctx.read(|conn| Ok(NotificationRepo::count_unread(conn, &actor.user_id)?))
    }

    #[instrument(skip(self), fields(actor_id = %actor.user_id, notification_id = %id))]
    pub fn mark_read(&self, actor: &Actor, id: &NotificationId) -> Result<NotificationRow, EngineError> {
        self.ctx.db.with_tx(|tx| {
            let found = NotificationRepo::get(tx, id)?
                .ok_or_else(|| EngineError::not_found(format!("notification {id}")))?;
            // private even to admins
            if found.recipient_id != actor.user_id {
                return Err(Forbidden {
                    actor: actor.user_id.clone(),
                    owner: found.recipient_id,
                    ability: Ability::Update,
                }
                .into());
            }
            NotificationRepo::mark_read(tx, id, Utc::now())?;
            NotificationRepo::get(tx, id)?.ok_or_else(|| EngineError::not_found(format!("notification {id}")))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{context, user};
    use invoicer_core::ids::EventId;
    use invoicer_store::notifications::NewNotification;
    use serde_json::json;

    fn notify(ctx: &ServiceContext, recipient: &Actor) -> NotificationId {
        ctx.db
            .with_conn(|conn| {
                NotificationRepo::insert(
                    conn,
                    &NewNotification {
                        event_id: EventId::new(),
                        recipient_id: recipient.user_id.clone(),
                        kind: "invoice.paid".into(),
                        payload: json!({"number": "INV-000001"}),
                    },
                )?;
                NotificationRepo::list_for(conn, &recipient.user_id, false)
            })
            .unwrap()
            .remove(0)
            .id
    }

    #[test]
    fn mark_read_keeps_first_read_time() {
        let ctx = context();
        let a = user(&ctx, "a@example.com");
        let id = notify(&ctx, &a);
        let svc = NotificationService::new(ctx);
        assert_eq!(svc.unread_count(&a).unwrap(), 1);

        let first = svc.mark_read(&a, &id).unwrap().read_at;
        assert!(first.is_some());
        assert_eq!(svc.mark_read(&a, &id).unwrap().read_at, first);
        assert!(svc.list(&a, true).unwrap().is_empty());
        assert_eq!(svc.list(&a, false).unwrap().len(), 1);
    }

    #[test]
    fn other_users_cannot_read_mine() {
        let ctx = context();
        let a = user(&ctx, "a@example.com");
        let b = user(&ctx, "b@example.com");
        let id = notify(&ctx, &a);
        let svc = NotificationService::new(ctx);

        assert!(matches!(svc.mark_read(&b, &id), Err(EngineError::Forbidden(_))));
        assert!(matches!(
            svc.mark_read(&b, &NotificationId::from_raw("ntf_missing")),
            Err(EngineError::NotFound(_))
        ));
        assert!(svc.list(&b, false).unwrap().is_empty());
        assert_eq!(svc.unread_count(&a).unwrap(), 1);
    }
}
