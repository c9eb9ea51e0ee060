use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// The authenticated user performing an operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: UserId,
    pub is_admin: bool,
}

impl Actor {
    pub fn user(user_id: UserId) -> Self {
        Self {
            user_id,
            is_admin: false,
        }
    }

    pub fn admin(user_id: UserId) -> Self {
        Self {
            user_id,
            is_admin: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ability {
    View,
    Update,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{actor} may not {ability:?} a resource owned by {owner}")]
pub struct Forbidden {
    pub actor: UserId,
    pub owner: UserId,
    pub ability: Ability,
}

/// Decide whether `actor` may exercise `ability` on a resource owned by
/// `owner`. Admins are allowed before any ownership check runs.
pub fn authorize(actor: &Actor, owner: &UserId, ability: Ability) -> Result<(), Forbidden> {
    if actor.is_admin {
        return Ok(());
    }
    if &actor.user_id == owner {
        return Ok(());
    }
    Err(Forbidden {
        actor: actor.user_id.clone(),
        owner: owner.clone(),
        ability,
    })
}
