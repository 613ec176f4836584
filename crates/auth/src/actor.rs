//! Resolved identities attempting an operation.
//!
//! None of these types implement `Deserialize`: an actor is always resolved
//! server-side from verified claims, or minted by trusted code for the
//! system actor. There is no wire format that can produce one.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use civitas_core::{CommunityId, UserId};

use crate::{Role, TrustTier};

/// A user resolved for the duration of one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserActor {
    pub user_id: UserId,
    pub address: String,
    pub is_super_admin: bool,
    pub tier: TrustTier,
    pub registered_at: DateTime<Utc>,
    pub memberships: HashMap<CommunityId, Role>,
}

impl UserActor {
    pub fn role_in(&self, community_id: CommunityId) -> Option<Role> {
        self.memberships.get(&community_id).copied()
    }
}

/// Privileged identity used by policies to invoke commands.
///
/// The field is private, so the only way to obtain one is
/// [`SystemActor::for_policy`], which names the internal caller for audit logs.
/// That constructor only exists with the `system-actor` feature. The policy
/// runtime enables it; request-facing crates must not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemActor {
    origin: &'static str,
}

impl SystemActor {
    #[cfg(any(test, feature = "system-actor"))]
    pub fn for_policy(origin: &'static str) -> Self {
        Self { origin }
    }

    pub fn origin(&self) -> &'static str {
        self.origin
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    User(UserActor),
    System(SystemActor),
}

impl Actor {
    pub fn is_system(&self) -> bool {
        matches!(self, Actor::System(_))
    }

    pub fn as_user(&self) -> Option<&UserActor> {
        match self {
            Actor::User(user) => Some(user),
            Actor::System(_) => None,
        }
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.as_user().map(|u| u.user_id)
    }

    /// Short label for logs: the user id, or `system:<origin>`.
    pub fn label(&self) -> String {
        match self {
            Actor::User(user) => user.user_id.to_string(),
            Actor::System(system) => format!("system:{}", system.origin),
        }
    }
}

impl From<UserActor> for Actor {
    fn from(value: UserActor) -> Self {
        Actor::User(value)
    }
}

impl From<SystemActor> for Actor {
    fn from(value: SystemActor) -> Self {
        Actor::System(value)
    }
}
