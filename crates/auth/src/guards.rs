//! Built-in guard families.
//!
//! Payload fields are reached through extractor closures so one guard type
//! serves every command shape.

use tracing::info;

use civitas_core::{AggregateRef, CommunityId};

use crate::authorize::{AuthContext, AuthzError, Directory, Guard, ResourceOwner};
use crate::{Actor, Role, TierUpgrade, TrustTier};

type Extract<P, T> = Box<dyn Fn(&P) -> T + Send + Sync>;

/// Actor must hold one of `roles` in the community named by the payload.
///
/// Community admins and super admins always pass.
pub struct RequireRole<P> {
    roles: &'static [Role],
    community: Extract<P, CommunityId>,
}

impl<P> RequireRole<P> {
    pub fn new(roles: &'static [Role], community: impl Fn(&P) -> CommunityId + Send + Sync + 'static) -> Self {
        Self {
            roles,
            community: Box::new(community),
        }
    }
}

impl<P> Guard<P> for RequireRole<P> {
    fn name(&self) -> &'static str {
        "require_role"
    }

    fn check(&self, ctx: &mut AuthContext, payload: &P, _directory: &dyn Directory) -> Result<(), AuthzError> {
        let community_id = (self.community)(payload);
        ctx.community_id = Some(community_id);

        let user = ctx.user()?;
        if user.is_super_admin {
            return Ok(());
        }
        match user.role_in(community_id) {
            Some(Role::Admin) => Ok(()),
            Some(role) if self.roles.contains(&role) => Ok(()),
            _ => {
                let names: Vec<&str> = self.roles.iter().map(Role::as_str).collect();
                Err(AuthzError::InvalidActor(format!(
                    "User is not {} in the community",
                    names.join(" or ")
                )))
            }
        }
    }
}

/// Actor's trust tier must be at least `floor`.
///
/// With an upgrade rule attached, an actor that newly qualifies is promoted
/// and persisted through the directory before the check is re-evaluated.
/// That directory write is the only write a guard may perform; it commits
/// independently of the command transaction.
#[derive(Debug, Clone)]
pub struct RequireTier {
    floor: TrustTier,
    upgrade: Option<TierUpgrade>,
}

impl RequireTier {
    pub fn at_least(floor: TrustTier) -> Self {
        Self { floor, upgrade: None }
    }

    pub fn with_upgrade(mut self, upgrade: TierUpgrade) -> Self {
        self.upgrade = Some(upgrade);
        self
    }
}

impl<P> Guard<P> for RequireTier {
    fn name(&self) -> &'static str {
        "require_tier"
    }

    fn check(&self, ctx: &mut AuthContext, _payload: &P, directory: &dyn Directory) -> Result<(), AuthzError> {
        let user = ctx.user()?;
        if user.tier == TrustTier::Banned {
            return Err(AuthzError::InvalidActor("banned actor".into()));
        }
        if user.is_super_admin || user.tier >= self.floor {
            return Ok(());
        }

        let (user_id, tier, registered_at) = (user.user_id, user.tier, user.registered_at);
        let due = self
            .upgrade
            .and_then(|upgrade| upgrade.due(tier, registered_at, ctx.now))
            .filter(|to| *to >= self.floor);

        match due {
            Some(to) => {
                directory.persist_tier(user_id, to)?;
                info!(user_id = %user_id, from = %tier, to = %to, "trust tier upgraded");
                ctx.user_mut()?.tier = to;
                ctx.upgraded_tier = Some(to);
                Ok(())
            }
            None => Err(AuthzError::Forbidden(format!(
                "requires trust tier {}, actor has {}",
                self.floor, tier
            ))),
        }
    }
}

/// Actor must own the resource named by the payload. Sets `is_author`.
///
/// Admins of the community the resource lives in, and super admins, may act
/// on any resource there.
pub struct RequireOwner<P> {
    resource: Extract<P, AggregateRef>,
}

impl<P> RequireOwner<P> {
    pub fn new(resource: impl Fn(&P) -> AggregateRef + Send + Sync + 'static) -> Self {
        Self {
            resource: Box::new(resource),
        }
    }
}

impl<P> Guard<P> for RequireOwner<P> {
    fn name(&self) -> &'static str {
        "require_owner"
    }

    fn check(&self, ctx: &mut AuthContext, payload: &P, directory: &dyn Directory) -> Result<(), AuthzError> {
        let resource = (self.resource)(payload);
        ctx.user()?;

        let Some(ResourceOwner { owner, community_id }) = directory.resource_owner(&resource)? else {
            return Err(AuthzError::Forbidden(format!("unknown resource {resource}")));
        };
        if ctx.community_id.is_none() {
            ctx.community_id = community_id;
        }

        let user = ctx.user()?;
        if owner == user.user_id {
            ctx.is_author = true;
            return Ok(());
        }
        let community_admin = community_id.is_some_and(|c| user.role_in(c) == Some(Role::Admin));
        if user.is_super_admin || community_admin {
            Ok(())
        } else {
            Err(AuthzError::InvalidActor("Not the author of the entity".into()))
        }
    }
}

/// Only the system actor may run this operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequireSystem;

impl<P> Guard<P> for RequireSystem {
    fn name(&self) -> &'static str {
        "require_system"
    }

    fn check(&self, ctx: &mut AuthContext, _payload: &P, _directory: &dyn Directory) -> Result<(), AuthzError> {
        match ctx.actor {
            Actor::System(_) => Ok(()),
            Actor::User(_) => Err(AuthzError::Forbidden("system actor required".into())),
        }
    }
}
