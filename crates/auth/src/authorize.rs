//! Authorization chain: ordered guards combined with AND semantics.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use civitas_core::{AggregateRef, CommunityId, UserId};

use crate::{Actor, TrustTier, UserActor};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    /// No (valid) identity was presented.
    #[error("unauthenticated")]
    Unauthenticated,

    /// The identity is known but not acceptable for this operation.
    #[error("invalid actor: {0}")]
    InvalidActor(String),

    /// The identity is acceptable but lacks a capability.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A guard could not reach the directory it depends on.
    #[error("authorization directory unavailable: {0}")]
    Directory(String),
}

/// Who controls a resource: its author and the community it lives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceOwner {
    pub owner: UserId,
    pub community_id: Option<CommunityId>,
}

impl ResourceOwner {
    pub fn new(owner: UserId) -> Self {
        Self {
            owner,
            community_id: None,
        }
    }

    pub fn in_community(mut self, community_id: CommunityId) -> Self {
        self.community_id = Some(community_id);
        self
    }
}

/// Lookups (and the single permitted write) guards may perform.
///
/// Implemented by infrastructure on top of the datastore; guards only see this
/// trait, which keeps the chain free of IO concerns.
pub trait Directory: Send + Sync {
    /// Owner of a resource, `None` when the resource does not exist.
    fn resource_owner(&self, resource: &AggregateRef) -> Result<Option<ResourceOwner>, AuthzError>;

    /// Persist a raised trust tier for `user_id`.
    ///
    /// Runs outside the command transaction and must never lower a tier.
    fn persist_tier(&self, user_id: UserId, tier: TrustTier) -> Result<(), AuthzError>;
}

/// Context threaded through the guard chain and handed to the body.
///
/// Guards enrich it as they go (resolved community, author flag, upgraded tier).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub actor: Actor,
    pub now: DateTime<Utc>,
    pub community_id: Option<CommunityId>,
    pub is_author: bool,
    pub upgraded_tier: Option<TrustTier>,
}

impl AuthContext {
    pub fn new(actor: Actor, now: DateTime<Utc>) -> Self {
        Self {
            actor,
            now,
            community_id: None,
            is_author: false,
            upgraded_tier: None,
        }
    }

    /// The user behind this call, or `InvalidActor` for the system actor.
    pub fn user(&self) -> Result<&UserActor, AuthzError> {
        self.actor
            .as_user()
            .ok_or_else(|| AuthzError::InvalidActor("operation requires a user actor".into()))
    }

    pub(crate) fn user_mut(&mut self) -> Result<&mut UserActor, AuthzError> {
        match &mut self.actor {
            Actor::User(user) => Ok(user),
            Actor::System(_) => Err(AuthzError::InvalidActor("operation requires a user actor".into())),
        }
    }
}

/// One check in an authorization chain.
pub trait Guard<P>: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, ctx: &mut AuthContext, payload: &P, directory: &dyn Directory) -> Result<(), AuthzError>;
}

/// Ordered list of guards, evaluated left to right.
pub struct GuardChain<P> {
    guards: Vec<Box<dyn Guard<P>>>,
}

impl<P> Default for GuardChain<P> {
    fn default() -> Self {
        Self { guards: Vec::new() }
    }
}

impl<P> core::fmt::Debug for GuardChain<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list()
            .entries(self.guards.iter().map(|g| g.name()))
            .finish()
    }
}

impl<P> GuardChain<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, guard: impl Guard<P> + 'static) -> Self {
        self.guards.push(Box::new(guard));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    /// Run every guard in order, stopping at the first failure.
    ///
    /// The system actor satisfies every guard without evaluating any.
    pub fn authorize(
        &self,
        actor: Actor,
        payload: &P,
        now: DateTime<Utc>,
        directory: &dyn Directory,
    ) -> Result<AuthContext, AuthzError> {
        let mut ctx = AuthContext::new(actor, now);
        if ctx.actor.is_system() {
            return Ok(ctx);
        }

        for guard in &self.guards {
            if let Err(err) = guard.check(&mut ctx, payload, directory) {
                debug!(guard = guard.name(), actor = %ctx.actor.label(), error = %err, "guard rejected actor");
                return Err(err);
            }
        }
        Ok(ctx)
    }
}
