//! Community commands.
//!
//! Each command is a [`CommandDescriptor`] built once and shared through
//! [`CommunityCommands`]; the executor supplies validation, guards and the
//! transaction.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use civitas_auth::{RequireOwner, RequireRole, RequireSystem, RequireTier, Role, TierUpgrade, TrustTier};
use civitas_core::{AggregateRef, CommunityId, DomainError, DomainResult, ThreadId, UserId, Validate, require_text};
use civitas_infra::accounts::{MembershipRecord, USERS, UserRecord, add_membership};
use civitas_infra::idempotency::{Effect, insert_once, transition};
use civitas_infra::{CommandContext, CommandDescriptor, OperationError};

use crate::events::{
    CommunityCreated, CommunityJoined, ThreadCreated, ThreadDeleted, UserBanned, UserRegistered, XpAwarded,
};
use crate::model::{COMMUNITIES, CommunityRecord, THREADS, ThreadRecord, XP_BALANCES, XP_LOG, XpLogEntry, xp_log_key};

/// Command: RegisterUser. Issued by the sign-in flow after wallet verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterUser {
    pub user_id: UserId,
    pub address: String,
    #[serde(default)]
    pub referred_by: Option<UserId>,
}

impl Validate for RegisterUser {
    fn validate(&self) -> DomainResult<()> {
        require_text("address", &self.address, 64)?;
        if self.referred_by == Some(self.user_id) {
            return Err(DomainError::validation("a user cannot refer themselves"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredUser {
    pub user_id: UserId,
    pub tier: TrustTier,
}

impl Validate for RegisteredUser {}

/// Command: CreateCommunity. The creator becomes its admin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateCommunity {
    pub community_id: CommunityId,
    pub name: String,
}

impl Validate for CreateCommunity {
    fn validate(&self) -> DomainResult<()> {
        require_text("name", &self.name, 64)
    }
}

/// Command: JoinCommunity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinCommunity {
    pub community_id: CommunityId,
}

impl Validate for JoinCommunity {}

/// Command: CreateThread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateThread {
    pub thread_id: ThreadId,
    pub community_id: CommunityId,
    pub title: String,
    pub body: String,
}

impl Validate for CreateThread {
    fn validate(&self) -> DomainResult<()> {
        require_text("title", &self.title, 256)?;
        require_text("body", &self.body, 10_000)
    }
}

/// Command: DeleteThread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteThread {
    pub thread_id: ThreadId,
}

impl Validate for DeleteThread {}

/// Command: AwardXp. Internal only; `action_key` makes each grant unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwardXp {
    pub user_id: UserId,
    pub action_key: String,
    pub xp: u32,
}

impl Validate for AwardXp {
    fn validate(&self) -> DomainResult<()> {
        require_text("action_key", &self.action_key, 128)?;
        if self.xp == 0 {
            return Err(DomainError::validation("xp must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwardOutcome {
    /// `false` when this action was already rewarded.
    pub awarded: bool,
}

impl Validate for AwardOutcome {}

/// Command: BanUser. Internal only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanUser {
    pub user_id: UserId,
    pub reason: String,
}

impl Validate for BanUser {
    fn validate(&self) -> DomainResult<()> {
        require_text("reason", &self.reason, 256)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanOutcome {
    /// `false` when the user was already banned.
    pub changed: bool,
}

impl Validate for BanOutcome {}

pub struct CommunityCommands {
    pub register_user: Arc<CommandDescriptor<RegisterUser, RegisteredUser>>,
    pub create_community: Arc<CommandDescriptor<CreateCommunity, CommunityRecord>>,
    pub join_community: Arc<CommandDescriptor<JoinCommunity, ()>>,
    pub create_thread: Arc<CommandDescriptor<CreateThread, ThreadRecord>>,
    pub delete_thread: Arc<CommandDescriptor<DeleteThread, ()>>,
    pub award_xp: Arc<CommandDescriptor<AwardXp, AwardOutcome>>,
    pub ban_user: Arc<CommandDescriptor<BanUser, BanOutcome>>,
}

impl CommunityCommands {
    pub fn new() -> Self {
        Self {
            register_user: Arc::new(register_user()),
            create_community: Arc::new(create_community()),
            join_community: Arc::new(join_community()),
            create_thread: Arc::new(create_thread()),
            delete_thread: Arc::new(delete_thread()),
            award_xp: Arc::new(award_xp()),
            ban_user: Arc::new(ban_user()),
        }
    }
}

impl Default for CommunityCommands {
    fn default() -> Self {
        Self::new()
    }
}

fn acting_user(ctx: &CommandContext<'_>) -> Result<UserId, OperationError> {
    ctx.actor()
        .user_id()
        .ok_or_else(|| OperationError::invalid_state("this command must be issued by a user"))
}

pub fn register_user() -> CommandDescriptor<RegisterUser, RegisteredUser> {
    CommandDescriptor::new("RegisterUser", |ctx, input: RegisterUser| {
        if let Some(referrer) = input.referred_by {
            if USERS.get(ctx.tx(), &referrer.to_string())?.is_none() {
                return Err(OperationError::not_found(format!("referrer {referrer}")));
            }
        }

        let registered_at = ctx.now();
        let user = UserRecord {
            user_id: input.user_id,
            address: input.address.clone(),
            tier: TrustTier::NewlyVerifiedWallet,
            is_super_admin: false,
            banned: false,
            referred_by: input.referred_by,
            registered_at,
        };
        if !USERS.insert(ctx.tx(), &input.user_id.to_string(), &user)? {
            return Err(OperationError::invalid_state(format!("user {} already registered", input.user_id)));
        }

        ctx.emit(&UserRegistered {
            user_id: input.user_id,
            address: input.address,
            referred_by: input.referred_by,
            registered_at,
        })?;
        Ok(RegisteredUser {
            user_id: user.user_id,
            tier: user.tier,
        })
    })
    .guard(RequireSystem)
}

pub fn create_community() -> CommandDescriptor<CreateCommunity, CommunityRecord> {
    CommandDescriptor::new("CreateCommunity", |ctx, input: CreateCommunity| {
        let creator = acting_user(ctx)?;
        let community = CommunityRecord {
            community_id: input.community_id,
            name: input.name,
            created_by: creator,
            created_at: ctx.now(),
        };
        if !COMMUNITIES.insert(ctx.tx(), &community.community_id.to_string(), &community)? {
            return Err(OperationError::invalid_state(format!(
                "community {} already exists",
                community.community_id
            )));
        }

        let membership = MembershipRecord {
            user_id: creator,
            community_id: community.community_id,
            role: Role::Admin,
            joined_at: community.created_at,
        };
        add_membership(ctx.tx(), &membership)?;

        ctx.emit(&CommunityCreated {
            community_id: community.community_id,
            name: community.name.clone(),
            created_by: creator,
        })?;
        ctx.emit(&CommunityJoined {
            community_id: community.community_id,
            user_id: creator,
            role: Role::Admin,
        })?;
        Ok(community)
    })
    .guard(RequireTier::at_least(TrustTier::NewlyVerifiedWallet))
}

pub fn join_community() -> CommandDescriptor<JoinCommunity, ()> {
    CommandDescriptor::new("JoinCommunity", |ctx, input: JoinCommunity| {
        let user_id = acting_user(ctx)?;
        if COMMUNITIES.get(ctx.tx(), &input.community_id.to_string())?.is_none() {
            return Err(OperationError::not_found(format!("community {}", input.community_id)));
        }

        let membership = MembershipRecord {
            user_id,
            community_id: input.community_id,
            role: Role::Member,
            joined_at: ctx.now(),
        };
        if !add_membership(ctx.tx(), &membership)? {
            return Err(OperationError::invalid_state("already a member of this community"));
        }

        ctx.emit(&CommunityJoined {
            community_id: input.community_id,
            user_id,
            role: Role::Member,
        })?;
        Ok(())
    })
    .guard(RequireTier::at_least(TrustTier::NewlyVerifiedWallet))
}

pub fn create_thread() -> CommandDescriptor<CreateThread, ThreadRecord> {
    CommandDescriptor::new("CreateThread", |ctx, input: CreateThread| {
        let author_id = acting_user(ctx)?;
        if COMMUNITIES.get(ctx.tx(), &input.community_id.to_string())?.is_none() {
            return Err(OperationError::not_found(format!("community {}", input.community_id)));
        }

        let thread = ThreadRecord {
            thread_id: input.thread_id,
            community_id: input.community_id,
            author_id,
            title: input.title,
            body: input.body,
            created_at: ctx.now(),
        };
        if !THREADS.insert(ctx.tx(), &thread.thread_id.to_string(), &thread)? {
            return Err(OperationError::invalid_state(format!("thread {} already exists", thread.thread_id)));
        }

        ctx.emit(&ThreadCreated {
            thread_id: thread.thread_id,
            community_id: thread.community_id,
            author_id,
            title: thread.title.clone(),
        })?;
        Ok(thread)
    })
    .guard(RequireRole::new(Role::ANY, |input: &CreateThread| input.community_id))
    .guard(RequireTier::at_least(TrustTier::VerifiedWallet).with_upgrade(TierUpgrade::wallet_age()))
}

pub fn delete_thread() -> CommandDescriptor<DeleteThread, ()> {
    CommandDescriptor::new("DeleteThread", |ctx, input: DeleteThread| {
        let key = input.thread_id.to_string();
        let thread = THREADS
            .get(ctx.tx(), &key)?
            .ok_or_else(|| OperationError::not_found(format!("thread {}", input.thread_id)))?;
        THREADS.delete(ctx.tx(), &key)?;

        let deleted_by = ctx.actor().user_id();
        ctx.emit(&ThreadDeleted {
            thread_id: thread.thread_id,
            community_id: thread.community_id,
            deleted_by,
        })?;
        Ok(())
    })
    .guard(RequireOwner::new(|input: &DeleteThread| AggregateRef::thread(input.thread_id)))
}

/// Grants XP once per action key. A repeated grant is a no-op, not an error,
/// so redelivered events can invoke it freely.
pub fn award_xp() -> CommandDescriptor<AwardXp, AwardOutcome> {
    CommandDescriptor::new("AwardXp", |ctx, input: AwardXp| {
        let entry = XpLogEntry {
            user_id: input.user_id,
            action_key: input.action_key,
            xp: input.xp,
            awarded_at: ctx.now(),
        };
        let key = xp_log_key(entry.user_id, &entry.action_key);
        if insert_once(ctx.tx(), XP_LOG, &key, &entry)? == Effect::AlreadyApplied {
            return Ok(AwardOutcome { awarded: false });
        }

        let balance_key = entry.user_id.to_string();
        let mut balance = XP_BALANCES.get(ctx.tx(), &balance_key)?.unwrap_or_default();
        balance.xp += u64::from(entry.xp);
        XP_BALANCES.put(ctx.tx(), &balance_key, &balance)?;

        ctx.emit(&XpAwarded {
            user_id: entry.user_id,
            action_key: entry.action_key,
            xp: entry.xp,
        })?;
        Ok(AwardOutcome { awarded: true })
    })
    .guard(RequireSystem)
}

pub fn ban_user() -> CommandDescriptor<BanUser, BanOutcome> {
    CommandDescriptor::new("BanUser", |ctx, input: BanUser| {
        let key = input.user_id.to_string();
        if USERS.get(ctx.tx(), &key)?.is_none() {
            return Err(OperationError::not_found(format!("user {}", input.user_id)));
        }

        let effect = transition(ctx.tx(), USERS, &key, |current| match current {
            Some(user) if !user.banned => Some(UserRecord {
                banned: true,
                tier: TrustTier::Banned,
                ..user.clone()
            }),
            _ => None,
        })?;
        if effect.applied() {
            ctx.emit(&UserBanned {
                user_id: input.user_id,
                reason: input.reason,
            })?;
        }
        Ok(BanOutcome {
            changed: effect.applied(),
        })
    })
    .guard(RequireSystem)
}
