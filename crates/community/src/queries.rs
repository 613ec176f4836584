use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use civitas_auth::{RequireRole, Role, TrustTier};
use civitas_core::{CommunityId, UserId, Validate};
use civitas_infra::accounts::{COMMUNITY_MEMBERS, MEMBERSHIPS, USERS};
use civitas_infra::{OperationError, QueryDescriptor};

use crate::model::{COMMUNITY_STATS, CommunityStats, XP_BALANCES};

/// Query: GetCommunityStats. Public.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetCommunityStats {
    pub community_id: CommunityId,
}

impl Validate for GetCommunityStats {}

/// Query: GetUserProfile. Public.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetUserProfile {
    pub user_id: UserId,
}

impl Validate for GetUserProfile {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub address: String,
    pub tier: TrustTier,
    pub xp: u64,
    pub referral_xp: u64,
    pub communities: usize,
    pub registered_at: DateTime<Utc>,
}

impl Validate for UserProfile {}

/// Query: ListCommunityMembers. Members only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListCommunityMembers {
    pub community_id: CommunityId,
}

impl Validate for ListCommunityMembers {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberView {
    pub user_id: UserId,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
}

impl Validate for MemberView {}

pub struct CommunityQueries {
    pub community_stats: Arc<QueryDescriptor<GetCommunityStats, CommunityStats>>,
    pub user_profile: Arc<QueryDescriptor<GetUserProfile, UserProfile>>,
    pub members: Arc<QueryDescriptor<ListCommunityMembers, Vec<MemberView>>>,
}

impl CommunityQueries {
    pub fn new() -> Self {
        Self {
            community_stats: Arc::new(get_community_stats()),
            user_profile: Arc::new(get_user_profile()),
            members: Arc::new(list_community_members()),
        }
    }
}

impl Default for CommunityQueries {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads the projection, so counts trail commits until the next drain.
pub fn get_community_stats() -> QueryDescriptor<GetCommunityStats, CommunityStats> {
    QueryDescriptor::new("GetCommunityStats", |ctx, input: GetCommunityStats| {
        ctx.get(&COMMUNITY_STATS, &input.community_id.to_string())?
            .ok_or_else(|| OperationError::not_found(format!("community {}", input.community_id)))
    })
}

pub fn get_user_profile() -> QueryDescriptor<GetUserProfile, UserProfile> {
    QueryDescriptor::new("GetUserProfile", |ctx, input: GetUserProfile| {
        let key = input.user_id.to_string();
        let user = ctx
            .get(&USERS, &key)?
            .ok_or_else(|| OperationError::not_found(format!("user {}", input.user_id)))?;
        let balance = ctx.get(&XP_BALANCES, &key)?.unwrap_or_default();
        let communities = ctx.scan(&MEMBERSHIPS, &format!("{key}/"))?.len();

        Ok(UserProfile {
            user_id: user.user_id,
            address: user.address,
            tier: user.tier,
            xp: balance.xp,
            referral_xp: balance.referral_xp,
            communities,
            registered_at: user.registered_at,
        })
    })
}

pub fn list_community_members() -> QueryDescriptor<ListCommunityMembers, Vec<MemberView>> {
    QueryDescriptor::new("ListCommunityMembers", |ctx, input: ListCommunityMembers| {
        let members = ctx
            .scan(&COMMUNITY_MEMBERS, &format!("{}/", input.community_id))?
            .into_iter()
            .map(|(_, m)| MemberView {
                user_id: m.user_id,
                role: m.role,
                joined_at: m.joined_at,
            })
            .collect();
        Ok(members)
    })
    .guard(RequireRole::new(Role::ANY, |input: &ListCommunityMembers| input.community_id))
}
