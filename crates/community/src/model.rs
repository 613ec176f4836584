//! Rows owned by the community domain and the tables that hold them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use civitas_core::{CommunityId, ThreadId, UserId, Validate};
use civitas_infra::Table;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityRecord {
    pub community_id: CommunityId,
    pub name: String,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

impl Validate for CommunityRecord {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub thread_id: ThreadId,
    pub community_id: CommunityId,
    pub author_id: UserId,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Validate for ThreadRecord {}

/// One XP grant. The key `<user>/<action_key>` makes grants unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XpLogEntry {
    pub user_id: UserId,
    pub action_key: String,
    pub xp: u32,
    pub awarded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct XpBalance {
    /// XP earned by the user's own actions.
    pub xp: u64,
    /// XP credited from referees' actions.
    pub referral_xp: u64,
}

/// Referral XP already credited to `referrer` for `referee`'s actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralCredit {
    pub referrer: UserId,
    pub referee: UserId,
    pub credited: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityStats {
    pub community_id: CommunityId,
    pub members: u64,
    pub threads: u64,
}

impl Validate for CommunityStats {}

impl CommunityStats {
    pub fn empty(community_id: CommunityId) -> Self {
        Self {
            community_id,
            members: 0,
            threads: 0,
        }
    }
}

/// Marker row; presence is the only information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seen {}

pub const COMMUNITIES: Table<CommunityRecord> = Table::new("communities");
pub const THREADS: Table<ThreadRecord> = Table::new("threads");
pub const XP_LOG: Table<XpLogEntry> = Table::new("xp_log");
pub const XP_BALANCES: Table<XpBalance> = Table::new("xp_balances");
pub const REFERRAL_CREDITS: Table<ReferralCredit> = Table::new("referral_credits");
pub const NOTIFICATIONS_SENT: Table<Seen> = Table::new("notifications_sent");

pub const COMMUNITY_STATS: Table<CommunityStats> = Table::new("community_stats");
/// Which members/threads the stats projection has already counted.
pub const COMMUNITY_STATS_INDEX: Table<Seen> = Table::new("community_stats_index");

pub fn xp_log_key(user_id: UserId, action_key: &str) -> String {
    format!("{user_id}/{action_key}")
}

pub fn referral_key(referrer: UserId, referee: UserId) -> String {
    format!("{referrer}/{referee}")
}
