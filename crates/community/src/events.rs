use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use civitas_auth::Role;
use civitas_core::{AggregateRef, CommunityId, ThreadId, UserId};
use civitas_events::Event;

/// Event: UserRegistered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRegistered {
    pub user_id: UserId,
    pub address: String,
    pub referred_by: Option<UserId>,
    pub registered_at: DateTime<Utc>,
}

impl Event for UserRegistered {
    const NAME: &'static str = "UserRegistered";

    fn aggregate(&self) -> AggregateRef {
        AggregateRef::user(self.user_id)
    }
}

/// Event: CommunityCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityCreated {
    pub community_id: CommunityId,
    pub name: String,
    pub created_by: UserId,
}

impl Event for CommunityCreated {
    const NAME: &'static str = "CommunityCreated";

    fn aggregate(&self) -> AggregateRef {
        AggregateRef::community(self.community_id)
    }
}

/// Event: CommunityJoined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityJoined {
    pub community_id: CommunityId,
    pub user_id: UserId,
    pub role: Role,
}

impl Event for CommunityJoined {
    const NAME: &'static str = "CommunityJoined";

    fn aggregate(&self) -> AggregateRef {
        AggregateRef::community(self.community_id)
    }
}

/// Event: ThreadCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadCreated {
    pub thread_id: ThreadId,
    pub community_id: CommunityId,
    pub author_id: UserId,
    pub title: String,
}

impl Event for ThreadCreated {
    const NAME: &'static str = "ThreadCreated";

    fn aggregate(&self) -> AggregateRef {
        AggregateRef::thread(self.thread_id)
    }
}

/// Event: ThreadDeleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadDeleted {
    pub thread_id: ThreadId,
    pub community_id: CommunityId,
    /// `None` when removed by an internal caller.
    pub deleted_by: Option<UserId>,
}

impl Event for ThreadDeleted {
    const NAME: &'static str = "ThreadDeleted";

    fn aggregate(&self) -> AggregateRef {
        AggregateRef::thread(self.thread_id)
    }
}

/// Event: XpAwarded.
///
/// Emitted once per `(user_id, action_key)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XpAwarded {
    pub user_id: UserId,
    pub action_key: String,
    pub xp: u32,
}

impl Event for XpAwarded {
    const NAME: &'static str = "XpAwarded";

    fn aggregate(&self) -> AggregateRef {
        AggregateRef::user(self.user_id)
    }
}

/// Event: UserBanned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBanned {
    pub user_id: UserId,
    pub reason: String,
}

impl Event for UserBanned {
    const NAME: &'static str = "UserBanned";

    fn aggregate(&self) -> AggregateRef {
        AggregateRef::user(self.user_id)
    }
}
