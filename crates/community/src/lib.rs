//! Community domain: users, communities, threads and XP.
//!
//! Commands and queries are descriptors run by the infra executors. Policies
//! and the stats projection consume the outbox those commands write.

pub mod app;
pub mod commands;
pub mod events;
pub mod model;
pub mod policies;
pub mod projections;
pub mod queries;

pub use app::{CommunityApp, WiringError};
pub use commands::{
    AwardOutcome, AwardXp, BanOutcome, BanUser, CommunityCommands, CreateCommunity, CreateThread, DeleteThread,
    JoinCommunity, RegisterUser, RegisteredUser,
};
pub use events::{
    CommunityCreated, CommunityJoined, ThreadCreated, ThreadDeleted, UserBanned, UserRegistered, XpAwarded,
};
pub use model::{CommunityRecord, CommunityStats, ThreadRecord, XpBalance};
pub use policies::{NotifyThreadCreated, ReferralXpPolicy, ThreadXpPolicy};
pub use projections::CommunityStatsProjection;
pub use queries::{
    CommunityQueries, GetCommunityStats, GetUserProfile, ListCommunityMembers, MemberView, UserProfile,
};
