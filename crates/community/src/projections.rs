use tracing::debug;

use civitas_core::CommunityId;
use civitas_events::{Event, OutboxRecord};
use civitas_infra::idempotency::{Effect, insert_once, transition};
use civitas_infra::policy::{self, Policy, PolicyContext, Projection};
use civitas_infra::{PolicyError, StoreResult, Transaction};

use crate::events::{CommunityCreated, CommunityJoined, ThreadCreated, ThreadDeleted};
use crate::model::{COMMUNITY_STATS, COMMUNITY_STATS_INDEX, CommunityStats, Seen};

/// Member and thread counts per community.
///
/// Counters only move when the matching index row is inserted for the first
/// time, so replaying a record leaves them unchanged. Rebuilding truncates
/// both tables and replays from the first outbox record.
#[derive(Debug, Default)]
pub struct CommunityStatsProjection;

impl CommunityStatsProjection {
    pub const NAME: &'static str = "CommunityStats";
}

#[derive(Clone, Copy)]
enum Change {
    Member,
    ThreadAdded,
    ThreadRemoved,
}

fn bump(tx: &mut dyn Transaction, community_id: CommunityId, change: Change) -> StoreResult<Effect> {
    transition(tx, COMMUNITY_STATS, &community_id.to_string(), |current| {
        let mut stats = current
            .cloned()
            .unwrap_or_else(|| CommunityStats::empty(community_id));
        match change {
            Change::Member => stats.members += 1,
            Change::ThreadAdded => stats.threads += 1,
            Change::ThreadRemoved => stats.threads = stats.threads.saturating_sub(1),
        }
        Some(stats)
    })
}

fn first_time(tx: &mut dyn Transaction, key: &str) -> StoreResult<bool> {
    Ok(insert_once(tx, COMMUNITY_STATS_INDEX, key, &Seen {})?.applied())
}

impl Policy for CommunityStatsProjection {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn inputs(&self) -> &'static [&'static str] {
        &[
            CommunityCreated::NAME,
            CommunityJoined::NAME,
            ThreadCreated::NAME,
            ThreadDeleted::NAME,
        ]
    }

    fn handle(&self, ctx: &mut PolicyContext<'_>, record: &OutboxRecord) -> Result<(), PolicyError> {
        let tx = ctx.tx();
        match record.name() {
            CommunityCreated::NAME => {
                let event: CommunityCreated = policy::decode(record)?;
                transition(tx, COMMUNITY_STATS, &event.community_id.to_string(), |current| match current {
                    Some(_) => None,
                    None => Some(CommunityStats::empty(event.community_id)),
                })?;
            }
            CommunityJoined::NAME => {
                let event: CommunityJoined = policy::decode(record)?;
                if first_time(tx, &format!("member/{}/{}", event.community_id, event.user_id))? {
                    bump(tx, event.community_id, Change::Member)?;
                }
            }
            ThreadCreated::NAME => {
                let event: ThreadCreated = policy::decode(record)?;
                if first_time(tx, &format!("thread/{}", event.thread_id))? {
                    bump(tx, event.community_id, Change::ThreadAdded)?;
                }
            }
            ThreadDeleted::NAME => {
                let event: ThreadDeleted = policy::decode(record)?;
                if first_time(tx, &format!("deleted/{}", event.thread_id))? {
                    bump(tx, event.community_id, Change::ThreadRemoved)?;
                }
            }
            other => debug!(event = other, "ignored by community stats"),
        }
        Ok(())
    }
}

impl Projection for CommunityStatsProjection {
    fn tables(&self) -> &'static [&'static str] {
        &["community_stats", "community_stats_index"]
    }
}
