//! Side-effect consumers of community events.
//!
//! Every handler here may see the same record more than once; each one
//! states which idempotency shape it relies on.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use civitas_auth::Actor;
use civitas_core::UserId;
use civitas_events::{Event, OutboxRecord};
use civitas_infra::accounts::{COMMUNITY_MEMBERS, USERS};
use civitas_infra::idempotency::{Effect, credit_delta, insert_once};
use civitas_infra::notify::NotificationProvider;
use civitas_infra::policy::{self, Policy, PolicyContext};
use civitas_infra::{CommandDescriptor, CommandExecutor, PolicyError, Transaction};

use crate::commands::{AwardOutcome, AwardXp};
use crate::events::{ThreadCreated, XpAwarded};
use crate::model::{NOTIFICATIONS_SENT, REFERRAL_CREDITS, ReferralCredit, XP_BALANCES, XP_LOG, referral_key};

/// XP for starting a thread.
pub const THREAD_CREATED_XP: u32 = 10;

/// Share of each action's XP credited to the referrer: `xp / REFERRAL_DIVISOR`,
/// rounded down per action.
pub const REFERRAL_DIVISOR: u32 = 10;

/// Rewards thread authors through `AwardXp`, which is unique per action key.
pub struct ThreadXpPolicy {
    executor: Arc<CommandExecutor>,
    award_xp: Arc<CommandDescriptor<AwardXp, AwardOutcome>>,
}

impl ThreadXpPolicy {
    pub fn new(executor: Arc<CommandExecutor>, award_xp: Arc<CommandDescriptor<AwardXp, AwardOutcome>>) -> Self {
        Self { executor, award_xp }
    }
}

impl Policy for ThreadXpPolicy {
    fn name(&self) -> &'static str {
        "ThreadXpPolicy"
    }

    fn inputs(&self) -> &'static [&'static str] {
        &[ThreadCreated::NAME]
    }

    fn handle(&self, ctx: &mut PolicyContext<'_>, record: &OutboxRecord) -> Result<(), PolicyError> {
        let event: ThreadCreated = policy::decode(record)?;
        let actor = Actor::from(ctx.system().clone());
        let now = record.envelope.created_at();

        let outcome = self.executor.execute_within(
            ctx.tx(),
            &*self.award_xp,
            actor,
            AwardXp {
                user_id: event.author_id,
                action_key: format!("thread:{}", event.thread_id),
                xp: THREAD_CREATED_XP,
            },
            now,
        )?;
        if !outcome.awarded {
            debug!(thread_id = %event.thread_id, "thread xp already awarded");
        }
        Ok(())
    }
}

/// Credits referrers with a share of their referees' XP.
///
/// The owed amount is recomputed from the referee's whole XP log on every
/// delivery and only the difference to what was already credited is paid,
/// so any number of redeliveries converge on the same total.
#[derive(Debug, Default)]
pub struct ReferralXpPolicy;

impl ReferralXpPolicy {
    pub fn owed_for(log: impl IntoIterator<Item = u32>) -> u64 {
        log.into_iter()
            .map(|xp| u64::from(xp / REFERRAL_DIVISOR))
            .sum()
    }
}

impl Policy for ReferralXpPolicy {
    fn name(&self) -> &'static str {
        "ReferralXpPolicy"
    }

    fn inputs(&self) -> &'static [&'static str] {
        &[XpAwarded::NAME]
    }

    fn handle(&self, ctx: &mut PolicyContext<'_>, record: &OutboxRecord) -> Result<(), PolicyError> {
        let event: XpAwarded = policy::decode(record)?;
        let tx = ctx.tx();
        let Some(user) = USERS.get(tx, &event.user_id.to_string())? else {
            return Ok(());
        };
        let Some(referrer) = user.referred_by else {
            return Ok(());
        };

        let computed = Self::owed_for(
            XP_LOG
                .scan(tx, &format!("{}/", event.user_id))?
                .into_iter()
                .map(|(_, entry)| entry.xp),
        );
        let key = referral_key(referrer, event.user_id);
        let mut credit = REFERRAL_CREDITS.get(tx, &key)?.unwrap_or(ReferralCredit {
            referrer,
            referee: event.user_id,
            credited: 0,
        });

        let delta = credit_delta(to_i64(computed), to_i64(credit.credited));
        if delta == 0 {
            return Ok(());
        }
        let delta = delta as u64;
        credit.credited += delta;
        REFERRAL_CREDITS.put(tx, &key, &credit)?;

        let balance_key = referrer.to_string();
        let mut balance = XP_BALANCES.get(tx, &balance_key)?.unwrap_or_default();
        balance.referral_xp += delta;
        XP_BALANCES.put(tx, &balance_key, &balance)?;

        debug!(%referrer, referee = %event.user_id, delta, "referral xp credited");
        Ok(())
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Tells community members about a new thread.
///
/// A marker row is inserted before the provider is called so a redelivered
/// record does not notify twice. Provider failures are logged and swallowed:
/// the marker and processed mark still commit.
pub struct NotifyThreadCreated {
    provider: Arc<dyn NotificationProvider>,
}

impl NotifyThreadCreated {
    pub const WORKFLOW: &'static str = "thread-created";

    pub fn new(provider: Arc<dyn NotificationProvider>) -> Self {
        Self { provider }
    }
}

impl Policy for NotifyThreadCreated {
    fn name(&self) -> &'static str {
        "NotifyThreadCreated"
    }

    fn inputs(&self) -> &'static [&'static str] {
        &[ThreadCreated::NAME]
    }

    fn handle(&self, ctx: &mut PolicyContext<'_>, record: &OutboxRecord) -> Result<(), PolicyError> {
        let event: ThreadCreated = policy::decode(record)?;
        let tx = ctx.tx();
        let marker = format!("{}/{}", Self::WORKFLOW, event.thread_id);
        if insert_once(tx, NOTIFICATIONS_SENT, &marker, &Default::default())? == Effect::AlreadyApplied {
            return Ok(());
        }

        let recipients = community_members(tx, &event)?;
        if recipients.is_empty() {
            return Ok(());
        }
        let data = json!({
            "thread_id": event.thread_id,
            "community_id": event.community_id,
            "author_id": event.author_id,
            "title": event.title,
        });

        match self.provider.trigger_workflow(Self::WORKFLOW, &recipients, &data) {
            Ok(statuses) => {
                let undelivered = statuses.iter().filter(|s| !s.delivered).count();
                if undelivered > 0 {
                    warn!(thread_id = %event.thread_id, undelivered, "some notifications were not delivered");
                }
            }
            Err(err) => warn!(thread_id = %event.thread_id, error = %err, "notification trigger failed"),
        }
        Ok(())
    }
}

fn community_members(tx: &mut dyn Transaction, event: &ThreadCreated) -> Result<Vec<UserId>, PolicyError> {
    Ok(COMMUNITY_MEMBERS
        .scan(tx, &format!("{}/", event.community_id))?
        .into_iter()
        .map(|(_, m)| m.user_id)
        .filter(|user_id| *user_id != event.author_id)
        .collect())
}
