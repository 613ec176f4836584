//! Trust tiers and the lazy upgrade rule.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Verification level of a user, ordered from least to most trusted.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustTier {
    Incomplete = 0,
    Banned = 1,
    NewlyVerifiedWallet = 2,
    VerifiedWallet = 3,
    SocialVerified = 4,
    ChainVerified = 5,
    FullyVerified = 6,
    ManuallyVerified = 7,
    System = 8,
}

impl TrustTier {
    pub fn level(&self) -> u8 {
        *self as u8
    }

    pub fn from_level(level: u8) -> Option<Self> {
        Some(match level {
            0 => TrustTier::Incomplete,
            1 => TrustTier::Banned,
            2 => TrustTier::NewlyVerifiedWallet,
            3 => TrustTier::VerifiedWallet,
            4 => TrustTier::SocialVerified,
            5 => TrustTier::ChainVerified,
            6 => TrustTier::FullyVerified,
            7 => TrustTier::ManuallyVerified,
            8 => TrustTier::System,
            _ => return None,
        })
    }
}

impl core::fmt::Display for TrustTier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}({})", self, self.level())
    }
}

/// A tier promotion that becomes due once an account is old enough.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TierUpgrade {
    pub from: TrustTier,
    pub to: TrustTier,
    pub min_account_age: Duration,
}

impl TierUpgrade {
    /// Fresh wallets are promoted to `VerifiedWallet` after one week.
    pub fn wallet_age() -> Self {
        Self {
            from: TrustTier::NewlyVerifiedWallet,
            to: TrustTier::VerifiedWallet,
            min_account_age: Duration::weeks(1),
        }
    }

    /// Target tier if the upgrade applies right now; upgrades never lower a tier.
    pub fn due(&self, current: TrustTier, registered_at: DateTime<Utc>, now: DateTime<Utc>) -> Option<TrustTier> {
        if current != self.from || self.to <= current {
            return None;
        }
        (now - registered_at >= self.min_account_age).then_some(self.to)
    }
}
