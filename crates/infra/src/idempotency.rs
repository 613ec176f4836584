//! Building blocks for handlers that must tolerate redelivery.
//!
//! Three shapes cover every consumer in the workspace:
//!
//! - **insert once**: the effect is a row keyed by something unique to the
//!   event; a second delivery finds the row and does nothing
//! - **transition**: read the current state and write only if it is not
//!   already the target state
//! - **credit delta**: recompute a total from the source of truth and credit
//!   only the difference from what was already credited

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::datastore::{StoreResult, Table, Transaction};

/// Whether a call changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Applied,
    AlreadyApplied,
}

impl Effect {
    pub fn applied(self) -> bool {
        matches!(self, Effect::Applied)
    }
}

impl From<bool> for Effect {
    fn from(applied: bool) -> Self {
        if applied { Effect::Applied } else { Effect::AlreadyApplied }
    }
}

pub fn insert_once<T>(tx: &mut dyn Transaction, table: Table<T>, key: &str, row: &T) -> StoreResult<Effect>
where
    T: Serialize + DeserializeOwned,
{
    table.insert(tx, key, row).map(Effect::from)
}

/// Conditionally rewrite one row.
///
/// `step` sees the current row (if any) and returns the row to write, or
/// `None` when the row is already where it should be.
pub fn transition<T, F>(tx: &mut dyn Transaction, table: Table<T>, key: &str, step: F) -> StoreResult<Effect>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce(Option<&T>) -> Option<T>,
{
    let current = table.get(tx, key)?;
    match step(current.as_ref()) {
        Some(next) => {
            table.put(tx, key, &next)?;
            Ok(Effect::Applied)
        }
        None => Ok(Effect::AlreadyApplied),
    }
}

/// Amount still owed given what the source of truth says is due.
///
/// Never negative: an over-credit is not clawed back.
pub fn credit_delta(computed: i64, already_credited: i64) -> i64 {
    (computed - already_credited).max(0)
}
