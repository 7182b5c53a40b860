//! Decides which listed snapshot objects are (re)processed in a cycle.

use chrono::{DateTime, Duration, Utc};
use pubsync_core::{ObjectListing, SyncOutcome};
use tracing::{debug, warn};

use crate::config::LookupFailurePolicy;
use crate::outcome::OutcomeStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionReason {
    /// Modified inside `[now + lookback, now]`.
    InWindow,
    /// Outside the window but the last attempt for this key failed.
    PreviousFailure,
    /// Outcome lookup failed and the policy is to reprocess.
    LookupFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedObject {
    pub listing: ObjectListing,
    pub reason: SelectionReason,
}

/// Inclusive `[now + lookback, now]`. A window start before the earliest
/// representable instant leaves the window open at that end.
pub fn within_window(last_modified: DateTime<Utc>, now: DateTime<Utc>, lookback: Duration) -> bool {
    let after_start = now
        .checked_add_signed(lookback)
        .map_or(true, |start| last_modified >= start);
    after_start && last_modified <= now
}

/// What the outcome store knows about a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorOutcome {
    NeverSeen,
    Succeeded,
    Failed,
    LookupFailed,
}

impl From<&Result<Option<SyncOutcome>, sqlx::Error>> for PriorOutcome {
    fn from(lookup: &Result<Option<SyncOutcome>, sqlx::Error>) -> Self {
        match lookup {
            Ok(None) => PriorOutcome::NeverSeen,
            Ok(Some(outcome)) if outcome.had_error => PriorOutcome::Failed,
            Ok(Some(_)) => PriorOutcome::Succeeded,
            Err(_) => PriorOutcome::LookupFailed,
        }
    }
}

pub fn decide(
    in_window: bool,
    prior: PriorOutcome,
    policy: LookupFailurePolicy,
) -> Option<SelectionReason> {
    if in_window {
        return Some(SelectionReason::InWindow);
    }
    match (prior, policy) {
        (PriorOutcome::Failed, _) => Some(SelectionReason::PreviousFailure),
        (PriorOutcome::LookupFailed, LookupFailurePolicy::Reprocess) => {
            Some(SelectionReason::LookupFailed)
        }
        (PriorOutcome::LookupFailed, LookupFailurePolicy::Skip)
        | (PriorOutcome::NeverSeen, _)
        | (PriorOutcome::Succeeded, _) => None,
    }
}

/// Filters `listings` down to the objects to process, preserving listing order.
/// The outcome store is only consulted for objects outside the window.
pub async fn select_objects(
    listings: Vec<ObjectListing>,
    outcomes: &dyn OutcomeStore,
    now: DateTime<Utc>,
    lookback: Duration,
    policy: LookupFailurePolicy,
) -> Vec<SelectedObject> {
    let mut selected = Vec::new();
    for listing in listings {
        if within_window(listing.last_modified, now, lookback) {
            selected.push(SelectedObject {
                listing,
                reason: SelectionReason::InWindow,
            });
            continue;
        }
        let lookup = outcomes.last_outcome(&listing.key).await;
        if let Err(err) = &lookup {
            warn!(key = %listing.key, ?policy, error = %err, "outcome lookup failed");
        }
        if let Some(reason) = decide(false, PriorOutcome::from(&lookup), policy) {
            debug!(key = %listing.key, ?reason, "selected snapshot object");
            selected.push(SelectedObject { listing, reason });
        }
    }
    selected
}
