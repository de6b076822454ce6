//! Missed-dose reconciliation.
//!
//! Every due dose of today must end up with exactly one log event. When a
//! dose is overdue and nothing has been logged for it today, a missed event
//! is synthesized. Running the pass again with nothing changed creates no
//! further events.

use crate::schedule::{self, due_doses};
use crate::store::{events_for_day, EntityStore, Write};
use crate::{DoseLogEvent, Error, EventSource, Medicine, Result};
use chrono::{DateTime, TimeZone};
use std::collections::{BTreeSet, HashSet};

/// Missed events needed for today's overdue, unlogged doses
///
/// `events` may contain events of any day; only those recorded for `now`'s
/// calendar day count.
pub fn plan_missed_events<Tz: TimeZone>(
    medicines: &[Medicine],
    events: &[DoseLogEvent],
    now: &DateTime<Tz>,
) -> Vec<DoseLogEvent> {
    let day_start = match schedule::start_of_day(now.date_naive(), &now.timezone()) {
        Some(start) => start,
        None => {
            tracing::warn!("Cannot find the start of {}, skipping reconciliation", now.date_naive());
            return Vec::new();
        }
    };

    let mut recorded: HashSet<_> = events
        .iter()
        .filter(|e| e.is_on_day_of(now))
        .map(|e| (e.medicine_id, e.dose_id))
        .collect();

    due_doses(medicines, now)
        .into_iter()
        .filter(|due| recorded.insert((due.medicine.id, due.dose.id)))
        .map(|due| {
            DoseLogEvent::new(
                due.medicine,
                due.dose,
                false,
                &due.occurrence,
                &day_start,
                EventSource::Reconciled,
            )
        })
        .collect()
}

/// Synthesize and persist missed events for `medicines` as of `now`.
///
/// All new events are committed in one save. If the save fails the staged
/// events are discarded and the error returned; nothing is partially
/// applied. Events the store rejected as duplicates are not returned.
pub fn reconcile<S, Tz>(store: &mut S, medicines: &[Medicine], now: &DateTime<Tz>) -> Result<Vec<DoseLogEvent>>
where
    S: EntityStore + ?Sized,
    Tz: TimeZone,
{
    let users: BTreeSet<_> = medicines.iter().map(|m| &m.user_id).collect();
    let mut existing = Vec::new();
    for user in users {
        existing.extend(events_for_day(&*store, user, now)?);
    }

    let planned = plan_missed_events(medicines, &existing, now);
    if planned.is_empty() {
        tracing::debug!("No overdue unlogged doses");
        return Ok(planned);
    }

    for event in &planned {
        store.stage(Write::InsertEvent(event.clone()));
    }

    match store.save() {
        Ok(summary) => {
            let created: Vec<_> = planned
                .into_iter()
                .filter(|e| !summary.dropped_events.contains(&e.id))
                .collect();
            tracing::info!(
                "Recorded {} missed doses (revision {})",
                created.len(),
                summary.revision
            );
            Ok(created)
        }
        Err(e) => {
            let discarded = store.discard();
            tracing::error!(
                "Failed to record {} missed doses, discarded {} staged writes: {}",
                planned.len(),
                discarded,
                e
            );
            Err(match e {
                Error::Storage(_) => e,
                other => Error::Storage(other.to_string()),
            })
        }
    }
}
