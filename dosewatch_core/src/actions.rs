//! User-initiated changes: adding and retiring medicines, logging doses.

use crate::schedule;
use crate::store::{events_for_day, EntityStore, Write};
use crate::{DoseLogEvent, Error, EventSource, Medicine, Result, UserId};
use chrono::{DateTime, NaiveTime, TimeZone};
use uuid::Uuid;

fn find_medicine<S>(store: &S, user: &UserId, medicine_id: Uuid) -> Result<Medicine>
where
    S: EntityStore + ?Sized,
{
    store
        .medicines_for_user(user)?
        .into_iter()
        .find(|m| m.id == medicine_id)
        .ok_or_else(|| Error::NotFound(format!("medicine {} for user {}", medicine_id, user)))
}

fn commit<S: EntityStore + ?Sized>(store: &mut S) -> Result<()> {
    if let Err(e) = store.save() {
        let discarded = store.discard();
        tracing::error!("Commit failed, discarded {} staged writes: {}", discarded, e);
        return Err(e);
    }
    Ok(())
}

/// Persist a new medicine
pub fn add_medicine<S: EntityStore + ?Sized>(store: &mut S, medicine: Medicine) -> Result<Medicine> {
    if medicine.name.trim().is_empty() {
        return Err(Error::InvalidInput("medicine name must not be empty".into()));
    }
    if medicine.end_date < medicine.start_date {
        return Err(Error::InvalidInput(format!(
            "end date {} is before start date {}",
            medicine.end_date, medicine.start_date
        )));
    }

    store.stage(Write::UpsertMedicine(medicine.clone()));
    commit(store)?;
    tracing::info!("Added medicine {} ({})", medicine.name, medicine.id);
    Ok(medicine)
}

/// Mark a medicine inactive from today
pub fn deactivate_medicine<S, Tz>(
    store: &mut S,
    user: &UserId,
    medicine_id: Uuid,
    now: &DateTime<Tz>,
) -> Result<Medicine>
where
    S: EntityStore + ?Sized,
    Tz: TimeZone,
{
    let mut medicine = find_medicine(&*store, user, medicine_id)?;
    let today = now.date_naive();
    store.stage(Write::Deactivate {
        medicine_id,
        since: today,
    });
    commit(store)?;

    if medicine.is_active {
        medicine.deactivate(today);
    }
    Ok(medicine)
}

/// Delete a medicine owned by `user`, with its doses and events
pub fn remove_medicine<S>(store: &mut S, user: &UserId, medicine_id: Uuid) -> Result<()>
where
    S: EntityStore + ?Sized,
{
    find_medicine(&*store, user, medicine_id)?;
    store.delete_medicine(medicine_id)?;
    Ok(())
}

/// Record that the user took (or skipped) today's dose at `time`.
///
/// The event takes over the dose's slot for today, replacing a synthesized
/// missed event if one exists. The dose's taken flag follows the event, and
/// the user's completed counter moves only when the slot changes between
/// taken and not taken. Flag and counter are applied to the committed
/// records, not to the copies read here.
pub fn record_dose<S, Tz>(
    store: &mut S,
    user: &UserId,
    medicine_id: Uuid,
    time: NaiveTime,
    taken: bool,
    now: &DateTime<Tz>,
) -> Result<DoseLogEvent>
where
    S: EntityStore + ?Sized,
    Tz: TimeZone,
{
    let medicine = find_medicine(&*store, user, medicine_id)?;
    let dose = medicine.dose_at(time).cloned().ok_or_else(|| {
        Error::NotFound(format!(
            "no dose of {} scheduled at {}",
            medicine.name,
            time.format("%H:%M")
        ))
    })?;
    let (day_start, _) = schedule::day_bounds(now)?;
    let was_taken = events_for_day(&*store, user, now)?
        .iter()
        .any(|e| e.is_taken && e.medicine_id == medicine.id && e.dose_id == dose.id);

    let event = DoseLogEvent::new(&medicine, &dose, taken, now, &day_start, EventSource::User);
    store.stage(Write::SupersedeEvent(event.clone()));
    store.stage(Write::SetDoseTaken {
        medicine_id: medicine.id,
        dose_id: dose.id,
        is_taken: taken,
    });

    let delta = match (was_taken, taken) {
        (false, true) => 1,
        (true, false) => -1,
        _ => 0,
    };
    if delta != 0 {
        store.stage(Write::AdjustCompleted {
            user: user.clone(),
            delta,
            now: now.fixed_offset(),
        });
    }

    commit(store)?;
    tracing::info!(
        "Logged {} dose of {} at {}",
        if taken { "taken" } else { "missed" },
        medicine.name,
        time.format("%H:%M")
    );
    Ok(event)
}
