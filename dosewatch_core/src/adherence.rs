//! Daily adherence calculation.
//!
//! Pure functions of a medicine/event snapshot and "now": no state, no I/O.

use crate::schedule::due_doses;
use crate::{DoseLogEvent, Medicine};
use chrono::{DateTime, NaiveDate, TimeZone};
use serde::Serialize;
use std::collections::HashSet;
use uuid::Uuid;

/// Per-medicine breakdown for today
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct MedicineAdherence {
    pub medicine_id: Uuid,
    pub name: String,
    pub due: usize,
    pub taken: usize,
    pub missed: usize,
    pub pending: usize,
    pub percentage: u8,
}

/// Today's adherence across all of a user's scheduled medicines
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct AdherenceReport {
    pub date: NaiveDate,
    pub due: usize,
    pub taken: usize,
    pub overall: u8,
    pub medicines: Vec<MedicineAdherence>,
}

/// Percentage of due doses taken, rounded. No due doses means full adherence.
pub fn percentage(taken: usize, due: usize) -> u8 {
    if due == 0 {
        return 100;
    }
    let taken = taken.min(due);
    ((taken as f64 / due as f64) * 100.0).round() as u8
}

/// (medicine, dose) pairs with a taken event on `now`'s calendar day
fn taken_today<Tz: TimeZone>(events: &[DoseLogEvent], now: &DateTime<Tz>) -> HashSet<(Uuid, Uuid)> {
    events
        .iter()
        .filter(|e| e.is_taken && e.is_on_day_of(now))
        .map(|e| (e.medicine_id, e.dose_id))
        .collect()
}

/// Overall daily adherence in `[0, 100]`
pub fn compute_adherence<Tz: TimeZone>(
    medicines: &[Medicine],
    events: &[DoseLogEvent],
    now: &DateTime<Tz>,
) -> u8 {
    let taken_pairs = taken_today(events, now);
    let due = due_doses(medicines, now);
    let taken = due
        .iter()
        .filter(|d| taken_pairs.contains(&(d.medicine.id, d.dose.id)))
        .count();

    percentage(taken, due.len())
}

/// Overall adherence plus a breakdown per scheduled medicine
pub fn daily_report<Tz: TimeZone>(
    medicines: &[Medicine],
    events: &[DoseLogEvent],
    now: &DateTime<Tz>,
) -> AdherenceReport {
    let taken_pairs = taken_today(events, now);

    let breakdown: Vec<MedicineAdherence> = medicines
        .iter()
        .filter(|m| m.is_scheduled_today(now))
        .map(|medicine| {
            let due = due_doses(std::slice::from_ref(medicine), now);
            let taken = due
                .iter()
                .filter(|d| taken_pairs.contains(&(medicine.id, d.dose.id)))
                .count();
            MedicineAdherence {
                medicine_id: medicine.id,
                name: medicine.name.clone(),
                due: due.len(),
                taken,
                missed: due.len() - taken,
                pending: medicine.doses.len() - due.len(),
                percentage: percentage(taken, due.len()),
            }
        })
        .collect();

    let due: usize = breakdown.iter().map(|m| m.due).sum();
    let taken: usize = breakdown.iter().map(|m| m.taken).sum();

    AdherenceReport {
        date: now.date_naive(),
        due,
        taken,
        overall: percentage(taken, due),
        medicines: breakdown,
    }
}
