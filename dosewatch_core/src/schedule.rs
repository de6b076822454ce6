//! Projection of daily dose times onto a concrete day.
//!
//! A dose is stored as a time of day only. Each pass places it on the
//! calendar date of "now" (in now's time zone) and classifies it as due or
//! pending. Local times that do not exist on that date are skipped for the
//! pass rather than treated as errors.

use crate::{Error, Medicine, Result, ScheduledDose};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Timelike};

/// Today's occurrence of a scheduled dose
#[derive(Clone, Debug)]
pub struct Occurrence<Tz: TimeZone> {
    pub at: DateTime<Tz>,
    is_due_now: bool,
}

impl<Tz: TimeZone> Occurrence<Tz> {
    /// The occurrence is at or before now
    pub fn is_due_now(&self) -> bool {
        self.is_due_now
    }

    /// The occurrence is strictly after now
    pub fn is_pending(&self) -> bool {
        !self.is_due_now
    }
}

/// A dose whose occurrence today has been reached
#[derive(Clone, Debug)]
pub struct DueDose<'a, Tz: TimeZone> {
    pub medicine: &'a Medicine,
    pub dose: &'a ScheduledDose,
    pub occurrence: DateTime<Tz>,
}

/// Place a time of day on `now`'s calendar date, at zero seconds.
///
/// Returns `None` when the local time does not exist on that date (for
/// example inside a daylight-saving gap). Ambiguous times resolve to the
/// earlier instant.
pub fn resolve<Tz: TimeZone>(time_of_day: NaiveTime, now: &DateTime<Tz>) -> Option<Occurrence<Tz>> {
    let time = NaiveTime::from_hms_opt(time_of_day.hour(), time_of_day.minute(), 0)?;
    let local = now.date_naive().and_time(time);

    match now.timezone().from_local_datetime(&local).earliest() {
        Some(at) => {
            let is_due_now = at <= *now;
            Some(Occurrence { at, is_due_now })
        }
        None => {
            tracing::warn!(
                "Cannot place dose time {} on {}, skipping it for this pass",
                time_of_day.format("%H:%M"),
                now.date_naive()
            );
            None
        }
    }
}

/// First valid instant of `date` in `tz`
pub fn start_of_day<Tz: TimeZone>(date: NaiveDate, tz: &Tz) -> Option<DateTime<Tz>> {
    // Midnight can fall in a DST gap; the day then starts at the first valid hour
    (0..24).find_map(|hour| {
        let local = date.and_hms_opt(hour, 0, 0)?;
        tz.from_local_datetime(&local).earliest()
    })
}

/// Start of `now`'s day and start of the following day
pub fn day_bounds<Tz: TimeZone>(now: &DateTime<Tz>) -> Result<(DateTime<Tz>, DateTime<Tz>)> {
    let today = now.date_naive();
    let tz = now.timezone();
    let start = start_of_day(today, &tz);
    let end = today.succ_opt().and_then(|tomorrow| start_of_day(tomorrow, &tz));

    match (start, end) {
        (Some(start), Some(end)) => Ok((start, end)),
        _ => Err(Error::Other(format!("Cannot determine bounds of day {}", today))),
    }
}

/// Hour and minute equality; seconds are not part of a schedule
pub fn same_minute(a: NaiveTime, b: NaiveTime) -> bool {
    a.hour() == b.hour() && a.minute() == b.minute()
}

/// Every dose of the medicines scheduled today whose occurrence is at or before now.
///
/// Medicines that are inactive or outside their date window are skipped even
/// if the caller already filtered them, so a stale list is safe to pass.
pub fn due_doses<'a, Tz: TimeZone>(medicines: &'a [Medicine], now: &DateTime<Tz>) -> Vec<DueDose<'a, Tz>> {
    medicines
        .iter()
        .filter(|medicine| medicine.is_scheduled_today(now))
        .flat_map(|medicine| {
            medicine.doses.iter().filter_map(move |dose| {
                let occurrence = dose.occurrence_today(now)?;
                occurrence.is_due_now().then(|| DueDose {
                    medicine,
                    dose,
                    occurrence: occurrence.at,
                })
            })
        })
        .collect()
}

/// Parse a dose time written as `HH:MM`
pub fn parse_time_of_day(input: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(input.trim(), "%H:%M")
        .map_err(|e| Error::InvalidInput(format!("Invalid time '{}': {} (expected HH:MM)", input, e)))
}
