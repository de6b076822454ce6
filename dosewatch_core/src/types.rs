//! Core domain types for the Dosewatch system.
//!
//! This module defines the records the entity store holds:
//! - Medicines and the daily dose times they own
//! - Dose log events (taken or missed, one per dose per day)
//! - Per-user reminder counters

use crate::schedule::{self, Occurrence};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identity
// ============================================================================

/// Identifier of the user owning medicines and events.
///
/// Supplied by the session layer; the core only filters and tags by it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Scheduled Doses
// ============================================================================

/// Effective state of a dose for today. Derived, never stored.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DoseState {
    Pending,
    Taken,
    Missed,
}

impl fmt::Display for DoseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DoseState::Pending => write!(f, "pending"),
            DoseState::Taken => write!(f, "taken"),
            DoseState::Missed => write!(f, "missed"),
        }
    }
}

/// A daily dose time. Only hour and minute are meaningful.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ScheduledDose {
    pub id: Uuid,
    pub time_of_day: NaiveTime,
    #[serde(default)]
    pub is_taken: bool,
}

impl ScheduledDose {
    pub fn new(time_of_day: NaiveTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            time_of_day,
            is_taken: false,
        }
    }

    /// Today's occurrence of this dose, `None` if it cannot be placed on today's date
    pub fn occurrence_today<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Option<Occurrence<Tz>> {
        schedule::resolve(self.time_of_day, now)
    }

    /// True while today's occurrence is still ahead of `now`.
    ///
    /// A dose that cannot be resolved is never due, so it reads as pending.
    pub fn is_pending<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        self.occurrence_today(now)
            .map_or(true, |occurrence| occurrence.is_pending())
    }

    pub fn effective_state<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> DoseState {
        if self.is_taken {
            DoseState::Taken
        } else if self.is_pending(now) {
            DoseState::Pending
        } else {
            DoseState::Missed
        }
    }

    /// Whether this dose is scheduled at the given hour and minute
    pub fn is_at(&self, time: NaiveTime) -> bool {
        schedule::same_minute(self.time_of_day, time)
    }
}

// ============================================================================
// Medicines
// ============================================================================

/// A medicine on a user's schedule. Owns its dose times.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Medicine {
    pub id: Uuid,
    pub user_id: UserId,
    pub name: String,
    #[serde(default)]
    pub purpose: String,
    pub dosage: String,
    #[serde(default)]
    pub timing: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub is_active: bool,
    #[serde(default)]
    pub inactive_since: Option<NaiveDate>,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub doses: Vec<ScheduledDose>,
}

impl Medicine {
    /// Create an active medicine with no dose times
    pub fn new(
        user_id: UserId,
        name: impl Into<String>,
        dosage: impl Into<String>,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            name: name.into(),
            purpose: String::new(),
            dosage: dosage.into(),
            timing: String::new(),
            start_date,
            end_date,
            is_active: true,
            inactive_since: None,
            last_modified: Utc::now(),
            doses: Vec::new(),
        }
    }

    /// Add a dose time, keeping doses ordered by time of day
    pub fn with_dose(mut self, time_of_day: NaiveTime) -> Self {
        self.doses.push(ScheduledDose::new(time_of_day));
        self.doses.sort_by_key(|d| d.time_of_day);
        self
    }

    pub fn with_purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = purpose.into();
        self
    }

    pub fn with_timing(mut self, timing: impl Into<String>) -> Self {
        self.timing = timing.into();
        self
    }

    pub fn dose(&self, dose_id: Uuid) -> Option<&ScheduledDose> {
        self.doses.iter().find(|d| d.id == dose_id)
    }

    /// Find the dose scheduled at the given hour and minute
    pub fn dose_at(&self, time: NaiveTime) -> Option<&ScheduledDose> {
        self.doses.iter().find(|d| d.is_at(time))
    }

    pub fn dose_at_mut(&mut self, time: NaiveTime) -> Option<&mut ScheduledDose> {
        self.doses.iter_mut().find(|d| d.is_at(time))
    }

    /// Today falls within `[start_date, end_date]`
    pub fn is_currently_active_based_on_dates<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        let today = now.date_naive();
        self.start_date <= today && today <= self.end_date
    }

    pub fn is_future_medicine<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        self.start_date > now.date_naive()
    }

    pub fn has_period_ended<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        self.end_date < now.date_naive()
    }

    /// Active, inside its date window and not ended: the medicine has doses today
    pub fn is_scheduled_today<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        self.is_active && self.is_currently_active_based_on_dates(now) && !self.has_period_ended(now)
    }

    /// Any dose whose occurrence today is strictly before `now` and is not marked taken
    pub fn has_missed_dose_today<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        self.doses.iter().any(|dose| {
            !dose.is_taken
                && dose
                    .occurrence_today(now)
                    .map_or(false, |occurrence| occurrence.at < *now)
        })
    }

    pub fn display_timing_frequency(&self) -> String {
        match self.doses.len() {
            0 => "No specific times".to_string(),
            1 => "Once a day".to_string(),
            n => format!("{} times a day", n),
        }
    }

    /// Mark the medicine inactive from `today` onwards
    pub fn deactivate(&mut self, today: NaiveDate) {
        self.is_active = false;
        self.inactive_since = Some(today);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_modified = Utc::now();
    }
}

// ============================================================================
// Dose Log Events
// ============================================================================

/// Who produced a log event
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// The user marked the dose taken or missed
    User,
    /// Synthesized when an overdue dose had no event
    Reconciled,
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSource::User => write!(f, "user"),
            EventSource::Reconciled => write!(f, "reconciled"),
        }
    }
}

/// Identity of the (medicine, dose, day) slot an event occupies
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub medicine_id: Uuid,
    pub dose_id: Uuid,
    pub day: NaiveDate,
}

/// A taken or missed record for one dose on one calendar day
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DoseLogEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub is_taken: bool,
    pub dose_id: Uuid,
    pub medicine_id: Uuid,
    pub user_id: UserId,
    /// Start of the calendar day this event pertains to
    pub date_recorded: DateTime<Utc>,
    /// That calendar day, as the user's local date
    pub day: NaiveDate,
    pub source: EventSource,
}

impl DoseLogEvent {
    pub fn new<Tz: TimeZone>(
        medicine: &Medicine,
        dose: &ScheduledDose,
        is_taken: bool,
        timestamp: &DateTime<Tz>,
        day_start: &DateTime<Tz>,
        source: EventSource,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: timestamp.with_timezone(&Utc),
            is_taken,
            dose_id: dose.id,
            medicine_id: medicine.id,
            user_id: medicine.user_id.clone(),
            date_recorded: day_start.with_timezone(&Utc),
            day: day_start.date_naive(),
            source,
        }
    }

    pub fn key(&self) -> EventKey {
        EventKey {
            medicine_id: self.medicine_id,
            dose_id: self.dose_id,
            day: self.day,
        }
    }

    /// Recorded for `now`'s local calendar date.
    ///
    /// Compares dates, not instants: the offset in effect can change within
    /// a day without moving an event to another day.
    pub fn is_on_day_of<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        self.day == now.date_naive()
    }

    /// Same medicine, same dose and recorded for `now`'s calendar day
    pub fn matches<Tz: TimeZone>(&self, medicine_id: Uuid, dose_id: Uuid, now: &DateTime<Tz>) -> bool {
        self.medicine_id == medicine_id && self.dose_id == dose_id && self.is_on_day_of(now)
    }
}

// ============================================================================
// Reminders
// ============================================================================

/// Per-user count of doses completed since the last daily reset
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Reminder {
    pub id: Uuid,
    pub user_id: UserId,
    pub completed_times: u32,
    pub last_reset: DateTime<Utc>,
}

impl Reminder {
    pub fn new<Tz: TimeZone>(user_id: UserId, now: &DateTime<Tz>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            completed_times: 0,
            last_reset: now.with_timezone(&Utc),
        }
    }

    /// The last reset happened on an earlier calendar day than `now`
    pub fn needs_reset<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        self.last_reset.with_timezone(&now.timezone()).date_naive() < now.date_naive()
    }

    pub fn reset<Tz: TimeZone>(&mut self, now: &DateTime<Tz>) {
        self.completed_times = 0;
        self.last_reset = now.with_timezone(&Utc);
    }
}
