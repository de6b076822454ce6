//! Entity store abstraction.
//!
//! The store holds medicines (with their doses), dose log events and
//! reminders. Writes are staged and committed together by `save()`; a failed
//! commit leaves nothing behind. Every store enforces the one-event-per-
//! (medicine, dose, day) rule at write time and notifies subscribers after
//! each successful change.

use crate::{DoseLogEvent, Error, EventKey, Medicine, Reminder, Result, UserId};
use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::mpsc::{channel, Receiver, Sender};
use uuid::Uuid;

/// A staged write, applied on the next `save()`
#[derive(Clone, Debug)]
pub enum Write {
    /// Insert or replace a medicine (and its doses) by id
    UpsertMedicine(Medicine),
    /// Append an event; dropped if its (medicine, dose, day) slot is taken
    InsertEvent(DoseLogEvent),
    /// Append an event, replacing whatever occupies its slot
    SupersedeEvent(DoseLogEvent),
    /// Insert or replace a reminder by id
    UpsertReminder(Reminder),
    /// Set one dose's taken flag on the committed medicine
    SetDoseTaken {
        medicine_id: Uuid,
        dose_id: Uuid,
        is_taken: bool,
    },
    /// Mark a medicine inactive from `since`
    Deactivate { medicine_id: Uuid, since: NaiveDate },
    /// Add `delta` to the user's completed counter, creating the reminder if missing
    AdjustCompleted {
        user: UserId,
        delta: i32,
        now: DateTime<FixedOffset>,
    },
    /// Reset the user's reminders last reset before `now`'s day and clear
    /// the taken flags of their doses. No-op when none are stale.
    ResetDay {
        user: UserId,
        now: DateTime<FixedOffset>,
    },
}

/// Outcome of a commit
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub revision: u64,
    pub medicines: usize,
    pub events_inserted: usize,
    pub events_superseded: usize,
    pub reminders: usize,
    /// Events rejected because their slot already had an event
    pub dropped_events: Vec<Uuid>,
}

impl CommitSummary {
    pub fn is_empty(&self) -> bool {
        self.medicines == 0
            && self.events_inserted == 0
            && self.events_superseded == 0
            && self.reminders == 0
            && self.dropped_events.is_empty()
    }
}

/// What a change notification reports
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Commit,
    MedicineDeleted,
    EventsPurged,
}

/// Sent to subscribers after every successful change
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreChange {
    pub revision: u64,
    pub kind: ChangeKind,
}

/// Persistence boundary used by the reconciliation pipeline
pub trait EntityStore {
    /// All medicines owned by `user`, regardless of state
    fn medicines_for_user(&self, user: &UserId) -> Result<Vec<Medicine>>;

    /// Events of `user` with `date_recorded` in `[start, end)`
    fn events_between(
        &self,
        user: &UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DoseLogEvent>>;

    /// Events of `user` recorded for the local calendar date `day`
    fn events_on_day(&self, user: &UserId, day: NaiveDate) -> Result<Vec<DoseLogEvent>>;

    fn reminders_for_user(&self, user: &UserId) -> Result<Vec<Reminder>>;

    /// Queue a write for the next `save()`
    fn stage(&mut self, write: Write);

    /// Commit all staged writes atomically. Staged writes are cleared either way.
    fn save(&mut self) -> Result<CommitSummary>;

    /// Drop staged writes, returning how many there were
    fn discard(&mut self) -> usize;

    /// Remove a medicine with its doses and every event referencing it
    fn delete_medicine(&mut self, id: Uuid) -> Result<bool>;

    /// Remove events recorded for days starting before `cutoff`
    fn purge_events_before(&mut self, cutoff: DateTime<Utc>) -> Result<usize>;

    fn subscribe(&mut self) -> Receiver<StoreChange>;
}

/// Medicines of `user` that have doses today: active, inside their date window, not ended
pub fn active_medicines<S, Tz>(store: &S, user: &UserId, now: &DateTime<Tz>) -> Result<Vec<Medicine>>
where
    S: EntityStore + ?Sized,
    Tz: TimeZone,
{
    let mut medicines = store.medicines_for_user(user)?;
    medicines.retain(|m| m.is_scheduled_today(now));
    Ok(medicines)
}

/// Events of `user` recorded for `now`'s local calendar date
pub fn events_for_day<S, Tz>(store: &S, user: &UserId, now: &DateTime<Tz>) -> Result<Vec<DoseLogEvent>>
where
    S: EntityStore + ?Sized,
    Tz: TimeZone,
{
    store.events_on_day(user, now.date_naive())
}

// ============================================================================
// Snapshot
// ============================================================================

/// The full contents of a store
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub medicines: Vec<Medicine>,
    #[serde(default)]
    pub events: Vec<DoseLogEvent>,
    #[serde(default)]
    pub reminders: Vec<Reminder>,
}

impl Snapshot {
    pub fn medicines_for_user(&self, user: &UserId) -> Vec<Medicine> {
        self.medicines
            .iter()
            .filter(|m| &m.user_id == user)
            .cloned()
            .collect()
    }

    pub fn events_between(
        &self,
        user: &UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<DoseLogEvent> {
        self.events
            .iter()
            .filter(|e| &e.user_id == user && e.date_recorded >= start && e.date_recorded < end)
            .cloned()
            .collect()
    }

    pub fn events_on_day(&self, user: &UserId, day: NaiveDate) -> Vec<DoseLogEvent> {
        self.events
            .iter()
            .filter(|e| &e.user_id == user && e.day == day)
            .cloned()
            .collect()
    }

    pub fn reminders_for_user(&self, user: &UserId) -> Vec<Reminder> {
        self.reminders
            .iter()
            .filter(|r| &r.user_id == user)
            .cloned()
            .collect()
    }

    /// Apply writes all-or-nothing and bump the revision.
    ///
    /// Events must reference an existing medicine and one of its doses,
    /// otherwise the whole batch is rejected.
    pub fn apply(&mut self, writes: Vec<Write>) -> Result<CommitSummary> {
        let mut next = self.clone();
        let mut summary = CommitSummary::default();
        let mut occupied: HashSet<EventKey> = next.events.iter().map(|e| e.key()).collect();

        for write in writes {
            match write {
                Write::UpsertMedicine(medicine) => {
                    match next.medicines.iter_mut().find(|m| m.id == medicine.id) {
                        Some(existing) => *existing = medicine,
                        None => next.medicines.push(medicine),
                    }
                    summary.medicines += 1;
                }
                Write::InsertEvent(event) => {
                    next.check_references(&event)?;
                    if occupied.insert(event.key()) {
                        next.events.push(event);
                        summary.events_inserted += 1;
                    } else {
                        tracing::warn!(
                            "Dropping event {} for dose {}: the slot for {} is already recorded",
                            event.id,
                            event.dose_id,
                            event.day
                        );
                        summary.dropped_events.push(event.id);
                    }
                }
                Write::SupersedeEvent(event) => {
                    next.check_references(&event)?;
                    let key = event.key();
                    let before = next.events.len();
                    next.events.retain(|e| e.key() != key);
                    summary.events_superseded += before - next.events.len();
                    occupied.insert(key);
                    next.events.push(event);
                    summary.events_inserted += 1;
                }
                Write::UpsertReminder(reminder) => {
                    match next.reminders.iter_mut().find(|r| r.id == reminder.id) {
                        Some(existing) => *existing = reminder,
                        None => next.reminders.push(reminder),
                    }
                    summary.reminders += 1;
                }
                Write::SetDoseTaken {
                    medicine_id,
                    dose_id,
                    is_taken,
                } => {
                    let medicine = next
                        .medicines
                        .iter_mut()
                        .find(|m| m.id == medicine_id)
                        .ok_or_else(|| Error::Storage(format!("unknown medicine {}", medicine_id)))?;
                    let dose = medicine
                        .doses
                        .iter_mut()
                        .find(|d| d.id == dose_id)
                        .ok_or_else(|| Error::Storage(format!("unknown dose {}", dose_id)))?;
                    if dose.is_taken != is_taken {
                        dose.is_taken = is_taken;
                        medicine.touch();
                        summary.medicines += 1;
                    }
                }
                Write::Deactivate { medicine_id, since } => {
                    let medicine = next
                        .medicines
                        .iter_mut()
                        .find(|m| m.id == medicine_id)
                        .ok_or_else(|| Error::Storage(format!("unknown medicine {}", medicine_id)))?;
                    if medicine.is_active {
                        medicine.deactivate(since);
                        summary.medicines += 1;
                    }
                }
                Write::AdjustCompleted { user, delta, now } => {
                    let index = match next.reminders.iter().position(|r| r.user_id == user) {
                        Some(index) => index,
                        None => {
                            next.reminders.push(Reminder::new(user, &now));
                            next.reminders.len() - 1
                        }
                    };
                    let reminder = &mut next.reminders[index];
                    reminder.completed_times = reminder.completed_times.saturating_add_signed(delta);
                    summary.reminders += 1;
                }
                Write::ResetDay { user, now } => {
                    let mut stale = 0;
                    for reminder in next.reminders.iter_mut() {
                        if reminder.user_id == user && reminder.needs_reset(&now) {
                            reminder.reset(&now);
                            stale += 1;
                        }
                    }
                    if stale > 0 {
                        summary.reminders += stale;
                        for medicine in next.medicines.iter_mut().filter(|m| m.user_id == user) {
                            if medicine.doses.iter().any(|d| d.is_taken) {
                                medicine.doses.iter_mut().for_each(|d| d.is_taken = false);
                                medicine.touch();
                                summary.medicines += 1;
                            }
                        }
                    }
                }
            }
        }

        next.revision += 1;
        summary.revision = next.revision;
        *self = next;
        Ok(summary)
    }

    fn check_references(&self, event: &DoseLogEvent) -> Result<()> {
        let medicine = self
            .medicines
            .iter()
            .find(|m| m.id == event.medicine_id)
            .ok_or_else(|| {
                Error::Storage(format!(
                    "event {} references unknown medicine {}",
                    event.id, event.medicine_id
                ))
            })?;

        if medicine.dose(event.dose_id).is_none() {
            return Err(Error::Storage(format!(
                "event {} references unknown dose {} of medicine {}",
                event.id, event.dose_id, medicine.name
            )));
        }
        Ok(())
    }

    /// Cascade delete: the medicine, its doses and all events referencing it
    pub fn delete_medicine(&mut self, id: Uuid) -> bool {
        let before = self.medicines.len();
        self.medicines.retain(|m| m.id != id);
        if self.medicines.len() == before {
            return false;
        }

        let events_before = self.events.len();
        self.events.retain(|e| e.medicine_id != id);
        tracing::info!(
            "Deleted medicine {} and {} of its events",
            id,
            events_before - self.events.len()
        );
        self.revision += 1;
        true
    }

    pub fn purge_events_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.events.len();
        self.events.retain(|e| e.date_recorded >= cutoff);
        let removed = before - self.events.len();
        if removed > 0 {
            self.revision += 1;
        }
        removed
    }
}

// ============================================================================
// Change notification
// ============================================================================

/// Fan-out of store changes to live subscribers
#[derive(Debug, Default)]
pub struct Notifier {
    subscribers: Vec<Sender<StoreChange>>,
}

impl Notifier {
    pub fn subscribe(&mut self) -> Receiver<StoreChange> {
        let (tx, rx) = channel();
        self.subscribers.push(tx);
        rx
    }

    /// Deliver to every subscriber, forgetting the ones that hung up
    pub fn notify(&mut self, change: StoreChange) {
        self.subscribers.retain(|tx| tx.send(change).is_ok());
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Store kept entirely in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: Snapshot,
    pending: Vec<Write>,
    notifier: Notifier,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            snapshot,
            ..Self::default()
        }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl EntityStore for MemoryStore {
    fn medicines_for_user(&self, user: &UserId) -> Result<Vec<Medicine>> {
        Ok(self.snapshot.medicines_for_user(user))
    }

    fn events_between(
        &self,
        user: &UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DoseLogEvent>> {
        Ok(self.snapshot.events_between(user, start, end))
    }

    fn events_on_day(&self, user: &UserId, day: NaiveDate) -> Result<Vec<DoseLogEvent>> {
        Ok(self.snapshot.events_on_day(user, day))
    }

    fn reminders_for_user(&self, user: &UserId) -> Result<Vec<Reminder>> {
        Ok(self.snapshot.reminders_for_user(user))
    }

    fn stage(&mut self, write: Write) {
        self.pending.push(write);
    }

    fn save(&mut self) -> Result<CommitSummary> {
        if self.pending.is_empty() {
            return Ok(CommitSummary {
                revision: self.snapshot.revision,
                ..CommitSummary::default()
            });
        }

        let writes = std::mem::take(&mut self.pending);
        let summary = self.snapshot.apply(writes)?;
        self.notifier.notify(StoreChange {
            revision: summary.revision,
            kind: ChangeKind::Commit,
        });
        Ok(summary)
    }

    fn discard(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    fn delete_medicine(&mut self, id: Uuid) -> Result<bool> {
        let deleted = self.snapshot.delete_medicine(id);
        if deleted {
            self.notifier.notify(StoreChange {
                revision: self.snapshot.revision,
                kind: ChangeKind::MedicineDeleted,
            });
        }
        Ok(deleted)
    }

    fn purge_events_before(&mut self, cutoff: DateTime<Utc>) -> Result<usize> {
        let removed = self.snapshot.purge_events_before(cutoff);
        if removed > 0 {
            self.notifier.notify(StoreChange {
                revision: self.snapshot.revision,
                kind: ChangeKind::EventsPurged,
            });
        }
        Ok(removed)
    }

    fn subscribe(&mut self) -> Receiver<StoreChange> {
        self.notifier.subscribe()
    }
}
