//! Daily reset of reminder counters and per-dose taken flags.

use crate::store::{CommitSummary, EntityStore, Write};
use crate::{Result, UserId};
use chrono::{DateTime, TimeZone};

/// Reset `user`'s reminder when its last reset was on an earlier day.
///
/// A reset zeroes the completed counter and clears the taken flag of the
/// user's doses, so the flag describes today only. A user without a
/// reminder gets one. Staleness is checked again inside the commit, so a
/// reset made meanwhile by another process is not repeated. Returns whether
/// a reset happened.
pub fn reset_if_new_day<S, Tz>(store: &mut S, user: &UserId, now: &DateTime<Tz>) -> Result<bool>
where
    S: EntityStore + ?Sized,
    Tz: TimeZone,
{
    let reminders = store.reminders_for_user(user)?;
    if reminders.is_empty() {
        tracing::debug!("Creating reminder for {}", user);
        store.stage(Write::AdjustCompleted {
            user: user.clone(),
            delta: 0,
            now: now.fixed_offset(),
        });
        return commit(store).map(|_| false);
    }

    if !reminders.iter().any(|r| r.needs_reset(now)) {
        return Ok(false);
    }

    store.stage(Write::ResetDay {
        user: user.clone(),
        now: now.fixed_offset(),
    });
    let reset = commit(store)?.reminders > 0;
    if reset {
        tracing::info!("Daily reset for {} on {}", user, now.date_naive());
    }
    Ok(reset)
}

fn commit<S: EntityStore + ?Sized>(store: &mut S) -> Result<CommitSummary> {
    match store.save() {
        Ok(summary) => Ok(summary),
        Err(e) => {
            store.discard();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::{Medicine, Reminder};
    use chrono::{Duration, NaiveTime, Utc};

    fn at(day: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, h, 0, 0).unwrap()
    }

    fn alice() -> UserId {
        UserId::new("alice")
    }

    fn taken_medicine() -> Medicine {
        let today = at(10, 0).date_naive();
        let mut med = Medicine::new(alice(), "Amlodipine", "5mg", today, today + Duration::days(30))
            .with_dose(NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        med.doses[0].is_taken = true;
        med
    }

    #[test]
    fn test_first_pass_creates_reminder() {
        let mut store = MemoryStore::new();
        let reset = reset_if_new_day(&mut store, &alice(), &at(10, 8)).unwrap();

        assert!(!reset);
        let reminders = store.reminders_for_user(&alice()).unwrap();
        assert_eq!(reminders.len(), 1);
        assert_eq!(reminders[0].completed_times, 0);
    }

    #[test]
    fn test_same_day_is_noop() {
        let mut store = MemoryStore::new();
        let mut reminder = Reminder::new(alice(), &at(10, 8));
        reminder.completed_times = 2;
        store.stage(Write::UpsertReminder(reminder));
        store.stage(Write::UpsertMedicine(taken_medicine()));
        store.save().unwrap();
        let revision = store.snapshot().revision;

        assert!(!reset_if_new_day(&mut store, &alice(), &at(10, 22)).unwrap());
        assert_eq!(store.snapshot().revision, revision);
        assert_eq!(store.reminders_for_user(&alice()).unwrap()[0].completed_times, 2);
    }

    #[test]
    fn test_new_day_resets_counter_and_taken_flags() {
        let mut store = MemoryStore::new();
        let mut reminder = Reminder::new(alice(), &at(10, 8));
        reminder.completed_times = 2;
        store.stage(Write::UpsertReminder(reminder));
        store.stage(Write::UpsertMedicine(taken_medicine()));
        store.save().unwrap();

        assert!(reset_if_new_day(&mut store, &alice(), &at(11, 6)).unwrap());

        let reminder = &store.reminders_for_user(&alice()).unwrap()[0];
        assert_eq!(reminder.completed_times, 0);
        assert_eq!(reminder.last_reset, at(11, 6));

        let medicines = store.medicines_for_user(&alice()).unwrap();
        assert!(medicines[0].doses.iter().all(|d| !d.is_taken));
    }
}
