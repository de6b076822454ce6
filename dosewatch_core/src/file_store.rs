//! File-backed entity store with file locking.
//!
//! The whole store is one JSON snapshot. Readers take a shared lock on a
//! sibling `.lock` file; commits take the exclusive lock, reload the
//! snapshot, apply the staged writes and atomically replace the file, so
//! separate processes never interleave a read-check-write.

use crate::store::{ChangeKind, CommitSummary, EntityStore, Notifier, Snapshot, StoreChange, Write};
use crate::{DoseLogEvent, Error, Medicine, Reminder, Result, UserId};
use chrono::{DateTime, NaiveDate, Utc};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write as IoWrite};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use tempfile::NamedTempFile;
use uuid::Uuid;

/// JSON snapshot store at a fixed path
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock_path: PathBuf,
    pending: Vec<Write>,
    notifier: Notifier,
}

impl FileStore {
    /// Open (or prepare to create) the store at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lock_path = path.with_extension("lock");
        Ok(Self {
            path,
            lock_path,
            pending: Vec::new(),
            notifier: Notifier::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_file(&self) -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.lock_path)?;
        Ok(file)
    }

    /// Load the snapshot for reading
    ///
    /// Returns an empty snapshot if the file doesn't exist.
    /// If the file is corrupted, logs a warning and returns an empty snapshot.
    pub fn load(&self) -> Result<Snapshot> {
        let lock = self.lock_file()?;
        lock.lock_shared()?;
        let result = read_snapshot(&self.path);
        lock.unlock()?;

        match result {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                tracing::warn!(
                    "Failed to read store {:?}: {}. Treating it as empty.",
                    self.path,
                    e
                );
                Ok(Snapshot::default())
            }
        }
    }

    /// Run `f` against the current snapshot under the exclusive lock and
    /// persist the result.
    ///
    /// Unlike `load`, a corrupted file is an error here: writing over it
    /// would lose whatever it still holds.
    fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Snapshot) -> Result<(T, bool)>,
    {
        let lock = self.lock_file()?;
        lock.lock_exclusive()?;

        let result: Result<T> = (|| {
            let mut snapshot = read_snapshot(&self.path)?;
            let (value, changed) = f(&mut snapshot)?;
            if changed {
                self.write_snapshot(&snapshot)?;
            }
            Ok(value)
        })();

        lock.unlock()?;
        result
    }

    /// Atomically writes the snapshot by:
    /// 1. Writing to a temp file in the same directory
    /// 2. Syncing to disk
    /// 3. Renaming over the original
    fn write_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let dir = self.path.parent().ok_or_else(|| {
            Error::Storage(format!("store path {:?} has no parent directory", self.path))
        })?;
        let temp = NamedTempFile::new_in(dir)?;

        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            let contents = serde_json::to_string(snapshot)?;
            writer.write_all(contents.as_bytes())?;
            writer.flush()?;
        }

        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| Error::Io(e.error))?;

        tracing::debug!(
            "Saved store revision {} to {:?}",
            snapshot.revision,
            self.path
        );
        Ok(())
    }
}

fn read_snapshot(path: &Path) -> Result<Snapshot> {
    if !path.exists() {
        return Ok(Snapshot::default());
    }

    let mut contents = String::new();
    File::open(path)?.read_to_string(&mut contents)?;
    if contents.trim().is_empty() {
        return Ok(Snapshot::default());
    }
    Ok(serde_json::from_str(&contents)?)
}

impl EntityStore for FileStore {
    fn medicines_for_user(&self, user: &UserId) -> Result<Vec<Medicine>> {
        Ok(self.load()?.medicines_for_user(user))
    }

    fn events_between(
        &self,
        user: &UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DoseLogEvent>> {
        Ok(self.load()?.events_between(user, start, end))
    }

    fn events_on_day(&self, user: &UserId, day: NaiveDate) -> Result<Vec<DoseLogEvent>> {
        Ok(self.load()?.events_on_day(user, day))
    }

    fn reminders_for_user(&self, user: &UserId) -> Result<Vec<Reminder>> {
        Ok(self.load()?.reminders_for_user(user))
    }

    fn stage(&mut self, write: Write) {
        self.pending.push(write);
    }

    fn save(&mut self) -> Result<CommitSummary> {
        let writes = std::mem::take(&mut self.pending);
        if writes.is_empty() {
            return Ok(CommitSummary {
                revision: self.load()?.revision,
                ..CommitSummary::default()
            });
        }

        let count = writes.len();
        let summary = self
            .update(|snapshot| Ok((snapshot.apply(writes)?, true)))
            .map_err(|e| match e {
                Error::Storage(_) => e,
                other => Error::Storage(format!("commit of {} writes failed: {}", count, other)),
            })?;

        tracing::debug!("Committed {} writes as revision {}", count, summary.revision);
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
        let (deleted, revision) = self.update(|snapshot| {
            let deleted = snapshot.delete_medicine(id);
            Ok(((deleted, snapshot.revision), deleted))
        })?;

        if deleted {
            self.notifier.notify(StoreChange {
                revision,
                kind: ChangeKind::MedicineDeleted,
            });
        }
        Ok(deleted)
    }

    fn purge_events_before(&mut self, cutoff: DateTime<Utc>) -> Result<usize> {
        let (removed, revision) = self.update(|snapshot| {
            let removed = snapshot.purge_events_before(cutoff);
            Ok(((removed, snapshot.revision), removed > 0))
        })?;

        if removed > 0 {
            tracing::info!("Purged {} events recorded before {}", removed, cutoff);
            self.notifier.notify(StoreChange {
                revision,
                kind: ChangeKind::EventsPurged,
            });
        }
        Ok(removed)
    }

    fn subscribe(&mut self) -> Receiver<StoreChange> {
        self.notifier.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventSource;
    use chrono::{Duration, NaiveTime, TimeZone};

    fn day_start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).unwrap()
    }

    fn alice() -> UserId {
        UserId::new("alice")
    }

    fn amlodipine() -> Medicine {
        let today = day_start().date_naive();
        Medicine::new(alice(), "Amlodipine", "5mg", today, today + Duration::days(30))
            .with_dose(NaiveTime::from_hms_opt(9, 0, 0).unwrap())
    }

    fn missed(medicine: &Medicine) -> DoseLogEvent {
        DoseLogEvent::new(
            medicine,
            &medicine.doses[0],
            false,
            &(day_start() + Duration::hours(9)),
            &day_start(),
            EventSource::Reconciled,
        )
    }

    #[test]
    fn test_save_and_reload_roundtrip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("store.json");
        let med = amlodipine();

        let mut store = FileStore::open(&path).unwrap();
        store.stage(Write::UpsertMedicine(med.clone()));
        store.stage(Write::InsertEvent(missed(&med)));
        let summary = store.save().unwrap();
        assert_eq!(summary.revision, 1);

        // A second handle sees the committed state
        let reopened = FileStore::open(&path).unwrap();
        let medicines = reopened.medicines_for_user(&alice()).unwrap();
        assert_eq!(medicines, vec![med]);
        let events = reopened
            .events_between(&alice(), day_start(), day_start() + Duration::days(1))
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_missing_store_is_empty() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(temp_dir.path().join("nested").join("store.json")).unwrap();

        assert!(store.medicines_for_user(&alice()).unwrap().is_empty());
        assert_eq!(store.load().unwrap().revision, 0);
    }

    #[test]
    fn test_duplicates_across_handles_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("store.json");
        let med = amlodipine();

        let mut first = FileStore::open(&path).unwrap();
        first.stage(Write::UpsertMedicine(med.clone()));
        first.save().unwrap();

        // Two handles plan the same missed event independently
        let mut second = FileStore::open(&path).unwrap();
        first.stage(Write::InsertEvent(missed(&med)));
        second.stage(Write::InsertEvent(missed(&med)));
        first.save().unwrap();
        let summary = second.save().unwrap();

        assert_eq!(summary.events_inserted, 0);
        assert_eq!(summary.dropped_events.len(), 1);
        assert_eq!(first.load().unwrap().events.len(), 1);
    }

    #[test]
    fn test_corrupted_store_reads_empty_but_refuses_commit() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("store.json");
        std::fs::write(&path, "{ invalid json }").unwrap();

        let mut store = FileStore::open(&path).unwrap();
        assert!(store.medicines_for_user(&alice()).unwrap().is_empty());

        store.stage(Write::UpsertMedicine(amlodipine()));
        let result = store.save();
        assert!(matches!(result, Err(Error::Storage(_))));

        // The corrupted file was not overwritten
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ invalid json }");
    }

    #[test]
    fn test_delete_and_purge_persist() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("store.json");
        let med = amlodipine();
        let kept = amlodipine();

        let mut store = FileStore::open(&path).unwrap();
        let changes = store.subscribe();
        store.stage(Write::UpsertMedicine(med.clone()));
        store.stage(Write::UpsertMedicine(kept.clone()));
        store.stage(Write::InsertEvent(missed(&med)));
        store.stage(Write::InsertEvent(missed(&kept)));
        store.save().unwrap();

        assert!(store.delete_medicine(med.id).unwrap());
        let removed = store
            .purge_events_before(day_start() + Duration::days(1))
            .unwrap();
        assert_eq!(removed, 1);

        let snapshot = FileStore::open(&path).unwrap().load().unwrap();
        assert_eq!(snapshot.medicines.len(), 1);
        assert!(snapshot.events.is_empty());

        let kinds: Vec<_> = changes.try_iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![ChangeKind::Commit, ChangeKind::MedicineDeleted, ChangeKind::EventsPurged]
        );
    }

    #[test]
    fn test_atomic_save_leaves_no_temp_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("store.json");

        let mut store = FileStore::open(&path).unwrap();
        store.stage(Write::UpsertMedicine(amlodipine()));
        store.save().unwrap();

        let extras: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "store.json" && e.file_name() != "store.lock")
            .collect();
        assert!(
            extras.is_empty(),
            "Expected only store.json and its lock, found extras: {:?}",
            extras
        );
    }
}
