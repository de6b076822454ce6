//! Serialized recalculation pipeline.
//!
//! Every trigger runs the same pass under one lock: daily reset check,
//! missed-dose reconciliation, then an adherence recompute from what is
//! committed. Passes never overlap, so the read-check-write in
//! reconciliation cannot race with itself.

use crate::adherence::compute_adherence;
use crate::clock::Clock;
use crate::reconcile::reconcile;
use crate::store::{active_medicines, events_for_day, EntityStore, StoreChange};
use crate::{reminder, Result, UserId};
use chrono::{DateTime, TimeZone};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Why a pass runs
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// The adherence view became visible
    Appeared,
    MedicinesChanged,
    RemindersChanged,
    EventsChanged,
    /// The session switched user (or logged out with `None`)
    UserChanged(Option<UserId>),
    /// The store committed changes this coordinator did not make
    StorageCommitted,
    /// Periodic timer
    Tick,
}

/// Outcome of one pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PassReport {
    pub trigger: Trigger,
    pub user: UserId,
    pub missed_created: usize,
    pub reconcile_failed: bool,
    /// `None` when the store could not be read; the previous value is kept
    pub adherence: Option<u8>,
}

struct Session<S> {
    store: S,
    user: Option<UserId>,
    adherence: Option<u8>,
    store_changes: Receiver<StoreChange>,
}

/// Owns the store and the session's latest adherence
pub struct Coordinator<S, C> {
    session: Mutex<Session<S>>,
    clock: C,
    subscribers: Mutex<Vec<Sender<u8>>>,
}

impl<S, C> Coordinator<S, C>
where
    S: EntityStore,
    C: Clock,
{
    pub fn new(mut store: S, clock: C, user: Option<UserId>) -> Self {
        let store_changes = store.subscribe();
        Self {
            session: Mutex::new(Session {
                store,
                user,
                adherence: None,
                store_changes,
            }),
            clock,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, Session<S>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Latest computed adherence for the current user
    pub fn overall_daily_adherence(&self) -> Option<u8> {
        self.lock_session().adherence
    }

    pub fn current_user(&self) -> Option<UserId> {
        self.lock_session().user.clone()
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Receive every new adherence value as it changes
    pub fn subscribe(&self) -> Receiver<u8> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Run `f` with exclusive access to the store, between passes
    pub fn with_store<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut self.lock_session().store)
    }

    /// Run one pass. Returns `None` when there is no current user.
    pub fn fire(&self, trigger: Trigger) -> Option<PassReport> {
        let mut session = self.lock_session();

        if let Trigger::UserChanged(user) = &trigger {
            if session.user != *user {
                tracing::info!(
                    "User changed to {}",
                    user.as_ref().map_or("<none>", |u| u.as_str())
                );
                session.adherence = None;
            }
            session.user = user.clone();
        }

        let user = match session.user.clone() {
            Some(user) => user,
            None => {
                tracing::debug!("No current user, skipping {:?} pass", trigger);
                return None;
            }
        };

        let now = self.clock.now();
        tracing::debug!("{:?} pass for {} at {}", trigger, user, now.naive_local());
        let report = run_pass(&mut session.store, &user, &now, trigger);

        // Our own commits are already reflected in this pass
        while session.store_changes.try_recv().is_ok() {}

        if let Some(value) = report.adherence {
            if session.adherence != Some(value) {
                session.adherence = Some(value);
                self.publish(value);
            }
        }
        Some(report)
    }

    /// Fire `StorageCommitted` if the store changed outside of a pass
    pub fn poll_store(&self) -> Option<PassReport> {
        let changed = {
            let session = self.lock_session();
            let mut changed = false;
            while session.store_changes.try_recv().is_ok() {
                changed = true;
            }
            changed
        };

        if changed {
            self.fire(Trigger::StorageCommitted)
        } else {
            None
        }
    }

    fn publish(&self, value: u8) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(value).is_ok());
    }
}

fn run_pass<S, Tz>(store: &mut S, user: &UserId, now: &DateTime<Tz>, trigger: Trigger) -> PassReport
where
    S: EntityStore,
    Tz: TimeZone,
{
    if let Err(e) = reminder::reset_if_new_day(store, user, now) {
        tracing::warn!("Reminder reset failed for {}: {}", user, e);
    }

    let mut report = PassReport {
        trigger,
        user: user.clone(),
        missed_created: 0,
        reconcile_failed: false,
        adherence: None,
    };

    let medicines = match active_medicines(&*store, user, now) {
        Ok(medicines) => medicines,
        Err(e) => {
            tracing::error!("Cannot load medicines for {}: {}", user, e);
            return report;
        }
    };

    match reconcile(store, &medicines, now) {
        Ok(created) => report.missed_created = created.len(),
        Err(e) => {
            tracing::warn!("Reconciliation failed, using last committed state: {}", e);
            report.reconcile_failed = true;
        }
    }

    report.adherence = match events_for_day(&*store, user, now) {
        Ok(events) => Some(compute_adherence(&medicines, &events, now)),
        Err(e) => {
            tracing::error!("Cannot load today's events for {}: {}", user, e);
            None
        }
    };
    report
}

/// Background timer firing `Trigger::Tick` at a fixed interval.
///
/// Holds only a weak reference to the coordinator and stops when either the
/// ticker is stopped or dropped, or the coordinator goes away.
pub struct Ticker {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    pub fn spawn<S, C>(coordinator: &Arc<Coordinator<S, C>>, interval: Duration) -> Result<Self>
    where
        S: EntityStore + Send + 'static,
        C: Clock + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let weak: Weak<Coordinator<S, C>> = Arc::downgrade(coordinator);

        let handle = thread::Builder::new()
            .name("dosewatch-ticker".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let Some(coordinator) = weak.upgrade() else {
                            break;
                        };
                        if coordinator.poll_store().is_none() {
                            coordinator.fire(Trigger::Tick);
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        tracing::debug!("Ticker started with {:?} interval", interval);
        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop ticking and wait for the thread to finish
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Ticker thread panicked");
            }
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
