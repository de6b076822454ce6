#![forbid(unsafe_code)]

//! Core domain model and business logic for Dosewatch.
//!
//! This crate provides:
//! - Domain types (medicines, scheduled doses, dose log events, reminders)
//! - Schedule resolution against the local calendar day
//! - Missed-dose reconciliation and daily adherence
//! - The serialized trigger coordinator and its ticker
//! - Persistence (entity store, JSON file store, CSV export)

pub mod types;
pub mod error;
pub mod config;
pub mod logging;
pub mod schedule;
pub mod store;
pub mod file_store;
pub mod reconcile;
pub mod adherence;
pub mod reminder;
pub mod actions;
pub mod clock;
pub mod coordinator;
pub mod export;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use config::Config;
pub use store::{EntityStore, MemoryStore, Write};
pub use file_store::FileStore;
pub use reconcile::{plan_missed_events, reconcile};
pub use adherence::{compute_adherence, daily_report, AdherenceReport};
pub use clock::{Clock, FixedClock, SystemClock};
pub use coordinator::{Coordinator, PassReport, Ticker, Trigger};
pub use export::write_events_csv;
