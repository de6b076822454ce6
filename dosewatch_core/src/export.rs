//! CSV export of dose log history.

use crate::{DoseLogEvent, Medicine, Result};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::Path;
use uuid::Uuid;

/// A row in the CSV output
#[derive(Debug, serde::Serialize)]
struct CsvRow<'a> {
    id: String,
    medicine_id: String,
    medicine: &'a str,
    dose_id: String,
    date: String,
    timestamp: String,
    taken: bool,
    source: String,
}

impl<'a> CsvRow<'a> {
    fn new(event: &DoseLogEvent, names: &HashMap<Uuid, &'a str>) -> Self {
        CsvRow {
            id: event.id.to_string(),
            medicine_id: event.medicine_id.to_string(),
            medicine: names.get(&event.medicine_id).copied().unwrap_or(""),
            dose_id: event.dose_id.to_string(),
            date: event.date_recorded.to_rfc3339(),
            timestamp: event.timestamp.to_rfc3339(),
            taken: event.is_taken,
            source: event.source.to_string(),
        }
    }
}

/// Append `events` to the CSV at `path`, oldest first.
///
/// Headers are written only when the file is new or empty. The file is
/// synced before returning. Returns the number of rows written.
pub fn write_events_csv(events: &[DoseLogEvent], medicines: &[Medicine], path: &Path) -> Result<usize> {
    if events.is_empty() {
        tracing::info!("No dose events to export");
        return Ok(0);
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let needs_headers = file.metadata()?.len() == 0;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(needs_headers)
        .from_writer(file);

    let names: HashMap<Uuid, &str> = medicines.iter().map(|m| (m.id, m.name.as_str())).collect();
    let mut ordered: Vec<&DoseLogEvent> = events.iter().collect();
    ordered.sort_by_key(|e| (e.date_recorded, e.timestamp));

    for event in &ordered {
        writer.serialize(CsvRow::new(event, &names))?;
    }

    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    file.sync_all()?;

    tracing::info!("Exported {} dose events to {:?}", ordered.len(), path);
    Ok(ordered.len())
}
