//! Fault-window log slicing.
//!
//! On `ExtractionCompleted` every extracted file is scanned line by line. A
//! line is timestamped iff it starts with `[`; the bracketed prefix, minus
//! any `*` marker, parses as `MM/DD/YYYY HH:MM:SS.ffffff`. Lines whose
//! timestamp falls within ±W of the event's fault time are attached to the
//! record under the file's name without its extension. Timestamps are
//! non-decreasing within a file, so the scan stops at the first line past
//! the window.

use std::sync::Arc;

use chrono::{Duration, NaiveDateTime};
use tracing::{debug, error, info, warn};

use crate::bus::{Event, EventBus, Topic};
use crate::store::{CategorisedLogs, EventStore};
use crate::vfs::{self, VirtualFs};

/// Timestamp layout inside the bracketed log-line prefix.
const LINE_TIMESTAMP_FORMAT: &str = "%m/%d/%Y %H:%M:%S%.f";

/// Slices extracted logs to the window around the fault timestamp.
pub struct WindowParser {
    fs: Arc<VirtualFs>,
    store: Arc<EventStore>,
    bus: Arc<EventBus>,
    window: Duration,
}

impl WindowParser {
    pub fn new(
        fs: Arc<VirtualFs>,
        store: Arc<EventStore>,
        bus: Arc<EventBus>,
        window_seconds: u64,
    ) -> Arc<Self> {
        Arc::new(Self { fs, store, bus, window: Duration::seconds(window_seconds as i64) })
    }

    /// Subscribes to finished extractions; the file scan runs on the worker
    /// pool.
    pub fn register(self: &Arc<Self>, bus: &EventBus) {
        let parser = self.clone();
        bus.subscribe(Topic::ExtractionCompleted, move |_, event| {
            if let Event::ExtractionCompleted { directory, extracted_items, event_id } = event {
                let parser = parser.clone();
                let directory = directory.clone();
                let extracted_items = extracted_items.clone();
                let event_id = event_id.clone();
                tokio::task::spawn_blocking(move || {
                    parser.handle_extraction(&directory, &extracted_items, &event_id)
                });
            }
        });
    }

    fn handle_extraction(&self, directory: &str, extracted_items: &[String], event_id: &str) {
        info!(event_id, directory, items = extracted_items.len(), "parsing extracted logs");

        match self.store.get(event_id) {
            Some(record) => {
                let results = self.slice_files(extracted_items, record.datetime);
                if !results.is_empty() {
                    self.store.attach_categorised(event_id, results);
                }
            }
            None => {
                // Filename did not name a known event; there is no fault
                // time to centre a window on. The store logs the mismatch.
                self.store.attach_categorised(event_id, CategorisedLogs::new());
            }
        }

        self.bus.send(
            "window_parser",
            Event::LogProcessingCompleted { event_id: event_id.to_owned() },
        );

        if let Err(err) = self.fs.removetree(directory) {
            error!(directory, ?err, "scratch cleanup failed");
        }
    }

    fn slice_files(&self, extracted_items: &[String], base: NaiveDateTime) -> CategorisedLogs {
        let mut results = CategorisedLogs::new();
        for path in extracted_items {
            match self.fs.stat(path) {
                Ok(attr) if attr.size == 0 => {
                    debug!(path, "skipping empty file");
                    continue;
                }
                Ok(_) => {}
                Err(err) => {
                    error!(path, ?err, "cannot stat extracted file");
                    continue;
                }
            }
            match self.slice_file(path, base) {
                Ok(lines) if !lines.is_empty() => {
                    let category = category_of(vfs::basename(path));
                    results.entry(category).or_default().extend(lines);
                }
                Ok(_) => {}
                Err(err) => error!(path, ?err, "cannot read extracted file"),
            }
        }
        results
    }

    /// Lines of one file whose timestamp lies in `[base − W, base + W]`.
    fn slice_file(&self, path: &str, base: NaiveDateTime) -> vfs::Result<Vec<String>> {
        let size = self.fs.stat(path)?.size as usize;
        let handle = self.fs.open(path, vfs::OpenFlags::read_only())?;
        let bytes = self.fs.read(handle, 0, size)?;
        self.fs.close(handle)?;
        let text = String::from_utf8_lossy(&bytes);

        let start = base - self.window;
        let end = base + self.window;
        let mut kept = Vec::new();
        for line in text.lines() {
            if !line.starts_with('[') {
                continue;
            }
            let Some(close) = line.find(']') else {
                warn!(path, line, "bracketed line without closing bracket");
                continue;
            };
            let stamp = line[1..close].replace('*', "");
            let stamp = stamp.trim();
            let when = match NaiveDateTime::parse_from_str(stamp, LINE_TIMESTAMP_FORMAT) {
                Ok(when) => when,
                Err(err) => {
                    error!(path, line, %err, "cannot parse timestamp, line skipped");
                    continue;
                }
            };
            if when < start {
                continue;
            }
            if when > end {
                // Per-file timestamps are non-decreasing; nothing later can
                // be in the window.
                break;
            }
            kept.push(line.trim().to_owned());
        }
        Ok(kept)
    }
}

/// Category name: the file's basename without its final extension.
fn category_of(filename: &str) -> String {
    match filename.rfind('.') {
        Some(0) | None => filename.to_owned(),
        Some(idx) => filename[..idx].to_owned(),
    }
}
