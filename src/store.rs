//! Event records and the in-memory registry that owns them.
//!
//! An [`EventRecord`] is the correlation spine of the pipeline: its `id`
//! (`"{ip}_{datetime}"`) names the archive the device uploads and threads
//! the five hops of one event together. Records live for the process
//! lifetime; the spine fields are immutable and only the log containers
//! grow.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::NaiveDateTime;
use tracing::{debug, error, info, warn};

use crate::bus::{Event, EventBus, Topic};

/// Categorised log slices, keyed by category name.
pub type CategorisedLogs = BTreeMap<String, Vec<String>>;

/// One registered fault event.
pub struct EventRecord {
    /// IPv4 of the source device, textual form.
    pub ip: String,
    /// Fault timestamp, the centre of the parse window.
    pub datetime: NaiveDateTime,
    /// Free-form description.
    pub text: String,
    pub error_code: String,
    /// `"{ip}_{datetime}"`, stable from creation; also the base name of the
    /// archive the device uploads.
    pub id: String,
    general_logs: Mutex<Vec<String>>,
    categorised_logs: Mutex<CategorisedLogs>,
}

impl EventRecord {
    fn new(ip: &str, dts: &str, text: &str, error_code: &str) -> Option<Self> {
        let datetime: NaiveDateTime = dts.parse().ok()?;
        Some(Self {
            ip: ip.to_owned(),
            datetime,
            text: text.to_owned(),
            error_code: error_code.to_owned(),
            id: format!("{ip}_{dts}"),
            general_logs: Mutex::new(Vec::new()),
            categorised_logs: Mutex::new(CategorisedLogs::new()),
        })
    }

    /// Appends a free-form log message to the record.
    pub fn add_log(&self, message: impl Into<String>) {
        self.general_logs.lock().unwrap_or_else(|e| e.into_inner()).push(message.into());
    }

    pub fn general_logs(&self) -> Vec<String> {
        self.general_logs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Snapshot of the categorised logs attached so far.
    pub fn categorised_logs(&self) -> CategorisedLogs {
        self.categorised_logs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn attach(&self, incoming: CategorisedLogs) {
        let mut logs = self.categorised_logs.lock().unwrap_or_else(|e| e.into_inner());
        for (category, lines) in incoming {
            logs.entry(category).or_default().extend(lines);
        }
    }
}

struct Inner {
    id_map: HashMap<String, Arc<EventRecord>>,
    // Secondary index: ip -> fault time -> records.
    events: HashMap<String, BTreeMap<NaiveDateTime, Vec<Arc<EventRecord>>>>,
}

/// In-memory registry of [`EventRecord`]s. One instance per process, owned
/// by the start-up wiring.
pub struct EventStore {
    bus: Arc<EventBus>,
    inner: Mutex<Inner>,
}

impl EventStore {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            inner: Mutex::new(Inner { id_map: HashMap::new(), events: HashMap::new() }),
        })
    }

    /// Subscribes the store to validated triggers.
    pub fn register(self: &Arc<Self>, bus: &EventBus) {
        let store = self.clone();
        bus.subscribe(Topic::NetworkDataReceived, move |_, event| {
            if let Event::NetworkDataReceived { ip, datetime, text, error_code } = event {
                store.add(ip, datetime, text, error_code);
            }
        });
    }

    /// Registers a new event. Returns `false` without touching the indices
    /// when the derived id already exists or the timestamp does not parse.
    /// A successful add emits `CIPEventCreated`.
    pub fn add(&self, ip: &str, dts: &str, text: &str, error_code: &str) -> bool {
        let Some(record) = EventRecord::new(ip, dts, text, error_code) else {
            error!(ip, dts, "dropping trigger with unparsable timestamp");
            return false;
        };
        let record = Arc::new(record);
        let event_id = record.id.clone();
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.id_map.contains_key(&event_id) {
                debug!(event_id, "event with this id already exists");
                return false;
            }
            inner.id_map.insert(event_id.clone(), record.clone());
            inner
                .events
                .entry(record.ip.clone())
                .or_default()
                .entry(record.datetime)
                .or_default()
                .push(record);
        }
        info!(event_id, "event added");
        self.bus.send("event_store", Event::CipEventCreated { event_id });
        true
    }

    pub fn get(&self, event_id: &str) -> Option<Arc<EventRecord>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).id_map.get(event_id).cloned()
    }

    /// All records for a device, ordered by fault time.
    pub fn events_for_ip(&self, ip: &str) -> Vec<Arc<EventRecord>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .events
            .get(ip)
            .map(|by_time| by_time.values().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Appends categorised log slices to an existing record and emits the
    /// advisory `EventUpdated`. A missing id is the filename-mismatch case:
    /// logged and dropped.
    pub fn attach_categorised(&self, event_id: &str, logs: CategorisedLogs) -> bool {
        let record = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.id_map.get(event_id).cloned()
        };
        match record {
            Some(record) => {
                record.attach(logs);
                debug!(event_id, "categorised logs attached");
                self.bus.send(
                    "event_store",
                    Event::EventUpdated { event_id: event_id.to_owned() },
                );
                true
            }
            None => {
                warn!(event_id, "no event found for categorised logs");
                false
            }
        }
    }
}
