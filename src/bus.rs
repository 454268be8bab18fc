//! Typed in-process publish/subscribe coordinating the pipeline stages.
//!
//! Every signal is a named topic with a fixed payload shape; all coupling
//! between stages goes through [`EventBus::send`]. Dispatch is synchronous on
//! the publisher's task, in registration order. Handlers that may block or
//! perform I/O hand off to a worker task themselves; the bus does not
//! schedule.

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::vfs::VirtualFs;

/// Bus topics, one per signal.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Topic {
    NetworkDataReceived,
    CipEventCreated,
    FileReceived,
    ExtractionCompleted,
    LogProcessingCompleted,
    EventUpdated,
}

/// Signal payloads. The variants carry exactly the fields each stage hands
/// to the next; `event_id` is the correlation key that threads the five hops
/// together.
#[derive(Clone)]
pub enum Event {
    /// A validated trigger arrived on one of the network listeners.
    NetworkDataReceived { ip: String, datetime: String, text: String, error_code: String },
    /// The store registered a new event record.
    CipEventCreated { event_id: String },
    /// An SFTP upload finished with a close-after-write.
    FileReceived { path: String, fs: Arc<VirtualFs> },
    /// An uploaded archive was unpacked into a scratch directory.
    ExtractionCompleted { directory: String, extracted_items: Vec<String>, event_id: String },
    /// The window parser attached its slices to the record.
    LogProcessingCompleted { event_id: String },
    /// Advisory: categorised logs were appended to an existing record.
    EventUpdated { event_id: String },
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::NetworkDataReceived { .. } => Topic::NetworkDataReceived,
            Event::CipEventCreated { .. } => Topic::CipEventCreated,
            Event::FileReceived { .. } => Topic::FileReceived,
            Event::ExtractionCompleted { .. } => Topic::ExtractionCompleted,
            Event::LogProcessingCompleted { .. } => Topic::LogProcessingCompleted,
            Event::EventUpdated { .. } => Topic::EventUpdated,
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // FileReceived carries the filesystem handle, which has no useful
        // Debug form; render every variant by topic.
        write!(f, "{:?}", self.topic())
    }
}

type Handler = Arc<dyn Fn(&str, &Event) + Send + Sync>;

struct Subscription {
    topic: Topic,
    sender: Option<String>,
    handler: Handler,
}

/// The process-wide bus. Constructed once at start-up; subscriptions are all
/// registered during wiring, though late registration is permitted and
/// affects subsequent sends only.
#[derive(Default)]
pub struct EventBus {
    subscriptions: Mutex<Vec<Subscription>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `topic`, any sender. Registering the same
    /// closure twice means it runs twice per send.
    pub fn subscribe<F>(&self, topic: Topic, handler: F)
    where
        F: Fn(&str, &Event) + Send + Sync + 'static,
    {
        self.push(Subscription { topic, sender: None, handler: Arc::new(handler) });
    }

    /// Registers `handler` for `topic`, filtered to signals published by
    /// `sender`.
    pub fn subscribe_from<F>(&self, topic: Topic, sender: &str, handler: F)
    where
        F: Fn(&str, &Event) + Send + Sync + 'static,
    {
        self.push(Subscription {
            topic,
            sender: Some(sender.to_owned()),
            handler: Arc::new(handler),
        });
    }

    fn push(&self, sub: Subscription) {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner()).push(sub);
    }

    /// Publishes `event`, invoking matching handlers inline in registration
    /// order. The subscriber list is snapshotted first, so handlers may
    /// subscribe or publish without deadlocking; list changes show up from
    /// the next send on.
    pub fn send(&self, sender: &str, event: Event) {
        let topic = event.topic();
        trace!(?topic, sender, "dispatch");
        let matching: Vec<Handler> = {
            let subs = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
            subs.iter()
                .filter(|s| s.topic == topic)
                .filter(|s| s.sender.as_deref().map_or(true, |want| want == sender))
                .map(|s| s.handler.clone())
                .collect()
        };
        for handler in matching {
            handler(sender, &event);
        }
    }
}
