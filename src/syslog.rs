//! RFC 3164 forwarding to the external collector.
//!
//! On `LogProcessingCompleted` every categorised line of the event is
//! rendered as `<134>{timestamp} {source_ip} IWPLOGPARSER {category}: {line}`
//! (facility local0, severity info) and shipped over a persistent socket:
//! one datagram per line for UDP, one concatenated stream write for TCP. A
//! socket-level failure is logged per event and the socket is rebuilt on the
//! next emission.

use std::io;
use std::sync::Arc;

use chrono::Local;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::bus::{Event, EventBus, Topic};
use crate::config::{SyslogConfig, Transport};
use crate::store::EventStore;

/// local0.info
const PRIORITY: u32 = 134;

/// Application tag carried in every message.
const APP_NAME: &str = "IWPLOGPARSER";

enum Socket {
    Disconnected,
    Udp(UdpSocket),
    Tcp(TcpStream),
}

/// Forwards finished events to the syslog collector.
pub struct SyslogSender {
    store: Arc<EventStore>,
    config: SyslogConfig,
    socket: Mutex<Socket>,
}

impl SyslogSender {
    pub fn new(store: Arc<EventStore>, config: SyslogConfig) -> Arc<Self> {
        Arc::new(Self { store, config, socket: Mutex::new(Socket::Disconnected) })
    }

    /// Subscribes to pipeline completion; socket work runs on its own task.
    pub fn register(self: &Arc<Self>, bus: &EventBus) {
        let sender = self.clone();
        bus.subscribe(Topic::LogProcessingCompleted, move |_, event| {
            if let Event::LogProcessingCompleted { event_id } = event {
                let sender = sender.clone();
                let event_id = event_id.clone();
                tokio::spawn(async move { sender.forward_event(&event_id).await });
            }
        });
    }

    /// Renders and ships every categorised line attached to `event_id`.
    pub async fn forward_event(&self, event_id: &str) {
        let Some(record) = self.store.get(event_id) else {
            warn!(event_id, "no record to forward");
            return;
        };
        let source_ip = event_id.split('_').next().unwrap_or(event_id);
        let timestamp = Local::now().format("%b %d %H:%M:%S").to_string();

        let mut messages = Vec::new();
        for (category, lines) in record.categorised_logs() {
            for line in lines {
                messages.push(format!(
                    "<{PRIORITY}>{timestamp} {source_ip} {APP_NAME} {category}: {line}\n"
                ));
            }
        }
        if messages.is_empty() {
            debug!(event_id, "nothing in window, nothing forwarded");
            return;
        }

        match self.transmit(&messages).await {
            Ok(()) => info!(event_id, count = messages.len(), "events sent to syslog"),
            Err(err) => error!(event_id, %err, "syslog send failed"),
        }
    }

    async fn transmit(&self, messages: &[String]) -> io::Result<()> {
        let mut socket = self.socket.lock().await;
        if matches!(*socket, Socket::Disconnected) {
            *socket = self.connect().await?;
        }
        let result = match &mut *socket {
            Socket::Udp(udp) => {
                let mut outcome = Ok(());
                for message in messages {
                    if let Err(err) = udp.send(message.as_bytes()).await {
                        outcome = Err(err);
                        break;
                    }
                }
                outcome
            }
            Socket::Tcp(tcp) => {
                let stream_bytes = messages.concat();
                tcp.write_all(stream_bytes.as_bytes()).await
            }
            Socket::Disconnected => Ok(()),
        };
        if result.is_err() {
            // Rebuilt on the next emission.
            *socket = Socket::Disconnected;
        }
        result
    }

    async fn connect(&self) -> io::Result<Socket> {
        let collector = (self.config.ip.as_str(), self.config.port);
        match self.config.transport {
            Transport::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                socket.connect(collector).await?;
                Ok(Socket::Udp(socket))
            }
            Transport::Tcp => Ok(Socket::Tcp(TcpStream::connect(collector).await?)),
        }
    }
}
