//! PLC trigger listeners.
//!
//! One listener serves one transport, selected by configuration. Both paths
//! validate the payload with [`Validator`] and publish the same
//! `NetworkDataReceived` signal; a malformed or unauthenticated message is
//! dropped with an error log and the listener keeps serving.

use std::io;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::bus::{Event, EventBus};
use crate::config::{ListenerConfig, Transport};
use crate::trigger::{TriggerMessage, Validator};

/// Chunk size for the TCP read loop.
const TCP_CHUNK: usize = 1024;

/// Upper bound on a buffered TCP trigger frame. Real frames are under a
/// hundred bytes; anything near this size is garbage.
const MAX_FRAME: usize = 8 * 1024;

/// A bound listener: the serve task plus the address it actually bound,
/// which matters when the configured port is ephemeral.
pub struct ListenerHandle {
    pub task: JoinHandle<()>,
    pub local_addr: std::net::SocketAddr,
}

/// Concurrent UDP/TCP server accepting trigger messages.
pub struct NetworkListener {
    config: ListenerConfig,
    validator: Arc<Validator>,
    bus: Arc<EventBus>,
}

impl NetworkListener {
    pub fn new(config: ListenerConfig, validator: Validator, bus: Arc<EventBus>) -> Self {
        Self { config, validator: Arc::new(validator), bus }
    }

    /// Binds the configured endpoint and spawns the serve loop. Bind
    /// failures are start-up failures and propagate.
    pub async fn spawn(self) -> io::Result<ListenerHandle> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        match self.config.transport {
            Transport::Udp => {
                let socket = UdpSocket::bind(&addr).await?;
                let local_addr = socket.local_addr()?;
                info!(addr = %local_addr, "udp trigger listener up");
                let task = tokio::spawn(Self::serve_udp(socket, self.validator, self.bus));
                Ok(ListenerHandle { task, local_addr })
            }
            Transport::Tcp => {
                let listener = TcpListener::bind(&addr).await?;
                let local_addr = listener.local_addr()?;
                info!(addr = %local_addr, "tcp trigger listener up");
                let task = tokio::spawn(Self::serve_tcp(listener, self.validator, self.bus));
                Ok(ListenerHandle { task, local_addr })
            }
        }
    }

    async fn serve_udp(socket: UdpSocket, validator: Arc<Validator>, bus: Arc<EventBus>) {
        let mut buf = [0u8; 2048];
        loop {
            let (len, peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    error!(%err, "udp receive failed");
                    continue;
                }
            };
            match validator.parse_datagram(&buf[..len]) {
                Ok(message) => {
                    info!(%peer, event = %message.iso_datetime(), "udp trigger accepted");
                    publish(&bus, "udp_listener", message);
                }
                Err(err) => error!(%peer, ?err, "invalid udp trigger dropped"),
            }
        }
    }

    async fn serve_tcp(listener: TcpListener, validator: Arc<Validator>, bus: Arc<EventBus>) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!(%err, "tcp accept failed");
                    continue;
                }
            };
            let validator = validator.clone();
            let bus = bus.clone();
            tokio::spawn(async move {
                match read_frame(stream).await {
                    Ok(frame) => match validator.parse_stream(&frame) {
                        Ok(message) => {
                            info!(%peer, event = %message.iso_datetime(), "tcp trigger accepted");
                            publish(&bus, "tcp_listener", message);
                        }
                        Err(err) => error!(%peer, ?err, "invalid tcp trigger dropped"),
                    },
                    Err(err) => error!(%peer, %err, "tcp trigger read failed"),
                }
            });
        }
    }
}

/// Reads one trigger frame: 1024-byte chunks until the client half-closes.
/// The client opens a fresh connection per trigger.
async fn read_frame(mut stream: TcpStream) -> io::Result<Vec<u8>> {
    let mut frame = Vec::new();
    let mut chunk = [0u8; TCP_CHUNK];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(frame);
        }
        frame.extend_from_slice(&chunk[..n]);
        if frame.len() > MAX_FRAME {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "trigger frame too large"));
        }
    }
}

fn publish(bus: &EventBus, sender: &str, message: TriggerMessage) {
    bus.send(
        sender,
        Event::NetworkDataReceived {
            ip: message.ip.to_string(),
            datetime: message.iso_datetime(),
            text: String::new(),
            error_code: message.error_code,
        },
    );
}
