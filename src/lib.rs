//! cip-relay: industrial event-log ingestion pipeline.
//!
//! A PLC emits a compact trigger when a network fault is detected on an
//! access point. The pipeline validates the trigger, commands the device
//! over SSH to upload its event-log archive into the embedded SFTP endpoint,
//! extracts the archive inside an in-memory filesystem, slices the log lines
//! around the fault timestamp and forwards the result to a syslog collector.
//!
//! The stages never call each other directly: all coupling goes through the
//! typed [`bus::EventBus`], and the event id (`"{ip}_{datetime}"`) is the
//! correlation key that survives the round-trip through the external device.

pub mod bus;
pub mod config;
pub mod device;
pub mod extract;
pub mod listener;
pub mod sftp;
pub mod store;
pub mod syslog;
pub mod trigger;
pub mod vfs;
pub mod window;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::config::Config;
use crate::device::{DeviceManager, HttpCredentialSource};
use crate::extract::Extractor;
use crate::listener::NetworkListener;
use crate::sftp::SftpServer;
use crate::store::EventStore;
use crate::syslog::SyslogSender;
use crate::trigger::Validator;
use crate::vfs::VirtualFs;
use crate::window::WindowParser;

/// Start-up failures; all exit the process non-zero.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::Error),
    #[error(transparent)]
    Sftp(#[from] sftp::Error),
    #[error("cannot bind trigger listener: {0}")]
    Listener(#[from] std::io::Error),
}

/// The wired pipeline. The process-wide singletons (filesystem, store, bus)
/// are constructed exactly once here and handed to each stage; the
/// single-instance property comes from this wiring, not from any global.
pub struct App {
    tasks: Vec<JoinHandle<()>>,
    grace: Duration,
}

impl App {
    /// Builds the stages, registers every bus subscription and binds the
    /// network endpoints.
    pub async fn start(config: Config) -> Result<Self, Error> {
        let bus = Arc::new(EventBus::new());
        let fs = Arc::new(VirtualFs::new());

        let store = EventStore::new(bus.clone());
        store.register(&bus);

        let credentials = Arc::new(HttpCredentialSource::new(config.credentials_url.clone()));
        let device = DeviceManager::new(
            store.clone(),
            credentials,
            config.device_profile.clone(),
            config.ingress_ip.clone(),
        );
        device.register(&bus);

        let extractor = Extractor::new(bus.clone());
        extractor.register(&bus);

        let parser =
            WindowParser::new(fs.clone(), store.clone(), bus.clone(), config.event_window_seconds);
        parser.register(&bus);

        let syslog = SyslogSender::new(store.clone(), config.syslog.clone());
        syslog.register(&bus);

        let validator =
            Validator::new(config.shared_secret.clone(), config.allowed_secret_chars.clone());
        let listener = NetworkListener::new(config.listener.clone(), validator, bus.clone());
        let listener_task = listener.spawn().await?.task;

        let sftp = SftpServer::new(
            config.sftp_host_ip.clone(),
            config.sftp_listen_port,
            config.sftp_rsa_keyfile.clone(),
            fs,
            bus,
        );
        let sftp_task = sftp.spawn().await?;

        info!("pipeline wired and serving");
        Ok(Self {
            tasks: vec![listener_task, sftp_task],
            grace: Duration::from_secs(config.shutdown_grace_seconds),
        })
    }

    /// Serves until SIGINT/SIGTERM, then shuts down.
    pub async fn run(self) {
        shutdown_signal().await;
        info!("shutdown signal received");
        self.shutdown().await;
    }

    /// Cancels the server tasks and waits for outstanding work, bounded by
    /// the configured grace interval.
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        let drain = async {
            for task in self.tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(self.grace, drain).await.is_err() {
            warn!("grace period elapsed with tasks still outstanding");
        }
        info!("shutdown complete");
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            warn!(%err, "cannot install SIGTERM handler, falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
