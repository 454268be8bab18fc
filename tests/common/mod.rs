//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use russh_sftp::server::Handler as _;

use cip_relay::bus::{Event, EventBus, Topic};
use cip_relay::config::SyslogConfig;
use cip_relay::extract::Extractor;
use cip_relay::sftp::SftpSession;
use cip_relay::store::EventStore;
use cip_relay::syslog::SyslogSender;
use cip_relay::vfs::VirtualFs;
use cip_relay::window::WindowParser;

/// The in-process stages wired onto one bus. The network hops (trigger
/// listener, SSH) are supplied by each test.
pub struct Pipeline {
    pub bus: Arc<EventBus>,
    pub fs: Arc<VirtualFs>,
    pub store: Arc<EventStore>,
}

/// Wires store, extractor, window parser and syslog sender the same way
/// `App::start` does, minus the device manager (there is no device to SSH
/// into under test).
pub fn wire_pipeline(window_seconds: u64, syslog: SyslogConfig) -> Pipeline {
    let bus = Arc::new(EventBus::new());
    let fs = Arc::new(VirtualFs::new());

    let store = EventStore::new(bus.clone());
    store.register(&bus);

    let extractor = Extractor::new(bus.clone());
    extractor.register(&bus);

    let parser = WindowParser::new(fs.clone(), store.clone(), bus.clone(), window_seconds);
    parser.register(&bus);

    let sender = SyslogSender::new(store.clone(), syslog);
    sender.register(&bus);

    Pipeline { bus, fs, store }
}

/// Records every event published on `topic`.
pub fn capture(bus: &EventBus, topic: Topic) -> Arc<Mutex<Vec<Event>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        bus.subscribe(topic, move |_, event| {
            seen.lock().unwrap().push(event.clone());
        });
    }
    seen
}

/// Polls `pred` until it holds or `deadline` elapses.
pub async fn wait_for(deadline: Duration, pred: impl Fn() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if pred() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    pred()
}

/// A gzip-TAR with the given members.
pub fn tarball(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, data) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Replays the device's upload through the SFTP subsystem: open with
/// write/create, chunked writes, close. The close is what latches the
/// pipeline.
pub async fn sftp_upload(pipeline: &Pipeline, filename: &str, bytes: &[u8]) {
    let mut session = SftpSession::new(pipeline.fs.clone(), pipeline.bus.clone());
    let flags = OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE;
    let handle = session
        .open(1, format!("/{filename}"), flags, FileAttributes::default())
        .await
        .expect("sftp open")
        .handle;
    for (index, chunk) in bytes.chunks(512).enumerate() {
        session
            .write(2 + index as u32, handle.clone(), (index * 512) as u64, chunk.to_vec())
            .await
            .expect("sftp write");
    }
    session.close(99, handle).await.expect("sftp close");
}
