//! Archive extraction stage.
//!
//! On `FileReceived` the uploaded gzip-TAR is unpacked into a fresh scratch
//! directory under `/extracts` of the virtual filesystem. The event id is
//! everything before the first `.` of the archive's basename, the shape the
//! device was commanded to upload (`<event_id>.tar.gz`). A corrupt or
//! unreadable archive drops the event and the scratch directory with it.

use std::io::Read;
use std::sync::Arc;

use chrono::Utc;
use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tracing::{debug, error, info};

use crate::bus::{Event, EventBus, Topic};
use crate::vfs::{self, VirtualFs};

/// Where scratch directories live inside the virtual filesystem.
const EXTRACT_ROOT: &str = "/extracts";

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("archive unreadable: {0}")]
    Archive(#[from] std::io::Error),
    #[error("filesystem error: {0:?}")]
    Fs(#[from] vfs::Error),
}

/// Unpacks uploaded archives and hands the member list to the parser stage.
pub struct Extractor {
    bus: Arc<EventBus>,
}

impl Extractor {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self { bus })
    }

    /// Subscribes to finished uploads. Decompression is blocking work and
    /// runs on the worker pool, not on the publisher's task.
    pub fn register(self: &Arc<Self>, bus: &EventBus) {
        let extractor = self.clone();
        bus.subscribe(Topic::FileReceived, move |_, event| {
            if let Event::FileReceived { path, fs } = event {
                let extractor = extractor.clone();
                let path = path.clone();
                let fs = fs.clone();
                tokio::task::spawn_blocking(move || extractor.handle_file(&path, &fs));
            }
        });
    }

    fn handle_file(&self, path: &str, fs: &Arc<VirtualFs>) {
        let filename = vfs::basename(path);
        let event_id = filename.split('.').next().unwrap_or(filename).to_owned();

        let scratch = match create_scratch_dir(fs) {
            Ok(dir) => dir,
            Err(err) => {
                error!(path, %err, "cannot create scratch directory, event dropped");
                return;
            }
        };

        match extract_members(fs, path, &scratch) {
            Ok(extracted_items) => {
                if let Err(err) = fs.remove(path) {
                    debug!(path, ?err, "uploaded archive already gone");
                }
                info!(path, directory = scratch, members = extracted_items.len(), "extracted");
                self.bus.send(
                    "extractor",
                    Event::ExtractionCompleted { directory: scratch, extracted_items, event_id },
                );
            }
            Err(err) => {
                error!(path, %err, "extraction failed, event dropped");
                if let Err(err) = fs.removetree(&scratch) {
                    error!(directory = scratch, ?err, "scratch cleanup failed");
                }
            }
        }
    }
}

/// A unique `/extracts/extract_<UTC-yyyyMMddHHmmss>` directory; a
/// same-second collision gets a numeric suffix instead of failing the event.
fn create_scratch_dir(fs: &VirtualFs) -> Result<String, Error> {
    fs.make_dirs(EXTRACT_ROOT)?;
    let base = format!("{EXTRACT_ROOT}/extract_{}", Utc::now().format("%Y%m%d%H%M%S"));
    let mut dir = base.clone();
    let mut attempt = 0u32;
    loop {
        match fs.mkdir(&dir) {
            Ok(()) => return Ok(dir),
            Err(vfs::Error::AlreadyExists) => {
                attempt += 1;
                dir = format!("{base}-{attempt}");
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn extract_members(fs: &VirtualFs, archive_path: &str, scratch: &str) -> Result<Vec<String>, Error> {
    let bytes = read_all(fs, archive_path)?;
    let mut archive = Archive::new(GzDecoder::new(bytes.as_slice()));

    let mut extracted = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let relative = entry.path()?.to_string_lossy().into_owned();
        let dest = format!("{scratch}/{relative}");
        match entry.header().entry_type() {
            EntryType::Directory => fs.make_dirs(&dest)?,
            EntryType::Regular => {
                let mut contents = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut contents)?;
                // Members may arrive without their parent directory entries.
                if let Some(idx) = dest.rfind('/') {
                    fs.make_dirs(&dest[..idx.max(1)])?;
                }
                write_all(fs, &dest, &contents)?;
                extracted.push(dest);
            }
            other => debug!(member = relative, ?other, "skipping unsupported member type"),
        }
    }
    Ok(extracted)
}

fn read_all(fs: &VirtualFs, path: &str) -> Result<Vec<u8>, Error> {
    let size = fs.stat(path)?.size as usize;
    let handle = fs.open(path, vfs::OpenFlags::read_only())?;
    let bytes = fs.read(handle, 0, size)?;
    fs.close(handle)?;
    Ok(bytes)
}

fn write_all(fs: &VirtualFs, path: &str, bytes: &[u8]) -> Result<(), Error> {
    let flags = vfs::OpenFlags { create: true, ..vfs::OpenFlags::write_truncate() };
    let handle = fs.open(path, flags)?;
    fs.write(handle, 0, bytes)?;
    fs.close(handle)?;
    Ok(())
}
