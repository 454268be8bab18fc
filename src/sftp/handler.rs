//! SFTP v3 subsystem mapped onto the shared [`VirtualFs`].
//!
//! Every operation returns `Result<_, StatusCode>`; filesystem errors are
//! translated to SFTP status codes in exactly one place
//! ([`status_of`]). The per-handle last-operation discipline is the
//! correlation latch: only a close that follows a write publishes
//! `FileReceived`, so metadata reads by a client never start a spurious
//! extraction.

use std::collections::HashMap;
use std::sync::Arc;

use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use tracing::{debug, error, info};

use crate::bus::{Event, EventBus};
use crate::vfs::{self, VirtualFs};

/// Maps a filesystem error to its SFTP v3 status. `NotDirectory` has no own
/// code in v3 (`SSH_FX_NO_SUCH_PATH` is a later dialect), so it collapses
/// onto `NoSuchFile`; everything unexpected is `Failure`.
fn status_of(err: vfs::Error) -> StatusCode {
    match err {
        vfs::Error::NoSuchFile | vfs::Error::NotDirectory => StatusCode::NoSuchFile,
        vfs::Error::PermissionDenied => StatusCode::PermissionDenied,
        _ => StatusCode::Failure,
    }
}

fn ok_status(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_owned(),
        language_tag: "en-US".to_owned(),
    }
}

fn owner_name(uid: u32) -> String {
    if uid == 0 {
        "root".to_owned()
    } else {
        uid.to_string()
    }
}

/// Wire attributes for an entry: type bits OR-ed into the permissions, plus
/// the owner/group names the `ls -l` longname is rendered from.
fn wire_attrs(attr: &vfs::Attr) -> FileAttributes {
    FileAttributes {
        size: Some(attr.size),
        uid: Some(attr.uid),
        user: Some(owner_name(attr.uid)),
        gid: Some(attr.gid),
        group: Some(owner_name(attr.gid)),
        permissions: Some(attr.permissions()),
        atime: Some(attr.atime as u32),
        mtime: Some(attr.mtime as u32),
    }
}

/// The open-mode set of the protocol, derived from pflags: read-only,
/// write-only-truncate, read-write, append, append-read. The first open is
/// attempted without the create flag; the create fallback lives in
/// [`SftpSession::open`].
fn translate_pflags(pflags: OpenFlags) -> vfs::OpenFlags {
    vfs::OpenFlags {
        read: pflags.contains(OpenFlags::READ),
        write: pflags.contains(OpenFlags::WRITE),
        append: pflags.contains(OpenFlags::APPEND),
        create: false,
        exclusive: pflags.contains(OpenFlags::EXCLUDE),
        truncate: pflags.contains(OpenFlags::TRUNCATE),
    }
}

fn setattr_of(attrs: &FileAttributes) -> vfs::SetAttr {
    vfs::SetAttr {
        mode: attrs.permissions.map(|p| p & 0o7777),
        uid: attrs.uid,
        gid: attrs.gid,
        size: attrs.size,
        atime: attrs.atime.map(i64::from),
        mtime: attrs.mtime.map(i64::from),
    }
}

struct OpenEntry {
    handle: vfs::HandleId,
    path: String,
}

struct DirListing {
    entries: Vec<(String, vfs::Attr)>,
    served: bool,
}

/// One SFTP session, chroot-ed to `/` of the shared filesystem.
pub struct SftpSession {
    fs: Arc<VirtualFs>,
    bus: Arc<EventBus>,
    files: HashMap<String, OpenEntry>,
    dirs: HashMap<String, DirListing>,
    next_handle: u64,
}

impl SftpSession {
    pub fn new(fs: Arc<VirtualFs>, bus: Arc<EventBus>) -> Self {
        Self { fs, bus, files: HashMap::new(), dirs: HashMap::new(), next_handle: 0 }
    }

    fn issue_handle(&mut self, prefix: &str) -> String {
        self.next_handle += 1;
        format!("{prefix}-{}", self.next_handle)
    }
}

impl russh_sftp::server::Handler for SftpSession {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        debug!(version, "sftp session initialised");
        Ok(Version::new())
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let flags = translate_pflags(pflags);
        let opened = match self.fs.open(&filename, flags) {
            Ok(handle) => Ok(handle),
            Err(vfs::Error::NoSuchFile)
                if pflags.contains(OpenFlags::CREATE) && pflags.contains(OpenFlags::WRITE) =>
            {
                // Create-on-write: a zero-byte file, then the original mode
                // again.
                self.fs.touch(&filename).map_err(status_of)?;
                self.fs.open(&filename, flags)
            }
            Err(err) => Err(err),
        };
        let handle = opened.map_err(status_of)?;
        let path = self.fs.realpath(&filename).map_err(status_of)?;
        debug!(path, ?pflags, "file opened");

        let sftp_handle = self.issue_handle("file");
        self.files.insert(sftp_handle.clone(), OpenEntry { handle, path });
        Ok(Handle { id, handle: sftp_handle })
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let entry = self.files.get(&handle).ok_or(StatusCode::Failure)?;
        let data = self.fs.read(entry.handle, offset, len as usize).map_err(status_of)?;
        if data.is_empty() && len > 0 {
            return Err(StatusCode::Eof);
        }
        Ok(Data { id, data })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let entry = self.files.get(&handle).ok_or(StatusCode::Failure)?;
        self.fs.write(entry.handle, offset, &data).map_err(status_of)?;
        Ok(ok_status(id))
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        if let Some(entry) = self.files.remove(&handle) {
            let closed = self.fs.close(entry.handle).map_err(status_of)?;
            if closed.wrote {
                info!(path = closed.path, "upload complete, dispatching");
                self.bus.send(
                    "sftp_server",
                    Event::FileReceived { path: closed.path, fs: self.fs.clone() },
                );
            }
            return Ok(ok_status(id));
        }
        if self.dirs.remove(&handle).is_some() {
            return Ok(ok_status(id));
        }
        error!(handle, "close on unknown handle");
        Err(StatusCode::Failure)
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        let entries = self.fs.listdir(&path).map_err(status_of)?;
        let sftp_handle = self.issue_handle("dir");
        self.dirs.insert(sftp_handle.clone(), DirListing { entries, served: false });
        Ok(Handle { id, handle: sftp_handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let listing = self.dirs.get_mut(&handle).ok_or(StatusCode::Failure)?;
        if listing.served {
            return Err(StatusCode::Eof);
        }
        listing.served = true;
        let files = listing
            .entries
            .iter()
            .map(|(name, attr)| File::new(name.clone(), wire_attrs(attr)))
            .collect();
        Ok(Name { id, files })
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let canonical = self.fs.realpath(&path).map_err(status_of)?;
        Ok(Name { id, files: vec![File::dummy(canonical)] })
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let attr = self.fs.stat(&path).map_err(status_of)?;
        Ok(Attrs { id, attrs: wire_attrs(&attr) })
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let attr = self.fs.lstat(&path).map_err(status_of)?;
        Ok(Attrs { id, attrs: wire_attrs(&attr) })
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let entry = self.files.get(&handle).ok_or(StatusCode::Failure)?;
        let attr = self.fs.stat(&entry.path).map_err(status_of)?;
        Ok(Attrs { id, attrs: wire_attrs(&attr) })
    }

    async fn setstat(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        self.fs.setattr(&path, setattr_of(&attrs)).map_err(status_of)?;
        Ok(ok_status(id))
    }

    async fn fsetstat(
        &mut self,
        id: u32,
        handle: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let entry = self.files.get(&handle).ok_or(StatusCode::Failure)?;
        let path = entry.path.clone();
        self.fs.setattr(&path, setattr_of(&attrs)).map_err(status_of)?;
        Ok(ok_status(id))
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        self.fs.remove(&filename).map_err(status_of)?;
        Ok(ok_status(id))
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        self.fs.mkdir(&path).map_err(status_of)?;
        if attrs.permissions.is_some() {
            self.fs.setattr(&path, setattr_of(&attrs)).map_err(status_of)?;
        }
        Ok(ok_status(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        self.fs.rmdir(&path).map_err(status_of)?;
        Ok(ok_status(id))
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        self.fs.rename(&oldpath, &newpath).map_err(status_of)?;
        Ok(ok_status(id))
    }

    async fn symlink(
        &mut self,
        id: u32,
        linkpath: String,
        targetpath: String,
    ) -> Result<Status, Self::Error> {
        self.fs.symlink(&targetpath, &linkpath).map_err(status_of)?;
        Ok(ok_status(id))
    }

    async fn readlink(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let target = self.fs.readlink(&path).map_err(status_of)?;
        Ok(Name { id, files: vec![File::dummy(target)] })
    }
}
