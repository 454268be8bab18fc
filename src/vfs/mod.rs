//! Process-wide in-memory filesystem used as the staging area for uploads
//! and extractions.
//!
//! The tree is a flat map from canonical absolute path to entry. Exactly one
//! entry exists per canonical path, a parent directory must exist before a
//! child is created, and every operation (reads included, since the backing
//! map supports no finer granularity) runs under the single filesystem-wide
//! lock. Throughput is bounded by the network, not by this lock.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Result of [`VirtualFs`] operations.
pub type Result<T> = std::result::Result<T, Error>;

/// File-type bits OR-ed onto permission bits by [`VirtualFs::stat`].
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

/// Maximum number of symlink hops resolved by [`VirtualFs::open`].
const MAX_LINK_DEPTH: usize = 16;

/// [`VirtualFs`] errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The path (or one of its parents) does not exist.
    #[error("no such file")]
    NoSuchFile,
    /// The path already exists and the operation requires it not to.
    #[error("already exists")]
    AlreadyExists,
    /// A non-directory appeared where a directory was required.
    #[error("not a directory")]
    NotDirectory,
    /// A directory appeared where a file was required.
    #[error("is a directory")]
    IsDirectory,
    /// Directory removal was attempted on a non-empty directory.
    #[error("directory not empty")]
    NotEmpty,
    /// `readlink` on an entry that is not a symlink.
    #[error("not a symlink")]
    NotSymlink,
    /// The open mode forbids the requested read or write.
    #[error("permission denied")]
    PermissionDenied,
    /// The handle is unknown or already closed.
    #[error("bad handle")]
    BadHandle,
    /// The path cannot be canonicalised (escapes the root or cycles).
    #[error("invalid path")]
    InvalidPath,
}

/// Entry kind as reported by [`VirtualFs::stat`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FileType {
    Directory,
    Regular,
    Symlink,
}

impl FileType {
    fn type_bits(self) -> u32 {
        match self {
            FileType::Directory => S_IFDIR,
            FileType::Regular => S_IFREG,
            FileType::Symlink => S_IFLNK,
        }
    }
}

/// Attributes returned by [`VirtualFs::stat`] and [`VirtualFs::listdir`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Attr {
    pub file_type: FileType,
    /// Permission bits only; see [`Attr::permissions`] for the wire form.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
}

impl Attr {
    /// Permission bits with the file-type bits OR-ed on, as stat reports
    /// them.
    pub fn permissions(&self) -> u32 {
        self.file_type.type_bits() | self.mode
    }
}

/// Attribute changes applied by [`VirtualFs::setattr`]; `None` leaves the
/// field untouched.
#[derive(Debug, Default, Copy, Clone)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<i64>,
    pub mtime: Option<i64>,
}

/// Open mode for [`VirtualFs::open`], mirroring the POSIX flag set.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub exclusive: bool,
    pub truncate: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self { read: true, ..Self::default() }
    }

    pub fn write_truncate() -> Self {
        Self { write: true, truncate: true, ..Self::default() }
    }

    pub fn append() -> Self {
        Self { write: true, append: true, ..Self::default() }
    }
}

/// Identifier of an open file handle.
pub type HandleId = u64;

/// What [`VirtualFs::close`] reports about the handle it tore down. `wrote`
/// is the close-after-write latch: it is set iff the handle's last operation
/// was a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedFile {
    pub path: String,
    pub wrote: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum LastOp {
    None,
    Read,
    Write,
}

struct Node {
    mode: u32,
    uid: u32,
    gid: u32,
    atime: i64,
    mtime: i64,
    kind: NodeKind,
}

enum NodeKind {
    Directory,
    // Contents are Arc-shared so handles opened before a remove or rename
    // keep a live buffer, as with a POSIX unlink while open.
    File(Arc<Mutex<Vec<u8>>>),
    Symlink(String),
}

impl Node {
    fn new(kind: NodeKind, mode: u32) -> Self {
        let now = now();
        Self { mode, uid: 0, gid: 0, atime: now, mtime: now, kind }
    }

    fn file_type(&self) -> FileType {
        match self.kind {
            NodeKind::Directory => FileType::Directory,
            NodeKind::File(_) => FileType::Regular,
            NodeKind::Symlink(_) => FileType::Symlink,
        }
    }
}

struct OpenFile {
    path: String,
    data: Arc<Mutex<Vec<u8>>>,
    flags: OpenFlags,
    last_op: LastOp,
}

struct State {
    nodes: HashMap<String, Node>,
    handles: HashMap<HandleId, OpenFile>,
    next_handle: HandleId,
}

/// The in-memory filesystem. One instance per process, constructed at
/// start-up and shared by reference.
pub struct VirtualFs {
    state: Mutex<State>,
}

impl Default for VirtualFs {
    fn default() -> Self {
        Self::new()
    }
}

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// Canonicalises `path` into an absolute `/`-separated form with `.` and
/// `..` folded away. Escaping the root with `..` is an error.
fn canonical(path: &str) -> Result<String> {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(Error::InvalidPath);
                }
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        Ok("/".to_owned())
    } else {
        Ok(format!("/{}", parts.join("/")))
    }
}

/// Parent of a canonical path; `None` for the root.
fn parent_of(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/".to_owned()),
        Some(idx) => Some(path[..idx].to_owned()),
        None => None,
    }
}

/// Final component of a canonical path.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

impl VirtualFs {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_owned(), Node::new(NodeKind::Directory, 0o755));
        Self { state: Mutex::new(State { nodes, handles: HashMap::new(), next_handle: 1 }) }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock means a panic while mutating the tree; continuing
        // with the current state matches the process-lifetime semantics.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Canonical absolute form of `path` within this filesystem. This is the
    /// REALPATH answer; it does not require the path to exist.
    pub fn realpath(&self, path: &str) -> Result<String> {
        canonical(path)
    }

    /// Resolves symlinks in `path` until a non-link entry (or a missing
    /// path) is reached.
    fn resolve(state: &State, path: String) -> Result<String> {
        let mut current = path;
        for _ in 0..MAX_LINK_DEPTH {
            match state.nodes.get(&current) {
                Some(Node { kind: NodeKind::Symlink(target), .. }) => {
                    current = if target.starts_with('/') {
                        canonical(target)?
                    } else {
                        let base = parent_of(&current).unwrap_or_else(|| "/".to_owned());
                        canonical(&format!("{base}/{target}"))?
                    };
                }
                _ => return Ok(current),
            }
        }
        Err(Error::InvalidPath)
    }

    fn require_parent_dir(state: &State, path: &str) -> Result<()> {
        let parent = parent_of(path).ok_or(Error::AlreadyExists)?;
        match state.nodes.get(&parent) {
            Some(Node { kind: NodeKind::Directory, .. }) => Ok(()),
            Some(_) => Err(Error::NotDirectory),
            None => Err(Error::NoSuchFile),
        }
    }

    /// Opens `path`, creating it when the create flag is set and the entry
    /// is absent. Returns a handle for [`read`](Self::read) /
    /// [`write`](Self::write) / [`close`](Self::close).
    pub fn open(&self, path: &str, flags: OpenFlags) -> Result<HandleId> {
        let path = canonical(path)?;
        let mut state = self.lock();
        let path = Self::resolve(&state, path)?;

        let data = match state.nodes.get(&path) {
            Some(Node { kind: NodeKind::File(data), .. }) => {
                if flags.create && flags.exclusive {
                    return Err(Error::AlreadyExists);
                }
                if flags.truncate {
                    data.lock().unwrap_or_else(|e| e.into_inner()).clear();
                }
                data.clone()
            }
            Some(Node { kind: NodeKind::Directory, .. }) => return Err(Error::IsDirectory),
            Some(Node { kind: NodeKind::Symlink(_), .. }) => return Err(Error::InvalidPath),
            None => {
                if !flags.create {
                    return Err(Error::NoSuchFile);
                }
                Self::require_parent_dir(&state, &path)?;
                let data = Arc::new(Mutex::new(Vec::new()));
                state.nodes.insert(path.clone(), Node::new(NodeKind::File(data.clone()), 0o644));
                data
            }
        };

        let id = state.next_handle;
        state.next_handle += 1;
        state
            .handles
            .insert(id, OpenFile { path: path.clone(), data, flags, last_op: LastOp::None });
        debug!(path, handle = id, "opened");
        Ok(id)
    }

    /// Creates a zero-byte regular file when `path` is absent; refreshes
    /// `mtime` when it already names a file.
    pub fn touch(&self, path: &str) -> Result<()> {
        let path = canonical(path)?;
        let mut state = self.lock();
        match state.nodes.get_mut(&path) {
            Some(node @ Node { kind: NodeKind::File(_), .. }) => {
                node.mtime = now();
                Ok(())
            }
            Some(_) => Err(Error::IsDirectory),
            None => {
                Self::require_parent_dir(&state, &path)?;
                let data = Arc::new(Mutex::new(Vec::new()));
                state.nodes.insert(path, Node::new(NodeKind::File(data), 0o644));
                Ok(())
            }
        }
    }

    /// Reads up to `len` bytes at `offset` through an open handle.
    pub fn read(&self, handle: HandleId, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut state = self.lock();
        let open = state.handles.get_mut(&handle).ok_or(Error::BadHandle)?;
        if !open.flags.read {
            return Err(Error::PermissionDenied);
        }
        open.last_op = LastOp::Read;
        let data = open.data.clone();
        let path = open.path.clone();
        let buf = data.lock().unwrap_or_else(|e| e.into_inner());
        let start = (offset as usize).min(buf.len());
        let end = start.saturating_add(len).min(buf.len());
        let out = buf[start..end].to_vec();
        drop(buf);
        if let Some(node) = state.nodes.get_mut(&path) {
            node.atime = now();
        }
        Ok(out)
    }

    /// Writes `bytes` at `offset` through an open handle, zero-filling any
    /// gap. Append handles ignore the offset and write at the end.
    pub fn write(&self, handle: HandleId, offset: u64, bytes: &[u8]) -> Result<usize> {
        let mut state = self.lock();
        let open = state.handles.get_mut(&handle).ok_or(Error::BadHandle)?;
        if !open.flags.write {
            return Err(Error::PermissionDenied);
        }
        open.last_op = LastOp::Write;
        let data = open.data.clone();
        let path = open.path.clone();
        let append = open.flags.append;
        let mut buf = data.lock().unwrap_or_else(|e| e.into_inner());
        let start = if append { buf.len() } else { offset as usize };
        if buf.len() < start {
            buf.resize(start, 0);
        }
        let overlap = (buf.len() - start).min(bytes.len());
        buf[start..start + overlap].copy_from_slice(&bytes[..overlap]);
        buf.extend_from_slice(&bytes[overlap..]);
        drop(buf);
        if let Some(node) = state.nodes.get_mut(&path) {
            node.mtime = now();
        }
        Ok(bytes.len())
    }

    /// Tears down an open handle and reports the close-after-write latch.
    pub fn close(&self, handle: HandleId) -> Result<ClosedFile> {
        let mut state = self.lock();
        let open = state.handles.remove(&handle).ok_or(Error::BadHandle)?;
        debug!(path = open.path, handle, "closed");
        Ok(ClosedFile { path: open.path, wrote: open.last_op == LastOp::Write })
    }

    /// Attributes of `path` with the file-type bits OR-ed onto the mode.
    pub fn stat(&self, path: &str) -> Result<Attr> {
        let path = canonical(path)?;
        let state = self.lock();
        let node = state.nodes.get(&path).ok_or(Error::NoSuchFile)?;
        Ok(Self::attr_of(node))
    }

    /// Symlinks are first-class entries here, so `lstat` is `stat`.
    pub fn lstat(&self, path: &str) -> Result<Attr> {
        self.stat(path)
    }

    fn attr_of(node: &Node) -> Attr {
        let size = match &node.kind {
            NodeKind::Directory => 0,
            NodeKind::File(data) => data.lock().unwrap_or_else(|e| e.into_inner()).len() as u64,
            NodeKind::Symlink(target) => target.len() as u64,
        };
        Attr {
            file_type: node.file_type(),
            mode: node.mode,
            uid: node.uid,
            gid: node.gid,
            size,
            atime: node.atime,
            mtime: node.mtime,
        }
    }

    /// Names and attributes of the direct children of a directory, sorted by
    /// name.
    pub fn listdir(&self, path: &str) -> Result<Vec<(String, Attr)>> {
        let path = canonical(path)?;
        let state = self.lock();
        match state.nodes.get(&path) {
            Some(Node { kind: NodeKind::Directory, .. }) => {}
            Some(_) => return Err(Error::NotDirectory),
            None => return Err(Error::NoSuchFile),
        }
        let mut out: Vec<(String, Attr)> = state
            .nodes
            .iter()
            .filter(|(p, _)| p.as_str() != "/" && parent_of(p).as_deref() == Some(path.as_str()))
            .map(|(p, node)| (basename(p).to_owned(), Self::attr_of(node)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    pub fn mkdir(&self, path: &str) -> Result<()> {
        let path = canonical(path)?;
        let mut state = self.lock();
        if state.nodes.contains_key(&path) {
            return Err(Error::AlreadyExists);
        }
        Self::require_parent_dir(&state, &path)?;
        state.nodes.insert(path, Node::new(NodeKind::Directory, 0o755));
        Ok(())
    }

    /// `mkdir -p`: creates every missing component; an existing directory at
    /// any step is fine, any other entry kind is not.
    pub fn make_dirs(&self, path: &str) -> Result<()> {
        let path = canonical(path)?;
        let mut state = self.lock();
        let mut prefix = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            prefix.push('/');
            prefix.push_str(part);
            match state.nodes.get(&prefix) {
                Some(Node { kind: NodeKind::Directory, .. }) => {}
                Some(_) => return Err(Error::NotDirectory),
                None => {
                    state.nodes.insert(prefix.clone(), Node::new(NodeKind::Directory, 0o755));
                }
            }
        }
        Ok(())
    }

    /// Removes an empty directory.
    pub fn rmdir(&self, path: &str) -> Result<()> {
        let path = canonical(path)?;
        if path == "/" {
            return Err(Error::InvalidPath);
        }
        let mut state = self.lock();
        match state.nodes.get(&path) {
            Some(Node { kind: NodeKind::Directory, .. }) => {}
            Some(_) => return Err(Error::NotDirectory),
            None => return Err(Error::NoSuchFile),
        }
        if Self::has_children(&state, &path) {
            return Err(Error::NotEmpty);
        }
        state.nodes.remove(&path);
        Ok(())
    }

    /// Removes a file or symlink.
    pub fn remove(&self, path: &str) -> Result<()> {
        let path = canonical(path)?;
        let mut state = self.lock();
        match state.nodes.get(&path) {
            Some(Node { kind: NodeKind::Directory, .. }) => Err(Error::IsDirectory),
            Some(_) => {
                state.nodes.remove(&path);
                Ok(())
            }
            None => Err(Error::NoSuchFile),
        }
    }

    fn has_children(state: &State, path: &str) -> bool {
        let prefix = if path == "/" { "/".to_owned() } else { format!("{path}/") };
        state.nodes.keys().any(|p| p != path && p.starts_with(&prefix))
    }

    /// Moves `src` to `dst`. The destination must not exist, except that an
    /// empty directory may be replaced by a directory.
    pub fn rename(&self, src: &str, dst: &str) -> Result<()> {
        let src = canonical(src)?;
        let dst = canonical(dst)?;
        if src == "/" || dst == "/" {
            return Err(Error::InvalidPath);
        }
        let mut state = self.lock();
        let src_is_dir = match state.nodes.get(&src) {
            Some(node) => matches!(node.kind, NodeKind::Directory),
            None => return Err(Error::NoSuchFile),
        };
        match state.nodes.get(&dst) {
            None => {}
            Some(Node { kind: NodeKind::Directory, .. }) if src_is_dir => {
                if Self::has_children(&state, &dst) {
                    return Err(Error::NotEmpty);
                }
                state.nodes.remove(&dst);
            }
            Some(_) => return Err(Error::AlreadyExists),
        }
        Self::require_parent_dir(&state, &dst)?;

        let node = state.nodes.remove(&src).ok_or(Error::NoSuchFile)?;
        state.nodes.insert(dst.clone(), node);
        if src_is_dir {
            let prefix = format!("{src}/");
            let moved: Vec<String> =
                state.nodes.keys().filter(|p| p.starts_with(&prefix)).cloned().collect();
            for old in moved {
                let new = format!("{dst}/{}", &old[prefix.len()..]);
                if let Some(child) = state.nodes.remove(&old) {
                    state.nodes.insert(new, child);
                }
            }
        }
        // Open handles keep their original path string; the shared buffer
        // stays live either way.
        Ok(())
    }

    /// Creates a symlink at `path` storing `target` verbatim.
    pub fn symlink(&self, target: &str, path: &str) -> Result<()> {
        let path = canonical(path)?;
        let mut state = self.lock();
        if state.nodes.contains_key(&path) {
            return Err(Error::AlreadyExists);
        }
        Self::require_parent_dir(&state, &path)?;
        state.nodes.insert(path, Node::new(NodeKind::Symlink(target.to_owned()), 0o777));
        Ok(())
    }

    pub fn readlink(&self, path: &str) -> Result<String> {
        let path = canonical(path)?;
        let state = self.lock();
        match state.nodes.get(&path) {
            Some(Node { kind: NodeKind::Symlink(target), .. }) => Ok(target.clone()),
            Some(_) => Err(Error::NotSymlink),
            None => Err(Error::NoSuchFile),
        }
    }

    /// Applies the populated fields of `attr` to `path`. A size change
    /// truncates or zero-extends a regular file.
    pub fn setattr(&self, path: &str, attr: SetAttr) -> Result<()> {
        let path = canonical(path)?;
        let mut state = self.lock();
        let node = state.nodes.get_mut(&path).ok_or(Error::NoSuchFile)?;
        if let Some(mode) = attr.mode {
            node.mode = mode & 0o7777;
        }
        if let Some(uid) = attr.uid {
            node.uid = uid;
        }
        if let Some(gid) = attr.gid {
            node.gid = gid;
        }
        if let Some(atime) = attr.atime {
            node.atime = atime;
        }
        if let Some(mtime) = attr.mtime {
            node.mtime = mtime;
        }
        if let Some(size) = attr.size {
            match &node.kind {
                NodeKind::File(data) => {
                    data.lock().unwrap_or_else(|e| e.into_inner()).resize(size as usize, 0)
                }
                _ => return Err(Error::IsDirectory),
            }
        }
        Ok(())
    }

    /// Recursively removes `path` and everything under it.
    pub fn removetree(&self, path: &str) -> Result<()> {
        let path = canonical(path)?;
        if path == "/" {
            return Err(Error::InvalidPath);
        }
        let mut state = self.lock();
        if !state.nodes.contains_key(&path) {
            return Err(Error::NoSuchFile);
        }
        let prefix = format!("{path}/");
        state.nodes.retain(|p, _| p != &path && !p.starts_with(&prefix));
        Ok(())
    }
}
