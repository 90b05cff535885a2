//! In-memory virtual filesystem served over 9P2000/9P2000.u.
//!
//! Nodes are reference-counted and hold a `Weak` back-link to their
//! parent; the root is its own parent, matching the wire qid invariant
//! that no two live files ever share a `path` (here, the node's heap
//! address).

use crate::error::{string, Error};
use crate::fcall::*;
use crate::serialize;
use crate::srv::{FId, Filesystem};
use crate::ugid;
use crate::utils::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

const DEFAULT_MODE: u32 = 0o644;
const FIXED_TIMESTAMP: u32 = 0;

/// Callback a file node can register in place of serving reads from its
/// inline buffer. Takes the file's current data, the read offset and
/// count; returns the bytes to answer `Rread` with.
pub type ReadHook = Arc<dyn Fn(&[u8], u64, u32) -> Result<Vec<u8>> + Send + Sync>;

/// Callback a file node can register in place of acknowledging writes
/// without mutation. Takes the write offset and the incoming bytes;
/// returns the count to report on `Rwrite`.
pub type WriteHook = Arc<dyn Fn(u64, &[u8]) -> Result<u32> + Send + Sync>;

enum NodeKind {
    Directory { children: BTreeMap<String, Node> },
    File {
        data: Vec<u8>,
        on_read: Option<ReadHook>,
        on_write: Option<WriteHook>,
    },
    Symlink { target: String },
    Device { is_block: bool, major: u16, minor: u16 },
    Pipe,
    Socket,
}

struct NodeInner {
    kind: NodeKind,
    perm: u32,
    atime: u32,
    mtime: u32,
    name: String,
    uid: String,
    gid: String,
    muid: String,
    parent: Weak<Mutex<NodeInner>>,
}

/// A handle to one node in the tree. Cheap to clone: clones share the
/// same underlying node.
#[derive(Clone)]
pub struct Node(Arc<Mutex<NodeInner>>);

impl Node {
    /// A fresh tree with a root directory "/".
    pub fn new_root() -> Node {
        let arc = Arc::new_cyclic(|weak| {
            Mutex::new(NodeInner {
                kind: NodeKind::Directory {
                    children: BTreeMap::new(),
                },
                perm: DEFAULT_MODE,
                atime: FIXED_TIMESTAMP,
                mtime: FIXED_TIMESTAMP,
                name: String::new(),
                uid: "root".to_owned(),
                gid: "root".to_owned(),
                muid: "root".to_owned(),
                parent: weak.clone(),
            })
        });
        Node(arc)
    }

    /// Stable qid path: the node's heap address. Unique for the
    /// node's lifetime, which is what the qid invariant requires.
    fn path(&self) -> u64 {
        Arc::as_ptr(&self.0) as u64
    }

    fn qid_type(&self) -> QIdType {
        match self.0.lock().unwrap().kind {
            NodeKind::Directory { .. } => QIdType::DIR,
            NodeKind::Symlink { .. } => QIdType::LINK,
            _ => QIdType::FILE,
        }
    }

    pub fn qid(&self) -> QId {
        QId {
            typ: self.qid_type(),
            version: 1,
            path: self.path(),
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.0.lock().unwrap().kind, NodeKind::Directory { .. })
    }

    pub fn child(&self, name: &str) -> Option<Node> {
        match &self.0.lock().unwrap().kind {
            NodeKind::Directory { children } => children.get(name).cloned(),
            _ => None,
        }
    }

    fn parent(&self) -> Node {
        let weak = self.0.lock().unwrap().parent.clone();
        weak.upgrade().map(Node).unwrap_or_else(|| self.clone())
    }

    fn insert_child(&self, name: &str, kind: NodeKind, perm: u32) -> Result<Node> {
        let mut inner = self.0.lock().unwrap();
        match &inner.kind {
            NodeKind::Directory { children } => {
                if children.contains_key(name) {
                    return Err(Error::new(string::EEXIST));
                }
            }
            _ => return Err(Error::new(string::ECANTCREATE)),
        }
        let child = Node(Arc::new(Mutex::new(NodeInner {
            kind,
            perm,
            atime: FIXED_TIMESTAMP,
            mtime: FIXED_TIMESTAMP,
            name: name.to_owned(),
            uid: "root".to_owned(),
            gid: "root".to_owned(),
            muid: "root".to_owned(),
            parent: Arc::downgrade(&self.0),
        })));
        if let NodeKind::Directory { children } = &mut inner.kind {
            children.insert(name.to_owned(), child.clone());
        }
        Ok(child)
    }

    pub fn mk_directory(&self, name: &str) -> Result<Node> {
        self.insert_child(
            name,
            NodeKind::Directory {
                children: BTreeMap::new(),
            },
            DEFAULT_MODE,
        )
    }

    pub fn mk_file(&self, name: &str, data: Vec<u8>) -> Result<Node> {
        self.insert_child(
            name,
            NodeKind::File {
                data,
                on_read: None,
                on_write: None,
            },
            DEFAULT_MODE,
        )
    }

    /// Register callbacks that serve reads/writes in place of the
    /// node's inline buffer. Installing a hook on a node that is not a
    /// file is a silent no-op.
    pub fn set_read_hook(&self, hook: ReadHook) {
        if let NodeKind::File { on_read, .. } = &mut self.0.lock().unwrap().kind {
            *on_read = Some(hook);
        }
    }

    pub fn set_write_hook(&self, hook: WriteHook) {
        if let NodeKind::File { on_write, .. } = &mut self.0.lock().unwrap().kind {
            *on_write = Some(hook);
        }
    }

    pub fn mk_symlink(&self, name: &str, target: &str) -> Result<Node> {
        self.insert_child(
            name,
            NodeKind::Symlink {
                target: target.to_owned(),
            },
            DEFAULT_MODE,
        )
    }

    pub fn mk_device(&self, name: &str, is_block: bool, major: u16, minor: u16) -> Result<Node> {
        self.insert_child(
            name,
            NodeKind::Device {
                is_block,
                major,
                minor,
            },
            DEFAULT_MODE,
        )
    }

    pub fn mk_pipe(&self, name: &str) -> Result<Node> {
        self.insert_child(name, NodeKind::Pipe, DEFAULT_MODE)
    }

    pub fn mk_socket(&self, name: &str) -> Result<Node> {
        self.insert_child(name, NodeKind::Socket, DEFAULT_MODE)
    }

    /// Stamp this node's mtime, e.g. after a write. The caller supplies
    /// the timestamp rather than this reading the clock itself, so a
    /// synthetic tree can stay fully deterministic if it wants to.
    pub fn touch(&self, mtime: u32) {
        self.0.lock().unwrap().mtime = mtime;
    }

    /// Replace the permission bits (low 9 bits only; the type bits in
    /// `dmode()` always come from the node's `NodeKind`).
    pub fn set_mode(&self, perm: u32) {
        self.0.lock().unwrap().perm = perm & 0o777;
    }

    fn len(&self) -> u64 {
        match &self.0.lock().unwrap().kind {
            NodeKind::File { data, .. } => data.len() as u64,
            NodeKind::Symlink { target } => target.len() as u64,
            _ => 0,
        }
    }

    fn dmode(&self) -> u32 {
        let inner = self.0.lock().unwrap();
        let kind_bits = match &inner.kind {
            NodeKind::Directory { .. } => DMode::DIR.bits(),
            NodeKind::Symlink { .. } => DMode::SYMLINK.bits(),
            NodeKind::Device { .. } => DMode::DEVICE.bits(),
            NodeKind::Pipe => DMode::NAMEDPIPE.bits(),
            NodeKind::Socket => DMode::SOCKET.bits(),
            NodeKind::File { .. } => 0,
        };
        kind_bits | inner.perm
    }

    fn ext(&self) -> String {
        match &self.0.lock().unwrap().kind {
            NodeKind::Symlink { target } => target.clone(),
            NodeKind::Device {
                is_block,
                major,
                minor,
            } => format!("{} {} {}", if *is_block { "b" } else { "c" }, major, minor),
            _ => String::new(),
        }
    }

    fn stat(&self) -> Stat {
        let inner = self.0.lock().unwrap();
        let uid = inner.uid.clone();
        let gid = inner.gid.clone();
        let muid = inner.muid.clone();
        let n_uid = ugid::uid_for_name(&uid).unwrap_or(0);
        let n_gid = ugid::gid_for_name(&gid).unwrap_or(0);
        let n_muid = ugid::uid_for_name(&muid).unwrap_or(0);
        let name = inner.name.clone();
        let atime = inner.atime;
        let mtime = inner.mtime;
        drop(inner);

        Stat {
            typ: 0,
            dev: 0,
            qid: self.qid(),
            mode: self.dmode(),
            atime,
            mtime,
            length: self.len(),
            name,
            uid,
            gid,
            muid,
            ext: self.ext(),
            n_uid,
            n_gid,
            n_muid,
        }
    }
}

fn parse_device_ext(ext: &str) -> Result<(bool, u16, u16)> {
    let mut parts = ext.split_whitespace();
    let kind = parts.next().ok_or_else(|| Error::new(string::EINVAL))?;
    let major: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::new(string::EINVAL))?;
    let minor: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::new(string::EINVAL))?;
    match kind {
        "b" => Ok((true, major, minor)),
        "c" => Ok((false, major, minor)),
        _ => Err(Error::new(string::EINVAL)),
    }
}

/// Per-fid state the VFS binding attaches to every client fid: the
/// node it currently resolves to, plus the directory-read paging
/// cursor.
#[derive(Clone, Default)]
pub struct VfsFid {
    node: Option<Node>,
    cursor: u64,
}

/// Serves a `Node` tree over 9P by implementing `srv::Filesystem`.
#[derive(Clone)]
pub struct VfsServer {
    root: Node,
}

impl VfsServer {
    pub fn new(root: Node) -> VfsServer {
        VfsServer { root }
    }

    /// Synthesize the paged stat-encoded entry at `fid`'s current
    /// cursor: "." at 0, ".." at 1, then children in map order. Bumps
    /// the cursor on success; returns an empty read at end of stream.
    fn read_dir_entry(node: &Node, cursor: &mut u64, dotu: bool) -> Result<Vec<u8>> {
        let idx = *cursor;
        let entry = if idx == 0 {
            Some(node.clone())
        } else if idx == 1 {
            Some(node.parent())
        } else {
            let children: Vec<Node> = match &node.0.lock().unwrap().kind {
                NodeKind::Directory { children } => children.values().cloned().collect(),
                _ => Vec::new(),
            };
            children.get((idx - 2) as usize).cloned()
        };

        match entry {
            None => Ok(Vec::new()),
            Some(entry_node) => {
                *cursor += 1;
                let stat = if idx == 0 {
                    let mut s = entry_node.stat();
                    s.name = ".".to_owned();
                    s
                } else if idx == 1 {
                    let mut s = entry_node.stat();
                    s.name = "..".to_owned();
                    s
                } else {
                    entry_node.stat()
                };
                let mut buf = Vec::new();
                serialize::encode_stat(&stat, &mut buf, dotu).map_err(Error::from)?;
                Ok(buf)
            }
        }
    }
}

#[async_trait]
impl Filesystem for VfsServer {
    type FId = VfsFid;

    async fn rattach(
        &self,
        fid: &mut FId<Self::FId>,
        _afid: Option<&FId<Self::FId>>,
        _uname: &str,
        _aname: &str,
    ) -> Result<FCall> {
        fid.aux.node = Some(self.root.clone());
        fid.aux.cursor = 0;
        Ok(FCall::RAttach { qid: self.root.qid() })
    }

    async fn rwalk(
        &self,
        fid: &FId<Self::FId>,
        newfid: &mut FId<Self::FId>,
        wnames: &[String],
    ) -> Result<FCall> {
        let mut current = fid.aux.node.clone().ok_or_else(|| Error::new(string::EBADF))?;
        let mut qids = Vec::with_capacity(wnames.len());

        for name in wnames {
            let next = match name.as_str() {
                "" | "." => current.clone(),
                ".." => current.parent(),
                other => match current.child(other) {
                    Some(c) => c,
                    None => {
                        if qids.is_empty() || current.is_directory() {
                            return Err(Error::new(string::ENOENT));
                        }
                        break;
                    }
                },
            };
            qids.push(next.qid());
            current = next;
        }

        if qids.len() == wnames.len() {
            newfid.aux.node = Some(current);
            newfid.aux.cursor = 0;
        }
        Ok(FCall::RWalk { wqids: qids })
    }

    async fn ropen(&self, fid: &FId<Self::FId>, _mode: u8) -> Result<FCall> {
        let node = fid.aux.node.clone().ok_or_else(|| Error::new(string::EBADF))?;
        Ok(FCall::ROpen {
            qid: node.qid(),
            iounit: IOUNIT,
        })
    }

    async fn rcreate(
        &self,
        fid: &mut FId<Self::FId>,
        name: &str,
        perm: u32,
        _mode: u8,
        ext: &str,
    ) -> Result<FCall> {
        let dir = fid.aux.node.clone().ok_or_else(|| Error::new(string::EBADF))?;
        if !dir.is_directory() {
            return Err(Error::new(string::ECANTCREATE));
        }

        let kind_bits = DMode::from_bits_truncate(perm);
        let child = if kind_bits.contains(DMode::DIR) {
            dir.mk_directory(name)?
        } else if kind_bits.contains(DMode::SYMLINK) {
            dir.mk_symlink(name, ext)?
        } else if kind_bits.contains(DMode::SOCKET) {
            dir.mk_socket(name)?
        } else if kind_bits.contains(DMode::NAMEDPIPE) {
            dir.mk_pipe(name)?
        } else if kind_bits.contains(DMode::DEVICE) {
            let (is_block, major, minor) = parse_device_ext(ext)?;
            dir.mk_device(name, is_block, major, minor)?
        } else {
            dir.mk_file(name, Vec::new())?
        };

        let qid = child.qid();
        fid.aux.node = Some(child);
        fid.aux.cursor = 0;
        Ok(FCall::RCreate { qid, iounit: IOUNIT })
    }

    async fn rread(&self, fid: &mut FId<Self::FId>, offset: u64, count: u32, dotu: bool) -> Result<FCall> {
        let node = fid.aux.node.clone().ok_or_else(|| Error::new(string::EBADF))?;

        if node.is_directory() {
            if offset == 0 {
                fid.aux.cursor = 0;
            }
            let mut cursor = fid.aux.cursor;
            let bytes = VfsServer::read_dir_entry(&node, &mut cursor, dotu)?;
            fid.aux.cursor = cursor;
            return Ok(FCall::RRead { data: Data(bytes) });
        }

        let (bytes, hook) = match &node.0.lock().unwrap().kind {
            NodeKind::File { data, on_read, .. } => (data.clone(), on_read.clone()),
            _ => return Ok(FCall::RRead { data: Data(Vec::new()) }),
        };

        if let Some(hook) = hook {
            let out = hook(&bytes, offset, count)?;
            return Ok(FCall::RRead { data: Data(out) });
        }

        let len = bytes.len() as u64;
        if offset >= len {
            return Ok(FCall::RRead { data: Data(Vec::new()) });
        }
        let end = std::cmp::min(len, offset + count as u64);
        Ok(FCall::RRead {
            data: Data(bytes[offset as usize..end as usize].to_vec()),
        })
    }

    async fn rwrite(&self, fid: &FId<Self::FId>, offset: u64, data: &Data) -> Result<FCall> {
        let node = fid.aux.node.clone().ok_or_else(|| Error::new(string::EBADF))?;
        let hook = match &node.0.lock().unwrap().kind {
            NodeKind::File { on_write, .. } => on_write.clone(),
            _ => None,
        };
        let count = match hook {
            Some(hook) => hook(offset, &data.0)?,
            None => data.0.len() as u32,
        };
        Ok(FCall::RWrite { count })
    }

    async fn rremove(&self, fid: &FId<Self::FId>) -> Result<FCall> {
        let node = fid.aux.node.clone().ok_or_else(|| Error::new(string::EBADF))?;
        let parent = node.parent();
        let mut inner = parent.0.lock().unwrap();
        if let NodeKind::Directory { children } = &mut inner.kind {
            let target = node.path();
            children.retain(|_, child| child.path() != target);
        }
        Ok(FCall::RRemove)
    }

    async fn rstat(&self, fid: &FId<Self::FId>) -> Result<FCall> {
        let node = fid.aux.node.clone().ok_or_else(|| Error::new(string::EBADF))?;
        Ok(FCall::RStat { stat: node.stat() })
    }

    async fn close(&self) {
        log::info!("vfs connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_its_own_parent() {
        let root = Node::new_root();
        assert_eq!(root.parent().path(), root.path());
    }

    #[test]
    fn distinct_nodes_have_distinct_qid_paths() {
        let root = Node::new_root();
        let a = root.mk_file("a", vec![1]).unwrap();
        let b = root.mk_file("b", vec![2]).unwrap();
        assert_ne!(a.qid().path, b.qid().path);
    }

    #[test]
    fn mk_directory_rejects_duplicate_names() {
        let root = Node::new_root();
        root.mk_file("dup", vec![]).unwrap();
        assert!(root.mk_directory("dup").is_err());
    }

    #[test]
    fn device_ext_round_trips() {
        let root = Node::new_root();
        let dev = root.mk_device("null", false, 1, 3).unwrap();
        assert_eq!(dev.ext(), "c 1 3");
        assert_eq!(parse_device_ext("c 1 3").unwrap(), (false, 1, 3));
        assert_eq!(parse_device_ext("b 8 0").unwrap(), (true, 8, 0));
        assert!(parse_device_ext("garbage").is_err());
    }

    #[test]
    fn file_length_reflects_contents() {
        let root = Node::new_root();
        let f = root.mk_file("meow", b"meow!\n".to_vec()).unwrap();
        assert_eq!(f.len(), 6);
    }

    #[test]
    fn directory_paging_yields_dot_dotdot_then_children() {
        let root = Node::new_root();
        root.mk_file("nyoron", vec![]).unwrap();
        let mut cursor = 0u64;
        let dot = VfsServer::read_dir_entry(&root, &mut cursor, false).unwrap();
        assert!(!dot.is_empty());
        assert_eq!(cursor, 1);
        let dotdot = VfsServer::read_dir_entry(&root, &mut cursor, false).unwrap();
        assert!(!dotdot.is_empty());
        assert_eq!(cursor, 2);
        let child = VfsServer::read_dir_entry(&root, &mut cursor, false).unwrap();
        assert!(!child.is_empty());
        assert_eq!(cursor, 3);
        let eof = VfsServer::read_dir_entry(&root, &mut cursor, false).unwrap();
        assert!(eof.is_empty());
    }

    #[tokio::test]
    async fn read_hook_overrides_inline_buffer() {
        let root = Node::new_root();
        let dyn_file = root.mk_file("clock", b"stale".to_vec()).unwrap();
        dyn_file.set_read_hook(Arc::new(|_data, offset, count| {
            let text = b"ticking";
            let end = std::cmp::min(text.len(), (offset as usize) + count as usize);
            Ok(text.get(offset as usize..end).unwrap_or(&[]).to_vec())
        }));

        let srv = VfsServer::new(root);
        let mut fid = FId::new(
            2,
            VfsFid {
                node: Some(dyn_file),
                cursor: 0,
            },
        );
        match srv.rread(&mut fid, 0, 64, false).await.unwrap() {
            FCall::RRead { data } => assert_eq!(data.0, b"ticking"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn write_hook_is_consulted_instead_of_acking_blindly() {
        let root = Node::new_root();
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let sink = root.mk_file("counter", Vec::new()).unwrap();
        let counter_clone = counter.clone();
        sink.set_write_hook(Arc::new(move |_offset, data| {
            counter_clone.fetch_add(data.len() as u32, std::sync::atomic::Ordering::SeqCst);
            Ok(1)
        }));

        let srv = VfsServer::new(root);
        let fid = FId::new(
            2,
            VfsFid {
                node: Some(sink),
                cursor: 0,
            },
        );
        match srv.rwrite(&fid, 0, &Data(vec![1, 2, 3])).await.unwrap() {
            FCall::RWrite { count } => assert_eq!(count, 1),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
