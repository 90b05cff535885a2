//! Asynchronous server side 9P library.
//!
//! # Protocol
//! 9P2000 / 9P2000.u

use crate::{
    conn::{self, Version},
    error::{string, Error},
    fcall::*,
    io_err, serialize,
    utils::{self, Result},
};
use async_trait::async_trait;
use bytes::buf::{Buf, BufMut};
use futures::sink::SinkExt;
use log::{error, info, trace, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio_stream::StreamExt;
use tokio_util::codec::length_delimited::LengthDelimitedCodec;

/// Represents a fid of clients holding associated `Filesystem::FId`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FId<T> {
    /// Raw client side fid.
    fid: u32,

    /// `Filesystem::FId` associated with this fid.
    pub aux: T,
}

impl<T> FId<T> {
    pub fn new(fid: u32, aux: T) -> Self {
        FId { fid, aux }
    }

    pub fn fid(&self) -> u32 {
        self.fid
    }
}

fn bad_fid() -> Error {
    Error::new(string::EBADF)
}

/// Filesystem server trait for implementing 9P2000/9P2000.u servers.
///
/// Implementors represent an error condition by returning an `Err`;
/// otherwise they return the `FCall` variant the operation calls for.
/// Version negotiation (`Tversion`) and flush (`Tflush`) are handled by
/// the dispatcher itself rather than through this trait, since neither
/// is a per-filesystem customization point.
#[async_trait]
pub trait Filesystem: Send {
    /// User-defined state associated with a client's fid.
    type FId: Send + Sync + Default + Clone;

    /// Authenticate a user. The default filesystem requires none.
    async fn rauth(&self, _afid: &mut FId<Self::FId>, _uname: &str, _aname: &str) -> Result<FCall> {
        Err(Error::new(string::ENOSYS))
    }

    /// Attach `fid` to the filesystem root (or a subtree named by `aname`).
    async fn rattach(
        &self,
        _fid: &mut FId<Self::FId>,
        _afid: Option<&FId<Self::FId>>,
        _uname: &str,
        _aname: &str,
    ) -> Result<FCall> {
        Err(Error::new(string::ENOSYS))
    }

    /// Walk `wnames` starting at `fid`, filling in `newfid` on success
    /// (including on a valid partial walk).
    async fn rwalk(
        &self,
        _fid: &FId<Self::FId>,
        _newfid: &mut FId<Self::FId>,
        _wnames: &[String],
    ) -> Result<FCall> {
        Err(Error::new(string::ENOSYS))
    }

    /// Open `fid` for the given mode.
    async fn ropen(&self, _fid: &FId<Self::FId>, _mode: u8) -> Result<FCall> {
        Err(Error::new(string::ENOSYS))
    }

    /// Create `name` under directory `fid`, rebinding `fid` to the new node.
    async fn rcreate(
        &self,
        _fid: &mut FId<Self::FId>,
        _name: &str,
        _perm: u32,
        _mode: u8,
        _ext: &str,
    ) -> Result<FCall> {
        Err(Error::new(string::ENOSYS))
    }

    /// Read from `fid`. Directory fids carry their read cursor in
    /// `Self::FId`, hence the mutable borrow. `dotu` is threaded in
    /// because a directory read answers with stat-encoded bytes, and
    /// the stat wire shape is itself dialect-dependent (see
    /// `serialize::encode_stat`); every other operation stays
    /// dialect-agnostic since the dispatcher encodes the reply.
    async fn rread(&self, _fid: &mut FId<Self::FId>, _offset: u64, _count: u32, _dotu: bool) -> Result<FCall> {
        Err(Error::new(string::ENOSYS))
    }

    /// Write to `fid`.
    async fn rwrite(&self, _fid: &FId<Self::FId>, _offset: u64, _data: &Data) -> Result<FCall> {
        Err(Error::new(string::ENOSYS))
    }

    /// Close `fid`. The dispatcher retires the fid table entry
    /// unconditionally after calling this.
    async fn rclunk(&self, _fid: &FId<Self::FId>) -> Result<FCall> {
        Ok(FCall::RClunk)
    }

    /// Remove the file `fid` refers to. The dispatcher retires the fid
    /// table entry unconditionally after calling this.
    async fn rremove(&self, _fid: &FId<Self::FId>) -> Result<FCall> {
        Err(Error::new(string::ENOSYS))
    }

    /// Compose a stat record describing `fid`.
    async fn rstat(&self, _fid: &FId<Self::FId>) -> Result<FCall> {
        Err(Error::new(string::ENOSYS))
    }

    /// Acknowledge a `Twstat`. The default filesystem does not mutate
    /// anything and simply acknowledges.
    async fn rwstat(&self, _fid: &FId<Self::FId>, _stat: &Stat) -> Result<FCall> {
        Ok(FCall::RWstat)
    }

    /// Invoked once when a connection using this filesystem closes.
    async fn close(&self) {}
}

/// Dispatch a single already-decoded `T*` message against `fs` and
/// `fids`. Runs to completion before the caller reads the next frame,
/// realizing the "no concurrent T* on one connection" ordering
/// guarantee directly rather than through external synchronization.
pub async fn dispatch_once<Fs>(
    msg: &Msg,
    fs: &Fs,
    fids: &mut conn::FidTable<FId<Fs::FId>>,
    dotu: bool,
) -> Result<FCall>
where
    Fs: Filesystem + Send + Sync,
{
    use FCall::*;

    match msg.body {
        TAuth {
            afid,
            ref uname,
            ref aname,
        } => {
            let mut afid_state = FId {
                fid: afid,
                aux: Default::default(),
            };
            let result = fs.rauth(&mut afid_state, uname, aname).await;
            if result.is_ok() {
                fids.register(afid, afid_state);
            }
            result
        }
        TAttach {
            fid,
            afid,
            ref uname,
            ref aname,
        } => {
            let afid_state = if afid == NOFID {
                None
            } else {
                fids.lookup(afid).cloned()
            };
            let mut fid_state = FId {
                fid,
                aux: Default::default(),
            };
            let result = fs
                .rattach(&mut fid_state, afid_state.as_ref(), uname, aname)
                .await;
            if result.is_ok() {
                fids.register(fid, fid_state);
            }
            result
        }
        TWalk {
            fid,
            newfid,
            ref wnames,
        } => {
            let cur = fids.lookup(fid).cloned().ok_or_else(bad_fid)?;
            let mut new_state = FId {
                fid: newfid,
                aux: Default::default(),
            };
            let result = fs.rwalk(&cur, &mut new_state, wnames).await;
            if result.is_ok() {
                fids.register(newfid, new_state);
            }
            result
        }
        TOpen { fid, mode } => {
            let cur = fids.lookup(fid).ok_or_else(bad_fid)?;
            fs.ropen(cur, mode).await
        }
        TCreate {
            fid,
            ref name,
            perm,
            mode,
            ref ext,
        } => {
            let cur = fids.lookup_mut(fid).ok_or_else(bad_fid)?;
            fs.rcreate(cur, name, perm, mode, ext).await
        }
        TRead { fid, offset, count } => {
            let cur = fids.lookup_mut(fid).ok_or_else(bad_fid)?;
            fs.rread(cur, offset, count, dotu).await
        }
        TWrite {
            fid,
            offset,
            ref data,
        } => {
            let cur = fids.lookup(fid).ok_or_else(bad_fid)?;
            fs.rwrite(cur, offset, data).await
        }
        TClunk { fid } => {
            let result = match fids.lookup(fid) {
                Some(cur) => fs.rclunk(cur).await,
                None => Ok(RClunk),
            };
            fids.retire(fid);
            result
        }
        TRemove { fid } => {
            let result = match fids.lookup(fid) {
                Some(cur) => fs.rremove(cur).await,
                None => Ok(RRemove),
            };
            fids.retire(fid);
            result
        }
        TStat { fid } => {
            let cur = fids.lookup(fid).ok_or_else(bad_fid)?;
            fs.rstat(cur).await
        }
        TWstat { fid, ref stat } => {
            let cur = fids.lookup(fid).ok_or_else(bad_fid)?;
            fs.rwstat(cur, stat).await
        }
        _ => Err(Error::new(string::ENOSYS)),
    }
}

/// Serve one connection: negotiate a version, then decode and answer
/// frames sequentially until the peer closes or sends a malformed one.
/// Transport-generic over any `AsyncRead`/`AsyncWrite` pair, which is
/// what lets tests drive it over an in-process `tokio::io::duplex` pipe
/// instead of a real socket.
pub async fn dispatch<Fs, Reader, Writer>(filesystem: Fs, reader: Reader, writer: Writer) -> Result<()>
where
    Fs: Filesystem + Send + Sync,
    Reader: AsyncRead + Send + Unpin,
    Writer: AsyncWrite + Send + Unpin,
{
    let mut fids: conn::FidTable<FId<Fs::FId>> = conn::FidTable::new();
    let mut version = Version::Uninitialised;

    let mut framedread = LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .new_read(reader);
    let mut framedwrite = LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .new_write(writer);

    while let Some(bytes) = framedread.next().await {
        let bytes = match bytes {
            Ok(b) => b,
            Err(e) => {
                warn!("malformed frame: {:?}", e);
                break;
            }
        };

        // `bytes` is cloned for the decode attempt (cheap: cloning a
        // received frame's `BytesMut`) so the raw header is still
        // available afterwards to salvage a tag to reply to if the body
        // turns out to be malformed.
        let msg = match serialize::decode_msg(&mut bytes.clone().reader(), version.is_dotu()) {
            Ok(m) => m,
            Err(e) => {
                warn!("malformed message: {:?}", e);
                // Per spec, a message shorter/malformed for its code is
                // answered with a generic Rerror and its tag retired;
                // the connection itself is not torn down. If even the
                // tag can't be recovered, there is nothing to correlate
                // a reply to and the frame is simply dropped.
                if let Some(tag) = serialize::peek_tag(&bytes) {
                    let response = Msg {
                        tag,
                        body: FCall::RError {
                            ename: string::EMALFORMED.to_owned(),
                            errno: 0,
                        },
                    };
                    let mut out = bytes::BytesMut::with_capacity(64).writer();
                    if serialize::encode_msg(&response, &mut out, version.is_dotu()).is_ok() {
                        if let Err(e) = framedwrite.send(out.into_inner().freeze()).await {
                            error!("failed to send malformed-message reply: {:?}", e);
                            break;
                        }
                    }
                }
                continue;
            }
        };
        trace!("\t<- {:?}", msg);

        let response_body = if let FCall::TVersion {
            msize,
            ref version,
        } = msg.body
        {
            let (negotiated, reply_msize, reply_version) = conn::negotiate(msize, version);
            info!("version negotiated: {:?} msize={}", negotiated, reply_msize);
            version = negotiated;
            fids.clear();
            FCall::RVersion {
                msize: reply_msize,
                version: reply_version,
            }
        } else if let FCall::TFlush { .. } = msg.body {
            FCall::RFlush
        } else if !version.is_negotiated() {
            warn!("message before successful Tversion; rejecting");
            FCall::RError {
                ename: string::ENOSYS.to_owned(),
                errno: 0,
            }
        } else {
            dispatch_once(&msg, &filesystem, &mut fids, version.is_dotu())
                .await
                .unwrap_or_else(|e| {
                    error!("{:?}: {}", msg.body.msg_type(), e);
                    FCall::RError {
                        ename: e.ename(),
                        errno: e.errno(),
                    }
                })
        };

        let response = Msg {
            tag: msg.tag,
            body: response_body,
        };

        let mut out = bytes::BytesMut::with_capacity(256).writer();
        if let Err(e) = serialize::encode_msg(&response, &mut out, version.is_dotu()) {
            error!("failed to serialize reply for tag {}: {:?}", msg.tag, e);
            continue;
        }
        if let Err(e) = framedwrite.send(out.into_inner().freeze()).await {
            error!("failed to send reply for tag {}: {:?}", msg.tag, e);
            break;
        }
        trace!("\t-> {:?}", response);
    }

    filesystem.close().await;
    Ok(())
}

async fn srv_async_tcp<Fs>(filesystem: Fs, addr: &str) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync + Clone,
{
    let listener = TcpListener::bind(addr).await?;

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("accepted: {:?}", peer);

        let fs = filesystem.clone();
        tokio::spawn(async move {
            let (readhalf, writehalf) = stream.into_split();
            if let Err(e) = dispatch(fs, readhalf, writehalf).await {
                error!("connection error: {:?}", e);
            }
        });
    }
}

struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;
    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("failed to remove socket file {:?}: {}", self.path, e);
        }
    }
}

pub async fn srv_async_unix<Fs>(filesystem: Fs, addr: impl AsRef<Path>) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync + Clone,
{
    use tokio::signal::unix::{signal, SignalKind};

    let listener = DeleteOnDrop::bind(addr)?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let running = Arc::new(std::sync::atomic::AtomicBool::new(true));

    {
        let running = running.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                _ = sigint.recv() => info!("received SIGINT, shutting down"),
            }
            running.store(false, Ordering::SeqCst);
        });
    }

    while running.load(Ordering::SeqCst) {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        info!("accepted: {:?}", peer);
                        let fs = filesystem.clone();
                        tokio::spawn(async move {
                            let (readhalf, writehalf) = tokio::io::split(stream);
                            if let Err(e) = dispatch(fs, readhalf, writehalf).await {
                                error!("connection error: {:?}", e);
                            }
                        });
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    info!("server shutdown complete");
    Ok(())
}

/// Serve `filesystem` on `addr`, formatted `proto!addr!port` (e.g.
/// `tcp!0.0.0.0!564` or `unix!/tmp/ninep.sock!0`; the port is ignored
/// for `unix`).
pub async fn srv_async<Fs>(filesystem: Fs, addr: &str) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync + Clone,
{
    let (proto, host, port) =
        utils::parse_proto(addr).ok_or_else(|| io_err!(InvalidInput, "invalid protocol or address"))?;

    match proto {
        "tcp" => srv_async_tcp(filesystem, &format!("{}:{}", host, port)).await,
        "unix" => srv_async_unix(filesystem, host).await,
        _ => Err(From::from(io_err!(InvalidInput, "protocol not supported"))),
    }
}
