//! Asynchronous client side 9P library: a connection plus stream-style
//! helpers that drive the walk→open→io→clunk pipeline described for
//! the reference `d9c` client.
//!
//! # Protocol
//! 9P2000 / 9P2000.u

use crate::conn;
use crate::error::Error;
use crate::fcall::*;
use crate::{io_err, res, serialize, utils};
use bytes::buf::{Buf, BufMut};
use futures::sink::SinkExt;
use log::{trace, warn};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{oneshot, Mutex};
use tokio_stream::StreamExt;
use tokio_util::codec::length_delimited::LengthDelimitedCodec;
use tokio_util::codec::FramedWrite;

type Result<T> = utils::Result<T>;
type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Observable per-fid state of a client helper's walk→open→io pipeline.
/// The control flow itself is plain `async`/`await`; this enum exists so
/// callers and tests can inspect where a reader/writer currently stands,
/// mirroring the state machine the wire protocol implies.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClientFidState {
    Attaching,
    WalkingRead,
    OpeningRead,
    ReadyRead,
    WalkingCreate,
    WalkingWrite,
    OpeningWrite,
    ReadyWrite,
    ClosingWrite,
    Error,
}

struct ClientInner<W> {
    writer: Mutex<FramedWrite<W, LengthDelimitedCodec>>,
    tags: Mutex<conn::TagTable<oneshot::Sender<FCall>>>,
    fids: Mutex<conn::FidTable<()>>,
    dotu: bool,
}

/// A connected 9P client. Cheap to clone; clones share the underlying
/// connection.
pub struct Client<W> {
    inner: Arc<ClientInner<W>>,
}

impl<W> Clone for Client<W> {
    fn clone(&self) -> Self {
        Client {
            inner: self.inner.clone(),
        }
    }
}

impl<W> Client<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    /// Negotiate a version and attach as `uname`/`aname` over an
    /// already-split `(read, write)` pair. `ROOT_FID` (1) is reserved
    /// for the attached root.
    pub async fn connect<R>(read: R, write: W, uname: &str, aname: &str) -> Result<Client<W>>
    where
        R: tokio::io::AsyncRead + Send + Unpin + 'static,
    {
        let mut framed_read = LengthDelimitedCodec::builder()
            .length_field_offset(0)
            .length_field_length(4)
            .length_adjustment(-4)
            .little_endian()
            .new_read(read);
        let mut framed_write = LengthDelimitedCodec::builder()
            .length_field_offset(0)
            .length_field_length(4)
            .length_adjustment(-4)
            .little_endian()
            .new_write(write);

        // The dialect is unknown until Rversion arrives, so the
        // handshake runs inline before the background dispatcher (and
        // therefore the tag table) exists at all.
        let tversion = Msg {
            tag: NOTAG,
            body: FCall::TVersion {
                msize: MAX_MSIZE,
                version: P92000U.to_owned(),
            },
        };
        let mut out = bytes::BytesMut::with_capacity(64).writer();
        serialize::encode_msg(&tversion, &mut out, true)?;
        framed_write.send(out.into_inner().freeze()).await?;

        let frame = framed_read
            .next()
            .await
            .ok_or_else(|| io_err!(UnexpectedEof, "connection closed during version handshake"))??;
        let reply = serialize::decode_msg(&mut frame.reader(), true)?;
        let dotu = match reply.body {
            FCall::RVersion { ref version, .. } if version == P92000U => true,
            FCall::RVersion { ref version, .. } if version == P92000 => false,
            FCall::RVersion { .. } => return res!(io_err!(Other, "server rejected our version")),
            _ => return res!(io_err!(Other, "expected Rversion")),
        };

        let tags: Arc<Mutex<conn::TagTable<oneshot::Sender<FCall>>>> =
            Arc::new(Mutex::new(conn::TagTable::new()));

        {
            let tags = tags.clone();
            tokio::spawn(async move {
                let mut framed_read = framed_read;
                loop {
                    match framed_read.next().await {
                        Some(Ok(bytes)) => match serialize::decode_msg(&mut bytes.reader(), dotu) {
                            Ok(msg) => {
                                let sender = tags.lock().await.retire(msg.tag);
                                match sender {
                                    Some(tx) => {
                                        let _ = tx.send(msg.body);
                                    }
                                    None => trace!("stale reply for tag {}", msg.tag),
                                }
                            }
                            Err(e) => warn!("malformed reply: {:?}", e),
                        },
                        Some(Err(e)) => {
                            warn!("transport error: {:?}", e);
                            break;
                        }
                        None => break,
                    }
                }
                // Connection gone: wake any still-pending requests by
                // dropping their senders, which turns their `rx.await`
                // into an error instead of hanging forever.
                tags.lock().await.clear();
            });
        }

        let inner = Arc::new(ClientInner {
            writer: Mutex::new(framed_write),
            tags,
            fids: Mutex::new(conn::FidTable::new()),
            dotu,
        });
        let client = Client { inner };

        client.inner.fids.lock().await.register(ROOT_FID, ());
        match client
            .request(FCall::TAttach {
                fid: ROOT_FID,
                afid: NOFID,
                uname: uname.to_owned(),
                aname: aname.to_owned(),
            })
            .await?
        {
            FCall::RAttach { .. } => Ok(client),
            _ => res!(io_err!(Other, "expected Rattach")),
        }
    }

    async fn request(&self, body: FCall) -> Result<FCall> {
        let tag = {
            let tags = self.inner.tags.lock().await;
            tags.alloc_free()
                .ok_or_else(|| Error::new("client tag space exhausted"))?
        };
        let (tx, rx) = oneshot::channel();
        self.inner.tags.lock().await.register(tag, tx);

        let msg = Msg { tag, body };
        let mut out = bytes::BytesMut::with_capacity(256).writer();
        serialize::encode_msg(&msg, &mut out, self.inner.dotu)?;
        self.inner
            .writer
            .lock()
            .await
            .send(out.into_inner().freeze())
            .await?;

        let reply = rx
            .await
            .map_err(|_| Error::new("connection closed before reply arrived"))?;
        match reply {
            FCall::RError { ename, errno } => Err(Error::with_errno(ename, errno)),
            other => Ok(other),
        }
    }

    async fn alloc_fid(&self) -> Result<u32> {
        let mut fids = self.inner.fids.lock().await;
        let fid = fids
            .alloc_free()
            .ok_or_else(|| Error::new("client fid space exhausted"))?;
        fids.register(fid, ());
        Ok(fid)
    }

    async fn free_fid(&self, fid: u32) {
        self.inner.fids.lock().await.retire(fid);
    }

    async fn read_chunk(&self, fid: u32, offset: u64, count: u32) -> Result<Vec<u8>> {
        match self.request(FCall::TRead { fid, offset, count }).await? {
            FCall::RRead { data } => Ok(data.0),
            _ => res!(io_err!(Other, "unexpected reply to Tread")),
        }
    }

    async fn write_chunk(&self, fid: u32, offset: u64, data: Vec<u8>) -> Result<u32> {
        match self
            .request(FCall::TWrite {
                fid,
                offset,
                data: Data(data),
            })
            .await?
        {
            FCall::RWrite { count } => Ok(count),
            _ => res!(io_err!(Other, "unexpected reply to Twrite")),
        }
    }

    /// Walk to `path` and open it for reading, returning an
    /// `AsyncRead` that streams the remote file's bytes.
    pub async fn open_read(&self, path: &str) -> Result<ClientReader<W>> {
        let fid = self.alloc_fid().await?;
        let wnames = utils::split_path(path);
        if let Err(e) = self
            .request(FCall::TWalk {
                fid: ROOT_FID,
                newfid: fid,
                wnames,
            })
            .await
        {
            self.free_fid(fid).await;
            return Err(e);
        }
        if let Err(e) = self
            .request(FCall::TOpen {
                fid,
                mode: om::READ,
            })
            .await
        {
            self.free_fid(fid).await;
            return Err(e);
        }
        Ok(ClientReader::new(self.clone(), fid))
    }

    /// Walk to `path` and open it for writing, returning an
    /// `AsyncWrite` that streams bytes to the remote file.
    pub async fn open_write(&self, path: &str) -> Result<ClientWriter<W>> {
        let fid = self.alloc_fid().await?;
        let wnames = utils::split_path(path);
        if let Err(e) = self
            .request(FCall::TWalk {
                fid: ROOT_FID,
                newfid: fid,
                wnames,
            })
            .await
        {
            self.free_fid(fid).await;
            return Err(e);
        }
        if let Err(e) = self
            .request(FCall::TOpen {
                fid,
                mode: om::WRITE,
            })
            .await
        {
            self.free_fid(fid).await;
            return Err(e);
        }
        Ok(ClientWriter::new(self.clone(), fid))
    }

    /// Walk to `dir_path`, create `name` with `perm`, and return an
    /// `AsyncWrite` for the new file.
    pub async fn open_create(&self, dir_path: &str, name: &str, perm: u32) -> Result<ClientWriter<W>> {
        let fid = self.alloc_fid().await?;
        let wnames = utils::split_path(dir_path);
        if let Err(e) = self
            .request(FCall::TWalk {
                fid: ROOT_FID,
                newfid: fid,
                wnames,
            })
            .await
        {
            self.free_fid(fid).await;
            return Err(e);
        }
        if let Err(e) = self
            .request(FCall::TCreate {
                fid,
                name: name.to_owned(),
                perm,
                mode: om::WRITE,
                ext: String::new(),
            })
            .await
        {
            self.free_fid(fid).await;
            return Err(e);
        }
        Ok(ClientWriter::new(self.clone(), fid))
    }

    /// Walk to `path` and return its stat record.
    pub async fn stat(&self, path: &str) -> Result<Stat> {
        let fid = self.alloc_fid().await?;
        let wnames = utils::split_path(path);
        let result = async {
            self.request(FCall::TWalk {
                fid: ROOT_FID,
                newfid: fid,
                wnames,
            })
            .await?;
            match self.request(FCall::TStat { fid }).await? {
                FCall::RStat { stat } => Ok(stat),
                _ => res!(io_err!(Other, "unexpected reply to Tstat")),
            }
        }
        .await;
        let _ = self.request(FCall::TClunk { fid }).await;
        self.free_fid(fid).await;
        result
    }

    /// Walk to `path`, open it as a directory, and read its full stat
    /// listing by draining `Tread` until it answers empty.
    pub async fn list_dir(&self, path: &str) -> Result<Vec<Stat>> {
        let fid = self.alloc_fid().await?;
        let wnames = utils::split_path(path);
        let result = async {
            self.request(FCall::TWalk {
                fid: ROOT_FID,
                newfid: fid,
                wnames,
            })
            .await?;
            self.request(FCall::TOpen {
                fid,
                mode: om::READ,
            })
            .await?;

            let mut stats = Vec::new();
            let mut offset: u64 = 0;
            loop {
                let chunk = self.read_chunk(fid, offset, IOUNIT).await?;
                if chunk.is_empty() {
                    break;
                }
                offset += chunk.len() as u64;
                let mut cursor = std::io::Cursor::new(&chunk[..]);
                while (cursor.position() as usize) < chunk.len() {
                    stats.push(serialize::decode_stat(&mut cursor, self.inner.dotu)?);
                }
            }
            Ok(stats)
        }
        .await;
        let _ = self.request(FCall::TClunk { fid }).await;
        self.free_fid(fid).await;
        result
    }

    /// Walk to `path` and remove it.
    pub async fn remove(&self, path: &str) -> Result<()> {
        let fid = self.alloc_fid().await?;
        let wnames = utils::split_path(path);
        let result = async {
            self.request(FCall::TWalk {
                fid: ROOT_FID,
                newfid: fid,
                wnames,
            })
            .await?;
            self.request(FCall::TRemove { fid }).await?;
            Ok(())
        }
        .await;
        self.free_fid(fid).await;
        result
    }
}

/// Streams bytes read from a remote file opened via `Client::open_read`.
pub struct ClientReader<W> {
    client: Client<W>,
    fid: u32,
    offset: u64,
    buf: VecDeque<u8>,
    eof: bool,
    state: ClientFidState,
    fetch: Option<BoxFuture<Result<Vec<u8>>>>,
}

impl<W> ClientReader<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    fn new(client: Client<W>, fid: u32) -> Self {
        ClientReader {
            client,
            fid,
            offset: 0,
            buf: VecDeque::new(),
            eof: false,
            state: ClientFidState::ReadyRead,
            fetch: None,
        }
    }

    /// Current observable state, for diagnostics and tests.
    pub fn state(&self) -> ClientFidState {
        self.state
    }
}

impl<W> AsyncRead for ClientReader<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.buf.is_empty() {
                let n = std::cmp::min(out.remaining(), this.buf.len());
                for _ in 0..n {
                    out.put_slice(&[this.buf.pop_front().unwrap()]);
                }
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }
            if this.fetch.is_none() {
                let client = this.client.clone();
                let fid = this.fid;
                let offset = this.offset;
                this.state = ClientFidState::ReadyRead;
                this.fetch = Some(Box::pin(async move { client.read_chunk(fid, offset, IOUNIT).await }));
            }
            match this.fetch.as_mut().unwrap().as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(result) => {
                    this.fetch = None;
                    match result {
                        Ok(data) if data.is_empty() => {
                            this.eof = true;
                        }
                        Ok(data) => {
                            this.offset += data.len() as u64;
                            this.buf.extend(data);
                        }
                        Err(e) => {
                            this.state = ClientFidState::Error;
                            let client = this.client.clone();
                            let fid = this.fid;
                            tokio::spawn(async move { client.free_fid(fid).await });
                            return Poll::Ready(Err(std::io::Error::new(
                                std::io::ErrorKind::Other,
                                e.to_string(),
                            )));
                        }
                    }
                }
            }
        }
    }
}

/// Streams bytes written to a remote file opened via
/// `Client::open_write`/`Client::open_create`.
pub struct ClientWriter<W> {
    client: Client<W>,
    fid: u32,
    offset: u64,
    state: ClientFidState,
    write_op: Option<(usize, BoxFuture<Result<u32>>)>,
    shutdown_op: Option<BoxFuture<Result<FCall>>>,
    closed: bool,
}

impl<W> ClientWriter<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    fn new(client: Client<W>, fid: u32) -> Self {
        ClientWriter {
            client,
            fid,
            offset: 0,
            state: ClientFidState::ReadyWrite,
            write_op: None,
            shutdown_op: None,
            closed: false,
        }
    }

    pub fn state(&self) -> ClientFidState {
        self.state
    }
}

impl<W> AsyncWrite for ClientWriter<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        if this.write_op.is_none() {
            let chunk_len = std::cmp::min(buf.len(), IOUNIT as usize);
            let chunk = buf[..chunk_len].to_vec();
            let client = this.client.clone();
            let fid = this.fid;
            let offset = this.offset;
            this.state = ClientFidState::ReadyWrite;
            this.write_op = Some((
                chunk_len,
                Box::pin(async move { client.write_chunk(fid, offset, chunk).await }),
            ));
        }
        let (requested, fut) = this.write_op.as_mut().unwrap();
        let requested = *requested;
        match fut.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(count)) => {
                this.write_op = None;
                this.offset += count as u64;
                Poll::Ready(Ok(std::cmp::min(count as usize, requested)))
            }
            Poll::Ready(Err(e)) => {
                this.write_op = None;
                this.state = ClientFidState::Error;
                let client = this.client.clone();
                let fid = this.fid;
                tokio::spawn(async move { client.free_fid(fid).await });
                Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Ok(()));
        }
        this.state = ClientFidState::ClosingWrite;
        if this.shutdown_op.is_none() {
            let client = this.client.clone();
            let fid = this.fid;
            this.shutdown_op = Some(Box::pin(async move { client.request(FCall::TClunk { fid }).await }));
        }
        match this.shutdown_op.as_mut().unwrap().as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                this.closed = true;
                let client = this.client.clone();
                let fid = this.fid;
                tokio::spawn(async move { client.free_fid(fid).await });
                Poll::Ready(
                    result
                        .map(|_| ())
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string())),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_fid_state_variants_are_distinct() {
        assert_ne!(ClientFidState::Attaching, ClientFidState::Error);
        assert_ne!(ClientFidState::ReadyRead, ClientFidState::ReadyWrite);
    }
}
