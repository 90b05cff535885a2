//! Serialize/deserialize 9P messages into/from binary.
//!
//! 9P2000 and 9P2000.u share almost all of the wire format; the two
//! places they diverge — `Stat` and `Rerror` — take an explicit `dotu`
//! flag rather than living behind the blanket `Encodable`/`Decodable`
//! traits, since the wire shape there depends on what `Tversion`
//! negotiated for the connection, not on the Rust type alone.

use crate::fcall::*;
use crate::ugid;
use crate::{io_err, res};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use enum_primitive::FromPrimitive;
use std::io::{Read, Result};
use std::mem;
use std::ops::{Shl, Shr};

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };

    ($typ:ident, $buf:expr) => {
        $typ::from_bits_truncate(decode!($buf))
    };
}

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, >>, ?
pub struct SResult<T>(::std::io::Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: decoder << data
    pub fn encode<T: Encodable>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// A wrapper class of ReadBytesExt to provide operator overloads
/// for deserializing
#[derive(Clone, Debug)]
pub struct Decoder<R> {
    reader: R,
}

impl<R: ReadBytesExt> Decoder<R> {
    pub fn new(reader: R) -> Decoder<R> {
        Decoder { reader }
    }
    pub fn decode<T: Decodable>(&mut self) -> Result<T> {
        Decodable::decode(&mut self.reader)
    }
    /// Get inner reader
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for Decoder<R> {
    type Output = SResult<Decoder<R>>;
    fn shr(mut self, rhs: &'a mut T) -> Self::Output {
        match self.decode() {
            Ok(r) => {
                *rhs = r;
                SResult(Ok(self))
            }
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for SResult<Decoder<R>> {
    type Output = Self;
    fn shr(self, rhs: &'a mut T) -> Self::Output {
        match self.0 {
            Ok(mut decoder) => match decoder.decode() {
                Ok(r) => {
                    *rhs = r;
                    SResult(Ok(decoder))
                }
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u64::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let mut bytes = (self.len() as u16).encode(w)?;
        bytes += w.write_all(self.as_bytes()).and(Ok(self.len()))?;
        Ok(bytes)
    }
}

impl Encodable for QId {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w) << &self.typ.bits() << &self.version << &self.path {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = self.0.len();
        let bytes = (size as u32).encode(w)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match self
            .iter()
            .fold(Encoder::new(w) << &(self.len() as u16), |acc, s| acc << s)
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u64::<LittleEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        String::from_utf8(read_exact(r, len as usize)?)
            .map_err(|_| io_err!(Other, "Invalid UTF-8 sequence"))
    }
}

impl Decodable for QId {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(QId {
            typ: decode!(QIdType, *r),
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        let mut buf = Vec::new();
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

/// Encode the body of a `Stat` record, not including its leading
/// `size[2]` length prefix.
fn encode_stat_body<W: WriteBytesExt>(stat: &Stat, w: &mut W, dotu: bool) -> Result<usize> {
    let buf = Encoder::new(w)
        << &stat.typ
        << &stat.dev
        << &stat.qid
        << &stat.mode
        << &stat.atime
        << &stat.mtime
        << &stat.length
        << &stat.name
        << &stat.uid
        << &stat.gid
        << &stat.muid;
    let buf = if dotu {
        buf << &stat.ext << &stat.n_uid << &stat.n_gid << &stat.n_muid
    } else {
        buf
    };
    match buf {
        SResult(Ok(enc)) => Ok(enc.bytes_written()),
        SResult(Err(e)) => Err(e),
    }
}

/// Encode a `Stat` with its leading `size[2]` prefix, as it appears
/// standalone inside `Rstat`/`Twstat`.
pub fn encode_stat<W: WriteBytesExt>(stat: &Stat, w: &mut W, dotu: bool) -> Result<usize> {
    let mut body = Vec::new();
    let body_len = encode_stat_body(stat, &mut body, dotu)?;
    let prefix = (body_len as u16).encode(w)?;
    w.write_all(&body)?;
    Ok(prefix + body_len)
}

/// Decode a `Stat` record preceded by its `size[2]` length prefix.
///
/// Under `.u`, the decoded uid/gid/muid name/id pairs are opportunistically
/// registered into the process-wide `ugid` maps, so a later encode of the
/// same identity round-trips even if this process never read
/// `/etc/passwd`/`/etc/group` itself.
pub fn decode_stat<R: ReadBytesExt>(r: &mut R, dotu: bool) -> Result<Stat> {
    let _size: u16 = Decodable::decode(r)?;
    let typ = Decodable::decode(r)?;
    let dev = Decodable::decode(r)?;
    let qid = Decodable::decode(r)?;
    let mode = Decodable::decode(r)?;
    let atime = Decodable::decode(r)?;
    let mtime = Decodable::decode(r)?;
    let length = Decodable::decode(r)?;
    let name = Decodable::decode(r)?;
    let uid = Decodable::decode(r)?;
    let gid = Decodable::decode(r)?;
    let muid = Decodable::decode(r)?;
    let (ext, n_uid, n_gid, n_muid) = if dotu {
        (
            Decodable::decode(r)?,
            Decodable::decode(r)?,
            Decodable::decode(r)?,
            Decodable::decode(r)?,
        )
    } else {
        (String::new(), 0, 0, 0)
    };
    if dotu {
        ugid::register_user(&uid, n_uid);
        ugid::register_group(&gid, n_gid);
        ugid::register_user(&muid, n_muid);
    }
    Ok(Stat {
        typ,
        dev,
        qid,
        mode,
        atime,
        mtime,
        length,
        name,
        uid,
        gid,
        muid,
        ext,
        n_uid,
        n_gid,
        n_muid,
    })
}

/// Encode a complete `Msg` (tag + body) for the negotiated dialect.
pub fn encode_msg<W: WriteBytesExt>(msg: &Msg, w: &mut W, dotu: bool) -> Result<usize> {
    use FCall::*;

    let typ = msg.body.msg_type();
    let buf = Encoder::new(w) << &(typ as u8) << &msg.tag;

    let buf = match msg.body {
        TVersion {
            ref msize,
            ref version,
        } => buf << msize << version,
        RVersion {
            ref msize,
            ref version,
        } => buf << msize << version,
        TAuth {
            ref afid,
            ref uname,
            ref aname,
        } => buf << afid << uname << aname,
        RAuth { ref aqid } => buf << aqid,
        TAttach {
            ref fid,
            ref afid,
            ref uname,
            ref aname,
        } => buf << fid << afid << uname << aname,
        RAttach { ref qid } => buf << qid,
        RError { ref ename, .. } => buf << ename,
        TFlush { ref oldtag } => buf << oldtag,
        RFlush => buf,
        TWalk {
            ref fid,
            ref newfid,
            ref wnames,
        } => buf << fid << newfid << wnames,
        RWalk { ref wqids } => buf << wqids,
        TOpen { ref fid, ref mode } => buf << fid << mode,
        ROpen {
            ref qid,
            ref iounit,
        } => buf << qid << iounit,
        TCreate {
            ref fid,
            ref name,
            ref perm,
            ref mode,
            ..
        } => buf << fid << name << perm << mode,
        RCreate {
            ref qid,
            ref iounit,
        } => buf << qid << iounit,
        TRead {
            ref fid,
            ref offset,
            ref count,
        } => buf << fid << offset << count,
        RRead { ref data } => buf << data,
        TWrite {
            ref fid,
            ref offset,
            ref data,
        } => buf << fid << offset << data,
        RWrite { ref count } => buf << count,
        TClunk { ref fid } => buf << fid,
        RClunk => buf,
        TRemove { ref fid } => buf << fid,
        RRemove => buf,
        TStat { ref fid } => buf << fid,
        RStat { .. } => buf,
        TWstat { ref fid, .. } => buf << fid,
        RWstat => buf,
    };

    let mut written = match buf {
        SResult(Ok(b)) => b.bytes_written(),
        SResult(Err(e)) => return Err(e),
    };

    // Fields whose shape is version-dependent or too irregular for the
    // `<<` chain (stat records, the `.u` create ext string, the `.u`
    // error errno) are appended here.
    match msg.body {
        TCreate { ref ext, .. } if dotu => {
            written += ext.encode(w)?;
        }
        RError { ref errno, .. } if dotu => {
            written += errno.encode(w)?;
        }
        RStat { ref stat } => {
            written += encode_stat(stat, w, dotu)?;
        }
        TWstat { ref stat, .. } => {
            written += encode_stat(stat, w, dotu)?;
        }
        _ => {}
    }

    Ok(written)
}

/// Recover just the tag from a raw frame (type[1] tag[2] ...) without
/// fully decoding it, so a reply can still be correlated when the body
/// turns out to be malformed. `None` if the frame is too short to even
/// carry a tag.
pub fn peek_tag(bytes: &[u8]) -> Option<u16> {
    if bytes.len() < 3 {
        return None;
    }
    Some(u16::from_le_bytes([bytes[1], bytes[2]]))
}

/// Decode a complete `Msg` (tag + body) for the negotiated dialect.
pub fn decode_msg<R: ReadBytesExt>(r: &mut R, dotu: bool) -> Result<Msg> {
    use MsgType::*;

    let mut buf = r;

    let msg_type = MsgType::from_u8(decode!(buf));
    let tag = decode!(buf);
    let body = match msg_type {
        Some(TVersion) => FCall::TVersion {
            msize: decode!(buf),
            version: decode!(buf),
        },
        Some(RVersion) => FCall::RVersion {
            msize: decode!(buf),
            version: decode!(buf),
        },
        Some(TAuth) => FCall::TAuth {
            afid: decode!(buf),
            uname: decode!(buf),
            aname: decode!(buf),
        },
        Some(RAuth) => FCall::RAuth { aqid: decode!(buf) },
        Some(TAttach) => FCall::TAttach {
            fid: decode!(buf),
            afid: decode!(buf),
            uname: decode!(buf),
            aname: decode!(buf),
        },
        Some(RAttach) => FCall::RAttach { qid: decode!(buf) },
        Some(RError) => {
            let ename = decode!(buf);
            let errno = if dotu { decode!(buf) } else { 0 };
            FCall::RError { ename, errno }
        }
        Some(TFlush) => FCall::TFlush {
            oldtag: decode!(buf),
        },
        Some(RFlush) => FCall::RFlush,
        Some(TWalk) => FCall::TWalk {
            fid: decode!(buf),
            newfid: decode!(buf),
            wnames: decode!(buf),
        },
        Some(RWalk) => FCall::RWalk {
            wqids: decode!(buf),
        },
        Some(TOpen) => FCall::TOpen {
            fid: decode!(buf),
            mode: decode!(buf),
        },
        Some(ROpen) => FCall::ROpen {
            qid: decode!(buf),
            iounit: decode!(buf),
        },
        Some(TCreate) => {
            let fid = decode!(buf);
            let name = decode!(buf);
            let perm = decode!(buf);
            let mode = decode!(buf);
            let ext = if dotu { decode!(buf) } else { String::new() };
            FCall::TCreate {
                fid,
                name,
                perm,
                mode,
                ext,
            }
        }
        Some(RCreate) => FCall::RCreate {
            qid: decode!(buf),
            iounit: decode!(buf),
        },
        Some(TRead) => FCall::TRead {
            fid: decode!(buf),
            offset: decode!(buf),
            count: decode!(buf),
        },
        Some(RRead) => FCall::RRead { data: decode!(buf) },
        Some(TWrite) => FCall::TWrite {
            fid: decode!(buf),
            offset: decode!(buf),
            data: decode!(buf),
        },
        Some(RWrite) => FCall::RWrite {
            count: decode!(buf),
        },
        Some(TClunk) => FCall::TClunk { fid: decode!(buf) },
        Some(RClunk) => FCall::RClunk,
        Some(TRemove) => FCall::TRemove { fid: decode!(buf) },
        Some(RRemove) => FCall::RRemove,
        Some(TStat) => FCall::TStat { fid: decode!(buf) },
        Some(RStat) => FCall::RStat {
            stat: decode_stat(&mut buf, dotu)?,
        },
        Some(TWstat) => {
            let fid = decode!(buf);
            let stat = decode_stat(&mut buf, dotu)?;
            FCall::TWstat { fid, stat }
        }
        Some(RWstat) => FCall::RWstat,
        None => return res!(io_err!(Other, "Invalid message type")),
    };

    Ok(Msg { tag, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn encoder_test1() {
        let expected: Vec<u8> = (0..10).collect();
        let mut encoder = Vec::new();
        for i in 0..10 {
            (&(i as u8)).encode(&mut encoder).unwrap();
        }
        assert_eq!(expected, encoder);
    }

    #[test]
    fn decoder_test1() {
        let expected: Vec<u8> = (0..10).collect();
        let mut decoder = Cursor::new(expected.clone());
        let mut actual: Vec<u8> = Vec::new();
        while let Ok(i) = Decodable::decode(&mut decoder) {
            actual.push(i);
        }
        assert_eq!(expected, actual);
    }

    #[test]
    fn msg_encode_decode_version() {
        let expected = Msg {
            tag: 0xdead,
            body: FCall::RVersion {
                msize: 8192,
                version: P92000U.to_owned(),
            },
        };
        let mut buf = Vec::new();
        encode_msg(&expected, &mut buf, true).unwrap();

        let mut readbuf = Cursor::new(buf);
        let actual = decode_msg(&mut readbuf, true).unwrap();

        assert_eq!(expected, actual);
    }

    #[test]
    fn msg_encode_decode_rerror_dotu() {
        let expected = Msg {
            tag: 7,
            body: FCall::RError {
                ename: "No such file or directory".to_owned(),
                errno: 2,
            },
        };
        let mut buf = Vec::new();
        encode_msg(&expected, &mut buf, true).unwrap();

        let mut readbuf = Cursor::new(buf);
        let actual = decode_msg(&mut readbuf, true).unwrap();
        assert_eq!(expected, actual);
    }

    #[test]
    fn msg_encode_decode_rerror_plain() {
        let sent = Msg {
            tag: 7,
            body: FCall::RError {
                ename: "No such file or directory".to_owned(),
                errno: 99,
            },
        };
        let mut buf = Vec::new();
        encode_msg(&sent, &mut buf, false).unwrap();

        let mut readbuf = Cursor::new(buf);
        let actual = decode_msg(&mut readbuf, false).unwrap();
        match actual.body {
            FCall::RError { ename, errno } => {
                assert_eq!(ename, "No such file or directory");
                assert_eq!(errno, 0);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn stat_round_trips_dotu() {
        let stat = Stat {
            typ: 0,
            dev: 0,
            qid: QId {
                typ: QIdType::DIR,
                version: 1,
                path: 42,
            },
            mode: DMode::DIR.bits() | 0o755,
            atime: 0,
            mtime: 0,
            length: 0,
            name: "etc".to_owned(),
            uid: "glenda".to_owned(),
            gid: "glenda".to_owned(),
            muid: "glenda".to_owned(),
            ext: String::new(),
            n_uid: 1000,
            n_gid: 1000,
            n_muid: 1000,
        };
        let mut buf = Vec::new();
        encode_stat(&stat, &mut buf, true).unwrap();
        let mut readbuf = Cursor::new(buf);
        let actual = decode_stat(&mut readbuf, true).unwrap();
        assert_eq!(stat, actual);
    }

    #[test]
    fn stat_round_trips_plain() {
        let stat = Stat {
            typ: 0,
            dev: 0,
            qid: QId {
                typ: QIdType::FILE,
                version: 0,
                path: 7,
            },
            mode: 0o644,
            atime: 1,
            mtime: 2,
            length: 99,
            name: "motd".to_owned(),
            uid: "glenda".to_owned(),
            gid: "glenda".to_owned(),
            muid: "glenda".to_owned(),
            ext: String::new(),
            n_uid: 0,
            n_gid: 0,
            n_muid: 0,
        };
        let mut buf = Vec::new();
        encode_stat(&stat, &mut buf, false).unwrap();
        let mut readbuf = Cursor::new(buf);
        let actual = decode_stat(&mut readbuf, false).unwrap();
        assert_eq!(stat.name, actual.name);
        assert_eq!(stat.qid, actual.qid);
        assert_eq!(actual.n_uid, 0);
    }

    #[test]
    fn peek_tag_recovers_tag_from_a_truncated_body() {
        let msg = Msg {
            tag: 0x1234,
            body: FCall::TClunk { fid: 9 },
        };
        let mut buf = Vec::new();
        encode_msg(&msg, &mut buf, false).unwrap();
        assert_eq!(peek_tag(&buf), Some(0x1234));
        assert_eq!(peek_tag(&buf[..2]), None);
    }

    #[test]
    fn decoding_a_dotu_stat_registers_the_identity() {
        let stat = Stat {
            typ: 0,
            dev: 0,
            qid: QId {
                typ: QIdType::FILE,
                version: 0,
                path: 1,
            },
            mode: 0o644,
            atime: 0,
            mtime: 0,
            length: 0,
            name: "f".to_owned(),
            uid: "nobody-decode-test".to_owned(),
            gid: "nogroup-decode-test".to_owned(),
            muid: "nobody-decode-test".to_owned(),
            ext: String::new(),
            n_uid: 65534,
            n_gid: 65533,
            n_muid: 65534,
        };
        let mut buf = Vec::new();
        encode_stat(&stat, &mut buf, true).unwrap();
        decode_stat(&mut Cursor::new(buf), true).unwrap();

        assert_eq!(ugid::uid_for_name("nobody-decode-test"), Some(65534));
        assert_eq!(ugid::gid_for_name("nogroup-decode-test"), Some(65533));
    }
}
