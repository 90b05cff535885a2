//! 9P protocol data types and constants.
//!
//! # Protocol
//! 9P2000 / 9P2000.u

use bitflags::bitflags;
use enum_primitive::*;

/// 9P2000 version string
pub const P92000: &str = "9P2000";

/// 9P2000.u version string
pub const P92000U: &str = "9P2000.u";

/// The version string `Rversion` carries when the server does not
/// understand the client's version string.
pub const VERSION_UNKNOWN: &str = "unknown";

/// Special tag which `Tversion`/`Rversion` must use as `tag`.
pub const NOTAG: u16 = 0xFFFF;

/// Special value which `Tattach` with no auth must use as `afid`.
pub const NOFID: u32 = 0xFFFFFFFF;

/// Lower bound of the negotiable message size window.
pub const MIN_MSIZE: u32 = 0x2000;
/// Upper bound of the negotiable message size window.
pub const MAX_MSIZE: u32 = 0x2000;

/// iounit reported on `Ropen`/`Rcreate`.
pub const IOUNIT: u32 = 0x1000;

/// Reserved client fid: the root fid used by the client helpers.
pub const ROOT_FID: u32 = 1;

bitflags! {
    /// Bits in `QId.typ`.
    #[derive(Copy, Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord)]
    pub struct QIdType: u8 {
        const DIR     = 0x80;
        const APPEND  = 0x40;
        const EXCL    = 0x20;
        const MOUNT   = 0x10;
        const AUTH    = 0x08;
        const TMP     = 0x04;
        #[doc = "9P2000.u symbolic link"]
        const LINK    = 0x02;
        const FILE    = 0x00;
    }
}

bitflags! {
    /// Bits in `Stat.mode`.
    #[derive(Copy, Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord)]
    pub struct DMode: u32 {
        const DIR       = 0x80000000;
        const APPEND    = 0x40000000;
        const EXCL      = 0x20000000;
        const MOUNT     = 0x10000000;
        const AUTH      = 0x08000000;
        const TMP       = 0x04000000;
        #[doc = "9P2000.u symlink"]
        const SYMLINK   = 0x02000000;
        #[doc = "9P2000.u device node"]
        const DEVICE    = 0x00800000;
        #[doc = "9P2000.u named pipe"]
        const NAMEDPIPE = 0x00200000;
        #[doc = "9P2000.u socket"]
        const SOCKET    = 0x00100000;
        const SETUID    = 0x00080000;
        const SETGID    = 0x00040000;
        const READ      = 0x4;
        const WRITE     = 0x2;
        const EXEC      = 0x1;
    }
}

/// Open mode, the type of I/O to be checked against file permissions.
pub mod om {
    pub const READ: u8 = 0;
    pub const WRITE: u8 = 1;
    pub const RDWR: u8 = 2;
    pub const EXEC: u8 = 3;
    pub const TRUNC: u8 = 0x10;
    pub const RCLOSE: u8 = 0x40;
}

/// Server-side unique identification for a file, stable across its
/// lifetime. Two distinct server files never share the same `path`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct QId {
    pub typ: QIdType,
    pub version: u32,
    pub path: u64,
}

/// A 9P2000/9P2000.u stat record.
///
/// `ext`, `n_uid`, `n_gid`, `n_muid` only travel on the wire under
/// `9P2000.u`; under plain `9P2000` they are ignored by the codec.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stat {
    pub typ: u16,
    pub dev: u32,
    pub qid: QId,
    pub mode: u32,
    pub atime: u32,
    pub mtime: u32,
    pub length: u64,
    pub name: String,
    pub uid: String,
    pub gid: String,
    pub muid: String,
    pub ext: String,
    pub n_uid: u32,
    pub n_gid: u32,
    pub n_muid: u32,
}

/// Data carried by `Rread`/`Twrite`.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Data(pub Vec<u8>);

enum_from_primitive! {
    #[doc = "Message type, 9P operations"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum MsgType {
        TVersion = 100,
        RVersion = 101,
        TAuth    = 102,
        RAuth    = 103,
        TAttach  = 104,
        RAttach  = 105,
        RError   = 107,
        TFlush   = 108,
        RFlush   = 109,
        TWalk    = 110,
        RWalk    = 111,
        TOpen    = 112,
        ROpen    = 113,
        TCreate  = 114,
        RCreate  = 115,
        TRead    = 116,
        RRead    = 117,
        TWrite   = 118,
        RWrite   = 119,
        TClunk   = 120,
        RClunk   = 121,
        TRemove  = 122,
        RRemove  = 123,
        TStat    = 124,
        RStat    = 125,
        TWstat   = 126,
        RWstat   = 127,
    }
}

impl MsgType {
    /// A reply's numeric code is always odd.
    pub fn is_r(&self) -> bool {
        (*self as u8) % 2 == 1
    }

    pub fn is_t(&self) -> bool {
        !self.is_r()
    }
}

/// A data type encapsulating the various 9P messages.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FCall {
    TVersion {
        msize: u32,
        version: String,
    },
    RVersion {
        msize: u32,
        version: String,
    },
    TAuth {
        afid: u32,
        uname: String,
        aname: String,
    },
    RAuth {
        aqid: QId,
    },
    TAttach {
        fid: u32,
        afid: u32,
        uname: String,
        aname: String,
    },
    RAttach {
        qid: QId,
    },
    RError {
        ename: String,
        errno: u16,
    },
    TFlush {
        oldtag: u16,
    },
    RFlush,
    TWalk {
        fid: u32,
        newfid: u32,
        wnames: Vec<String>,
    },
    RWalk {
        wqids: Vec<QId>,
    },
    TOpen {
        fid: u32,
        mode: u8,
    },
    ROpen {
        qid: QId,
        iounit: u32,
    },
    TCreate {
        fid: u32,
        name: String,
        perm: u32,
        mode: u8,
        ext: String,
    },
    RCreate {
        qid: QId,
        iounit: u32,
    },
    TRead {
        fid: u32,
        offset: u64,
        count: u32,
    },
    RRead {
        data: Data,
    },
    TWrite {
        fid: u32,
        offset: u64,
        data: Data,
    },
    RWrite {
        count: u32,
    },
    TClunk {
        fid: u32,
    },
    RClunk,
    TRemove {
        fid: u32,
    },
    RRemove,
    TStat {
        fid: u32,
    },
    RStat {
        stat: Stat,
    },
    TWstat {
        fid: u32,
        stat: Stat,
    },
    RWstat,
}

impl FCall {
    /// The `MsgType` code corresponding to this message.
    pub fn msg_type(&self) -> MsgType {
        use FCall::*;
        match *self {
            TVersion { .. } => MsgType::TVersion,
            RVersion { .. } => MsgType::RVersion,
            TAuth { .. } => MsgType::TAuth,
            RAuth { .. } => MsgType::RAuth,
            TAttach { .. } => MsgType::TAttach,
            RAttach { .. } => MsgType::RAttach,
            RError { .. } => MsgType::RError,
            TFlush { .. } => MsgType::TFlush,
            RFlush => MsgType::RFlush,
            TWalk { .. } => MsgType::TWalk,
            RWalk { .. } => MsgType::RWalk,
            TOpen { .. } => MsgType::TOpen,
            ROpen { .. } => MsgType::ROpen,
            TCreate { .. } => MsgType::TCreate,
            RCreate { .. } => MsgType::RCreate,
            TRead { .. } => MsgType::TRead,
            RRead { .. } => MsgType::RRead,
            TWrite { .. } => MsgType::TWrite,
            RWrite { .. } => MsgType::RWrite,
            TClunk { .. } => MsgType::TClunk,
            RClunk => MsgType::RClunk,
            TRemove { .. } => MsgType::TRemove,
            RRemove => MsgType::RRemove,
            TStat { .. } => MsgType::TStat,
            RStat { .. } => MsgType::RStat,
            TWstat { .. } => MsgType::TWstat,
            RWstat => MsgType::RWstat,
        }
    }

    /// The `newfid` this message introduces, if any.
    pub fn newfid(&self) -> Option<u32> {
        match *self {
            FCall::TWalk { newfid, .. } => Some(newfid),
            _ => None,
        }
    }
}

/// Envelope for 9P messages: the tag plus the message body.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Msg {
    pub tag: u16,
    pub body: FCall,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_type_parity_matches_direction() {
        assert!(MsgType::RVersion.is_r());
        assert!(MsgType::TVersion.is_t());
        assert!(MsgType::RError.is_r());
        assert!(MsgType::RWstat.is_r());
        assert!(MsgType::TWstat.is_t());
    }

    #[test]
    fn dmode_bits_have_expected_values() {
        assert_eq!(DMode::DIR.bits(), 0x80000000);
        assert_eq!(DMode::SYMLINK.bits(), 0x02000000);
        assert_eq!(DMode::SOCKET.bits(), 0x00100000);
        assert_eq!(QIdType::DIR.bits(), 0x80);
        assert_eq!(QIdType::LINK.bits(), 0x02);
    }
}
