//! 9P error representations.
//!
//! 9P2000 and 9P2000.u represent errors as strings (`Rerror.ename`); `.u`
//! additionally appends a numeric errno that peers may treat as
//! "don't care" (0) when they have nothing more specific to report.

use std::{fmt, io};

/// A 9P error.
///
/// `Proto` carries the string that goes on the wire as `Rerror.ename`
/// plus the `.u` errno to attach (0 if the implementation has nothing
/// more specific). `Io` wraps a transport-level failure that never makes
/// it onto the wire as a 9P message at all.
#[derive(Debug)]
pub enum Error {
    Proto(String, u16),
    Io(io::Error),
}

impl Error {
    pub fn new(msg: impl Into<String>) -> Self {
        Error::Proto(msg.into(), 0)
    }

    pub fn with_errno(msg: impl Into<String>, errno: u16) -> Self {
        Error::Proto(msg.into(), errno)
    }

    /// The string to place in `Rerror.ename`.
    pub fn ename(&self) -> String {
        match self {
            Error::Proto(msg, _) => msg.clone(),
            Error::Io(e) => e.to_string(),
        }
    }

    /// The `.u` errno to append to `Rerror`; 0 ("don't care") unless a
    /// more specific value was supplied.
    pub fn errno(&self) -> u16 {
        match self {
            Error::Proto(_, errno) => *errno,
            Error::Io(_) => 0,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Proto(msg, errno) => write!(f, "{} (errno {})", msg, errno),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Proto(..) => None,
            Error::Io(e) => Some(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// 9P error strings, imported from `include/net/9p/error.c` of the Linux
/// kernel (the canonical 9P2000/9P2000.u error-string catalog).
pub mod string {
    pub const EPERM: &str = "Operation not permitted";
    pub const ENOENT: &str = "No such file or directory";
    pub const EIO: &str = "Input/output error";
    pub const EEXIST: &str = "File exists";
    pub const ENOTDIR: &str = "Not a directory";
    pub const EISDIR: &str = "Is a directory";
    pub const EINVAL: &str = "Invalid argument";
    pub const ENOSYS: &str = "Function not implemented or malformed message.";
    pub const EMALFORMED: &str = "Malformed message.";
    pub const EBADF: &str = "fid unknown or out of range";
    pub const EPROTO: &str = "protocol botch";
    pub const ENOTEMPTY: &str = "Directory not empty";
    pub const EROFS: &str = "Read-only file system";
    pub const ENOMEM: &str = "Cannot allocate memory";
    pub const ECANTCREATE: &str = "Cannot create nodes under anything but a directory.";
}
