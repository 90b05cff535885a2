#![forbid(unsafe_code)]
//! Asynchronous 9P2000 / 9P2000.u network file-service protocol engine,
//! with a client helper, a server dispatcher, and an in-memory virtual
//! filesystem you can serve with it.
//!
//! # Getting started
//!
//! Serve an in-memory tree:
//!
//! ```no_run
//! use ninep::{srv::srv_async, vfs::{Node, VfsServer}};
//!
//! #[tokio::main]
//! async fn main() -> ninep::Result<()> {
//!     let root = Node::new_root();
//!     root.mk_file("motd", b"hello from ninep\n".to_vec())?;
//!     srv_async(VfsServer::new(root), "tcp!127.0.0.1!564").await
//! }
//! ```
//!
//! # Transport
//!
//! `srv_async` and `Client::connect` both speak over any paired byte
//! streams; `srv_async`'s `addr` argument is `proto!host!port`, e.g.
//! `"tcp!0.0.0.0!564"` or `"unix!/tmp/ninep.sock!0"`.

pub mod error;
pub mod fcall;
pub mod serialize;
pub mod conn;
pub mod ugid;
pub mod srv;
pub mod client;
pub mod vfs;
#[macro_use]
pub mod utils;

pub use crate::error::Error;
pub use crate::fcall::*;
pub use crate::utils::Result;
