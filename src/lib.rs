//! A client driver for ReQL, the RethinkDB wire protocol.
//!
//! This crate is the network engine and query lifecycle core: the framed
//! binary wire protocol, SCRAM-SHA-256 authentication, multiplexed
//! query/response demultiplexing over a single connection, the cursor state
//! machine for partial results and changefeeds, and an optional
//! connection-pool dispatch policy. It deliberately does not implement the
//! ReQL term-construction AST or POJO/JSON reflection; callers provide
//! those through the [`term::Term`] and [`codec::Codec`] seams.
#![warn(missing_docs)]
#![allow(clippy::needless_lifetimes)]

pub mod codec;
pub mod conn;
pub mod crypto;
pub mod cursor;
pub mod error;
#[cfg(feature = "pool")]
pub mod pool;
pub mod proto;
pub mod pseudo;
pub mod term;

pub use codec::{Codec, JsonCodec};
pub use conn::{Connection, ConnectionOptions, RunOutcome};
pub use cursor::Cursor;
pub use error::{Error, ErrorKind, Result};
pub use term::{RawTerm, Term};

#[cfg(feature = "pool")]
pub use pool::{ConnectionPool, ConnectionPoolOptions, DispatchPolicy};
