//! The wire protocol: handshake framing, query/response value objects, and
//! the length-prefixed frame codec that carries them.
//!
//! Grounded on the teacher's `cmap::conn::wire` module, which groups the
//! same concerns (a fixed header codec, message value objects, the
//! handshake) behind one parent module.

pub mod frame;
pub mod handshake;
pub mod query;
pub mod response;
pub mod scram_attrs;
