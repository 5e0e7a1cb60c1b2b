//! The seam between this crate and the (out-of-scope) POJO/JSON conversion
//! layer.
//!
//! spec.md §1 delegates `encode`/`decode` to an injected codec rather than
//! having the core reflect over arbitrary caller types. Where the source
//! driver used a runtime-reflection mapper keyed by a `Class<T>` token, this
//! crate uses Rust's own generics: `Codec` exposes generic
//! `encode`/`decode` methods that `serde` monomorphizes per call site, so a
//! caller never hands the core a type descriptor at runtime.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::{error::Result, pseudo};

/// Converts between caller-level values and the JSON the wire protocol
/// carries. [`JsonCodec`] is the default, `serde_json`-backed
/// implementation; callers with a different POJO mapping convention can
/// provide their own.
///
/// Object-safe (plain `Value -> Value` methods) so a [`Connection`] can hold
/// one behind an `Arc<dyn Codec>` rather than being generic over it;
/// [`decode`]/[`encode`] are free functions layered on top that do the
/// generic `serde` (de)serialization a concrete `Codec` call site needs.
/// Only [`Codec::decode_value`] is ever called by this crate's own code (on
/// rows a [`Cursor`](crate::Cursor) hands back) — `encode_value` exists so
/// an out-of-scope AST/term layer building query arguments from POJOs has
/// somewhere to route a non-default mapping; spec.md §1 keeps that
/// conversion out of the core's own query serialization, which already
/// receives JSON-serializable values from `Term::build()`.
pub trait Codec: Send + Sync + std::fmt::Debug {
    /// Converts a caller-level argument value (already serialized to JSON by
    /// `serde`) into the shape this codec's wire convention expects.
    fn encode_value(&self, value: Value) -> Result<Value>;

    /// Normalizes a raw decoded row — in particular, `$reql_type$`-tagged
    /// pseudotypes — into a shape `serde` can deserialize directly into the
    /// caller's target type.
    fn decode_value(&self, value: Value) -> Result<Value>;
}

/// Serializes `value` with `serde`, then runs it through `codec`'s
/// [`Codec::encode_value`].
pub fn encode<C: Codec + ?Sized, T: Serialize>(codec: &C, value: &T) -> Result<Value> {
    codec.encode_value(serde_json::to_value(value)?)
}

/// Runs `value` through `codec`'s [`Codec::decode_value`], then deserializes
/// the result with `serde` into the caller's target type.
pub fn decode<C: Codec + ?Sized, T: DeserializeOwned>(codec: &C, value: Value) -> Result<T> {
    Ok(serde_json::from_value(codec.decode_value(value)?)?)
}

/// The default codec: identity encoding plus pseudotype normalization on
/// decode.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode_value(&self, value: Value) -> Result<Value> {
        Ok(value)
    }

    fn decode_value(&self, value: Value) -> Result<Value> {
        pseudo::normalize(value)
    }
}
