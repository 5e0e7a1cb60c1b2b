//! Parses and classifies response frames: `{"t":type,"r":[...],"n":[...]?,
//! "p":...?,"b":...?,"e":error_type?}`.
//!
//! Grounded on the classification table in spec.md §4.6 and the teacher's
//! `command_responses.rs` parse-then-classify shape (a thin deserialize
//! struct feeding a typed outcome the caller matches on, rather than the
//! caller inspecting raw JSON).

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, ErrorKind, Result, RuntimeErrorKind, RuntimeErrorType};

/// The eight response message types defined by the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    SuccessAtom,
    SuccessSequence,
    SuccessPartial,
    WaitComplete,
    ServerInfo,
    ClientError,
    CompileError,
    RuntimeError,
}

impl ResponseType {
    fn from_wire(t: i64) -> Result<Self> {
        Ok(match t {
            1 => ResponseType::SuccessAtom,
            2 => ResponseType::SuccessSequence,
            3 => ResponseType::SuccessPartial,
            4 => ResponseType::WaitComplete,
            5 => ResponseType::ServerInfo,
            16 => ResponseType::ClientError,
            17 => ResponseType::CompileError,
            18 => ResponseType::RuntimeError,
            other => {
                return Err(Error::protocol(format!(
                    "unknown response type {}",
                    other
                )))
            }
        })
    }
}

/// A note attached to a response, most importantly the feed markers that
/// identify a changefeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseNote {
    SequenceFeed,
    AtomFeed,
    OrderByLimitFeed,
    UnionedFeed,
    IncludesStates,
    Unknown(i64),
}

impl ResponseNote {
    fn from_wire(n: i64) -> Self {
        match n {
            1 => ResponseNote::SequenceFeed,
            2 => ResponseNote::AtomFeed,
            3 => ResponseNote::OrderByLimitFeed,
            4 => ResponseNote::UnionedFeed,
            5 => ResponseNote::IncludesStates,
            other => ResponseNote::Unknown(other),
        }
    }

    /// Whether this note marks the cursor it's attached to as a changefeed.
    ///
    /// spec.md §3: "a `Cursor` is a feed iff any note ends with `_FEED`".
    pub fn is_feed(&self) -> bool {
        matches!(
            self,
            ResponseNote::SequenceFeed
                | ResponseNote::AtomFeed
                | ResponseNote::OrderByLimitFeed
                | ResponseNote::UnionedFeed
        )
    }
}

#[derive(Deserialize)]
struct RawResponse {
    t: i64,
    #[serde(default)]
    r: Vec<Value>,
    #[serde(default)]
    n: Vec<i64>,
    p: Option<Value>,
    b: Option<Value>,
    e: Option<i64>,
}

/// A parsed, not-yet-classified response frame.
#[derive(Debug)]
pub struct Response {
    pub kind: ResponseType,
    pub result: Vec<Value>,
    pub notes: Vec<ResponseNote>,
    pub profile: Option<Value>,
    pub backtrace: Option<Value>,
    pub error_type: Option<i64>,
}

impl Response {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let raw: RawResponse = serde_json::from_slice(payload)?;
        Ok(Response {
            kind: ResponseType::from_wire(raw.t)?,
            result: raw.r,
            notes: raw.n.into_iter().map(ResponseNote::from_wire).collect(),
            profile: raw.p,
            backtrace: raw.b,
            error_type: raw.e,
        })
    }

    /// Whether this response (so far) marks its cursor as a server-pushed
    /// feed.
    pub fn is_feed(&self) -> bool {
        self.notes.iter().any(ResponseNote::is_feed)
    }

    fn error_message(&self) -> String {
        self.result
            .first()
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| "unknown server error".to_string())
    }

    /// Converts a server error response into the matching typed [`Error`].
    ///
    /// Only valid to call when `kind` is one of the three error variants;
    /// callers should match on `kind` via [`Response::classify`] instead of
    /// calling this directly.
    pub fn into_error(self) -> Error {
        let message = self.error_message();
        match self.kind {
            ResponseType::ClientError => Error::new(ErrorKind::Client {
                message,
                backtrace: self.backtrace,
            }),
            ResponseType::CompileError => Error::new(ErrorKind::Compile {
                message,
                backtrace: self.backtrace,
            }),
            ResponseType::RuntimeError => Error::new(ErrorKind::Runtime(RuntimeErrorKind {
                error_type: RuntimeErrorType::from_wire(self.error_type.unwrap_or(1_000_000)),
                message,
                backtrace: self.backtrace,
            })),
            other => Error::internal(format!("into_error called on non-error response {:?}", other)),
        }
    }

    /// Whether this response's `kind` is one of the three server-error
    /// variants.
    pub fn is_error(&self) -> bool {
        matches!(
            self.kind,
            ResponseType::ClientError | ResponseType::CompileError | ResponseType::RuntimeError
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// spec.md §8 scenario S4.
    #[test]
    fn atom_response_yields_single_result() {
        let resp = Response::parse(br#"{"t":1,"r":[42]}"#).unwrap();
        assert_eq!(resp.kind, ResponseType::SuccessAtom);
        assert_eq!(resp.result, vec![Value::from(42)]);
    }

    /// spec.md §8 scenario S5.
    #[test]
    fn partial_then_sequence_concatenate_in_order() {
        let partial = Response::parse(br#"{"t":3,"r":[1,2]}"#).unwrap();
        let sequence = Response::parse(br#"{"t":2,"r":[3]}"#).unwrap();

        let mut collected: Vec<Value> = partial.result.clone();
        collected.extend(sequence.result.clone());
        assert_eq!(collected, vec![Value::from(1), Value::from(2), Value::from(3)]);
        assert_eq!(sequence.kind, ResponseType::SuccessSequence);
    }

    /// spec.md §8 scenario S6.
    #[test]
    fn partial_with_feed_note_is_detected() {
        let resp = Response::parse(br#"{"t":3,"r":[{"x":1}],"n":[1]}"#).unwrap();
        assert!(resp.is_feed());
    }

    #[test]
    fn runtime_error_classifies_subtype() {
        let resp = Response::parse(br#"{"t":18,"r":["boom"],"e":3000000}"#).unwrap();
        let err = resp.into_error();
        match err.kind() {
            ErrorKind::Runtime(rk) => {
                assert_eq!(rk.error_type, RuntimeErrorType::QueryLogic);
                assert_eq!(rk.message, "boom");
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }
}
