//! Query value objects: `{type, token, term?, globalOpts}`, serialized to
//! the `[type, term?, opts?]` JSON array the wire protocol expects.
//!
//! Grounded on the teacher's `cmap/conn/command.rs` value-object shape
//! (a plain struct carrying everything a single request needs, built once
//! and handed to the wire layer) generalized from MongoDB's BSON command
//! documents to ReQL's positional JSON array.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::{
    error::{Error, Result},
    proto::frame::Frame,
    term::Term,
};

/// The maximum nesting depth this driver will walk while converting a
/// `globalOpts` value tree. Exceeding it is a driver-side term
/// construction failure (spec.md §7's `ReqlDriverCompileError`), not a
/// server round trip.
const MAX_OPTS_DEPTH: usize = 64;

/// The five query message types defined by the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    Start = 1,
    Continue = 2,
    Stop = 3,
    NoReplyWait = 4,
    ServerInfo = 5,
}

/// A single outgoing query. Once [`Query::serialize`] has run, the query is
/// conceptually immutable — nothing else about it changes for the rest of
/// its token's lifetime.
#[derive(Debug)]
pub struct Query {
    pub kind: QueryType,
    pub token: u64,
    pub term: Option<Value>,
    pub global_opts: BTreeMap<String, Value>,
}

impl Query {
    pub fn start(token: u64, term: &dyn Term, global_opts: BTreeMap<String, Value>) -> Self {
        Self {
            kind: QueryType::Start,
            token,
            term: Some(term.build()),
            global_opts,
        }
    }

    pub fn continue_(token: u64) -> Self {
        Self {
            kind: QueryType::Continue,
            token,
            term: None,
            global_opts: BTreeMap::new(),
        }
    }

    pub fn stop(token: u64) -> Self {
        Self {
            kind: QueryType::Stop,
            token,
            term: None,
            global_opts: BTreeMap::new(),
        }
    }

    pub fn noreply_wait(token: u64) -> Self {
        Self {
            kind: QueryType::NoReplyWait,
            token,
            term: None,
            global_opts: BTreeMap::new(),
        }
    }

    pub fn server_info(token: u64) -> Self {
        Self {
            kind: QueryType::ServerInfo,
            token,
            term: None,
            global_opts: BTreeMap::new(),
        }
    }

    /// Serializes this query into a single framed wire message.
    pub fn serialize(&self) -> Result<Frame> {
        for value in self.global_opts.values() {
            check_depth(value, 0)?;
        }

        let mut array = vec![Value::from(self.kind as i64)];
        if let Some(term) = &self.term {
            array.push(term.clone());
            if !self.global_opts.is_empty() {
                array.push(Value::Object(
                    self.global_opts
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                ));
            }
        }

        let bytes = serde_json::to_vec(&Value::Array(array))?;
        Ok(Frame::new(self.token, bytes))
    }
}

fn check_depth(value: &Value, depth: usize) -> Result<()> {
    if depth > MAX_OPTS_DEPTH {
        return Err(Error::new(crate::error::ErrorKind::DriverCompile {
            message: format!("globalOpts nesting exceeds {} levels", MAX_OPTS_DEPTH),
        }));
    }
    match value {
        Value::Array(items) => {
            for item in items {
                check_depth(item, depth + 1)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                check_depth(item, depth + 1)?;
            }
        }
        _ => {}
    }
    Ok(())
}
