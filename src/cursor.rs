//! Lazy, possibly-infinite sequence of decoded rows delivered via
//! `SUCCESS_PARTIAL`/`SUCCESS_SEQUENCE` responses, with `CONTINUE`
//! pipelining, feed detection, and best-effort cleanup on drop.
//!
//! Grounded on the teacher's `cursor::common::GenericCursor` (a buffer plus
//! an "exhausted" flag plus an in-flight get-more future, driven by a
//! `GetMoreProvider`) adapted from MongoDB's `getMore` command to ReQL's
//! `CONTINUE` query, and on `cursor.rs`'s `Drop` impl, which fires a
//! best-effort `killCursors` on a background task rather than blocking the
//! caller dropping the handle.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use futures_core::Stream;
use futures_util::stream;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    codec::{self, Codec},
    conn::WeakConnection,
    error::{Error, Result},
    proto::response::{Response, ResponseType},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Exhausted,
    Closed,
}

/// A lazy iterator over the rows of a query whose first response carried
/// more rows than fit in one frame (`SUCCESS_PARTIAL`), or that is a
/// server-pushed changefeed.
///
/// spec.md §3: at most one `CONTINUE` is ever in flight per cursor; once
/// `Exhausted` the buffer may still drain but no further `CONTINUE` is
/// sent; a `Closed` cursor drops its buffered rows.
#[derive(Debug)]
pub struct Cursor {
    conn: WeakConnection,
    codec: Arc<dyn Codec>,
    token: u64,
    receiver: mpsc::UnboundedReceiver<Result<Response>>,
    buffer: VecDeque<Value>,
    last_batch_len: usize,
    is_feed: bool,
    phase: Phase,
    outstanding_continue: bool,
    error: Option<Error>,
}

impl Cursor {
    pub(crate) fn new(
        conn: WeakConnection,
        codec: Arc<dyn Codec>,
        token: u64,
        first: Response,
        receiver: mpsc::UnboundedReceiver<Result<Response>>,
    ) -> Self {
        let mut cursor = Cursor {
            conn,
            codec,
            token,
            receiver,
            buffer: VecDeque::new(),
            last_batch_len: 0,
            is_feed: false,
            phase: Phase::Open,
            outstanding_continue: false,
            error: None,
        };
        cursor.apply(first);
        cursor
    }

    /// Whether the server has marked this cursor as a changefeed: a
    /// sequence that never naturally terminates until `close()`/`STOP`.
    pub fn is_feed(&self) -> bool {
        self.is_feed
    }

    /// Non-blocking check for rows already sitting in the local buffer.
    ///
    /// A `false` result does not mean the cursor is exhausted, only that
    /// nothing is buffered right now; a real "is there more" answer
    /// requires waiting on the network, which is what `next()` does.
    pub fn has_buffered(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Pulls the next decoded row, or `None` once the cursor is naturally
    /// exhausted. `timeout`, if given, bounds how long to wait for a row
    /// that isn't already buffered; expiry returns [`Error::timeout`] and
    /// leaves the cursor usable for a subsequent call.
    pub async fn next<T: DeserializeOwned>(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<T>> {
        match self.next_raw(timeout).await? {
            Some(raw) => Ok(Some(codec::decode(self.codec.as_ref(), raw)?)),
            None => Ok(None),
        }
    }

    /// Drains every remaining row into a `Vec`. Forbidden on changefeeds,
    /// which never naturally terminate.
    pub async fn to_list<T: DeserializeOwned>(&mut self) -> Result<Vec<T>> {
        if self.is_feed {
            return Err(Error::driver("cannot convert feed to list"));
        }
        let mut out = Vec::new();
        while let Some(row) = self.next::<T>(None).await? {
            out.push(row);
        }
        Ok(out)
    }

    /// Converts this cursor into a `futures::Stream` of decoded rows,
    /// ending the stream (rather than erroring) once the cursor closes
    /// cleanly.
    pub fn into_stream<T: DeserializeOwned>(self) -> impl Stream<Item = Result<T>> {
        stream::unfold(self, |mut cursor| async move {
            match cursor.next::<T>(None).await {
                Ok(Some(row)) => Some((Ok(row), cursor)),
                Ok(None) => None,
                Err(e) => Some((Err(e), cursor)),
            }
        })
    }

    /// Closes the cursor: drops any buffered rows and, best-effort, sends
    /// `STOP` for this token if the connection is still open. Safe to call
    /// more than once; only the first call sends anything.
    pub async fn close(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }
        self.phase = Phase::Closed;
        self.buffer.clear();
        self.conn.send_stop(self.token).await;
        self.conn.deregister(self.token);
    }

    async fn next_raw(&mut self, timeout: Option<Duration>) -> Result<Option<Value>> {
        loop {
            if let Some(row) = self.buffer.pop_front() {
                self.maybe_continue().await;
                return Ok(Some(row));
            }

            match self.phase {
                Phase::Closed => {
                    return match self.error.clone() {
                        Some(e) => Err(e),
                        None => Ok(None),
                    };
                }
                Phase::Exhausted => return Ok(None),
                Phase::Open => {}
            }

            self.maybe_continue().await;

            let recv = self.receiver.recv();
            let delivered = match timeout {
                Some(d) => tokio::time::timeout(d, recv)
                    .await
                    .map_err(|_| Error::timeout())?,
                None => recv.await,
            };

            match delivered {
                Some(Ok(resp)) => self.apply(resp),
                Some(Err(e)) => {
                    self.phase = Phase::Closed;
                    self.error = Some(e.clone());
                    return Err(e);
                }
                None => {
                    // The reader loop dropped our sender: the connection closed
                    // without delivering a terminal response for this token.
                    let e = Error::connection_closed(None);
                    self.phase = Phase::Closed;
                    self.error = Some(e.clone());
                    return Err(e);
                }
            }
        }
    }

    fn apply(&mut self, resp: Response) {
        if resp.is_error() {
            self.phase = Phase::Closed;
            self.error = Some(resp.into_error());
            return;
        }
        if resp.is_feed() {
            self.is_feed = true;
        }
        match resp.kind {
            ResponseType::SuccessPartial => {
                self.last_batch_len = resp.result.len();
                self.buffer.extend(resp.result);
                self.outstanding_continue = false;
            }
            // A point-changefeed's initial value arrives as SUCCESS_ATOM
            // tagged with an ATOM_FEED note; spec.md §4.7 returns a Cursor
            // for any first response carrying a `_FEED` note, not just
            // SUCCESS_PARTIAL, so it's buffered and kept Open exactly like
            // a partial batch rather than treated as a terminal atom.
            ResponseType::SuccessAtom if self.is_feed => {
                self.last_batch_len = resp.result.len();
                self.buffer.extend(resp.result);
                self.outstanding_continue = false;
            }
            ResponseType::SuccessSequence => {
                self.buffer.extend(resp.result);
                self.phase = Phase::Exhausted;
            }
            other => {
                self.phase = Phase::Closed;
                self.error = Some(Error::protocol(format!(
                    "unexpected response type {:?} delivered to cursor token {}",
                    other, self.token
                )));
            }
        }
    }

    /// spec.md §4.8: once the buffer falls below half of the last batch
    /// (and at least one row) and nothing is already in flight, pipeline
    /// the next `CONTINUE` ahead of the consumer draining the buffer.
    async fn maybe_continue(&mut self) {
        if self.phase != Phase::Open || self.outstanding_continue {
            return;
        }
        let threshold = self.last_batch_len.div_ceil(2).max(1);
        if self.buffer.len() >= threshold {
            return;
        }
        self.outstanding_continue = true;
        if let Err(e) = self.conn.send_continue(self.token).await {
            self.phase = Phase::Closed;
            self.error = Some(e);
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }
        let conn = self.conn.clone();
        let token = self.token;
        tokio::spawn(async move {
            conn.send_stop(token).await;
            conn.deregister(token);
        });
    }
}
