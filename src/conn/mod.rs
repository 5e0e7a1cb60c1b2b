//! Owns the socket for a single server connection: token allocation, the
//! demultiplexing table, the reader task, and writer discipline.
//!
//! Grounded on the teacher's `cmap::connection_requester` (an
//! `mpsc`-fed-by-`oneshot` request/response channel pair keeping a
//! background worker's state private) generalized from "one outstanding
//! request per checked-out connection" to "many outstanding tokens
//! multiplexed on one socket", and on `runtime::tls_rustls` for the TLS
//! upgrade path.

pub mod options;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use serde_json::Value;
use tokio::{
    io::{split, AsyncRead, AsyncWrite, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};

use crate::{
    codec::Codec,
    cursor::Cursor,
    error::{Error, Result},
    proto::{
        frame::Frame,
        query::Query,
        response::{Response, ResponseType},
    },
    term::Term,
};

pub use options::ConnectionOptions;

/// Upper bound on how long [`Connection::close`] waits for outstanding
/// cursors to acknowledge their `STOP` before force-failing them.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Poll interval used while waiting out [`CLOSE_DRAIN_TIMEOUT`].
const CLOSE_DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Any duplex byte stream a [`Connection`] can be built on: a bare TCP
/// socket, or a TLS-wrapped one.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// What [`Connection::run`] hands back once the first response for a query
/// arrives: either the query's only result, or a live cursor over the rest.
#[derive(Debug)]
pub enum RunOutcome {
    /// The query's sole result: `result[0]` for an atom, or the whole
    /// result array for a sequence returned in a single response.
    Value(Value),
    /// The query's first batch arrived as `SUCCESS_PARTIAL`, or carried a
    /// feed note; the rest streams through the returned cursor.
    Cursor(Cursor),
}

/// The first response for a token, as classified by the reader loop.
pub(crate) enum FirstResponse {
    /// A terminal response: the token is already fully resolved.
    Terminal(Response),
    /// The first of a run of responses; the receiver yields the rest.
    Cursor {
        first: Response,
        receiver: mpsc::UnboundedReceiver<Result<Response>>,
    },
}

enum Waiter {
    First(oneshot::Sender<Result<FirstResponse>>),
    Cursor(mpsc::UnboundedSender<Result<Response>>),
}

type Demux = Arc<Mutex<HashMap<u64, Waiter>>>;

struct Inner {
    writer: Mutex<WriteHalf<Box<dyn Stream>>>,
    demux: Demux,
    next_token: AtomicU64,
    max_frame_len: u32,
    codec: Arc<dyn Codec>,
    /// The `db` this connection was configured with; injected into a
    /// query's `global_opts` under `"db"` unless the caller already set one.
    db: Value,
    closed: AtomicBool,
    /// Guards `close()` itself against concurrent/repeated invocation,
    /// separately from `closed`: a caller requesting `wait_for_open` needs
    /// `noreply_wait` to still see the connection as open while it drains,
    /// so `closed` isn't set until after that wait completes.
    closing: AtomicBool,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

/// A single, authenticated connection to a server, driving the wire
/// protocol over one socket.
///
/// Cheap to clone: clones share the same underlying socket, demux table,
/// and reader task.
#[derive(Clone)]
pub struct Connection(Arc<Inner>);

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.0.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// A non-owning handle a [`Cursor`] uses to send CONTINUE/STOP and to
/// deregister itself, without keeping the connection alive.
#[derive(Clone, Debug)]
pub(crate) struct WeakConnection(Weak<Inner>);

impl Connection {
    /// Opens a TCP connection (optionally upgraded to TLS), runs the
    /// handshake, and starts the reader task.
    pub async fn connect(options: ConnectionOptions) -> Result<Connection> {
        let connect_fut = TcpStream::connect((options.host.as_str(), options.port));
        let tcp = match options.connect_timeout {
            Some(d) => tokio::time::timeout(d, connect_fut)
                .await
                .map_err(|_| Error::timeout())??,
            None => connect_fut.await?,
        };
        tcp.set_nodelay(true).ok();

        let stream: Box<dyn Stream> = match &options.tls {
            Some(tls_opts) => {
                #[cfg(feature = "rustls-tls")]
                {
                    Box::new(tls::upgrade(tcp, tls_opts, &options.host).await?)
                }
                #[cfg(not(feature = "rustls-tls"))]
                {
                    let _ = tls_opts;
                    return Err(Error::driver(
                        "TLS was requested but the `rustls-tls` feature is disabled",
                    ));
                }
            }
            None => Box::new(tcp),
        };

        Self::connect_with_stream(stream, &options).await
    }

    /// Runs the handshake and starts the reader task over an
    /// already-established stream. Exposed separately so tests can drive
    /// the handshake over a `tokio::io::duplex` mock.
    pub async fn connect_with_stream(
        mut stream: Box<dyn Stream>,
        options: &ConnectionOptions,
    ) -> Result<Connection> {
        crate::proto::handshake::perform(&mut stream, &options.user, &options.password).await?;

        let (reader, writer) = split(stream);
        let demux: Demux = Arc::new(Mutex::new(HashMap::new()));
        let inner = Arc::new(Inner {
            writer: Mutex::new(writer),
            demux: demux.clone(),
            next_token: AtomicU64::new(0),
            max_frame_len: options.max_frame_len,
            codec: options.codec.clone(),
            db: Value::String(options.db.clone()),
            closed: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            reader_task: Mutex::new(None),
        });

        let task = tokio::spawn(reader_loop(reader, demux, inner.max_frame_len, {
            let inner = Arc::downgrade(&inner);
            move || {
                if let Some(inner) = inner.upgrade() {
                    inner.closed.store(true, Ordering::Release);
                }
            }
        }));
        *inner.reader_task.lock().await = Some(task);

        Ok(Connection(inner))
    }

    /// A non-owning handle for a cursor to hold onto.
    pub(crate) fn downgrade(&self) -> WeakConnection {
        WeakConnection(Arc::downgrade(&self.0))
    }

    /// Runs `term` to completion, returning either its sole result or a
    /// cursor over a streamed one.
    pub async fn run(
        &self,
        term: &dyn Term,
        global_opts: std::collections::BTreeMap<String, Value>,
    ) -> Result<RunOutcome> {
        self.run_with_deadline(term, global_opts, None).await
    }

    /// As [`Connection::run`], but expiring with [`Error::timeout`] (and
    /// sending STOP) if no response arrives before `deadline`.
    pub async fn run_with_deadline(
        &self,
        term: &dyn Term,
        mut global_opts: std::collections::BTreeMap<String, Value>,
        deadline: Option<Duration>,
    ) -> Result<RunOutcome> {
        if self.0.closed.load(Ordering::Acquire) {
            return Err(Error::connection_closed(None));
        }
        global_opts
            .entry("db".to_string())
            .or_insert_with(|| self.0.db.clone());

        let token = self.0.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        // Registered before the frame hits the wire: a fast server reply
        // must never race the registration.
        self.0.demux.lock().await.insert(token, Waiter::First(tx));

        let frame = Query::start(token, term, global_opts).serialize()?;
        self.write_frame(frame).await?;

        let first = match deadline {
            Some(d) => match tokio::time::timeout(d, rx).await {
                Ok(result) => result,
                Err(_) => {
                    self.0.demux.lock().await.remove(&token);
                    let _ = self.write_frame(Query::stop(token).serialize()?).await;
                    return Err(Error::timeout());
                }
            },
            None => rx.await,
        }
        .map_err(|_| Error::connection_closed(None))??;

        match first {
            FirstResponse::Terminal(resp) if resp.is_error() => Err(resp.into_error()),
            FirstResponse::Terminal(resp) => Ok(RunOutcome::Value(terminal_value(resp))),
            FirstResponse::Cursor { first, receiver } => Ok(RunOutcome::Cursor(Cursor::new(
                self.downgrade(),
                self.0.codec.clone(),
                token,
                first,
                receiver,
            ))),
        }
    }

    /// Runs `term` with `noreply` set; no waiter is registered and no
    /// result is returned.
    pub async fn run_no_reply(
        &self,
        term: &dyn Term,
        mut global_opts: std::collections::BTreeMap<String, Value>,
    ) -> Result<()> {
        if self.0.closed.load(Ordering::Acquire) {
            return Err(Error::connection_closed(None));
        }
        global_opts.insert("noreply".to_string(), Value::Bool(true));
        global_opts
            .entry("db".to_string())
            .or_insert_with(|| self.0.db.clone());
        let token = self.0.next_token.fetch_add(1, Ordering::Relaxed);
        let frame = Query::start(token, term, global_opts).serialize()?;
        self.write_frame(frame).await
    }

    /// Completes once every `noreply` query issued before this call has
    /// been durably applied by the server.
    pub async fn noreply_wait(&self) -> Result<()> {
        let resp = self.simple_roundtrip(Query::noreply_wait).await?;
        match resp.kind {
            ResponseType::WaitComplete => Ok(()),
            _ => Err(Error::protocol("unexpected response to NOREPLY_WAIT")),
        }
    }

    /// Requests the server's version/build information.
    pub async fn server(&self) -> Result<Value> {
        let resp = self.simple_roundtrip(Query::server_info).await?;
        match resp.kind {
            ResponseType::ServerInfo => Ok(resp.result.into_iter().next().unwrap_or(Value::Null)),
            _ => Err(Error::protocol("unexpected response to SERVER_INFO")),
        }
    }

    async fn simple_roundtrip(&self, build: impl FnOnce(u64) -> Query) -> Result<Response> {
        if self.0.closed.load(Ordering::Acquire) {
            return Err(Error::connection_closed(None));
        }
        let token = self.0.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.0.demux.lock().await.insert(token, Waiter::First(tx));
        let frame = build(token).serialize()?;
        self.write_frame(frame).await?;

        match rx.await.map_err(|_| Error::connection_closed(None))?? {
            FirstResponse::Terminal(resp) if resp.is_error() => Err(resp.into_error()),
            FirstResponse::Terminal(resp) => Ok(resp),
            FirstResponse::Cursor { .. } => {
                Err(Error::protocol("unexpected cursor-shaped response"))
            }
        }
    }

    /// Transitions to closing: sends STOP for every outstanding cursor,
    /// optionally waits for prior `noreply` queries to land, then waits for
    /// the stopped cursors to acknowledge (or a bounded deadline to expire)
    /// before failing every remaining waiter with
    /// [`Error::connection_closed`] and tearing down the reader task. Safe
    /// to call more than once.
    pub async fn close(&self, wait_for_open: bool) -> Result<()> {
        if self.0.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if wait_for_open {
            // `closed` is still false here, so this actually round-trips
            // through the live connection instead of short-circuiting.
            let _ = self.noreply_wait().await;
        }
        self.0.closed.store(true, Ordering::Release);

        let cursor_tokens: Vec<u64> = {
            let table = self.0.demux.lock().await;
            table
                .iter()
                .filter_map(|(token, waiter)| matches!(waiter, Waiter::Cursor(_)).then_some(*token))
                .collect()
        };
        for &token in &cursor_tokens {
            let _ = self.write_frame(Query::stop(token).serialize()?).await;
        }

        // Give the reader loop a bounded window to deliver each cursor's
        // terminal STOP acknowledgement (which removes it from `demux`)
        // before falling back to force-failing whatever's left. spec.md
        // §4.7: "waits for drain or a deadline".
        let deadline = tokio::time::Instant::now() + CLOSE_DRAIN_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            let still_pending = {
                let table = self.0.demux.lock().await;
                cursor_tokens.iter().any(|t| table.contains_key(t))
            };
            if !still_pending {
                break;
            }
            tokio::time::sleep(CLOSE_DRAIN_POLL_INTERVAL).await;
        }

        let mut table = self.0.demux.lock().await;
        for (_, waiter) in table.drain() {
            let err = Error::connection_closed(None);
            match waiter {
                Waiter::First(tx) => {
                    let _ = tx.send(Err(err));
                }
                Waiter::Cursor(tx) => {
                    let _ = tx.send(Err(err));
                }
            }
        }
        drop(table);

        if let Some(handle) = self.0.reader_task.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }

    async fn write_frame(&self, frame: Frame) -> Result<()> {
        let mut writer = self.0.writer.lock().await;
        frame.write_to(&mut *writer).await
    }
}

impl WeakConnection {
    pub(crate) async fn send_stop(&self, token: u64) {
        if let Some(inner) = self.0.upgrade() {
            let conn = Connection(inner);
            let _ = conn.write_frame(Query::stop(token).serialize().expect("STOP always serializes"))
                .await;
        }
    }

    pub(crate) async fn send_continue(&self, token: u64) -> Result<()> {
        let inner = self
            .0
            .upgrade()
            .ok_or_else(|| Error::connection_closed(None))?;
        Connection(inner)
            .write_frame(Query::continue_(token).serialize()?)
            .await
    }

    pub(crate) fn deregister(&self, token: u64) {
        if let Some(inner) = self.0.upgrade() {
            tokio::spawn(async move {
                inner.demux.lock().await.remove(&token);
            });
        }
    }
}

fn terminal_value(resp: Response) -> Value {
    match resp.kind {
        ResponseType::SuccessAtom => resp.result.into_iter().next().unwrap_or(Value::Null),
        _ => Value::Array(resp.result),
    }
}

async fn reader_loop(
    mut reader: ReadHalf<Box<dyn Stream>>,
    demux: Demux,
    max_frame_len: u32,
    on_closed: impl FnOnce(),
) {
    loop {
        let frame = match Frame::read_from(&mut reader, max_frame_len).await {
            Ok(frame) => frame,
            Err(cause) => {
                tracing::debug!(error = %cause, "connection reader loop ending");
                fail_all(&demux, cause).await;
                break;
            }
        };

        let token = frame.token;
        let parsed = Response::parse(&frame.payload);

        let mut table = demux.lock().await;
        match table.remove(&token) {
            None => {
                tracing::warn!(token, "dropping response for unknown token");
            }
            Some(Waiter::First(tx)) => match parsed {
                Err(e) => {
                    let _ = tx.send(Err(e));
                }
                Ok(resp) => {
                    if !resp.is_error()
                        && (resp.kind == ResponseType::SuccessPartial || resp.is_feed())
                    {
                        let (ctx, crx) = mpsc::unbounded_channel();
                        table.insert(token, Waiter::Cursor(ctx));
                        let _ = tx.send(Ok(FirstResponse::Cursor { first: resp, receiver: crx }));
                    } else {
                        let _ = tx.send(Ok(FirstResponse::Terminal(resp)));
                    }
                }
            },
            Some(Waiter::Cursor(ctx)) => match parsed {
                Err(e) => {
                    let _ = ctx.send(Err(e));
                }
                Ok(resp) => {
                    let terminal = resp.is_error() || resp.kind == ResponseType::SuccessSequence;
                    if !terminal {
                        table.insert(token, Waiter::Cursor(ctx.clone()));
                    }
                    let _ = ctx.send(Ok(resp));
                }
            },
        }
    }

    on_closed();
}

async fn fail_all(demux: &Demux, cause: Error) {
    let mut table = demux.lock().await;
    for (_, waiter) in table.drain() {
        let err = Error::connection_closed(Some(cause.clone()));
        match waiter {
            Waiter::First(tx) => {
                let _ = tx.send(Err(err));
            }
            Waiter::Cursor(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

#[cfg(feature = "rustls-tls")]
mod tls {
    use std::sync::Arc;

    use rustls::{ClientConfig, RootCertStore};
    use tokio::net::TcpStream;
    use tokio_rustls::{client::TlsStream, TlsConnector};

    use crate::{conn::options::TlsOptions, error::Error, error::Result};

    pub(super) async fn upgrade(
        tcp: TcpStream,
        opts: &TlsOptions,
        host: &str,
    ) -> Result<TlsStream<TcpStream>> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let connector = TlsConnector::from(Arc::new(config));
        let server_name = opts.server_name.clone().unwrap_or_else(|| host.to_string());
        let server_name: rustls::pki_types::ServerName<'static> =
            server_name.clone().try_into().map_err(|e| {
                Error::driver(format!("invalid TLS server name {:?}: {}", server_name, e))
            })?;

        connector.connect(server_name, tcp).await.map_err(Error::from)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::term::RawTerm;
    use std::collections::BTreeMap;

    async fn connected_pair() -> (Connection, tokio::io::DuplexStream) {
        let (client_stream, mut server_stream) = tokio::io::duplex(8192);

        let server_task = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut magic = [0u8; 4];
            server_stream.read_exact(&mut magic).await.unwrap();

            async fn read_until_nul<S: tokio::io::AsyncRead + Unpin>(s: &mut S) -> Vec<u8> {
                use tokio::io::AsyncReadExt;
                let mut buf = Vec::new();
                loop {
                    let b = s.read_u8().await.unwrap();
                    if b == 0 {
                        break;
                    }
                    buf.push(b);
                }
                buf
            }
            let _first = read_until_nul(&mut server_stream).await;

            let salt = crate::crypto::base64_decode("W22ZaJ0SNY7soEsUEjb6gQ==").unwrap();
            let first_json: serde_json::Value =
                serde_json::from_slice(&_first).unwrap();
            let auth = first_json["authentication"].as_str().unwrap();
            let bare = auth.splitn(3, ',').nth(2).unwrap();
            let client_attrs = crate::proto::scram_attrs::ScramAttributes::parse(bare).unwrap();
            let client_nonce = client_attrs.nonce().unwrap().to_string();
            let full_nonce = format!("{}serverpart", client_nonce);
            let server_first_raw = format!(
                "r={},s={},i=4096",
                full_nonce,
                crate::crypto::base64_encode(&salt)
            );
            let reply = serde_json::json!({"success": true, "authentication": server_first_raw});
            server_stream
                .write_all(&serde_json::to_vec(&reply).unwrap())
                .await
                .unwrap();
            server_stream.write_u8(0).await.unwrap();

            let _final = read_until_nul(&mut server_stream).await;
            let final_json: serde_json::Value = serde_json::from_slice(&_final).unwrap();
            let final_attrs = crate::proto::scram_attrs::ScramAttributes::parse(
                final_json["authentication"].as_str().unwrap(),
            )
            .unwrap();
            let proof = final_attrs.proof().unwrap();

            let salted_password = crate::crypto::pbkdf2_sha256(b"pencil", &salt, 4096);
            let client_key = crate::crypto::hmac_sha256(&salted_password, b"Client Key");
            let stored_key = crate::crypto::sha256(&client_key);
            let without_proof = crate::proto::scram_attrs::ScramAttributes::client_final_without_proof(
                "n,,",
                &full_nonce,
            );
            let client_first_bare = format!("n=user,r={}", client_nonce);
            let auth_message = format!(
                "{},{},{}",
                client_first_bare,
                server_first_raw,
                without_proof.to_string()
            );
            let expected = crate::crypto::hmac_sha256(&stored_key, auth_message.as_bytes());
            let expected_proof = crate::crypto::xor(&client_key, &expected);
            assert_eq!(expected_proof, proof);

            let server_key = crate::crypto::hmac_sha256(&salted_password, b"Server Key");
            let server_sig = crate::crypto::hmac_sha256(&server_key, auth_message.as_bytes());
            let final_reply = serde_json::json!({
                "success": true,
                "authentication": format!("v={}", crate::crypto::base64_encode(&server_sig)),
            });
            server_stream
                .write_all(&serde_json::to_vec(&final_reply).unwrap())
                .await
                .unwrap();
            server_stream.write_u8(0).await.unwrap();

            server_stream
        });

        let options = ConnectionOptions::builder().user("user").password("pencil").build();
        let conn = Connection::connect_with_stream(Box::new(client_stream), &options)
            .await
            .unwrap();
        let server_stream = server_task.await.unwrap();
        (conn, server_stream)
    }

    #[tokio::test]
    async fn atom_response_completes_run() {
        let (conn, mut server_stream) = connected_pair().await;

        let responder = tokio::spawn(async move {
            let frame = Frame::read_from(&mut server_stream, u32::MAX).await.unwrap();
            let reply = Frame::new(frame.token, br#"{"t":1,"r":[42]}"#.to_vec());
            reply.write_to(&mut server_stream).await.unwrap();
            server_stream
        });

        let term = RawTerm::new(serde_json::json!([1]));
        let outcome = conn.run(&term, BTreeMap::new()).await.unwrap();
        match outcome {
            RunOutcome::Value(v) => assert_eq!(v, serde_json::json!(42)),
            RunOutcome::Cursor(_) => panic!("expected a value, not a cursor"),
        }
        responder.await.unwrap();
    }

    /// spec.md §6: `db` is a recognized per-connection default; `run` must
    /// inject it into `global_opts` (unless the caller already set one)
    /// rather than leaving it unconsulted.
    #[tokio::test]
    async fn run_injects_configured_db_into_global_opts() {
        let (conn, mut server_stream) = connected_pair().await;

        let responder = tokio::spawn(async move {
            let frame = Frame::read_from(&mut server_stream, u32::MAX).await.unwrap();
            let sent: Value = serde_json::from_slice(&frame.payload).unwrap();
            assert_eq!(sent, serde_json::json!([1, [1], {"db": "test"}]));
            Frame::new(frame.token, br#"{"t":1,"r":[1]}"#.to_vec())
                .write_to(&mut server_stream)
                .await
                .unwrap();
            server_stream
        });

        let term = RawTerm::new(serde_json::json!([1]));
        conn.run(&term, BTreeMap::new()).await.unwrap();
        responder.await.unwrap();
    }

    /// A caller-supplied `db` in `global_opts` takes precedence over the
    /// connection's configured default.
    #[tokio::test]
    async fn run_does_not_override_caller_supplied_db() {
        let (conn, mut server_stream) = connected_pair().await;

        let responder = tokio::spawn(async move {
            let frame = Frame::read_from(&mut server_stream, u32::MAX).await.unwrap();
            let sent: Value = serde_json::from_slice(&frame.payload).unwrap();
            assert_eq!(sent, serde_json::json!([1, [1], {"db": "other"}]));
            Frame::new(frame.token, br#"{"t":1,"r":[1]}"#.to_vec())
                .write_to(&mut server_stream)
                .await
                .unwrap();
            server_stream
        });

        let term = RawTerm::new(serde_json::json!([1]));
        let mut opts = BTreeMap::new();
        opts.insert("db".to_string(), Value::String("other".to_string()));
        conn.run(&term, opts).await.unwrap();
        responder.await.unwrap();
    }

    /// `run_no_reply` injects the configured `db` the same way `run` does.
    #[tokio::test]
    async fn run_no_reply_injects_configured_db() {
        let (conn, mut server_stream) = connected_pair().await;

        let responder = tokio::spawn(async move {
            let frame = Frame::read_from(&mut server_stream, u32::MAX).await.unwrap();
            let sent: Value = serde_json::from_slice(&frame.payload).unwrap();
            assert_eq!(
                sent,
                serde_json::json!([1, [1], {"db": "test", "noreply": true}])
            );
            server_stream
        });

        let term = RawTerm::new(serde_json::json!([1]));
        conn.run_no_reply(&term, BTreeMap::new()).await.unwrap();
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_token_is_dropped_without_panicking() {
        let (conn, mut server_stream) = connected_pair().await;

        let responder = tokio::spawn(async move {
            // Response for a token nobody registered.
            let stray = Frame::new(999, br#"{"t":4,"r":[]}"#.to_vec());
            stray.write_to(&mut server_stream).await.unwrap();

            let frame = Frame::read_from(&mut server_stream, u32::MAX).await.unwrap();
            let reply = Frame::new(frame.token, br#"{"t":1,"r":["ok"]}"#.to_vec());
            reply.write_to(&mut server_stream).await.unwrap();
            server_stream
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let term = RawTerm::new(serde_json::json!([1]));
        let outcome = conn.run(&term, BTreeMap::new()).await.unwrap();
        match outcome {
            RunOutcome::Value(v) => assert_eq!(v, serde_json::json!("ok")),
            RunOutcome::Cursor(_) => panic!("expected a value, not a cursor"),
        }
        responder.await.unwrap();
    }

    /// `close(wait_for_open: true)` must actually round-trip a
    /// NOREPLY_WAIT before tearing the connection down, not short-circuit
    /// because it already marked itself closed.
    #[tokio::test]
    async fn close_with_wait_for_open_round_trips_noreply_wait() {
        let (conn, mut server_stream) = connected_pair().await;

        let responder = tokio::spawn(async move {
            let frame = Frame::read_from(&mut server_stream, u32::MAX).await.unwrap();
            assert_eq!(frame.payload, b"[4]".to_vec(), "expected a NOREPLY_WAIT query");
            Frame::new(frame.token, br#"{"t":4,"r":[]}"#.to_vec())
                .write_to(&mut server_stream)
                .await
                .unwrap();
            server_stream
        });

        conn.close(true).await.unwrap();
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_subsequent_queries() {
        let (conn, _server_stream) = connected_pair().await;

        conn.close(false).await.unwrap();
        conn.close(false).await.unwrap();

        let term = RawTerm::new(serde_json::json!([1]));
        let err = conn.run(&term, BTreeMap::new()).await.unwrap_err();
        assert!(err.is_connection_closed());
    }

    /// `close` sends `STOP` for an outstanding cursor and, once the reader
    /// loop delivers its terminal acknowledgement, returns without waiting
    /// out the full drain deadline.
    #[tokio::test]
    async fn close_sends_stop_and_drains_outstanding_cursor() {
        let (conn, mut server_stream) = connected_pair().await;

        let responder = tokio::spawn(async move {
            let frame = Frame::read_from(&mut server_stream, u32::MAX).await.unwrap();
            let token = frame.token;
            Frame::new(token, br#"{"t":3,"r":[1]}"#.to_vec())
                .write_to(&mut server_stream)
                .await
                .unwrap();

            let stop = Frame::read_from(&mut server_stream, u32::MAX).await.unwrap();
            assert_eq!(stop.token, token);
            assert_eq!(stop.payload, b"[3]".to_vec());
            Frame::new(token, br#"{"t":2,"r":[]}"#.to_vec())
                .write_to(&mut server_stream)
                .await
                .unwrap();
            server_stream
        });

        let term = RawTerm::new(serde_json::json!([1]));
        let outcome = conn.run(&term, BTreeMap::new()).await.unwrap();
        let _cursor = match outcome {
            RunOutcome::Cursor(c) => c,
            RunOutcome::Value(_) => panic!("expected a cursor"),
        };

        let start = std::time::Instant::now();
        conn.close(false).await.unwrap();
        assert!(
            start.elapsed() < CLOSE_DRAIN_TIMEOUT,
            "close should return as soon as the cursor's STOP is acknowledged, not wait out the full deadline"
        );

        responder.await.unwrap();
    }
}
