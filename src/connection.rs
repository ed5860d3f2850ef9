//! Per-connection dispatch.
//!
//! A connection owns one framed byte stream shared by every in-flight
//! request. Reads go through a shared framed reader so the sequential
//! input buffer can interleave its pulls with the dispatcher; writes go
//! through a mutex-guarded framed writer so records from concurrent
//! requests never interleave mid-record.
//!
//! Two dispatcher implementations share this plumbing: the sequential one
//! runs requests back to back on the dispatcher task, the multiplexed one
//! routes records to per-request agent tasks by request id.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::{Record, RecordCodec};
use crate::error::Result;
use crate::handler::Handler;
use crate::request::Request;
use crate::response::Response;
use crate::s11n::{self, BeginRequestBody, ProtocolStatus, RecordType, Role, MAX_CONTENT_LEN};
use crate::server::ServerConfig;
use crate::stdin::{RecordSource, Stdin};

pub(crate) type BoxRead = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxWrite = Box<dyn AsyncWrite + Send + Unpin>;
pub(crate) type SharedReader = Arc<Mutex<FramedRead<BoxRead, RecordCodec>>>;

/// Size of a multiplexed request agent's inbox. Bounded so a server that
/// floods one request id cannot grow memory without limit; the dispatcher
/// blocks on a full inbox rather than drop a record for a known id.
const AGENT_INBOX: usize = 16;

/// The write side of a connection, shared by the dispatcher and every
/// response handle on it.
pub(crate) struct Conn {
    writer: Mutex<FramedWrite<BoxWrite, RecordCodec>>,
    closed: AtomicBool,
}

impl Conn {
    pub(crate) fn new(write: BoxWrite) -> Conn {
        Conn {
            writer: Mutex::new(FramedWrite::new(write, RecordCodec)),
            closed: AtomicBool::new(false),
        }
    }

    /// True once we initiated shutdown.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) async fn send_record(&self, record: Record) -> Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed").into());
        }
        let mut writer = self.writer.lock().await;
        writer.send(record).await
    }

    /// Fragments a body buffer into `Stdout` records of at most 65535
    /// bytes each, preserving byte order. Empty input emits nothing: end
    /// of stream is signalled by `EndRequest`, not an empty record.
    pub(crate) async fn send_buffer(&self, request_id: u16, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed").into());
        }
        let mut writer = self.writer.lock().await;
        for chunk in bytes.chunks(MAX_CONTENT_LEN) {
            writer
                .feed(Record::stdout(request_id, Bytes::copy_from_slice(chunk)))
                .await?;
        }
        writer.flush().await?;
        Ok(())
    }

    /// Flushes and shuts the stream down for send. Idempotent.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.close().await {
            debug!("error shutting down connection: {}", e);
        }
    }
}

async fn recv(reader: &SharedReader) -> Option<Result<Record>> {
    reader.lock().await.next().await
}

/// Drives one connection to completion over any bidirectional byte
/// stream, choosing the dispatcher the configuration asks for.
pub(crate) async fn run<S>(
    stream: S,
    config: Arc<ServerConfig>,
    handler: Arc<dyn Handler>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let reader: SharedReader = Arc::new(Mutex::new(FramedRead::new(
        Box::new(read_half) as BoxRead,
        RecordCodec,
    )));
    let conn = Arc::new(Conn::new(Box::new(write_half)));
    if config.multiplexing() {
        run_multiplexed(reader, conn, config, handler).await
    } else {
        run_sequential(reader, conn, config, handler).await
    }
}

/// Answers a `GetValues` management record with the configured values for
/// the queried well-known names; unknown names are omitted.
async fn answer_get_values(conn: &Conn, config: &ServerConfig, record: &Record) -> Result<()> {
    let mut values: Vec<(String, String)> = Vec::new();
    for (name, _) in s11n::decode_nv_pairs(&record.content) {
        let name = String::from_utf8_lossy(&name).into_owned();
        let value = match name.as_str() {
            s11n::FCGI_MAX_CONNS => &config.fcgi_max_conns,
            s11n::FCGI_MAX_REQS => &config.fcgi_max_reqs,
            s11n::FCGI_MPXS_CONNS => &config.fcgi_mpxs_conns,
            _ => {
                debug!("GetValues: omitting unknown name {:?}", name);
                continue;
            }
        };
        values.push((name, value.clone()));
    }
    let content = s11n::encode_nv_pairs(values.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())));
    conn.send_record(Record::get_values_result(content)).await
}

/// Builds the request/response pair, invokes the handler, and finalizes
/// the response. Returns an error only when the failure should terminate
/// the connection.
async fn dispatch_request(
    id: u16,
    params: Bytes,
    source: RecordSource,
    conn: &Arc<Conn>,
    config: &Arc<ServerConfig>,
    handler: &Arc<dyn Handler>,
) -> Result<()> {
    let (response, output) = Response::new(conn.clone(), config.clone(), id);
    let stdin = Stdin::new(id, source, output.clone());
    let request = Request::new(id, params, stdin, output, config);
    let finalizer = response.handle();

    debug!("request {}: invoking handler", id);
    if let Err(e) = handler.call(request, response).await {
        if !config.catch_handler_exceptions {
            return Err(e);
        }
        config.log_error(&format!("request {}: handler failed: {}", id, e));
    }

    if !finalizer.closed() {
        finalizer.send_headers().await?;
        finalizer.close().await?;
    }
    debug!("request {}: complete", id);
    Ok(())
}

enum SequentialState {
    Idle,
    AwaitParams {
        id: u16,
        keep_connection: bool,
        params: BytesMut,
    },
}

pub(crate) async fn run_sequential(
    reader: SharedReader,
    conn: Arc<Conn>,
    config: Arc<ServerConfig>,
    handler: Arc<dyn Handler>,
) -> Result<()> {
    let mut state = SequentialState::Idle;
    loop {
        let record = match recv(&reader).await {
            None => {
                if !conn.is_closed() {
                    config.log_trace("peer closed the connection");
                    conn.close().await;
                }
                return Ok(());
            }
            Some(Err(e)) => {
                config.log_error(&format!("connection terminated: {}", e));
                conn.close().await;
                return Err(e);
            }
            Some(Ok(record)) => record,
        };

        match record.record_type {
            RecordType::GetValues if record.is_management() => {
                answer_get_values(&conn, &config, &record).await?;
            }
            RecordType::Other(code) => {
                conn.send_record(Record::unknown_type(code)).await?;
            }
            RecordType::BeginRequest => {
                let body = match BeginRequestBody::decode(&record.content) {
                    Some(body) => body,
                    None => {
                        warn!("dropping malformed BeginRequest record");
                        continue;
                    }
                };
                if let SequentialState::AwaitParams { .. } = state {
                    conn.send_record(Record::end_request(
                        record.request_id,
                        0,
                        ProtocolStatus::CantMultiplexConnections,
                    ))
                    .await?;
                    continue;
                }
                if body.role != Some(Role::Responder) {
                    warn!("rejecting request with role {}", body.raw_role);
                    conn.send_record(Record::end_request(
                        record.request_id,
                        0,
                        ProtocolStatus::UnknownRole,
                    ))
                    .await?;
                    continue;
                }
                state = SequentialState::AwaitParams {
                    id: record.request_id,
                    keep_connection: body.keep_connection,
                    params: BytesMut::new(),
                };
            }
            RecordType::Params => {
                let complete = match &mut state {
                    SequentialState::AwaitParams {
                        id,
                        keep_connection,
                        params,
                    } if *id == record.request_id => {
                        if record.content.is_empty() {
                            Some((*id, *keep_connection, std::mem::take(params).freeze()))
                        } else {
                            params.extend_from_slice(&record.content);
                            None
                        }
                    }
                    _ => {
                        warn!(
                            "dropping Params record outside a request (id {})",
                            record.request_id
                        );
                        None
                    }
                };
                if let Some((id, keep_connection, params)) = complete {
                    state = SequentialState::Idle;
                    if let Err(e) = dispatch_request(
                        id,
                        params,
                        RecordSource::Stream(reader.clone()),
                        &conn,
                        &config,
                        &handler,
                    )
                    .await
                    {
                        conn.close().await;
                        return Err(e);
                    }
                    if !keep_connection {
                        conn.close().await;
                        return Ok(());
                    }
                }
            }
            RecordType::AbortRequest => {
                let active = matches!(
                    &state,
                    SequentialState::AwaitParams { id, .. } if *id == record.request_id
                );
                if active {
                    debug!("request {}: aborted before dispatch", record.request_id);
                    conn.send_record(Record::end_request(
                        record.request_id,
                        0,
                        ProtocolStatus::RequestComplete,
                    ))
                    .await?;
                    state = SequentialState::Idle;
                } else {
                    warn!(
                        "dropping AbortRequest for unknown request id {}",
                        record.request_id
                    );
                }
            }
            other => {
                warn!(
                    "dropping unexpected {:?} record (request id {})",
                    other, record.request_id
                );
            }
        }
    }
}

struct AgentDone {
    id: u16,
    keep_connection: bool,
    fatal: bool,
}

pub(crate) async fn run_multiplexed(
    reader: SharedReader,
    conn: Arc<Conn>,
    config: Arc<ServerConfig>,
    handler: Arc<dyn Handler>,
) -> Result<()> {
    let mut agents: HashMap<u16, mpsc::Sender<Record>> = HashMap::new();
    let mut tasks = JoinSet::new();
    let (done_tx, mut done_rx) = mpsc::channel::<AgentDone>(8);

    let result = loop {
        tokio::select! {
            record = recv(&reader) => match record {
                None => {
                    if !conn.is_closed() {
                        config.log_trace("peer closed the connection");
                    }
                    break Ok(());
                }
                Some(Err(e)) => {
                    config.log_error(&format!("connection terminated: {}", e));
                    break Err(e);
                }
                Some(Ok(record)) => match record.record_type {
                    RecordType::GetValues if record.is_management() => {
                        if let Err(e) = answer_get_values(&conn, &config, &record).await {
                            config.log_error(&format!("connection terminated: {}", e));
                            break Err(e);
                        }
                    }
                    RecordType::Other(code) => {
                        if let Err(e) = conn.send_record(Record::unknown_type(code)).await {
                            config.log_error(&format!("connection terminated: {}", e));
                            break Err(e);
                        }
                    }
                    RecordType::BeginRequest => {
                        let body = match BeginRequestBody::decode(&record.content) {
                            Some(body) => body,
                            None => {
                                warn!("dropping malformed BeginRequest record");
                                continue;
                            }
                        };
                        if agents.contains_key(&record.request_id) {
                            warn!(
                                "dropping BeginRequest for already-active id {}",
                                record.request_id
                            );
                            continue;
                        }
                        if body.role != Some(Role::Responder) {
                            warn!("rejecting request with role {}", body.raw_role);
                            if let Err(e) = conn.send_record(Record::end_request(
                                record.request_id,
                                0,
                                ProtocolStatus::UnknownRole,
                            ))
                            .await
                            {
                                config.log_error(&format!("connection terminated: {}", e));
                                break Err(e);
                            }
                            continue;
                        }
                        let (tx, rx) = mpsc::channel(AGENT_INBOX);
                        agents.insert(record.request_id, tx);
                        tasks.spawn(run_agent(
                            record.request_id,
                            body.keep_connection,
                            rx,
                            conn.clone(),
                            config.clone(),
                            handler.clone(),
                            done_tx.clone(),
                        ));
                    }
                    RecordType::Params | RecordType::Stdin | RecordType::AbortRequest => {
                        match agents.get(&record.request_id) {
                            Some(tx) => {
                                // The agent is the sole consumer; a full
                                // inbox applies backpressure here rather
                                // than dropping a record for a known id.
                                if tx.send(record).await.is_err() {
                                    debug!("agent inbox gone; record dropped");
                                }
                            }
                            None => warn!(
                                "dropping record for unknown request id {}",
                                record.request_id
                            ),
                        }
                    }
                    other => {
                        warn!(
                            "dropping unexpected {:?} record (request id {})",
                            other, record.request_id
                        );
                    }
                },
            },
            Some(done) = done_rx.recv() => {
                agents.remove(&done.id);
                if done.fatal || !done.keep_connection {
                    conn.close().await;
                    break Ok(());
                }
            }
        }
    };

    // Tear down: drop every inbox so agents still waiting on input see the
    // end, and the done receiver so finished agents never block reporting
    // completion, then wait for them all.
    drop(done_tx);
    drop(done_rx);
    drop(agents);
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            config.log_error(&format!("request task failed: {}", e));
        }
    }
    conn.close().await;
    result
}

/// One multiplexed request: accumulates params from its inbox, runs the
/// handler with the remaining inbox as the stdin source, and reports
/// completion to the dispatcher.
async fn run_agent(
    id: u16,
    keep_connection: bool,
    mut inbox: mpsc::Receiver<Record>,
    conn: Arc<Conn>,
    config: Arc<ServerConfig>,
    handler: Arc<dyn Handler>,
    done: mpsc::Sender<AgentDone>,
) {
    let mut params = BytesMut::new();
    loop {
        match inbox.recv().await {
            None => {
                debug!("request {}: connection went away before dispatch", id);
                return;
            }
            Some(record) => match record.record_type {
                RecordType::Params if record.content.is_empty() => break,
                RecordType::Params => params.extend_from_slice(&record.content),
                RecordType::AbortRequest => {
                    debug!("request {}: aborted before dispatch", id);
                    if let Err(e) = conn
                        .send_record(Record::end_request(id, 0, ProtocolStatus::RequestComplete))
                        .await
                    {
                        config.log_error(&format!("request {}: {}", id, e));
                    }
                    let _ = done
                        .send(AgentDone {
                            id,
                            keep_connection,
                            fatal: false,
                        })
                        .await;
                    return;
                }
                other => warn!("request {}: dropping {:?} record before params end", id, other),
            },
        }
    }

    let result = dispatch_request(
        id,
        params.freeze(),
        RecordSource::Inbox(inbox),
        &conn,
        &config,
        &handler,
    )
    .await;
    let fatal = match result {
        Ok(()) => false,
        Err(e) => {
            config.log_error(&format!("request {}: {}", id, e));
            true
        }
    };
    let _ = done
        .send(AgentDone {
            id,
            keep_connection,
            fatal,
        })
        .await;
}
