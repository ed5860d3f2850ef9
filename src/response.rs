//! The response object: status, header and cookie tables, and the send
//! pipeline with header-send gating.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::codec::Record;
use crate::connection::Conn;
use crate::cookie::{self, Cookie};
use crate::error::{Error, Result};
use crate::s11n::ProtocolStatus;
use crate::server::ServerConfig;

/// The monotonic output-closed flag, shared between the response and the
/// paired request's input buffer. Closing the response discards unread
/// input, so the buffer checks this cell before every read.
pub(crate) struct OutputState {
    closed: AtomicBool,
}

impl OutputState {
    pub(crate) fn new() -> OutputState {
        OutputState {
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

struct HeaderState {
    status: u16,
    headers: HashMap<String, String>,
    cookies: HashMap<String, Cookie>,
    headers_sent: bool,
}

struct Inner {
    conn: Arc<Conn>,
    config: Arc<ServerConfig>,
    request_id: u16,
    state: Mutex<HeaderState>,
    output: Arc<OutputState>,
}

/// Handle to one request's response. The dispatcher keeps a second handle
/// to flush headers and close output after the handler returns; the
/// handler must not share its handle across tasks.
pub struct Response {
    inner: Arc<Inner>,
}

impl Response {
    pub(crate) fn new(
        conn: Arc<Conn>,
        config: Arc<ServerConfig>,
        request_id: u16,
    ) -> (Response, Arc<OutputState>) {
        let output = Arc::new(OutputState::new());
        let mut headers = HashMap::new();
        headers.insert(
            "Content-Type".to_owned(),
            "text/html; charset=utf-8".to_owned(),
        );
        let response = Response {
            inner: Arc::new(Inner {
                conn,
                config,
                request_id,
                state: Mutex::new(HeaderState {
                    status: 200,
                    headers,
                    cookies: HashMap::new(),
                    headers_sent: false,
                }),
                output: output.clone(),
            }),
        };
        (response, output)
    }

    /// A second handle for the dispatcher's post-handler flush.
    pub(crate) fn handle(&self) -> Response {
        Response {
            inner: self.inner.clone(),
        }
    }

    pub fn request_id(&self) -> u16 {
        self.inner.request_id
    }

    pub fn status(&self) -> u16 {
        self.inner.state.lock().unwrap().status
    }

    pub fn headers_sent(&self) -> bool {
        self.inner.state.lock().unwrap().headers_sent
    }

    pub fn closed(&self) -> bool {
        self.inner.output.is_closed()
    }

    fn mutate<F: FnOnce(&mut HeaderState)>(&self, f: F) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if state.headers_sent {
            return Err(Error::HeadersAlreadySent);
        }
        f(&mut state);
        Ok(())
    }

    pub fn set_status(&self, status: u16) -> Result<()> {
        self.mutate(|state| state.status = status)
    }

    pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.mutate(|state| {
            state.headers.insert(name.into(), value.into());
        })
    }

    pub fn unset_header(&self, name: &str) -> Result<()> {
        self.mutate(|state| {
            state.headers.remove(name);
        })
    }

    pub fn set_cookie(&self, cookie: Cookie) -> Result<()> {
        self.mutate(|state| {
            state.cookies.insert(cookie.name.clone(), cookie);
        })
    }

    /// Inserts a deletion marker: an empty value with an expiry one day in
    /// the past, instructing the user agent to drop the cookie.
    pub fn unset_cookie(&self, name: &str) -> Result<()> {
        self.set_cookie(Cookie::expired(name))
    }

    /// Serializes and emits the header block as a `Stdout` record. The
    /// first call wins; subsequent calls are no-ops.
    pub async fn send_headers(&self) -> Result<()> {
        if self.closed() {
            return Err(Error::OutputAlreadyClosed);
        }
        let block = {
            let mut state = self.inner.state.lock().unwrap();
            if state.headers_sent {
                return Ok(());
            }
            state.headers_sent = true;
            serialize_headers(&state)
        };
        if self.inner.config.trace_response_headers {
            self.inner
                .config
                .log_trace(&format!("response headers:\r\n{}", block));
        }
        self.inner
            .conn
            .send_record(Record::stdout(self.inner.request_id, Bytes::from(block)))
            .await
    }

    /// Emits body bytes, sending the header block first if it has not gone
    /// out yet. Bytes are fragmented into records of at most 65535 bytes
    /// each, in order.
    pub async fn put(&self, body: impl AsRef<[u8]>) -> Result<()> {
        if self.closed() {
            return Err(Error::OutputAlreadyClosed);
        }
        self.send_headers().await?;
        self.inner
            .conn
            .send_buffer(self.inner.request_id, body.as_ref())
            .await
    }

    /// Marks the output closed and emits `EndRequest`. Every later send or
    /// paired-input read fails with `OutputAlreadyClosed`.
    pub async fn close(&self) -> Result<()> {
        if !self.inner.output.close() {
            return Err(Error::OutputAlreadyClosed);
        }
        self.inner
            .conn
            .send_record(Record::end_request(
                self.inner.request_id,
                0,
                ProtocolStatus::RequestComplete,
            ))
            .await
    }
}

/// `Status:` pseudo-header first, then the header table, then a single
/// `Set-Cookie` joined from the cookie table unless an explicit
/// `Set-Cookie` header overrides it, blank-line terminated.
fn serialize_headers(state: &HeaderState) -> String {
    let mut block = format!("Status: {}\r\n", state.status);
    for (name, value) in &state.headers {
        block.push_str(name);
        block.push_str(": ");
        block.push_str(value);
        block.push_str("\r\n");
    }
    if !state.headers.contains_key("Set-Cookie") && !state.cookies.is_empty() {
        block.push_str("Set-Cookie: ");
        block.push_str(&cookie::join_set_cookie(state.cookies.values()));
        block.push_str("\r\n");
    }
    block.push_str("\r\n");
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RecordCodec;
    use crate::s11n::RecordType;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    fn test_response() -> (Response, FramedRead<tokio::io::DuplexStream, RecordCodec>) {
        let (client, server) = tokio::io::duplex(1 << 20);
        let (_read_half, write_half) = tokio::io::split(server);
        let conn = Arc::new(Conn::new(Box::new(write_half)));
        let config = Arc::new(ServerConfig::default());
        let (response, _output) = Response::new(conn, config, 1);
        (response, FramedRead::new(client, RecordCodec))
    }

    #[tokio::test]
    async fn mutations_fail_after_headers_sent() {
        let (response, _reader) = test_response();
        response.set_status(404).unwrap();
        response.set_header("X-A", "1").unwrap();
        response.send_headers().await.unwrap();
        assert!(matches!(
            response.set_status(500),
            Err(Error::HeadersAlreadySent)
        ));
        assert!(matches!(
            response.set_header("X-B", "2"),
            Err(Error::HeadersAlreadySent)
        ));
        assert!(matches!(
            response.unset_header("X-A"),
            Err(Error::HeadersAlreadySent)
        ));
        assert!(matches!(
            response.set_cookie(Cookie::new("a", "1")),
            Err(Error::HeadersAlreadySent)
        ));
    }

    #[tokio::test]
    async fn send_headers_is_idempotent() {
        let (response, mut reader) = test_response();
        response.send_headers().await.unwrap();
        response.send_headers().await.unwrap();
        response.put("body").await.unwrap();

        let first = reader.next().await.unwrap().unwrap();
        let text = String::from_utf8(first.content.to_vec()).unwrap();
        assert!(text.starts_with("Status: 200\r\n"));
        assert!(text.contains("Content-Type: text/html; charset=utf-8\r\n"));
        assert!(text.ends_with("\r\n\r\n"));

        let second = reader.next().await.unwrap().unwrap();
        assert_eq!(&second.content[..], b"body");
    }

    #[tokio::test]
    async fn put_fragments_large_bodies_in_order() {
        let (response, mut reader) = test_response();
        let body = vec![7u8; 70_000];
        response.put(&body).await.unwrap();

        let _headers = reader.next().await.unwrap().unwrap();
        let first = reader.next().await.unwrap().unwrap();
        assert_eq!(first.content.len(), 65535);
        let second = reader.next().await.unwrap().unwrap();
        assert_eq!(second.content.len(), 70_000 - 65535);
    }

    #[tokio::test]
    async fn close_gates_every_later_operation() {
        let (response, mut reader) = test_response();
        response.send_headers().await.unwrap();
        response.close().await.unwrap();

        assert!(matches!(response.put("x").await, Err(Error::OutputAlreadyClosed)));
        assert!(matches!(response.close().await, Err(Error::OutputAlreadyClosed)));
        assert!(matches!(
            response.send_headers().await,
            Err(Error::OutputAlreadyClosed)
        ));
        assert!(matches!(
            response.set_header("X-Late", "1"),
            Err(Error::HeadersAlreadySent)
        ));

        let _headers = reader.next().await.unwrap().unwrap();
        let end = reader.next().await.unwrap().unwrap();
        assert_eq!(end.record_type, RecordType::EndRequest);
        assert_eq!(&end.content[..4], &[0, 0, 0, 0]);
        assert_eq!(end.content[4], 0);
    }

    #[tokio::test]
    async fn cookie_table_produces_one_set_cookie_line() {
        let (response, mut reader) = test_response();
        response.set_cookie(Cookie::new("sid", "abc")).unwrap();
        response.send_headers().await.unwrap();
        let headers = reader.next().await.unwrap().unwrap();
        let text = String::from_utf8(headers.content.to_vec()).unwrap();
        assert!(text.contains("Set-Cookie: sid=\"abc\"\r\n"));
    }

    #[tokio::test]
    async fn explicit_set_cookie_header_overrides_the_table() {
        let (response, mut reader) = test_response();
        response.set_cookie(Cookie::new("sid", "abc")).unwrap();
        response.set_header("Set-Cookie", "raw=1").unwrap();
        response.send_headers().await.unwrap();
        let headers = reader.next().await.unwrap().unwrap();
        let text = String::from_utf8(headers.content.to_vec()).unwrap();
        assert!(text.contains("Set-Cookie: raw=1\r\n"));
        assert!(!text.contains("sid"));
    }
}
