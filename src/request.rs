//! The request object: CGI variables decoded from the accumulated
//! `Params` payload, the derived header and cookie tables, and the input
//! buffer.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;

use crate::cookie::{self, Cookie};
use crate::error::Result;
use crate::headers::RequestHeader;
use crate::response::OutputState;
use crate::s11n;
use crate::server::ServerConfig;
use crate::stdin::Stdin;

pub struct Request {
    id: u16,
    variables: HashMap<String, String>,
    headers: HashMap<RequestHeader, String>,
    cookies: HashMap<String, Cookie>,
    stdin: Stdin,
    output: Arc<OutputState>,
}

impl Request {
    /// Builds a request from the concatenated `Params` record payloads.
    /// Variable decoding is tolerant (a truncated trailing pair is
    /// dropped) and uses the configured text encoding; the last write wins
    /// on duplicate names.
    pub(crate) fn new(
        id: u16,
        params: Bytes,
        stdin: Stdin,
        output: Arc<OutputState>,
        config: &ServerConfig,
    ) -> Request {
        let encoding = config.variable_encoding;
        let mut variables = HashMap::new();
        for (name, value) in s11n::decode_nv_pairs(&params) {
            let name = encoding.decode(&name).0.into_owned();
            let value = encoding.decode(&value).0.into_owned();
            variables.insert(name, value);
        }

        let mut headers = HashMap::new();
        for (name, value) in &variables {
            if let Some(header) = RequestHeader::from_cgi_name(name) {
                if config.trace_request_headers {
                    config.log_trace(&format!("request {}: {}: {}", id, header.name(), value));
                }
                headers.insert(header, value.clone());
            }
        }

        let cookies = headers
            .get(&RequestHeader::Cookie)
            .map(|value| cookie::collect(cookie::parse_header(value)))
            .unwrap_or_default();

        Request {
            id,
            variables,
            headers,
            cookies,
            stdin,
            output,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn variables(&self) -> &HashMap<String, String> {
        &self.variables
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<RequestHeader, String> {
        &self.headers
    }

    pub fn header(&self, header: &RequestHeader) -> Option<&str> {
        self.headers.get(header).map(String::as_str)
    }

    pub fn cookies(&self) -> &HashMap<String, Cookie> {
        &self.cookies
    }

    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.get(name)
    }

    /// The request body, pulled from `Stdin` records on demand.
    pub fn stdin(&mut self) -> &mut Stdin {
        &mut self.stdin
    }

    /// True once the paired response has been closed.
    pub fn completed(&self) -> bool {
        self.output.is_closed()
    }

    // CGI convenience accessors. Integer and address parsing reads
    // malformed values as absent rather than failing.

    pub fn method(&self) -> Option<&str> {
        self.variable("REQUEST_METHOD")
    }

    pub fn query_string(&self) -> Option<&str> {
        self.variable("QUERY_STRING")
    }

    pub fn script_name(&self) -> Option<&str> {
        self.variable("SCRIPT_NAME")
    }

    pub fn path_info(&self) -> Option<&str> {
        self.variable("PATH_INFO")
    }

    pub fn request_uri(&self) -> Option<&str> {
        self.variable("REQUEST_URI")
    }

    pub fn server_name(&self) -> Option<&str> {
        self.variable("SERVER_NAME")
    }

    pub fn server_protocol(&self) -> Option<&str> {
        self.variable("SERVER_PROTOCOL")
    }

    pub fn content_type(&self) -> Option<&str> {
        self.variable("CONTENT_TYPE")
    }

    pub fn server_port(&self) -> Option<u16> {
        self.variable("SERVER_PORT")?.parse().ok()
    }

    pub fn remote_port(&self) -> Option<u16> {
        self.variable("REMOTE_PORT")?.parse().ok()
    }

    pub fn remote_addr(&self) -> Option<IpAddr> {
        self.variable("REMOTE_ADDR")?.parse().ok()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.variable("CONTENT_LENGTH")?.parse().ok()
    }

    /// Reads the whole request body. Shorthand for `stdin().get_all()`.
    pub async fn body(&mut self) -> Result<Bytes> {
        self.stdin.get_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stdin::RecordSource;
    use tokio::sync::mpsc;

    fn request_from_vars(vars: &[(&str, &str)]) -> Request {
        let params = s11n::encode_nv_pairs(
            vars.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())),
        );
        let (_tx, rx) = mpsc::channel(1);
        let output = Arc::new(OutputState::new());
        let stdin = Stdin::new(1, RecordSource::Inbox(rx), output.clone());
        let config = ServerConfig::default();
        Request::new(1, params, stdin, output, &config)
    }

    #[test]
    fn variables_decode_with_last_write_winning() {
        let request = request_from_vars(&[
            ("REQUEST_METHOD", "GET"),
            ("QUERY_STRING", "a=1"),
            ("QUERY_STRING", "b=2"),
        ]);
        assert_eq!(request.method(), Some("GET"));
        assert_eq!(request.query_string(), Some("b=2"));
        assert_eq!(request.variables().len(), 2);
    }

    #[test]
    fn headers_derive_from_http_variables() {
        let request = request_from_vars(&[
            ("HTTP_HOST", "example.com"),
            ("HTTP_X_CUSTOM_HEADER", "yes"),
            ("GATEWAY_INTERFACE", "CGI/1.1"),
        ]);
        assert_eq!(request.header(&RequestHeader::Host), Some("example.com"));
        assert_eq!(
            request.header(&RequestHeader::Extension("X-Custom-Header".to_owned())),
            Some("yes")
        );
        assert_eq!(request.headers().len(), 2);
    }

    #[test]
    fn cookies_derive_from_the_cookie_header() {
        let request = request_from_vars(&[(
            "HTTP_COOKIE",
            "$Version=1; foo=\"bar\"; $Path=/; baz=qux",
        )]);
        let foo = request.cookie("foo").unwrap();
        assert_eq!(foo.value, "bar");
        assert_eq!(foo.path.as_deref(), Some("/"));
        assert_eq!(foo.version, 1);
        assert_eq!(request.cookie("baz").unwrap().value, "qux");
    }

    #[test]
    fn malformed_typed_variables_read_as_absent() {
        let request = request_from_vars(&[
            ("SERVER_PORT", "no"),
            ("REMOTE_ADDR", "localhost"),
            ("CONTENT_LENGTH", "-3"),
        ]);
        assert_eq!(request.server_port(), None);
        assert_eq!(request.remote_addr(), None);
        assert_eq!(request.content_length(), None);
    }

    #[test]
    fn typed_variables_parse_when_well_formed() {
        let request = request_from_vars(&[
            ("SERVER_PORT", "8080"),
            ("REMOTE_ADDR", "192.0.2.7"),
            ("CONTENT_LENGTH", "42"),
        ]);
        assert_eq!(request.server_port(), Some(8080));
        assert_eq!(
            request.remote_addr(),
            Some("192.0.2.7".parse::<IpAddr>().unwrap())
        );
        assert_eq!(request.content_length(), Some(42));
    }
}
