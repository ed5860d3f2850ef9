//! The accept loop and its configuration.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use encoding_rs::Encoding;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket};

use crate::connection;
use crate::error::Result;
use crate::handler::Handler;

#[cfg(not(unix))]
use crate::error::Error;

/// A logging callback taking one formatted line.
pub type LogCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// How the server obtains its listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bind {
    /// Bind a fresh TCP socket to the given endpoint.
    CreateSocket(SocketAddr),
    /// Adopt the listening socket the upstream server passed as standard
    /// input, the classic FastCGI launch convention. Unix only.
    StdinSocket,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub bind: Bind,
    /// Backlog for the listening socket.
    pub listen_backlog: u32,
    /// Invoked with each error line, in addition to the `log` crate.
    pub error_logger: Option<LogCallback>,
    /// Invoked with each trace line, in addition to the `log` crate.
    pub trace_logger: Option<LogCallback>,
    /// Trace each derived request header when a request is constructed.
    pub trace_request_headers: bool,
    /// Trace the serialized header block when a response sends it.
    pub trace_response_headers: bool,
    /// Treat a handler error as a normal (empty) completion instead of
    /// terminating the connection.
    pub catch_handler_exceptions: bool,
    /// Serve each accepted connection on its own task.
    pub concurrent_connections: bool,
    /// Values reported in `GetValuesResult` replies. Multiplexed dispatch
    /// is selected when `fcgi_mpxs_conns` is `"1"`.
    pub fcgi_max_conns: String,
    pub fcgi_max_reqs: String,
    pub fcgi_mpxs_conns: String,
    /// Text encoding for decoding request variables.
    pub variable_encoding: &'static Encoding,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            bind: Bind::CreateSocket(SocketAddr::from(([127, 0, 0, 1], 9000))),
            listen_backlog: 1000,
            error_logger: None,
            trace_logger: None,
            trace_request_headers: false,
            trace_response_headers: false,
            catch_handler_exceptions: true,
            concurrent_connections: true,
            fcgi_max_conns: "1000".to_owned(),
            fcgi_max_reqs: "1000".to_owned(),
            fcgi_mpxs_conns: "0".to_owned(),
            variable_encoding: encoding_rs::UTF_8,
        }
    }
}

impl ServerConfig {
    pub(crate) fn multiplexing(&self) -> bool {
        self.fcgi_mpxs_conns == "1"
    }

    pub(crate) fn log_error(&self, message: &str) {
        error!("{}", message);
        if let Some(callback) = &self.error_logger {
            callback(message);
        }
    }

    pub(crate) fn log_trace(&self, message: &str) {
        trace!("{}", message);
        if let Some(callback) = &self.trace_logger {
            callback(message);
        }
    }
}

/// Drives one connection over any bidirectional byte stream. The accept
/// loop uses this for every socket it admits; call it directly to serve a
/// transport of your own.
pub async fn serve_connection<S, H>(stream: S, config: ServerConfig, handler: H) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    H: Handler,
{
    connection::run(stream, Arc::new(config), Arc::new(handler)).await
}

pub struct Server {
    config: Arc<ServerConfig>,
    handler: Arc<dyn Handler>,
}

impl Server {
    pub fn new(config: ServerConfig, handler: impl Handler) -> Server {
        Server {
            config: Arc::new(config),
            handler: Arc::new(handler),
        }
    }

    /// Binds per the configuration and accepts connections until the task
    /// is dropped. Accept failures are logged and the loop continues.
    pub async fn run(self) -> Result<()> {
        let listener = self.bind().await?;
        let allowed = allowed_peers();
        if let Some(addrs) = &allowed {
            debug!("restricting peers to {:?}", addrs);
        }

        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    self.config.log_error(&format!("accept failed: {}", e));
                    continue;
                }
            };
            // A peer address we cannot attribute (local pipes) is let
            // through; TCP always attributes one.
            if let Some(addrs) = &allowed {
                if !addrs.contains(&peer.ip()) {
                    self.config
                        .log_trace(&format!("refusing connection from {}", peer));
                    continue;
                }
            }
            self.config.log_trace(&format!("connection from {}", peer));

            let config = self.config.clone();
            let handler = self.handler.clone();
            if self.config.concurrent_connections {
                tokio::spawn(async move {
                    if let Err(e) = connection::run(socket, config.clone(), handler).await {
                        config.log_error(&format!("connection from {} failed: {}", peer, e));
                    }
                });
            } else if let Err(e) = connection::run(socket, config, handler).await {
                self.config
                    .log_error(&format!("connection from {} failed: {}", peer, e));
            }
        }
    }

    async fn bind(&self) -> Result<TcpListener> {
        match self.config.bind {
            Bind::CreateSocket(addr) => {
                let socket = if addr.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                socket.bind(addr)?;
                let listener = socket.listen(self.config.listen_backlog)?;
                debug!("listening on {}", addr);
                Ok(listener)
            }
            Bind::StdinSocket => stdin_listener(),
        }
    }
}

/// The optional peer allow-list from `FCGI_WEB_SERVER_ADDRS`:
/// comma-separated IP addresses, read once at startup.
fn allowed_peers() -> Option<Vec<IpAddr>> {
    let raw = std::env::var("FCGI_WEB_SERVER_ADDRS").ok()?;
    Some(
        raw.split(',')
            .filter_map(|part| part.trim().parse().ok())
            .collect(),
    )
}

#[cfg(unix)]
fn stdin_listener() -> Result<TcpListener> {
    use std::os::unix::io::FromRawFd;

    // The upstream server hands us the listening socket as fd 0.
    let listener = unsafe { std::net::TcpListener::from_raw_fd(0) };
    listener.set_nonblocking(true)?;
    Ok(TcpListener::from_std(listener)?)
}

#[cfg(not(unix))]
fn stdin_listener() -> Result<TcpListener> {
    Err(Error::UnsupportedBind)
}
