//! A FastCGI responder library for tokio.
//!
//! The crate accepts connections from an upstream web server, parses
//! FastCGI record framing, dispatches each HTTP request to a handler, and
//! streams the handler's response back. Connections run sequentially or
//! multiplexed depending on configuration; either way one byte stream is
//! shared by framing, request input, and the response pipeline.
//!
//! ```no_run
//! use tokio_fcgi::{Bind, Request, Response, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> tokio_fcgi::Result<()> {
//!     let config = ServerConfig {
//!         bind: Bind::CreateSocket(([127, 0, 0, 1], 9000).into()),
//!         ..ServerConfig::default()
//!     };
//!     Server::new(config, |mut request: Request, response: Response| async move {
//!         let body = request.stdin().get_all().await?;
//!         response.set_header("Content-Type", "text/plain")?;
//!         response.put(format!("{} bytes received\n", body.len())).await?;
//!         Ok(())
//!     })
//!     .run()
//!     .await
//! }
//! ```

#[macro_use]
extern crate log;

mod codec;
mod connection;
mod cookie;
mod error;
mod handler;
mod headers;
mod request;
mod response;
mod s11n;
mod server;
mod stdin;

pub use codec::{Record, RecordCodec};
pub use cookie::Cookie;
pub use error::{Error, Result};
pub use handler::Handler;
pub use headers::RequestHeader;
pub use request::Request;
pub use response::Response;
pub use s11n::{ProtocolStatus, RecordType, Role, FASTCGI_VERSION, MAX_CONTENT_LEN};
pub use server::{serve_connection, Bind, LogCallback, Server, ServerConfig};
pub use stdin::Stdin;
