use std::io;

/// Errors surfaced by the protocol engine.
///
/// Framing and I/O errors are fatal to the connection they occur on; the
/// state-machine variants are returned to the handler that misused the
/// request or response object.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The peer sent a record whose version byte is not 1.
    #[error("unsupported FastCGI version {0}")]
    UnknownVersion(u8),

    /// A header or cookie mutation was attempted after the header block
    /// went out on the wire.
    #[error("response headers have already been sent")]
    HeadersAlreadySent,

    /// A send or read was attempted after the response was closed.
    #[error("response output is already closed")]
    OutputAlreadyClosed,

    /// The request input buffer lost its record source before the
    /// end-of-input marker arrived.
    #[error("request input buffer is closed")]
    BufferClosed,

    /// `Bind::StdinSocket` was requested on a platform without it.
    #[error("stdin-socket binding is not supported on this platform")]
    UnsupportedBind,

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
