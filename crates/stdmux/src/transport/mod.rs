//! Transport layer for stdmux.
//!
//! An attach session runs over any duplex byte stream. The HTTP transport
//! produces one by upgrading an attach request; tests use in-memory pipes.

pub mod http;

use tokio::io::{AsyncRead, AsyncWrite};

pub use http::{ServerConfig, serve};

/// A connected client: bytes in (stdin), bytes out (container output).
pub trait AttachStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AttachStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
