//! Byte-stream transport to the agent.
//!
//! [`Transport`] and [`Connector`] are the seam between the protocol code and
//! the network, so the session can run against scripted transports in tests.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Default command-server port of the agent.
pub const DEFAULT_PORT: u16 = 36330;

/// Transport-level error types.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to establish the TCP connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] std::io::Error),

    /// No data arrived within the receive budget.
    #[error("Receive timed out after {0}ms")]
    Timeout(u64),

    /// I/O error on an established connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport was already closed by this side.
    #[error("Transport is closed")]
    Closed,
}

/// Host and port of the agent's command server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    host: String,
    port: u16,
}

/// Malformed `host:port` string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointParseError {
    #[error("Endpoint host is empty")]
    EmptyHost,
    #[error("Invalid port '{0}'")]
    InvalidPort(String),
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new("127.0.0.1", DEFAULT_PORT)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    /// Parse `host:port`, `[v6-addr]:port` or a bare host (default port).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            match rest.split_once(']') {
                Some((host, tail)) => (host, tail.strip_prefix(':')),
                None => return Err(EndpointParseError::EmptyHost),
            }
        } else {
            match s.rsplit_once(':') {
                Some((host, port)) if !host.contains(':') => (host, Some(port)),
                Some(_) => (s, None),
                None => (s, None),
            }
        };

        if host.is_empty() {
            return Err(EndpointParseError::EmptyHost);
        }
        let port = match port {
            Some(p) => p
                .parse()
                .map_err(|_| EndpointParseError::InvalidPort(p.to_string()))?,
            None => DEFAULT_PORT,
        };
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for Endpoint {
    type Error = EndpointParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

/// Reliable byte stream to the agent.
///
/// No operation retries on its own; retry and fallback policy belongs to
/// the session.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Write all bytes.
    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read up to `buf.len()` bytes, waiting at most `timeout`.
    ///
    /// `Ok(0)` means the peer closed the connection in an orderly way;
    /// a silent peer yields [`TransportError::Timeout`].
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Close the connection. Later calls fail with [`TransportError::Closed`].
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens transports to an endpoint.
#[allow(async_fn_in_trait)]
pub trait Connector {
    type Transport: Transport;

    async fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Self::Transport, TransportError>;
}

/// TCP connector used in production.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Transport = TcpTransport;

    async fn connect(
        &self,
        endpoint: &Endpoint,
        connect_timeout: Duration,
    ) -> Result<TcpTransport, TransportError> {
        let address = (endpoint.host(), endpoint.port());
        let stream = match timeout(connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(TransportError::ConnectionFailed(e)),
            Err(_) => {
                return Err(TransportError::ConnectionFailed(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("no answer from {} within {:?}", endpoint, connect_timeout),
                )))
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        debug!("Connected to {}", endpoint);
        Ok(TcpTransport::new(stream))
    }
}

/// [`Transport`] over a tokio `TcpStream`.
#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    fn stream(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::Closed)
    }
}

impl Transport for TcpTransport {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream()?;
        stream.write_all(bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn receive(
        &mut self,
        buf: &mut [u8],
        receive_timeout: Duration,
    ) -> Result<usize, TransportError> {
        let stream = self.stream()?;
        match timeout(receive_timeout, stream.read(buf)).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransportError::Timeout(receive_timeout.as_millis() as u64)),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.stream.take() {
            Some(mut stream) => Ok(stream.shutdown().await?),
            None => Ok(()),
        }
    }
}
