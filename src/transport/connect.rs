//! Connection establishment by URI
//!
//! `tcp://host:port` uses a plain TCP socket; `quic://host:port` uses one
//! bidirectional QUIC stream. Both end up as a `FrameTransport`.

use std::fmt;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tracing::info;

use crate::error::{TransportError, TransportResult};
use crate::transport::frame::{FrameTransport, TransportOptions};
use crate::transport::quic::{self, CertPair, QuicListener, QuicStream};

/// Parsed transport URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportUri {
    /// `tcp://host:port`
    Tcp(String),
    /// `quic://host:port`
    Quic(String),
}

impl TransportUri {
    /// Parses a URI
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedUri` for unknown schemes or an empty authority
    pub fn parse(uri: &str) -> TransportResult<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| TransportError::UnsupportedUri(uri.to_string()))?;
        let authority = rest.trim_end_matches('/');
        if authority.is_empty() || authority.contains('/') {
            return Err(TransportError::UnsupportedUri(uri.to_string()));
        }

        match scheme.to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportUri::Tcp(authority.to_string())),
            "quic" => Ok(TransportUri::Quic(authority.to_string())),
            _ => Err(TransportError::UnsupportedUri(uri.to_string())),
        }
    }

    /// The `host:port` part
    pub fn authority(&self) -> &str {
        match self {
            TransportUri::Tcp(authority) | TransportUri::Quic(authority) => authority,
        }
    }

    async fn resolve(&self) -> TransportResult<SocketAddr> {
        tokio::net::lookup_host(self.authority())
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", self, e)))?
            .next()
            .ok_or_else(|| TransportError::ConnectionFailed(format!("{}: no address", self)))
    }
}

impl fmt::Display for TransportUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportUri::Tcp(authority) => write!(f, "tcp://{}", authority),
            TransportUri::Quic(authority) => write!(f, "quic://{}", authority),
        }
    }
}

fn adopt_quic(stream: QuicStream, options: TransportOptions) -> FrameTransport {
    let peer = format!("quic://{}", stream.remote);
    FrameTransport::from_parts(
        Box::new(stream.recv),
        Box::new(stream.send),
        Some(Box::new(stream.guard)),
        peer,
        options,
    )
}

impl FrameTransport {
    /// Connects to `uri` and starts the read loop
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedUri`, `ConnectionFailed`, or `Timeout` after the
    /// configured connect timeout
    pub async fn connect(uri: &str, options: TransportOptions) -> TransportResult<Self> {
        let target = TransportUri::parse(uri)?;
        let connect_timeout = options.settings.connect_timeout();

        let establish = async {
            let addr = target.resolve().await?;
            match &target {
                TransportUri::Tcp(_) => {
                    let stream = TcpStream::connect(addr)
                        .await
                        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
                    stream
                        .set_nodelay(true)
                        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
                    Ok(FrameTransport::from_stream(
                        stream,
                        target.to_string(),
                        options.clone(),
                    ))
                }
                TransportUri::Quic(_) => {
                    let stream = quic::connect(addr, &options.settings.quic_server_name).await?;
                    Ok(adopt_quic(stream, options.clone()))
                }
            }
        };

        tokio::time::timeout(connect_timeout, establish)
            .await
            .map_err(|_| TransportError::Timeout(connect_timeout))?
    }
}

/// Accepts inbound connections on a `tcp://` or `quic://` address
pub enum FrameListener {
    /// Plain TCP
    Tcp(TcpListener),
    /// QUIC endpoint
    Quic(QuicListener),
}

impl FrameListener {
    /// Binds to `uri`; `cert` is required for `quic://`
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedUri`, `Certificate`, or `ConnectionFailed`
    pub async fn bind(uri: &str, cert: Option<&CertPair>) -> TransportResult<Self> {
        let target = TransportUri::parse(uri)?;
        let addr = target.resolve().await?;

        let listener = match target {
            TransportUri::Tcp(_) => FrameListener::Tcp(
                TcpListener::bind(addr)
                    .await
                    .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?,
            ),
            TransportUri::Quic(_) => {
                let cert = cert.ok_or_else(|| {
                    TransportError::Certificate("quic listener needs a certificate".to_string())
                })?;
                FrameListener::Quic(QuicListener::bind(addr, cert)?)
            }
        };

        info!("Listening on {}", listener.local_uri()?);
        Ok(listener)
    }

    /// Bound address as a URI
    ///
    /// # Errors
    ///
    /// Returns error if the socket address is unavailable
    pub fn local_uri(&self) -> TransportResult<String> {
        Ok(match self {
            FrameListener::Tcp(listener) => format!(
                "tcp://{}",
                listener
                    .local_addr()
                    .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?
            ),
            FrameListener::Quic(listener) => format!("quic://{}", listener.local_addr()?),
        })
    }

    /// Waits for the next viewer
    ///
    /// # Errors
    ///
    /// Returns error if accepting fails or the listener was closed
    pub async fn accept(&self, options: TransportOptions) -> TransportResult<FrameTransport> {
        match self {
            FrameListener::Tcp(listener) => {
                let (stream, remote) = listener
                    .accept()
                    .await
                    .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
                stream
                    .set_nodelay(true)
                    .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
                Ok(FrameTransport::from_stream(
                    stream,
                    format!("tcp://{}", remote),
                    options,
                ))
            }
            FrameListener::Quic(listener) => Ok(adopt_quic(listener.accept().await?, options)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::KeyFrameRequestDto;
    use crate::transport::frame::MessageHandlers;
    use crate::transport::state::TransportState;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    #[test]
    fn test_parse_uri() {
        assert_eq!(
            TransportUri::parse("tcp://127.0.0.1:7070").unwrap(),
            TransportUri::Tcp("127.0.0.1:7070".to_string())
        );
        assert_eq!(
            TransportUri::parse("QUIC://host:1/").unwrap(),
            TransportUri::Quic("host:1".to_string())
        );
        assert_eq!(
            TransportUri::parse("tcp://h:2").unwrap().to_string(),
            "tcp://h:2"
        );
    }

    #[test]
    fn test_parse_rejects_unknown_schemes() {
        for uri in ["ws://host:1", "host:1", "tcp://", "tcp://host:1/path"] {
            assert!(matches!(
                TransportUri::parse(uri),
                Err(TransportError::UnsupportedUri(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_tcp_connect_and_accept() {
        let listener = FrameListener::bind("tcp://127.0.0.1:0", None).await.unwrap();
        let uri = listener.local_uri().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handlers = Arc::new(MessageHandlers::new());
        handlers.register_typed::<KeyFrameRequestDto, _>(move |request| {
            let _ = tx.send(request);
        });

        let accept = tokio::spawn(async move {
            listener
                .accept(TransportOptions::default().with_handlers(handlers))
                .await
        });

        let client = FrameTransport::connect(&uri, TransportOptions::default())
            .await
            .unwrap();
        let server = accept.await.unwrap().unwrap();
        assert_eq!(server.state(), TransportState::Open);

        client
            .send(&KeyFrameRequestDto { session_id: Uuid::nil() }, false)
            .await
            .unwrap();
        assert!(tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .is_some());

        client.close("test complete").await;
        tokio::time::timeout(Duration::from_secs(5), server.wait_for_close())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_quic_listener_requires_cert() {
        assert!(matches!(
            FrameListener::bind("quic://127.0.0.1:0", None).await,
            Err(TransportError::Certificate(_))
        ));
    }
}
