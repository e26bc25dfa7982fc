//! Stream abstraction for broker connections.
//!
//! Provides a unified interface over plain TCP and TLS streams.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tokio_rustls::client::TlsStream;
use tracing::{debug, warn};

use crate::config::parse_host_port;
use crate::error::{ConnectError, ConnectResult};
use crate::security::TlsConnector;

/// A stream that can be either plain TCP or TLS-encrypted.
pub enum BrokerStream {
    /// Plain TCP connection (PLAINTEXT or SASL_PLAINTEXT).
    Plain(TcpStream),
    /// TLS-encrypted connection (SSL or SASL_SSL).
    Tls(Box<TlsStream<TcpStream>>),
}

impl BrokerStream {
    /// Open a TCP connection to `address` and, with a connector, upgrade it to TLS.
    ///
    /// Both steps share the `deadline`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Refused`] if the address is unusable or the
    /// connection is refused, [`ConnectError::TlsError`] if the handshake fails,
    /// and [`ConnectError::Timeout`] once the deadline passes.
    pub async fn connect(
        address: &str,
        tls: Option<&TlsConnector>,
        deadline: Instant,
    ) -> ConnectResult<Self> {
        let started = Instant::now();
        let (host, _port) = parse_host_port(address).map_err(|message| ConnectError::Refused {
            broker: address.to_string(),
            message,
        })?;

        let tcp_stream = match timeout_at(deadline, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(broker = address, error = %e, "failed to connect to broker");
                return Err(ConnectError::Refused {
                    broker: address.to_string(),
                    message: e.to_string(),
                });
            }
            Err(_) => {
                warn!(broker = address, "connection timeout");
                return Err(ConnectError::Timeout {
                    step: "connecting",
                    after: started.elapsed(),
                });
            }
        };
        let _ = tcp_stream.set_nodelay(true);

        debug!(broker = address, "TCP connection established");

        let Some(connector) = tls else {
            return Ok(Self::Plain(tcp_stream));
        };

        match timeout_at(deadline, connector.connect(host, tcp_stream)).await {
            Ok(Ok(stream)) => {
                debug!(broker = address, "TLS handshake completed");
                Ok(Self::Tls(Box::new(stream)))
            }
            Ok(Err(message)) => Err(ConnectError::TlsError {
                broker: address.to_string(),
                message,
            }),
            Err(_) => Err(ConnectError::Timeout {
                step: "performing the TLS handshake",
                after: started.elapsed(),
            }),
        }
    }

    /// Check if this is a TLS connection.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl AsyncRead for BrokerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BrokerStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            BrokerStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BrokerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            BrokerStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            BrokerStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BrokerStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            BrokerStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BrokerStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            BrokerStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_plain_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let deadline = Instant::now() + Duration::from_secs(1);

        let stream = BrokerStream::connect(&address, None, deadline).await.unwrap();
        assert!(!stream.is_tls());
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let deadline = Instant::now() + Duration::from_secs(1);
        let result = BrokerStream::connect(&address, None, deadline).await;
        assert!(matches!(result, Err(ConnectError::Refused { .. })));
    }

    #[tokio::test]
    async fn test_bad_address_is_refused() {
        let deadline = Instant::now() + Duration::from_secs(1);
        let result = BrokerStream::connect("no-port-here", None, deadline).await;
        assert!(matches!(result, Err(ConnectError::Refused { .. })));
    }

    #[tokio::test]
    async fn test_tls_against_plaintext_listener_fails() {
        use crate::security::TlsOptions;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            if let Ok((mut socket, _)) = listener.accept().await {
                let _ = socket.write_all(b"not a tls server hello").await;
            }
        });

        let connector = TlsConnector::new(&TlsOptions {
            skip_verification: true,
            ..TlsOptions::default()
        })
        .unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        let result = BrokerStream::connect(&address, Some(&connector), deadline).await;
        assert!(matches!(result, Err(ConnectError::TlsError { .. })));
    }

    #[tokio::test]
    async fn test_tls_handshake_timeout() {
        use crate::security::TlsOptions;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let _hold = tokio::spawn(async move {
            let accepted = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(accepted);
        });

        let connector = TlsConnector::new(&TlsOptions {
            skip_verification: true,
            ..TlsOptions::default()
        })
        .unwrap();
        let deadline = Instant::now() + Duration::from_millis(200);
        let result = BrokerStream::connect(&address, Some(&connector), deadline).await;
        assert!(matches!(result, Err(ConnectError::Timeout { .. })));
    }
}
