//! Single Kafka broker connection.
//!
//! A [`BrokerConnection`] owns one socket for the lifetime of one command. It
//! frames requests, checks correlation ids and runs the SASL exchange when the
//! security material asks for it.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use kafka_protocol::messages::{
    RequestHeader, ResponseHeader, SaslAuthenticateRequest, SaslHandshakeRequest,
};
use kafka_protocol::protocol::{Decodable, Encodable, HeaderVersion, Request, StrBytes};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, instrument};

use crate::error::{ConnectError, ConnectResult};
use crate::protocol::{error_codes, versions};
use crate::security::scram::{ScramClient, ScramHash};
use crate::security::{SaslMaterial, SecurityMaterial};

use super::stream::BrokerStream;

/// Upper bound for one request once the handshake is done.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest response frame we accept.
const MAX_RESPONSE_SIZE: usize = 100 * 1024 * 1024;

/// An open, authenticated connection to a single Kafka broker.
pub struct BrokerConnection {
    address: String,
    client_id: StrBytes,
    stream: BrokerStream,
    correlation_id: i32,
    deadline: Option<Instant>,
}

impl BrokerConnection {
    /// Connect to `address`, upgrade to TLS and authenticate as `security` requires.
    ///
    /// Every step, including the SASL round trips, must finish before `deadline`.
    ///
    /// # Errors
    ///
    /// Returns the [`ConnectError`] of the first failing step.
    #[instrument(skip(security, deadline), fields(tls = security.tls.is_some(), sasl = security.sasl.is_some()))]
    pub async fn open(
        address: &str,
        security: &SecurityMaterial,
        client_id: &str,
        deadline: Instant,
    ) -> ConnectResult<Self> {
        let stream = BrokerStream::connect(address, security.tls.as_ref(), deadline).await?;

        let mut connection = Self {
            address: address.to_string(),
            client_id: StrBytes::from_string(client_id.to_string()),
            stream,
            correlation_id: 0,
            deadline: Some(deadline),
        };

        if let Some(sasl) = &security.sasl {
            connection.authenticate(sasl).await?;
        }

        connection.deadline = None;
        debug!("connected to broker");
        Ok(connection)
    }

    /// Get the broker address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.stream.is_tls()
    }

    /// Bound every following request by `deadline` as well as the per-request timeout.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// Send `request` at `api_version` and decode the matching response.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Timeout`] if no response arrives in time,
    /// [`ConnectError::Io`] if the socket fails and [`ConnectError::Protocol`]
    /// if the response cannot be decoded or belongs to another request.
    pub async fn send<R: Request>(
        &mut self,
        request: &R,
        api_version: i16,
    ) -> ConnectResult<R::Response> {
        let correlation_id = self.next_correlation_id();

        let mut header = RequestHeader::default();
        header.request_api_key = R::KEY;
        header.request_api_version = api_version;
        header.correlation_id = correlation_id;
        header.client_id = Some(self.client_id.clone());

        let mut buf = BytesMut::new();
        header
            .encode(&mut buf, R::header_version(api_version))
            .map_err(|e| ConnectError::protocol(format!("failed to encode request header: {e}")))?;
        request
            .encode(&mut buf, api_version)
            .map_err(|e| ConnectError::protocol(format!("failed to encode request {}: {e}", R::KEY)))?;

        debug!(
            api_key = R::KEY,
            api_version,
            correlation_id,
            request_len = buf.len(),
            "sending request"
        );

        let mut response = self.round_trip(&buf).await?;

        let response_header =
            ResponseHeader::decode(&mut response, R::Response::header_version(api_version))
                .map_err(|e| {
                    ConnectError::protocol(format!("failed to decode response header: {e}"))
                })?;
        if response_header.correlation_id != correlation_id {
            return Err(ConnectError::protocol(format!(
                "correlation id mismatch: expected {correlation_id}, got {}",
                response_header.correlation_id
            )));
        }

        R::Response::decode(&mut response, api_version).map_err(|e| {
            ConnectError::protocol(format!("failed to decode response to request {}: {e}", R::KEY))
        })
    }

    /// Close the socket, flushing any TLS close-notify.
    pub async fn shutdown(mut self) {
        let _ = self.stream.shutdown().await;
        debug!(broker = %self.address, "connection closed");
    }

    fn next_correlation_id(&mut self) -> i32 {
        let id = self.correlation_id;
        self.correlation_id = self.correlation_id.wrapping_add(1);
        id
    }

    /// Write one length-prefixed frame and read one back.
    async fn round_trip(&mut self, request_bytes: &[u8]) -> ConnectResult<Bytes> {
        let started = Instant::now();
        let limit = started + DEFAULT_REQUEST_TIMEOUT;
        let limit = self.deadline.map_or(limit, |deadline| deadline.min(limit));

        let mut write_buf = BytesMut::with_capacity(4 + request_bytes.len());
        write_buf.put_u32(request_bytes.len() as u32);
        write_buf.extend_from_slice(request_bytes);

        let stream = &mut self.stream;
        let exchange = async {
            stream.write_all(&write_buf).await?;
            stream.flush().await?;

            let mut len_buf = [0u8; 4];
            stream.read_exact(&mut len_buf).await?;
            let response_len = u32::from_be_bytes(len_buf) as usize;
            if response_len > MAX_RESPONSE_SIZE {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("response frame of {response_len} bytes is too large"),
                ));
            }

            let mut response_buf = vec![0u8; response_len];
            stream.read_exact(&mut response_buf).await?;
            Ok::<_, std::io::Error>(response_buf)
        };

        match timeout_at(limit, exchange).await {
            Ok(Ok(buf)) => Ok(Bytes::from(buf)),
            Ok(Err(source)) => Err(ConnectError::Io {
                broker: self.address.clone(),
                source,
            }),
            Err(_) => Err(ConnectError::Timeout {
                step: "waiting for a broker response",
                after: started.elapsed(),
            }),
        }
    }

    /// Run SaslHandshake followed by the mechanism's SaslAuthenticate rounds.
    #[instrument(skip_all, fields(broker = %self.address, mechanism = sasl.mechanism()))]
    async fn authenticate(&mut self, sasl: &SaslMaterial) -> ConnectResult<()> {
        let mechanism = sasl.mechanism();

        let mut handshake = SaslHandshakeRequest::default();
        handshake.mechanism = StrBytes::from_static_str(mechanism);
        let response = self.send(&handshake, versions::SASL_HANDSHAKE).await?;

        if response.error_code != error_codes::NONE {
            let supported: Vec<String> = response.mechanisms.iter().map(|m| m.to_string()).collect();
            return Err(self.auth_failed(format!(
                "SASL mechanism '{mechanism}' rejected ({}); broker supports {supported:?}",
                error_codes::name(response.error_code)
            )));
        }

        match sasl {
            SaslMaterial::Plain { auth_bytes, .. } => {
                self.sasl_authenticate(Bytes::copy_from_slice(auth_bytes))
                    .await?;
            }
            SaslMaterial::ScramSha256(client) => self.authenticate_scram(client).await?,
            SaslMaterial::ScramSha512(client) => self.authenticate_scram(client).await?,
        }

        info!(username = sasl.username(), "SASL authentication completed successfully");
        Ok(())
    }

    async fn authenticate_scram<H: ScramHash>(
        &mut self,
        client: &ScramClient<H>,
    ) -> ConnectResult<()> {
        let server_first = self
            .sasl_authenticate(Bytes::from(client.client_first()))
            .await?;
        let server_first = String::from_utf8(server_first.to_vec())
            .map_err(|_| self.auth_failed("invalid UTF-8 in server-first-message"))?;

        let client_final = client
            .client_final(&server_first)
            .map_err(|e| self.auth_failed(e.to_string()))?;

        let server_final = self
            .sasl_authenticate(Bytes::from(client_final.message.clone()))
            .await?;
        let server_final = String::from_utf8(server_final.to_vec())
            .map_err(|_| self.auth_failed("invalid UTF-8 in server-final-message"))?;

        client_final
            .verify(&server_final)
            .map_err(|e| self.auth_failed(e.to_string()))?;

        debug!(mechanism = H::name(), "SCRAM authentication successful");
        Ok(())
    }

    /// One SaslAuthenticate round; returns the server's auth bytes.
    async fn sasl_authenticate(&mut self, auth_bytes: Bytes) -> ConnectResult<Bytes> {
        let mut request = SaslAuthenticateRequest::default();
        request.auth_bytes = auth_bytes;

        let response = self.send(&request, versions::SASL_AUTHENTICATE).await?;
        if response.error_code != error_codes::NONE {
            let message = response
                .error_message
                .map(|s| s.to_string())
                .unwrap_or_else(|| error_codes::name(response.error_code).to_string());
            return Err(self.auth_failed(message));
        }
        Ok(response.auth_bytes)
    }

    fn auth_failed(&self, message: impl Into<String>) -> ConnectError {
        ConnectError::AuthFailed {
            broker: self.address.clone(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kafka_protocol::messages::MetadataRequest;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_to_invalid_address() {
        let deadline = Instant::now() + Duration::from_millis(200);
        let result = BrokerConnection::open(
            "127.0.0.1:59999",
            &SecurityMaterial::plaintext(),
            "test",
            deadline,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_silent_broker_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let _hold = tokio::spawn(async move {
            let accepted = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(accepted);
        });

        let deadline = Instant::now() + Duration::from_secs(1);
        let mut connection =
            BrokerConnection::open(&address, &SecurityMaterial::plaintext(), "test", deadline)
                .await
                .unwrap();
        connection.set_deadline(Some(Instant::now() + Duration::from_millis(150)));

        let result = connection
            .send(&MetadataRequest::default(), versions::METADATA)
            .await;
        assert!(matches!(result, Err(ConnectError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_closed_socket_is_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            if let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let deadline = Instant::now() + Duration::from_secs(1);
        let mut connection =
            BrokerConnection::open(&address, &SecurityMaterial::plaintext(), "test", deadline)
                .await
                .unwrap();

        let result = connection
            .send(&MetadataRequest::default(), versions::METADATA)
            .await;
        assert!(matches!(
            result,
            Err(ConnectError::Io { .. } | ConnectError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_correlation_ids_increase() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let deadline = Instant::now() + Duration::from_secs(1);
        let mut connection =
            BrokerConnection::open(&address, &SecurityMaterial::plaintext(), "test", deadline)
                .await
                .unwrap();
        assert_eq!(connection.next_correlation_id(), 0);
        assert_eq!(connection.next_correlation_id(), 1);
        assert_eq!(connection.address(), address);
        assert!(!connection.is_tls());
    }
}
