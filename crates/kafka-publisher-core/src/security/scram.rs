//! SASL/SCRAM client (RFC 5802, RFC 7677).
//!
//! SCRAM (Salted Challenge Response Authentication Mechanism) proves knowledge of
//! the password without sending it. The exchange is two round trips:
//!
//! 1. client-first `n,,n=<user>,r=<client nonce>` -> server-first `r=<nonce>,s=<salt>,i=<iterations>`
//! 2. client-final `c=biws,r=<nonce>,p=<proof>` -> server-final `v=<server signature>`

use std::fmt;
use std::marker::PhantomData;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

/// Nonce length in bytes before base64 encoding.
pub const NONCE_LENGTH: usize = 24;

/// Minimum number of PBKDF2 iterations (per RFC 7677).
pub const MIN_ITERATIONS: u32 = 4096;

/// Errors raised while running the client side of a SCRAM exchange.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScramError {
    #[error("invalid server message: {0}")]
    InvalidMessage(String),

    #[error("server nonce does not extend the client nonce")]
    NonceMismatch,

    #[error("server requested {0} iterations, below the minimum of 4096")]
    TooFewIterations(u32),

    #[error("server reported: {0}")]
    Server(String),

    #[error("server signature does not match")]
    BadServerSignature,
}

/// Hash algorithm trait for SCRAM variants.
pub trait ScramHash: Send + Sync + fmt::Debug {
    /// The hash algorithm name.
    fn name() -> &'static str;
    /// Compute HMAC.
    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8>;
    /// Compute hash.
    fn hash(data: &[u8]) -> Vec<u8>;
    /// Derive key using PBKDF2.
    fn pbkdf2(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8>;
}

/// SHA-256 implementation for SCRAM.
#[derive(Debug, Clone, Copy)]
pub struct ScramSha256;

impl ScramHash for ScramSha256 {
    fn name() -> &'static str {
        "SCRAM-SHA-256"
    }

    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC can take key of any size");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    fn hash(data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }

    fn pbkdf2(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
        let mut output = vec![0u8; 32];
        pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut output);
        output
    }
}

/// SHA-512 implementation for SCRAM.
#[derive(Debug, Clone, Copy)]
pub struct ScramSha512;

impl ScramHash for ScramSha512 {
    fn name() -> &'static str {
        "SCRAM-SHA-512"
    }

    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac = Hmac::<Sha512>::new_from_slice(key).expect("HMAC can take key of any size");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    fn hash(data: &[u8]) -> Vec<u8> {
        Sha512::digest(data).to_vec()
    }

    fn pbkdf2(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
        let mut output = vec![0u8; 64];
        pbkdf2_hmac::<Sha512>(password, salt, iterations, &mut output);
        output
    }
}

/// Keys derived from a password, salt and iteration count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScramKeys {
    pub client_key: Vec<u8>,
    pub stored_key: Vec<u8>,
    pub server_key: Vec<u8>,
}

impl ScramKeys {
    /// Run the key derivation of RFC 5802 section 3.
    pub fn derive<H: ScramHash>(password: &str, salt: &[u8], iterations: u32) -> Self {
        let salted_password = H::pbkdf2(password.as_bytes(), salt, iterations);
        let client_key = H::hmac(&salted_password, b"Client Key");
        let stored_key = H::hash(&client_key);
        let server_key = H::hmac(&salted_password, b"Server Key");
        Self {
            client_key,
            stored_key,
            server_key,
        }
    }
}

/// Second client message plus what the server must prove in return.
pub struct ClientFinal {
    pub message: String,
    expected_server_signature: Vec<u8>,
}

impl ClientFinal {
    /// Check the server-final message against the expected signature.
    ///
    /// # Errors
    ///
    /// Returns an error if the server reported a failure or signed with the
    /// wrong key.
    pub fn verify(&self, server_final: &str) -> Result<(), ScramError> {
        if let Some(error) = server_final.strip_prefix("e=") {
            return Err(ScramError::Server(error.to_string()));
        }
        let signature = server_final
            .split(',')
            .find_map(|part| part.strip_prefix("v="))
            .ok_or_else(|| ScramError::InvalidMessage("missing server signature (v=)".into()))?;
        let signature = BASE64
            .decode(signature)
            .map_err(|e| ScramError::InvalidMessage(format!("invalid base64 signature: {e}")))?;
        if signature != self.expected_server_signature {
            return Err(ScramError::BadServerSignature);
        }
        Ok(())
    }
}

impl fmt::Debug for ClientFinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientFinal").finish_non_exhaustive()
    }
}

/// Client side of one SCRAM exchange.
///
/// The client-first message is fixed when the client is built; the rest of
/// the exchange is computed from the server's replies.
#[derive(Clone)]
pub struct ScramClient<H: ScramHash> {
    username: String,
    password: String,
    client_nonce: String,
    client_first_bare: String,
    _marker: PhantomData<H>,
}

impl<H: ScramHash> ScramClient<H> {
    /// Prepare an exchange with a fresh random nonce.
    pub fn new(username: &str, password: &str) -> Self {
        let random_bytes: [u8; NONCE_LENGTH] = rand::thread_rng().gen();
        Self::with_nonce(username, password, BASE64.encode(random_bytes))
    }

    pub(crate) fn with_nonce(username: &str, password: &str, client_nonce: String) -> Self {
        let client_first_bare = format!("n={},r={}", escape_username(username), client_nonce);
        Self {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce,
            client_first_bare,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn mechanism(&self) -> &'static str {
        H::name()
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The client-first message; `n,,` is the GS2 header (no channel binding).
    #[must_use]
    pub fn client_first(&self) -> String {
        format!("n,,{}", self.client_first_bare)
    }

    /// Compute the client-final message from the server-first message.
    ///
    /// # Errors
    ///
    /// Returns an error if the server message is malformed, does not extend our
    /// nonce, or asks for fewer than [`MIN_ITERATIONS`] iterations.
    pub fn client_final(&self, server_first: &str) -> Result<ClientFinal, ScramError> {
        let (combined_nonce, salt, iterations) = parse_server_first_message(server_first)?;
        if !combined_nonce.starts_with(&self.client_nonce) {
            return Err(ScramError::NonceMismatch);
        }
        if iterations < MIN_ITERATIONS {
            return Err(ScramError::TooFewIterations(iterations));
        }

        let keys = ScramKeys::derive::<H>(&self.password, &salt, iterations);

        // c=biws is base64("n,,")
        let client_final_without_proof = format!("c=biws,r={combined_nonce}");
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, client_final_without_proof
        );

        let client_signature = H::hmac(&keys.stored_key, auth_message.as_bytes());
        let client_proof: Vec<u8> = keys
            .client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        Ok(ClientFinal {
            message: format!(
                "{},p={}",
                client_final_without_proof,
                BASE64.encode(&client_proof)
            ),
            expected_server_signature: H::hmac(&keys.server_key, auth_message.as_bytes()),
        })
    }
}

impl<H: ScramHash> fmt::Debug for ScramClient<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScramClient")
            .field("mechanism", &H::name())
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// `=` and `,` are reserved in SCRAM attribute values.
fn escape_username(username: &str) -> String {
    username.replace('=', "=3D").replace(',', "=2C")
}

/// Parse server-first-message: `r=<combined-nonce>,s=<salt>,i=<iterations>`.
fn parse_server_first_message(message: &str) -> Result<(String, Vec<u8>, u32), ScramError> {
    let mut combined_nonce = None;
    let mut salt = None;
    let mut iterations = None;

    for part in message.split(',') {
        if let Some(value) = part.strip_prefix("r=") {
            combined_nonce = Some(value.to_string());
        } else if let Some(value) = part.strip_prefix("s=") {
            salt = Some(
                BASE64
                    .decode(value)
                    .map_err(|e| ScramError::InvalidMessage(format!("invalid base64 salt: {e}")))?,
            );
        } else if let Some(value) = part.strip_prefix("i=") {
            iterations = Some(value.parse::<u32>().map_err(|e| {
                ScramError::InvalidMessage(format!("invalid iteration count: {e}"))
            })?);
        } else if let Some(value) = part.strip_prefix("e=") {
            return Err(ScramError::Server(value.to_string()));
        }
    }

    Ok((
        combined_nonce.ok_or_else(|| ScramError::InvalidMessage("missing nonce (r=)".into()))?,
        salt.ok_or_else(|| ScramError::InvalidMessage("missing salt (s=)".into()))?,
        iterations.ok_or_else(|| ScramError::InvalidMessage("missing iterations (i=)".into()))?,
    ))
}
