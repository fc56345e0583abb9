//! Error types for rsmusicdl.
//!
//! Every component reports through [`Error`]; the pipeline surfaces exactly one
//! consolidated error to the caller once it reaches the failed state.

use thiserror::Error;

use crate::key::KeyId;

/// Main error type for rsmusicdl operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The device credential bundle is missing or invalid.
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    /// Protection data is present but cannot be interpreted.
    #[error("Malformed protection header: {0}")]
    MalformedHeader(String),

    /// License acquisition failed.
    #[error("License error: {0}")]
    License(#[from] LicenseError),

    /// Segment decryption failed.
    #[error("Decryption error: {0}")]
    Decryption(#[from] DecryptionError),

    /// The stream manifest could not be parsed or is unsupported.
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// A manifest or segment fetch failed.
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// The muxer rejected output.
    #[error("Mux error: {0}")]
    Mux(String),

    /// Invalid configuration value.
    #[error("Config error: {0}")]
    Config(String),

    /// The pipeline was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// The pipeline attempted an illegal state transition.
    #[error("Invalid pipeline transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    /// Failed to parse protobuf message.
    #[error("Protobuf decode error: {0}")]
    ProtobufDecodeError(#[from] prost::DecodeError),

    /// Base64 decode error.
    #[error("Base64 decode error: {0}")]
    Base64DecodeError(#[from] base64::DecodeError),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Failures while loading a device credential bundle.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// No bundle exists at the given location.
    #[error("Device file not found: {0}")]
    NotFound(String),

    /// The WVD container is malformed.
    #[error("Invalid WVD file: {0}")]
    InvalidWvd(String),

    /// The RSA private key could not be parsed.
    #[error("Invalid private key: {0}")]
    InvalidKey(String),

    /// The certificate chain failed structural validation.
    #[error("Invalid certificate chain: {0}")]
    InvalidChain(String),

    /// Reading the bundle failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures during the license exchange.
#[derive(Debug, Error)]
pub enum LicenseError {
    /// The license server could not be reached or answered with a server error.
    #[error("Network failure: {0}")]
    Network(String),

    /// The license server did not answer in time.
    #[error("License request timed out")]
    Timeout,

    /// The response signature did not verify.
    #[error("Signature mismatch: {0}")]
    SignatureMismatch(String),

    /// Unwrapping the session key or a content key failed.
    #[error("Key unwrap failed: {0}")]
    Unwrap(String),

    /// The server refused the request.
    #[error("License denied: {0}")]
    Denied(String),

    /// The License Message is invalid or missing.
    #[error("Invalid license message: {0}")]
    InvalidMessage(String),

    /// The response does not belong to the request session.
    #[error("Invalid context: {0}")]
    InvalidContext(String),

    /// A key id appeared more than once in a single response.
    #[error("Duplicate key id in license: {0}")]
    DuplicateKeyId(KeyId),

    /// The license carried no content keys.
    #[error("No content keys in license")]
    NoContentKeys,
}

impl LicenseError {
    /// Whether a fresh request may be attempted after this failure.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, LicenseError::Network(_) | LicenseError::Timeout)
    }
}

/// Failures while decrypting segments.
#[derive(Debug, Error)]
pub enum DecryptionError {
    /// A segment references a key that is not in the key table.
    #[error("No key for KID {0}")]
    MissingKey(KeyId),

    /// Output length differs from input length.
    #[error("Length mismatch: expected {expected} bytes, produced {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// Sample ranges do not tile the segment data.
    #[error("Invalid sample ranges: {0}")]
    InvalidRanges(String),

    /// The track uses a protection scheme other than `cenc`.
    #[error("Unsupported protection scheme: {0}")]
    UnsupportedScheme(String),

    /// A media fragment could not be demuxed.
    #[error("Invalid fragment: {0}")]
    Fragment(String),
}

/// Result type alias for rsmusicdl operations.
pub type Result<T> = std::result::Result<T, Error>;
