//! Error types for the configuration agent.
//!
//! This module defines all error types that can occur during agent
//! operations, including transport errors, crypto errors, and the
//! control-flow sentinels used by the check-in protocol.

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during agent operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The device-gateway reported the configuration is unchanged (304/204).
    ///
    /// This is a control-flow sentinel, not a failure: callers of the
    /// check-in treat it as "nothing to do".
    #[error("config unchanged on server")]
    NotModified,

    /// An on-changed handler exited with status 123, requesting that the
    /// agent terminate with the same status.
    #[error("config handler requested agent exit with status {0}")]
    HandlerExit(i32),

    /// HTTP request or transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server returned an unexpected HTTP status.
    #[error("unable to {method} {url} - HTTP_{status}: {body}")]
    Status {
        /// HTTP method of the failed request.
        method: &'static str,
        /// Request URL.
        url: String,
        /// HTTP status code.
        status: u16,
        /// Body preview from the server.
        body: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Base64 decoding error.
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// DER encoding/decoding error.
    #[error("DER error: {0}")]
    Der(#[from] der::Error),

    /// Bad or missing configuration value.
    #[error("config error: {0}")]
    Config(String),

    /// `update_keys` targeted the externally-managed TOML layer.
    #[error("cannot override config-managed file: {0}")]
    ConfigManaged(String),

    /// `update_keys` found no layer it is allowed to write.
    #[error("no writable TOML file found")]
    NoWritableConfig,

    /// TLS configuration or identity error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// PKCS#11 token error.
    #[error("HSM error: {0}")]
    Hsm(String),

    /// ECIES ciphertext is malformed or its tag does not verify.
    #[error("invalid ECIES message")]
    InvalidMessage,

    /// ECIES ephemeral point could not be decoded.
    #[error("invalid ECIES public key")]
    InvalidPublicKey,

    /// ECIES ephemeral point does not lie on the curve.
    #[error("ECIES point not on curve")]
    InvalidCurve,

    /// Other cryptographic failure.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Failed to parse an X.509 certificate.
    #[error("certificate parsing error: {0}")]
    CertificateParsing(String),

    /// Failed to parse a CMS/PKCS#7 structure.
    #[error("CMS/PKCS#7 parsing error: {0}")]
    CmsParsing(String),

    /// Failed to build or sign a CSR.
    #[error("CSR error: {0}")]
    Csr(String),

    /// A fetched root CA bundle failed validation.
    #[error("error validating root certificates: {0}")]
    CaValidation(String),

    /// An envelope entry name is not a clean relative path.
    #[error("invalid config entry name: {0}")]
    EnvelopeName(String),
}

impl Error {
    /// Create a config error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a TLS error with the given message.
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// Create an HSM error with the given message.
    pub fn hsm(msg: impl Into<String>) -> Self {
        Self::Hsm(msg.into())
    }

    /// Create a crypto error with the given message.
    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto(msg.into())
    }

    /// Create a certificate parsing error with the given message.
    pub fn certificate_parsing(msg: impl Into<String>) -> Self {
        Self::CertificateParsing(msg.into())
    }

    /// Create a CMS parsing error with the given message.
    pub fn cms_parsing(msg: impl Into<String>) -> Self {
        Self::CmsParsing(msg.into())
    }

    /// Create a CSR error with the given message.
    pub fn csr(msg: impl Into<String>) -> Self {
        Self::Csr(msg.into())
    }

    /// Create a root CA validation error with the given message.
    pub fn ca_validation(msg: impl Into<String>) -> Self {
        Self::CaValidation(msg.into())
    }

    /// Create a status error with a bounded body preview.
    pub fn status(method: &'static str, url: impl Into<String>, status: u16, body: &[u8]) -> Self {
        const PREVIEW_LIMIT: usize = 512;
        let end = body.len().min(PREVIEW_LIMIT);
        Self::Status {
            method,
            url: url.into(),
            status,
            body: String::from_utf8_lossy(&body[..end]).into_owned(),
        }
    }

    /// Returns true if this is the not-modified sentinel.
    pub fn is_not_modified(&self) -> bool {
        matches!(self, Self::NotModified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::status("GET", "https://dg/config", 404, b"404 page not found");
        assert_eq!(
            err.to_string(),
            "unable to GET https://dg/config - HTTP_404: 404 page not found"
        );

        let err = Error::HandlerExit(123);
        assert_eq!(
            err.to_string(),
            "config handler requested agent exit with status 123"
        );
    }

    #[test]
    fn test_status_preview_is_bounded() {
        let body = vec![b'x'; 4096];
        if let Error::Status { body, .. } = Error::status("GET", "u", 500, &body) {
            assert_eq!(body.len(), 512);
        } else {
            panic!("wrong variant");
        }
    }

    #[test]
    fn test_is_not_modified() {
        assert!(Error::NotModified.is_not_modified());
        assert!(!Error::NoWritableConfig.is_not_modified());
    }
}
