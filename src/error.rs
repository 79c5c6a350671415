/// Errors that can occur while securing, storing or exchanging bundles.
#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum Error {
    /// The message is malformed, has the wrong version, targets an
    /// uninitialized session or skips too far ahead.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// The message counter was already consumed and no cached key remains.
    #[error("Duplicate message: {0}")]
    DuplicateMessage(String),

    /// The message authentication code did not match.
    #[error("MAC verification failed")]
    MacVerificationFailed,

    /// The counterparty presented an identity key we do not trust.
    #[error("Untrusted identity: {0}")]
    UntrustedIdentity(String),

    /// No session exists for the counterparty.
    #[error("No session for counterparty")]
    NoSession,

    /// A bundle is missing parts or is internally inconsistent.
    #[error("Malformed bundle: {0}")]
    BundleMalformed(String),

    /// A cryptographic primitive failed.
    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),

    /// Random number generation failed.
    #[error("Random number generation failed")]
    Random,

    /// Serialization or deserialization failed.
    #[error("Serialization/deserialization failed: {0}")]
    Serde(String),

    /// Disk I/O failed.
    #[error("I/O error: {0}")]
    Io(String),

    /// A network operation did not finish in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The exchange transport reported a failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A recency blob failed validation.
    #[error("Recency blob rejected: {0}")]
    RecencyRejected(String),
}

impl From<aes_gcm_siv::Error> for Error {
    fn from(value: aes_gcm_siv::Error) -> Self {
        Self::Crypto(value.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Serde(value.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(value: prost::DecodeError) -> Self {
        Self::Serde(value.to_string())
    }
}

impl Error {
    /// Whether the orchestrator may retry the failed operation on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Timeout(_) | Self::Transport(_))
    }
}
