use thiserror::Error;

/// The core error taxonomy, partitioned by audience (§7).
///
/// `EXTERNAL_*` variants are surfaced to the client and shape the accept
/// layer's HTTP status. `INTERNAL_*` variants never leak payload detail;
/// they are logged and either retried or fatal to the session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("EXTERNAL_NO_CREDITS")]
    ExternalNoCredits,
    #[error("EXTERNAL_BUFFER_OVERFLOW")]
    ExternalBufferOverflow,
    #[error("EXTERNAL_INVALID_AUTH")]
    ExternalInvalidAuth,

    #[error("INTERNAL_ENV_KEY_NOT_FOUND: {0}")]
    InternalEnvKeyNotFound(String),
    #[error("INTERNAL_ZMQ_NOT_CONNECTED")]
    InternalZmqNotConnected,
    #[error("INTERNAL_ZMQ_REQUEST_TIMEOUT")]
    InternalZmqRequestTimeout,
    #[error("INTERNAL_ZMQ_DESTROYED")]
    InternalZmqDestroyed,
    #[error("INTERNAL_ZMQ_INVALID_RESPONSE")]
    InternalZmqInvalidResponse,
    #[error("INTERNAL_ZMQ_NO_PENDING_REQUEST")]
    InternalZmqNoPendingRequest,
    #[error("INTERNAL_ZMQ_DECODE_FAILED")]
    InternalZmqDecodeFailed,
    #[error("INTERNAL_ERROR")]
    InternalError,
}

impl CoreError {
    /// The wire code carried in the response frame's error field.
    ///
    /// Unknown codes arriving from the wire map to `INTERNAL_ERROR` (§7
    /// propagation policy); this is the inverse, [`CoreError::from_wire_code`].
    pub fn wire_code(&self) -> &'static str {
        match self {
            CoreError::ExternalNoCredits => "EXTERNAL_NO_CREDITS",
            CoreError::ExternalBufferOverflow => "EXTERNAL_BUFFER_OVERFLOW",
            CoreError::ExternalInvalidAuth => "EXTERNAL_INVALID_AUTH",
            CoreError::InternalEnvKeyNotFound(_) => "INTERNAL_ENV_KEY_NOT_FOUND",
            CoreError::InternalZmqNotConnected => "INTERNAL_ZMQ_NOT_CONNECTED",
            CoreError::InternalZmqRequestTimeout => "INTERNAL_ZMQ_REQUEST_TIMEOUT",
            CoreError::InternalZmqDestroyed => "INTERNAL_ZMQ_DESTROYED",
            CoreError::InternalZmqInvalidResponse => "INTERNAL_ZMQ_INVALID_RESPONSE",
            CoreError::InternalZmqNoPendingRequest => "INTERNAL_ZMQ_NO_PENDING_REQUEST",
            CoreError::InternalZmqDecodeFailed => "INTERNAL_ZMQ_DECODE_FAILED",
            CoreError::InternalError => "INTERNAL_ERROR",
        }
    }

    pub fn from_wire_code(code: &str) -> Self {
        match code {
            "EXTERNAL_NO_CREDITS" => CoreError::ExternalNoCredits,
            "EXTERNAL_BUFFER_OVERFLOW" => CoreError::ExternalBufferOverflow,
            "EXTERNAL_INVALID_AUTH" => CoreError::ExternalInvalidAuth,
            "INTERNAL_ZMQ_NOT_CONNECTED" => CoreError::InternalZmqNotConnected,
            "INTERNAL_ZMQ_REQUEST_TIMEOUT" => CoreError::InternalZmqRequestTimeout,
            "INTERNAL_ZMQ_DESTROYED" => CoreError::InternalZmqDestroyed,
            "INTERNAL_ZMQ_INVALID_RESPONSE" => CoreError::InternalZmqInvalidResponse,
            "INTERNAL_ZMQ_NO_PENDING_REQUEST" => CoreError::InternalZmqNoPendingRequest,
            "INTERNAL_ZMQ_DECODE_FAILED" => CoreError::InternalZmqDecodeFailed,
            _ => CoreError::InternalError,
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(
            self,
            CoreError::ExternalNoCredits
                | CoreError::ExternalBufferOverflow
                | CoreError::ExternalInvalidAuth
        )
    }
}

/// Business-service wire error, returned in the `error` field of a
/// `VALIDATE_AND_LOAD` response (§4.7). Distinct from [`CoreError`]: these
/// are short codes produced by the Datastore's own validation logic rather
/// than the IPC transport taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusinessError {
    InvalidAuth,
    NoCredits,
    Internal,
}

impl BusinessError {
    pub fn wire_code(&self) -> &'static str {
        match self {
            BusinessError::InvalidAuth => "INVALID_AUTH",
            BusinessError::NoCredits => "NO_CREDITS",
            BusinessError::Internal => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for BusinessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_code())
    }
}
