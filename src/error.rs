use thiserror::Error;

/// Main error type for the toolpilot engine
#[derive(Error, Debug)]
pub enum PilotError {
    #[error("invalid execution record: {message}")]
    InvalidRecord { message: String },

    #[error("storage error: {source}")]
    Storage {
        #[from]
        source: rusqlite::Error,
    },

    #[error("serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("session already finalized: {session_id}")]
    SessionFinalized { session_id: String },

    #[error("unknown session: {session_id}")]
    UnknownSession { session_id: String },

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("{0}")]
    Other(String),
}

impl PilotError {
    /// Create a new invalid record error
    pub fn invalid_record(message: impl Into<String>) -> Self {
        Self::InvalidRecord {
            message: message.into(),
        }
    }

    /// Create a new finalized-session state error
    pub fn session_finalized(session_id: impl Into<String>) -> Self {
        Self::SessionFinalized {
            session_id: session_id.into(),
        }
    }

    /// Create a new unknown-session state error
    pub fn unknown_session(session_id: impl Into<String>) -> Self {
        Self::UnknownSession {
            session_id: session_id.into(),
        }
    }

    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Whether this error signals an illegal session-state transition
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            Self::SessionFinalized { .. } | Self::UnknownSession { .. }
        )
    }
}

impl From<toml::de::Error> for PilotError {
    fn from(error: toml::de::Error) -> Self {
        PilotError::config(error.to_string())
    }
}

/// Result type alias using PilotError
pub type PilotResult<T> = Result<T, PilotError>;
