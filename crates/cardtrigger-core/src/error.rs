use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    // Policy errors
    #[error("invalid event flags {value:?}: unknown token {token:?}")]
    InvalidEventFlags { value: String, token: String },

    #[error("action {target:?} for subject {subject:?} is missing require_pin")]
    MissingRequirePin { subject: String, target: String },

    #[error("certificate entry has an empty subject")]
    EmptySubject,

    #[error("action for subject {subject:?} has an empty target")]
    EmptyTarget { subject: String },

    // Card type errors
    #[error("invalid ATR for card type {name:?}: {message}")]
    InvalidAtr { name: String, message: String },

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Error {
    /// Create a new event flag decoding error.
    pub fn invalid_event_flags(value: impl Into<String>, token: impl Into<String>) -> Self {
        Self::InvalidEventFlags {
            value: value.into(),
            token: token.into(),
        }
    }

    /// Create a new ATR error for the named card type.
    pub fn invalid_atr(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidAtr {
            name: name.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
