//! # Error Definitions
//!
//! Failures raised while building, encoding or decoding envelopes.

use crate::envelope::Role;

/// Envelope construction and protocol failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A non-reply envelope was built without an action tag.
    MissingAction,
    /// An envelope named its own sender as the destination.
    SelfAddressed(Role),
    /// The frame was well-formed JSON but broke the envelope rules
    /// (e.g., neither an action nor a reply id).
    ProtocolViolation(String),
    /// The frame could not be serialized or parsed.
    Serialization(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingAction => write!(f, "non-reply envelope has no action"),
            Self::SelfAddressed(role) => write!(f, "envelope addressed to its own sender '{}'", role),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Self::Serialization(msg) => write!(f, "serialization error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// A specialized Result type for envelope operations.
pub type Result<T> = std::result::Result<T, Error>;
