//! Domain-level errors returned by value objects and collaborator traits.

use thiserror::Error;

/// Value object validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueObjectError {
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("{field} must be at most {max} characters")]
    TooLong { field: &'static str, max: usize },
    #[error("{0} contains invalid characters")]
    InvalidCharacter(&'static str),
}

/// Failure reported by the message store collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("room '{0}' not found")]
    RoomNotFound(String),
    #[error("message store unavailable: {0}")]
    Unavailable(String),
}

/// Failure reported by the user directory collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("user directory unavailable: {0}")]
    Unavailable(String),
}

/// Failure reported by the credential verifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("credential is malformed")]
    Malformed,
    #[error("credential has expired")]
    Expired,
    #[error("credential signature is invalid")]
    InvalidSignature,
    #[error("credential was issued in the future")]
    IssuedInFuture,
    #[error("credential is missing required claim '{0}'")]
    MissingClaim(&'static str),
}

/// Failure of the fan-out transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FanoutError {
    #[error("fan-out bus is closed")]
    Closed,
    #[error("fan-out transport unavailable: {0}")]
    Unavailable(String),
}

/// Failure to deliver a frame over a client transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,
    #[error("failed to send frame: {0}")]
    SendFailed(String),
}
