//! Credential verification collaborator.

use super::{Claims, VerifyError};

/// Verifies a bearer credential's signature and required claims.
///
/// Implementations perform no I/O; user lookup happens separately through
/// [`super::UserDirectory`].
#[cfg_attr(test, mockall::automock)]
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, credential: &str) -> Result<Claims, VerifyError>;
}
