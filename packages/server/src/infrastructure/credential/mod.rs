//! CredentialVerifier 実装

pub mod jwt;

pub use jwt::{JwtCredentialVerifier, sign_token};
