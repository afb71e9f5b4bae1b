//! HS256 JWT credential verifier.
//!
//! The subject is read from `user_id` (string or number) and falls back to
//! the standard `sub` claim. Expiry and issued-at are checked against the
//! injected clock rather than the library's wall clock.

use std::{collections::HashSet, sync::Arc};

use irori_shared::time::Clock;
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind,
};
use serde::{Deserialize, Serialize};

use crate::domain::{Claims, CredentialVerifier, UserId, VerifyError};

/// Allowed clock skew for `iat`, in seconds.
const ISSUED_AT_LEEWAY_SECS: i64 = 60;

#[derive(Debug, Deserialize)]
struct TokenClaims {
    user_id: Option<serde_json::Value>,
    sub: Option<String>,
    exp: Option<i64>,
    iat: Option<i64>,
}

#[derive(Debug, Serialize)]
struct IssuedClaims<'a> {
    user_id: &'a str,
    iat: i64,
    exp: i64,
}

pub struct JwtCredentialVerifier {
    key: DecodingKey,
    validation: Validation,
    clock: Arc<dyn Clock>,
}

impl JwtCredentialVerifier {
    pub fn new(secret: &[u8], clock: Arc<dyn Clock>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
            clock,
        }
    }
}

impl CredentialVerifier for JwtCredentialVerifier {
    fn verify(&self, credential: &str) -> Result<Claims, VerifyError> {
        let data = decode::<TokenClaims>(credential, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::InvalidSignature => VerifyError::InvalidSignature,
                ErrorKind::ExpiredSignature => VerifyError::Expired,
                _ => VerifyError::Malformed,
            }
        })?;
        let token = data.claims;

        let subject = match (token.user_id, token.sub) {
            (Some(serde_json::Value::String(id)), _) => id,
            (Some(serde_json::Value::Number(id)), _) => id.to_string(),
            (None, Some(sub)) => sub,
            _ => return Err(VerifyError::MissingClaim("user_id")),
        };
        let subject = UserId::new(subject).map_err(|_| VerifyError::Malformed)?;
        let expires_at = token.exp.ok_or(VerifyError::MissingClaim("exp"))?;
        let issued_at = token.iat.unwrap_or(expires_at);

        let claims = Claims {
            subject,
            issued_at,
            expires_at,
        };
        let now_secs = self.clock.now_millis() / 1000;
        if claims.is_expired_at(now_secs) {
            return Err(VerifyError::Expired);
        }
        if token.iat.is_some_and(|iat| iat > now_secs + ISSUED_AT_LEEWAY_SECS) {
            return Err(VerifyError::IssuedInFuture);
        }
        Ok(claims)
    }
}

/// Issue an HS256 token for `user_id`, valid for `ttl_secs` from `issued_at`.
pub fn sign_token(
    secret: &[u8],
    user_id: &str,
    issued_at: i64,
    ttl_secs: i64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = IssuedClaims {
        user_id,
        iat: issued_at,
        exp: issued_at + ttl_secs,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret))
}
