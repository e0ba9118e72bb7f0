//! Operator bearer tokens
//!
//! Tokens are EdDSA-signed JWTs carrying [`OperatorClaims`]. Keys are ed25519
//! and exchanged as hex. Only holders of the role [`OPERATOR_ROLE`] may call
//! the management API.

use chrono::Utc;
use ed25519_dalek::pkcs8::EncodePrivateKey;
use ed25519_dalek::{SigningKey, VerifyingKey};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Role allowed to manage tenant registrations
pub const OPERATOR_ROLE: &str = "operator";

/// Authentication and authorization failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("malformed bearer token: {0}")]
    Malformed(String),

    #[error("token signature does not verify")]
    BadSignature,

    #[error("token expired")]
    Expired,

    #[error("role '{0}' may not manage tenants")]
    Forbidden(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

impl AuthError {
    /// Check if the caller was identified but lacks the role
    #[inline]
    #[must_use]
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Forbidden(_))
    }
}

/// Claims carried by a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorClaims {
    /// Who the token was issued to
    pub sub: String,
    pub role: String,
    /// Expiry, seconds since the Unix epoch
    pub exp: i64,
}

impl OperatorClaims {
    /// Operator claims for `sub` valid for `ttl_secs`
    #[must_use]
    pub fn operator(sub: impl Into<String>, ttl_secs: i64) -> Self {
        Self {
            sub: sub.into(),
            role: OPERATOR_ROLE.to_string(),
            exp: Utc::now().timestamp() + ttl_secs,
        }
    }
}

/// Fresh signing key
#[must_use]
pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Parse a hex-encoded 32-byte signing key
pub fn signing_key_from_hex(encoded: &str) -> Result<SigningKey, AuthError> {
    Ok(SigningKey::from_bytes(&key_bytes(encoded)?))
}

/// Parse a hex-encoded 32-byte verifying key
pub fn verifying_key_from_hex(encoded: &str) -> Result<VerifyingKey, AuthError> {
    VerifyingKey::from_bytes(&key_bytes(encoded)?).map_err(|e| AuthError::InvalidKey(e.to_string()))
}

fn key_bytes(encoded: &str) -> Result<[u8; 32], AuthError> {
    let bytes = hex::decode(encoded.trim()).map_err(|e| AuthError::InvalidKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| AuthError::InvalidKey(format!("expected 32 bytes, got {}", b.len())))
}

/// Sign `claims` into a bearer token
pub fn issue_token(key: &SigningKey, claims: &OperatorClaims) -> Result<String, AuthError> {
    let der = key
        .to_pkcs8_der()
        .map_err(|e| AuthError::InvalidKey(e.to_string()))?;
    jsonwebtoken::encode(
        &Header::new(Algorithm::EdDSA),
        claims,
        &EncodingKey::from_ed_der(der.as_bytes()),
    )
    .map_err(|e| AuthError::InvalidKey(e.to_string()))
}

/// Verifies bearer tokens against the operator public key
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("validation", &self.validation)
            .finish_non_exhaustive()
    }
}

impl TokenVerifier {
    /// Create verifier
    #[must_use]
    pub fn new(key: VerifyingKey) -> Self {
        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            key: DecodingKey::from_ed_der(key.as_bytes()),
            validation,
        }
    }

    /// Verify signature and expiry
    pub fn verify(&self, token: &str) -> Result<OperatorClaims, AuthError> {
        jsonwebtoken::decode::<OperatorClaims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => AuthError::BadSignature,
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Malformed(e.to_string()),
            })
    }

    /// Authorize an `Authorization` header value for tenant management
    pub fn authorize(&self, header: Option<&str>) -> Result<OperatorClaims, AuthError> {
        let token = header
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;
        let claims = self.verify(token)?;
        if claims.role != OPERATOR_ROLE {
            return Err(AuthError::Forbidden(claims.role));
        }
        Ok(claims)
    }
}
