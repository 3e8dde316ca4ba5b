//! Token verification: the yes/no gate every connection passes once.
//!
//! The relay only needs to know whether a token is acceptable and, if not,
//! a reason it can show the client.

use std::sync::Arc;

use elowen_config::AuthConfig;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;

/// Outcome of verifying a connection token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Token accepted.
    Verified {
        /// `sub` claim, when the token carries one.
        subject: Option<String>,
    },
    /// Token refused.
    Rejected {
        /// Human-readable reason, sent to the client as-is.
        reason: String,
    },
}

impl Verification {
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified { .. })
    }

    fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}

/// Verifies the token a client presents when connecting.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: Option<&str>) -> Verification;

    /// Verifier name for logging.
    fn name(&self) -> &str;
}

/// HS256 JSON Web Token verifier.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: Option<String>,
}

impl JwtVerifier {
    pub fn new(secret: &str, leeway_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = leeway_secs;
        // Tokens without `exp` are accepted; an `exp` that is present is enforced.
        validation.set_required_spec_claims::<&str>(&[]);

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: Option<&str>) -> Verification {
        let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) else {
            return Verification::rejected("No token provided");
        };

        match decode::<Claims>(token, &self.key, &self.validation) {
            Ok(data) => Verification::Verified {
                subject: data.claims.sub,
            },
            Err(e) => {
                tracing::debug!(error = %e, "Token rejected");
                match e.kind() {
                    ErrorKind::ExpiredSignature => Verification::rejected("Token has expired"),
                    _ => Verification::rejected("Invalid token"),
                }
            }
        }
    }

    fn name(&self) -> &str {
        "jwt"
    }
}

/// Admits every connection. Used when `auth.require_auth = false`.
pub struct AllowAll;

impl TokenVerifier for AllowAll {
    fn verify(&self, _token: Option<&str>) -> Verification {
        Verification::Verified { subject: None }
    }

    fn name(&self) -> &str {
        "allow_all"
    }
}

/// Security setup errors.
#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("auth.require_auth is set but no JWT secret is configured (set auth.jwt_secret or JWT_SECRET)")]
    MissingSecret,
}

/// Build the verifier the `[auth]` section asks for.
pub fn verifier_from_config(config: &AuthConfig) -> Result<Arc<dyn TokenVerifier>, SecurityError> {
    if !config.require_auth {
        tracing::warn!("Authentication disabled: every connection will be admitted");
        return Ok(Arc::new(AllowAll));
    }

    match config.jwt_secret.as_deref().filter(|s| !s.is_empty()) {
        Some(secret) => Ok(Arc::new(JwtVerifier::new(secret, config.leeway_secs))),
        None => Err(SecurityError::MissingSecret),
    }
}
