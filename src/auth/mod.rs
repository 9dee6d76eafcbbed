//! Token validation.
//!
//! The hub only depends on the `AuthValidator` trait; `JwtValidator` is the
//! HS256 implementation used by the binary.

mod claims;
mod jwt;

use async_trait::async_trait;

pub use claims::Claims;
pub use jwt::JwtValidator;

#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,
    #[error("token expired")]
    Expired,
    #[error("invalid token: {0}")]
    Invalid(String),
}

/// Validates a bearer token presented at connection setup
#[async_trait]
pub trait AuthValidator: Send + Sync {
    async fn validate_token(&self, token: &str) -> Result<Claims, AuthError>;
}
