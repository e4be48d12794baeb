//! JWT (JSON Web Token) handling

use crate::{AgentAuthenticator, AuthError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_ISSUER: &str = "rssh";

/// JWT claims carried by an agent token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentClaims {
    /// Subject (agent ID)
    pub sub: String,
    /// Issued at (timestamp)
    pub iat: i64,
    /// Expiration time (timestamp)
    pub exp: i64,
    pub iss: String,
}

impl AgentClaims {
    pub fn new(agent_id: impl Into<String>, validity: Duration) -> Self {
        let now = Utc::now();
        Self {
            sub: agent_id.into(),
            iat: now.timestamp(),
            exp: (now + validity).timestamp(),
            iss: DEFAULT_ISSUER.to_string(),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }

    pub fn exp_formatted(&self) -> String {
        let dt = DateTime::<Utc>::from_timestamp(self.exp, 0).unwrap_or_else(Utc::now);
        let local: DateTime<Local> = dt.into();
        local.format("%Y-%m-%d %H:%M:%S %Z").to_string()
    }
}

/// JWT errors
#[derive(Debug, Error)]
pub enum JwtError {
    #[error("JWT encoding error: {0}")]
    EncodingError(#[from] jsonwebtoken::errors::Error),

    #[error("Token expired")]
    TokenExpired,
}

/// Validates HS256 agent tokens signed with a shared secret
pub struct JwtAuthenticator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    /// Validates the signature and expiration only
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.validate_nbf = false;

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn validate(&self, token: &str) -> Result<AgentClaims, JwtError> {
        let token_data = decode::<AgentClaims>(token, &self.decoding_key, &self.validation)?;

        if token_data.claims.is_expired() {
            return Err(JwtError::TokenExpired);
        }

        Ok(token_data.claims)
    }

    /// Encode claims using HMAC-SHA256
    pub fn encode(secret: &[u8], claims: &AgentClaims) -> Result<String, JwtError> {
        let header = Header::new(Algorithm::HS256);
        let encoding_key = EncodingKey::from_secret(secret);

        Ok(encode(&header, claims, &encoding_key)?)
    }

    /// Issue a token for `agent_id` valid for `validity`
    pub fn generate_token(
        secret: &[u8],
        agent_id: &str,
        validity: Duration,
    ) -> Result<String, JwtError> {
        Self::encode(secret, &AgentClaims::new(agent_id, validity))
    }
}

#[async_trait]
impl AgentAuthenticator for JwtAuthenticator {
    async fn authenticate(&self, agent_id: &str, token: &str) -> Result<(), AuthError> {
        let claims = self.validate(token).map_err(|e| match e {
            JwtError::TokenExpired => AuthError::TokenExpired,
            JwtError::EncodingError(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            },
        })?;

        if claims.sub != agent_id {
            return Err(AuthError::SubjectMismatch {
                agent_id: agent_id.to_string(),
                token_subject: claims.sub,
            });
        }

        debug!(
            "Authenticated agent {} (token expires {})",
            agent_id,
            claims.exp_formatted()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-secret";

    #[tokio::test]
    async fn test_valid_token() {
        let token = JwtAuthenticator::generate_token(SECRET, "foo", Duration::hours(1)).unwrap();
        let auth = JwtAuthenticator::new(SECRET);

        assert!(auth.authenticate("foo", &token).await.is_ok());
        assert_eq!(auth.validate(&token).unwrap().sub, "foo");
    }

    #[tokio::test]
    async fn test_token_for_other_agent() {
        let token = JwtAuthenticator::generate_token(SECRET, "foo", Duration::hours(1)).unwrap();
        let auth = JwtAuthenticator::new(SECRET);

        assert!(matches!(
            auth.authenticate("bar", &token).await,
            Err(AuthError::SubjectMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_wrong_secret() {
        let token = JwtAuthenticator::generate_token(b"other", "foo", Duration::hours(1)).unwrap();
        let auth = JwtAuthenticator::new(SECRET);

        assert!(matches!(
            auth.authenticate("foo", &token).await,
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_token() {
        let token =
            JwtAuthenticator::generate_token(SECRET, "foo", Duration::hours(-2)).unwrap();
        let auth = JwtAuthenticator::new(SECRET);

        assert!(matches!(
            auth.authenticate("foo", &token).await,
            Err(AuthError::TokenExpired)
        ));
    }

    #[tokio::test]
    async fn test_garbage_token() {
        let auth = JwtAuthenticator::new(SECRET);
        assert!(auth.authenticate("foo", "not-a-jwt").await.is_err());
    }
}
