//! Agent authentication
//!
//! The control listener hands every agent's `Hello` to an
//! [`AgentAuthenticator`] before any gate is allocated.

pub mod jwt;

pub use jwt::{AgentClaims, JwtAuthenticator, JwtError};

use async_trait::async_trait;
use thiserror::Error;

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token expired")]
    TokenExpired,

    #[error("Token issued for {token_subject}, not {agent_id}")]
    SubjectMismatch {
        agent_id: String,
        token_subject: String,
    },

    #[error("Invalid agent id: {0:?}")]
    InvalidAgentId(String),
}

/// Decides whether an agent may open a tunnel
#[async_trait]
pub trait AgentAuthenticator: Send + Sync {
    async fn authenticate(&self, agent_id: &str, token: &str) -> Result<(), AuthError>;
}

/// Accepts every agent; for single-user and development deployments
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllAuthenticator;

#[async_trait]
impl AgentAuthenticator for AllowAllAuthenticator {
    async fn authenticate(&self, agent_id: &str, _token: &str) -> Result<(), AuthError> {
        if agent_id.is_empty() {
            return Err(AuthError::InvalidAgentId(agent_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allow_all() {
        assert!(AllowAllAuthenticator.authenticate("foo", "").await.is_ok());
        assert!(matches!(
            AllowAllAuthenticator.authenticate("", "").await,
            Err(AuthError::InvalidAgentId(_))
        ));
    }
}
