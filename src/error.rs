#[cfg(feature = "redis-backend")]
use redis::RedisError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PubSubError {
  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[cfg(feature = "redis-backend")]
  #[error("Backend error: {0}")]
  Backend(#[from] RedisError),

  #[error("No active subscribers for topic '{0}'")]
  NoSubscribers(String),

  #[error("Broker connection closed: {0}")]
  Closed(String),
}

/// Failures of capability token minting or validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
  #[error("token expired")]
  Expired,

  #[error("malformed token: {0}")]
  Malformed(String),

  #[error("token is for game '{claimed}', not '{expected}'")]
  GameMismatch { expected: String, claimed: String },

  #[error("invalid token request: {0}")]
  InvalidRequest(String),
}

/// Error codes carried in the `code` field of an `action.result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
  Unauthorized,
  JoinFailed,
  Forbidden,
  InvalidAction,
  DuplicateConnectionHandled,
  BrokerUnavailable,
  RateLimited,
}

impl ErrorCode {
  pub fn as_str(&self) -> &'static str {
    match self {
      ErrorCode::Unauthorized => "unauthorized",
      ErrorCode::JoinFailed => "join_failed",
      ErrorCode::Forbidden => "forbidden",
      ErrorCode::InvalidAction => "invalid_action",
      ErrorCode::DuplicateConnectionHandled => "duplicate_connection_handled",
      ErrorCode::BrokerUnavailable => "broker_unavailable",
      ErrorCode::RateLimited => "rate_limited",
    }
  }
}

impl std::fmt::Display for ErrorCode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A rejected client request, reported back as `action.result{status: error}`.
///
/// None of these are fatal to the connection that caused them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
  #[error("{0}")]
  Unauthorized(#[from] AuthError),

  #[error("join failed: {0}")]
  JoinFailed(String),

  #[error("forbidden: {0}")]
  Forbidden(String),

  #[error("invalid action: {0}")]
  InvalidAction(String),

  #[error("broker unavailable: {0}")]
  BrokerUnavailable(String),

  #[error("rate limited: {0}")]
  RateLimited(String),
}

impl GatewayError {
  pub fn code(&self) -> ErrorCode {
    match self {
      GatewayError::Unauthorized(_) => ErrorCode::Unauthorized,
      GatewayError::JoinFailed(_) => ErrorCode::JoinFailed,
      GatewayError::Forbidden(_) => ErrorCode::Forbidden,
      GatewayError::InvalidAction(_) => ErrorCode::InvalidAction,
      GatewayError::BrokerUnavailable(_) => ErrorCode::BrokerUnavailable,
      GatewayError::RateLimited(_) => ErrorCode::RateLimited,
    }
  }

  /// Human readable reason, without the code prefix.
  pub fn reason(&self) -> String {
    match self {
      GatewayError::Unauthorized(e) => e.to_string(),
      GatewayError::JoinFailed(r)
      | GatewayError::Forbidden(r)
      | GatewayError::InvalidAction(r)
      | GatewayError::BrokerUnavailable(r)
      | GatewayError::RateLimited(r) => r.clone(),
    }
  }
}

impl From<PubSubError> for GatewayError {
  fn from(e: PubSubError) -> Self {
    GatewayError::BrokerUnavailable(e.to_string())
  }
}
