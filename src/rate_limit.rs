//! Inbound frame limits per connection.

use crate::{error::GatewayError, registry::ConnectionId};
use std::{
  collections::{HashMap, VecDeque},
  sync::Arc,
  time::{Duration, Instant},
};
use thiserror::Error;
use tokio::sync::RwLock;

/// Configuration for rate limiting.
#[derive(Debug, Clone)]
pub struct MessageLimits {
  /// Maximum frame size in bytes
  pub max_size_bytes: usize,
  /// Maximum frames per time window
  pub max_messages_per_window: u32,
  /// Time window for rate limiting
  pub window_duration: Duration,
  /// How long a connection stays muted after exceeding the limit
  pub ban_duration: Duration,
}

impl Default for MessageLimits {
  fn default() -> Self {
    Self {
      max_size_bytes: 64 * 1024, // 64 KB
      max_messages_per_window: 20,
      window_duration: Duration::from_secs(1),
      ban_duration: Duration::from_secs(10),
    }
  }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RateLimitError {
  #[error("message too large: {size} bytes (max {max})")]
  TooLarge { size: usize, max: usize },

  #[error("rate limit exceeded: max {max} messages per {window:?}")]
  Exceeded { max: u32, window: Duration },

  #[error("temporarily muted for sending too many messages")]
  Banned,
}

impl From<RateLimitError> for GatewayError {
  fn from(e: RateLimitError) -> Self {
    GatewayError::RateLimited(e.to_string())
  }
}

#[derive(Debug, Default)]
struct ConnectionRateState {
  message_times: VecDeque<Instant>,
  banned_until: Option<Instant>,
}

impl ConnectionRateState {
  fn is_banned(&self, now: Instant) -> bool {
    self.banned_until.is_some_and(|until| now < until)
  }

  fn clean_old_messages(&mut self, now: Instant, window: Duration) {
    while let Some(&oldest) = self.message_times.front() {
      if now.duration_since(oldest) >= window {
        self.message_times.pop_front();
      } else {
        break;
      }
    }
  }
}

/// Sliding-window limiter shared by all sessions.
#[derive(Clone)]
pub struct RateLimiter {
  limits: MessageLimits,
  states: Arc<RwLock<HashMap<ConnectionId, ConnectionRateState>>>,
}

impl RateLimiter {
  pub fn new(limits: MessageLimits) -> Self {
    Self {
      limits,
      states: Arc::new(RwLock::new(HashMap::new())),
    }
  }

  /// Check whether a connection may send a frame of `message_size` bytes.
  pub async fn check_allowed(&self, id: ConnectionId, message_size: usize) -> Result<(), RateLimitError> {
    if message_size > self.limits.max_size_bytes {
      return Err(RateLimitError::TooLarge {
        size: message_size,
        max: self.limits.max_size_bytes,
      });
    }

    let now = Instant::now();
    let mut states = self.states.write().await;
    let state = states.entry(id).or_default();

    if state.is_banned(now) {
      return Err(RateLimitError::Banned);
    }

    state.clean_old_messages(now, self.limits.window_duration);

    if state.message_times.len() >= self.limits.max_messages_per_window as usize {
      state.banned_until = Some(now + self.limits.ban_duration);
      tracing::warn!("Connection {} exceeded rate limit and was muted", id);
      return Err(RateLimitError::Exceeded {
        max: self.limits.max_messages_per_window,
        window: self.limits.window_duration,
      });
    }

    state.message_times.push_back(now);
    Ok(())
  }

  /// Drop all state for a connection that went away.
  pub async fn forget(&self, id: ConnectionId) {
    self.states.write().await.remove(&id);
  }

  pub async fn is_banned(&self, id: ConnectionId) -> bool {
    let states = self.states.read().await;
    states.get(&id).is_some_and(|s| s.is_banned(Instant::now()))
  }
}
