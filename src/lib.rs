//! Real-time gateway between browser clients and briscola game servers.
//!
//! Clients connect over a WebSocket, join a game with a signed capability
//! token, and from then on their actions are published to the game's action
//! channel while the game's events are forwarded back to them. At most one
//! connection owns a seat at a time; a newer connection takes the seat over
//! and the older one is told so and closed.

pub mod auth;
pub mod config;
pub mod error;
pub mod matchmaking;
pub mod protocol;
pub mod pubsub;
pub mod rate_limit;
pub mod registry;
pub mod server;
pub mod session;

pub use auth::{Claims, Role, TokenIssuer};
pub use config::GatewayConfig;
pub use error::{AuthError, ErrorCode, GatewayError, PubSubError};
pub use pubsub::{InMemoryPubSub, PubSubBackend, PubSubExt};
#[cfg(feature = "redis-backend")]
pub use pubsub::RedisPubSub;
pub use server::Server;
pub use session::{Gateway, Session};

use anyhow::Context;
use rate_limit::MessageLimits;
use std::{sync::Arc, time::Duration};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn broker(config: &GatewayConfig) -> anyhow::Result<Arc<dyn PubSubBackend>> {
  match &config.redis_url {
    #[cfg(feature = "redis-backend")]
    Some(url) => {
      info!("Using Redis broker");
      Ok(Arc::new(RedisPubSub::new(url).context("invalid REDIS_URL")?))
    }
    #[cfg(not(feature = "redis-backend"))]
    Some(_) => {
      tracing::warn!("REDIS_URL is set but the redis-backend feature is off, using the in-memory broker");
      Ok(Arc::new(InMemoryPubSub::new()))
    }
    None => {
      info!("Using in-memory broker");
      Ok(Arc::new(InMemoryPubSub::new()))
    }
  }
}

/// Build the gateway dependencies described by `config`.
pub fn gateway(config: &GatewayConfig) -> anyhow::Result<Gateway> {
  let limits = MessageLimits {
    max_size_bytes: config.max_message_bytes,
    max_messages_per_window: config.max_messages_per_second,
    window_duration: Duration::from_secs(1),
    ..MessageLimits::default()
  };
  Ok(
    Gateway::new(TokenIssuer::new(&config.secret_key), broker(config)?)
      .with_limits(limits)
      .with_forwarder_stop_timeout(config.forwarder_stop_timeout),
  )
}

/// Initialise logging, load configuration and serve until failure.
pub async fn run() -> anyhow::Result<()> {
  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
          "{}=debug,tower_http=debug,axum::rejection=trace",
          env!("CARGO_CRATE_NAME")
        )
        .into()
      }),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();

  let config = GatewayConfig::from_env().context("failed to load configuration")?;
  let server = Server::new(gateway(&config)?)
    .with_default_ttl_minutes(config.default_token_ttl_minutes)
    .with_cors(config.cors_allowed_origins.clone());

  server.listen(&config.addr()).await
}
