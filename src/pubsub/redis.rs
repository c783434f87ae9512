//! Redis Pub/Sub implementation with automatic reconnection.

use super::{MessageHandler, PubSubBackend, Subscription, SubscriptionExit};
use crate::error::PubSubError;
use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, Client};
use tokio::sync::{oneshot, oneshot::error::TryRecvError};
use tokio_stream::StreamExt;

const BASE_DELAY_MS: u64 = 100;
const MAX_DELAY_MS: u64 = 5_000;
const MAX_EXPONENT: u32 = 6;
const JITTER_RANGE: u64 = 50;

#[derive(Clone, Debug)]
pub struct BackoffConfig {
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
  pub max_exponent: u32,
  pub jitter_range: u64,
  pub max_retries: u32,
}

impl Default for BackoffConfig {
  fn default() -> Self {
    Self {
      base_delay_ms: BASE_DELAY_MS,
      max_delay_ms: MAX_DELAY_MS,
      max_exponent: MAX_EXPONENT,
      jitter_range: JITTER_RANGE,
      max_retries: 10,
    }
  }
}

impl BackoffConfig {
  fn delay(&self, attempt: u32) -> std::time::Duration {
    let exp = attempt.min(self.max_exponent);
    let base_ms = self.base_delay_ms.saturating_mul(2u64.saturating_pow(exp));
    let jitter_ms = (attempt as u64 % self.jitter_range.max(1)) + 1;
    std::time::Duration::from_millis((base_ms + jitter_ms).min(self.max_delay_ms))
  }
}

/// Redis-backed Pub/Sub for talking to game servers in other processes.
///
/// Publishing opens a multiplexed connection per call. Every subscription
/// owns a dedicated `PUBSUB` connection and reconnects with exponential
/// backoff; once `max_retries` consecutive attempts fail the
/// subscription ends with [`SubscriptionExit::Failed`].
#[derive(Clone)]
pub struct RedisPubSub {
  client: Client,
  backoff_config: BackoffConfig,
}

impl RedisPubSub {
  /// Create a new Redis backend from a connection string.
  ///
  /// Example: `RedisPubSub::new("redis://127.0.0.1/")?`
  pub fn new(addr: &str) -> Result<Self, PubSubError> {
    Self::with_config(addr, BackoffConfig::default())
  }

  /// Create a new Redis backend from a connection string and configuration.
  pub fn with_config(addr: &str, config: BackoffConfig) -> Result<Self, PubSubError> {
    Ok(Self {
      client: Client::open(addr)?,
      backoff_config: config,
    })
  }

  async fn connection(&self) -> Result<MultiplexedConnection, PubSubError> {
    Ok(self.client.get_multiplexed_tokio_connection().await?)
  }
}

fn stop_requested(stop_rx: &mut oneshot::Receiver<()>) -> bool {
  !matches!(stop_rx.try_recv(), Err(TryRecvError::Empty))
}

#[async_trait]
impl PubSubBackend for RedisPubSub {
  async fn publish_bytes(&self, topic: &str, payload: Vec<u8>) -> Result<(), PubSubError> {
    let mut conn = self.connection().await?;
    redis::AsyncCommands::publish::<&str, Vec<u8>, ()>(&mut conn, topic, payload).await?;
    Ok(())
  }

  async fn subscribe_bytes(&self, topic: &str, handler: MessageHandler) -> Result<Subscription, PubSubError> {
    // Establish the first subscription eagerly so callers see setup failures.
    let mut first = self.client.get_async_pubsub().await?;
    first.subscribe(topic).await?;

    let client = self.client.clone();
    let name = topic.to_string();
    let cfg = self.backoff_config.clone();
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    Ok(Subscription::spawn(topic, stop_tx, async move {
      let mut attempt: u32 = 0;
      let mut pending = Some(first);

      loop {
        if stop_requested(&mut stop_rx) {
          tracing::debug!("Redis subscription for '{name}' stopped gracefully");
          return SubscriptionExit::Stopped;
        }

        let pubsub = match pending.take() {
          Some(pubsub) => Ok(pubsub),
          None => match client.get_async_pubsub().await {
            Ok(mut pubsub) => match pubsub.subscribe(&name).await {
              Ok(()) => Ok(pubsub),
              Err(e) => Err(e),
            },
            Err(e) => Err(e),
          },
        };

        match pubsub {
          Ok(mut pubsub) => {
            attempt = 0;
            tracing::info!("Subscribed to Redis topic '{name}'");
            let mut stream = pubsub.on_message();
            let should_stop = loop {
              tokio::select! {
                msg_opt = stream.next() => {
                  match msg_opt {
                    Some(msg) => match msg.get_payload::<Vec<u8>>() {
                      Ok(payload) => {
                        let delivery = handler(payload);
                        delivery.await;
                      }
                      Err(e) => tracing::error!("Redis payload decode error on '{name}': {e}"),
                    },
                    None => {
                      tracing::warn!("Redis pubsub stream ended for '{name}', will reconnect");
                      break false;
                    }
                  }
                }
                _ = &mut stop_rx => {
                  tracing::debug!("Gracefully stopping Redis subscription for '{name}'");
                  break true;
                }
              }
            };

            // Drop stream to release borrow before calling unsubscribe
            drop(stream);

            if should_stop {
              let _ = pubsub.unsubscribe(&name).await;
              return SubscriptionExit::Stopped;
            }
          }
          Err(e) => {
            tracing::error!("Redis subscribe failed for '{name}': {e}. Retrying");
            attempt += 1;
          }
        }

        if attempt >= cfg.max_retries {
          tracing::error!(
            "Redis pubsub: exceeded max retries ({}) for topic '{}', giving up",
            cfg.max_retries,
            name
          );
          return SubscriptionExit::Failed;
        }

        tokio::select! {
          _ = tokio::time::sleep(cfg.delay(attempt)) => {}
          _ = &mut stop_rx => return SubscriptionExit::Stopped,
        }
      }
    }))
  }

  async fn health_check(&self) -> Result<(), PubSubError> {
    let mut conn = self.connection().await?;
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    Ok(())
  }
}
