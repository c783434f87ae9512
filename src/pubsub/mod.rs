//! Broker bridge: publish/subscribe over in-memory or Redis backends.
//!
//! This module provides a trait [`PubSubBackend`] and two implementations:
//! [`InMemoryPubSub`] for local, in-process message passing, and [`RedisPubSub`]
//! (feature `redis-backend`) for talking to game servers in other processes.
//!
//! Every game has three channels, named by [`channels`]: actions flow from
//! gateways to the game server, events flow back to every joined session, and
//! control carries lifecycle commands. Order is preserved within one channel;
//! nothing is promised across channels.
//!
//! ## Example Usage
//! ```no_run
//! use briscola_gateway::pubsub::{channels, InMemoryPubSub, PubSubExt};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = InMemoryPubSub::new();
//!
//!     let sub = backend.subscribe(&channels::events("TEST01"), |bytes| async move {
//!         println!("event: {}", String::from_utf8_lossy(&bytes));
//!     }).await.unwrap();
//!
//!     backend.publish(&channels::events("TEST01"), &serde_json::json!({"message_type": "sync"})).await.unwrap();
//!     sub.stop().await;
//! }
//! ```

use crate::error::PubSubError;
use async_trait::async_trait;
use serde::Serialize;
use std::{future::Future, pin::Pin, time::Duration};
use tokio::{
  sync::{oneshot, watch},
  task::JoinHandle,
};

mod memory;
#[cfg(feature = "redis-backend")]
mod redis;

pub use memory::InMemoryPubSub;
#[cfg(feature = "redis-backend")]
pub use redis::{BackoffConfig, RedisPubSub};

/// Channel naming shared with the game servers.
pub mod channels {
  /// Lobby-wide control channel for creation requests not yet bound to a game.
  pub const GAMES_CONTROL: &str = "games.control";
  /// Creation results from game servers.
  pub const GAMES_CREATED: &str = "games.created";

  pub fn actions(game_id: &str) -> String {
    format!("game.{game_id}.actions")
  }

  pub fn events(game_id: &str) -> String {
    format!("game.{game_id}.events")
  }

  pub fn control(game_id: &str) -> String {
    format!("game.{game_id}.control")
  }
}

pub type MessageHandler = Box<dyn Fn(Vec<u8>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// How a subscription task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionExit {
  Running,
  /// Stopped on request, or the handle was dropped.
  Stopped,
  /// The backend gave up (e.g. reconnect budget exhausted).
  Failed,
}

/// A handle to a running subscription task.
///
/// You can `stop()` it gracefully (unsubscribe where supported), or use
/// `stop_within()` to abort it if it does not stop in time. Dropping the handle requests a graceful stop, so the
/// subscription is released however its owner goes away.
pub struct Subscription {
  topic: String,
  handle: Option<JoinHandle<()>>,
  stop_tx: Option<oneshot::Sender<()>>, // signals graceful shutdown
  exit: watch::Receiver<SubscriptionExit>,
}

impl Subscription {
  /// Spawn a backend receive loop. The loop must return once `stop_rx` resolves.
  pub(crate) fn spawn<F>(topic: &str, stop_tx: oneshot::Sender<()>, task: F) -> Self
  where
    F: Future<Output = SubscriptionExit> + Send + 'static,
  {
    let (exit_tx, exit) = watch::channel(SubscriptionExit::Running);
    let handle = tokio::spawn(async move {
      let outcome = task.await;
      let _ = exit_tx.send(outcome);
    });

    Self {
      topic: topic.to_string(),
      handle: Some(handle),
      stop_tx: Some(stop_tx),
      exit,
    }
  }

  /// Request a graceful stop. Waits until the underlying task exits.
  pub async fn stop(mut self) {
    if let Some(tx) = self.stop_tx.take() {
      let _ = tx.send(());
    }
    if let Some(handle) = self.handle.take() {
      let _ = handle.await;
    }
  }

  /// Request a graceful stop and wait at most `timeout` for it.
  ///
  /// Returns `false` if the task had to be aborted.
  pub async fn stop_within(mut self, timeout: Duration) -> bool {
    if let Some(tx) = self.stop_tx.take() {
      let _ = tx.send(());
    }
    let Some(mut handle) = self.handle.take() else {
      return true;
    };
    match tokio::time::timeout(timeout, &mut handle).await {
      Ok(_) => true,
      Err(_) => {
        tracing::warn!("Subscription to '{}' did not stop within {:?}, aborting", self.topic, timeout);
        handle.abort();
        false
      }
    }
  }

  /// Future resolving with the exit reason once the task ends.
  ///
  /// Independent of the handle, so it can be awaited from another task.
  pub fn exit_watch(&self) -> impl Future<Output = SubscriptionExit> + Send + 'static {
    let mut rx = self.exit.clone();
    async move {
      match rx.wait_for(|e| *e != SubscriptionExit::Running).await {
        Ok(exit) => *exit,
        // Sender dropped without reporting: the task was aborted.
        Err(_) => SubscriptionExit::Stopped,
      }
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(tx) = self.stop_tx.take() {
      let _ = tx.send(());
    }
  }
}

/// Trait implemented by all Pub/Sub backends.
///
/// All messages are serialized to `Vec<u8>` before sending, and handlers
/// receive the raw bytes to allow custom deserialization.
#[async_trait]
pub trait PubSubBackend: Send + Sync {
  /// Publish raw bytes to the given topic.
  ///
  /// ## Returns
  /// - `Ok(())` if the message was queued/sent.
  /// - `Err(PubSubError)` if the backend rejects it.
  async fn publish_bytes(&self, topic: &str, payload: Vec<u8>) -> Result<(), PubSubError>;

  /// Subscribe to a topic and invoke `handler` for each incoming message, in order.
  ///
  /// The handler runs on a spawned task; it should be lightweight or spawn its own work.
  ///
  /// ## Returns
  /// - `Ok(Subscription)` once the subscription is established. Call `Subscription::stop()`
  ///   or `Subscription::stop_within()` to end it.
  /// - `Err(PubSubError)` if the backend connection or subscription fails.
  async fn subscribe_bytes(&self, topic: &str, handler: MessageHandler) -> Result<Subscription, PubSubError>;

  /// Probe the transport.
  async fn health_check(&self) -> Result<(), PubSubError> {
    Ok(())
  }
}

/// Extension trait providing convenient generic methods for PubSubBackend.
#[async_trait]
pub trait PubSubExt: PubSubBackend {
  /// Publish a serializable message to the given topic.
  async fn publish<T: Serialize + Send + Sync>(&self, topic: &str, msg: &T) -> Result<(), PubSubError> {
    let payload = serde_json::to_vec(msg)?;
    self.publish_bytes(topic, payload).await
  }

  /// Subscribe to a topic with an async closure.
  async fn subscribe<F, Fut>(&self, topic: &str, handler: F) -> Result<Subscription, PubSubError>
  where
    F: Fn(Vec<u8>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    self
      .subscribe_bytes(topic, Box::new(move |bytes| Box::pin(handler(bytes))))
      .await
  }
}

// Blanket implementation
impl<T: PubSubBackend + ?Sized> PubSubExt for T {}
