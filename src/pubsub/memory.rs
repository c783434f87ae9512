//! In-memory Pub/Sub implementation using Tokio broadcast channels.

use super::{MessageHandler, PubSubBackend, Subscription, SubscriptionExit};
use crate::error::PubSubError;
use async_trait::async_trait;
use std::{
  collections::HashMap,
  sync::{Arc, Mutex},
};
use tokio::sync::{broadcast, oneshot};

/// In-memory Pub/Sub using a Tokio `broadcast` channel per topic.
///
/// Best for a single-process deployment and for tests. Each topic has a
/// fixed-size ring buffer; a subscriber that falls more than `buffer` messages
/// behind loses the oldest ones.
#[derive(Clone)]
pub struct InMemoryPubSub {
  topics: Arc<Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>>,
  buffer: usize,
}

impl InMemoryPubSub {
  /// Create a new in-memory backend with a default per-topic buffer of 256 messages.
  pub fn new() -> Self {
    Self::with_buffer(256)
  }

  /// Create with a custom buffer size. Minimum size is 1.
  pub fn with_buffer(buffer: usize) -> Self {
    Self {
      topics: Arc::new(Mutex::new(HashMap::new())),
      buffer: buffer.max(1),
    }
  }

  /// Subscribe to a topic, creating its channel if needed.
  fn receiver(&self, topic: &str) -> TopicReceiver {
    let mut map = self.topics.lock().expect("InMemoryPubSub lock poisoned");
    let rx = map
      .entry(topic.to_string())
      .or_insert_with(|| {
        let (tx, _rx) = broadcast::channel(self.buffer);
        tx
      })
      .subscribe();
    TopicReceiver {
      rx: Some(rx),
      topics: self.topics.clone(),
      topic: topic.to_string(),
    }
  }

  /// Sender for a topic that has at least one subscriber.
  fn live_sender(&self, topic: &str) -> Option<broadcast::Sender<Vec<u8>>> {
    let map = self.topics.lock().expect("InMemoryPubSub lock poisoned");
    map.get(topic).filter(|tx| tx.receiver_count() > 0).cloned()
  }

  /// Number of live subscriptions on a topic.
  pub fn subscriber_count(&self, topic: &str) -> usize {
    let map = self.topics.lock().expect("InMemoryPubSub lock poisoned");
    map.get(topic).map_or(0, |tx| tx.receiver_count())
  }

  /// Number of topics with a channel allocated.
  pub fn topic_count(&self) -> usize {
    self.topics.lock().expect("InMemoryPubSub lock poisoned").len()
  }
}

/// Receiver that removes its topic's channel once the last subscriber is gone.
///
/// Runs on every exit of the subscription task, abort included.
struct TopicReceiver {
  rx: Option<broadcast::Receiver<Vec<u8>>>,
  topics: Arc<Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>>,
  topic: String,
}

impl TopicReceiver {
  async fn recv(&mut self) -> Result<Vec<u8>, broadcast::error::RecvError> {
    match self.rx.as_mut() {
      Some(rx) => rx.recv().await,
      None => Err(broadcast::error::RecvError::Closed),
    }
  }
}

impl Drop for TopicReceiver {
  fn drop(&mut self) {
    // The receiver must be gone before the count is read.
    drop(self.rx.take());
    let Ok(mut map) = self.topics.lock() else { return };
    if map.get(&self.topic).is_some_and(|tx| tx.receiver_count() == 0) {
      map.remove(&self.topic);
      tracing::trace!("Topic '{}' has no subscribers left, removed", self.topic);
    }
  }
}

impl Default for InMemoryPubSub {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl PubSubBackend for InMemoryPubSub {
  async fn publish_bytes(&self, topic: &str, payload: Vec<u8>) -> Result<(), PubSubError> {
    // No receivers is not an error for pub/sub: the message is simply dropped.
    let delivered = self.live_sender(topic).is_some_and(|sender| sender.send(payload).is_ok());
    if !delivered {
      tracing::trace!("No subscribers on '{topic}', message dropped");
    }
    Ok(())
  }

  async fn subscribe_bytes(&self, topic: &str, handler: MessageHandler) -> Result<Subscription, PubSubError> {
    // Subscribe before returning so nothing published afterwards is missed.
    let mut rx = self.receiver(topic);

    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let name = topic.to_string();

    Ok(Subscription::spawn(topic, stop_tx, async move {
      loop {
        tokio::select! {
          biased;
          _ = &mut stop_rx => {
            return SubscriptionExit::Stopped;
          }
          res = rx.recv() => {
            match res {
              Ok(msg) => {
                let delivery = handler(msg);
                delivery.await;
              }
              Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Subscriber on '{name}' lagged, {skipped} messages dropped");
              }
              Err(broadcast::error::RecvError::Closed) => return SubscriptionExit::Failed,
            }
          }
        }
      }
    }))
  }
}
