//! Routing of game creation requests to their results.
//!
//! A joined client may ask for a new game. The request is queued under its
//! `action_id` (the request id) and published on [`channels::GAMES_CONTROL`];
//! a game server answers on [`channels::GAMES_CREATED`] with the same
//! `request_id`. Results are matched by that id, never by queue position, so
//! out-of-order creations still reach the right requestor.

use crate::{
  error::{GatewayError, PubSubError},
  protocol::{ActionResult, ControlCommand, ControlKind, Correlation, GameCreated},
  pubsub::{channels, PubSubBackend, PubSubExt, Subscription},
  registry::ConnectionId,
  session::Outbound,
};
use serde_json::{Map, Value};
use std::{collections::VecDeque, sync::Arc, time::Instant};
use tokio::sync::{mpsc, Mutex};

struct PendingCreate {
  requestor: ConnectionId,
  request_id: String,
  deliver: mpsc::UnboundedSender<Outbound>,
  enqueued_at: Instant,
}

/// FIFO of outstanding creation requests.
#[derive(Clone, Default)]
struct PendingQueue {
  entries: Arc<Mutex<VecDeque<PendingCreate>>>,
}

impl PendingQueue {
  async fn route(&self, created: GameCreated) -> bool {
    let Some(request_id) = created.request_id.clone() else {
      tracing::warn!("Dropping game.created for {} without request_id", created.game_id);
      return false;
    };

    let pending = {
      let mut entries = self.entries.lock().await;
      let pos = entries.iter().position(|p| p.request_id == request_id);
      pos.and_then(|pos| entries.remove(pos))
    };
    let Some(pending) = pending else {
      tracing::warn!("No pending create request '{}' for game {}", request_id, created.game_id);
      return false;
    };

    tracing::info!(
      "Game {} created for {} (request {}, waited {:?})",
      created.game_id,
      pending.requestor,
      request_id,
      pending.enqueued_at.elapsed()
    );

    let ack = ActionResult::ok(&Correlation {
      action_id: Some(request_id),
      game_id: Some(created.game_id.clone()),
    });
    let event = match serde_json::to_string(&created) {
      Ok(event) => event,
      Err(e) => {
        tracing::error!("Failed to encode game.created: {e}");
        return false;
      }
    };
    pending.deliver.send(Outbound::Text(event)).is_ok() && pending.deliver.send(Outbound::Text(ack.to_json())).is_ok()
  }
}

/// Process-wide matchmaking broker.
#[derive(Clone)]
pub struct MatchmakingBroker {
  pubsub: Arc<dyn PubSubBackend>,
  pending: PendingQueue,
  listener: Arc<Mutex<Option<Subscription>>>,
}

impl MatchmakingBroker {
  pub fn new(pubsub: Arc<dyn PubSubBackend>) -> Self {
    Self {
      pubsub,
      pending: PendingQueue::default(),
      listener: Arc::new(Mutex::new(None)),
    }
  }

  /// Subscribe to creation results. Calling it again is a no-op.
  pub async fn start(&self) -> Result<(), PubSubError> {
    let mut listener = self.listener.lock().await;
    if listener.is_some() {
      return Ok(());
    }

    let pending = self.pending.clone();
    let sub = self
      .pubsub
      .subscribe(channels::GAMES_CREATED, move |bytes| {
        let pending = pending.clone();
        async move {
          match serde_json::from_slice::<GameCreated>(&bytes) {
            Ok(created) => {
              pending.route(created).await;
            }
            Err(e) => tracing::warn!("Ignoring malformed game.created: {e}"),
          }
        }
      })
      .await?;
    *listener = Some(sub);
    tracing::info!("Matchmaking broker listening on {}", channels::GAMES_CREATED);
    Ok(())
  }

  /// Stop listening for creation results.
  pub async fn shutdown(&self) {
    if let Some(sub) = self.listener.lock().await.take() {
      sub.stop().await;
    }
  }

  /// Queue a creation request and forward it to the game servers.
  ///
  /// `request_id` must be unique among pending requests.
  pub async fn enqueue_create_request(
    &self,
    requestor: ConnectionId,
    request_id: String,
    payload: Map<String, Value>,
    deliver: mpsc::UnboundedSender<Outbound>,
  ) -> Result<(), GatewayError> {
    {
      let mut entries = self.pending.entries.lock().await;
      if entries.iter().any(|p| p.request_id == request_id) {
        return Err(GatewayError::InvalidAction(format!(
          "create request '{request_id}' is already pending"
        )));
      }
      entries.push_back(PendingCreate {
        requestor,
        request_id: request_id.clone(),
        deliver,
        enqueued_at: Instant::now(),
      });
    }

    let command = ControlCommand {
      command: ControlKind::Create,
      game_id: None,
      request_id: Some(request_id.clone()),
      payload,
    };
    if let Err(e) = self.pubsub.publish(channels::GAMES_CONTROL, &command).await {
      tracing::error!("Failed to publish create request {}: {}", request_id, e);
      self.pending.entries.lock().await.retain(|p| p.request_id != request_id);
      return Err(e.into());
    }

    tracing::debug!("Create request {} queued for {}", request_id, requestor);
    Ok(())
  }

  /// Route a creation result to the requestor that asked for it.
  ///
  /// Returns `true` if it was delivered. Each pending request is answered at most once.
  pub async fn on_game_created(&self, created: GameCreated) -> bool {
    self.pending.route(created).await
  }

  /// Forget every pending request of a requestor that disconnected.
  pub async fn cancel_requestor(&self, requestor: ConnectionId) -> usize {
    let mut entries = self.pending.entries.lock().await;
    let before = entries.len();
    entries.retain(|p| p.requestor != requestor);
    before - entries.len()
  }

  pub async fn pending(&self) -> usize {
    self.pending.entries.lock().await.len()
  }
}
