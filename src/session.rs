//! Per-connection protocol state machine.
//!
//! A [`Session`] starts `Connected`, becomes `Active` after a successful
//! join and ends `Closed`. It never touches the socket: replies go into an
//! outbound queue that the transport drains, and the transport feeds frames
//! and [`SessionSignal`]s back in. That keeps the whole state machine
//! drivable from tests without a WebSocket.

use crate::{
  auth::{Role, TokenIssuer},
  error::{AuthError, GatewayError},
  matchmaking::MatchmakingBroker,
  protocol::{build_action, new_action_id, ActionKind, ActionResult, ClientBody, ClientMessage, Correlation, SessionContext},
  pubsub::{channels, PubSubBackend, PubSubExt, Subscription, SubscriptionExit},
  rate_limit::{MessageLimits, RateLimiter},
  registry::{ConnectionId, ConnectionRegistry, EvictionNotice, Owner, SeatKey},
};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;

/// Default bounded wait for the event forwarder to stop.
pub const FORWARDER_STOP_TIMEOUT: Duration = Duration::from_millis(500);

/// A frame for the transport to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
  Text(String),
  Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
  Connected,
  Joining,
  Active,
  Closed,
}

/// Dependencies shared by every session of a gateway process.
#[derive(Clone)]
pub struct Gateway {
  pub issuer: TokenIssuer,
  pub pubsub: Arc<dyn PubSubBackend>,
  pub registry: ConnectionRegistry,
  pub matchmaking: MatchmakingBroker,
  pub rate_limiter: RateLimiter,
  pub forwarder_stop_timeout: Duration,
}

impl Gateway {
  pub fn new(issuer: TokenIssuer, pubsub: Arc<dyn PubSubBackend>) -> Self {
    Self {
      issuer,
      matchmaking: MatchmakingBroker::new(pubsub.clone()),
      pubsub,
      registry: ConnectionRegistry::new(),
      rate_limiter: RateLimiter::new(MessageLimits::default()),
      forwarder_stop_timeout: FORWARDER_STOP_TIMEOUT,
    }
  }

  /// Configure inbound frame limits.
  pub fn with_limits(mut self, limits: MessageLimits) -> Self {
    self.rate_limiter = RateLimiter::new(limits);
    self
  }

  pub fn with_forwarder_stop_timeout(mut self, timeout: Duration) -> Self {
    self.forwarder_stop_timeout = timeout;
    self
  }

  /// Open a session for a new connection whose frames go to `outbound`.
  pub fn open_session(&self, outbound: mpsc::UnboundedSender<Outbound>) -> (Session, SessionEvents) {
    Session::new(self.clone(), outbound)
  }
}

/// Something that happened to a session outside of its own frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
  /// Another connection claimed our seat.
  Evicted(EvictionNotice),
  /// The event forwarder of the given generation gave up.
  BrokerLost(u64),
}

/// Receiving side of a session's signals, polled by the transport.
pub struct SessionEvents {
  evictions: mpsc::UnboundedReceiver<EvictionNotice>,
  broker_lost: mpsc::UnboundedReceiver<u64>,
}

impl SessionEvents {
  /// Wait for the next signal. `None` once the session has been dropped.
  pub async fn recv(&mut self) -> Option<SessionSignal> {
    tokio::select! {
      Some(notice) = self.evictions.recv() => Some(SessionSignal::Evicted(notice)),
      Some(generation) = self.broker_lost.recv() => Some(SessionSignal::BrokerLost(generation)),
      else => None,
    }
  }
}

/// Game binding of an `Active` session.
struct Binding {
  ctx: SessionContext,
  seat: Option<SeatKey>,
  forwarder: Subscription,
  generation: u64,
}

pub struct Session {
  id: ConnectionId,
  gateway: Gateway,
  state: SessionState,
  binding: Option<Binding>,
  generation: u64,
  outbound: mpsc::UnboundedSender<Outbound>,
  evict_tx: mpsc::UnboundedSender<EvictionNotice>,
  lost_tx: mpsc::UnboundedSender<u64>,
}

impl Session {
  pub fn new(gateway: Gateway, outbound: mpsc::UnboundedSender<Outbound>) -> (Self, SessionEvents) {
    let (evict_tx, evictions) = mpsc::unbounded_channel();
    let (lost_tx, broker_lost) = mpsc::unbounded_channel();
    let session = Self {
      id: ConnectionId::new(),
      gateway,
      state: SessionState::Connected,
      binding: None,
      generation: 0,
      outbound,
      evict_tx,
      lost_tx,
    };
    tracing::debug!("Session {} connected", session.id);
    (session, SessionEvents { evictions, broker_lost })
  }

  pub fn id(&self) -> ConnectionId {
    self.id
  }

  pub fn state(&self) -> SessionState {
    self.state
  }

  /// Identity bound by the last successful join.
  pub fn context(&self) -> Option<&SessionContext> {
    self.binding.as_ref().map(|b| &b.ctx)
  }

  pub fn seat(&self) -> Option<&SeatKey> {
    self.binding.as_ref().and_then(|b| b.seat.as_ref())
  }

  fn reply(&self, result: ActionResult) {
    if self.outbound.send(Outbound::Text(result.to_json())).is_err() {
      tracing::debug!("Session {} outbound queue closed, reply dropped", self.id);
    }
  }

  /// Handle one inbound text frame. Failures are answered on the outbound queue.
  pub async fn receive(&mut self, text: &str) {
    if self.state == SessionState::Closed {
      return;
    }

    if let Err(e) = self.gateway.rate_limiter.check_allowed(self.id, text.len()).await {
      tracing::warn!("Session {} frame rejected: {}", self.id, e);
      self.reply(ActionResult::error(&Correlation::default(), &e.into()));
      return;
    }

    let msg = match ClientMessage::decode(text) {
      Ok(msg) => msg,
      Err(e) => {
        tracing::debug!("Session {} sent an undecodable frame: {}", self.id, e);
        let correlation = e.correlation();
        self.reply(ActionResult::error(&correlation, &e.into()));
        return;
      }
    };

    let outcome = match &msg.body {
      ClientBody::Join { token } => self.join(&msg, token.as_deref()).await,
      ClientBody::Action(kind) => self.action(&msg, *kind).await,
      ClientBody::Create => self.create(&msg).await,
    };

    if let Err(e) = outcome {
      tracing::info!("Session {} {} rejected: {}", self.id, msg.message_type(), e);
      let mut correlation = msg.correlation();
      if correlation.game_id.is_none() {
        correlation.game_id = self.context().map(|c| c.game_id.clone());
      }
      self.reply(ActionResult::error(&correlation, &e));
    }
  }

  async fn join(&mut self, msg: &ClientMessage, token: Option<&str>) -> Result<(), GatewayError> {
    let previous = self.state;
    self.state = SessionState::Joining;
    let outcome = self.bind(msg, token).await;
    self.state = match outcome {
      Ok(()) => SessionState::Active,
      Err(_) => previous,
    };
    outcome
  }

  async fn bind(&mut self, msg: &ClientMessage, token: Option<&str>) -> Result<(), GatewayError> {
    let token = token.ok_or_else(|| AuthError::Malformed("missing token".to_string()))?;
    let claims = self.gateway.issuer.validate(token, msg.game_id.as_deref())?;
    if claims.game_id.is_empty() {
      return Err(GatewayError::JoinFailed("missing game_id".to_string()));
    }

    let seat = match (claims.role.is_seated(), claims.player_id) {
      (true, Some(player_id)) => Some(SeatKey::new(claims.game_id.clone(), player_id)),
      (true, None) => return Err(GatewayError::JoinFailed(format!("{} token without player_id", claims.role))),
      (false, _) => None,
    };
    let ctx = SessionContext {
      game_id: claims.game_id,
      player_id: seat.as_ref().map(|s| s.seat),
      role: claims.role,
    };

    if let Some(key) = &seat {
      let owner = Owner::new(self.id, self.evict_tx.clone());
      if let Some(prev) = self.gateway.registry.claim(key.clone(), owner).await {
        tracing::info!("Seat {} taken from {} by {}", key, prev.id, self.id);
        if !prev.evict(key.clone(), self.id) {
          tracing::debug!("Previous owner {} of {} already gone", prev.id, key);
        }
      }
    }

    let forwarder = match self.start_forwarder(&ctx.game_id).await {
      Ok(forwarder) => forwarder,
      Err(e) => {
        tracing::error!("Session {} could not subscribe to {}: {}", self.id, ctx.game_id, e);
        self.undo_claim(seat.as_ref()).await;
        return Err(e.into());
      }
    };

    let envelope = build_action(msg, &ctx);
    if let Err(e) = self.gateway.pubsub.publish(&channels::actions(&ctx.game_id), &envelope).await {
      tracing::error!("Session {} could not publish join for {}: {}", self.id, ctx.game_id, e);
      forwarder.stop_within(self.gateway.forwarder_stop_timeout).await;
      self.undo_claim(seat.as_ref()).await;
      return Err(e.into());
    }

    self.generation += 1;
    self.watch_forwarder(&forwarder, self.generation);
    let correlation = Correlation {
      action_id: msg.action_id.clone(),
      game_id: Some(ctx.game_id.clone()),
    };
    tracing::info!(
      "Session {} joined {} as {}{}",
      self.id,
      ctx.game_id,
      ctx.role,
      ctx.player_id.map(|p| format!(" (seat {p})")).unwrap_or_default()
    );

    let old = self.binding.replace(Binding {
      ctx,
      seat,
      forwarder,
      generation: self.generation,
    });
    if let Some(old) = old {
      self.retire(old).await;
    }

    self.reply(ActionResult::ok(&correlation));
    Ok(())
  }

  /// Release a seat claimed by a failed join, unless the current binding holds it.
  async fn undo_claim(&self, seat: Option<&SeatKey>) {
    let Some(key) = seat else { return };
    if self.seat() == Some(key) {
      return;
    }
    self.gateway.registry.release(key, self.id).await;
  }

  /// Tear down a binding replaced by a re-join.
  async fn retire(&self, old: Binding) {
    if !old.forwarder.stop_within(self.gateway.forwarder_stop_timeout).await {
      tracing::warn!("Session {} old forwarder for {} was aborted", self.id, old.ctx.game_id);
    }
    if let Some(key) = old.seat {
      if self.seat() != Some(&key) {
        self.gateway.registry.release(&key, self.id).await;
      }
    }
  }

  async fn start_forwarder(&self, game_id: &str) -> Result<Subscription, crate::error::PubSubError> {
    let tx = self.outbound.clone();
    let id = self.id;
    self
      .gateway
      .pubsub
      .subscribe(&channels::events(game_id), move |bytes| {
        let tx = tx.clone();
        async move {
          match String::from_utf8(bytes) {
            Ok(text) => {
              if tx.send(Outbound::Text(text)).is_err() {
                tracing::trace!("Session {id} gone, event dropped");
              }
            }
            Err(e) => tracing::warn!("Session {id} dropped a non UTF-8 event: {e}"),
          }
        }
      })
      .await
  }

  fn watch_forwarder(&self, forwarder: &Subscription, generation: u64) {
    let exit = forwarder.exit_watch();
    let lost_tx = self.lost_tx.clone();
    let id = self.id;
    tokio::spawn(async move {
      if exit.await == SubscriptionExit::Failed {
        tracing::warn!("Event forwarder of session {id} failed");
        let _ = lost_tx.send(generation);
      }
    });
  }

  async fn action(&mut self, msg: &ClientMessage, kind: ActionKind) -> Result<(), GatewayError> {
    let Some(binding) = self.binding.as_ref().filter(|_| self.state == SessionState::Active) else {
      return Err(GatewayError::JoinFailed(format!("join required before '{}'", kind.as_str())));
    };
    let ctx = &binding.ctx;

    if !ctx.role.is_seated() && kind.is_mutating() {
      return Err(GatewayError::Forbidden(format!("{}s may only sync", ctx.role)));
    }

    let envelope = build_action(msg, ctx);
    self
      .gateway
      .pubsub
      .publish(&channels::actions(&ctx.game_id), &envelope)
      .await?;
    tracing::debug!("Session {} published {} {}", self.id, envelope.message_type, envelope.action_id);
    Ok(())
  }

  async fn create(&mut self, msg: &ClientMessage) -> Result<(), GatewayError> {
    let Some(ctx) = self.context().filter(|_| self.state == SessionState::Active) else {
      return Err(GatewayError::JoinFailed("join required before 'create'".to_string()));
    };
    if ctx.role == Role::Observer {
      return Err(GatewayError::Forbidden("observers cannot create games".to_string()));
    }

    let request_id = msg.action_id.clone().unwrap_or_else(new_action_id);
    self
      .gateway
      .matchmaking
      .enqueue_create_request(self.id, request_id, msg.payload.clone(), self.outbound.clone())
      .await
  }

  /// React to a signal from [`SessionEvents`].
  pub async fn handle_signal(&mut self, signal: SessionSignal) {
    match signal {
      SessionSignal::Evicted(notice) => self.evict(notice).await,
      SessionSignal::BrokerLost(generation) => self.broker_lost(generation).await,
    }
  }

  /// Close this session because `notice.by` took over its seat.
  ///
  /// A notice is stale when this session has since taken the seat back.
  pub async fn evict(&mut self, notice: EvictionNotice) {
    if self.state == SessionState::Closed || self.seat() != Some(&notice.key) {
      tracing::debug!("Session {} ignoring stale eviction for {}", self.id, notice.key);
      return;
    }
    if self.gateway.registry.owner(&notice.key).await == Some(self.id) {
      tracing::debug!("Session {} owns {} again, eviction by {} ignored", self.id, notice.key, notice.by);
      return;
    }
    tracing::info!("Session {} evicted from {} by {}", self.id, notice.key, notice.by);
    self.reply(ActionResult::duplicate_connection(&notice.key.game_id));
    self.close().await;
    let _ = self.outbound.send(Outbound::Close);
  }

  async fn broker_lost(&mut self, generation: u64) {
    let Some(binding) = self.binding.as_ref() else { return };
    if binding.generation != generation || self.state == SessionState::Closed {
      return;
    }
    let correlation = Correlation {
      action_id: None,
      game_id: Some(binding.ctx.game_id.clone()),
    };
    tracing::warn!("Session {} lost its event stream, closing", self.id);
    self.reply(ActionResult::error(
      &correlation,
      &GatewayError::BrokerUnavailable("event stream lost".to_string()),
    ));
    self.close().await;
    let _ = self.outbound.send(Outbound::Close);
  }

  /// Stop forwarding and give up the seat. Safe to call more than once.
  ///
  /// The forwarder is stopped before the registry is touched, so a newer
  /// owner never sees its seat released by a still-running old task.
  pub async fn close(&mut self) {
    if self.state == SessionState::Closed {
      return;
    }
    self.state = SessionState::Closed;

    if let Some(binding) = self.binding.take() {
      if !binding.forwarder.stop_within(self.gateway.forwarder_stop_timeout).await {
        tracing::warn!("Session {} forwarder for {} was aborted", self.id, binding.ctx.game_id);
      }
      if let Some(key) = binding.seat {
        self.gateway.registry.release(&key, self.id).await;
      }
    }

    let cancelled = self.gateway.matchmaking.cancel_requestor(self.id).await;
    if cancelled > 0 {
      tracing::debug!("Session {} dropped {} pending create requests", self.id, cancelled);
    }
    self.gateway.rate_limiter.forget(self.id).await;
    tracing::info!("Session {} closed", self.id);
  }
}
