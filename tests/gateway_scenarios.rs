use async_trait::async_trait;
use briscola_gateway::{
  pubsub::{channels, MessageHandler, Subscription},
  registry::SeatKey,
  session::{Outbound, SessionEvents, SessionSignal, SessionState},
  Gateway, InMemoryPubSub, PubSubBackend, PubSubError, PubSubExt, Role, Session, TokenIssuer,
};
use serde_json::{json, Value};
use std::{
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  time::Duration,
};
use tokio::sync::mpsc;

const TIMEOUT: Duration = Duration::from_secs(1);

struct Client {
  session: Session,
  events: SessionEvents,
  rx: mpsc::UnboundedReceiver<Outbound>,
}

impl Client {
  fn open(gateway: &Gateway) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    let (session, events) = gateway.open_session(tx);
    Self { session, events, rx }
  }

  async fn send(&mut self, frame: Value) {
    self.session.receive(&frame.to_string()).await;
  }

  async fn next(&mut self) -> Outbound {
    tokio::time::timeout(TIMEOUT, self.rx.recv())
      .await
      .expect("timed out waiting for a frame")
      .expect("outbound queue closed")
  }

  async fn next_json(&mut self) -> Value {
    match self.next().await {
      Outbound::Text(text) => serde_json::from_str(&text).unwrap(),
      Outbound::Close => panic!("expected a text frame, got close"),
    }
  }

  /// Deliver the next pending signal to the session, as the transport would.
  async fn pump_signal(&mut self) -> SessionSignal {
    let signal = tokio::time::timeout(TIMEOUT, self.events.recv())
      .await
      .expect("timed out waiting for a signal")
      .expect("signal channel closed");
    self.session.handle_signal(signal.clone()).await;
    signal
  }
}

fn setup() -> (Gateway, Arc<InMemoryPubSub>) {
  let pubsub = Arc::new(InMemoryPubSub::new());
  let gateway = Gateway::new(TokenIssuer::new("scenario-secret"), pubsub.clone());
  (gateway, pubsub)
}

fn player_token(gateway: &Gateway, game_id: &str, seat: u32) -> String {
  gateway.issuer.mint(game_id, Role::Player, 600, Some(seat), None).unwrap()
}

fn join(token: &str, game_id: &str, action_id: &str) -> Value {
  json!({"message_type":"join","token":token,"game_id":game_id,"action_id":action_id})
}

async fn tap(pubsub: &InMemoryPubSub, topic: &str) -> (Subscription, mpsc::UnboundedReceiver<Value>) {
  let (tx, rx) = mpsc::unbounded_channel();
  let sub = pubsub
    .subscribe(topic, move |bytes| {
      let tx = tx.clone();
      async move {
        tx.send(serde_json::from_slice::<Value>(&bytes).unwrap()).ok();
      }
    })
    .await
    .unwrap();
  (sub, rx)
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
  tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap()
}

#[tokio::test]
async fn join_is_acknowledged_and_published() {
  let (gateway, pubsub) = setup();
  let (_tap, mut actions) = tap(&pubsub, &channels::actions("TEST01")).await;
  let mut client = Client::open(&gateway);

  let token = player_token(&gateway, "TEST01", 0);
  client.send(join(&token, "TEST01", "a1")).await;

  assert_eq!(
    client.next_json().await,
    json!({"message_type":"action.result","action_id":"a1","status":"ok","game_id":"TEST01"})
  );
  assert_eq!(client.session.state(), SessionState::Active);

  let published = recv(&mut actions).await;
  assert_eq!(published["message_type"], "join");
  assert_eq!(published["game_id"], "TEST01");
  assert_eq!(published["player_id"], 0);
  assert_eq!(published["role"], "player");
  assert_eq!(published["origin"], "web");
  assert!(!published.to_string().contains(&token));
}

#[tokio::test]
async fn second_connection_takes_over_the_seat() {
  let (gateway, _pubsub) = setup();
  let token = player_token(&gateway, "TEST01", 0);

  let mut first = Client::open(&gateway);
  first.send(join(&token, "TEST01", "a1")).await;
  assert_eq!(first.next_json().await["status"], "ok");

  let mut second = Client::open(&gateway);
  second.send(join(&token, "TEST01", "a2")).await;
  assert_eq!(second.next_json().await["status"], "ok");

  let signal = first.pump_signal().await;
  assert!(matches!(signal, SessionSignal::Evicted(_)));

  let notice = first.next_json().await;
  assert_eq!(notice["message_type"], "action.result");
  assert_eq!(notice["status"], "error");
  assert_eq!(notice["code"], "duplicate_connection_handled");
  assert_eq!(first.next().await, Outbound::Close);
  assert_eq!(first.session.state(), SessionState::Closed);

  // Exactly one notice.
  assert!(first.rx.try_recv().is_err());

  let key = SeatKey::new("TEST01", 0);
  assert_eq!(gateway.registry.owner(&key).await, Some(second.session.id()));
  assert_eq!(second.session.state(), SessionState::Active);
}

#[tokio::test]
async fn disconnect_after_takeover_keeps_new_owner() {
  let (gateway, _pubsub) = setup();
  let token = player_token(&gateway, "TEST01", 1);

  let mut first = Client::open(&gateway);
  first.send(join(&token, "TEST01", "a1")).await;
  let mut second = Client::open(&gateway);
  second.send(join(&token, "TEST01", "a2")).await;

  // The old connection goes away before its eviction is processed.
  first.session.close().await;

  let key = SeatKey::new("TEST01", 1);
  assert_eq!(gateway.registry.owner(&key).await, Some(second.session.id()));

  second.session.close().await;
  assert_eq!(gateway.registry.owner(&key).await, None);
}

#[tokio::test]
async fn rejoin_before_eviction_is_handled_keeps_the_seat() {
  let (gateway, _pubsub) = setup();
  let token = player_token(&gateway, "TEST01", 0);
  let key = SeatKey::new("TEST01", 0);

  let mut first = Client::open(&gateway);
  first.send(join(&token, "TEST01", "a1")).await;
  assert_eq!(first.next_json().await["status"], "ok");

  let mut second = Client::open(&gateway);
  second.send(join(&token, "TEST01", "a2")).await;
  assert_eq!(second.next_json().await["status"], "ok");

  // The first connection's frame wins the race against its queued eviction.
  first.send(join(&token, "TEST01", "a3")).await;
  assert_eq!(first.next_json().await["action_id"], "a3");
  assert_eq!(gateway.registry.owner(&key).await, Some(first.session.id()));

  assert!(matches!(first.pump_signal().await, SessionSignal::Evicted(_)));
  assert_eq!(first.session.state(), SessionState::Active);
  assert!(first.rx.try_recv().is_err());

  assert!(matches!(second.pump_signal().await, SessionSignal::Evicted(_)));
  assert_eq!(second.next_json().await["code"], "duplicate_connection_handled");
  assert_eq!(second.next().await, Outbound::Close);
  assert_eq!(second.session.state(), SessionState::Closed);

  assert_eq!(gateway.registry.owner(&key).await, Some(first.session.id()));
}

#[tokio::test]
async fn observer_may_only_sync() {
  let (gateway, pubsub) = setup();
  let (_tap, mut actions) = tap(&pubsub, &channels::actions("TEST01")).await;
  let mut client = Client::open(&gateway);

  let token = gateway.issuer.mint("TEST01", Role::Observer, 600, None, None).unwrap();
  client.send(join(&token, "TEST01", "o1")).await;
  assert_eq!(client.next_json().await["status"], "ok");
  assert_eq!(recv(&mut actions).await["message_type"], "join");

  client
    .send(json!({"message_type":"play","game_id":"TEST01","action_id":"o2","card":{}}))
    .await;
  let reply = client.next_json().await;
  assert_eq!(reply["status"], "error");
  assert_eq!(reply["code"], "forbidden");
  assert_eq!(reply["action_id"], "o2");

  client.send(json!({"message_type":"sync","game_id":"TEST01","action_id":"o3"})).await;
  let published = recv(&mut actions).await;
  assert_eq!(published["message_type"], "sync");
  assert_eq!(published["action_id"], "o3");
  assert_eq!(published["role"], "observer");
  assert!(client.rx.try_recv().is_err());
}

#[tokio::test]
async fn player_actions_carry_session_identity() {
  let (gateway, pubsub) = setup();
  let (_tap, mut actions) = tap(&pubsub, &channels::actions("TEST01")).await;
  let mut client = Client::open(&gateway);
  client.send(join(&player_token(&gateway, "TEST01", 2), "TEST01", "a1")).await;
  let _ = recv(&mut actions).await;
  let _ = client.next_json().await;

  client
    .send(json!({"message_type":"bid","game_id":"TEST01","action_id":"b1","bid":60,"player_id":4,"role":"host"}))
    .await;
  let published = recv(&mut actions).await;
  assert_eq!(published["message_type"], "bid");
  assert_eq!(published["action_id"], "b1");
  assert_eq!(published["player_id"], 2);
  assert_eq!(published["role"], "player");
  assert_eq!(published["payload"], json!({"bid":60}));
}

#[tokio::test]
async fn actions_before_join_fail() {
  let (gateway, _pubsub) = setup();
  let mut client = Client::open(&gateway);

  client
    .send(json!({"message_type":"bid","game_id":"TEST01","action_id":"b1","bid":60}))
    .await;
  let reply = client.next_json().await;
  assert_eq!(reply["status"], "error");
  assert_eq!(reply["code"], "join_failed");
  assert_eq!(reply["action_id"], "b1");
  assert_eq!(client.session.state(), SessionState::Connected);
}

#[tokio::test]
async fn unknown_and_malformed_frames_are_invalid_actions() {
  let (gateway, _pubsub) = setup();
  let mut client = Client::open(&gateway);

  client.send(json!({"message_type":"cheat","action_id":"c1","game_id":"TEST01"})).await;
  let reply = client.next_json().await;
  assert_eq!(reply["code"], "invalid_action");
  assert_eq!(reply["action_id"], "c1");
  assert_eq!(reply["game_id"], "TEST01");

  client.session.receive("not json at all").await;
  assert_eq!(client.next_json().await["code"], "invalid_action");

  client.send(json!({"action_id":"m1"})).await;
  let reply = client.next_json().await;
  assert_eq!(reply["code"], "invalid_action");
  assert_eq!(reply["action_id"], "m1");
  assert_eq!(client.session.state(), SessionState::Connected);
}

#[tokio::test]
async fn expired_token_is_unauthorized() {
  let (gateway, _pubsub) = setup();
  let mut client = Client::open(&gateway);
  let expired = gateway
    .issuer
    .sign(&briscola_gateway::Claims {
      game_id: "TEST01".into(),
      role: Role::Player,
      player_id: Some(0),
      display_name: None,
      exp: chrono::Utc::now().timestamp() - 10,
    })
    .unwrap();

  client.send(join(&expired, "TEST01", "a1")).await;
  let reply = client.next_json().await;
  assert_eq!(reply["code"], "unauthorized");
  assert_eq!(reply["reason"], "token expired");
  assert!(gateway.registry.is_empty().await);
}

#[tokio::test]
async fn events_are_forwarded_verbatim() {
  let (gateway, pubsub) = setup();
  let mut client = Client::open(&gateway);
  client.send(join(&player_token(&gateway, "TEST01", 0), "TEST01", "a1")).await;
  let _ = client.next_json().await;

  let event = json!({"message_type":"trick.won","winner":3,"points":21});
  pubsub.publish(&channels::events("TEST01"), &event).await.unwrap();
  pubsub.publish(&channels::events("OTHER1"), &json!({"message_type":"sync"})).await.unwrap();
  pubsub
    .publish(&channels::events("TEST01"), &json!({"message_type":"score.update"}))
    .await
    .unwrap();

  assert_eq!(client.next_json().await, event);
  assert_eq!(client.next_json().await["message_type"], "score.update");
}

#[tokio::test]
async fn close_releases_the_seat_and_the_subscription() {
  let (gateway, pubsub) = setup();
  let mut client = Client::open(&gateway);
  client.send(join(&player_token(&gateway, "TEST01", 0), "TEST01", "a1")).await;
  let _ = client.next_json().await;
  assert_eq!(pubsub.subscriber_count(&channels::events("TEST01")), 1);

  client.session.close().await;
  assert_eq!(pubsub.subscriber_count(&channels::events("TEST01")), 0);
  assert!(gateway.registry.is_empty().await);
}

#[tokio::test]
async fn create_is_routed_by_request_id() {
  let (gateway, pubsub) = setup();
  gateway.matchmaking.start().await.unwrap();
  let (_tap, mut control) = tap(&pubsub, channels::GAMES_CONTROL).await;

  let host = gateway.issuer.mint("LOBBY1", Role::Host, 600, None, None).unwrap();
  let mut a = Client::open(&gateway);
  let mut b = Client::open(&gateway);
  for (client, id) in [(&mut a, "ha"), (&mut b, "hb")] {
    client.send(join(&host, "LOBBY1", id)).await;
    assert_eq!(client.next_json().await["status"], "ok");
  }

  a.send(json!({"message_type":"create","action_id":"req-a","seats":5})).await;
  b.send(json!({"message_type":"create","action_id":"req-b"})).await;
  let first = recv(&mut control).await;
  assert_eq!(first, json!({"command":"create","request_id":"req-a","seats":5}));
  assert_eq!(recv(&mut control).await["request_id"], "req-b");

  // Results arrive in the opposite order.
  for (request_id, game_id) in [("req-b", "GAMEBB"), ("req-a", "GAMEAA")] {
    pubsub
      .publish(
        channels::GAMES_CREATED,
        &json!({"message_type":"game.created","request_id":request_id,"game_id":game_id}),
      )
      .await
      .unwrap();
  }

  assert_eq!(b.next_json().await["game_id"], "GAMEBB");
  assert_eq!(b.next_json().await, json!({"message_type":"action.result","action_id":"req-b","status":"ok","game_id":"GAMEBB"}));
  assert_eq!(a.next_json().await["game_id"], "GAMEAA");
  assert_eq!(a.next_json().await["action_id"], "req-a");
}

#[tokio::test]
async fn create_requires_join() {
  let (gateway, _pubsub) = setup();
  let mut client = Client::open(&gateway);
  client.send(json!({"message_type":"create","action_id":"r1"})).await;
  assert_eq!(client.next_json().await["code"], "join_failed");
}

/// Broker whose publishes can be switched off, and whose subscriptions can be made to fail.
struct FlakyBroker {
  inner: InMemoryPubSub,
  publish_fails: AtomicBool,
  subscribe_fails: AtomicBool,
}

impl FlakyBroker {
  fn new() -> Self {
    Self {
      inner: InMemoryPubSub::new(),
      publish_fails: AtomicBool::new(false),
      subscribe_fails: AtomicBool::new(false),
    }
  }
}

#[async_trait]
impl PubSubBackend for FlakyBroker {
  async fn publish_bytes(&self, topic: &str, payload: Vec<u8>) -> Result<(), PubSubError> {
    if self.publish_fails.load(Ordering::SeqCst) {
      return Err(PubSubError::Closed("broker down".into()));
    }
    self.inner.publish_bytes(topic, payload).await
  }

  async fn subscribe_bytes(&self, topic: &str, handler: MessageHandler) -> Result<Subscription, PubSubError> {
    if self.subscribe_fails.load(Ordering::SeqCst) {
      return Err(PubSubError::Closed("broker down".into()));
    }
    self.inner.subscribe_bytes(topic, handler).await
  }

  async fn health_check(&self) -> Result<(), PubSubError> {
    Err(PubSubError::Closed("broker down".into()))
  }
}

#[tokio::test]
async fn publish_failure_is_reported_not_fatal() {
  let broker = Arc::new(FlakyBroker::new());
  let gateway = Gateway::new(TokenIssuer::new("scenario-secret"), broker.clone());
  let mut client = Client::open(&gateway);
  client.send(join(&player_token(&gateway, "TEST01", 0), "TEST01", "a1")).await;
  assert_eq!(client.next_json().await["status"], "ok");

  broker.publish_fails.store(true, Ordering::SeqCst);
  client.send(json!({"message_type":"play","action_id":"p1","card":{}})).await;
  let reply = client.next_json().await;
  assert_eq!(reply["status"], "error");
  assert_eq!(reply["code"], "broker_unavailable");
  assert_eq!(reply["action_id"], "p1");
  assert_eq!(reply["game_id"], "TEST01");
  assert_eq!(client.session.state(), SessionState::Active);

  broker.publish_fails.store(false, Ordering::SeqCst);
  client.send(json!({"message_type":"sync","action_id":"s1"})).await;
  assert!(client.rx.try_recv().is_err());
}

#[tokio::test]
async fn failed_join_publish_rolls_back_the_claim() {
  let broker = Arc::new(FlakyBroker::new());
  let gateway = Gateway::new(TokenIssuer::new("scenario-secret"), broker.clone());
  let mut client = Client::open(&gateway);

  broker.publish_fails.store(true, Ordering::SeqCst);
  client.send(join(&player_token(&gateway, "TEST01", 0), "TEST01", "a1")).await;
  let reply = client.next_json().await;
  assert_eq!(reply["code"], "broker_unavailable");
  assert_eq!(client.session.state(), SessionState::Connected);
  assert!(gateway.registry.is_empty().await);
  assert_eq!(broker.inner.subscriber_count(&channels::events("TEST01")), 0);
}

#[tokio::test]
async fn failed_subscribe_rolls_back_the_claim() {
  let broker = Arc::new(FlakyBroker::new());
  let gateway = Gateway::new(TokenIssuer::new("scenario-secret"), broker.clone());
  let mut client = Client::open(&gateway);

  broker.subscribe_fails.store(true, Ordering::SeqCst);
  client.send(join(&player_token(&gateway, "TEST01", 0), "TEST01", "a1")).await;
  assert_eq!(client.next_json().await["code"], "broker_unavailable");
  assert!(gateway.registry.is_empty().await);
}
