//! Wire format between browser clients, the gateway and game servers.
//!
//! Client frames are decoded into a [`ClientMessage`] before anything else
//! looks at them. Unknown fields are kept as the action payload; a missing or
//! unrecognised `message_type` is a [`DecodeError`].
//!
//! Outgoing traffic to the broker is always an [`ActionEnvelope`] whose
//! identity fields come from the authenticated session, never from the client.

use crate::{
  auth::Role,
  error::{ErrorCode, GatewayError},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const PROTOCOL_VERSION: &str = "1";
pub const ORIGIN: &str = "web";
pub const ACTION_RESULT: &str = "action.result";
pub const GAME_CREATED: &str = "game.created";
pub const GAME_ENDED: &str = "game.ended";

/// Fields the codec owns; they never end up inside an action payload.
const RESERVED_FIELDS: [&str; 6] = ["message_type", "action_id", "game_id", "token", "player_id", "role"];

/// Game actions a joined client may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
  Sync,
  Bid,
  CallPartnerRank,
  CallPartnerSuit,
  Play,
  Reorder,
}

impl ActionKind {
  pub const ALL: [ActionKind; 6] = [
    ActionKind::Sync,
    ActionKind::Bid,
    ActionKind::CallPartnerRank,
    ActionKind::CallPartnerSuit,
    ActionKind::Play,
    ActionKind::Reorder,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      ActionKind::Sync => "sync",
      ActionKind::Bid => "bid",
      ActionKind::CallPartnerRank => "call-partner-rank",
      ActionKind::CallPartnerSuit => "call-partner-suit",
      ActionKind::Play => "play",
      ActionKind::Reorder => "reorder",
    }
  }

  pub fn from_tag(tag: &str) -> Option<Self> {
    Self::ALL.into_iter().find(|k| k.as_str() == tag)
  }

  /// Whether the action changes game state. Only `sync` does not.
  pub fn is_mutating(&self) -> bool {
    !matches!(self, ActionKind::Sync)
  }
}

/// The `message_type`-specific part of a client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientBody {
  Join { token: Option<String> },
  Create,
  Action(ActionKind),
}

/// Identifiers echoed back in every `action.result`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Correlation {
  pub action_id: Option<String>,
  pub game_id: Option<String>,
}

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientMessage {
  pub action_id: Option<String>,
  pub game_id: Option<String>,
  pub body: ClientBody,
  /// Remaining type-specific fields, with tokens and identity fields removed.
  pub payload: Map<String, Value>,
}

#[derive(Debug, Error)]
pub enum DecodeError {
  #[error("invalid JSON: {0}")]
  Json(#[from] serde_json::Error),

  #[error("message must be a JSON object")]
  NotAnObject,

  #[error("missing message_type")]
  MissingMessageType(Correlation),

  #[error("unknown message_type '{tag}'")]
  UnknownMessageType { tag: String, correlation: Correlation },
}

impl DecodeError {
  /// Identifiers that could still be read from the rejected frame.
  pub fn correlation(&self) -> Correlation {
    match self {
      DecodeError::MissingMessageType(c) | DecodeError::UnknownMessageType { correlation: c, .. } => c.clone(),
      DecodeError::Json(_) | DecodeError::NotAnObject => Correlation::default(),
    }
  }
}

impl From<DecodeError> for GatewayError {
  fn from(e: DecodeError) -> Self {
    GatewayError::InvalidAction(e.to_string())
  }
}

fn take_id(fields: &mut Map<String, Value>, key: &str) -> Option<String> {
  match fields.remove(key)? {
    Value::String(s) => Some(s),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

impl ClientMessage {
  /// Decode a client text frame.
  pub fn decode(text: &str) -> Result<Self, DecodeError> {
    let Value::Object(mut fields) = serde_json::from_str::<Value>(text)? else {
      return Err(DecodeError::NotAnObject);
    };

    let correlation = Correlation {
      action_id: take_id(&mut fields, "action_id"),
      game_id: take_id(&mut fields, "game_id"),
    };

    let tag = match fields.remove("message_type") {
      Some(Value::String(tag)) => tag,
      _ => return Err(DecodeError::MissingMessageType(correlation)),
    };

    let token = take_id(&mut fields, "token");
    for key in RESERVED_FIELDS {
      fields.remove(key);
    }

    let body = if tag == "join" {
      ClientBody::Join { token }
    } else if tag == "create" {
      ClientBody::Create
    } else if let Some(kind) = ActionKind::from_tag(&tag) {
      ClientBody::Action(kind)
    } else {
      return Err(DecodeError::UnknownMessageType { tag, correlation });
    };

    Ok(Self {
      action_id: correlation.action_id,
      game_id: correlation.game_id,
      body,
      payload: fields,
    })
  }

  pub fn message_type(&self) -> &'static str {
    match &self.body {
      ClientBody::Join { .. } => "join",
      ClientBody::Create => "create",
      ClientBody::Action(kind) => kind.as_str(),
    }
  }

  pub fn correlation(&self) -> Correlation {
    Correlation {
      action_id: self.action_id.clone(),
      game_id: self.game_id.clone(),
    }
  }
}

/// Identity of a joined session, stamped on every outgoing action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
  pub game_id: String,
  pub player_id: Option<u32>,
  pub role: Role,
}

/// Canonical action published on `game.{id}.actions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEnvelope {
  pub message_type: String,
  pub game_id: String,
  pub action_id: String,
  #[serde(default)]
  pub player_id: Option<u32>,
  pub role: Role,
  pub ts: i64,
  pub version: String,
  pub origin: String,
  #[serde(default)]
  pub payload: Map<String, Value>,
}

pub fn new_action_id() -> String {
  uuid::Uuid::new_v4().to_string()
}

/// Build the broker envelope for a client message.
///
/// `game_id`, `player_id` and `role` come from `ctx`. A missing `action_id`
/// is replaced with a fresh one.
pub fn build_action(msg: &ClientMessage, ctx: &SessionContext) -> ActionEnvelope {
  ActionEnvelope {
    message_type: msg.message_type().to_string(),
    game_id: ctx.game_id.clone(),
    action_id: msg.action_id.clone().unwrap_or_else(new_action_id),
    player_id: ctx.player_id,
    role: ctx.role,
    ts: chrono::Utc::now().timestamp_millis(),
    version: PROTOCOL_VERSION.to_string(),
    origin: ORIGIN.to_string(),
    payload: msg.payload.clone(),
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
  Ok,
  Error,
}

/// `action.result` sent from the gateway to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
  pub message_type: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub action_id: Option<String>,
  pub status: Status,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub game_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub code: Option<ErrorCode>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub reason: Option<String>,
}

/// Build an `action.result` echoing the triggering message's identifiers.
pub fn build_action_result(
  original: &Correlation,
  status: Status,
  code: Option<ErrorCode>,
  reason: Option<String>,
) -> ActionResult {
  ActionResult {
    message_type: ACTION_RESULT.to_string(),
    action_id: original.action_id.clone(),
    status,
    game_id: original.game_id.clone(),
    code,
    reason,
  }
}

impl ActionResult {
  pub fn ok(original: &Correlation) -> Self {
    build_action_result(original, Status::Ok, None, None)
  }

  pub fn error(original: &Correlation, err: &GatewayError) -> Self {
    build_action_result(original, Status::Error, Some(err.code()), Some(err.reason()))
  }

  /// Notice sent to a connection that lost its seat to a newer one.
  pub fn duplicate_connection(game_id: &str) -> Self {
    build_action_result(
      &Correlation {
        action_id: None,
        game_id: Some(game_id.to_string()),
      },
      Status::Error,
      Some(ErrorCode::DuplicateConnectionHandled),
      Some("another connection took over this seat".to_string()),
    )
  }

  pub fn to_json(&self) -> String {
    // Only strings, enums and options; serialization cannot fail.
    serde_json::to_string(self).unwrap_or_default()
  }
}

/// Creation result published by a game server on `games.created`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameCreated {
  #[serde(default = "game_created_tag")]
  pub message_type: String,
  #[serde(default)]
  pub request_id: Option<String>,
  pub game_id: String,
  #[serde(flatten)]
  pub rest: Map<String, Value>,
}

fn game_created_tag() -> String {
  GAME_CREATED.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlKind {
  Create,
  Stop,
  Sync,
}

/// Lifecycle command published on a control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlCommand {
  pub command: ControlKind,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub game_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub request_id: Option<String>,
  #[serde(flatten)]
  pub payload: Map<String, Value>,
}

impl ControlCommand {
  pub fn for_game(command: ControlKind, game_id: &str) -> Self {
    Self {
      command,
      game_id: Some(game_id.to_string()),
      request_id: None,
      payload: Map::new(),
    }
  }
}
