//! Single owner per `(game_id, seat)`.
//!
//! The registry is the only state shared between sessions. Claims replace the
//! previous owner and hand it back to the caller, who is responsible for
//! evicting it. Releases only remove an entry that still belongs to the
//! releasing connection, so a disconnect that races a takeover is a no-op.

use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Identifier of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
  pub fn new() -> Self {
    Self(Uuid::new_v4())
  }
}

impl Default for ConnectionId {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Display for ConnectionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    self.0.fmt(f)
  }
}

/// Registry key: a seat in a game.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeatKey {
  pub game_id: String,
  pub seat: u32,
}

impl SeatKey {
  pub fn new(game_id: impl Into<String>, seat: u32) -> Self {
    Self {
      game_id: game_id.into(),
      seat,
    }
  }
}

impl std::fmt::Display for SeatKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}#{}", self.game_id, self.seat)
  }
}

/// Delivered to a connection that lost its seat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionNotice {
  pub key: SeatKey,
  pub by: ConnectionId,
}

/// Current owner of a seat, with a way to tell it that it has been replaced.
#[derive(Debug, Clone)]
pub struct Owner {
  pub id: ConnectionId,
  evict_tx: mpsc::UnboundedSender<EvictionNotice>,
}

impl Owner {
  pub fn new(id: ConnectionId, evict_tx: mpsc::UnboundedSender<EvictionNotice>) -> Self {
    Self { id, evict_tx }
  }

  /// Ask the owner to shut down. Returns `false` if it is already gone.
  pub fn evict(&self, key: SeatKey, by: ConnectionId) -> bool {
    self.evict_tx.send(EvictionNotice { key, by }).is_ok()
  }
}

/// Shared `(game_id, seat)` to connection mapping.
///
/// Cloning is cheap and every clone sees the same map.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
  entries: Arc<RwLock<HashMap<SeatKey, Owner>>>,
}

impl ConnectionRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make `owner` the owner of `key`.
  ///
  /// Returns the previous owner when it was a different connection. Claiming
  /// a seat already held by the same connection returns `None`.
  pub async fn claim(&self, key: SeatKey, owner: Owner) -> Option<Owner> {
    let mut entries = self.entries.write().await;
    let new_id = owner.id;
    let previous = entries.insert(key.clone(), owner);
    match previous {
      Some(prev) if prev.id != new_id => {
        tracing::info!("Seat {} taken over by {} from {}", key, new_id, prev.id);
        Some(prev)
      }
      _ => {
        tracing::debug!("Seat {} claimed by {}", key, new_id);
        None
      }
    }
  }

  /// Remove `key` if it still belongs to `id`.
  pub async fn release(&self, key: &SeatKey, id: ConnectionId) -> bool {
    let mut entries = self.entries.write().await;
    match entries.get(key) {
      Some(current) if current.id == id => {
        entries.remove(key);
        tracing::debug!("Seat {} released by {}", key, id);
        true
      }
      Some(current) => {
        tracing::debug!("Stale release of seat {} by {} ignored, owned by {}", key, id, current.id);
        false
      }
      None => false,
    }
  }

  pub async fn owner(&self, key: &SeatKey) -> Option<ConnectionId> {
    self.entries.read().await.get(key).map(|o| o.id)
  }

  /// Occupied seats of a game, ascending.
  pub async fn seats(&self, game_id: &str) -> Vec<u32> {
    let entries = self.entries.read().await;
    let mut seats: Vec<u32> = entries
      .keys()
      .filter(|k| k.game_id == game_id)
      .map(|k| k.seat)
      .collect();
    seats.sort_unstable();
    seats
  }

  pub async fn len(&self) -> usize {
    self.entries.read().await.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.entries.read().await.is_empty()
  }
}
