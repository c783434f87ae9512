//! Capability tokens for joining a game.
//!
//! A token is a self-contained HS256 JWT granting one role in one game. The
//! claim set is part of the wire contract with whatever mints tokens (the HTTP
//! API in [`crate::server`], the `mint-token` binary, or an external issuer):
//!
//! ```json
//! {"game_id": "TEST01", "role": "player", "player_id": 0, "display_name": "Ann", "exp": 1700000000}
//! ```
//!
//! `player_id` is present only for players, `display_name` only when given.
//!
//! ## Example Usage
//! ```
//! use briscola_gateway::auth::{Role, TokenIssuer};
//!
//! let issuer = TokenIssuer::new("super-secret-key");
//! let token = issuer.mint("TEST01", Role::Player, 3600, Some(0), None).unwrap();
//! let claims = issuer.validate(&token, Some("TEST01")).unwrap();
//! assert_eq!(claims.player_id, Some(0));
//! ```
use crate::error::AuthError;
use jsonwebtoken::{decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Role granted by a capability token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  Host,
  Player,
  Observer,
}

impl Role {
  /// Seated roles own a `(game_id, seat)` registry entry.
  pub fn is_seated(&self) -> bool {
    matches!(self, Role::Player)
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Role::Host => "host",
      Role::Player => "player",
      Role::Observer => "observer",
    }
  }
}

impl std::fmt::Display for Role {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

impl std::str::FromStr for Role {
  type Err = AuthError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "host" => Ok(Role::Host),
      "player" => Ok(Role::Player),
      "observer" => Ok(Role::Observer),
      other => Err(AuthError::InvalidRequest(format!("unknown role '{other}'"))),
    }
  }
}

/// Claim set carried by a capability token.
///
/// ## Fields
/// - `game_id`: Game the token grants access to.
/// - `role`: Host, player or observer.
/// - `player_id`: Seat index; required for players, absent otherwise.
/// - `display_name`: Optional name shown to other participants.
/// - `exp`: Expiration as a UNIX timestamp in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
  pub game_id: String,
  pub role: Role,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub player_id: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub display_name: Option<String>,
  pub exp: i64,
}

/// Mints and validates capability tokens with a process-wide secret.
///
/// Validation is stateless; the issuer can be cloned freely across sessions.
#[derive(Clone)]
pub struct TokenIssuer {
  encoding_key: EncodingKey,
  decoding_key: DecodingKey,
}

impl std::fmt::Debug for TokenIssuer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TokenIssuer").field("algorithm", &Algorithm::HS256).finish()
  }
}

impl TokenIssuer {
  /// Creates a new issuer.
  ///
  /// ## Parameters
  /// - `secret`: The HMAC key used to sign and verify tokens.
  pub fn new(secret: &str) -> Self {
    Self {
      encoding_key: EncodingKey::from_secret(secret.as_bytes()),
      decoding_key: DecodingKey::from_secret(secret.as_bytes()),
    }
  }

  /// Mints a token for a role in a game.
  ///
  /// ## Parameters
  /// - `game_id`: Game the token is scoped to.
  /// - `role`: Role to grant.
  /// - `ttl_secs`: Lifetime in seconds, must be positive.
  /// - `player_id`: Seat index, required when `role` is [`Role::Player`]; ignored otherwise.
  /// - `display_name`: Optional display name.
  ///
  /// ## Returns
  /// - `Result<String, AuthError>`: Encoded token, or `InvalidRequest` when the arguments are inconsistent.
  pub fn mint(
    &self,
    game_id: &str,
    role: Role,
    ttl_secs: i64,
    player_id: Option<u32>,
    display_name: Option<String>,
  ) -> Result<String, AuthError> {
    if ttl_secs <= 0 {
      return Err(AuthError::InvalidRequest("ttl must be positive".into()));
    }
    let player_id = match role {
      Role::Player => Some(
        player_id.ok_or_else(|| AuthError::InvalidRequest("player_id required for player token".into()))?,
      ),
      Role::Host | Role::Observer => None,
    };

    let exp = chrono::Utc::now().timestamp().saturating_add(ttl_secs);
    let claims = Claims {
      game_id: game_id.to_string(),
      role,
      player_id,
      display_name: display_name.filter(|n| !n.is_empty()),
      exp,
    };
    self.sign(&claims)
  }

  /// Signs an explicit claim set without any consistency checks.
  pub fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
    encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
      .map_err(|e| AuthError::Malformed(format!("failed to encode token: {e}")))
  }

  /// Verifies a token and returns its claims.
  ///
  /// ## Parameters
  /// - `token`: Encoded token.
  /// - `expected_game_id`: When given, the claim must name the same game.
  ///
  /// ## Returns
  /// - `Err(AuthError::Expired)` when `exp` has passed.
  /// - `Err(AuthError::Malformed)` when decoding or signature verification fails.
  /// - `Err(AuthError::GameMismatch)` when the game ids disagree.
  pub fn validate(&self, token: &str, expected_game_id: Option<&str>) -> Result<Claims, AuthError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;

    let claims = decode::<Claims>(token, &self.decoding_key, &validation)
      .map_err(|e| match e.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        _ => AuthError::Malformed(e.to_string()),
      })?
      .claims;

    if let Some(expected) = expected_game_id {
      if claims.game_id != expected {
        return Err(AuthError::GameMismatch {
          expected: expected.to_string(),
          claimed: claims.game_id,
        });
      }
    }
    Ok(claims)
  }

  /// Validates a host token for `game_id`.
  pub fn require_host(&self, token: &str, game_id: &str) -> Result<Claims, AuthError> {
    let claims = self.validate(token, Some(game_id))?;
    if claims.role != Role::Host {
      return Err(AuthError::InvalidRequest(format!("{} token cannot administer a game", claims.role)));
    }
    Ok(claims)
  }
}

/// ######################################## TESTS ########################################
