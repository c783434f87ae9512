//! Process configuration from the environment (and `.env`).

use anyhow::{Context, Result};
use std::{str::FromStr, time::Duration};

pub const DEFAULT_SECRET: &str = "devsecret";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedOrigins {
  Any,
  List(Vec<String>),
}

impl AllowedOrigins {
  fn parse(raw: &str) -> Self {
    let origins: Vec<String> = raw
      .split(',')
      .map(str::trim)
      .filter(|o| !o.is_empty())
      .map(ToOwned::to_owned)
      .collect();
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
      AllowedOrigins::Any
    } else {
      AllowedOrigins::List(origins)
    }
  }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
  pub host: String,
  pub port: u16,
  pub secret_key: String,
  pub redis_url: Option<String>,
  pub cors_allowed_origins: AllowedOrigins,
  pub forwarder_stop_timeout: Duration,
  pub default_token_ttl_minutes: i64,
  pub max_message_bytes: usize,
  pub max_messages_per_second: u32,
}

impl Default for GatewayConfig {
  fn default() -> Self {
    Self {
      host: "0.0.0.0".to_string(),
      port: 3000,
      secret_key: DEFAULT_SECRET.to_string(),
      redis_url: None,
      cors_allowed_origins: AllowedOrigins::Any,
      forwarder_stop_timeout: crate::session::FORWARDER_STOP_TIMEOUT,
      default_token_ttl_minutes: 60,
      max_message_bytes: 64 * 1024,
      max_messages_per_second: 20,
    }
  }
}

impl GatewayConfig {
  /// Load `.env` if present, then read the process environment.
  pub fn from_env() -> Result<Self> {
    dotenv::dotenv().ok();
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  /// Build a configuration from an arbitrary variable lookup.
  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let defaults = Self::default();
    let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    let secret_key = match var("SECRET_KEY") {
      Some(secret) => secret,
      None => {
        tracing::warn!("SECRET_KEY not set, using the development secret");
        defaults.secret_key
      }
    };

    Ok(Self {
      host: var("HOST").unwrap_or(defaults.host),
      port: parse(&var, "PORT", defaults.port)?,
      secret_key,
      redis_url: var("REDIS_URL"),
      cors_allowed_origins: var("CORS_ALLOWED_ORIGINS")
        .map(|raw| AllowedOrigins::parse(&raw))
        .unwrap_or(defaults.cors_allowed_origins),
      forwarder_stop_timeout: Duration::from_millis(parse(
        &var,
        "FORWARDER_STOP_TIMEOUT_MS",
        defaults.forwarder_stop_timeout.as_millis() as u64,
      )?),
      default_token_ttl_minutes: parse(&var, "DEFAULT_TOKEN_TTL_MINUTES", defaults.default_token_ttl_minutes)?,
      max_message_bytes: parse(&var, "MAX_MESSAGE_BYTES", defaults.max_message_bytes)?,
      max_messages_per_second: parse(&var, "MAX_MESSAGES_PER_SECOND", defaults.max_messages_per_second)?,
    })
  }

  pub fn addr(&self) -> String {
    format!("{}:{}", self.host, self.port)
  }
}

fn parse<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
  T: FromStr,
  T::Err: std::error::Error + Send + Sync + 'static,
{
  match var(key) {
    Some(raw) => raw.trim().parse().with_context(|| format!("invalid {key}: '{raw}'")),
    None => Ok(default),
  }
}
