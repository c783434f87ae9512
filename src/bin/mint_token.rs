//! Mint a capability token for local testing.
//!
//! ```text
//! SECRET_KEY=devsecret mint-token --game-id TEST01 --role player --player-id 0
//! ```

use anyhow::Context;
use briscola_gateway::{config::DEFAULT_SECRET, Role, TokenIssuer};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "mint-token", about = "Mint a briscola gateway capability token")]
struct Args {
  /// Game the token is scoped to
  #[arg(long)]
  game_id: String,

  /// host, player or observer
  #[arg(long, default_value = "player")]
  role: Role,

  /// Seat index, required for players
  #[arg(long)]
  player_id: Option<u32>,

  #[arg(long)]
  display_name: Option<String>,

  #[arg(long, default_value_t = 60)]
  ttl_minutes: i64,

  /// HMAC secret shared with the gateway
  #[arg(long, env = "SECRET_KEY", default_value = DEFAULT_SECRET)]
  secret: String,
}

fn main() -> anyhow::Result<()> {
  dotenv::dotenv().ok();
  let args = Args::parse();

  let issuer = TokenIssuer::new(&args.secret);
  let token = issuer
    .mint(
      &args.game_id,
      args.role,
      args.ttl_minutes.saturating_mul(60),
      args.player_id,
      args.display_name,
    )
    .context("failed to mint token")?;

  println!("{token}");
  Ok(())
}
