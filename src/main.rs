#[tokio::main]
async fn main() -> anyhow::Result<()> {
  briscola_gateway::run().await
}
