use std::net::SocketAddr;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mock_broker=info"));
    FmtSubscriber::builder().with_env_filter(filter).init();

    let addr: SocketAddr = std::env::var("MOCK_BROKER_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:4222".to_string())
        .parse()?;
    mock_broker::run(addr).await?;
    Ok(())
}
