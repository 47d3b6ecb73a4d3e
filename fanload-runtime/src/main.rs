use fanload_runtime::FanloadRuntime;
use tracing::error;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fanload=info"));
    FmtSubscriber::builder().with_env_filter(filter).init();

    if let Err(err) = FanloadRuntime::new().with_args().run().await {
        error!("Fanload runtime failed: {err}");
        std::process::exit(1);
    }
}
