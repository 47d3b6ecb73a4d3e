//! Fanload process runtime
//!
//! Connects to the broker once at start-up and serves the HTTP trigger surface. Every trigger
//! starts `parallel_batch` independent runs in the background.
use crate::{
    error::RuntimeError,
    server::{server_task, ServerState},
};
use clap::Parser;
use fanload::broker::NatsBroker;
use fanload::HarnessError;
use fanload_core::{
    HarnessConfig, RunConfig, DEFAULT_BROKER_ADDRESS, DEFAULT_OUTPUT_DIR, DEFAULT_PAYLOAD_SIZE,
    DEFAULT_PUBLISH_RATE, DEFAULT_SUBJECT_PREFIX, DEFAULT_TARGET_COUNT,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;
#[allow(unused)]
use tracing::{debug, error, info, instrument, Instrument};

const DEFAULT_PORT: u16 = 8080;

#[derive(Parser, Debug)]
#[command(version, about = "Publish-subscribe latency harness")]
struct FanloadCli {
    #[arg(short, long, env = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Broker address, `nats://host:port` or `host:port`
    #[arg(short, long, env = "NATS_URL", default_value = DEFAULT_BROKER_ADDRESS)]
    broker: String,

    /// Shards per run
    #[arg(short, long, env = "SEQUENTIAL_BATCH", default_value_t = 1)]
    shards: usize,

    /// Concurrent runs per trigger
    #[arg(long, env = "PARALLEL_BATCH", default_value_t = 1)]
    parallel: usize,

    /// Rounds per second
    #[arg(short, long, env = "PUB_RATE_PER_SEC", default_value_t = DEFAULT_PUBLISH_RATE)]
    rate: NonZeroU32,

    #[arg(short('n'), long, env = "NO_OF_MSGS", default_value_t = DEFAULT_TARGET_COUNT)]
    rounds: u64,

    #[arg(long, env = "MSG_SIZE", default_value_t = DEFAULT_PAYLOAD_SIZE)]
    payload_size: usize,

    #[arg(long, env = "HISTOGRAM_DIR", default_value = DEFAULT_OUTPUT_DIR)]
    output_dir: PathBuf,

    #[arg(long, default_value = DEFAULT_SUBJECT_PREFIX)]
    subject_prefix: String,

    /// Run deadline, e.g. `2m`. Derived from the publishing time when absent.
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,
}

impl FanloadCli {
    fn harness(&self) -> HarnessConfig {
        let mut run = RunConfig::default()
            .shards(self.shards)
            .rounds(self.rounds)
            .rate(self.rate)
            .payload_size(self.payload_size)
            .output_dir(self.output_dir.clone());
        run.timeout = self.timeout;

        HarnessConfig {
            parallel_batch: self.parallel,
            broker_address: self.broker.clone(),
            subject_prefix: self.subject_prefix.clone(),
            run,
        }
    }
}

/// Fanload process runtime.
///
/// # Example
///
/// ```no_run
/// use fanload_runtime::FanloadRuntime;
///
/// #[tokio::main]
/// async fn main() {
///     if let Err(err) = FanloadRuntime::new().with_args().run().await {
///         eprintln!("{err}");
///         std::process::exit(1);
///     }
/// }
/// ```
pub struct FanloadRuntime {
    port: u16,
    harness: HarnessConfig,
    metrics_addr: Option<SocketAddr>,
}

impl Default for FanloadRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FanloadRuntime {
    pub fn new() -> Self {
        FanloadRuntime {
            port: DEFAULT_PORT,
            harness: HarnessConfig::default(),
            metrics_addr: None,
        }
    }

    /// Read configuration from the command line, falling back to the environment.
    ///
    /// ```ignore
    /// $ fanload-runtime --shards 10 --parallel 2 --rate 10 -n 1000
    /// $ SEQUENTIAL_BATCH=10 NATS_URL=nats://broker:4222 fanload-runtime
    /// ```
    pub fn with_args(mut self) -> Self {
        let args = FanloadCli::parse();
        self.port = args.port;
        self.harness = args.harness();
        self.metrics_addr = args.metrics_addr;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn harness(mut self, harness: HarnessConfig) -> Self {
        self.harness = harness;
        self
    }

    pub fn metrics_addr(mut self, addr: SocketAddr) -> Self {
        self.metrics_addr = Some(addr);
        self
    }

    /// Connect to the broker and serve until the listener fails.
    ///
    /// A broker that cannot be reached at start-up is an error; nothing is served.
    #[instrument(name = "fanload", skip_all, fields(port = self.port))]
    pub async fn run(self) -> Result<(), RuntimeError> {
        self.harness.validate()?;

        if let Some(addr) = self.metrics_addr {
            PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .map_err(|err| RuntimeError::Metrics(err.to_string()))?;
            info!("Prometheus metrics served on {addr}");
        }

        let broker = NatsBroker::connect(&self.harness.broker_address)
            .await
            .map_err(HarnessError::Connect)?;
        info!("Connected to {}", self.harness.broker_address);

        server_task(self.port, ServerState::new(broker, self.harness)).await
    }
}
