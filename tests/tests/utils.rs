use std::net::SocketAddr;
use std::sync::OnceLock;
use tracing::error;
use tracing_subscriber::FmtSubscriber;

/// Address of a mock broker shared by every test in the binary.
///
/// The broker gets its own runtime on a dedicated thread, since each `#[tokio::test]` tears its
/// runtime down when it returns.
#[allow(unused)]
pub fn init() -> SocketAddr {
    static BROKER: OnceLock<SocketAddr> = OnceLock::new();

    *BROKER.get_or_init(|| {
        let default_panic = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            default_panic(info);
            error!("Panic occurred: {info:?}");
            std::process::exit(1);
        }));

        let _ = FmtSubscriber::builder()
            .with_env_filter("fanload=debug,mock_broker=info")
            .try_init();

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async move {
                let addr = mock_broker::spawn("127.0.0.1:0".parse().unwrap())
                    .await
                    .unwrap();
                tx.send(addr).unwrap();
                std::future::pending::<()>().await;
            });
        });
        rx.recv().unwrap()
    })
}

#[allow(unused)]
pub fn broker_url() -> String {
    format!("nats://{}", init())
}
