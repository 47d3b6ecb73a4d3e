use super::{Broker, BrokerError, Subscription};
use async_nats::connection::State;
use async_nats::{Client, ConnectOptions};
use bytes::Bytes;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc::unbounded_channel;
#[allow(unused)]
use tracing::{debug, error, info, instrument, trace, warn, Instrument};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// NATS broker handle. Clones share one connection.
#[derive(Clone, Debug)]
pub struct NatsBroker {
    client: Client,
}

impl NatsBroker {
    /// Connect to `nats://host:port` (or bare `host:port`).
    #[instrument(name = "nats", skip_all, fields(address = address))]
    pub async fn connect(address: &str) -> Result<Self, BrokerError> {
        let client = ConnectOptions::new()
            .name("fanload")
            .connection_timeout(CONNECT_TIMEOUT)
            .connect(address)
            .await?;
        debug!("Connected.");
        Ok(Self { client })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.client.connection_state(), State::Disconnected)
    }
}

impl Broker for NatsBroker {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError> {
        check_subject(subject)?;
        self.client.publish(subject.to_string(), payload).await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), BrokerError> {
        self.client.flush().await?;
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BrokerError> {
        check_subject(subject)?;
        let mut subscriber = self.client.subscribe(subject.to_string()).await?;
        let (tx, rx) = unbounded_channel();

        // Dropping the subscriber unsubscribes, so aborting the forwarder detaches.
        let forward = tokio::spawn(
            async move {
                while let Some(message) = subscriber.next().await {
                    if tx.send(message.payload).is_err() {
                        break;
                    }
                }
            }
            .in_current_span(),
        );
        trace!("Subscribed to {subject}");

        let forward = forward.abort_handle();
        Ok(Subscription::new(subject, rx, move || forward.abort()))
    }
}

fn check_subject(subject: &str) -> Result<(), BrokerError> {
    if subject.is_empty() || subject.contains(char::is_whitespace) {
        Err(BrokerError::Subject(subject.to_string()))
    } else {
        Ok(())
    }
}
