//! Broker abstraction
//!
//! The harness only needs three operations from a broker: fire-and-forget publishes, a flush
//! that forces delivery of everything published so far, and ordered per-subject subscriptions.
//! Connection setup is the caller's concern; a handle is cloned into every task that needs it.
use bytes::Bytes;
use std::sync::PoisonError;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

mod loopback;
mod nats;

pub use loopback::LoopbackBroker;
pub use nats::NatsBroker;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Unable to connect: {0}")]
    Connect(#[from] async_nats::ConnectError),

    #[error("Publish failed: {0}")]
    Publish(#[from] async_nats::PublishError),

    #[error("Flush failed: {0}")]
    Flush(#[from] async_nats::client::FlushError),

    #[error("Subscribe failed: {0}")]
    Subscribe(#[from] async_nats::SubscribeError),

    #[error("Invalid subject {0:?}")]
    Subject(String),

    #[error("Broker rejected the operation: {0}")]
    Rejected(String),

    #[error("Broker state lock is poisoned")]
    PoisonData,
}

impl BrokerError {
    /// Failures of the connection itself, as opposed to a refused or malformed operation.
    pub fn is_transport(&self) -> bool {
        use BrokerError::*;
        match self {
            Connect(_) | Publish(_) | Flush(_) | Subscribe(_) => true,
            Subject(_) | Rejected(_) | PoisonData => false,
        }
    }
}

impl<T> From<PoisonError<T>> for BrokerError {
    fn from(_err: PoisonError<T>) -> Self {
        Self::PoisonData
    }
}

#[trait_variant::make(Broker: Send)]
pub trait LocalBroker: Clone + Sync + 'static {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Resolves once every earlier publish has been handed to the broker.
    async fn flush(&self) -> Result<(), BrokerError>;

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BrokerError>;
}

/// Payloads delivered to one subject, in delivery order.
pub struct Subscription {
    subject: String,
    rx: UnboundedReceiver<Bytes>,
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new(
        subject: &str,
        rx: UnboundedReceiver<Bytes>,
        detach: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            subject: subject.to_string(),
            rx,
            detach: Some(Box::new(detach)),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next payload, or `None` once the broker side is gone.
    pub async fn next(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.subject)
            .finish()
    }
}
