use super::{Broker, BrokerError, Subscription};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::trace;

/// In-process broker. Delivery is synchronous with `publish`, so `flush` has nothing to do.
#[derive(Clone, Default)]
pub struct LoopbackBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    routes: Mutex<Routes>,
    next_id: AtomicU64,
    fail_publishes: AtomicBool,
}

#[derive(Default)]
struct Routes {
    subscribers: HashMap<String, Vec<(u64, UnboundedSender<Bytes>)>>,
    held: HashMap<String, Vec<Bytes>>,
}

impl Routes {
    fn deliver(&mut self, subject: &str, payload: Bytes) {
        if let Some(held) = self.held.get_mut(subject) {
            held.push(payload);
            return;
        }
        if let Some(subscribers) = self.subscribers.get_mut(subject) {
            subscribers.retain(|(_, tx)| tx.send(payload.clone()).is_ok());
        }
    }
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following publish fail, as a broker write error would.
    pub fn fail_publishes(&self, fail: bool) {
        self.inner.fail_publishes.store(fail, Ordering::Relaxed);
    }

    /// Buffer messages for `subject` until [`LoopbackBroker::release`] is called.
    pub fn hold(&self, subject: &str) -> Result<(), BrokerError> {
        self.inner
            .routes
            .lock()?
            .held
            .entry(subject.to_string())
            .or_default();
        Ok(())
    }

    pub fn release(&self, subject: &str) -> Result<usize, BrokerError> {
        let mut routes = self.inner.routes.lock()?;
        let held = routes.held.remove(subject).unwrap_or_default();
        let count = held.len();
        for payload in held {
            routes.deliver(subject, payload);
        }
        Ok(count)
    }

    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.inner
            .routes
            .lock()
            .map(|routes| routes.subscribers.get(subject).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

impl Broker for LoopbackBroker {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError> {
        if self.inner.fail_publishes.load(Ordering::Relaxed) {
            return Err(BrokerError::Rejected(format!("publish to {subject} refused")));
        }
        trace!("loopback publish to {subject}");
        self.inner.routes.lock()?.deliver(subject, payload);
        Ok(())
    }

    async fn flush(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BrokerError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded_channel();
        self.inner
            .routes
            .lock()?
            .subscribers
            .entry(subject.to_string())
            .or_default()
            .push((id, tx));

        let inner = Arc::downgrade(&self.inner);
        let key = subject.to_string();
        Ok(Subscription::new(subject, rx, move || {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if let Ok(mut routes) = inner.routes.lock() {
                if let Some(subscribers) = routes.subscribers.get_mut(&key) {
                    subscribers.retain(|(sid, _)| *sid != id);
                }
            };
        }))
    }
}
