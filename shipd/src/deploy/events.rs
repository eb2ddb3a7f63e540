//! Deployment event fan-out
//!
//! Delivery is at-most-once and best effort: a full mailbox drops the event
//! for that subscriber only. Consumers needing authoritative state poll the
//! queue instead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::Stream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};

use crate::models::job::DeployEvent;

/// Registry of subscriber mailboxes keyed by client ID
pub struct EventBus {
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<DeployEvent>>>>,
    mailbox_capacity: usize,
}

impl EventBus {
    pub fn new(mailbox_capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            mailbox_capacity: mailbox_capacity.max(1),
        }
    }

    /// Register a new mailbox for `client_id`
    pub fn subscribe(&self, client_id: &str) -> mpsc::Receiver<DeployEvent> {
        let (tx, rx) = mpsc::channel(self.mailbox_capacity);
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.entry(client_id.to_string()).or_default().push(tx);
        debug!("Client {} subscribed to deploy events", client_id);
        rx
    }

    /// Close and remove every mailbox of `client_id`
    pub fn unsubscribe(&self, client_id: &str) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        if subscribers.remove(client_id).is_some() {
            debug!("Client {} unsubscribed from deploy events", client_id);
        }
    }

    /// Offer `event` to every mailbox without waiting; returns how many accepted it
    pub fn publish(&self, event: &DeployEvent) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let mut delivered = 0;

        subscribers.retain(|client_id, mailboxes| {
            mailboxes.retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    trace!("Mailbox of {} is full, dropping event {}", client_id, event.job_id);
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            });
            !mailboxes.is_empty()
        });

        delivered
    }

    /// Number of clients with at least one open mailbox
    pub fn subscriber_count(&self) -> usize {
        let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.len()
    }
}

/// Mailbox that unsubscribes its client when dropped
pub struct Subscription {
    bus: Arc<EventBus>,
    client_id: String,
    rx: mpsc::Receiver<DeployEvent>,
}

impl Subscription {
    pub fn open(bus: Arc<EventBus>, client_id: impl Into<String>) -> Self {
        let client_id = client_id.into();
        let rx = bus.subscribe(&client_id);
        Self { bus, client_id, rx }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Next event, `None` once the mailbox is closed
    pub async fn recv(&mut self) -> Option<DeployEvent> {
        self.rx.recv().await
    }

    /// Stream of events; dropping the stream unsubscribes
    pub fn into_stream(self) -> impl Stream<Item = DeployEvent> + Send {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription.recv().await.map(|event| (event, subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.client_id);
    }
}
