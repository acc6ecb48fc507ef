use std::collections::HashMap;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{trace, warn};

use crate::pubsub::PubSubMessage;

/// Number of undelivered messages a subscription may hold before new ones are dropped.
pub const SUBSCRIPTION_BUFFER: usize = 32;

pub type SubscriberId = u64;

/// Local fan-out table from topic to live subscription senders.
#[derive(Debug, Default)]
pub struct Subscribers {
    by_topic: HashMap<String, Vec<(SubscriberId, mpsc::Sender<PubSubMessage>)>>,
    next_id: SubscriberId,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber on `topic` and returns its id and feed.
    pub fn add(
        &mut self,
        topic: &str,
        buffer: usize,
    ) -> (SubscriberId, mpsc::Receiver<PubSubMessage>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let id = self.next_id;
        self.next_id += 1;

        self.by_topic
            .entry(topic.to_string())
            .or_default()
            .push((id, sender));

        (id, receiver)
    }

    /// Removes a subscriber. Returns `true` when `topic` has no subscribers left.
    pub fn remove(&mut self, topic: &str, id: SubscriberId) -> bool {
        let Some(entries) = self.by_topic.get_mut(topic) else {
            return true;
        };

        entries.retain(|(entry_id, _)| *entry_id != id);
        if entries.is_empty() {
            self.by_topic.remove(topic);
            return true;
        }

        false
    }

    /// Hands `message` to every subscriber of `topic` without waiting.
    ///
    /// Subscribers whose buffer is full miss the message. Subscribers whose
    /// receiver is gone are dropped from the table.
    pub fn deliver(&mut self, topic: &str, message: &PubSubMessage) -> usize {
        let Some(entries) = self.by_topic.get_mut(topic) else {
            return 0;
        };

        let mut delivered = 0;
        entries.retain(|(id, sender)| match sender.try_send(message.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(topic, subscriber = id, "Subscriber too slow, dropping message");
                true
            }
            Err(TrySendError::Closed(_)) => {
                trace!(topic, subscriber = id, "Subscriber gone");
                false
            }
        });

        if entries.is_empty() {
            self.by_topic.remove(topic);
        }

        delivered
    }

    pub fn count(&self, topic: &str) -> usize {
        self.by_topic.get(topic).map_or(0, Vec::len)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.count(topic) > 0
    }
}
