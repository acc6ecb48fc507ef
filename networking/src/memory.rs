/// In-Process Pub/Sub
///
/// A single-node overlay that keeps topic membership, peer sets and
/// subscriptions in memory. Peers are registered by hand and remote
/// traffic is simulated with [`MemoryPubSub::inject`], which makes it the
/// overlay of choice for tests and for running a gateway without a
/// network.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use libp2p_identity::{Keypair, PeerId};
use parking_lot::Mutex;
use tracing::debug;

use crate::pubsub::{
    PubSub, PubSubError, PubSubMessage, PubSubResult, Subscription, encode_seqno,
};
use crate::subscribers::{SUBSCRIPTION_BUFFER, Subscribers};

#[derive(Debug, Default)]
struct MemoryState {
    /// Joined topics, in join order.
    topics: Vec<String>,
    /// Topics joined explicitly; kept after their last subscriber leaves.
    pinned: HashSet<String>,
    peers: HashMap<String, Vec<PeerId>>,
    subscribers: Subscribers,
    seqno: u64,
}

impl MemoryState {
    fn join(&mut self, topic: &str) {
        if !self.topics.iter().any(|joined| joined == topic) {
            self.topics.push(topic.to_string());
        }
    }

    fn leave(&mut self, topic: &str) {
        self.topics.retain(|joined| joined != topic);
    }
}

#[derive(Clone)]
pub struct MemoryPubSub {
    keypair: Keypair,
    peer_id: PeerId,
    buffer: usize,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::with_keypair(Keypair::generate_secp256k1())
    }

    pub fn with_keypair(keypair: Keypair) -> Self {
        let peer_id = keypair.public().to_peer_id();
        Self {
            keypair,
            peer_id,
            buffer: SUBSCRIPTION_BUFFER,
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// Sets how many undelivered messages each subscription may queue.
    pub fn with_subscription_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Joins `topic` independently of any subscription.
    pub fn join(&self, topic: &str) {
        let mut state = self.state.lock();
        state.pinned.insert(topic.to_string());
        state.join(topic);
    }

    /// Records `peer` as a subscriber of `topic`.
    pub fn add_peer(&self, topic: &str, peer: PeerId) {
        let mut state = self.state.lock();
        let peers = state.peers.entry(topic.to_string()).or_default();
        if !peers.contains(&peer) {
            peers.push(peer);
        }
    }

    pub fn remove_peer(&self, topic: &str, peer: &PeerId) {
        let mut state = self.state.lock();
        if let Some(peers) = state.peers.get_mut(topic) {
            peers.retain(|known| known != peer);
        }
    }

    /// Delivers `message` to local subscribers of each of its topics, as if
    /// it had been received from the network. Returns the number of feeds
    /// that accepted it.
    pub fn inject(&self, message: PubSubMessage) -> usize {
        let mut state = self.state.lock();
        message
            .topic_ids
            .iter()
            .map(|topic| state.subscribers.deliver(topic, &message))
            .sum()
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state.lock().subscribers.count(topic)
    }
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn topics(&self) -> PubSubResult<Vec<String>> {
        Ok(self.state.lock().topics.clone())
    }

    async fn list_peers(&self, topic: &str) -> PubSubResult<Vec<PeerId>> {
        Ok(self
            .state
            .lock()
            .peers
            .get(topic)
            .cloned()
            .unwrap_or_default())
    }

    async fn subscribe(&self, topic: &str) -> PubSubResult<Subscription> {
        if topic.is_empty() {
            return Err(PubSubError::InvalidTopic(topic.to_string()));
        }

        let (id, receiver) = {
            let mut state = self.state.lock();
            state.join(topic);
            state.subscribers.add(topic, self.buffer)
        };
        debug!(topic, subscriber = id, "Opened in-memory subscription");

        let state = Arc::downgrade(&self.state);
        let owned_topic = topic.to_string();
        Ok(Subscription::new(topic, receiver, move || {
            let Some(state) = state.upgrade() else {
                return;
            };
            let mut state = state.lock();
            if state.subscribers.remove(&owned_topic, id) && !state.pinned.contains(&owned_topic) {
                state.leave(&owned_topic);
            }
            debug!(topic = %owned_topic, subscriber = id, "Released in-memory subscription");
        }))
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> PubSubResult<()> {
        if topic.is_empty() {
            return Err(PubSubError::InvalidTopic(topic.to_string()));
        }

        let signature = self
            .keypair
            .sign(&data)
            .map_err(|err| PubSubError::Publish {
                topic: topic.to_string(),
                reason: err.to_string(),
            })?;

        let mut state = self.state.lock();
        state.seqno += 1;
        let message = PubSubMessage {
            from: self.peer_id,
            data,
            seqno: encode_seqno(state.seqno),
            topic_ids: vec![topic.to_string()],
            signature,
            key: None,
        };
        state.subscribers.deliver(topic, &message);

        Ok(())
    }
}
