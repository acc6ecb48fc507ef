/// Pub/Sub Overlay Contract
///
/// The four operations a gateway consumes from the pub/sub overlay, the
/// message record the overlay delivers, and the subscription handle that
/// releases itself when dropped.
///
/// ## Implementations
///
/// | Type                                   | Backing                              |
/// |----------------------------------------|--------------------------------------|
/// | [`crate::network::PubSubHandle`]       | libp2p gossipsub swarm event loop    |
/// | [`crate::memory::MemoryPubSub`]        | in-process, single node              |
use std::fmt;

use async_trait::async_trait;
use libp2p_identity::PeerId;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors reported by the overlay.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PubSubError {
    /// The topic name is not acceptable to the overlay.
    #[error("invalid topic name {0:?}")]
    InvalidTopic(String),

    /// The overlay refused to join the topic.
    #[error("failed to subscribe to topic {topic}: {reason}")]
    Subscribe { topic: String, reason: String },

    /// The overlay refused to publish on the topic.
    #[error("failed to publish to topic {topic}: {reason}")]
    Publish { topic: String, reason: String },

    /// The overlay stopped feeding this subscription.
    #[error("subscription closed")]
    SubscriptionClosed,

    /// The overlay service is no longer running.
    #[error("pubsub service stopped")]
    ServiceStopped,
}

pub type PubSubResult<T> = Result<T, PubSubError>;

/// A message as delivered by the overlay.
///
/// `seqno` holds the sender's sequence counter as 8 big-endian bytes, the
/// same layout libp2p pubsub implementations put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    /// Original author of the message.
    pub from: PeerId,

    /// Application payload.
    pub data: Vec<u8>,

    /// Sender sequence number, big-endian.
    pub seqno: Vec<u8>,

    /// Topics the message was published to.
    pub topic_ids: Vec<String>,

    /// Author signature over the message.
    pub signature: Vec<u8>,

    /// Author public key, protobuf encoded, when it cannot be derived from `from`.
    pub key: Option<Vec<u8>>,
}

/// Encodes a sequence counter the way it travels inside pubsub messages.
pub fn encode_seqno(seqno: u64) -> Vec<u8> {
    seqno.to_be_bytes().to_vec()
}

/// Access to a pub/sub overlay.
///
/// Implementations must be safe to share between concurrent callers.
#[async_trait]
pub trait PubSub: Send + Sync + 'static {
    /// Topics the local node is currently subscribed to.
    async fn topics(&self) -> PubSubResult<Vec<String>>;

    /// Peers known to be subscribed to `topic`. Unknown topics have no peers.
    async fn list_peers(&self, topic: &str) -> PubSubResult<Vec<PeerId>>;

    /// Opens a subscription to `topic`.
    async fn subscribe(&self, topic: &str) -> PubSubResult<Subscription>;

    /// Publishes `data` to `topic`.
    async fn publish(&self, topic: &str, data: Vec<u8>) -> PubSubResult<()>;
}

type ReleaseFn = Box<dyn FnOnce() + Send + Sync>;

/// Receive side of a single topic subscription.
///
/// The subscription is released in the overlay when this value is dropped.
pub struct Subscription {
    topic: String,
    receiver: mpsc::Receiver<PubSubMessage>,
    release: Option<ReleaseFn>,
}

impl Subscription {
    pub fn new<F>(topic: impl Into<String>, receiver: mpsc::Receiver<PubSubMessage>, release: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            topic: topic.into(),
            receiver,
            release: Some(Box::new(release)),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Waits for the next message on the topic.
    ///
    /// Cancel-safe: dropping the returned future loses no message.
    pub async fn next(&mut self) -> PubSubResult<PubSubMessage> {
        self.receiver
            .recv()
            .await
            .ok_or(PubSubError::SubscriptionClosed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}
