pub mod bootnodes;
pub mod gossipsub;
pub mod memory;
pub mod network;
pub mod pubsub;
pub mod subscribers;
pub mod types;

pub use memory::MemoryPubSub;
pub use network::{NetworkService, NetworkServiceConfig, PubSubHandle};
pub use pubsub::{PubSub, PubSubError, PubSubMessage, PubSubResult, Subscription, encode_seqno};
