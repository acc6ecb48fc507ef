use libp2p_identity::PeerId;
use tokio::sync::oneshot;

use crate::pubsub::{PubSubResult, Subscription};
use crate::subscribers::SubscriberId;

/// Peer connection state as observed from swarm events.
///
/// DISCONNECTED -> CONNECTING -> CONNECTED -> DISCONNECTED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No active connection to this peer.
    Disconnected,
    /// Dial in progress.
    Connecting,
    /// Transport established.
    Connected,
}

/// Requests handed from [`crate::network::PubSubHandle`] to the swarm event loop.
#[derive(Debug)]
pub enum OverlayCommand {
    Topics {
        reply: oneshot::Sender<Vec<String>>,
    },
    ListPeers {
        topic: String,
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    Subscribe {
        topic: String,
        reply: oneshot::Sender<PubSubResult<Subscription>>,
    },
    Unsubscribe {
        topic: String,
        subscriber: SubscriberId,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<PubSubResult<()>>,
    },
}

impl OverlayCommand {
    pub fn name(&self) -> &'static str {
        match self {
            OverlayCommand::Topics { .. } => "topics",
            OverlayCommand::ListPeers { .. } => "list_peers",
            OverlayCommand::Subscribe { .. } => "subscribe",
            OverlayCommand::Unsubscribe { .. } => "unsubscribe",
            OverlayCommand::Publish { .. } => "publish",
        }
    }
}
