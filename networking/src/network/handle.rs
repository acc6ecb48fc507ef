use async_trait::async_trait;
use libp2p_identity::PeerId;
use tokio::sync::{mpsc, oneshot};

use crate::pubsub::{PubSub, PubSubError, PubSubResult, Subscription};
use crate::types::OverlayCommand;

/// Cloneable access to a running [`super::NetworkService`].
///
/// Every call is forwarded to the swarm event loop and answered over a
/// oneshot channel. Calls fail with [`PubSubError::ServiceStopped`] once
/// the event loop has exited.
#[derive(Debug, Clone)]
pub struct PubSubHandle {
    commands: mpsc::UnboundedSender<OverlayCommand>,
    local_peer_id: PeerId,
}

impl PubSubHandle {
    pub(crate) fn new(commands: mpsc::UnboundedSender<OverlayCommand>, local_peer_id: PeerId) -> Self {
        Self {
            commands,
            local_peer_id,
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> OverlayCommand,
    ) -> PubSubResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| PubSubError::ServiceStopped)?;

        response.await.map_err(|_| PubSubError::ServiceStopped)
    }
}

#[async_trait]
impl PubSub for PubSubHandle {
    async fn topics(&self) -> PubSubResult<Vec<String>> {
        self.request(|reply| OverlayCommand::Topics { reply }).await
    }

    async fn list_peers(&self, topic: &str) -> PubSubResult<Vec<PeerId>> {
        let topic = topic.to_string();
        self.request(|reply| OverlayCommand::ListPeers { topic, reply })
            .await
    }

    async fn subscribe(&self, topic: &str) -> PubSubResult<Subscription> {
        let topic = topic.to_string();
        self.request(|reply| OverlayCommand::Subscribe { topic, reply })
            .await?
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> PubSubResult<()> {
        let topic = topic.to_string();
        self.request(|reply| OverlayCommand::Publish { topic, data, reply })
            .await?
    }
}
