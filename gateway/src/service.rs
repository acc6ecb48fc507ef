use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use metrics::SharedMetrics;
use networking::{PubSub, Subscription};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};

use crate::error::pubsub_status;
use crate::proto::{
    list_peers_response::Peer, pub_sub_service_server::PubSubService, Empty, ListPeersRequest,
    ListPeersResponse, PubSubMessageResponse, PublishRequest, SubscribeRequest, TopicsResponse,
};

type SubscribeItem = Result<PubSubMessageResponse, Status>;

pub type SubscribeStream = Pin<Box<dyn Stream<Item = SubscribeItem> + Send>>;

/// gRPC front of a [`PubSub`] overlay.
///
/// Holds no state of its own beyond the shared overlay handle; every call
/// is served independently.
pub struct PubSubGateway<P: ?Sized> {
    pubsub: Arc<P>,
    metrics: SharedMetrics,
    shutdown: CancellationToken,
}

impl<P: PubSub + ?Sized> PubSubGateway<P> {
    /// `shutdown` ends every open Subscribe stream when cancelled.
    pub fn new(pubsub: Arc<P>, metrics: SharedMetrics, shutdown: CancellationToken) -> Self {
        Self {
            pubsub,
            metrics,
            shutdown,
        }
    }
}

#[tonic::async_trait]
impl<P: PubSub + ?Sized> PubSubService for PubSubGateway<P> {
    type SubscribeStream = SubscribeStream;

    async fn get_topics(&self, _request: Request<Empty>) -> Result<Response<TopicsResponse>, Status> {
        self.metrics.inc_rpc_request("get_topics");

        let names = self
            .pubsub
            .topics()
            .await
            .map_err(|err| pubsub_status(&err))?;

        Ok(Response::new(TopicsResponse { names }))
    }

    async fn list_peers(
        &self,
        request: Request<ListPeersRequest>,
    ) -> Result<Response<ListPeersResponse>, Status> {
        self.metrics.inc_rpc_request("list_peers");

        let mut peers = Vec::new();
        for topic in request.into_inner().topics {
            let topic_peers = self
                .pubsub
                .list_peers(&topic)
                .await
                .map_err(|err| pubsub_status(&err))?;

            peers.extend(topic_peers.into_iter().map(|peer_id| Peer {
                topic: topic.clone(),
                peer_id: peer_id.to_string(),
            }));
        }

        Ok(Response::new(ListPeersResponse { peers }))
    }

    async fn subscribe(
        &self,
        request: Request<SubscribeRequest>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        self.metrics.inc_rpc_request("subscribe");

        let topic = request.into_inner().topic;
        let subscription = self.pubsub.subscribe(&topic).await.map_err(|err| {
            warn!(topic = %topic, %err, "Subscription refused by overlay");
            self.metrics.inc_subscription_failure("rejected");
            pubsub_status(&err)
        })?;

        let feed = Feed::open(subscription, self.metrics.clone(), self.shutdown.child_token());
        Ok(Response::new(feed.into_stream()))
    }

    async fn publish(
        &self,
        _request: Request<Streaming<PublishRequest>>,
    ) -> Result<Response<Empty>, Status> {
        self.metrics.inc_rpc_request("publish");
        Err(Status::unimplemented("publish is not available yet"))
    }
}

/// Overlay subscription behind one Subscribe stream.
///
/// A message is taken from the overlay only when the transport asks for the
/// next stream item, so nothing is read ahead of the caller. Dropping the
/// feed releases the subscription; that happens when the caller goes away,
/// the overlay fails or the gateway shuts down.
struct Feed {
    topic: String,
    subscription: Subscription,
    metrics: SharedMetrics,
    shutdown: CancellationToken,
}

impl Feed {
    fn open(subscription: Subscription, metrics: SharedMetrics, shutdown: CancellationToken) -> Self {
        let topic = subscription.topic().to_string();
        metrics.subscription_opened();
        debug!(topic = %topic, "Subscribe stream opened");

        Self {
            topic,
            subscription,
            metrics,
            shutdown,
        }
    }

    fn into_stream(mut self) -> SubscribeStream {
        Box::pin(async_stream::stream! {
            loop {
                let item = self.next_item().await;
                // An error is the last item of the stream.
                let last = item.is_err();
                yield item;
                if last {
                    break;
                }
            }
        })
    }

    async fn next_item(&mut self) -> SubscribeItem {
        let next = select! {
            _ = self.shutdown.cancelled() => None,
            next = self.subscription.next() => Some(next),
        };

        match next {
            None => {
                self.metrics.inc_subscription_failure("shutdown");
                Err(Status::unavailable("gateway shutting down"))
            }
            Some(Ok(message)) => {
                self.metrics.inc_messages_forwarded();
                Ok(message.into())
            }
            Some(Err(err)) => {
                warn!(topic = %self.topic, %err, "Overlay ended subscription");
                self.metrics.inc_subscription_failure("overlay_error");
                Err(pubsub_status(&err))
            }
        }
    }
}

impl Drop for Feed {
    fn drop(&mut self) {
        self.metrics.subscription_closed();
        debug!(topic = %self.topic, "Subscribe stream closed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use libp2p_identity::PeerId;
    use metrics::Metrics;
    use networking::{MemoryPubSub, PubSubMessage};
    use pretty_assertions::assert_eq;
    use tokio::time::timeout;
    use tokio_stream::StreamExt;
    use tonic::Code;

    use super::*;

    fn gateway(pubsub: &MemoryPubSub) -> (PubSubGateway<MemoryPubSub>, SharedMetrics, CancellationToken) {
        let metrics = Arc::new(Metrics::new().unwrap());
        let shutdown = CancellationToken::new();
        let gateway = PubSubGateway::new(Arc::new(pubsub.clone()), metrics.clone(), shutdown.clone());
        (gateway, metrics, shutdown)
    }

    async fn wait_for_subscribers(pubsub: &MemoryPubSub, topic: &str, count: usize) {
        timeout(Duration::from_secs(5), async {
            while pubsub.subscriber_count(topic) != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_get_topics_returns_overlay_order() {
        let pubsub = MemoryPubSub::new();
        for topic in ["z", "a", "m"] {
            pubsub.join(topic);
        }
        let (gateway, metrics, _) = gateway(&pubsub);

        let response = gateway.get_topics(Request::new(Empty {})).await.unwrap();

        assert_eq!(response.into_inner().names, vec!["z", "a", "m"]);
        assert_eq!(metrics.rpc_requests("get_topics"), 1);
    }

    #[tokio::test]
    async fn test_list_peers_follows_request_order_without_dedup() {
        let pubsub = MemoryPubSub::new();
        let shared = PeerId::random();
        let only_b = PeerId::random();
        pubsub.add_peer("a", shared);
        pubsub.add_peer("b", only_b);
        pubsub.add_peer("b", shared);
        let (gateway, _, _) = gateway(&pubsub);

        let peers = gateway
            .list_peers(Request::new(ListPeersRequest {
                topics: vec!["b".into(), "unknown".into(), "a".into()],
            }))
            .await
            .unwrap()
            .into_inner()
            .peers;

        let entry = |topic: &str, peer: &PeerId| Peer {
            topic: topic.into(),
            peer_id: peer.to_string(),
        };
        assert_eq!(
            peers,
            vec![entry("b", &only_b), entry("b", &shared), entry("a", &shared)]
        );
    }

    #[tokio::test]
    async fn test_list_peers_with_no_topics_is_empty() {
        let pubsub = MemoryPubSub::new();
        pubsub.add_peer("a", PeerId::random());
        let (gateway, _, _) = gateway(&pubsub);

        let response = gateway
            .list_peers(Request::new(ListPeersRequest { topics: Vec::new() }))
            .await
            .unwrap();

        assert!(response.into_inner().peers.is_empty());
    }

    #[tokio::test]
    async fn test_refused_subscription_fails_the_call() {
        let pubsub = MemoryPubSub::new();
        let (gateway, metrics, _) = gateway(&pubsub);

        let status = gateway
            .subscribe(Request::new(SubscribeRequest {
                topic: String::new(),
                discover: false,
            }))
            .await
            .err().unwrap();

        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(metrics.subscription_failures("rejected"), 1);
    }

    #[tokio::test]
    async fn test_subscribe_forwards_translated_messages() {
        let pubsub = MemoryPubSub::new();
        let (gateway, metrics, _) = gateway(&pubsub);

        let mut stream = gateway
            .subscribe(Request::new(SubscribeRequest {
                topic: "chat".into(),
                discover: false,
            }))
            .await
            .unwrap()
            .into_inner();

        let message = PubSubMessage {
            from: PeerId::random(),
            data: b"hello".to_vec(),
            seqno: networking::encode_seqno(1),
            topic_ids: vec!["chat".into()],
            signature: vec![1, 2, 3],
            key: None,
        };
        pubsub.inject(message.clone());

        let received = stream.next().await.unwrap().unwrap();
        assert_eq!(received, PubSubMessageResponse::from(message));
        assert_eq!(metrics.active_subscriptions(), 1);
    }

    #[tokio::test]
    async fn test_stream_does_not_read_ahead_of_caller() {
        let pubsub = MemoryPubSub::new().with_subscription_buffer(1);
        let (gateway, metrics, _) = gateway(&pubsub);

        let mut stream = gateway
            .subscribe(Request::new(SubscribeRequest {
                topic: "chat".into(),
                discover: false,
            }))
            .await
            .unwrap()
            .into_inner();

        let message = |seqno: u64| PubSubMessage {
            from: PeerId::random(),
            data: format!("message {seqno}").into_bytes(),
            seqno: networking::encode_seqno(seqno),
            topic_ids: vec!["chat".into()],
            signature: Vec::new(),
            key: None,
        };

        // Nothing pulls from the overlay while the caller is not reading, so
        // the second message finds the one-slot subscription buffer full.
        assert_eq!(pubsub.inject(message(1)), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pubsub.inject(message(2)), 0);
        assert_eq!(metrics.messages_forwarded(), 0);

        let received = stream.next().await.unwrap().unwrap();
        assert_eq!(received.seqno, networking::encode_seqno(1));
        assert_eq!(metrics.messages_forwarded(), 1);
        assert_eq!(pubsub.inject(message(3)), 1);
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_subscription() {
        let pubsub = MemoryPubSub::new();
        let (gateway, metrics, _) = gateway(&pubsub);

        let stream = gateway
            .subscribe(Request::new(SubscribeRequest {
                topic: "chat".into(),
                discover: false,
            }))
            .await
            .unwrap()
            .into_inner();
        wait_for_subscribers(&pubsub, "chat", 1).await;

        drop(stream);

        wait_for_subscribers(&pubsub, "chat", 0).await;
        assert!(pubsub.topics().await.unwrap().is_empty());
        timeout(Duration::from_secs(5), async {
            while metrics.active_subscriptions() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_ends_stream_with_unavailable() {
        let pubsub = MemoryPubSub::new();
        let (gateway, _, shutdown) = gateway(&pubsub);

        let mut stream = gateway
            .subscribe(Request::new(SubscribeRequest {
                topic: "chat".into(),
                discover: false,
            }))
            .await
            .unwrap()
            .into_inner();

        shutdown.cancel();

        let status = stream.next().await.unwrap().unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);
        assert!(stream.next().await.is_none());
        wait_for_subscribers(&pubsub, "chat", 0).await;
    }

    #[tokio::test]
    async fn test_closed_feed_ends_stream_with_error() {
        let pubsub = MemoryPubSub::new();
        let (gateway, _, _) = gateway(&pubsub);

        let mut stream = gateway
            .subscribe(Request::new(SubscribeRequest {
                topic: "chat".into(),
                discover: false,
            }))
            .await
            .unwrap()
            .into_inner();

        // The gateway holds the only other handle; dropping it ends every feed.
        drop(gateway);
        drop(pubsub);

        let status = stream.next().await.unwrap().unwrap_err();
        assert_eq!(status.code(), Code::Internal);
    }
}
