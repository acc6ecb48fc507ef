use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use gateway::proto::pub_sub_service_client::PubSubServiceClient;
use gateway::proto::{Empty, ListPeersRequest, PublishRequest, SubscribeRequest};
use gateway::{bind, run, serve, GatewayConfig, GatewayError, ListenAddress, TlsPaths, TransportSecurity};
use libp2p_identity::PeerId;
use metrics::{Metrics, SharedMetrics};
use networking::{encode_seqno, MemoryPubSub, PubSub, PubSubMessage};
use pretty_assertions::assert_eq;
use rcgen::{CertificateParams, ExtendedKeyUsagePurpose, KeyPair};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tonic::Code;

const WAIT: Duration = Duration::from_secs(5);

struct TestGateway {
    addr: SocketAddr,
    pubsub: MemoryPubSub,
    metrics: SharedMetrics,
    shutdown: CancellationToken,
    server: JoinHandle<Result<(), GatewayError>>,
}

impl TestGateway {
    async fn start(pubsub: MemoryPubSub) -> Self {
        Self::start_with(pubsub, TransportSecurity::Insecure).await
    }

    async fn start_with(pubsub: MemoryPubSub, security: TransportSecurity) -> Self {
        let listener = bind(&ListenAddress::tcp("127.0.0.1:0")).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let metrics: SharedMetrics = Arc::new(Metrics::new().unwrap());
        let shutdown = CancellationToken::new();

        let server = tokio::spawn({
            let pubsub = Arc::new(pubsub.clone());
            let metrics = metrics.clone();
            let shutdown = shutdown.clone();
            async move { serve(listener, &security, pubsub, metrics, shutdown).await }
        });

        Self {
            addr,
            pubsub,
            metrics,
            shutdown,
            server,
        }
    }

    async fn client(&self) -> PubSubServiceClient<Channel> {
        PubSubServiceClient::connect(format!("http://{}", self.addr))
            .await
            .unwrap()
    }

    async fn tls_channel(&self, tls: ClientTlsConfig) -> Result<Channel, tonic::transport::Error> {
        Endpoint::from_shared(format!("https://{}", self.addr))?
            .tls_config(tls)?
            .connect()
            .await
    }

    async fn stop(self) {
        self.shutdown.cancel();
        timeout(WAIT, self.server).await.unwrap().unwrap().unwrap();
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

fn message(topic: &str, seqno: u64) -> PubSubMessage {
    PubSubMessage {
        from: PeerId::random(),
        data: format!("message {seqno}").into_bytes(),
        seqno: encode_seqno(seqno),
        topic_ids: vec![topic.to_string()],
        signature: vec![seqno as u8; 8],
        key: (seqno % 2 == 0).then(|| vec![0x08, 0x02, seqno as u8]),
    }
}

/// Self-signed "localhost" certificate written to a temporary directory.
/// The same certificate doubles as the client CA and client identity.
struct TestCredentials {
    dir: TempDir,
    cert_pem: String,
    key_pem: String,
}

impl TestCredentials {
    fn generate() -> Self {
        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let key_pair = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();

        let credentials = Self {
            dir: tempfile::tempdir().unwrap(),
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        };
        fs::write(credentials.dir.path().join("cert.pem"), &credentials.cert_pem).unwrap();
        fs::write(credentials.dir.path().join("key.pem"), &credentials.key_pem).unwrap();
        credentials
    }

    fn security(&self, mutual: bool) -> TransportSecurity {
        let cert = self.dir.path().join("cert.pem");
        TransportSecurity::Tls(TlsPaths {
            client_ca: mutual.then(|| cert.clone()),
            cert,
            key: self.dir.path().join("key.pem"),
        })
    }

    fn client_tls(&self) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(&self.cert_pem))
            .domain_name("localhost")
    }

    fn client_identity(&self) -> Identity {
        Identity::from_pem(&self.cert_pem, &self.key_pem)
    }
}

fn subscribe_request(topic: &str) -> SubscribeRequest {
    SubscribeRequest {
        topic: topic.to_string(),
        discover: false,
    }
}

#[tokio::test]
async fn test_get_topics_over_grpc() {
    let pubsub = MemoryPubSub::new();
    for topic in ["blocks", "attestations", "chat"] {
        pubsub.join(topic);
    }
    let gateway = TestGateway::start(pubsub).await;
    let mut client = gateway.client().await;

    let names = client.get_topics(Empty {}).await.unwrap().into_inner().names;

    assert_eq!(names, vec!["blocks", "attestations", "chat"]);
    gateway.stop().await;
}

#[tokio::test]
async fn test_list_peers_honors_request_order() {
    let pubsub = MemoryPubSub::new();
    pubsub.join("a");
    pubsub.join("b");
    let peer_a = PeerId::random();
    let peer_b1 = PeerId::random();
    let peer_b2 = PeerId::random();
    pubsub.add_peer("a", peer_a);
    pubsub.add_peer("b", peer_b1);
    pubsub.add_peer("b", peer_b2);

    let gateway = TestGateway::start(pubsub).await;
    let mut client = gateway.client().await;

    let peers = client
        .list_peers(ListPeersRequest {
            topics: vec!["b".into(), "a".into()],
        })
        .await
        .unwrap()
        .into_inner()
        .peers;

    let listed: Vec<(String, String)> = peers
        .into_iter()
        .map(|peer| (peer.topic, peer.peer_id))
        .collect();
    assert_eq!(
        listed,
        vec![
            ("b".to_string(), peer_b1.to_string()),
            ("b".to_string(), peer_b2.to_string()),
            ("a".to_string(), peer_a.to_string()),
        ]
    );

    let empty = client
        .list_peers(ListPeersRequest { topics: Vec::new() })
        .await
        .unwrap()
        .into_inner();
    assert!(empty.peers.is_empty());

    gateway.stop().await;
}

#[tokio::test]
async fn test_subscribe_streams_messages_in_order() {
    let gateway = TestGateway::start(MemoryPubSub::new()).await;
    let mut client = gateway.client().await;

    let mut stream = client
        .subscribe(subscribe_request("chat"))
        .await
        .unwrap()
        .into_inner();
    let pubsub = gateway.pubsub.clone();
    wait_until(|| pubsub.subscriber_count("chat") == 1).await;

    let sent: Vec<PubSubMessage> = (1..=10).map(|seqno| message("chat", seqno)).collect();
    let publisher = {
        let pubsub = pubsub.clone();
        let sent = sent.clone();
        tokio::spawn(async move {
            for message in sent {
                // Wait for room instead of overflowing the subscription buffer.
                while pubsub.inject(message.clone()) == 0 {
                    sleep(Duration::from_millis(5)).await;
                }
            }
        })
    };

    for expected in &sent {
        let received = timeout(WAIT, stream.message()).await.unwrap().unwrap().unwrap();

        assert_eq!(received.from, expected.from.to_string().into_bytes());
        assert_eq!(received.data, expected.data);
        assert_eq!(received.seqno, expected.seqno);
        assert_eq!(received.topic_ids, expected.topic_ids);
        assert_eq!(received.signature, expected.signature);
        assert_eq!(received.key, expected.key.clone().unwrap_or_default());
    }
    publisher.await.unwrap();

    let metrics = gateway.metrics.clone();
    wait_until(|| metrics.messages_forwarded() == 10).await;
    drop(stream);
    gateway.stop().await;
}

#[tokio::test]
async fn test_invalid_topic_fails_without_stream() {
    let gateway = TestGateway::start(MemoryPubSub::new()).await;
    let mut client = gateway.client().await;

    let status = client.subscribe(subscribe_request("")).await.unwrap_err();

    assert_eq!(status.code(), Code::InvalidArgument);
    assert_eq!(gateway.pubsub.subscriber_count(""), 0);
    gateway.stop().await;
}

#[tokio::test]
async fn test_cancelled_subscriptions_are_released() {
    let gateway = TestGateway::start(MemoryPubSub::new()).await;
    let mut client = gateway.client().await;
    let pubsub = gateway.pubsub.clone();

    for _ in 0..5 {
        let stream = client
            .subscribe(subscribe_request("churn"))
            .await
            .unwrap()
            .into_inner();
        wait_until(|| pubsub.subscriber_count("churn") == 1).await;

        drop(stream);
        wait_until(|| pubsub.subscriber_count("churn") == 0).await;
    }

    let metrics = gateway.metrics.clone();
    wait_until(|| metrics.active_subscriptions() == 0).await;
    assert_eq!(metrics.rpc_requests("subscribe"), 5);
    gateway.stop().await;
}

#[tokio::test]
async fn test_publish_is_not_implemented() {
    let pubsub = MemoryPubSub::new();
    let gateway = TestGateway::start(pubsub).await;
    let mut client = gateway.client().await;
    let mut observer = gateway.pubsub.subscribe("news").await.unwrap();

    let outbound = tokio_stream::iter(vec![PublishRequest {
        topic: "news".into(),
        data: b"breaking".to_vec(),
        advertise: true,
    }]);
    let status = client.publish(outbound).await.unwrap_err();

    assert_eq!(status.code(), Code::Unimplemented);
    assert!(timeout(Duration::from_millis(100), observer.next()).await.is_err());
    gateway.stop().await;
}

#[tokio::test]
async fn test_shutdown_ends_open_stream_and_returns_ok() {
    let gateway = TestGateway::start(MemoryPubSub::new()).await;
    let mut client = gateway.client().await;

    let mut stream = client
        .subscribe(subscribe_request("chat"))
        .await
        .unwrap()
        .into_inner();
    let pubsub = gateway.pubsub.clone();
    wait_until(|| pubsub.subscriber_count("chat") == 1).await;

    gateway.shutdown.cancel();

    let status = timeout(WAIT, stream.message()).await.unwrap().unwrap_err();
    assert_eq!(status.code(), Code::Unavailable);

    timeout(WAIT, gateway.server).await.unwrap().unwrap().unwrap();
    assert_eq!(pubsub.subscriber_count("chat"), 0);
}

#[tokio::test]
async fn test_run_reports_bind_error() {
    let taken = bind(&ListenAddress::tcp("127.0.0.1:0")).await.unwrap();
    let addr = taken.local_addr().unwrap();
    let config = GatewayConfig::insecure(ListenAddress::tcp(addr.to_string()));
    let metrics: SharedMetrics = Arc::new(Metrics::new().unwrap());

    let err = run(
        &config,
        Arc::new(MemoryPubSub::new()),
        metrics,
        CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(err.is_bind_error(), "{err:?}");
}

#[tokio::test]
async fn test_run_reports_credential_error() {
    let config = GatewayConfig::new(
        ListenAddress::tcp("127.0.0.1:0"),
        TransportSecurity::Tls(TlsPaths {
            cert: "/nonexistent/cert.pem".into(),
            key: "/nonexistent/key.pem".into(),
            client_ca: None,
        }),
    );
    let metrics: SharedMetrics = Arc::new(Metrics::new().unwrap());

    let err = run(
        &config,
        Arc::new(MemoryPubSub::new()),
        metrics,
        CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(err.is_credential_error(), "{err:?}");
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_is_removed_after_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gateway.sock");
    let config = GatewayConfig::insecure(ListenAddress::unix(path.to_string_lossy()));
    let metrics: SharedMetrics = Arc::new(Metrics::new().unwrap());
    let shutdown = CancellationToken::new();

    let server = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { run(&config, Arc::new(MemoryPubSub::new()), metrics, shutdown).await }
    });
    wait_until(|| path.exists()).await;

    shutdown.cancel();
    timeout(WAIT, server).await.unwrap().unwrap().unwrap();
    assert!(!path.exists());
}

#[tokio::test]
async fn test_tls_gateway_serves_verified_clients() {
    let credentials = TestCredentials::generate();
    let pubsub = MemoryPubSub::new();
    pubsub.join("chat");
    let gateway = TestGateway::start_with(pubsub, credentials.security(false)).await;

    let channel = gateway.tls_channel(credentials.client_tls()).await.unwrap();
    let names = PubSubServiceClient::new(channel)
        .get_topics(Empty {})
        .await
        .unwrap()
        .into_inner()
        .names;
    assert_eq!(names, vec!["chat"]);

    // Plaintext callers cannot talk to a TLS listener.
    let plaintext = match PubSubServiceClient::connect(format!("http://{}", gateway.addr)).await {
        Ok(mut client) => client.get_topics(Empty {}).await.map(|_| ()).map_err(|_| ()),
        Err(_) => Err(()),
    };
    assert!(plaintext.is_err());

    gateway.stop().await;
}

#[tokio::test]
async fn test_mutual_tls_requires_client_certificate() {
    let credentials = TestCredentials::generate();
    let pubsub = MemoryPubSub::new();
    pubsub.join("chat");
    let gateway = TestGateway::start_with(pubsub, credentials.security(true)).await;

    let anonymous = match gateway.tls_channel(credentials.client_tls()).await {
        Ok(channel) => PubSubServiceClient::new(channel)
            .get_topics(Empty {})
            .await
            .map(|_| ())
            .map_err(|_| ()),
        Err(_) => Err(()),
    };
    assert!(anonymous.is_err());

    let channel = gateway
        .tls_channel(credentials.client_tls().identity(credentials.client_identity()))
        .await
        .unwrap();
    let names = PubSubServiceClient::new(channel)
        .get_topics(Empty {})
        .await
        .unwrap()
        .into_inner()
        .names;
    assert_eq!(names, vec!["chat"]);

    gateway.stop().await;
}

#[tokio::test]
async fn test_run_reports_unparseable_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let cert = dir.path().join("cert.pem");
    let key = dir.path().join("key.pem");
    fs::write(&cert, "not a certificate").unwrap();
    fs::write(&key, "not a key").unwrap();
    let config = GatewayConfig::new(
        ListenAddress::tcp("127.0.0.1:0"),
        TransportSecurity::Tls(TlsPaths {
            cert,
            key,
            client_ca: None,
        }),
    );
    let metrics: SharedMetrics = Arc::new(Metrics::new().unwrap());

    let err = run(
        &config,
        Arc::new(MemoryPubSub::new()),
        metrics,
        CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, GatewayError::Tls(_)), "{err:?}");
    assert!(err.is_credential_error());
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_is_reusable_after_credential_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gateway.sock");
    let address = ListenAddress::unix(path.to_string_lossy());
    let failing = GatewayConfig::new(
        address.clone(),
        TransportSecurity::Tls(TlsPaths {
            cert: dir.path().join("missing-cert.pem"),
            key: dir.path().join("missing-key.pem"),
            client_ca: None,
        }),
    );
    let metrics: SharedMetrics = Arc::new(Metrics::new().unwrap());

    let err = run(
        &failing,
        Arc::new(MemoryPubSub::new()),
        metrics.clone(),
        CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(err.is_credential_error(), "{err:?}");
    assert!(!path.exists());

    let config = GatewayConfig::insecure(address);
    let shutdown = CancellationToken::new();
    let server = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { run(&config, Arc::new(MemoryPubSub::new()), metrics, shutdown).await }
    });
    wait_until(|| path.exists()).await;

    shutdown.cancel();
    timeout(WAIT, server).await.unwrap().unwrap().unwrap();
    assert!(!path.exists());
}
