use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
    num::{NonZeroU8, NonZeroUsize},
    sync::Arc,
};

use anyhow::{Result, anyhow};
use futures::StreamExt;
use libp2p::{
    Multiaddr, SwarmBuilder,
    connection_limits::{self, ConnectionLimits},
    gossipsub::{Event, IdentTopic, Message, MessageAuthenticity},
    identify,
    multiaddr::Protocol,
    swarm::{Config, Swarm, SwarmEvent},
};
use libp2p_identity::{Keypair, PeerId};
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    bootnodes::StaticBootnodes,
    gossipsub::{self, SignatureCapture, config::GossipsubConfig},
    network::{
        behaviour::{OverlayBehaviour, OverlayBehaviourEvent},
        handle::PubSubHandle,
    },
    pubsub::{PubSubError, PubSubMessage, PubSubResult, Subscription, encode_seqno},
    subscribers::{SUBSCRIPTION_BUFFER, Subscribers},
    types::{ConnectionState, OverlayCommand},
};

/// Protocol version announced over identify.
pub const IDENTIFY_PROTOCOL_VERSION: &str = "/pubsub-gateway/1.0.0";

const NOTIFY_HANDLER_BUFFER_SIZE: NonZeroUsize = NonZeroUsize::new(7).unwrap();
const DIAL_CONCURRENCY_FACTOR: NonZeroU8 = NonZeroU8::new(1).unwrap();

#[derive(Debug, Clone)]
pub struct NetworkServiceConfig {
    pub gossipsub_config: GossipsubConfig,
    pub socket_address: IpAddr,
    pub socket_port: u16,
    bootnodes: StaticBootnodes,
}

impl NetworkServiceConfig {
    pub fn new(
        gossipsub_config: GossipsubConfig,
        socket_address: IpAddr,
        socket_port: u16,
        bootnodes: Vec<String>,
    ) -> Self {
        NetworkServiceConfig {
            gossipsub_config,
            socket_address,
            socket_port,
            bootnodes: StaticBootnodes::from_arguments(&bootnodes),
        }
    }

    pub fn bootnodes(&self) -> &StaticBootnodes {
        &self.bootnodes
    }
}

/// Gossipsub node driving a libp2p swarm.
///
/// All overlay state lives inside the event loop started by
/// [`NetworkService::start`]; callers reach it through the
/// [`PubSubHandle`] returned from the constructor.
pub struct NetworkService {
    network_config: Arc<NetworkServiceConfig>,
    swarm: Swarm<OverlayBehaviour>,
    peer_table: HashMap<PeerId, ConnectionState>,
    commands: mpsc::UnboundedReceiver<OverlayCommand>,
    command_sender: mpsc::UnboundedSender<OverlayCommand>,
    subscribers: Subscribers,
    pinned: HashSet<String>,
    capture: SignatureCapture,
}

impl NetworkService {
    pub async fn new(network_config: Arc<NetworkServiceConfig>) -> Result<(Self, PubSubHandle)> {
        let local_key = Keypair::generate_secp256k1();
        Self::new_with_keypair(network_config, local_key).await
    }

    pub async fn new_with_keypair(
        network_config: Arc<NetworkServiceConfig>,
        local_key: Keypair,
    ) -> Result<(Self, PubSubHandle)> {
        let capture = SignatureCapture::new();
        let behaviour = Self::build_behaviour(&local_key, &network_config, capture.clone())?;

        let config = Config::with_tokio_executor()
            .with_notify_handler_buffer_size(NOTIFY_HANDLER_BUFFER_SIZE)
            .with_per_connection_event_buffer_size(4)
            .with_dial_concurrency_factor(DIAL_CONCURRENCY_FACTOR)
            .with_idle_connection_timeout(Duration::from_secs(60));

        let multiaddr = Self::multiaddr(&network_config)?;
        let swarm = SwarmBuilder::with_existing_identity(local_key.clone())
            .with_tokio()
            .with_quic()
            .with_behaviour(|_| behaviour)?
            .with_swarm_config(|_| config)
            .build();

        let (command_sender, commands) = mpsc::unbounded_channel();
        let handle = PubSubHandle::new(command_sender.clone(), *swarm.local_peer_id());

        let mut service = Self {
            network_config,
            swarm,
            peer_table: HashMap::new(),
            commands,
            command_sender,
            subscribers: Subscribers::new(),
            pinned: HashSet::new(),
            capture,
        };

        service.listen(&multiaddr)?;
        service.subscribe_to_topics()?;

        Ok((service, handle))
    }

    /// Runs the event loop until `shutdown` is cancelled.
    pub async fn start(&mut self, shutdown: CancellationToken) -> Result<()> {
        self.connect_to_peers(self.network_config.bootnodes.to_multiaddrs());

        // Periodic reconnect attempts to bootnodes
        let mut reconnect_interval = interval(Duration::from_secs(30));
        reconnect_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            select! {
                _ = shutdown.cancelled() => {
                    info!("Shutting down pubsub overlay");
                    return Ok(());
                }
                _ = reconnect_interval.tick() => {
                    self.connect_to_peers(self.network_config.bootnodes.to_multiaddrs());
                }
                Some(command) = self.commands.recv() => {
                    self.dispatch_command(command);
                }
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event);
                }
            }
        }
    }

    fn dispatch_command(&mut self, command: OverlayCommand) {
        trace!(command = command.name(), "Overlay command");

        match command {
            OverlayCommand::Topics { reply } => {
                let _ = reply.send(self.topics());
            }
            OverlayCommand::ListPeers { topic, reply } => {
                let _ = reply.send(self.list_peers(&topic));
            }
            OverlayCommand::Subscribe { topic, reply } => {
                // A dropped reply hands the subscription back, which releases it.
                let _ = reply.send(self.subscribe(topic));
            }
            OverlayCommand::Unsubscribe { topic, subscriber } => {
                self.unsubscribe(&topic, subscriber);
            }
            OverlayCommand::Publish { topic, data, reply } => {
                let _ = reply.send(self.publish(topic, data));
            }
        }
    }

    fn topics(&self) -> Vec<String> {
        self.swarm
            .behaviour()
            .gossipsub
            .topics()
            .map(|topic| topic.to_string())
            .collect()
    }

    fn list_peers(&self, topic: &str) -> Vec<PeerId> {
        self.swarm
            .behaviour()
            .gossipsub
            .all_peers()
            .filter(|(_, topics)| topics.iter().any(|hash| hash.as_str() == topic))
            .map(|(peer_id, _)| *peer_id)
            .collect()
    }

    fn subscribe(&mut self, topic: String) -> PubSubResult<Subscription> {
        if topic.is_empty() {
            return Err(PubSubError::InvalidTopic(topic));
        }

        self.swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&IdentTopic::new(topic.clone()))
            .map_err(|err| PubSubError::Subscribe {
                topic: topic.clone(),
                reason: format!("{err:?}"),
            })?;

        let (subscriber, receiver) = self.subscribers.add(&topic, SUBSCRIPTION_BUFFER);
        debug!(topic = %topic, subscriber, "Opened subscription");

        let commands = self.command_sender.clone();
        let release_topic = topic.clone();
        Ok(Subscription::new(topic, receiver, move || {
            let _ = commands.send(OverlayCommand::Unsubscribe {
                topic: release_topic,
                subscriber,
            });
        }))
    }

    fn unsubscribe(&mut self, topic: &str, subscriber: u64) {
        debug!(topic, subscriber, "Released subscription");

        if !self.subscribers.remove(topic, subscriber) || self.pinned.contains(topic) {
            return;
        }

        let _ = self
            .swarm
            .behaviour_mut()
            .gossipsub
            .unsubscribe(&IdentTopic::new(topic));
        info!(topic, "Left topic");
    }

    fn publish(&mut self, topic: String, data: Vec<u8>) -> PubSubResult<()> {
        self.swarm
            .behaviour_mut()
            .gossipsub
            .publish(IdentTopic::new(topic.clone()), data)
            .map(|_| ())
            .map_err(|err| PubSubError::Publish {
                topic,
                reason: format!("{err:?}"),
            })
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<OverlayBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(OverlayBehaviourEvent::Gossipsub(event)) => {
                self.handle_gossipsub_event(event);
            }
            SwarmEvent::Behaviour(OverlayBehaviourEvent::Identify(event)) => {
                self.handle_identify_event(event);
            }
            SwarmEvent::Behaviour(_) => {
                // ConnectionLimits behaviour has no events
            }
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                let connected = self.set_connection_state(peer_id, ConnectionState::Connected);
                info!(peer = %peer_id, "Connected to peer (total: {})", connected);
                debug!(peer = %peer_id, dialer = endpoint.is_dialer(), "Connection established");
            }
            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                let connected = self.set_connection_state(peer_id, ConnectionState::Disconnected);
                info!(peer = %peer_id, "Disconnected from peer (total: {})", connected);
            }
            SwarmEvent::IncomingConnection { local_addr, .. } => {
                debug!(?local_addr, "Incoming connection");
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                if let Some(peer_id) = peer_id {
                    self.peer_table
                        .insert(peer_id, ConnectionState::Disconnected);
                }
                warn!(?peer_id, ?error, "Failed to connect to peer");
            }
            SwarmEvent::NewListenAddr {
                listener_id,
                address,
            } => {
                info!(?listener_id, ?address, "New listen address");
            }
            _ => {
                trace!(?event, "Unhandled swarm event");
            }
        }
    }

    fn handle_gossipsub_event(&mut self, event: Event) {
        match event {
            Event::Subscribed { peer_id, topic } => {
                debug!(peer = %peer_id, topic = %topic, "A peer subscribed to topic");
            }
            Event::Unsubscribed { peer_id, topic } => {
                debug!(peer = %peer_id, topic = %topic, "A peer unsubscribed from topic");
            }
            Event::Message { message, .. } => {
                self.deliver(message);
            }
            _ => {
                trace!(?event, "Unhandled gossipsub event");
            }
        }
    }

    fn deliver(&mut self, message: Message) {
        let Some(source) = message.source else {
            warn!(topic = %message.topic, "Dropping gossipsub message without source");
            return;
        };

        let authentication = self
            .capture
            .take(&source, message.sequence_number, &message.topic);
        let topic = message.topic.into_string();

        let delivered = self.subscribers.deliver(
            &topic,
            &PubSubMessage {
                from: source,
                data: message.data,
                seqno: message
                    .sequence_number
                    .map(encode_seqno)
                    .unwrap_or_default(),
                topic_ids: vec![topic.clone()],
                signature: authentication.signature,
                key: authentication.key,
            },
        );

        trace!(topic = %topic, peer = %source, delivered, "Delivered gossipsub message");
    }

    fn handle_identify_event(&mut self, event: identify::Event) {
        match event {
            identify::Event::Received { peer_id, info, .. } => {
                debug!(
                    peer = %peer_id,
                    agent_version = %info.agent_version,
                    protocol_version = %info.protocol_version,
                    listen_addrs = info.listen_addrs.len(),
                    "Received peer info"
                );
            }
            identify::Event::Error { peer_id, error, .. } => {
                warn!(peer = %peer_id, ?error, "Identify error");
            }
            _ => {}
        }
    }

    fn set_connection_state(&mut self, peer_id: PeerId, state: ConnectionState) -> usize {
        self.peer_table.insert(peer_id, state);
        self.peer_table
            .values()
            .filter(|s| **s == ConnectionState::Connected)
            .count()
    }

    fn connect_to_peers(&mut self, peers: Vec<Multiaddr>) {
        for peer in peers {
            if let Some(Protocol::P2p(peer_id)) = peer
                .iter()
                .find(|protocol| matches!(protocol, Protocol::P2p(_)))
                && peer_id != self.local_peer_id()
            {
                let current_state = self.peer_table.get(&peer_id).copied();
                if !matches!(current_state, Some(ConnectionState::Disconnected) | None) {
                    trace!(?peer_id, "Already connected");
                    continue;
                }

                if let Err(err) = self.swarm.dial(peer.clone()) {
                    warn!(?err, "Failed to dial peer");
                    continue;
                }

                info!(peer = %peer_id, "Dialing peer");
                self.peer_table.insert(peer_id, ConnectionState::Connecting);
            }
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        *self.swarm.local_peer_id()
    }

    fn build_behaviour(
        local_key: &Keypair,
        cfg: &NetworkServiceConfig,
        capture: SignatureCapture,
    ) -> Result<OverlayBehaviour> {
        let identify = Self::build_identify(local_key);
        let gossipsub = gossipsub::GossipsubBehaviour::new_with_transform(
            MessageAuthenticity::Signed(local_key.clone()),
            cfg.gossipsub_config.config.clone(),
            capture,
        )
        .map_err(|err| anyhow!("Failed to create gossipsub behaviour: {err:?}"))?;

        let connection_limits = connection_limits::Behaviour::new(
            ConnectionLimits::default()
                .with_max_pending_incoming(Some(5))
                .with_max_pending_outgoing(Some(16))
                .with_max_established_per_peer(Some(2)),
        );

        Ok(OverlayBehaviour {
            identify,
            gossipsub,
            connection_limits,
        })
    }

    fn build_identify(local_key: &Keypair) -> identify::Behaviour {
        let identify_config =
            identify::Config::new(IDENTIFY_PROTOCOL_VERSION.into(), local_key.public())
                .with_agent_version(format!("pubsub-gateway/{}", env!("CARGO_PKG_VERSION")));

        identify::Behaviour::new(identify_config)
    }

    fn multiaddr(cfg: &NetworkServiceConfig) -> Result<Multiaddr> {
        let mut addr: Multiaddr = cfg.socket_address.into();
        addr.push(Protocol::Udp(cfg.socket_port));
        addr.push(Protocol::QuicV1);
        Ok(addr)
    }

    fn listen(&mut self, addr: &Multiaddr) -> Result<()> {
        self.swarm
            .listen_on(addr.clone())
            .map_err(|e| anyhow!("Failed to listen on {addr:?}: {e:?}"))?;
        info!(?addr, "Listening on");
        Ok(())
    }

    fn subscribe_to_topics(&mut self) -> Result<()> {
        for topic in &self.network_config.gossipsub_config.topics {
            self.swarm
                .behaviour_mut()
                .gossipsub
                .subscribe(&IdentTopic::new(topic.clone()))
                .map_err(|e| anyhow!("Subscribe failed for {topic:?}: {e:?}"))?;
            self.pinned.insert(topic.clone());
            info!(topic = %topic, "Subscribed to topic");
        }
        Ok(())
    }
}
