use anyhow::{Result, anyhow};
use libp2p::gossipsub::{Config, ConfigBuilder, ValidationMode};
use std::time::Duration;

/// Largest message the overlay will relay, in bytes.
pub const MAX_TRANSMIT_SIZE: usize = 1 << 20;

#[derive(Debug, Clone)]
pub struct GossipsubConfig {
    pub config: Config,
    /// Topics joined at startup and kept for the lifetime of the node.
    pub topics: Vec<String>,
}

impl GossipsubConfig {
    pub fn new() -> Result<Self> {
        let config = ConfigBuilder::default()
            // go-libp2p-pubsub: GossipSubHeartbeatInterval = 1s
            .heartbeat_interval(Duration::from_secs(1))
            // GossipSubFanoutTTL = 60s
            .fanout_ttl(Duration::from_secs(60))
            // GossipSubHistoryLength = 5
            .history_length(5)
            // GossipSubHistoryGossip = 3
            .history_gossip(3)
            // TimeCacheDuration = 120s
            .duplicate_cache_time(Duration::from_secs(120))
            // GossipSubD = 6
            .mesh_n(6)
            // GossipSubDlo = 5
            .mesh_n_low(5)
            // GossipSubDhi = 12
            .mesh_n_high(12)
            // GossipSubDlazy = 6
            .gossip_lazy(6)
            .max_transmit_size(MAX_TRANSMIT_SIZE)
            // Every message must carry source, seqno, signature and key.
            .validation_mode(ValidationMode::Strict)
            .build()
            .map_err(|err| anyhow!("Failed to build gossipsub config: {err:?}"))?;

        Ok(GossipsubConfig {
            config,
            topics: Vec::new(),
        })
    }

    pub fn set_topics(&mut self, topics: Vec<String>) {
        self.topics = topics;
    }
}
