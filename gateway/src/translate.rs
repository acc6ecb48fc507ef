use libp2p_identity::PeerId;
use networking::PubSubMessage;

use crate::proto::PubSubMessageResponse;

/// Canonical wire form of a peer id: its base58 text, UTF-8 encoded.
pub fn peer_id_bytes(peer_id: &PeerId) -> Vec<u8> {
    peer_id.to_string().into_bytes()
}

impl From<PubSubMessage> for PubSubMessageResponse {
    fn from(message: PubSubMessage) -> Self {
        Self {
            from: peer_id_bytes(&message.from),
            data: message.data,
            seqno: message.seqno,
            topic_ids: message.topic_ids,
            signature: message.signature,
            key: message.key.unwrap_or_default(),
        }
    }
}
