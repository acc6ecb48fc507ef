/// Signature Capture
///
/// The decoded [`Message`] gossipsub hands to the application keeps only
/// source, payload, sequence number and topic. Author signature and key
/// are stripped during decoding. [`SignatureCapture`] sits in the
/// behaviour's [`DataTransform`] slot, sees every [`RawMessage`] before
/// it is decoded, and remembers its authentication fields so the event
/// loop can attach them again when the message is delivered.
///
/// Entries are keyed by `(source, sequence number, topic)`, which is
/// unique for signed messages. The table is bounded: the oldest entries
/// are evicted first, covering messages that are decoded but never
/// delivered (duplicates, rejected messages).
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use libp2p::gossipsub::{DataTransform, Message, RawMessage, TopicHash};
use libp2p_identity::PeerId;
use parking_lot::Mutex;

/// Default number of captured authentications kept in memory.
pub const CAPTURE_CAPACITY: usize = 4096;

type CaptureKey = (PeerId, u64, TopicHash);

/// Authentication fields of a received message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Authentication {
    pub signature: Vec<u8>,
    pub key: Option<Vec<u8>>,
}

#[derive(Debug)]
struct CaptureTable {
    entries: HashMap<CaptureKey, Authentication>,
    order: VecDeque<CaptureKey>,
    capacity: usize,
}

impl CaptureTable {
    fn insert(&mut self, key: CaptureKey, authentication: Authentication) {
        if self.entries.insert(key.clone(), authentication).is_some() {
            return;
        }

        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, key: &CaptureKey) -> Option<Authentication> {
        let authentication = self.entries.remove(key)?;
        if let Some(position) = self.order.iter().position(|entry| entry == key) {
            self.order.remove(position);
        }
        Some(authentication)
    }
}

#[derive(Debug, Clone)]
pub struct SignatureCapture {
    table: Arc<Mutex<CaptureTable>>,
}

impl SignatureCapture {
    pub fn new() -> Self {
        Self::with_capacity(CAPTURE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            table: Arc::new(Mutex::new(CaptureTable {
                entries: HashMap::new(),
                order: VecDeque::new(),
                capacity: capacity.max(1),
            })),
        }
    }

    fn record(&self, raw_message: &RawMessage) {
        let (Some(source), Some(sequence_number)) = (raw_message.source, raw_message.sequence_number)
        else {
            return;
        };

        self.table.lock().insert(
            (source, sequence_number, raw_message.topic.clone()),
            Authentication {
                signature: raw_message.signature.clone().unwrap_or_default(),
                key: raw_message.key.clone(),
            },
        );
    }

    /// Removes and returns the authentication recorded for a message.
    ///
    /// Messages that were never captured yield empty fields.
    pub fn take(&self, source: &PeerId, sequence_number: Option<u64>, topic: &TopicHash) -> Authentication {
        let Some(sequence_number) = sequence_number else {
            return Authentication::default();
        };

        self.table
            .lock()
            .remove(&(*source, sequence_number, topic.clone()))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SignatureCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl DataTransform for SignatureCapture {
    fn inbound_transform(&self, raw_message: RawMessage) -> Result<Message, std::io::Error> {
        self.record(&raw_message);

        Ok(Message {
            source: raw_message.source,
            data: raw_message.data,
            sequence_number: raw_message.sequence_number,
            topic: raw_message.topic,
        })
    }

    fn outbound_transform(
        &self,
        _topic: &TopicHash,
        data: Vec<u8>,
    ) -> Result<Vec<u8>, std::io::Error> {
        Ok(data)
    }
}
