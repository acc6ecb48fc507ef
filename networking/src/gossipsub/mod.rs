pub mod capture;
pub mod config;


use libp2p::gossipsub::{AllowAllSubscriptionFilter, Behaviour};

pub type GossipsubBehaviour = Behaviour<capture::SignatureCapture, AllowAllSubscriptionFilter>;

// Re-export commonly used types
pub use capture::{Authentication, CAPTURE_CAPACITY, SignatureCapture};
pub use config::{GossipsubConfig, MAX_TRANSMIT_SIZE};
