mod behaviour;
mod handle;
mod service;

pub use behaviour::{OverlayBehaviour, OverlayBehaviourEvent};
pub use handle::PubSubHandle;
pub use service::{NetworkService, NetworkServiceConfig};
