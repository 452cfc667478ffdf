pub mod broadcaster;
pub mod registry;

pub use broadcaster::UpdateBroadcaster;
pub use registry::{ConsumerId, Payload, SubscriptionRegistry};
