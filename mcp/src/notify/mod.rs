//! Subscription registry and supervised observer delivery.

pub mod registry;
pub mod supervisor;

pub use registry::{
    DeliverySnapshot, Notification, ResourceObserver, SubscriptionId, SubscriptionIndexEntry,
    SubscriptionKey, SubscriptionRegistry, SubscriptionTarget, Unsubscribed, AGGREGATE_ORIGIN,
};
pub use supervisor::{ObserverError, ObserverHandle, ObserverSet, Supervisor};
