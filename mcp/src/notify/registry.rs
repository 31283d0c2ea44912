//! Subscription registry.
//!
//! Interest is keyed by `(agent, target)` where the target is either a
//! resource URI or an origin's list-changed channel. Each subscription owns a
//! supervised delivery task fed by a `watch` channel, so a slow observer only
//! ever sees the newest notification for its key: bursts collapse into one
//! delivery that carries the final state, and a change published while a
//! delivery is in flight is delivered afterwards.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::supervisor::{deliver_isolated, ObserverError, Supervisor};
use crate::scope::AgentId;

/// Origin name used for the compositor's aggregate resource index.
pub const AGGREGATE_ORIGIN: &str = "compositor";

/// What a subscription listens to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubscriptionTarget {
    Resource { uri: String },
    ListChanged { origin: String },
}

/// Scoped subscription key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub scope: AgentId,
    pub target: SubscriptionTarget,
}

impl SubscriptionKey {
    pub fn resource(scope: AgentId, uri: impl Into<String>) -> Self {
        Self {
            scope,
            target: SubscriptionTarget::Resource { uri: uri.into() },
        }
    }

    pub fn list_changed(scope: AgentId, origin: impl Into<String>) -> Self {
        Self {
            scope,
            target: SubscriptionTarget::ListChanged {
                origin: origin.into(),
            },
        }
    }
}

impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.target {
            SubscriptionTarget::Resource { uri } => write!(f, "{}:{}", self.scope, uri),
            SubscriptionTarget::ListChanged { origin } => {
                write!(f, "{}:list_changed:{}", self.scope, origin)
            }
        }
    }
}

/// A delivered change.
///
/// `sequence` increases by one per publish on the key, so a coalesced
/// delivery can be recognised by a gap.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub key: SubscriptionKey,
    pub sequence: u64,
    pub payload: Option<Value>,
    pub published_at: DateTime<Utc>,
}

/// Receives resource-updated and list-changed notifications.
#[async_trait]
pub trait ResourceObserver: Send + Sync {
    async fn on_notification(&self, notification: &Notification) -> Result<(), ObserverError>;
}

/// Handle returned by `subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Result of removing a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribed {
    pub key: SubscriptionKey,
    /// True when this was the last observer and the key was dropped.
    pub key_removed: bool,
}

/// One row of the subscription index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionIndexEntry {
    #[serde(flatten)]
    pub key: SubscriptionKey,
    pub observers: usize,
    pub last_sequence: u64,
    pub created_at: DateTime<Utc>,
}

struct Topic {
    tx: watch::Sender<Option<Notification>>,
    sequence: u64,
    subscribers: HashMap<SubscriptionId, CancellationToken>,
    created_at: DateTime<Utc>,
}

impl Topic {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx,
            sequence: 0,
            subscribers: HashMap::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
struct DeliveryStats {
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeliverySnapshot {
    pub delivered: u64,
    pub failed: u64,
}

/// Tracks who is interested in which resource and delivers changes to them.
pub struct SubscriptionRegistry {
    topics: DashMap<SubscriptionKey, Topic>,
    by_id: DashMap<SubscriptionId, SubscriptionKey>,
    next_id: AtomicU64,
    coalesce_window: Duration,
    supervisor: Supervisor,
    stats: Arc<DeliveryStats>,
}

impl SubscriptionRegistry {
    pub fn new(supervisor: Supervisor, coalesce_window: Duration) -> Self {
        Self {
            topics: DashMap::new(),
            by_id: DashMap::new(),
            next_id: AtomicU64::new(1),
            coalesce_window,
            supervisor,
            stats: Arc::new(DeliveryStats::default()),
        }
    }

    pub fn coalesce_window(&self) -> Duration {
        self.coalesce_window
    }

    /// Subscribe to updates of one resource URI.
    pub fn subscribe(
        &self,
        scope: &AgentId,
        uri: &str,
        observer: Arc<dyn ResourceObserver>,
    ) -> SubscriptionId {
        self.subscribe_key(SubscriptionKey::resource(scope.clone(), uri), observer)
    }

    /// Subscribe to list-changed events from one origin.
    pub fn subscribe_list_changed(
        &self,
        scope: &AgentId,
        origin: &str,
        observer: Arc<dyn ResourceObserver>,
    ) -> SubscriptionId {
        self.subscribe_key(SubscriptionKey::list_changed(scope.clone(), origin), observer)
    }

    pub fn subscribe_key(
        &self,
        key: SubscriptionKey,
        observer: Arc<dyn ResourceObserver>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let token = self.supervisor.child_token();

        let rx = {
            let mut topic = self.topics.entry(key.clone()).or_insert_with(Topic::new);
            topic.subscribers.insert(id, token.clone());
            topic.tx.subscribe()
        };
        self.by_id.insert(id, key.clone());

        debug!(subscription = %id, key = %key, "Subscription added");

        let worker = DeliveryWorker {
            id,
            key,
            rx,
            observer,
            token,
            window: self.coalesce_window,
            stats: Arc::clone(&self.stats),
        };
        self.supervisor
            .spawn(format!("subscription-{}", id), worker.run());
        id
    }

    /// Remove one subscription. Unknown ids return `None`.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Option<Unsubscribed> {
        let (_, key) = self.by_id.remove(&id)?;

        let empty = match self.topics.get_mut(&key) {
            Some(mut topic) => {
                if let Some(token) = topic.subscribers.remove(&id) {
                    token.cancel();
                }
                topic.subscribers.is_empty()
            }
            None => false,
        };
        let key_removed = empty
            && self
                .topics
                .remove_if(&key, |_, topic| topic.subscribers.is_empty())
                .is_some();

        debug!(subscription = %id, key = %key, key_removed, "Subscription removed");
        Some(Unsubscribed { key, key_removed })
    }

    /// Drop every resource subscription whose URI starts with `prefix`,
    /// across all scopes when `scope` is `None`.
    pub fn unsubscribe_prefix(&self, scope: Option<&AgentId>, prefix: &str) -> usize {
        let ids: Vec<SubscriptionId> = self
            .by_id
            .iter()
            .filter(|entry| {
                let key = entry.value();
                scope.map_or(true, |s| &key.scope == s)
                    && matches!(&key.target, SubscriptionTarget::Resource { uri } if uri.starts_with(prefix))
            })
            .map(|entry| *entry.key())
            .collect();

        let removed = ids
            .into_iter()
            .filter_map(|id| self.unsubscribe(id))
            .count();
        if removed > 0 {
            info!(prefix, removed, "Removed subscriptions under prefix");
        }
        removed
    }

    /// Publish a change. Returns false when nobody is subscribed to `key`.
    pub fn publish(&self, key: &SubscriptionKey, payload: Option<Value>) -> bool {
        let Some(mut topic) = self.topics.get_mut(key) else {
            return false;
        };
        topic.sequence += 1;
        let notification = Notification {
            key: key.clone(),
            sequence: topic.sequence,
            payload,
            published_at: Utc::now(),
        };
        topic.tx.send_replace(Some(notification));
        true
    }

    /// Publish to `target` in every scope that subscribes to it. Returns the
    /// number of scopes reached.
    pub fn publish_to_all(&self, target: &SubscriptionTarget, payload: Option<Value>) -> usize {
        let keys: Vec<SubscriptionKey> = self
            .topics
            .iter()
            .filter(|topic| &topic.key().target == target)
            .map(|topic| topic.key().clone())
            .collect();
        keys.iter()
            .filter(|key| self.publish(key, payload.clone()))
            .count()
    }

    pub fn publish_updated(&self, scope: &AgentId, uri: &str, payload: Option<Value>) -> bool {
        self.publish(&SubscriptionKey::resource(scope.clone(), uri), payload)
    }

    pub fn publish_list_changed(&self, scope: &AgentId, origin: &str, payload: Option<Value>) -> bool {
        self.publish(&SubscriptionKey::list_changed(scope.clone(), origin), payload)
    }

    pub fn observer_count(&self, key: &SubscriptionKey) -> usize {
        self.topics
            .get(key)
            .map(|topic| topic.subscribers.len())
            .unwrap_or(0)
    }

    pub fn subscription_count(&self) -> usize {
        self.by_id.len()
    }

    /// Current subscriptions, optionally limited to one scope, sorted by key.
    pub fn index(&self, scope: Option<&AgentId>) -> Vec<SubscriptionIndexEntry> {
        let mut entries: Vec<SubscriptionIndexEntry> = self
            .topics
            .iter()
            .filter(|topic| scope.map_or(true, |s| &topic.key().scope == s))
            .map(|topic| SubscriptionIndexEntry {
                key: topic.key().clone(),
                observers: topic.subscribers.len(),
                last_sequence: topic.sequence,
                created_at: topic.created_at,
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    pub fn delivery_stats(&self) -> DeliverySnapshot {
        DeliverySnapshot {
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }

    /// Cancel every delivery task and forget all subscriptions.
    pub fn close(&self) {
        for topic in self.topics.iter() {
            for token in topic.subscribers.values() {
                token.cancel();
            }
        }
        self.topics.clear();
        self.by_id.clear();
    }
}

struct DeliveryWorker {
    id: SubscriptionId,
    key: SubscriptionKey,
    rx: watch::Receiver<Option<Notification>>,
    observer: Arc<dyn ResourceObserver>,
    token: CancellationToken,
    window: Duration,
    stats: Arc<DeliveryStats>,
}

impl DeliveryWorker {
    async fn run(mut self) {
        let label = self.id.to_string();
        let subject = self.key.to_string();
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            // Let a burst settle so the observer sees its final state once.
            if !self.window.is_zero() {
                tokio::select! {
                    _ = self.token.cancelled() => break,
                    _ = tokio::time::sleep(self.window) => {}
                }
            }

            let latest = self.rx.borrow_and_update().clone();
            let Some(notification) = latest else {
                continue;
            };

            let ok = deliver_isolated(
                &label,
                &subject,
                self.observer.on_notification(&notification),
            )
            .await;
            let counter = if ok {
                &self.stats.delivered
            } else {
                &self.stats.failed
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
        debug!(subscription = %label, key = %subject, "Delivery task stopped");
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;

    struct ChannelObserver {
        tx: mpsc::UnboundedSender<Notification>,
        delay: Duration,
    }

    #[async_trait]
    impl ResourceObserver for ChannelObserver {
        async fn on_notification(&self, n: &Notification) -> Result<(), ObserverError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let _ = self.tx.send(n.clone());
            Ok(())
        }
    }

    struct FailingObserver {
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl ResourceObserver for FailingObserver {
        async fn on_notification(&self, _n: &Notification) -> Result<(), ObserverError> {
            *self.calls.lock() += 1;
            Err(ObserverError::new("always fails"))
        }
    }

    fn registry(window_ms: u64) -> SubscriptionRegistry {
        SubscriptionRegistry::new(Supervisor::new("test"), Duration::from_millis(window_ms))
    }

    fn channel_observer(delay_ms: u64) -> (Arc<ChannelObserver>, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(ChannelObserver {
                tx,
                delay: Duration::from_millis(delay_ms),
            }),
            rx,
        )
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Notification {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("notification not delivered in time")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let registry = registry(0);
        assert!(!registry.publish_updated(&AgentId::new("a"), "mcp/fs/x", None));
    }

    #[tokio::test]
    async fn test_delivers_to_all_observers() {
        let registry = registry(0);
        let scope = AgentId::new("a");
        let (obs1, mut rx1) = channel_observer(0);
        let (obs2, mut rx2) = channel_observer(0);
        registry.subscribe(&scope, "mcp/fs/readme", obs1);
        registry.subscribe(&scope, "mcp/fs/readme", obs2);

        assert!(registry.publish_updated(&scope, "mcp/fs/readme", Some(json!({"v": 1}))));

        assert_eq!(recv(&mut rx1).await.payload, Some(json!({"v": 1})));
        assert_eq!(recv(&mut rx2).await.sequence, 1);
    }

    #[tokio::test]
    async fn test_scopes_are_isolated() {
        let registry = registry(0);
        let (obs, mut rx) = channel_observer(0);
        registry.subscribe(&AgentId::new("a"), "uri", obs);

        assert!(!registry.publish_updated(&AgentId::new("b"), "uri", None));
        assert!(registry.publish_updated(&AgentId::new("a"), "uri", None));
        assert_eq!(recv(&mut rx).await.key.scope, AgentId::new("a"));
    }

    #[tokio::test]
    async fn test_burst_is_coalesced_for_slow_observer() {
        let registry = registry(5);
        let scope = AgentId::new("a");
        let (obs, mut rx) = channel_observer(20);
        registry.subscribe(&scope, "mcp/db/row", obs);

        for i in 1..=10 {
            registry.publish_updated(&scope, "mcp/db/row", Some(json!(i)));
        }

        let mut received = Vec::new();
        loop {
            let n = recv(&mut rx).await;
            let last = n.sequence == 10;
            received.push(n);
            if last {
                break;
            }
        }

        assert!(!received.is_empty() && received.len() <= 10);
        let last = received.last().unwrap();
        assert_eq!(last.payload, Some(json!(10)));
    }

    #[tokio::test]
    async fn test_update_during_delivery_is_not_lost() {
        let registry = registry(0);
        let scope = AgentId::new("a");
        let (obs, mut rx) = channel_observer(30);
        registry.subscribe(&scope, "r", obs);

        registry.publish_updated(&scope, "r", Some(json!("first")));
        tokio::time::sleep(Duration::from_millis(10)).await;
        registry.publish_updated(&scope, "r", Some(json!("second")));

        assert_eq!(recv(&mut rx).await.payload, Some(json!("first")));
        assert_eq!(recv(&mut rx).await.payload, Some(json!("second")));
    }

    #[tokio::test]
    async fn test_failing_observer_does_not_block_others() {
        let registry = registry(0);
        let scope = AgentId::new("a");
        let failing = Arc::new(FailingObserver {
            calls: Mutex::new(0),
        });
        let (obs, mut rx) = channel_observer(0);
        registry.subscribe(&scope, "r", failing.clone());
        registry.subscribe(&scope, "r", obs);

        registry.publish_updated(&scope, "r", None);
        recv(&mut rx).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*failing.calls.lock(), 1);
        assert_eq!(registry.delivery_stats().failed, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_garbage_collects_key() {
        let registry = registry(0);
        let scope = AgentId::new("a");
        let (obs1, _rx1) = channel_observer(0);
        let (obs2, _rx2) = channel_observer(0);
        let a = registry.subscribe(&scope, "r", obs1);
        let b = registry.subscribe(&scope, "r", obs2);
        let key = SubscriptionKey::resource(scope.clone(), "r");
        assert_eq!(registry.observer_count(&key), 2);

        let first = registry.unsubscribe(a).unwrap();
        assert!(!first.key_removed);
        let second = registry.unsubscribe(b).unwrap();
        assert!(second.key_removed);
        assert!(registry.unsubscribe(b).is_none());
        assert!(registry.index(None).is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribed_observer_stops_receiving() {
        let registry = registry(0);
        let scope = AgentId::new("a");
        let (obs, mut rx) = channel_observer(0);
        let (keep, mut keep_rx) = channel_observer(0);
        let id = registry.subscribe(&scope, "r", obs);
        registry.subscribe(&scope, "r", keep);

        registry.unsubscribe(id);
        registry.publish_updated(&scope, "r", None);
        recv(&mut keep_rx).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_list_changed_channel() {
        let registry = registry(0);
        let scope = AgentId::new("a");
        let (obs, mut rx) = channel_observer(0);
        registry.subscribe_list_changed(&scope, AGGREGATE_ORIGIN, obs);

        assert!(registry.publish_list_changed(&scope, AGGREGATE_ORIGIN, None));
        let n = recv(&mut rx).await;
        assert_eq!(
            n.key.target,
            SubscriptionTarget::ListChanged {
                origin: AGGREGATE_ORIGIN.to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_index_and_prefix_removal() {
        let registry = registry(0);
        let scope = AgentId::new("a");
        let (obs, _rx) = channel_observer(0);
        registry.subscribe(&scope, "mcp/fs/a", obs.clone());
        registry.subscribe(&scope, "mcp/fs/b", obs.clone());
        registry.subscribe(&scope, "mcp/git/c", obs.clone());
        registry.subscribe(&AgentId::new("other"), "mcp/fs/a", obs);

        assert_eq!(registry.index(Some(&scope)).len(), 3);
        assert_eq!(registry.index(None).len(), 4);

        assert_eq!(registry.unsubscribe_prefix(Some(&scope), "mcp/fs/"), 2);
        let remaining = registry.index(Some(&scope));
        assert_eq!(remaining.len(), 1);
        assert_eq!(
            remaining[0].key.target,
            SubscriptionTarget::Resource {
                uri: "mcp/git/c".to_string()
            }
        );
        assert_eq!(registry.subscription_count(), 2);

        assert_eq!(registry.unsubscribe_prefix(None, "mcp/"), 2);
        assert_eq!(registry.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_to_all_scopes() {
        let registry = registry(0);
        let (a, mut rx_a) = channel_observer(0);
        let (b, mut rx_b) = channel_observer(0);
        registry.subscribe(&AgentId::new("a"), "mcp/fs/x", a);
        registry.subscribe(&AgentId::new("b"), "mcp/fs/x", b);

        let target = SubscriptionTarget::Resource {
            uri: "mcp/fs/x".to_string(),
        };
        assert_eq!(registry.publish_to_all(&target, Some(json!(1))), 2);
        assert_eq!(recv(&mut rx_a).await.key.scope, AgentId::new("a"));
        assert_eq!(recv(&mut rx_b).await.key.scope, AgentId::new("b"));
    }
}
