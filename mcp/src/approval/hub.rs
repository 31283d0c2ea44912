//! Approval hub: calls parked until a human decides.
//!
//! Each pending item owns a `watch` channel. Waiters subscribe to it and the
//! first resolution wins; later attempts get `AlreadyResolved` and the
//! earlier outcome stands. Resolved items move to a bounded LRU archive so
//! they can still be looked up after they leave the pending set.
//!
//! Observers receive `Submitted`/`Resolved` events in order from a single
//! supervised dispatcher, so a slow observer never delays a resolution.

use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::join_all;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    approval::PolicyDecision,
    core::config::TimeoutResolution,
    error::{ApprovalError, McpError, McpResult, TransitionError},
    notify::{
        supervisor::deliver_isolated, ObserverError, ObserverHandle, ObserverSet,
        SubscriptionRegistry, Supervisor,
    },
    record::{CallState, DecisionSource, ToolCallRecord, Verdict},
    scope::{AgentId, RunId},
};

/// URI of the pending-set resource, per agent.
pub const PENDING_URI: &str = "approvals://pending";

/// URI of one item's resource.
pub fn item_uri(call_id: &str) -> String {
    format!("approvals://{}", call_id)
}

const DEFAULT_ARCHIVE_CAPACITY: usize = 1024;

/// How a human (or timeout) resolved an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalResolution {
    Approved,
    DeniedContinue,
    DeniedAbort,
}

impl ApprovalResolution {
    pub fn verdict(self) -> Verdict {
        match self {
            ApprovalResolution::Approved => Verdict::Allow,
            ApprovalResolution::DeniedContinue => Verdict::DenyContinue,
            ApprovalResolution::DeniedAbort => Verdict::DenyAbort,
        }
    }
}

impl From<TimeoutResolution> for ApprovalResolution {
    fn from(resolution: TimeoutResolution) -> Self {
        match resolution {
            TimeoutResolution::DenyContinue => ApprovalResolution::DeniedContinue,
            TimeoutResolution::DenyAbort => ApprovalResolution::DeniedAbort,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    DeniedContinue,
    DeniedAbort,
}

impl ApprovalStatus {
    pub fn resolution(self) -> Option<ApprovalResolution> {
        match self {
            ApprovalStatus::Pending => None,
            ApprovalStatus::Approved => Some(ApprovalResolution::Approved),
            ApprovalStatus::DeniedContinue => Some(ApprovalResolution::DeniedContinue),
            ApprovalStatus::DeniedAbort => Some(ApprovalResolution::DeniedAbort),
        }
    }
}

impl From<ApprovalResolution> for ApprovalStatus {
    fn from(resolution: ApprovalResolution) -> Self {
        match resolution {
            ApprovalResolution::Approved => ApprovalStatus::Approved,
            ApprovalResolution::DeniedContinue => ApprovalStatus::DeniedContinue,
            ApprovalResolution::DeniedAbort => ApprovalStatus::DeniedAbort,
        }
    }
}

/// One call waiting on (or done waiting on) a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalItem {
    pub call_id: String,
    pub agent_id: AgentId,
    pub run_id: RunId,
    pub tool_name: String,
    pub arguments: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<DecisionSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ApprovalItem {
    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }

    pub fn resolution(&self) -> Option<ApprovalResolution> {
        self.status.resolution()
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "item", rename_all = "snake_case")]
pub enum ApprovalEvent {
    Submitted(ApprovalItem),
    Resolved(ApprovalItem),
}

impl ApprovalEvent {
    pub fn item(&self) -> &ApprovalItem {
        match self {
            ApprovalEvent::Submitted(item) | ApprovalEvent::Resolved(item) => item,
        }
    }
}

/// Receives approval lifecycle events.
#[async_trait]
pub trait ApprovalObserver: Send + Sync {
    async fn on_event(&self, event: &ApprovalEvent) -> Result<(), ObserverError>;
}

/// Result of waiting on an item.
#[derive(Debug, Clone, PartialEq)]
pub enum AwaitOutcome {
    /// Resolved by someone else (human, sweeper or shutdown).
    Resolved(ApprovalItem),
    /// Resolved by a timeout: this waiter's own, or the expiry sweeper's.
    TimedOut(ApprovalItem),
}

impl AwaitOutcome {
    fn settled(item: ApprovalItem) -> Self {
        if item.resolved_by == Some(DecisionSource::Timeout) {
            AwaitOutcome::TimedOut(item)
        } else {
            AwaitOutcome::Resolved(item)
        }
    }

    pub fn item(&self) -> &ApprovalItem {
        match self {
            AwaitOutcome::Resolved(item) | AwaitOutcome::TimedOut(item) => item,
        }
    }

    pub fn into_item(self) -> ApprovalItem {
        match self {
            AwaitOutcome::Resolved(item) | AwaitOutcome::TimedOut(item) => item,
        }
    }
}

struct PendingSlot {
    item: ApprovalItem,
    tx: watch::Sender<Option<ApprovalItem>>,
}

pub struct ApprovalHub {
    pending: DashMap<String, PendingSlot>,
    archive: Mutex<LruCache<String, ApprovalItem>>,
    observers: Arc<ObserverSet<dyn ApprovalObserver>>,
    events: mpsc::UnboundedSender<ApprovalEvent>,
    registry: Option<Arc<SubscriptionRegistry>>,
    timeout_resolution: ApprovalResolution,
    item_ttl: Option<Duration>,
    closed: AtomicBool,
}

impl ApprovalHub {
    /// Must be called inside a tokio runtime; the event dispatcher is
    /// spawned on `supervisor`.
    pub fn new(supervisor: &Supervisor) -> Self {
        let observers: Arc<ObserverSet<dyn ApprovalObserver>> = Arc::new(ObserverSet::new());
        let (events, rx) = mpsc::unbounded_channel();
        supervisor.spawn(
            "approval-dispatcher",
            dispatch_events(rx, Arc::clone(&observers), supervisor.child_token()),
        );
        Self {
            pending: DashMap::new(),
            archive: Mutex::new(LruCache::new(archive_capacity(DEFAULT_ARCHIVE_CAPACITY))),
            observers,
            events,
            registry: None,
            timeout_resolution: ApprovalResolution::DeniedContinue,
            item_ttl: None,
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_registry(mut self, registry: Arc<SubscriptionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_timeout_resolution(mut self, resolution: impl Into<ApprovalResolution>) -> Self {
        self.timeout_resolution = resolution.into();
        self
    }

    pub fn with_item_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.item_ttl = ttl;
        self
    }

    pub fn with_archive_capacity(self, capacity: usize) -> Self {
        self.archive.lock().resize(archive_capacity(capacity));
        self
    }

    pub fn timeout_resolution(&self) -> ApprovalResolution {
        self.timeout_resolution
    }

    pub fn register_observer(&self, observer: Arc<dyn ApprovalObserver>) -> ObserverHandle {
        self.observers.register(observer)
    }

    pub fn unregister_observer(&self, handle: ObserverHandle) -> bool {
        self.observers.unregister(handle)
    }

    /// Park a call whose policy decision is `Ask`.
    pub fn submit(&self, record: &ToolCallRecord) -> McpResult<ApprovalItem> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ApprovalError::Closed.into());
        }
        let asks = record
            .decision()
            .is_some_and(|d| d.policy == PolicyDecision::Ask && d.approval.is_none());
        if record.state() != CallState::Pending || !asks {
            return Err(McpError::InvalidTransition(TransitionError::DecisionMismatch {
                call_id: record.call_id().to_string(),
                detail: "only a pending call with an unresolved ask can be submitted".to_string(),
            }));
        }

        let call_id = record.call_id().to_string();
        if self.archive.lock().contains(&call_id) {
            return Err(ApprovalError::AlreadyResolved(call_id).into());
        }

        let now = Utc::now();
        let item = ApprovalItem {
            call_id: call_id.clone(),
            agent_id: record.agent_id().clone(),
            run_id: record.run_id().clone(),
            tool_name: record.payload().name.clone(),
            arguments: record.payload().arguments.clone(),
            created_at: now,
            expires_at: self
                .item_ttl
                .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
                .map(|ttl| now + ttl),
            status: ApprovalStatus::Pending,
            resolved_at: None,
            resolved_by: None,
            reason: None,
        };

        match self.pending.entry(call_id.clone()) {
            Entry::Occupied(_) => return Err(ApprovalError::AlreadyPending(call_id).into()),
            Entry::Vacant(slot) => {
                let (tx, _rx) = watch::channel(None);
                slot.insert(PendingSlot {
                    item: item.clone(),
                    tx,
                });
            }
        }
        // `close` may have collected its ids before the insert landed.
        if self.closed.load(Ordering::SeqCst) {
            self.pending.remove(&call_id);
            return Err(ApprovalError::Closed.into());
        }

        info!(
            call_id = %item.call_id,
            agent_id = %item.agent_id,
            tool = %item.tool_name,
            "Approval requested"
        );
        self.publish(&item);
        self.emit(ApprovalEvent::Submitted(item.clone()));
        Ok(item)
    }

    /// Wait for `call_id` to be resolved, applying the timeout resolution if
    /// nobody decides within `timeout`.
    pub async fn wait(&self, call_id: &str, timeout: Duration) -> McpResult<AwaitOutcome> {
        let mut rx = match self.pending.get(call_id) {
            Some(slot) => slot.tx.subscribe(),
            None => {
                return self
                    .archived(call_id)
                    .map(AwaitOutcome::settled)
                    .ok_or_else(|| ApprovalError::NotFound(call_id.to_string()).into())
            }
        };

        let resolved = match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(item)) => Some(item.clone()),
            Ok(Err(_)) => return Err(ApprovalError::Closed.into()),
            Err(_) => None,
        };
        match resolved {
            Some(item) => item
                .map(AwaitOutcome::settled)
                .ok_or_else(|| ApprovalError::Closed.into()),
            None => {
                let reason = format!("no decision within {}ms", timeout.as_millis());
                match self.resolve_with(
                    call_id,
                    self.timeout_resolution,
                    DecisionSource::Timeout,
                    Some(reason),
                ) {
                    Ok(item) => Ok(AwaitOutcome::TimedOut(item)),
                    // Lost the race to a concurrent resolution; that one stands.
                    Err(McpError::Approval(ApprovalError::AlreadyResolved(_))) => self
                        .archived(call_id)
                        .or_else(|| rx.borrow().clone())
                        .map(AwaitOutcome::settled)
                        .ok_or_else(|| ApprovalError::NotFound(call_id.to_string()).into()),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Human resolution.
    pub fn resolve(
        &self,
        call_id: &str,
        resolution: ApprovalResolution,
        reason: Option<String>,
    ) -> McpResult<ApprovalItem> {
        self.resolve_with(call_id, resolution, DecisionSource::Human, reason)
    }

    /// Resolve with an explicit source. Only the first resolution of an item
    /// takes effect.
    pub fn resolve_with(
        &self,
        call_id: &str,
        resolution: ApprovalResolution,
        source: DecisionSource,
        reason: Option<String>,
    ) -> McpResult<ApprovalItem> {
        let item = {
            let Some(mut slot) = self.pending.get_mut(call_id) else {
                return Err(if self.archive.lock().contains(call_id) {
                    ApprovalError::AlreadyResolved(call_id.to_string()).into()
                } else {
                    ApprovalError::NotFound(call_id.to_string()).into()
                });
            };
            if !slot.item.is_pending() {
                return Err(ApprovalError::AlreadyResolved(call_id.to_string()).into());
            }
            slot.item.status = resolution.into();
            slot.item.resolved_at = Some(Utc::now());
            slot.item.resolved_by = Some(source);
            slot.item.reason = reason;
            let item = slot.item.clone();
            slot.tx.send_replace(Some(item.clone()));
            self.archive.lock().put(call_id.to_string(), item.clone());
            item
        };
        self.pending.remove(call_id);

        info!(
            call_id = %item.call_id,
            agent_id = %item.agent_id,
            resolution = ?resolution,
            source = ?source,
            "Approval resolved"
        );
        self.publish(&item);
        self.emit(ApprovalEvent::Resolved(item.clone()));
        Ok(item)
    }

    /// Pending or archived item.
    pub fn get(&self, call_id: &str) -> Option<ApprovalItem> {
        self.pending
            .get(call_id)
            .map(|slot| slot.item.clone())
            .or_else(|| self.archived(call_id))
    }

    /// Pending items, oldest first, optionally for one agent.
    pub fn pending_items(&self, agent: Option<&AgentId>) -> Vec<ApprovalItem> {
        let mut items: Vec<ApprovalItem> = self
            .pending
            .iter()
            .filter(|slot| agent.map_or(true, |a| &slot.item.agent_id == a))
            .map(|slot| slot.item.clone())
            .collect();
        items.sort_by_key(|item| item.created_at);
        items
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Resolve every item whose expiry has passed. Returns how many.
    pub fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|slot| slot.item.is_expired(now))
            .map(|slot| slot.key().clone())
            .collect();

        expired
            .iter()
            .filter(|call_id| {
                self.resolve_with(
                    call_id,
                    self.timeout_resolution,
                    DecisionSource::Timeout,
                    Some("approval expired".to_string()),
                )
                .is_ok()
            })
            .count()
    }

    /// Refuse new submissions and deny-abort everything still pending.
    pub fn close(&self, reason: &str) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let ids: Vec<String> = self.pending.iter().map(|slot| slot.key().clone()).collect();
        let cancelled = ids
            .iter()
            .filter(|call_id| {
                self.resolve_with(
                    call_id,
                    ApprovalResolution::DeniedAbort,
                    DecisionSource::Shutdown,
                    Some(reason.to_string()),
                )
                .is_ok()
            })
            .count();
        if cancelled > 0 {
            warn!(cancelled, "Denied pending approvals on shutdown");
        }
        cancelled
    }

    fn archived(&self, call_id: &str) -> Option<ApprovalItem> {
        self.archive.lock().peek(call_id).cloned()
    }

    fn publish(&self, item: &ApprovalItem) {
        let Some(registry) = &self.registry else {
            return;
        };
        let payload = serde_json::to_value(item).ok();
        registry.publish_updated(&item.agent_id, &item_uri(&item.call_id), payload);

        let pending = self.pending_items(Some(&item.agent_id));
        registry.publish_updated(&item.agent_id, PENDING_URI, serde_json::to_value(pending).ok());
    }

    fn emit(&self, event: ApprovalEvent) {
        if self.events.send(event).is_err() {
            debug!("Approval dispatcher stopped; event dropped");
        }
    }
}

fn archive_capacity(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)
}

async fn dispatch_events(
    mut rx: mpsc::UnboundedReceiver<ApprovalEvent>,
    observers: Arc<ObserverSet<dyn ApprovalObserver>>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = token.cancelled() => break,
        };
        match event {
            Some(event) => deliver_event(&observers, &event).await,
            None => return,
        }
    }
    // Events queued before shutdown (such as shutdown denials) still go out.
    while let Ok(event) = rx.try_recv() {
        deliver_event(&observers, &event).await;
    }
}

async fn deliver_event(observers: &ObserverSet<dyn ApprovalObserver>, event: &ApprovalEvent) {
    let subject = event.item().call_id.as_str();
    let snapshot = observers.snapshot();
    join_all(snapshot.iter().map(|(handle, observer)| {
        let label = handle.to_string();
        async move { deliver_isolated(&label, subject, observer.on_event(event)).await }
    }))
    .await;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        notify::{Notification, ResourceObserver},
        record::ToolCallPayload,
        scope::CallerContext,
    };

    fn asking_record(call_id: &str) -> ToolCallRecord {
        let caller = CallerContext::new("agent", RunId::new("run"));
        let mut record = ToolCallRecord::new(
            call_id,
            &caller,
            ToolCallPayload::new("mcp/db/drop", json!({"table": "users"})),
        );
        record.record_policy(PolicyDecision::Ask, None).unwrap();
        record
    }

    fn hub() -> ApprovalHub {
        ApprovalHub::new(&Supervisor::new("test"))
    }

    struct Recorder {
        events: Mutex<Vec<ApprovalEvent>>,
    }

    #[async_trait]
    impl ApprovalObserver for Recorder {
        async fn on_event(&self, event: &ApprovalEvent) -> Result<(), ObserverError> {
            self.events.lock().push(event.clone());
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl ApprovalObserver for Broken {
        async fn on_event(&self, _event: &ApprovalEvent) -> Result<(), ObserverError> {
            panic!("observer bug")
        }
    }

    #[tokio::test]
    async fn test_submit_and_resolve() {
        let hub = hub();
        let item = hub.submit(&asking_record("c1")).unwrap();
        assert!(item.is_pending());
        assert_eq!(hub.pending_count(), 1);

        let resolved = hub
            .resolve("c1", ApprovalResolution::Approved, None)
            .unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);
        assert_eq!(resolved.resolved_by, Some(DecisionSource::Human));
        assert_eq!(hub.pending_count(), 0);
        assert_eq!(hub.get("c1").unwrap().status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn test_submit_requires_ask() {
        let hub = hub();
        let caller = CallerContext::default();
        let mut record = ToolCallRecord::new("c1", &caller, ToolCallPayload::new("t", json!({})));
        record.record_policy(PolicyDecision::Allow, None).unwrap();
        assert!(matches!(
            hub.submit(&record),
            Err(McpError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_submit() {
        let hub = hub();
        hub.submit(&asking_record("c1")).unwrap();
        assert!(matches!(
            hub.submit(&asking_record("c1")),
            Err(McpError::Approval(ApprovalError::AlreadyPending(_)))
        ));
    }

    #[tokio::test]
    async fn test_second_resolution_rejected() {
        let hub = hub();
        hub.submit(&asking_record("c1")).unwrap();
        hub.resolve("c1", ApprovalResolution::DeniedAbort, Some("no".into()))
            .unwrap();

        let err = hub
            .resolve("c1", ApprovalResolution::Approved, None)
            .unwrap_err();
        assert!(matches!(
            err,
            McpError::Approval(ApprovalError::AlreadyResolved(_))
        ));
        assert_eq!(hub.get("c1").unwrap().status, ApprovalStatus::DeniedAbort);
        assert!(matches!(
            hub.resolve("missing", ApprovalResolution::Approved, None),
            Err(McpError::Approval(ApprovalError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_resolutions_single_winner() {
        let hub = Arc::new(hub());
        hub.submit(&asking_record("c1")).unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let hub = Arc::clone(&hub);
            let resolution = if i % 2 == 0 {
                ApprovalResolution::Approved
            } else {
                ApprovalResolution::DeniedContinue
            };
            handles.push(tokio::spawn(async move {
                hub.resolve("c1", resolution, None).ok()
            }));
        }

        let winners: Vec<ApprovalItem> = join_all(handles)
            .await
            .into_iter()
            .filter_map(|r| r.unwrap())
            .collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(hub.get("c1").unwrap().status, winners[0].status);
    }

    #[tokio::test]
    async fn test_wait_sees_resolution() {
        let hub = Arc::new(hub());
        hub.submit(&asking_record("c1")).unwrap();

        let waiter = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move { hub.wait("c1", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        hub.resolve("c1", ApprovalResolution::Approved, None)
            .unwrap();

        let outcome = waiter.await.unwrap().unwrap();
        assert!(matches!(outcome, AwaitOutcome::Resolved(ref item) if item.status == ApprovalStatus::Approved));
    }

    #[tokio::test]
    async fn test_wait_after_resolution_returns_archived() {
        let hub = hub();
        hub.submit(&asking_record("c1")).unwrap();
        hub.resolve("c1", ApprovalResolution::DeniedContinue, None)
            .unwrap();
        let outcome = hub.wait("c1", Duration::from_millis(10)).await.unwrap();
        assert_eq!(outcome.item().status, ApprovalStatus::DeniedContinue);
    }

    #[tokio::test]
    async fn test_timeout_applies_default_resolution() {
        let hub = hub();
        hub.submit(&asking_record("c1")).unwrap();

        let outcome = hub.wait("c1", Duration::from_millis(20)).await.unwrap();
        let AwaitOutcome::TimedOut(item) = outcome else {
            panic!("expected timeout, got {:?}", outcome);
        };
        assert_eq!(item.status, ApprovalStatus::DeniedContinue);
        assert_eq!(item.resolved_by, Some(DecisionSource::Timeout));

        // A late human decision cannot override the timeout.
        assert!(hub
            .resolve("c1", ApprovalResolution::Approved, None)
            .is_err());
    }

    #[tokio::test]
    async fn test_timeout_resolution_configurable() {
        let hub = hub().with_timeout_resolution(TimeoutResolution::DenyAbort);
        hub.submit(&asking_record("c1")).unwrap();
        let outcome = hub.wait("c1", Duration::from_millis(5)).await.unwrap();
        assert_eq!(outcome.item().status, ApprovalStatus::DeniedAbort);
    }

    #[tokio::test]
    async fn test_evict_expired() {
        let hub = hub().with_item_ttl(Some(Duration::from_millis(1)));
        let item = hub.submit(&asking_record("c1")).unwrap();
        assert!(item.expires_at.is_some());
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(hub.evict_expired(), 1);
        assert_eq!(hub.get("c1").unwrap().resolved_by, Some(DecisionSource::Timeout));
        assert_eq!(hub.evict_expired(), 0);
    }

    #[tokio::test]
    async fn test_wait_reports_sweeper_expiry_as_timeout() {
        let hub = Arc::new(hub().with_item_ttl(Some(Duration::from_millis(5))));
        hub.submit(&asking_record("c1")).unwrap();

        let waiter = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move { hub.wait("c1", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hub.evict_expired(), 1);

        let outcome = waiter.await.unwrap().unwrap();
        assert!(matches!(outcome, AwaitOutcome::TimedOut(ref item) if item.status == ApprovalStatus::DeniedContinue));
        let again = hub.wait("c1", Duration::from_millis(5)).await.unwrap();
        assert!(matches!(again, AwaitOutcome::TimedOut(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_racing_submissions_leaves_nothing_pending() {
        for round in 0..20 {
            let hub = Arc::new(hub());
            let submitters: Vec<_> = (0..16)
                .map(|i| {
                    let hub = Arc::clone(&hub);
                    tokio::spawn(async move {
                        hub.submit(&asking_record(&format!("r{}-c{}", round, i))).is_ok()
                    })
                })
                .collect();
            let closer = {
                let hub = Arc::clone(&hub);
                tokio::spawn(async move { hub.close("shutting down") })
            };

            let accepted = join_all(submitters)
                .await
                .into_iter()
                .filter(|r| *r.as_ref().unwrap())
                .count();
            let cancelled = closer.await.unwrap();
            assert_eq!(hub.pending_count(), 0, "round {}", round);
            assert_eq!(accepted, cancelled, "round {}", round);
        }
    }

    #[tokio::test]
    async fn test_close_denies_pending_and_rejects_new() {
        let hub = hub();
        hub.submit(&asking_record("c1")).unwrap();
        hub.submit(&asking_record("c2")).unwrap();

        assert_eq!(hub.close("shutting down"), 2);
        let item = hub.get("c2").unwrap();
        assert_eq!(item.status, ApprovalStatus::DeniedAbort);
        assert_eq!(item.resolved_by, Some(DecisionSource::Shutdown));
        assert!(matches!(
            hub.submit(&asking_record("c3")),
            Err(McpError::Approval(ApprovalError::Closed))
        ));
    }

    #[tokio::test]
    async fn test_archive_is_bounded() {
        let hub = hub().with_archive_capacity(2);
        for i in 0..3 {
            let id = format!("c{}", i);
            hub.submit(&asking_record(&id)).unwrap();
            hub.resolve(&id, ApprovalResolution::Approved, None).unwrap();
        }
        assert!(hub.get("c0").is_none());
        assert!(hub.get("c2").is_some());
    }

    #[tokio::test]
    async fn test_observers_isolated_and_ordered() {
        let hub = hub();
        hub.register_observer(Arc::new(Broken));
        let recorder = Arc::new(Recorder {
            events: Mutex::new(Vec::new()),
        });
        hub.register_observer(recorder.clone());

        hub.submit(&asking_record("c1")).unwrap();
        hub.resolve("c1", ApprovalResolution::Approved, None).unwrap();

        for _ in 0..50 {
            if recorder.events.lock().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let events = recorder.events.lock().clone();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ApprovalEvent::Submitted(_)));
        assert!(matches!(events[1], ApprovalEvent::Resolved(_)));
    }

    struct Capture(mpsc::UnboundedSender<Notification>);

    #[async_trait]
    impl ResourceObserver for Capture {
        async fn on_notification(&self, n: &Notification) -> Result<(), ObserverError> {
            let _ = self.0.send(n.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_items_published_as_resources() {
        let supervisor = Supervisor::new("test");
        let registry = Arc::new(SubscriptionRegistry::new(supervisor.clone(), Duration::ZERO));
        let hub = ApprovalHub::new(&supervisor).with_registry(Arc::clone(&registry));

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.subscribe(&AgentId::new("agent"), &item_uri("c1"), Arc::new(Capture(tx)));

        hub.submit(&asking_record("c1")).unwrap();
        let n = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n.payload.unwrap()["status"], "pending");
    }
}
