//! Compositor: many downstream servers behind one namespaced surface.
//!
//! Each mount is reachable under `<prefix>/<name>/`. Attach and detach for
//! the same name are serialized by a per-name async lock; different names
//! proceed in parallel. The aggregate tool/resource index is rebuilt under a
//! single short lock and published through an [`ArcSwap`], so readers always
//! see one committed snapshot. Back-to-back index changes produce a single
//! coalesced list-changed notification for the aggregate origin.
//!
//! Notifications from one downstream are forwarded by a dedicated task in
//! arrival order. Nothing is promised about ordering across mounts.

pub mod downstream;
pub mod inprocess;
pub mod namespace;
mod rmcp_client;

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use self::{
    downstream::{
        Connector, DefaultConnector, DownstreamCapabilities, DownstreamNotification,
        DownstreamServer, NotificationSink, ReadResourceResult, ResourceDescriptor,
        ToolDescriptor, ToolResult, TransportSpec, NOTIFICATION_QUEUE_DEPTH,
    },
    inprocess::{InProcessServer, LinkState},
    namespace::{validate_mount_name, Namespace, RoutedId, DEFAULT_PREFIX},
};
use crate::{
    core::metrics::McpMetrics,
    error::{DownstreamError, McpError, McpResult},
    notify::{
        supervisor::deliver_isolated, ObserverError, ObserverHandle, ObserverSet,
        ResourceObserver, SubscriptionId, SubscriptionRegistry, SubscriptionTarget, Supervisor,
        AGGREGATE_ORIGIN,
    },
    scope::AgentId,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountOptions {
    /// Pinned mounts refuse a plain detach.
    #[serde(default)]
    pub pinned: bool,
}

impl MountOptions {
    pub fn pinned() -> Self {
        Self { pinned: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountStatus {
    Attaching,
    Running,
    Detaching,
    Detached,
    Failed,
}

/// Mount lifecycle change, delivered to every [`MountListener`].
#[derive(Debug, Clone, Serialize)]
pub struct MountEvent {
    pub name: String,
    pub status: MountStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait MountListener: Send + Sync {
    async fn on_mount_event(&self, event: &MountEvent) -> Result<(), ObserverError>;
}

/// Introspection view of one mount.
#[derive(Debug, Clone, Serialize)]
pub struct MountInfo {
    pub name: String,
    pub prefix: String,
    pub transport: String,
    pub pinned: bool,
    pub status: MountStatus,
    pub attached_at: DateTime<Utc>,
    pub tools: usize,
    pub resources: usize,
    pub capabilities: DownstreamCapabilities,
}

/// Committed view of everything the mounts expose, in routed form.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateIndex {
    pub generation: u64,
    pub tools: BTreeMap<String, ToolDescriptor>,
    pub resources: BTreeMap<String, ResourceDescriptor>,
}

#[derive(Default)]
struct Listing {
    tools: Vec<ToolDescriptor>,
    resources: Vec<ResourceDescriptor>,
}

struct Mount {
    name: String,
    transport: TransportSpec,
    pinned: bool,
    attached_at: DateTime<Utc>,
    status: RwLock<MountStatus>,
    server: Arc<dyn DownstreamServer>,
    listing: RwLock<Listing>,
    forwarder: CancellationToken,
    evicting: AtomicBool,
}

impl Mount {
    fn status(&self) -> MountStatus {
        *self.status.read()
    }

    fn set_status(&self, status: MountStatus) {
        *self.status.write() = status;
    }
}

/// Downstream subscriptions held on behalf of local subscribers.
#[derive(Default)]
struct Passthrough {
    by_id: HashMap<SubscriptionId, RoutedId>,
    refs: HashMap<RoutedId, usize>,
}

impl Passthrough {
    /// Returns true for the first local subscriber of `target`.
    fn add(&mut self, id: SubscriptionId, target: RoutedId) -> bool {
        let count = self.refs.entry(target.clone()).or_insert(0);
        *count += 1;
        self.by_id.insert(id, target);
        *count == 1
    }

    /// Returns the target when `id` was its last local subscriber.
    fn remove(&mut self, id: SubscriptionId) -> Option<RoutedId> {
        let target = self.by_id.remove(&id)?;
        let count = self.refs.get_mut(&target)?;
        *count -= 1;
        if *count == 0 {
            self.refs.remove(&target);
            Some(target)
        } else {
            None
        }
    }

    fn drop_server(&mut self, server: &str) {
        self.by_id.retain(|_, target| target.server != server);
        self.refs.retain(|target, _| target.server != server);
    }
}

pub struct Compositor {
    namespace: Namespace,
    connector: Arc<dyn Connector>,
    registry: Arc<SubscriptionRegistry>,
    supervisor: Supervisor,
    metrics: Arc<McpMetrics>,
    mounts: DashMap<String, Arc<Mount>>,
    name_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    index_lock: Mutex<()>,
    index: ArcSwap<AggregateIndex>,
    index_changed: Arc<Notify>,
    passthrough: Mutex<Passthrough>,
    listeners: Arc<ObserverSet<dyn MountListener>>,
    events: mpsc::UnboundedSender<MountEvent>,
    self_ref: Weak<Compositor>,
}

impl Compositor {
    /// Must be called inside a tokio runtime; background tasks are spawned
    /// on `supervisor`.
    pub fn new(
        namespace: Namespace,
        connector: Arc<dyn Connector>,
        registry: Arc<SubscriptionRegistry>,
        supervisor: Supervisor,
        metrics: Arc<McpMetrics>,
        list_changed_window: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Compositor>| {
            let listeners: Arc<ObserverSet<dyn MountListener>> = Arc::new(ObserverSet::new());
            let (events, rx) = mpsc::unbounded_channel();
            supervisor.spawn(
                "mount-event-dispatcher",
                dispatch_mount_events(rx, Arc::clone(&listeners), supervisor.child_token()),
            );

            let index_changed = Arc::new(Notify::new());
            supervisor.spawn(
                "aggregate-list-changed",
                publish_aggregate_changes(
                    weak.clone(),
                    Arc::clone(&index_changed),
                    list_changed_window,
                    supervisor.child_token(),
                ),
            );

            Self {
                namespace,
                connector,
                registry,
                supervisor,
                metrics,
                mounts: DashMap::new(),
                name_locks: DashMap::new(),
                index_lock: Mutex::new(()),
                index: ArcSwap::from_pointee(AggregateIndex::default()),
                index_changed,
                passthrough: Mutex::new(Passthrough::default()),
                listeners,
                events,
                self_ref: weak.clone(),
            }
        })
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn register_listener(&self, listener: Arc<dyn MountListener>) -> ObserverHandle {
        self.listeners.register(listener)
    }

    pub fn unregister_listener(&self, handle: ObserverHandle) -> bool {
        self.listeners.unregister(handle)
    }

    /// Connect to a downstream server and expose it under `name`.
    pub async fn attach(
        &self,
        name: &str,
        spec: impl Into<TransportSpec>,
        options: MountOptions,
    ) -> McpResult<MountInfo> {
        validate_mount_name(name)?;
        let spec = spec.into();
        self.with_name_lock(name, self.attach_locked(name, spec, options))
            .await
    }

    async fn attach_locked(
        &self,
        name: &str,
        spec: TransportSpec,
        options: MountOptions,
    ) -> McpResult<MountInfo> {
        if self.mounts.contains_key(name) {
            return Err(McpError::DuplicateMount(name.to_string()));
        }
        if self.supervisor.is_shutting_down() {
            return Err(self.attach_failed(name, "gateway is shutting down".to_string()));
        }

        self.emit(name, MountStatus::Attaching, None);
        debug!(server = %name, transport = %spec.describe(), "Attaching mount");

        let (sink, rx) = mpsc::channel(NOTIFICATION_QUEUE_DEPTH);
        let server = match self.connector.connect(name, &spec, sink).await {
            Ok(server) => server,
            Err(e) => return Err(self.attach_failed(name, e.to_string())),
        };
        let listing = match load_listing(server.as_ref()).await {
            Ok(listing) => listing,
            Err(e) => {
                server.close().await;
                return Err(self.attach_failed(name, e.to_string()));
            }
        };

        let mount = Arc::new(Mount {
            name: name.to_string(),
            transport: spec,
            pinned: options.pinned,
            attached_at: Utc::now(),
            status: RwLock::new(MountStatus::Running),
            server,
            listing: RwLock::new(listing),
            forwarder: self.supervisor.child_token(),
            evicting: AtomicBool::new(false),
        });

        {
            let _index = self.index_lock.lock();
            self.mounts.insert(name.to_string(), Arc::clone(&mount));
            self.rebuild_index();
        }
        self.spawn_forwarder(&mount, rx);
        self.index_changed.notify_one();
        self.metrics.record_mount_attached();

        let info = self.mount_info(&mount);
        info!(
            server = %name,
            transport = %info.transport,
            tools = info.tools,
            resources = info.resources,
            pinned = info.pinned,
            "Mount attached"
        );
        self.emit(name, MountStatus::Running, None);
        Ok(info)
    }

    /// Remove a mount.
    ///
    /// Unknown or already-detached names succeed with `Ok(false)`. Pinned
    /// mounts need `force`.
    pub async fn detach(&self, name: &str, force: bool) -> McpResult<bool> {
        if !self.mounts.contains_key(name) && !self.name_locks.contains_key(name) {
            return Ok(false);
        }
        self.with_name_lock(name, self.detach_locked(name, force, None))
            .await
    }

    /// Detach every mount, pinned ones included. Returns how many went away.
    pub async fn detach_all(&self) -> usize {
        let names: Vec<String> = self.mounts.iter().map(|e| e.key().clone()).collect();
        let results = join_all(names.iter().map(|name| self.detach(name, true))).await;
        results
            .into_iter()
            .filter(|r| matches!(r, Ok(true)))
            .count()
    }

    /// Forward a tool call to the mount that owns `routed_name`.
    pub async fn route_tool(&self, routed_name: &str, arguments: Value) -> McpResult<ToolResult> {
        let target = self.namespace.untranslate(routed_name)?;
        let mount = self.running_mount(&target.server)?;
        mount
            .server
            .call_tool(&target.local, arguments)
            .await
            .map_err(|e| self.downstream_failure(&mount, e))
    }

    /// Forward a resource read to the mount that owns `routed_uri`.
    pub async fn route_resource_read(&self, routed_uri: &str) -> McpResult<ReadResourceResult> {
        let target = self.namespace.untranslate(routed_uri)?;
        let mount = self.running_mount(&target.server)?;
        mount
            .server
            .read_resource(&target.local)
            .await
            .map_err(|e| self.downstream_failure(&mount, e))
    }

    /// Watch a routed resource. The owning server is asked to subscribe
    /// when this is the first local subscriber.
    pub async fn subscribe_resource(
        &self,
        scope: &AgentId,
        routed_uri: &str,
        observer: Arc<dyn ResourceObserver>,
    ) -> McpResult<SubscriptionId> {
        let target = self.namespace.untranslate(routed_uri)?;
        let mount = self.running_mount(&target.server)?;

        let id = self.registry.subscribe(scope, routed_uri, observer);
        let first = self.passthrough.lock().add(id, target.clone());
        if first {
            if let Err(e) = mount.server.subscribe(&target.local).await {
                self.passthrough.lock().remove(id);
                self.registry.unsubscribe(id);
                return Err(self.downstream_failure(&mount, e));
            }
            debug!(server = %target.server, uri = %target.local, "Downstream subscription opened");
        }
        Ok(id)
    }

    /// Drop a subscription made through this compositor. Returns false for
    /// unknown ids.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let existed = self.registry.unsubscribe(id).is_some();
        let last = self.passthrough.lock().remove(id);
        if let Some(target) = last {
            let mount = self.mounts.get(&target.server).map(|m| Arc::clone(m.value()));
            if let Some(mount) = mount {
                if let Err(e) = mount.server.unsubscribe(&target.local).await {
                    warn!(server = %target.server, uri = %target.local, error = %e, "Downstream unsubscribe failed");
                }
            }
        }
        existed
    }

    /// Watch list changes of one mount, or of the aggregate index when
    /// `origin` is [`AGGREGATE_ORIGIN`].
    pub fn subscribe_list_changed(
        &self,
        scope: &AgentId,
        origin: &str,
        observer: Arc<dyn ResourceObserver>,
    ) -> SubscriptionId {
        self.registry.subscribe_list_changed(scope, origin, observer)
    }

    pub fn index(&self) -> Arc<AggregateIndex> {
        self.index.load_full()
    }

    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.index.load().tools.values().cloned().collect()
    }

    pub fn list_resources(&self) -> Vec<ResourceDescriptor> {
        self.index.load().resources.values().cloned().collect()
    }

    /// Sorted by name.
    pub fn mounts(&self) -> Vec<MountInfo> {
        let mut mounts: Vec<MountInfo> = self
            .mounts
            .iter()
            .map(|entry| self.mount_info(entry.value()))
            .collect();
        mounts.sort_by(|a, b| a.name.cmp(&b.name));
        mounts
    }

    pub fn mount(&self, name: &str) -> Option<MountInfo> {
        self.mounts.get(name).map(|m| self.mount_info(m.value()))
    }

    pub fn is_mounted(&self, name: &str) -> bool {
        self.mounts.contains_key(name)
    }

    /// Run `op` under the per-name lock. The lock entry is dropped again
    /// once no other task holds or waits on it.
    async fn with_name_lock<F: Future>(&self, name: &str, op: F) -> F::Output {
        let lock = Arc::clone(
            self.name_locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .value(),
        );
        let output = {
            let _guard = lock.lock().await;
            op.await
        };
        drop(lock);
        self.name_locks
            .remove_if(name, |_, lock| Arc::strong_count(lock) == 1);
        output
    }

    /// Caller holds the name lock. With `expected`, only that exact mount
    /// instance is removed.
    async fn detach_locked(
        &self,
        name: &str,
        force: bool,
        expected: Option<&Arc<Mount>>,
    ) -> McpResult<bool> {
        let Some(mount) = self.mounts.get(name).map(|m| Arc::clone(m.value())) else {
            debug!(server = %name, "Detach of unknown mount ignored");
            return Ok(false);
        };
        if expected.is_some_and(|expected| !Arc::ptr_eq(expected, &mount)) {
            return Ok(false);
        }
        if mount.pinned && !force {
            return Err(McpError::PinnedMount(name.to_string()));
        }

        mount.set_status(MountStatus::Detaching);
        self.emit(name, MountStatus::Detaching, None);

        {
            let _index = self.index_lock.lock();
            self.mounts.remove(name);
            self.rebuild_index();
        }
        mount.forwarder.cancel();
        self.passthrough.lock().drop_server(name);
        let dropped = self
            .registry
            .unsubscribe_prefix(None, &self.namespace.mount_prefix(name));
        mount.server.close().await;
        mount.set_status(MountStatus::Detached);

        self.index_changed.notify_one();
        self.metrics.record_mount_detached();
        info!(server = %name, subscriptions_dropped = dropped, "Mount detached");
        self.emit(name, MountStatus::Detached, None);
        Ok(true)
    }

    fn running_mount(&self, server: &str) -> McpResult<Arc<Mount>> {
        let mount = self
            .mounts
            .get(server)
            .map(|m| Arc::clone(m.value()))
            .ok_or_else(|| McpError::ServerUnavailable {
                server: server.to_string(),
                detail: "not mounted".to_string(),
            })?;
        match mount.status() {
            MountStatus::Running => Ok(mount),
            status => Err(McpError::ServerUnavailable {
                server: server.to_string(),
                detail: format!("mount is {:?}", status).to_lowercase(),
            }),
        }
    }

    /// Transport trouble stays with the mount; anything the server itself
    /// said goes back to the caller untouched.
    fn downstream_failure(&self, mount: &Arc<Mount>, err: DownstreamError) -> McpError {
        match err {
            DownstreamError::Disconnected(detail) => {
                warn!(server = %mount.name, detail = %detail, "Downstream disconnected");
                self.evict(mount);
                McpError::ServerUnavailable {
                    server: mount.name.clone(),
                    detail,
                }
            }
            DownstreamError::Transport(detail) => McpError::ServerUnavailable {
                server: mount.name.clone(),
                detail,
            },
            other => McpError::Downstream {
                server: mount.name.clone(),
                source: other,
            },
        }
    }

    /// Detach a mount whose connection is gone, once.
    fn evict(&self, mount: &Arc<Mount>) {
        if mount.evicting.swap(true, Ordering::AcqRel) {
            return;
        }
        mount.set_status(MountStatus::Failed);
        self.emit(&mount.name, MountStatus::Failed, Some("disconnected".to_string()));

        let weak = self.self_ref.clone();
        let mount = Arc::clone(mount);
        self.supervisor
            .spawn(format!("evict-{}", mount.name), async move {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                let removed = this
                    .with_name_lock(&mount.name, this.detach_locked(&mount.name, true, Some(&mount)))
                    .await;
                match removed {
                    Ok(true) => warn!(server = %mount.name, "Mount removed after terminal transport failure"),
                    Ok(false) => {}
                    Err(e) => warn!(server = %mount.name, error = %e, "Failed to remove disconnected mount"),
                }
            });
    }

    fn attach_failed(&self, name: &str, detail: String) -> McpError {
        warn!(server = %name, error = %detail, "Attach failed");
        self.metrics.record_attach_failure();
        self.emit(name, MountStatus::Failed, Some(detail.clone()));
        McpError::AttachFailed {
            name: name.to_string(),
            detail,
        }
    }

    /// Caller holds `index_lock`.
    fn rebuild_index(&self) {
        let mut tools = BTreeMap::new();
        let mut resources = BTreeMap::new();
        for entry in self.mounts.iter() {
            let mount = entry.value();
            let listing = mount.listing.read();
            for tool in &listing.tools {
                let routed = self.namespace.translate(&mount.name, &tool.name);
                let mut descriptor = tool.clone();
                descriptor.name = routed.clone();
                tools.insert(routed, descriptor);
            }
            for resource in &listing.resources {
                let routed = self.namespace.translate(&mount.name, &resource.uri);
                let mut descriptor = resource.clone();
                descriptor.uri = routed.clone();
                resources.insert(routed, descriptor);
            }
        }
        let generation = self.index.load().generation + 1;
        self.index.store(Arc::new(AggregateIndex {
            generation,
            tools,
            resources,
        }));
    }

    fn mount_info(&self, mount: &Mount) -> MountInfo {
        let listing = mount.listing.read();
        MountInfo {
            name: mount.name.clone(),
            prefix: self.namespace.mount_prefix(&mount.name),
            transport: mount.transport.describe(),
            pinned: mount.pinned,
            status: mount.status(),
            attached_at: mount.attached_at,
            tools: listing.tools.len(),
            resources: listing.resources.len(),
            capabilities: mount.server.capabilities(),
        }
    }

    fn spawn_forwarder(&self, mount: &Arc<Mount>, rx: mpsc::Receiver<DownstreamNotification>) {
        self.supervisor.spawn(
            format!("forwarder-{}", mount.name),
            forward_notifications(self.self_ref.clone(), Arc::clone(mount), rx),
        );
    }

    async fn handle_notification(&self, mount: &Arc<Mount>, notification: DownstreamNotification) {
        self.metrics.record_notification_forwarded();
        match notification {
            DownstreamNotification::ResourceUpdated { uri } => {
                let routed = self.namespace.translate(&mount.name, &uri);
                let reached = self.registry.publish_to_all(
                    &SubscriptionTarget::Resource {
                        uri: routed.clone(),
                    },
                    Some(json!({ "uri": routed })),
                );
                debug!(server = %mount.name, uri = %routed, scopes = reached, "Forwarded resource update");
            }
            change => {
                let kind = match change {
                    DownstreamNotification::ToolListChanged => "tools",
                    _ => "resources",
                };
                self.refresh_listing(mount).await;
                self.registry.publish_to_all(
                    &SubscriptionTarget::ListChanged {
                        origin: mount.name.clone(),
                    },
                    Some(json!({ "origin": mount.name, "kind": kind })),
                );
                self.index_changed.notify_one();
                debug!(server = %mount.name, kind, "Forwarded list change");
            }
        }
    }

    async fn refresh_listing(&self, mount: &Arc<Mount>) {
        let listing = match load_listing(mount.server.as_ref()).await {
            Ok(listing) => listing,
            Err(e) => {
                warn!(server = %mount.name, error = %e, "Failed to refresh listing");
                return;
            }
        };
        let _index = self.index_lock.lock();
        let current = self
            .mounts
            .get(&mount.name)
            .is_some_and(|m| Arc::ptr_eq(m.value(), mount));
        if current {
            *mount.listing.write() = listing;
            self.rebuild_index();
        }
    }

    fn emit(&self, name: &str, status: MountStatus, detail: Option<String>) {
        let event = MountEvent {
            name: name.to_string(),
            status,
            detail,
            at: Utc::now(),
        };
        if self.events.send(event).is_err() {
            debug!("Mount event dispatcher stopped; event dropped");
        }
    }
}

async fn load_listing(server: &dyn DownstreamServer) -> Result<Listing, DownstreamError> {
    let tools = server.list_tools().await?;
    let resources = server.list_resources().await?;
    Ok(Listing { tools, resources })
}

async fn forward_notifications(
    compositor: Weak<Compositor>,
    mount: Arc<Mount>,
    mut rx: mpsc::Receiver<DownstreamNotification>,
) {
    let token = mount.forwarder.clone();
    loop {
        let notification = tokio::select! {
            _ = token.cancelled() => break,
            n = rx.recv() => match n {
                Some(n) => n,
                None => break,
            },
        };
        let Some(compositor) = compositor.upgrade() else {
            break;
        };
        compositor.handle_notification(&mount, notification).await;
    }
    debug!(server = %mount.name, "Notification forwarder stopped");
}

async fn publish_aggregate_changes(
    compositor: Weak<Compositor>,
    changed: Arc<Notify>,
    window: Duration,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = changed.notified() => {}
        }
        // Anything that lands inside the window rides along with this one.
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(window) => {}
        }
        let Some(compositor) = compositor.upgrade() else {
            break;
        };
        let generation = compositor.index.load().generation;
        let reached = compositor.registry.publish_to_all(
            &SubscriptionTarget::ListChanged {
                origin: AGGREGATE_ORIGIN.to_string(),
            },
            Some(json!({ "origin": AGGREGATE_ORIGIN, "generation": generation })),
        );
        debug!(generation, scopes = reached, "Published aggregate list change");
    }
}

async fn dispatch_mount_events(
    mut rx: mpsc::UnboundedReceiver<MountEvent>,
    listeners: Arc<ObserverSet<dyn MountListener>>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };
        deliver_mount_event(&listeners, &event).await;
    }
    while let Ok(event) = rx.try_recv() {
        deliver_mount_event(&listeners, &event).await;
    }
}

async fn deliver_mount_event(listeners: &ObserverSet<dyn MountListener>, event: &MountEvent) {
    let snapshot = listeners.snapshot();
    join_all(snapshot.iter().map(|(handle, listener)| {
        let label = handle.to_string();
        async move { deliver_isolated(&label, &event.name, listener.on_mount_event(event)).await }
    }))
    .await;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::notify::Notification;

    fn compositor() -> Arc<Compositor> {
        let supervisor = Supervisor::new("test");
        let registry = Arc::new(SubscriptionRegistry::new(
            supervisor.clone(),
            Duration::from_millis(5),
        ));
        Compositor::new(
            Namespace::default(),
            Arc::new(DefaultConnector),
            registry,
            supervisor,
            Arc::new(McpMetrics::new()),
            Duration::from_millis(5),
        )
    }

    fn fs_server() -> Arc<InProcessServer> {
        Arc::new(
            InProcessServer::new("fs")
                .with_tool(ToolDescriptor::new("read"), |args| async move {
                    Ok(ToolResult::structured(args))
                })
                .with_resource("file:///a.txt", "a", "alpha"),
        )
    }

    struct Capture(mpsc::UnboundedSender<Notification>);

    #[async_trait]
    impl ResourceObserver for Capture {
        async fn on_notification(&self, n: &Notification) -> Result<(), ObserverError> {
            let _ = self.0.send(n.clone());
            Ok(())
        }
    }

    struct EventLog(Mutex<Vec<(String, MountStatus)>>);

    #[async_trait]
    impl MountListener for EventLog {
        async fn on_mount_event(&self, event: &MountEvent) -> Result<(), ObserverError> {
            self.0.lock().push((event.name.clone(), event.status));
            Ok(())
        }
    }

    struct Failing(AtomicUsize);

    #[async_trait]
    impl MountListener for Failing {
        async fn on_mount_event(&self, _event: &MountEvent) -> Result<(), ObserverError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(ObserverError::new("listener down"))
        }
    }

    #[tokio::test]
    async fn test_attach_routes_namespaced() {
        let compositor = compositor();
        let info = compositor
            .attach("fs", fs_server(), MountOptions::default())
            .await
            .unwrap();
        assert_eq!(info.status, MountStatus::Running);
        assert_eq!(info.prefix, "mcp/fs/");

        let tools: Vec<String> = compositor.list_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(tools, vec!["mcp/fs/read"]);
        let resources = compositor.list_resources();
        assert_eq!(resources[0].uri, "mcp/fs/file:///a.txt");

        let result = compositor
            .route_tool("mcp/fs/read", json!({"path": "a"}))
            .await
            .unwrap();
        assert_eq!(result.structured_content, Some(json!({"path": "a"})));

        let read = compositor
            .route_resource_read("mcp/fs/file:///a.txt")
            .await
            .unwrap();
        assert_eq!(read.contents[0]["text"], "alpha");
    }

    #[tokio::test]
    async fn test_second_attach_same_name_fails() {
        let compositor = compositor();
        compositor
            .attach("fs", fs_server(), MountOptions::default())
            .await
            .unwrap();
        let err = compositor
            .attach("fs", fs_server(), MountOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::DuplicateMount(_)));

        assert!(compositor.detach("fs", false).await.unwrap());
        compositor
            .attach("fs", fs_server(), MountOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_attach_same_name_single_winner() {
        let compositor = compositor();
        let attempts = (0..5).map(|_| compositor.attach("fs", fs_server(), MountOptions::default()));
        let results = join_all(attempts).await;
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(compositor.mounts().len(), 1);
    }

    #[tokio::test]
    async fn test_detach_is_idempotent() {
        let compositor = compositor();
        assert!(!compositor.detach("ghost", false).await.unwrap());
        compositor
            .attach("fs", fs_server(), MountOptions::default())
            .await
            .unwrap();
        assert!(compositor.detach("fs", false).await.unwrap());
        assert!(!compositor.detach("fs", false).await.unwrap());
        assert!(compositor.list_tools().is_empty());
    }

    #[tokio::test]
    async fn test_name_locks_do_not_accumulate() {
        let compositor = compositor();
        for i in 0..10 {
            let name = format!("ghost_{}", i);
            assert!(!compositor.detach(&name, false).await.unwrap());
        }
        assert!(!compositor.detach("Not A Name", false).await.unwrap());

        let refusing = Arc::new(InProcessServer::new("fs").refusing_connections());
        assert!(compositor
            .attach("flaky", refusing, MountOptions::default())
            .await
            .is_err());

        compositor
            .attach("fs", fs_server(), MountOptions::default())
            .await
            .unwrap();
        assert!(compositor.detach("fs", false).await.unwrap());
        assert!(compositor.name_locks.is_empty());
    }

    #[tokio::test]
    async fn test_pinned_requires_force() {
        let compositor = compositor();
        compositor
            .attach("fs", fs_server(), MountOptions::pinned())
            .await
            .unwrap();
        assert!(matches!(
            compositor.detach("fs", false).await,
            Err(McpError::PinnedMount(_))
        ));
        assert!(compositor.detach("fs", true).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_name_rejected_before_connect() {
        let compositor = compositor();
        let server = fs_server();
        let err = compositor
            .attach("Bad-Name", Arc::clone(&server), MountOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::InvalidMountName(_)));
        assert!(!server.emit(DownstreamNotification::ToolListChanged).await);
    }

    #[tokio::test]
    async fn test_attach_failure_leaves_no_mount() {
        let compositor = compositor();
        let server = Arc::new(InProcessServer::new("fs").refusing_connections());
        let err = compositor
            .attach("fs", server, MountOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::AttachFailed { .. }));
        assert!(!compositor.is_mounted("fs"));
    }

    #[tokio::test]
    async fn test_unmounted_server_unavailable() {
        let compositor = compositor();
        let err = compositor
            .route_tool("mcp/nope/read", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ServerUnavailable { .. }));

        let err = compositor.route_tool("other/x/y", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::UnknownRoute(_)));
    }

    #[tokio::test]
    async fn test_downstream_errors_pass_through() {
        let compositor = compositor();
        let server = Arc::new(InProcessServer::new("fs").with_tool(
            ToolDescriptor::new("quota"),
            |_| async { Err(DownstreamError::from_remote(-32001, "quota exceeded", None)) },
        ));
        compositor
            .attach("fs", server, MountOptions::default())
            .await
            .unwrap();
        match compositor.route_tool("mcp/fs/quota", json!({})).await {
            Err(McpError::Downstream { server, source }) => {
                assert_eq!(server, "fs");
                assert_eq!(
                    source,
                    DownstreamError::Remote {
                        code: -32001,
                        message: "quota exceeded".to_string(),
                        data: None
                    }
                );
            }
            other => panic!("expected downstream error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_evicts_mount() {
        let compositor = compositor();
        let server = fs_server();
        compositor
            .attach("fs", Arc::clone(&server), MountOptions::pinned())
            .await
            .unwrap();
        server.set_link(LinkState::Down);

        let err = compositor
            .route_tool("mcp/fs/read", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ServerUnavailable { .. }));

        for _ in 0..100 {
            if !compositor.is_mounted("fs") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!compositor.is_mounted("fs"));
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn test_transport_error_keeps_mount() {
        let compositor = compositor();
        let server = fs_server();
        compositor
            .attach("fs", Arc::clone(&server), MountOptions::default())
            .await
            .unwrap();
        server.set_link(LinkState::Flaky);
        let err = compositor
            .route_tool("mcp/fs/read", json!({}))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(compositor.is_mounted("fs"));
    }

    #[tokio::test]
    async fn test_resource_update_forwarded_with_routed_uri() {
        let compositor = compositor();
        let server = fs_server();
        compositor
            .attach("fs", Arc::clone(&server), MountOptions::default())
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let agent = AgentId::new("a1");
        compositor
            .subscribe_resource(&agent, "mcp/fs/file:///a.txt", Arc::new(Capture(tx)))
            .await
            .unwrap();
        assert_eq!(server.downstream_subscriptions(), vec!["file:///a.txt"]);

        server.set_resource("file:///a.txt", "beta").await;
        let n = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n.payload, Some(json!({"uri": "mcp/fs/file:///a.txt"})));
    }

    #[tokio::test]
    async fn test_downstream_subscription_refcounted() {
        let compositor = compositor();
        let server = fs_server();
        compositor
            .attach("fs", Arc::clone(&server), MountOptions::default())
            .await
            .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let uri = "mcp/fs/file:///a.txt";
        let first = compositor
            .subscribe_resource(&AgentId::new("a1"), uri, Arc::new(Capture(tx.clone())))
            .await
            .unwrap();
        let second = compositor
            .subscribe_resource(&AgentId::new("a2"), uri, Arc::new(Capture(tx)))
            .await
            .unwrap();

        assert!(compositor.unsubscribe(first).await);
        assert_eq!(server.downstream_subscriptions().len(), 1);
        assert!(compositor.unsubscribe(second).await);
        assert!(server.downstream_subscriptions().is_empty());
        assert!(!compositor.unsubscribe(second).await);
    }

    #[tokio::test]
    async fn test_detach_drops_local_subscriptions() {
        let compositor = compositor();
        compositor
            .attach("fs", fs_server(), MountOptions::default())
            .await
            .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        compositor
            .subscribe_resource(&AgentId::default(), "mcp/fs/file:///a.txt", Arc::new(Capture(tx)))
            .await
            .unwrap();
        assert_eq!(compositor.registry.subscription_count(), 1);
        compositor.detach("fs", false).await.unwrap();
        assert_eq!(compositor.registry.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_list_change_refreshes_index() {
        let compositor = compositor();
        let server = fs_server();
        compositor
            .attach("fs", Arc::clone(&server), MountOptions::default())
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        compositor.subscribe_list_changed(&AgentId::default(), "fs", Arc::new(Capture(tx)));

        server
            .add_tool(ToolDescriptor::new("write"), |_| async { Ok(ToolResult::text("ok")) })
            .await;
        let n = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n.payload, Some(json!({"origin": "fs", "kind": "tools"})));
        assert!(compositor.index().tools.contains_key("mcp/fs/write"));
    }

    #[tokio::test]
    async fn test_aggregate_list_changed_coalesced() {
        let compositor = compositor();
        let (tx, mut rx) = mpsc::unbounded_channel();
        compositor.subscribe_list_changed(&AgentId::default(), AGGREGATE_ORIGIN, Arc::new(Capture(tx)));

        let names = ["a", "b", "c", "d"];
        join_all(
            names
                .iter()
                .map(|name| compositor.attach(name, fs_server(), MountOptions::default())),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut received = Vec::new();
        while let Ok(n) = rx.try_recv() {
            received.push(n);
        }
        assert!(!received.is_empty());
        assert!(received.len() < names.len());
        let last = received.last().unwrap();
        assert_eq!(
            last.payload.as_ref().unwrap()["generation"],
            json!(compositor.index().generation)
        );
        assert_eq!(compositor.index().tools.len(), names.len());
    }

    #[tokio::test]
    async fn test_listeners_see_lifecycle_despite_failures() {
        let compositor = compositor();
        let failing = Arc::new(Failing(AtomicUsize::new(0)));
        let log = Arc::new(EventLog(Mutex::new(Vec::new())));
        compositor.register_listener(failing.clone());
        compositor.register_listener(log.clone());

        compositor
            .attach("fs", fs_server(), MountOptions::default())
            .await
            .unwrap();
        compositor.detach("fs", false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let statuses: Vec<MountStatus> = log.0.lock().iter().map(|(_, s)| *s).collect();
        assert_eq!(
            statuses,
            vec![
                MountStatus::Attaching,
                MountStatus::Running,
                MountStatus::Detaching,
                MountStatus::Detached
            ]
        );
        assert_eq!(failing.0.load(Ordering::SeqCst), 4);
    }
}
