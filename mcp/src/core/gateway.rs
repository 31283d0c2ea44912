//! The assembled gateway: compositor, policy middleware, approval hub and
//! subscription registry wired from one [`GatewayConfig`].
//!
//! ## Usage
//!
//! ```ignore
//! let gateway = Gateway::builder().build(config).await?;
//! let turn = gateway.begin_turn(RunId::default());
//! let outcome = gateway
//!     .call_tool(&turn, ToolCallRequest::new("mcp/fs/read_file", json!({"path": "a.txt"})))
//!     .await?;
//! gateway.shutdown().await;
//! ```

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Value};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    config::GatewayConfig,
    metrics::{McpMetrics, MetricsSnapshot},
    middleware::{CallOutcome, PolicyMiddleware, ToolCallRequest, Turn},
};
use crate::{
    approval::{
        hub::PENDING_URI,
        ApprovalEvent, ApprovalHub, ApprovalItem, ApprovalObserver, ApprovalResolution, AuditLog, PolicyEngine,
        PolicyEvaluator,
    },
    compositor::{
        Compositor, Connector, DefaultConnector, MountEvent, MountInfo, MountListener,
        MountOptions, Namespace, ReadResourceResult, ResourceDescriptor, ToolDescriptor,
        TransportSpec,
    },
    error::{McpError, McpResult},
    notify::{
        ObserverError, ObserverHandle, ResourceObserver, SubscriptionId, SubscriptionIndexEntry,
        SubscriptionRegistry, SubscriptionTarget, Supervisor,
    },
    record::{InMemoryRecordStore, RecordStore, ToolCallRecord},
    scope::{AgentId, CallerContext, RunId},
};

/// Scheme of the gateway's own read-only resources.
pub const ADMIN_SCHEME: &str = "mediator://";

/// Path, description, and whether changes are published to subscribers.
const ADMIN_PATHS: &[(&str, &str, bool)] = &[
    ("mounts", "Mounted downstream servers", true),
    ("approvals/pending", "Approvals waiting on a decision", true),
    ("subscriptions", "Active subscriptions", false),
    ("audit", "Recent policy decisions", false),
    ("metrics", "Gateway counters", false),
];

const AUDIT_PAGE: usize = 100;

pub fn admin_uri(agent: &AgentId, path: &str) -> String {
    format!("{}{}/{}", ADMIN_SCHEME, agent, path)
}

/// `None` for an unknown admin path, otherwise whether it is published.
fn admin_path_published(path: &str) -> Option<bool> {
    ADMIN_PATHS
        .iter()
        .find(|(known, ..)| *known == path)
        .map(|(.., published)| *published)
        .or_else(|| {
            path.strip_prefix("approvals/")
                .filter(|call_id| !call_id.is_empty() && !call_id.contains('/'))
                .map(|_| true)
        })
}

#[derive(Default)]
pub struct GatewayBuilder {
    evaluator: Option<Arc<dyn PolicyEvaluator>>,
    store: Option<Arc<dyn RecordStore>>,
    connector: Option<Arc<dyn Connector>>,
}

impl GatewayBuilder {
    /// Replace the rule table built from `policy` config.
    #[must_use]
    pub fn with_evaluator(mut self, evaluator: Arc<dyn PolicyEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Validate `config`, start background tasks and attach the configured
    /// servers. A `required` server that fails to attach fails the build.
    pub async fn build(self, config: GatewayConfig) -> McpResult<Gateway> {
        config.validate()?;

        let supervisor = Supervisor::new("gateway");
        let namespace = Namespace::new(config.namespace.prefix.clone());
        let metrics = Arc::new(McpMetrics::new());
        let registry = Arc::new(SubscriptionRegistry::new(
            supervisor.clone(),
            config.notifications.coalesce_window(),
        ));
        let compositor = Compositor::new(
            namespace.clone(),
            self.connector
                .unwrap_or_else(|| Arc::new(DefaultConnector)),
            Arc::clone(&registry),
            supervisor.clone(),
            Arc::clone(&metrics),
            config.notifications.list_changed_window(),
        );
        compositor.register_listener(Arc::new(MountsPublisher {
            registry: Arc::clone(&registry),
        }));

        let hub = Arc::new(
            ApprovalHub::new(&supervisor)
                .with_registry(Arc::clone(&registry))
                .with_timeout_resolution(config.approval.timeout_resolution)
                .with_item_ttl(config.approval.item_ttl())
                .with_archive_capacity(config.approval.archive_capacity),
        );
        hub.register_observer(Arc::new(ApprovalsPublisher {
            registry: Arc::clone(&registry),
            hub: Arc::downgrade(&hub),
        }));
        let evaluator = self
            .evaluator
            .unwrap_or_else(|| Arc::new(PolicyEngine::from_config(&config.policy, namespace)));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryRecordStore::new()));
        let audit = Arc::new(AuditLog::with_capacity(config.audit.max_entries));

        let middleware = PolicyMiddleware::new(
            evaluator,
            Arc::clone(&compositor),
            Arc::clone(&hub),
            store,
            Arc::clone(&audit),
            Arc::clone(&metrics),
            config.approval.timeout(),
        );

        let gateway = Gateway {
            maintenance: supervisor.child_token(),
            config,
            supervisor,
            registry,
            compositor,
            hub,
            middleware,
            audit,
            metrics,
            shut_down: AtomicBool::new(false),
        };
        gateway.spawn_sweeper();

        if let Err(e) = gateway.attach_configured().await {
            gateway.shutdown().await;
            return Err(e);
        }
        info!(
            agent_id = %gateway.config.agent_id,
            prefix = %gateway.compositor.namespace().prefix(),
            mounts = gateway.compositor.mounts().len(),
            "Gateway ready"
        );
        Ok(gateway)
    }
}

pub struct Gateway {
    config: GatewayConfig,
    supervisor: Supervisor,
    registry: Arc<SubscriptionRegistry>,
    compositor: Arc<Compositor>,
    hub: Arc<ApprovalHub>,
    middleware: PolicyMiddleware,
    audit: Arc<AuditLog>,
    metrics: Arc<McpMetrics>,
    maintenance: CancellationToken,
    shut_down: AtomicBool,
}

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::default()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.config.agent_id
    }

    pub fn compositor(&self) -> &Arc<Compositor> {
        &self.compositor
    }

    pub fn approvals(&self) -> &Arc<ApprovalHub> {
        &self.hub
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Start a turn for the configured agent.
    pub fn begin_turn(&self, run_id: RunId) -> Turn {
        Turn::new(CallerContext::new(self.config.agent_id.clone(), run_id))
    }

    /// Start a turn on behalf of another agent sharing this gateway.
    pub fn begin_turn_for(&self, agent_id: AgentId, run_id: RunId) -> Turn {
        Turn::new(CallerContext::new(agent_id, run_id))
    }

    pub async fn call_tool(&self, turn: &Turn, request: ToolCallRequest) -> McpResult<CallOutcome> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(McpError::TurnAborted {
                reason: "gateway is shutting down".to_string(),
            });
        }
        self.middleware.call_tool(turn, request).await
    }

    pub async fn record(&self, call_id: &str) -> McpResult<Option<ToolCallRecord>> {
        self.middleware.store().get(call_id).await
    }

    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.compositor.list_tools()
    }

    /// Downstream resources plus the gateway's own resources for `agent`.
    pub fn list_resources(&self, agent: &AgentId) -> Vec<ResourceDescriptor> {
        let mut resources = self.admin_resources(agent);
        resources.extend(self.compositor.list_resources());
        resources
    }

    /// Read a routed downstream resource, an approval resource or one of
    /// the gateway's own resources.
    pub async fn read_resource(&self, agent: &AgentId, uri: &str) -> McpResult<ReadResourceResult> {
        if uri.starts_with(ADMIN_SCHEME) {
            let value = self.read_admin_resource(uri)?;
            return Ok(json_resource(uri, &value));
        }
        if uri == PENDING_URI {
            let value = serde_json::to_value(self.hub.pending_items(Some(agent)))?;
            return Ok(json_resource(uri, &value));
        }
        if let Some(call_id) = uri.strip_prefix("approvals://") {
            let item = self
                .hub
                .get(call_id)
                .filter(|item| &item.agent_id == agent)
                .ok_or_else(|| McpError::ResourceNotFound(uri.to_string()))?;
            return Ok(json_resource(uri, &serde_json::to_value(item)?));
        }
        self.compositor.route_resource_read(uri).await
    }

    /// Serve `mediator://<agent>/<path>`.
    pub fn read_admin_resource(&self, uri: &str) -> McpResult<Value> {
        let not_found = || McpError::ResourceNotFound(uri.to_string());
        let (agent, path) = uri
            .strip_prefix(ADMIN_SCHEME)
            .and_then(|rest| rest.split_once('/'))
            .ok_or_else(not_found)?;
        let agent = AgentId::new(agent);

        let value = match path {
            "mounts" => serde_json::to_value(self.compositor.mounts())?,
            "approvals/pending" => serde_json::to_value(self.hub.pending_items(Some(&agent)))?,
            "subscriptions" => serde_json::to_value(self.registry.index(Some(&agent)))?,
            "audit" => serde_json::to_value(self.audit.for_agent(&agent, AUDIT_PAGE))?,
            "metrics" => json!({
                "counters": self.metrics(),
                "tool_latencies": self.metrics.all_tool_latencies(),
            }),
            other => match other.strip_prefix("approvals/") {
                Some(call_id) => {
                    let item = self
                        .hub
                        .get(call_id)
                        .filter(|item| item.agent_id == agent)
                        .ok_or_else(not_found)?;
                    serde_json::to_value(item)?
                }
                None => return Err(not_found()),
            },
        };
        Ok(value)
    }

    pub fn admin_resources(&self, agent: &AgentId) -> Vec<ResourceDescriptor> {
        ADMIN_PATHS
            .iter()
            .map(|(path, description, _)| {
                let mut resource = ResourceDescriptor::new(admin_uri(agent, path), *path);
                resource.description = Some((*description).to_string());
                resource.mime_type = Some("application/json".to_string());
                resource
            })
            .collect()
    }

    pub async fn attach(
        &self,
        name: &str,
        spec: impl Into<TransportSpec>,
        options: MountOptions,
    ) -> McpResult<MountInfo> {
        self.compositor.attach(name, spec, options).await
    }

    pub async fn detach(&self, name: &str, force: bool) -> McpResult<bool> {
        self.compositor.detach(name, force).await
    }

    pub fn mounts(&self) -> Vec<MountInfo> {
        self.compositor.mounts()
    }

    pub fn resolve_approval(
        &self,
        call_id: &str,
        resolution: ApprovalResolution,
        reason: Option<String>,
    ) -> McpResult<ApprovalItem> {
        self.hub.resolve(call_id, resolution, reason)
    }

    pub fn pending_approvals(&self, agent: Option<&AgentId>) -> Vec<ApprovalItem> {
        self.hub.pending_items(agent)
    }

    pub fn register_approval_observer(&self, observer: Arc<dyn ApprovalObserver>) -> ObserverHandle {
        self.hub.register_observer(observer)
    }

    pub fn unregister_approval_observer(&self, handle: ObserverHandle) -> bool {
        self.hub.unregister_observer(handle)
    }

    pub fn register_mount_listener(&self, listener: Arc<dyn MountListener>) -> ObserverHandle {
        self.compositor.register_listener(listener)
    }

    /// Watch a resource. Routed downstream URIs go through the compositor so
    /// the owning server is subscribed too; gateway-local URIs only need the
    /// registry.
    pub async fn subscribe_resource(
        &self,
        agent: &AgentId,
        uri: &str,
        observer: Arc<dyn ResourceObserver>,
    ) -> McpResult<SubscriptionId> {
        if let Some(rest) = uri.strip_prefix(ADMIN_SCHEME) {
            let (owner, path) = rest
                .split_once('/')
                .ok_or_else(|| McpError::ResourceNotFound(uri.to_string()))?;
            let published = admin_path_published(path)
                .ok_or_else(|| McpError::ResourceNotFound(uri.to_string()))?;
            // Updates are only published into the scope of the agent the URI names.
            if !published || owner != agent.as_str() {
                return Err(McpError::NotSubscribable(uri.to_string()));
            }
            return Ok(self.registry.subscribe(agent, uri, observer));
        }
        if uri.starts_with("approvals://") {
            return Ok(self.registry.subscribe(agent, uri, observer));
        }
        self.compositor
            .subscribe_resource(agent, uri, observer)
            .await
    }

    pub fn subscribe_list_changed(
        &self,
        agent: &AgentId,
        origin: &str,
        observer: Arc<dyn ResourceObserver>,
    ) -> SubscriptionId {
        self.compositor.subscribe_list_changed(agent, origin, observer)
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.compositor.unsubscribe(id).await
    }

    pub fn subscriptions(&self, agent: Option<&AgentId>) -> Vec<SubscriptionIndexEntry> {
        self.registry.index(agent)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        let delivery = self.registry.delivery_stats();
        snapshot.notifications_delivered = delivery.delivered;
        snapshot.notifications_failed = delivery.failed;
        snapshot
    }

    pub fn in_flight(&self) -> usize {
        self.middleware.in_flight()
    }

    /// Stop accepting work and tear everything down. Safe to call twice.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Gateway shutting down");
        self.maintenance.cancel();

        let drain = self.config.shutdown.drain_timeout();
        let deadline = Instant::now() + drain;
        while self.middleware.in_flight() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let abandoned = self.middleware.in_flight();
        if abandoned > 0 {
            warn!(in_flight = abandoned, "Drain timeout reached with calls still running");
        }

        let denied = self.hub.close("gateway shutting down");
        let detached = self.compositor.detach_all().await;
        self.registry.close();
        self.supervisor.shutdown(drain).await;
        info!(denied, detached, "Gateway stopped");
    }

    async fn attach_configured(&self) -> McpResult<()> {
        let attempts = self.config.servers.iter().map(|server| {
            self.compositor.attach(
                &server.name,
                server.transport.clone(),
                MountOptions {
                    pinned: server.pinned,
                },
            )
        });
        let results = join_all(attempts).await;

        for (server, result) in self.config.servers.iter().zip(results) {
            match result {
                Ok(_) => {}
                Err(e) if server.required => {
                    error!(server = %server.name, error = %e, "Required server failed to attach");
                    return Err(e);
                }
                Err(e) => {
                    warn!(server = %server.name, error = %e, "Optional server failed to attach; continuing without it");
                }
            }
        }
        Ok(())
    }

    fn spawn_sweeper(&self) {
        let hub = Arc::clone(&self.hub);
        let token = self.maintenance.clone();
        let period = self.config.approval.sweep_interval();
        self.supervisor.spawn("approval-sweeper", async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let expired = hub.evict_expired();
                        if expired > 0 {
                            debug!(expired, "Swept expired approvals");
                        }
                    }
                }
            }
        });
    }
}

/// Tells subscribers of `mediator://<agent>/mounts` that the mount table moved.
struct MountsPublisher {
    registry: Arc<SubscriptionRegistry>,
}

#[async_trait]
impl MountListener for MountsPublisher {
    async fn on_mount_event(&self, event: &MountEvent) -> Result<(), ObserverError> {
        let scopes: Vec<AgentId> = self
            .registry
            .index(None)
            .into_iter()
            .filter(|entry| {
                matches!(
                    &entry.key.target,
                    SubscriptionTarget::Resource { uri } if *uri == admin_uri(&entry.key.scope, "mounts")
                )
            })
            .map(|entry| entry.key.scope)
            .collect();
        let payload = serde_json::to_value(event).ok();
        for scope in scopes {
            self.registry
                .publish_updated(&scope, &admin_uri(&scope, "mounts"), payload.clone());
        }
        Ok(())
    }
}

/// Mirrors approval changes onto `mediator://<agent>/approvals/...`.
struct ApprovalsPublisher {
    registry: Arc<SubscriptionRegistry>,
    hub: Weak<ApprovalHub>,
}

#[async_trait]
impl ApprovalObserver for ApprovalsPublisher {
    async fn on_event(&self, event: &ApprovalEvent) -> Result<(), ObserverError> {
        let item = event.item();
        let agent = &item.agent_id;
        self.registry.publish_updated(
            agent,
            &admin_uri(agent, &format!("approvals/{}", item.call_id)),
            serde_json::to_value(item).ok(),
        );
        let Some(hub) = self.hub.upgrade() else {
            return Ok(());
        };
        let pending = hub.pending_items(Some(agent));
        self.registry.publish_updated(
            agent,
            &admin_uri(agent, "approvals/pending"),
            serde_json::to_value(pending).ok(),
        );
        Ok(())
    }
}

fn json_resource(uri: &str, value: &Value) -> ReadResourceResult {
    ReadResourceResult {
        contents: vec![json!({
            "uri": uri,
            "mimeType": "application/json",
            "text": value.to_string(),
        })],
    }
}
