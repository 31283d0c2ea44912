//! A downstream server implemented in the same process.
//!
//! Tools are async closures and resources live in an in-memory map. Content
//! changes to a subscribed resource, and additions or removals, are pushed
//! through the notification sink exactly like a remote server would.

use std::{
    collections::{BTreeMap, HashSet},
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::debug;

use super::downstream::{
    DownstreamCapabilities, DownstreamNotification, DownstreamServer, NotificationSink,
    ReadResourceResult, ResourceDescriptor, ToolDescriptor, ToolResult,
};
use crate::error::DownstreamError;

type ToolHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<ToolResult, DownstreamError>> + Send + Sync>;

struct ToolSlot {
    descriptor: ToolDescriptor,
    handler: ToolHandler,
}

struct ResourceSlot {
    descriptor: ResourceDescriptor,
    text: String,
}

/// Link state, settable from tests to simulate transport trouble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    /// Calls fail with a recoverable transport error.
    Flaky,
    /// Calls fail with `Disconnected`.
    Down,
}

pub struct InProcessServer {
    label: String,
    tools: RwLock<BTreeMap<String, ToolSlot>>,
    resources: RwLock<BTreeMap<String, ResourceSlot>>,
    subscribed: Mutex<HashSet<String>>,
    sink: Mutex<Option<NotificationSink>>,
    link: Mutex<LinkState>,
    refuse_connect: AtomicBool,
    closed: AtomicBool,
}

impl InProcessServer {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            tools: RwLock::new(BTreeMap::new()),
            resources: RwLock::new(BTreeMap::new()),
            subscribed: Mutex::new(HashSet::new()),
            sink: Mutex::new(None),
            link: Mutex::new(LinkState::Up),
            refuse_connect: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn with_tool<F, Fut>(self, descriptor: ToolDescriptor, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolResult, DownstreamError>> + Send + 'static,
    {
        self.insert_tool(descriptor, handler);
        self
    }

    #[must_use]
    pub fn with_resource(self, uri: impl Into<String>, name: impl Into<String>, text: impl Into<String>) -> Self {
        let uri = uri.into();
        self.resources.write().insert(
            uri.clone(),
            ResourceSlot {
                descriptor: ResourceDescriptor::new(uri, name),
                text: text.into(),
            },
        );
        self
    }

    /// Make the next `bind` fail, as if the server could not be reached.
    #[must_use]
    pub fn refusing_connections(self) -> Self {
        self.refuse_connect.store(true, Ordering::Relaxed);
        self
    }

    /// Add or replace a tool at runtime and announce the list change.
    pub async fn add_tool<F, Fut>(&self, descriptor: ToolDescriptor, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolResult, DownstreamError>> + Send + 'static,
    {
        self.insert_tool(descriptor, handler);
        self.emit(DownstreamNotification::ToolListChanged).await;
    }

    /// Update (or create) a resource's content.
    ///
    /// Creation announces a list change; an update is announced only if the
    /// resource is subscribed.
    pub async fn set_resource(&self, uri: &str, text: impl Into<String>) {
        let created = {
            let mut resources = self.resources.write();
            match resources.get_mut(uri) {
                Some(slot) => {
                    slot.text = text.into();
                    false
                }
                None => {
                    resources.insert(
                        uri.to_string(),
                        ResourceSlot {
                            descriptor: ResourceDescriptor::new(uri, uri),
                            text: text.into(),
                        },
                    );
                    true
                }
            }
        };
        if created {
            self.emit(DownstreamNotification::ResourceListChanged).await;
        } else if self.subscribed.lock().contains(uri) {
            self.emit(DownstreamNotification::ResourceUpdated {
                uri: uri.to_string(),
            })
            .await;
        }
    }

    pub async fn remove_resource(&self, uri: &str) -> bool {
        let removed = self.resources.write().remove(uri).is_some();
        if removed {
            self.subscribed.lock().remove(uri);
            self.emit(DownstreamNotification::ResourceListChanged).await;
        }
        removed
    }

    /// Push a notification. Returns false if nobody is bound.
    pub async fn emit(&self, notification: DownstreamNotification) -> bool {
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => sink.send(notification).await.is_ok(),
            None => false,
        }
    }

    pub fn set_link(&self, state: LinkState) {
        *self.link.lock() = state;
    }

    /// URIs the compositor asked this server to watch.
    pub fn downstream_subscriptions(&self) -> Vec<String> {
        let mut uris: Vec<String> = self.subscribed.lock().iter().cloned().collect();
        uris.sort();
        uris
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Attach to a compositor's notification sink.
    pub(crate) fn bind(&self, sink: NotificationSink) -> Result<(), DownstreamError> {
        if self.refuse_connect.swap(false, Ordering::AcqRel) {
            return Err(DownstreamError::Transport(format!(
                "{}: connection refused",
                self.label
            )));
        }
        *self.sink.lock() = Some(sink);
        self.closed.store(false, Ordering::Release);
        *self.link.lock() = LinkState::Up;
        Ok(())
    }

    fn insert_tool<F, Fut>(&self, descriptor: ToolDescriptor, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolResult, DownstreamError>> + Send + 'static,
    {
        let handler: ToolHandler = Arc::new(move |args| handler(args).boxed());
        self.tools.write().insert(
            descriptor.name.clone(),
            ToolSlot {
                descriptor,
                handler,
            },
        );
    }

    fn check_link(&self) -> Result<(), DownstreamError> {
        if self.is_closed() {
            return Err(DownstreamError::Disconnected(format!("{}: closed", self.label)));
        }
        match *self.link.lock() {
            LinkState::Up => Ok(()),
            LinkState::Flaky => Err(DownstreamError::Transport(format!(
                "{}: connection reset",
                self.label
            ))),
            LinkState::Down => Err(DownstreamError::Disconnected(format!(
                "{}: peer went away",
                self.label
            ))),
        }
    }
}

#[async_trait]
impl DownstreamServer for InProcessServer {
    fn capabilities(&self) -> DownstreamCapabilities {
        DownstreamCapabilities {
            tools: true,
            resources: true,
            resources_subscribe: true,
            resources_list_changed: true,
            tools_list_changed: true,
        }
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, DownstreamError> {
        self.check_link()?;
        Ok(self
            .tools
            .read()
            .values()
            .map(|slot| slot.descriptor.clone())
            .collect())
    }

    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, DownstreamError> {
        self.check_link()?;
        Ok(self
            .resources
            .read()
            .values()
            .map(|slot| slot.descriptor.clone())
            .collect())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult, DownstreamError> {
        self.check_link()?;
        let handler = self
            .tools
            .read()
            .get(name)
            .map(|slot| Arc::clone(&slot.handler));
        match handler {
            Some(handler) => handler(arguments).await,
            None => Err(DownstreamError::from_remote(
                crate::error::codes::INVALID_PARAMS,
                format!("unknown tool: {}", name),
                None,
            )),
        }
    }

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, DownstreamError> {
        self.check_link()?;
        self.resources
            .read()
            .get(uri)
            .map(|slot| ReadResourceResult::text(uri, slot.text.clone()))
            .ok_or_else(|| DownstreamError::NotFound(uri.to_string()))
    }

    async fn subscribe(&self, uri: &str) -> Result<(), DownstreamError> {
        self.check_link()?;
        self.subscribed.lock().insert(uri.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, uri: &str) -> Result<(), DownstreamError> {
        self.subscribed.lock().remove(uri);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.sink.lock().take();
        self.subscribed.lock().clear();
        debug!(server = %self.label, "In-process server closed");
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;

    fn echo_server() -> InProcessServer {
        InProcessServer::new("echo")
            .with_tool(ToolDescriptor::new("echo"), |args| async move {
                Ok(ToolResult::structured(args))
            })
            .with_resource("file:///greeting", "greeting", "hello")
    }

    #[tokio::test]
    async fn test_call_and_read() {
        let server = echo_server();
        let result = server.call_tool("echo", json!({"x": 1})).await.unwrap();
        assert_eq!(result.structured_content, Some(json!({"x": 1})));

        let read = server.read_resource("file:///greeting").await.unwrap();
        assert_eq!(read.contents[0]["text"], "hello");
        assert!(matches!(
            server.read_resource("file:///missing").await,
            Err(DownstreamError::NotFound(_))
        ));
        assert!(matches!(
            server.call_tool("nope", json!({})).await,
            Err(DownstreamError::Remote { .. })
        ));
    }

    #[tokio::test]
    async fn test_updates_only_for_subscribed() {
        let server = echo_server();
        let (tx, mut rx) = mpsc::channel(8);
        server.bind(tx).unwrap();

        server.set_resource("file:///greeting", "hi").await;
        assert!(rx.try_recv().is_err());

        server.subscribe("file:///greeting").await.unwrap();
        server.set_resource("file:///greeting", "hey").await;
        assert_eq!(
            rx.recv().await,
            Some(DownstreamNotification::ResourceUpdated {
                uri: "file:///greeting".to_string()
            })
        );

        server.set_resource("file:///new", "fresh").await;
        assert_eq!(rx.recv().await, Some(DownstreamNotification::ResourceListChanged));
    }

    #[tokio::test]
    async fn test_link_states() {
        let server = echo_server();
        server.set_link(LinkState::Flaky);
        assert!(matches!(
            server.call_tool("echo", json!({})).await,
            Err(DownstreamError::Transport(_))
        ));
        server.set_link(LinkState::Down);
        assert!(matches!(
            server.list_tools().await,
            Err(DownstreamError::Disconnected(_))
        ));
    }

    #[tokio::test]
    async fn test_refused_connection_is_one_shot() {
        let server = echo_server().refusing_connections();
        let (tx, _rx) = mpsc::channel(1);
        assert!(server.bind(tx.clone()).is_err());
        assert!(server.bind(tx).is_ok());
    }
}
