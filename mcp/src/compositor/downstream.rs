//! The contract a mounted server must satisfy.
//!
//! The compositor only needs four primitives from a downstream: tool calls,
//! resource reads, capability negotiation and asynchronous notifications.
//! Wire types are kept as loose JSON wherever the gateway forwards data
//! unchanged, so downstream payloads survive the round trip verbatim.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use super::inprocess::InProcessServer;
use crate::{core::config::McpTransport, error::DownstreamError};

/// Bound of each mount's notification queue.
pub const NOTIFICATION_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: serde_json::json!({"type": "object"}),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    pub uri: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl ResourceDescriptor {
    pub fn new(uri: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: name.into(),
            description: None,
            mime_type: None,
        }
    }
}

/// A tool call response. `content` entries are forwarded as-is.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![serde_json::json!({"type": "text", "text": text.into()})],
            ..Default::default()
        }
    }

    pub fn structured(value: Value) -> Self {
        Self {
            content: vec![serde_json::json!({"type": "text", "text": value.to_string()})],
            structured_content: Some(value),
            is_error: None,
        }
    }

    /// A tool-level failure the server reported inside a successful response.
    pub fn is_error(&self) -> bool {
        self.is_error.unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReadResourceResult {
    #[serde(default)]
    pub contents: Vec<Value>,
}

impl ReadResourceResult {
    pub fn text(uri: &str, text: impl Into<String>) -> Self {
        Self {
            contents: vec![serde_json::json!({"uri": uri, "text": text.into()})],
        }
    }
}

/// Negotiated capabilities we care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DownstreamCapabilities {
    pub tools: bool,
    pub resources: bool,
    pub resources_subscribe: bool,
    pub resources_list_changed: bool,
    pub tools_list_changed: bool,
}

impl DownstreamCapabilities {
    /// Parse the `capabilities` object of an MCP initialize result.
    pub fn from_json(value: &Value) -> Self {
        let flag = |section: &str, key: &str| {
            value
                .get(section)
                .and_then(|s| s.get(key))
                .and_then(Value::as_bool)
                .unwrap_or(false)
        };
        Self {
            tools: value.get("tools").is_some(),
            resources: value.get("resources").is_some(),
            resources_subscribe: flag("resources", "subscribe"),
            resources_list_changed: flag("resources", "listChanged"),
            tools_list_changed: flag("tools", "listChanged"),
        }
    }
}

/// Asynchronous notification from a downstream, in its local namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownstreamNotification {
    ResourceUpdated { uri: String },
    ResourceListChanged,
    ToolListChanged,
}

/// Where a downstream pushes its notifications.
pub type NotificationSink = mpsc::Sender<DownstreamNotification>;

/// One connected downstream server.
#[async_trait]
pub trait DownstreamServer: Send + Sync {
    fn capabilities(&self) -> DownstreamCapabilities;

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, DownstreamError>;

    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, DownstreamError>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult, DownstreamError>;

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, DownstreamError>;

    async fn subscribe(&self, _uri: &str) -> Result<(), DownstreamError> {
        Ok(())
    }

    async fn unsubscribe(&self, _uri: &str) -> Result<(), DownstreamError> {
        Ok(())
    }

    async fn close(&self);
}

/// How to reach a server.
#[derive(Clone)]
pub enum TransportSpec {
    Remote(McpTransport),
    InProcess(Arc<InProcessServer>),
}

impl TransportSpec {
    pub fn describe(&self) -> String {
        match self {
            TransportSpec::Remote(McpTransport::Stdio { command, .. }) => {
                format!("stdio:{}", command)
            }
            TransportSpec::Remote(McpTransport::Sse { url, .. }) => format!("sse:{}", url),
            TransportSpec::Remote(McpTransport::Streamable { url, .. }) => {
                format!("streamable:{}", url)
            }
            TransportSpec::InProcess(server) => format!("in-process:{}", server.label()),
        }
    }
}

impl std::fmt::Debug for TransportSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportSpec::Remote(transport) => f.debug_tuple("Remote").field(transport).finish(),
            TransportSpec::InProcess(server) => {
                f.debug_tuple("InProcess").field(&server.label()).finish()
            }
        }
    }
}

impl From<McpTransport> for TransportSpec {
    fn from(transport: McpTransport) -> Self {
        TransportSpec::Remote(transport)
    }
}

impl From<Arc<InProcessServer>> for TransportSpec {
    fn from(server: Arc<InProcessServer>) -> Self {
        TransportSpec::InProcess(server)
    }
}

/// Opens connections for the compositor.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        name: &str,
        spec: &TransportSpec,
        sink: NotificationSink,
    ) -> Result<Arc<dyn DownstreamServer>, DownstreamError>;
}

/// rmcp for remote transports, direct binding for in-process servers.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConnector;

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(
        &self,
        name: &str,
        spec: &TransportSpec,
        sink: NotificationSink,
    ) -> Result<Arc<dyn DownstreamServer>, DownstreamError> {
        match spec {
            TransportSpec::Remote(transport) => {
                let server = super::rmcp_client::connect(name, transport, sink).await?;
                Ok(Arc::new(server))
            }
            TransportSpec::InProcess(server) => {
                server.bind(sink)?;
                Ok(Arc::clone(server) as Arc<dyn DownstreamServer>)
            }
        }
    }
}
