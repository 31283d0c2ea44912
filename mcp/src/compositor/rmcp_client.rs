//! Remote downstreams reached through rmcp client transports.

use std::{borrow::Cow, collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use rmcp::{
    model::{
        CallToolRequestParam, ClientInfo, LoggingLevel, LoggingMessageNotificationParam,
        ReadResourceRequestParam, ResourceUpdatedNotificationParam, SubscribeRequestParam,
        UnsubscribeRequestParam,
    },
    service::{NotificationContext, Peer, RunningService, ServiceError},
    ClientHandler, RoleClient, ServiceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::downstream::{
    DownstreamCapabilities, DownstreamNotification, DownstreamServer, NotificationSink,
    ReadResourceResult, ResourceDescriptor, ToolDescriptor, ToolResult,
};
use crate::{
    core::config::McpTransport,
    error::{codes, DownstreamError},
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Receives server-initiated notifications and feeds the mount's queue.
#[derive(Clone)]
pub(crate) struct ForwardingHandler {
    server: Arc<str>,
    sink: NotificationSink,
    client_info: ClientInfo,
}

impl ForwardingHandler {
    fn new(server: &str, sink: NotificationSink) -> Self {
        let mut client_info = ClientInfo::default();
        client_info.client_info.name = "mcp-mediator".to_string();
        client_info.client_info.version = env!("CARGO_PKG_VERSION").to_string();
        Self {
            server: Arc::from(server),
            sink,
            client_info,
        }
    }

    async fn forward(&self, notification: DownstreamNotification) {
        if self.sink.send(notification).await.is_err() {
            debug!(server = %self.server, "Notification queue closed, dropping");
        }
    }
}

impl ClientHandler for ForwardingHandler {
    async fn on_resource_updated(
        &self,
        params: ResourceUpdatedNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        debug!(server = %self.server, uri = %params.uri, "Downstream resource updated");
        self.forward(DownstreamNotification::ResourceUpdated { uri: params.uri })
            .await;
    }

    async fn on_resource_list_changed(&self, _context: NotificationContext<RoleClient>) {
        info!(server = %self.server, "Downstream resource list changed");
        self.forward(DownstreamNotification::ResourceListChanged).await;
    }

    async fn on_tool_list_changed(&self, _context: NotificationContext<RoleClient>) {
        info!(server = %self.server, "Downstream tool list changed");
        self.forward(DownstreamNotification::ToolListChanged).await;
    }

    fn get_info(&self) -> ClientInfo {
        self.client_info.clone()
    }

    async fn on_logging_message(
        &self,
        params: LoggingMessageNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        let logger = params.logger.as_deref().unwrap_or("mcp");
        match params.level {
            LoggingLevel::Emergency
            | LoggingLevel::Alert
            | LoggingLevel::Critical
            | LoggingLevel::Error => {
                error!(server = %self.server, logger = %logger, level = ?params.level, "{}", params.data);
            }
            LoggingLevel::Warning => {
                warn!(server = %self.server, logger = %logger, "{}", params.data);
            }
            LoggingLevel::Notice | LoggingLevel::Info => {
                info!(server = %self.server, logger = %logger, "{}", params.data);
            }
            LoggingLevel::Debug => {
                debug!(server = %self.server, logger = %logger, "{}", params.data);
            }
        }
    }
}

type ClientService = RunningService<RoleClient, ForwardingHandler>;

pub(crate) struct RmcpServer {
    name: String,
    peer: Peer<RoleClient>,
    service: Mutex<Option<ClientService>>,
    capabilities: DownstreamCapabilities,
}

impl RmcpServer {
    fn new(name: &str, service: ClientService) -> Self {
        let peer = service.peer().clone();
        let capabilities = peer
            .peer_info()
            .and_then(|info| serde_json::to_value(&info.capabilities).ok())
            .map(|caps| DownstreamCapabilities::from_json(&caps))
            .unwrap_or_default();
        Self {
            name: name.to_string(),
            peer,
            service: Mutex::new(Some(service)),
            capabilities,
        }
    }
}

/// Map an rmcp service error onto the gateway's downstream taxonomy.
fn map_service_error(err: ServiceError) -> DownstreamError {
    match err {
        ServiceError::McpError(data) => {
            DownstreamError::from_remote(i64::from(data.code.0), data.message, data.data)
        }
        ServiceError::TransportClosed => {
            DownstreamError::Disconnected("transport closed".to_string())
        }
        other => DownstreamError::Transport(other.to_string()),
    }
}

/// Re-shape rmcp model types into ours; both sides speak MCP's JSON.
fn convert<T: Serialize, U: DeserializeOwned>(value: T) -> Result<U, DownstreamError> {
    serde_json::to_value(value)
        .and_then(serde_json::from_value)
        .map_err(|e| DownstreamError::Transport(format!("malformed response: {}", e)))
}

#[async_trait]
impl DownstreamServer for RmcpServer {
    fn capabilities(&self) -> DownstreamCapabilities {
        self.capabilities
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, DownstreamError> {
        if !self.capabilities.tools {
            return Ok(Vec::new());
        }
        let tools = self
            .peer
            .list_all_tools()
            .await
            .map_err(map_service_error)?;
        convert(tools)
    }

    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, DownstreamError> {
        if !self.capabilities.resources {
            return Ok(Vec::new());
        }
        let resources = self
            .peer
            .list_all_resources()
            .await
            .map_err(map_service_error)?;
        convert(resources)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult, DownstreamError> {
        let arguments = match arguments {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                return Err(DownstreamError::from_remote(
                    codes::INVALID_PARAMS,
                    format!("tool arguments must be an object, got {}", other),
                    None,
                ))
            }
        };
        let result = self
            .peer
            .call_tool(CallToolRequestParam {
                name: Cow::Owned(name.to_string()),
                arguments,
            })
            .await
            .map_err(map_service_error)?;
        convert(result)
    }

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, DownstreamError> {
        let result = self
            .peer
            .read_resource(ReadResourceRequestParam {
                uri: uri.to_string(),
            })
            .await
            .map_err(map_service_error)?;
        convert(result)
    }

    async fn subscribe(&self, uri: &str) -> Result<(), DownstreamError> {
        if !self.capabilities.resources_subscribe {
            debug!(server = %self.name, uri = %uri, "Server does not support subscriptions");
            return Ok(());
        }
        self.peer
            .subscribe(SubscribeRequestParam {
                uri: uri.to_string(),
            })
            .await
            .map_err(map_service_error)
    }

    async fn unsubscribe(&self, uri: &str) -> Result<(), DownstreamError> {
        if !self.capabilities.resources_subscribe {
            return Ok(());
        }
        self.peer
            .unsubscribe(UnsubscribeRequestParam {
                uri: uri.to_string(),
            })
            .await
            .map_err(map_service_error)
    }

    async fn close(&self) {
        if let Some(service) = self.service.lock().await.take() {
            if let Err(e) = service.cancel().await {
                warn!(server = %self.name, error = %e, "Error closing downstream connection");
            }
        }
    }
}

fn build_request_headers(
    token: &Option<String>,
    custom_headers: &HashMap<String, String>,
) -> Result<reqwest::header::HeaderMap, DownstreamError> {
    let mut headers = reqwest::header::HeaderMap::new();

    if let Some(tok) = token {
        headers.insert(
            reqwest::header::AUTHORIZATION,
            format!("Bearer {}", tok)
                .parse()
                .map_err(|e| DownstreamError::Transport(format!("auth token: {}", e)))?,
        );
    }

    for (key, value) in custom_headers {
        headers.insert(
            reqwest::header::HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| DownstreamError::Transport(format!("header name: {}", e)))?,
            value
                .parse()
                .map_err(|e| DownstreamError::Transport(format!("header value: {}", e)))?,
        );
    }

    Ok(headers)
}

fn build_http_client(
    token: &Option<String>,
    custom_headers: &HashMap<String, String>,
) -> Result<reqwest::Client, DownstreamError> {
    let mut builder = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT);
    let headers = build_request_headers(token, custom_headers)?;
    if !headers.is_empty() {
        builder = builder.default_headers(headers);
    }
    builder
        .build()
        .map_err(|e| DownstreamError::Transport(format!("build HTTP client: {}", e)))
}

/// Open and initialize a client session over the configured transport.
pub(crate) async fn connect(
    name: &str,
    transport: &McpTransport,
    sink: NotificationSink,
) -> Result<RmcpServer, DownstreamError> {
    use rmcp::transport::{
        sse_client::SseClientConfig, streamable_http_client::StreamableHttpClientTransportConfig,
        ConfigureCommandExt, SseClientTransport, StreamableHttpClientTransport, TokioChildProcess,
    };

    let handler = ForwardingHandler::new(name, sink);
    let service = match transport {
        McpTransport::Stdio {
            command,
            args,
            envs,
        } => {
            let child = TokioChildProcess::new(tokio::process::Command::new(command).configure(
                |cmd| {
                    cmd.args(args)
                        .envs(envs.iter())
                        .stderr(std::process::Stdio::inherit());
                },
            ))
            .map_err(|e| DownstreamError::Transport(format!("spawn '{}': {}", command, e)))?;
            handler
                .serve(child)
                .await
                .map_err(|e| DownstreamError::Transport(format!("initialize stdio client: {}", e)))?
        }
        McpTransport::Sse {
            url,
            token,
            headers,
        } => {
            let http_client = build_http_client(token, headers)?;
            let config = SseClientConfig {
                sse_endpoint: url.clone().into(),
                ..Default::default()
            };
            let sse = SseClientTransport::start_with_client(http_client, config)
                .await
                .map_err(|e| DownstreamError::Transport(format!("open SSE stream: {}", e)))?;
            handler
                .serve(sse)
                .await
                .map_err(|e| DownstreamError::Transport(format!("initialize SSE client: {}", e)))?
        }
        McpTransport::Streamable {
            url,
            token,
            headers,
        } => {
            let http_client = build_http_client(token, headers)?;
            let config = StreamableHttpClientTransportConfig::with_uri(url.as_str());
            let streamable = StreamableHttpClientTransport::with_client(http_client, config);
            handler.serve(streamable).await.map_err(|e| {
                DownstreamError::Transport(format!("initialize streamable client: {}", e))
            })?
        }
    };

    info!(server = %name, protocol = transport.protocol(), "Connected to downstream server");
    Ok(RmcpServer::new(name, service))
}

#[cfg(test)]
mod tests {
    use rmcp::model::{ErrorCode, ErrorData};

    use super::*;

    #[test]
    fn test_remote_error_passthrough() {
        let err = map_service_error(ServiceError::McpError(ErrorData::new(
            ErrorCode(-32001),
            "quota exceeded",
            Some(serde_json::json!({"retry_after": 5})),
        )));
        assert_eq!(
            err,
            DownstreamError::Remote {
                code: -32001,
                message: "quota exceeded".to_string(),
                data: Some(serde_json::json!({"retry_after": 5})),
            }
        );
    }

    #[test]
    fn test_reserved_code_is_flagged() {
        let err = map_service_error(ServiceError::McpError(ErrorData::new(
            ErrorCode(-32950),
            "pretending to be a denial",
            None,
        )));
        assert!(matches!(
            err,
            DownstreamError::ReservedCodeMisuse { code: -32950, .. }
        ));
    }

    #[test]
    fn test_transport_closed_is_disconnect() {
        assert!(matches!(
            map_service_error(ServiceError::TransportClosed),
            DownstreamError::Disconnected(_)
        ));
    }

    #[test]
    fn test_headers_include_bearer() {
        let mut custom = HashMap::new();
        custom.insert("X-Trace".to_string(), "abc".to_string());
        let headers = build_request_headers(&Some("secret".to_string()), &custom).unwrap();
        assert_eq!(headers[reqwest::header::AUTHORIZATION], "Bearer secret");
        assert_eq!(headers["x-trace"], "abc");

        custom.insert("bad header".to_string(), "x".to_string());
        assert!(build_request_headers(&None, &custom).is_err());
    }

    #[test]
    fn test_convert_tool_list() {
        let raw = serde_json::json!([{
            "name": "search",
            "description": "Search the web",
            "inputSchema": {"type": "object"}
        }]);
        let tools: Vec<ToolDescriptor> = convert(raw).unwrap();
        assert_eq!(tools[0].name, "search");
        assert_eq!(tools[0].description.as_deref(), Some("Search the web"));
    }
}
