//! MCP runtime exposing a Metabase instance as tools.
//!
//! One [`McpServer`] owns one authenticated [`Dispatcher`]; it can be driven
//! over stdio ([`McpServer::serve_stdio`]) or fed JSON-RPC messages by any
//! other transport ([`McpServer::handle_incoming_message`]).

use std::sync::Arc;
use std::time::Instant;

use metabase_core::Error;
use metabase_core::error::codes;
use serde_json::{Map, Value, json};
use tokio::io::{
    self, AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use uuid::Uuid;

mod args;
pub mod composer;
pub mod config;
pub mod dispatch;
pub mod metrics;
pub mod session;
mod tools;

pub use config::{RuntimeConfig, parse_base_url};
pub use dispatch::{Dispatcher, RetryPolicy};
pub use session::SessionAuthenticator;

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const MCP_SERVER_NAME: &str = "metabase-mcp";
const TOOL_ENVELOPE_MAX_BYTES: usize = 48_000;

pub struct McpServer {
    dispatcher: Dispatcher,
    session_id: String,
}

impl McpServer {
    pub fn new(config: RuntimeConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("metabase-mcp/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {e}")))?;
        let auth = Arc::new(SessionAuthenticator::new(
            config.credential,
            config.base_url.clone(),
            http.clone(),
            config.timeout,
        ));
        let dispatcher = Dispatcher::new(http, config.base_url, auth, config.timeout, config.retry);
        Ok(Self {
            dispatcher,
            session_id: format!("stdio-{}", Uuid::now_v7()),
        })
    }

    pub fn authenticator(&self) -> &SessionAuthenticator {
        self.dispatcher.authenticator()
    }

    pub async fn serve_stdio(&self) -> Result<(), String> {
        let stdin = io::stdin();
        let mut reader = BufReader::new(stdin);
        let mut stdout = io::stdout();
        tracing::info!(session_id = %self.session_id, "serving MCP over stdio");

        loop {
            let frame = read_message(&mut reader)
                .await
                .map_err(|e| format!("Failed to read MCP message: {e}"))?;
            let Some(frame) = frame else {
                break;
            };

            let responses = match frame.payload {
                Ok(incoming) => self.handle_incoming_message(incoming).await,
                Err(err) => vec![parse_error_response(&err)],
            };
            for response in responses {
                write_message(&mut stdout, &response, frame.framing)
                    .await
                    .map_err(|e| format!("Failed to write MCP response: {e}"))?;
            }
        }

        tracing::info!("stdin closed; stopping MCP server");
        Ok(())
    }

    /// Close the remote session, if one is open.
    pub async fn shutdown(&self) {
        if let Err(err) = self.authenticator().logout().await {
            tracing::warn!(error = %err, "metabase logout failed");
        }
    }

    pub async fn handle_incoming_message(&self, incoming: Value) -> Vec<Value> {
        let mut responses = Vec::new();

        if let Some(batch) = incoming.as_array() {
            if batch.is_empty() {
                responses.push(error_response(
                    Value::Null,
                    RpcError::invalid_request("Batch request must not be empty"),
                ));
                return responses;
            }
            for item in batch {
                if let Some(response) = self.handle_single_message(item.clone()).await {
                    responses.push(response);
                }
            }
            return responses;
        }

        if let Some(response) = self.handle_single_message(incoming).await {
            responses.push(response);
        }
        responses
    }

    async fn handle_single_message(&self, incoming: Value) -> Option<Value> {
        let Some(obj) = incoming.as_object() else {
            return Some(error_response(
                Value::Null,
                RpcError::invalid_request("Request must be a JSON object"),
            ));
        };

        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            let id = obj.get("id").cloned().unwrap_or(Value::Null);
            return Some(error_response(
                id,
                RpcError::invalid_request("jsonrpc must be '2.0'"),
            ));
        }

        let Some(method) = obj.get("method").and_then(Value::as_str) else {
            // A client response; this server never issues requests.
            return None;
        };

        let params = obj.get("params").cloned().unwrap_or(Value::Null);
        if let Some(id) = obj.get("id").cloned() {
            let result = self.handle_request(method, params).await;
            Some(match result {
                Ok(payload) => success_response(id, payload),
                Err(err) => error_response(id, err),
            })
        } else {
            tracing::debug!(method, "notification ignored");
            None
        }
    }

    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(self.initialize_payload()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.tools_list_payload()),
            "tools/call" => self.handle_tools_call(params).await,
            "resources/list" => Ok(json!({ "resources": [] })),
            "prompts/list" => Ok(json!({ "prompts": [] })),
            _ => Err(RpcError::method_not_found(method)),
        }
    }

    fn initialize_payload(&self) -> Value {
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {
                "tools": { "listChanged": false },
                "resources": { "listChanged": false },
                "prompts": { "listChanged": false }
            },
            "serverInfo": {
                "name": MCP_SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION")
            },
            "instructions": "Explore with list_databases, list_tables and get_table_fields before querying. Prefer execute_structured_query over raw SQL: it validates field ids against the table. Dashboard tools read the current dashboard first and write the full layout back; copy_dashboard_tab returns a step report and never rolls back.",
            "authMethod": self.authenticator().method_name()
        })
    }

    fn tools_list_payload(&self) -> Value {
        let tools: Vec<Value> = tools::tool_definitions()
            .into_iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": tool.input_schema,
                })
            })
            .collect();
        json!({ "tools": tools })
    }

    async fn handle_tools_call(&self, params: Value) -> Result<Value, RpcError> {
        let params = params
            .as_object()
            .ok_or_else(|| RpcError::invalid_params("tools/call params must be an object"))?;

        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("tools/call requires string field 'name'"))?;

        let args = match params.get("arguments") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(_) => {
                return Err(RpcError::invalid_params(
                    "tools/call 'arguments' must be an object",
                ));
            }
        };

        let started = Instant::now();
        let response = match self.execute_tool(name, &args).await {
            Ok(payload) => {
                let status = tool_completion_status(&payload);
                let envelope = enforce_tool_payload_limit(
                    name,
                    json!({
                        "status": status,
                        "phase": "final",
                        "tool": name,
                        "data": payload
                    }),
                );
                tracing::info!(
                    tool = name,
                    status,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "tool call finished"
                );
                build_tool_call_response(envelope, status == "partial")
            }
            Err(err) => {
                tracing::warn!(
                    tool = name,
                    code = %err.code,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "tool call failed"
                );
                let envelope = enforce_tool_payload_limit(
                    name,
                    json!({
                        "status": "error",
                        "phase": "final",
                        "tool": name,
                        "error": err.to_value()
                    }),
                );
                build_tool_call_response(envelope, true)
            }
        };
        Ok(response)
    }
}

fn tool_completion_status(payload: &Value) -> &'static str {
    match payload.get("status").and_then(Value::as_str) {
        Some("partial") => "partial",
        _ => "complete",
    }
}

fn build_tool_call_response(envelope: Value, is_error: bool) -> Value {
    // Agents read the text block; structuredContent carries the same envelope.
    let text = to_pretty_json(&envelope);
    if is_error {
        json!({
            "isError": true,
            "content": [{ "type": "text", "text": text }],
            "structuredContent": envelope
        })
    } else {
        json!({
            "content": [{ "type": "text", "text": text }],
            "structuredContent": envelope
        })
    }
}

#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
    data: Option<Value>,
}

impl RpcError {
    fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: -32600,
            message: message.into(),
            data: None,
        }
    }

    fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {method}"),
            data: None,
        }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ToolError {
    code: String,
    message: String,
    field: Option<String>,
    docs_hint: Option<String>,
    details: Option<Value>,
}

impl ToolError {
    fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            field: None,
            docs_hint: None,
            details: None,
        }
    }

    fn validation(message: impl Into<String>) -> Self {
        Self::new(codes::VALIDATION_FAILED, message)
    }

    fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    fn with_docs_hint(mut self, docs_hint: impl Into<String>) -> Self {
        self.docs_hint = Some(docs_hint.into());
        self
    }

    fn to_value(&self) -> Value {
        let mut payload = json!({
            "error": self.code,
            "message": self.message
        });
        if let Some(field) = &self.field {
            payload["field"] = Value::String(field.clone());
        }
        if let Some(docs_hint) = &self.docs_hint {
            payload["docs_hint"] = Value::String(docs_hint.clone());
        }
        if let Some(details) = &self.details {
            payload["details"] = details.clone();
        }
        payload
    }
}

impl From<Error> for ToolError {
    fn from(err: Error) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            field: err.field().map(str::to_string),
            docs_hint: err.docs_hint().map(str::to_string),
            details: err.details(),
        }
    }
}

fn serialized_json_size_bytes(value: &Value) -> usize {
    serde_json::to_vec(value)
        .map(|bytes| bytes.len())
        .unwrap_or(usize::MAX)
}

fn payload_reload_hint(tool: &str) -> &'static str {
    match tool {
        "execute_query" | "execute_structured_query" | "execute_card" => {
            "Add a LIMIT / limit, aggregate, or select fewer columns to see the full result."
        }
        "get_table_fields" => "Page through fields with offset and limit.",
        _ => "Retry with narrower scope or pagination, then request follow-up chunks for full detail.",
    }
}

/// Cap the envelope size. Query results are cut row-wise first so the
/// column metadata survives; anything else collapses to a shape summary.
fn enforce_tool_payload_limit(tool: &str, envelope: Value) -> Value {
    let original_bytes = serialized_json_size_bytes(&envelope);
    if original_bytes <= TOOL_ENVELOPE_MAX_BYTES {
        return envelope;
    }

    if let Some(pruned) = prune_result_rows(&envelope) {
        let remaining_bytes = serialized_json_size_bytes(&pruned);
        let mut pruned = pruned;
        annotate_truncation(&mut pruned, "row_pruning", original_bytes, remaining_bytes, tool);
        return pruned;
    }

    let status = envelope
        .get("status")
        .cloned()
        .unwrap_or_else(|| Value::String("complete".to_string()));
    let mut fallback = json!({
        "status": status,
        "phase": "final",
        "tool": tool,
        "truncated": true,
        "truncation": {
            "reason": "payload_size_limit",
            "strategy": "summary_only",
            "limit_bytes": TOOL_ENVELOPE_MAX_BYTES,
            "original_bytes": original_bytes,
            "details_hint": payload_reload_hint(tool)
        }
    });
    if let Some(data) = envelope.get("data") {
        fallback["data_summary"] = summarize_json_shape(data);
    }
    if let Some(error) = envelope.get("error") {
        fallback["error_summary"] = summarize_json_shape(error);
    }
    fallback
}

const RESULT_ROWS_POINTER: &str = "/data/data/rows";

/// Halve the row list until the envelope fits. `None` when there are no
/// rows to cut or even an empty row list is too large.
fn prune_result_rows(envelope: &Value) -> Option<Value> {
    let total = envelope.pointer(RESULT_ROWS_POINTER)?.as_array()?.len();
    let mut trimmed = envelope.clone();
    let mut keep = total;
    loop {
        keep /= 2;
        trimmed.pointer_mut(RESULT_ROWS_POINTER)?.as_array_mut()?.truncate(keep);
        if serialized_json_size_bytes(&trimmed) <= TOOL_ENVELOPE_MAX_BYTES {
            break;
        }
        if keep == 0 {
            return None;
        }
    }
    let result_data = trimmed.pointer_mut("/data/data")?.as_object_mut()?;
    result_data.insert("rows_truncated".to_string(), Value::Bool(true));
    result_data.insert("row_count_total".to_string(), json!(total));
    result_data.insert("rows_returned".to_string(), json!(keep));
    Some(trimmed)
}

fn annotate_truncation(
    envelope: &mut Value,
    strategy: &str,
    original_bytes: usize,
    remaining_bytes: usize,
    tool: &str,
) {
    if let Some(obj) = envelope.as_object_mut() {
        obj.insert("truncated".to_string(), Value::Bool(true));
        obj.insert(
            "truncation".to_string(),
            json!({
                "reason": "payload_size_limit",
                "strategy": strategy,
                "limit_bytes": TOOL_ENVELOPE_MAX_BYTES,
                "original_bytes": original_bytes,
                "remaining_bytes": remaining_bytes,
                "details_hint": payload_reload_hint(tool)
            }),
        );
    }
}

fn summarize_json_shape(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sample_keys = map.keys().take(20).cloned().collect::<Vec<_>>();
            sample_keys.sort();
            json!({
                "omitted": true,
                "type": "object",
                "key_count": map.len(),
                "sample_keys": sample_keys
            })
        }
        Value::Array(items) => json!({
            "omitted": true,
            "type": "array",
            "item_count": items.len()
        }),
        Value::String(s) => json!({
            "omitted": true,
            "type": "string",
            "char_count": s.chars().count()
        }),
        Value::Number(_) => json!({ "omitted": true, "type": "number" }),
        Value::Bool(_) => json!({ "omitted": true, "type": "boolean" }),
        Value::Null => json!({ "omitted": true, "type": "null" }),
    }
}

fn success_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

fn error_response(id: Value, error: RpcError) -> Value {
    let mut payload = json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": error.code,
            "message": error.message
        }
    });
    if let Some(data) = error.data {
        payload["error"]["data"] = data;
    }
    payload
}

pub fn parse_error_response(err: &serde_json::Error) -> Value {
    error_response(
        Value::Null,
        RpcError {
            code: -32700,
            message: "Parse error".to_string(),
            data: Some(json!({ "detail": err.to_string() })),
        },
    )
}

/// How a message arrived on stdio; replies use the same framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// `Content-Length` headers, blank line, body.
    ContentLength,
    /// One JSON document per line.
    Newline,
}

struct Frame {
    payload: Result<Value, serde_json::Error>,
    framing: Framing,
}

async fn read_message<R>(reader: &mut R) -> Result<Option<Frame>, std::io::Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            if content_length.is_none() {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Unexpected EOF while reading MCP headers",
            ));
        }

        let trimmed = line.trim();
        if content_length.is_none() && (trimmed.starts_with('{') || trimmed.starts_with('[')) {
            return Ok(Some(Frame {
                payload: serde_json::from_str(trimmed),
                framing: Framing::Newline,
            }));
        }
        if trimmed.is_empty() {
            if content_length.is_some() {
                break;
            }
            continue;
        }

        if trimmed.to_ascii_lowercase().starts_with("content-length:") {
            let raw_len = trimmed
                .split_once(':')
                .map(|(_, right)| right.trim())
                .unwrap_or_default();
            let parsed = raw_len.parse::<usize>().map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "Invalid Content-Length header",
                )
            })?;
            content_length = Some(parsed);
        }
    }

    let content_length = content_length.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Missing Content-Length header",
        )
    })?;
    let mut payload = vec![0_u8; content_length];
    reader.read_exact(&mut payload).await?;

    Ok(Some(Frame {
        payload: serde_json::from_slice(&payload),
        framing: Framing::ContentLength,
    }))
}

async fn write_message<W>(
    writer: &mut W,
    value: &Value,
    framing: Framing,
) -> Result<(), std::io::Error>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(value).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to serialize JSON: {e}"),
        )
    })?;
    match framing {
        Framing::ContentLength => {
            let header = format!(
                "Content-Length: {}\r\nContent-Type: application/json\r\n\r\n",
                body.len()
            );
            writer.write_all(header.as_bytes()).await?;
            writer.write_all(&body).await?;
        }
        Framing::Newline => {
            writer.write_all(&body).await?;
            writer.write_all(b"\n").await?;
        }
    }
    writer.flush().await?;
    Ok(())
}

fn to_pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use httpmock::prelude::*;
    use metabase_core::Credential;
    use url::Url;

    use super::*;

    fn server_for(base_url: &str) -> McpServer {
        let config = RuntimeConfig::new(
            Url::parse(base_url).unwrap(),
            Credential::ApiKey("mb_key".to_string()),
        )
        .with_timeout(Duration::from_secs(5))
        .with_retry(RetryPolicy::default().with_max_attempts(1));
        McpServer::new(config).unwrap()
    }

    fn offline_server() -> McpServer {
        server_for("http://127.0.0.1:9")
    }

    async fn call(server: &McpServer, name: &str, arguments: Value) -> Value {
        let responses = server
            .handle_incoming_message(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "tools/call",
                "params": { "name": name, "arguments": arguments }
            }))
            .await;
        responses[0]["result"].clone()
    }

    #[tokio::test]
    async fn initialize_reports_server_info_and_auth_method() {
        let server = offline_server();
        let payload = server.initialize_payload();
        assert_eq!(payload["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert_eq!(payload["serverInfo"]["name"], MCP_SERVER_NAME);
        assert_eq!(payload["authMethod"], "api_key");
    }

    #[tokio::test]
    async fn tools_list_exposes_every_tool_once() {
        let server = offline_server();
        let payload = server.tools_list_payload();
        let names: Vec<&str> = payload["tools"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|tool| tool["name"].as_str())
            .collect();
        let unique: std::collections::HashSet<&str> = names.iter().copied().collect();
        assert_eq!(names.len(), unique.len());
        for expected in [
            "list_databases",
            "execute_structured_query",
            "create_metric_card",
            "copy_dashboard_tab",
            "search_metrics",
        ] {
            assert!(unique.contains(expected), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn rejects_wrong_jsonrpc_version_and_unknown_methods() {
        let server = offline_server();
        let wrong = server
            .handle_incoming_message(json!({ "jsonrpc": "1.0", "id": 7, "method": "ping" }))
            .await;
        assert_eq!(wrong[0]["error"]["code"], -32600);
        assert_eq!(wrong[0]["id"], 7);

        let unknown = server
            .handle_incoming_message(json!({ "jsonrpc": "2.0", "id": 8, "method": "nope" }))
            .await;
        assert_eq!(unknown[0]["error"]["code"], -32601);

        let notification = server
            .handle_incoming_message(json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }))
            .await;
        assert!(notification.is_empty());
    }

    #[tokio::test]
    async fn validation_errors_never_reach_the_network() {
        let mock_server = MockServer::start_async().await;
        let any = mock_server
            .mock_async(|when, then| {
                when.path_contains("/api/");
                then.status(200).json_body(json!({}));
            })
            .await;
        let server = server_for(&mock_server.base_url());

        let result = call(
            &server,
            "execute_structured_query",
            json!({
                "database_id": 1,
                "query": {
                    "source_table_id": 3,
                    "filters": [{ "op": "between", "field": { "field_id": 7 }, "bounds": [10, 1] }]
                }
            }),
        )
        .await;

        assert_eq!(result["isError"], true);
        assert_eq!(result["structuredContent"]["error"]["error"], "validation_failed");
        assert_eq!(
            result["structuredContent"]["error"]["field"],
            "query.filters[0].bounds"
        );
        any.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_envelope() {
        let server = offline_server();
        let result = call(&server, "drop_everything", json!({})).await;
        assert_eq!(result["isError"], true);
        assert_eq!(result["structuredContent"]["status"], "error");
        assert_eq!(result["structuredContent"]["error"]["error"], "unknown_tool");
    }

    #[tokio::test]
    async fn remote_errors_carry_status_and_path() {
        let mock_server = MockServer::start_async().await;
        mock_server
            .mock_async(|when, then| {
                when.method(GET).path("/api/card/42");
                then.status(404).body("Not found.");
            })
            .await;
        let server = server_for(&mock_server.base_url());

        let result = call(&server, "get_card", json!({ "card_id": 42 })).await;
        let error = &result["structuredContent"]["error"];
        assert_eq!(error["error"], "client_error");
        assert_eq!(error["details"]["status"], 404);
        assert_eq!(error["details"]["path"], "/card/42");
    }

    #[test]
    fn partial_reports_are_flagged_as_errors() {
        let report = json!({ "status": "partial", "failed_step": { "step": "place_card" } });
        assert_eq!(tool_completion_status(&report), "partial");
        assert_eq!(tool_completion_status(&json!({ "id": 3 })), "complete");
        assert_eq!(tool_completion_status(&json!([1, 2])), "complete");

        let response = build_tool_call_response(json!({ "status": "partial" }), true);
        assert_eq!(response["isError"], true);
        assert_eq!(response["structuredContent"]["status"], "partial");
    }

    #[test]
    fn oversized_query_results_are_pruned_by_rows() {
        let rows: Vec<Value> = (0..5_000)
            .map(|i| json!([i, format!("customer-{i}"), "2024-01-01T00:00:00Z"]))
            .collect();
        let envelope = json!({
            "status": "complete",
            "phase": "final",
            "tool": "execute_query",
            "data": { "data": { "cols": [{ "name": "id" }], "rows": rows }, "row_count": 5_000 }
        });
        let limited = enforce_tool_payload_limit("execute_query", envelope);
        assert!(serialized_json_size_bytes(&limited) <= TOOL_ENVELOPE_MAX_BYTES);
        assert_eq!(limited["truncation"]["strategy"], "row_pruning");
        let data = &limited["data"]["data"];
        assert_eq!(data["rows_truncated"], true);
        assert_eq!(data["row_count_total"], 5_000);
        assert_eq!(
            data["rows"].as_array().unwrap().len() as u64,
            data["rows_returned"].as_u64().unwrap()
        );
        assert_eq!(data["cols"][0]["name"], "id");
    }

    #[test]
    fn oversized_non_tabular_payloads_collapse_to_summary() {
        let big: Vec<Value> = (0..5_000)
            .map(|i| json!({ "id": i, "name": "x".repeat(20) }))
            .collect();
        let envelope = json!({
            "status": "complete",
            "phase": "final",
            "tool": "list_cards",
            "data": big
        });
        let limited = enforce_tool_payload_limit("list_cards", envelope);
        assert_eq!(limited["truncation"]["strategy"], "summary_only");
        assert_eq!(limited["data_summary"]["item_count"], 5_000);
    }

    #[tokio::test]
    async fn reads_both_stdio_framings() {
        let input = "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n\
                     Content-Length: 37\r\n\r\n{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"x\"}";
        let mut reader = BufReader::new(input.as_bytes());

        let first = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(first.framing, Framing::Newline);
        assert_eq!(first.payload.unwrap()["id"], 1);

        let second = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(second.framing, Framing::ContentLength);
        assert_eq!(second.payload.unwrap()["id"], 2);

        assert!(read_message(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_json_line_is_reported_not_fatal() {
        let mut reader = BufReader::new("{not json}\n".as_bytes());
        let frame = read_message(&mut reader).await.unwrap().unwrap();
        let err = frame.payload.unwrap_err();
        assert_eq!(parse_error_response(&err)["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn replies_use_the_request_framing() {
        let mut out = Vec::new();
        write_message(&mut out, &json!({ "ok": true }), Framing::Newline)
            .await
            .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "{\"ok\":true}\n");

        let mut framed = Vec::new();
        write_message(&mut framed, &json!({ "ok": true }), Framing::ContentLength)
            .await
            .unwrap();
        let text = String::from_utf8(framed).unwrap();
        assert!(text.starts_with("Content-Length: 11\r\n"));
        assert!(text.ends_with("\r\n\r\n{\"ok\":true}"));
    }
}
