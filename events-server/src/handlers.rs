// Request handlers
//
// Handles initialize, list tools, and session/listener/watchpoint tool calls

use crate::protocol::*;
use crate::session::SessionManager;
use crate::tools;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use watch_events::{
    Event, EventError, EventTypeMask, Listener, Target, WatchKind, WatchpointEventType,
    WatchpointId,
};

const DEFAULT_WAIT_MS: u64 = 1000;
// Requests are served one at a time, so a wait must not hold the loop forever
const MAX_WAIT_MS: u64 = 60_000;

pub struct RequestHandler {
    session_manager: SessionManager,
}

impl RequestHandler {
    pub fn new() -> Self {
        Self {
            session_manager: SessionManager::new(),
        }
    }

    pub async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let result = match request.method.as_str() {
            "initialize" => self.handle_initialize(request.params).await,
            "tools/list" => self.handle_list_tools(),
            "tools/call" => self.handle_call_tool(request.params).await,
            _ => Err(JsonRpcError {
                code: METHOD_NOT_FOUND,
                message: format!("Method not found: {}", request.method),
                data: None,
            }),
        };

        match result {
            Ok(value) => JsonRpcResponse {
                jsonrpc: "2.0".to_string(),
                id: request.id,
                result: Some(value),
                error: None,
            },
            Err(error) => JsonRpcResponse {
                jsonrpc: "2.0".to_string(),
                id: request.id,
                result: None,
                error: Some(error),
            },
        }
    }

    pub async fn handle_notification(&self, notification: JsonRpcNotification) {
        match notification.method.as_str() {
            "notifications/initialized" => {
                info!("Client initialized");
            }
            "notifications/cancelled" => {
                debug!("Request cancelled");
            }
            _ => {
                warn!("Unknown notification: {}", notification.method);
            }
        }
    }

    async fn handle_initialize(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: InitializeParams = serde_json::from_value(params.unwrap_or(json!({})))
            .map_err(|e| JsonRpcError {
                code: INVALID_PARAMS,
                message: format!("Invalid initialize params: {}", e),
                data: None,
            })?;

        self.session_manager
            .reset(params.session.unwrap_or_default())
            .await
            .map_err(|e| JsonRpcError {
                code: INVALID_PARAMS,
                message: e.to_string(),
                data: None,
            })?;

        let result = InitializeResult {
            protocol_version: "2024-11-05".to_string(),
            capabilities: ServerCapabilities {
                tools: ToolsCapability {},
            },
            server_info: ServerInfo {
                name: "watch-events-server".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            instructions: Some(
                "Watchpoint event server. Create a target with session.create_target \
                and a listener with listener.create, subscribe it with listener.subscribe, \
                then change watchpoints with watch.* and collect events with listener.wait."
                    .to_string(),
            ),
        };

        to_json(result)
    }

    fn handle_list_tools(&self) -> Result<Value, JsonRpcError> {
        to_json(ListToolsResult {
            tools: tools::get_tools(),
        })
    }

    async fn handle_call_tool(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let call_params: CallToolParams = serde_json::from_value(params.unwrap_or(json!({})))
            .map_err(|e| JsonRpcError {
                code: INVALID_PARAMS,
                message: format!("Invalid tool call params: {}", e),
                data: None,
            })?;

        let args = call_params.arguments;
        let result = match call_params.name.as_str() {
            "session.create_target" => self.handle_create_target(&args).await,
            "listener.create" => self.handle_create_listener(&args).await,
            "listener.subscribe" => self.handle_subscribe(&args).await,
            "listener.unsubscribe" => self.handle_unsubscribe(&args).await,
            "listener.wait" => self.handle_wait(&args).await,
            "listener.peek" => self.handle_peek(&args).await,
            "listener.next" => self.handle_next(&args).await,
            "listener.destroy" => self.handle_destroy_listener(&args).await,
            "watch.add" => self.handle_watch_add(&args).await,
            "watch.remove" => self.handle_watch_remove(&args).await,
            "watch.set_enabled" => self.handle_watch_set_enabled(&args).await,
            "watch.set_ignore_count" => self.handle_watch_set_ignore_count(&args).await,
            "watch.set_condition" => self.handle_watch_set_condition(&args).await,
            "watch.list" => self.handle_watch_list(&args).await,
            _ => Err(format!("Unknown tool: {}", call_params.name)),
        };

        let call_result = match result {
            Ok(text) => CallToolResult {
                content: vec![ContentBlock::Text { text }],
                is_error: None,
            },
            Err(text) => CallToolResult {
                content: vec![ContentBlock::Text { text }],
                is_error: Some(true),
            },
        };
        to_json(call_result)
    }

    async fn handle_create_target(&self, args: &Value) -> Result<String, String> {
        let name = str_arg(args, "name")?;
        let target = self.session_manager.session().await.create_target(name);
        Ok(format!(
            "Created target {} ({}), broadcaster {}",
            target.id(),
            target.name(),
            target.broadcaster().id()
        ))
    }

    async fn handle_create_listener(&self, args: &Value) -> Result<String, String> {
        let name = args
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("listener");
        let id = self.session_manager.create_listener(name).await;
        Ok(id)
    }

    async fn handle_subscribe(&self, args: &Value) -> Result<String, String> {
        let (listener_id, listener) = self.listener_arg(args).await?;
        let target = self.target_arg(args).await?;
        let mask = mask_arg(args)?;
        let union = args.get("union").and_then(|v| v.as_bool()).unwrap_or(false);

        let broadcaster = target.broadcaster();
        let subscribed = if union {
            listener.start_listening_for_events(broadcaster, mask)
        } else {
            broadcaster.subscribe(&listener, mask)
        };
        let mask = subscribed.map_err(|e| format!("Failed to subscribe: {}", e))?;

        Ok(format!(
            "{} subscribed to target {}: {}",
            listener_id,
            target.id(),
            mask
        ))
    }

    async fn handle_unsubscribe(&self, args: &Value) -> Result<String, String> {
        let (listener_id, listener) = self.listener_arg(args).await?;
        let target = self.target_arg(args).await?;
        let mask = mask_arg(args)?;

        let broadcaster = target.broadcaster();
        if !listener.stop_listening_for_events(broadcaster, mask) {
            return Ok(format!(
                "{} was not subscribed to {} on target {}",
                listener_id,
                mask,
                target.id()
            ));
        }

        let remaining = broadcaster
            .subscription_mask(&listener)
            .unwrap_or(EventTypeMask::NONE);
        Ok(format!(
            "{} now receives {} from target {}",
            listener_id,
            remaining,
            target.id()
        ))
    }

    async fn handle_wait(&self, args: &Value) -> Result<String, String> {
        let (_, listener) = self.listener_arg(args).await?;
        let timeout = timeout_arg(args);

        // The wait parks a thread, keep it off the runtime workers
        let event = tokio::task::spawn_blocking(move || listener.wait_for_event(timeout))
            .await
            .map_err(|e| format!("Wait task failed: {}", e))?;

        match event {
            Some(event) => format_event(&event),
            None => Ok(format!("No event within {} ms", timeout.as_millis())),
        }
    }

    async fn handle_peek(&self, args: &Value) -> Result<String, String> {
        let (_, listener) = self.listener_arg(args).await?;

        let event = if args.get("target_id").is_some() {
            let target = self.target_arg(args).await?;
            let mask = mask_arg(args)?;
            listener.peek_at_next_event_for_broadcaster_with_type(target.broadcaster(), mask)
        } else {
            listener.peek_at_next_event()
        };

        match event {
            Some(event) => format_event(&event),
            None => Ok("No matching event queued".to_string()),
        }
    }

    async fn handle_next(&self, args: &Value) -> Result<String, String> {
        let (_, listener) = self.listener_arg(args).await?;
        match listener.get_next_event() {
            Some(event) => format_event(&event),
            None => Ok("No event queued".to_string()),
        }
    }

    async fn handle_destroy_listener(&self, args: &Value) -> Result<String, String> {
        let listener_id = str_arg(args, "listener_id")?;
        if self.session_manager.remove_listener(listener_id).await {
            Ok(format!("Destroyed {}", listener_id))
        } else {
            Err(format!("{}: {}", EventError::InvalidListener, listener_id))
        }
    }

    async fn handle_watch_add(&self, args: &Value) -> Result<String, String> {
        let target = self.target_arg(args).await?;
        let address = u64_arg(args, "address")?;
        let size = size_arg(args)?;
        let kind = WatchKind {
            read: args.get("read").and_then(|v| v.as_bool()).unwrap_or(false),
            write: args.get("write").and_then(|v| v.as_bool()).unwrap_or(true),
        };

        let id = target
            .watchpoints()
            .add(address, size, kind)
            .map_err(|e| format!("Failed to add watchpoint: {}", e))?;
        Ok(format!("Watchpoint {} set at {:#x} ({} bytes, {})", id, address, size, kind))
    }

    async fn handle_watch_remove(&self, args: &Value) -> Result<String, String> {
        let target = self.target_arg(args).await?;
        let id = watchpoint_arg(args)?;
        let watchpoint = target
            .watchpoints()
            .remove(id)
            .map_err(|e| format!("Failed to remove watchpoint: {}", e))?;
        Ok(format!("Removed {}", watchpoint))
    }

    async fn handle_watch_set_enabled(&self, args: &Value) -> Result<String, String> {
        let target = self.target_arg(args).await?;
        let id = watchpoint_arg(args)?;
        let enabled = args
            .get("enabled")
            .and_then(|v| v.as_bool())
            .ok_or_else(|| "Missing 'enabled' parameter".to_string())?;

        let changed = target
            .watchpoints()
            .set_enabled(id, enabled)
            .map_err(|e| format!("Failed to update watchpoint: {}", e))?;
        Ok(describe_change(id, changed, if enabled { "enabled" } else { "disabled" }))
    }

    async fn handle_watch_set_ignore_count(&self, args: &Value) -> Result<String, String> {
        let target = self.target_arg(args).await?;
        let id = watchpoint_arg(args)?;
        let count = u64_arg(args, "count")?;
        let count = u32::try_from(count).map_err(|_| format!("Ignore count too large: {}", count))?;

        let changed = target
            .watchpoints()
            .set_ignore_count(id, count)
            .map_err(|e| format!("Failed to update watchpoint: {}", e))?;
        Ok(describe_change(id, changed, &format!("ignore count {}", count)))
    }

    async fn handle_watch_set_condition(&self, args: &Value) -> Result<String, String> {
        let target = self.target_arg(args).await?;
        let id = watchpoint_arg(args)?;
        let condition = str_arg(args, "condition")?;

        let changed = target
            .watchpoints()
            .set_condition(id, Some(condition))
            .map_err(|e| format!("Failed to update watchpoint: {}", e))?;
        let state = if condition.is_empty() {
            "condition cleared".to_string()
        } else {
            format!("condition '{}'", condition)
        };
        Ok(describe_change(id, changed, &state))
    }

    async fn handle_watch_list(&self, args: &Value) -> Result<String, String> {
        let target = self.target_arg(args).await?;
        let watchpoints = target.watchpoints().list();

        if watchpoints.is_empty() {
            return Ok("No watchpoints set".to_string());
        }

        let mut output = format!("{} watchpoint(s):\n", watchpoints.len());
        for watchpoint in &watchpoints {
            output.push_str(&format!("  {}\n", watchpoint));
        }
        Ok(output)
    }

    async fn target_arg(&self, args: &Value) -> Result<Arc<Target>, String> {
        let id = u64_arg(args, "target_id")?;
        let id = u32::try_from(id).map_err(|_| format!("Invalid target id: {}", id))?;
        self.session_manager
            .target(id)
            .await
            .ok_or_else(|| format!("Target not found: {}", id))
    }

    async fn listener_arg(&self, args: &Value) -> Result<(String, Listener), String> {
        let id = str_arg(args, "listener_id")?;
        let listener = self
            .session_manager
            .listener(id)
            .await
            .ok_or_else(|| format!("{}: {}", EventError::InvalidListener, id))?;
        Ok((id.to_string(), listener))
    }
}

fn to_json(value: impl serde::Serialize) -> Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| JsonRpcError {
        code: INTERNAL_ERROR,
        message: format!("Failed to serialize result: {}", e),
        data: None,
    })
}

fn str_arg<'a>(args: &'a Value, name: &str) -> Result<&'a str, String> {
    args.get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("Missing '{}' parameter", name))
}

fn u64_arg(args: &Value, name: &str) -> Result<u64, String> {
    args.get(name)
        .and_then(|v| v.as_u64())
        .ok_or_else(|| format!("Missing '{}' parameter", name))
}

fn watchpoint_arg(args: &Value) -> Result<WatchpointId, String> {
    let id = u64_arg(args, "watchpoint_id")?;
    u32::try_from(id)
        .map(WatchpointId)
        .map_err(|_| format!("Invalid watchpoint id: {}", id))
}

// Clamped to MAX_WAIT_MS
fn timeout_arg(args: &Value) -> Duration {
    let millis = args
        .get("timeout_ms")
        .and_then(|v| v.as_u64())
        .unwrap_or(DEFAULT_WAIT_MS);
    Duration::from_millis(millis.min(MAX_WAIT_MS))
}

fn size_arg(args: &Value) -> Result<usize, String> {
    let Some(size) = args.get("size").and_then(|v| v.as_u64()) else {
        return Ok(4);
    };
    usize::try_from(size).map_err(|_| format!("Invalid watchpoint size: {}", size))
}

// Missing "events" means every event type
fn mask_arg(args: &Value) -> Result<EventTypeMask, String> {
    let Some(events) = args.get("events") else {
        return Ok(EventTypeMask::ALL);
    };
    let names = events
        .as_array()
        .ok_or_else(|| "'events' must be an array of event type names".to_string())?;

    names
        .iter()
        .map(|name| {
            name.as_str()
                .and_then(WatchpointEventType::from_name)
                .ok_or_else(|| format!("Unknown event type: {}", name))
        })
        .collect()
}

fn describe_change(id: WatchpointId, changed: bool, state: &str) -> String {
    if changed {
        format!("Watchpoint {} {}", id, state)
    } else {
        format!("Watchpoint {} already {}, no change", id, state)
    }
}

fn format_event(event: &Event) -> Result<String, String> {
    serde_json::to_string_pretty(event).map_err(|e| format!("Failed to format event: {}", e))
}
