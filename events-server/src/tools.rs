// Tool schema definitions
//
// Tools for driving a debug session's watchpoints and listening for their events

use crate::protocol::Tool;
use serde_json::{json, Value};

fn tool(name: &str, description: &str, input_schema: Value) -> Tool {
    Tool {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
    }
}

fn event_list_schema(description: &str) -> Value {
    json!({
        "type": "array",
        "items": {
            "type": "string",
            "enum": [
                "added", "removed", "enabled", "disabled", "command-changed",
                "condition-changed", "ignore-changed", "thread-changed", "type-changed"
            ]
        },
        "description": description
    })
}

pub fn get_tools() -> Vec<Tool> {
    vec![
        tool(
            "session.create_target",
            "Create a debug target with its own event broadcaster",
            json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "Target name (e.g., 'a.out')" }
                },
                "required": ["name"]
            }),
        ),
        tool(
            "listener.create",
            "Create a listener that queues events until they are consumed",
            json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "Diagnostic name", "default": "listener" }
                }
            }),
        ),
        tool(
            "listener.subscribe",
            "Subscribe a listener to a target's watchpoint events. Replaces the previous mask unless 'union' is set",
            json!({
                "type": "object",
                "properties": {
                    "listener_id": { "type": "string" },
                    "target_id": { "type": "integer" },
                    "events": event_list_schema("Event types to receive (default: all)"),
                    "union": {
                        "type": "boolean",
                        "description": "Add to the existing subscription instead of replacing it",
                        "default": false
                    }
                },
                "required": ["listener_id", "target_id"]
            }),
        ),
        tool(
            "listener.unsubscribe",
            "Remove a listener's subscription, or narrow it by the given event types",
            json!({
                "type": "object",
                "properties": {
                    "listener_id": { "type": "string" },
                    "target_id": { "type": "integer" },
                    "events": event_list_schema("Event types to stop receiving (default: all)")
                },
                "required": ["listener_id", "target_id"]
            }),
        ),
        tool(
            "listener.wait",
            "Wait for the next queued event, up to a timeout",
            json!({
                "type": "object",
                "properties": {
                    "listener_id": { "type": "string" },
                    "timeout_ms": { "type": "integer", "default": 1000 }
                },
                "required": ["listener_id"]
            }),
        ),
        tool(
            "listener.peek",
            "Show the oldest queued event, optionally only from one target and of given types, without consuming it",
            json!({
                "type": "object",
                "properties": {
                    "listener_id": { "type": "string" },
                    "target_id": { "type": "integer" },
                    "events": event_list_schema("Event types to match (default: all)")
                },
                "required": ["listener_id"]
            }),
        ),
        tool(
            "listener.next",
            "Pop the next queued event without waiting",
            json!({
                "type": "object",
                "properties": {
                    "listener_id": { "type": "string" }
                },
                "required": ["listener_id"]
            }),
        ),
        tool(
            "listener.destroy",
            "Destroy a listener and unregister it everywhere",
            json!({
                "type": "object",
                "properties": {
                    "listener_id": { "type": "string" }
                },
                "required": ["listener_id"]
            }),
        ),
        tool(
            "watch.add",
            "Add a watchpoint on a memory range",
            json!({
                "type": "object",
                "properties": {
                    "target_id": { "type": "integer" },
                    "address": { "type": "integer", "description": "Start address" },
                    "size": { "type": "integer", "description": "Bytes to watch (1, 2, 4 or 8)", "default": 4 },
                    "read": { "type": "boolean", "default": false },
                    "write": { "type": "boolean", "default": true }
                },
                "required": ["target_id", "address"]
            }),
        ),
        tool(
            "watch.remove",
            "Remove a watchpoint",
            json!({
                "type": "object",
                "properties": {
                    "target_id": { "type": "integer" },
                    "watchpoint_id": { "type": "integer" }
                },
                "required": ["target_id", "watchpoint_id"]
            }),
        ),
        tool(
            "watch.set_enabled",
            "Enable or disable a watchpoint",
            json!({
                "type": "object",
                "properties": {
                    "target_id": { "type": "integer" },
                    "watchpoint_id": { "type": "integer" },
                    "enabled": { "type": "boolean" }
                },
                "required": ["target_id", "watchpoint_id", "enabled"]
            }),
        ),
        tool(
            "watch.set_ignore_count",
            "Set how many hits a watchpoint ignores before stopping",
            json!({
                "type": "object",
                "properties": {
                    "target_id": { "type": "integer" },
                    "watchpoint_id": { "type": "integer" },
                    "count": { "type": "integer" }
                },
                "required": ["target_id", "watchpoint_id", "count"]
            }),
        ),
        tool(
            "watch.set_condition",
            "Set or clear (empty string) a watchpoint's stop condition",
            json!({
                "type": "object",
                "properties": {
                    "target_id": { "type": "integer" },
                    "watchpoint_id": { "type": "integer" },
                    "condition": { "type": "string" }
                },
                "required": ["target_id", "watchpoint_id", "condition"]
            }),
        ),
        tool(
            "watch.list",
            "List a target's watchpoints",
            json!({
                "type": "object",
                "properties": {
                    "target_id": { "type": "integer" }
                },
                "required": ["target_id"]
            }),
        ),
    ]
}
