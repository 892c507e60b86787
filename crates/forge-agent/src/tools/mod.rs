mod apply_patch;
mod edit_file;
mod glob;
mod grep;
mod read_file;
mod registry;
mod shell;
mod subagents;
mod write_file;

use crate::{SessionConfig, ToolError};
use forge_llm::{ToolCall, ToolResult};
use serde_json::Value;

pub use registry::{RegisteredTool, ToolDispatchOptions, ToolExecutor, ToolFuture, ToolRegistry};

pub const READ_FILE_TOOL: &str = "read_file";
pub const WRITE_FILE_TOOL: &str = "write_file";
pub const EDIT_FILE_TOOL: &str = "edit_file";
pub const APPLY_PATCH_TOOL: &str = "apply_patch";
pub const SHELL_TOOL: &str = "shell";
pub const GREP_TOOL: &str = "grep";
pub const GLOB_TOOL: &str = "glob";
pub const SPAWN_AGENT_TOOL: &str = "spawn_agent";
pub const SEND_INPUT_TOOL: &str = "send_input";
pub const WAIT_TOOL: &str = "wait";
pub const CLOSE_AGENT_TOOL: &str = "close_agent";

pub fn build_openai_tool_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::default();
    register_shared_core_tools(&mut registry);
    register_subagent_tools(&mut registry);
    registry.register(apply_patch::apply_patch_tool());
    registry
}

pub fn build_anthropic_tool_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::default();
    register_shared_core_tools(&mut registry);
    register_subagent_tools(&mut registry);
    registry.register(edit_file::edit_file_tool());
    registry
}

pub fn build_gemini_tool_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::default();
    register_shared_core_tools(&mut registry);
    register_subagent_tools(&mut registry);
    registry.register(edit_file::edit_file_tool());
    registry
}

pub fn register_shared_core_tools(registry: &mut ToolRegistry) {
    registry.register(read_file::read_file_tool());
    registry.register(write_file::write_file_tool());
    registry.register(shell::shell_tool());
    registry.register(grep::grep_tool());
    registry.register(glob::glob_tool());
}

pub fn register_subagent_tools(registry: &mut ToolRegistry) {
    registry.register(subagents::spawn_agent_tool());
    registry.register(subagents::send_input_tool());
    registry.register(subagents::wait_tool());
    registry.register(subagents::close_agent_tool());
}

fn normalize_tool_arguments_for_dispatch(
    tool_name: &str,
    arguments: Value,
    schema: &Value,
    config: &SessionConfig,
) -> Value {
    if tool_name != SHELL_TOOL {
        return arguments;
    }

    let has_timeout_property = schema
        .get("properties")
        .and_then(Value::as_object)
        .and_then(|properties| properties.get("timeout_ms"))
        .is_some();
    if !has_timeout_property {
        return arguments;
    }

    let Some(object) = arguments.as_object() else {
        return arguments;
    };
    let mut normalized = object.clone();
    let (default_timeout_ms, max_timeout_ms) = effective_shell_timeout_policy(config);

    let timeout_ms = match normalized.get("timeout_ms") {
        Some(Value::Number(number)) => {
            if let Some(value) = number.as_u64() {
                value.min(max_timeout_ms)
            } else {
                return Value::Object(normalized);
            }
        }
        Some(_) => return Value::Object(normalized),
        None => default_timeout_ms,
    };

    normalized.insert("timeout_ms".to_string(), Value::from(timeout_ms));
    Value::Object(normalized)
}

fn effective_shell_timeout_policy(config: &SessionConfig) -> (u64, u64) {
    let default_timeout_ms = if config.default_command_timeout_ms == 0 {
        10_000
    } else {
        config.default_command_timeout_ms
    };
    let max_timeout_ms = if config.max_command_timeout_ms == 0 {
        600_000
    } else {
        config.max_command_timeout_ms
    };
    let max_timeout_ms = max_timeout_ms.max(default_timeout_ms);
    (default_timeout_ms, max_timeout_ms)
}
fn required_string_argument(arguments: &Value, key: &str) -> Result<String, ToolError> {
    optional_string_argument(arguments, key)?
        .ok_or_else(|| ToolError::Validation(format!("missing required argument '{}'", key)))
}

fn optional_string_argument(arguments: &Value, key: &str) -> Result<Option<String>, ToolError> {
    let Some(value) = arguments.get(key) else {
        return Ok(None);
    };
    let Some(value) = value.as_str() else {
        return Err(ToolError::Validation(format!(
            "argument '{}' must be a string",
            key
        )));
    };
    Ok(Some(value.to_string()))
}

fn optional_bool_argument(arguments: &Value, key: &str) -> Result<Option<bool>, ToolError> {
    let Some(value) = arguments.get(key) else {
        return Ok(None);
    };
    let Some(value) = value.as_bool() else {
        return Err(ToolError::Validation(format!(
            "argument '{}' must be a boolean",
            key
        )));
    };
    Ok(Some(value))
}

fn optional_u64_argument(arguments: &Value, key: &str) -> Result<Option<u64>, ToolError> {
    let Some(value) = arguments.get(key) else {
        return Ok(None);
    };
    let Some(value) = value.as_u64() else {
        return Err(ToolError::Validation(format!(
            "argument '{}' must be a positive integer",
            key
        )));
    };
    Ok(Some(value))
}

fn optional_usize_argument(arguments: &Value, key: &str) -> Result<Option<usize>, ToolError> {
    Ok(optional_u64_argument(arguments, key)?.map(|value| value as usize))
}

fn format_line_numbered_content(content: &str, start_line: usize) -> String {
    if content.is_empty() {
        return String::new();
    }
    content
        .lines()
        .enumerate()
        .map(|(idx, line)| format!("{} | {}", start_line + idx, line))
        .collect::<Vec<String>>()
        .join("\n")
}

fn format_exec_result(result: &crate::ExecResult) -> String {
    let mut output = format!(
        "exit_code: {}\nduration_ms: {}",
        result.exit_code, result.duration_ms
    );
    if !result.stdout.is_empty() {
        output.push_str("\nstdout:\n");
        output.push_str(&result.stdout);
    }
    if !result.stderr.is_empty() {
        output.push_str("\nstderr:\n");
        output.push_str(&result.stderr);
    }
    output
}

fn tool_error_result(tool_call_id: String, message: String) -> ToolResult {
    ToolResult {
        tool_call_id,
        content: Value::String(message),
        is_error: true,
    }
}

fn parse_tool_arguments(tool_call: &ToolCall) -> Result<Value, ToolError> {
    if let Some(raw_arguments) = &tool_call.raw_arguments {
        let parsed = serde_json::from_str::<Value>(raw_arguments).map_err(|error| {
            ToolError::Validation(format!(
                "invalid JSON arguments for tool '{}': {}",
                tool_call.name, error
            ))
        })?;
        return Ok(parsed);
    }

    Ok(tool_call.arguments.clone())
}

fn validate_tool_arguments(schema: &Value, arguments: &Value) -> Result<(), ToolError> {
    let object = arguments
        .as_object()
        .ok_or_else(|| ToolError::Validation("tool arguments must be a JSON object".to_string()))?;

    let schema_object = schema.as_object().ok_or_else(|| {
        ToolError::Validation("tool schema root must be a JSON object".to_string())
    })?;

    if schema_object
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|schema_type| schema_type != "object")
    {
        return Err(ToolError::Validation(
            "tool schema root type must be 'object'".to_string(),
        ));
    }

    if let Some(required) = schema_object.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(key) {
                return Err(ToolError::Validation(format!(
                    "missing required argument '{}'",
                    key
                )));
            }
        }
    }

    let properties = schema_object
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let additional_allowed = schema_object
        .get("additionalProperties")
        .and_then(Value::as_bool)
        .unwrap_or(true);

    for (key, value) in object {
        let Some(property) = properties.get(key) else {
            if additional_allowed {
                continue;
            }
            return Err(ToolError::Validation(format!(
                "unexpected argument '{}' not allowed by schema",
                key
            )));
        };

        if let Some(type_name) = property.get("type").and_then(Value::as_str) {
            let is_valid = match type_name {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                "null" => value.is_null(),
                _ => true,
            };

            if !is_valid {
                return Err(ToolError::Validation(format!(
                    "argument '{}' expected type '{}' but received '{}'",
                    key,
                    type_name,
                    json_type_name(value)
                )));
            }
        }
    }

    Ok(())
}

fn json_type_name(value: &Value) -> &'static str {
    if value.is_null() {
        "null"
    } else if value.is_boolean() {
        "boolean"
    } else if value.is_string() {
        "string"
    } else if value.is_number() {
        "number"
    } else if value.is_array() {
        "array"
    } else {
        "object"
    }
}
