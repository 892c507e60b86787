use crate::{
    AgentError, EventEmitter, ExecutionEnvironment, GrepOptions, SessionConfig, SessionEvent,
    ToolError, truncate_tool_output,
};
use forge_llm::{ToolCall, ToolDefinition, ToolResult};
use futures::future::join_all;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type ToolFuture = Pin<Box<dyn Future<Output = Result<String, AgentError>> + Send>>;
pub type ToolExecutor =
    Arc<dyn Fn(Value, Arc<dyn ExecutionEnvironment>) -> ToolFuture + Send + Sync>;

#[derive(Clone)]
pub struct ToolDispatchOptions {
    pub session_id: String,
    pub supports_parallel_tool_calls: bool,
}

#[derive(Clone)]
pub struct RegisteredTool {
    pub definition: ToolDefinition,
    pub executor: ToolExecutor,
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn register(&mut self, tool: RegisteredTool) {
        self.tools.insert(tool.definition.name.clone(), tool);
    }

    pub fn unregister(&mut self, name: &str) -> Option<RegisteredTool> {
        self.tools.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| tool.definition.clone())
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub async fn dispatch(
        &self,
        tool_calls: Vec<ToolCall>,
        execution_env: Arc<dyn ExecutionEnvironment>,
        config: &SessionConfig,
        event_emitter: Arc<dyn EventEmitter>,
        options: ToolDispatchOptions,
    ) -> Result<Vec<ToolResult>, AgentError> {
        if options.supports_parallel_tool_calls && tool_calls.len() > 1 {
            let futures = tool_calls.into_iter().map(|tool_call| {
                self.dispatch_single(
                    tool_call,
                    execution_env.clone(),
                    config,
                    event_emitter.clone(),
                    &options.session_id,
                )
            });
            return Ok(join_all(futures)
                .await
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?);
        }

        let mut results = Vec::with_capacity(tool_calls.len());
        for tool_call in tool_calls {
            results.push(
                self.dispatch_single(
                    tool_call,
                    execution_env.clone(),
                    config,
                    event_emitter.clone(),
                    &options.session_id,
                )
                .await?,
            );
        }
        Ok(results)
    }

    async fn dispatch_single(
        &self,
        tool_call: ToolCall,
        execution_env: Arc<dyn ExecutionEnvironment>,
        config: &SessionConfig,
        event_emitter: Arc<dyn EventEmitter>,
        session_id: &str,
    ) -> Result<ToolResult, AgentError> {
        event_emitter.emit(SessionEvent::tool_call_start(
            session_id.to_string(),
            tool_call.name.clone(),
            tool_call.id.clone(),
        ))?;

        let Some(registered) = self.get(&tool_call.name) else {
            let message = format!("Unknown tool: {}", tool_call.name);
            event_emitter.emit(SessionEvent::tool_call_end_error(
                session_id.to_string(),
                tool_call.id.clone(),
                message.clone(),
            ))?;
            return Ok(tool_error_result(tool_call.id, message));
        };

        let parsed_arguments = match parse_tool_arguments(&tool_call) {
            Ok(arguments) => arguments,
            Err(error) => {
                event_emitter.emit(SessionEvent::tool_call_end_error(
                    session_id.to_string(),
                    tool_call.id.clone(),
                    error.to_string(),
                ))?;
                return Ok(tool_error_result(tool_call.id, error.to_string()));
            }
        };
        let parsed_arguments = normalize_tool_arguments_for_dispatch(
            &tool_call.name,
            parsed_arguments,
            &registered.definition.parameters,
            config,
        );

        if let Err(error) =
            validate_tool_arguments(&registered.definition.parameters, &parsed_arguments)
        {
            event_emitter.emit(SessionEvent::tool_call_end_error(
                session_id.to_string(),
                tool_call.id.clone(),
                error.to_string(),
            ))?;
            return Ok(tool_error_result(tool_call.id, error.to_string()));
        }

        let raw_output = match (registered.executor)(parsed_arguments, execution_env).await {
            Ok(output) => output,
            Err(error) => {
                let error_text = error.to_string();
                event_emitter.emit(SessionEvent::tool_call_end_error(
                    session_id.to_string(),
                    tool_call.id.clone(),
                    error_text.clone(),
                ))?;
                return Ok(tool_error_result(tool_call.id, error_text));
            }
        };

        if !raw_output.is_empty() {
            event_emitter.emit(SessionEvent::tool_call_output_delta(
                session_id.to_string(),
                tool_call.id.clone(),
                raw_output.clone(),
            ))?;
        }
        let truncated = truncate_tool_output(&raw_output, &tool_call.name, config);
        event_emitter.emit(SessionEvent::tool_call_end_output(
            session_id.to_string(),
            tool_call.id.clone(),
            raw_output,
        ))?;

        Ok(ToolResult {
            tool_call_id: tool_call.id,
            content: Value::String(truncated),
            is_error: false,
        })
    }
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
    registry.register(apply_patch_tool());
    registry
}

pub fn build_anthropic_tool_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::default();
    register_shared_core_tools(&mut registry);
    register_subagent_tools(&mut registry);
    registry.register(edit_file_tool());
    registry
}

pub fn build_gemini_tool_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::default();
    register_shared_core_tools(&mut registry);
    register_subagent_tools(&mut registry);
    registry.register(edit_file_tool());
    registry
}

pub fn register_shared_core_tools(registry: &mut ToolRegistry) {
    registry.register(read_file_tool());
    registry.register(write_file_tool());
    registry.register(shell_tool());
    registry.register(grep_tool());
    registry.register(glob_tool());
}

pub fn register_subagent_tools(registry: &mut ToolRegistry) {
    registry.register(spawn_agent_tool());
    registry.register(send_input_tool());
    registry.register(wait_tool());
    registry.register(close_agent_tool());
}

fn read_file_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: READ_FILE_TOOL.to_string(),
            description: "Read a file from the filesystem. Returns line-numbered content."
                .to_string(),
            parameters: json!({
                "type": "object",
                "required": ["file_path"],
                "properties": {
                    "file_path": { "type": "string" },
                    "offset": { "type": "integer" },
                    "limit": { "type": "integer" }
                },
                "additionalProperties": false
            }),
        },
        executor: Arc::new(|args, env| {
            Box::pin(async move {
                let file_path = required_string_argument(&args, "file_path")?;
                let offset = optional_usize_argument(&args, "offset")?;
                let limit = optional_usize_argument(&args, "limit")?;

                let content = env.read_file(&file_path, offset, limit).await?;
                Ok(format_line_numbered_content(&content, offset.unwrap_or(1)))
            })
        }),
    }
}

fn write_file_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: WRITE_FILE_TOOL.to_string(),
            description:
                "Write content to a file. Creates the file and parent directories if needed."
                    .to_string(),
            parameters: json!({
                "type": "object",
                "required": ["file_path", "content"],
                "properties": {
                    "file_path": { "type": "string" },
                    "content": { "type": "string" }
                },
                "additionalProperties": false
            }),
        },
        executor: Arc::new(|args, env| {
            Box::pin(async move {
                let file_path = required_string_argument(&args, "file_path")?;
                let content = required_string_argument(&args, "content")?;
                env.write_file(&file_path, &content).await?;
                Ok(format!(
                    "Wrote {} bytes to {}",
                    content.as_bytes().len(),
                    file_path
                ))
            })
        }),
    }
}

fn shell_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: SHELL_TOOL.to_string(),
            description: "Execute a shell command. Returns stdout, stderr, and exit code."
                .to_string(),
            parameters: json!({
                "type": "object",
                "required": ["command"],
                "properties": {
                    "command": { "type": "string" },
                    "timeout_ms": { "type": "integer" },
                    "description": { "type": "string" }
                },
                "additionalProperties": false
            }),
        },
        executor: Arc::new(|args, env| {
            Box::pin(async move {
                let command = required_string_argument(&args, "command")?;
                let timeout_ms = optional_u64_argument(&args, "timeout_ms")?.unwrap_or(0);
                let result = env.exec_command(&command, timeout_ms, None, None).await?;
                Ok(format_exec_result(&result))
            })
        }),
    }
}

fn grep_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: GREP_TOOL.to_string(),
            description: "Search file contents using regex patterns.".to_string(),
            parameters: json!({
                "type": "object",
                "required": ["pattern"],
                "properties": {
                    "pattern": { "type": "string" },
                    "path": { "type": "string" },
                    "glob_filter": { "type": "string" },
                    "case_insensitive": { "type": "boolean" },
                    "max_results": { "type": "integer" }
                },
                "additionalProperties": false
            }),
        },
        executor: Arc::new(|args, env| {
            Box::pin(async move {
                let pattern = required_string_argument(&args, "pattern")?;
                let path = optional_string_argument(&args, "path")?.unwrap_or(".".to_string());
                let options = GrepOptions {
                    glob_filter: optional_string_argument(&args, "glob_filter")?,
                    case_insensitive: optional_bool_argument(&args, "case_insensitive")?
                        .unwrap_or(false),
                    max_results: optional_usize_argument(&args, "max_results")?.or(Some(100)),
                };

                let output = env.grep(&pattern, &path, options).await?;
                if output.trim().is_empty() {
                    Ok("No matches found".to_string())
                } else {
                    Ok(output)
                }
            })
        }),
    }
}

fn glob_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: GLOB_TOOL.to_string(),
            description: "Find files matching a glob pattern.".to_string(),
            parameters: json!({
                "type": "object",
                "required": ["pattern"],
                "properties": {
                    "pattern": { "type": "string" },
                    "path": { "type": "string" }
                },
                "additionalProperties": false
            }),
        },
        executor: Arc::new(|args, env| {
            Box::pin(async move {
                let pattern = required_string_argument(&args, "pattern")?;
                let path = optional_string_argument(&args, "path")?.unwrap_or(".".to_string());
                let matches = env.glob(&pattern, &path).await?;
                if matches.is_empty() {
                    Ok("No files matched".to_string())
                } else {
                    Ok(matches.join("\n"))
                }
            })
        }),
    }
}

fn spawn_agent_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: SPAWN_AGENT_TOOL.to_string(),
            description: "Spawn a subagent to handle a scoped task autonomously.".to_string(),
            parameters: json!({
                "type": "object",
                "required": ["task"],
                "properties": {
                    "task": { "type": "string" },
                    "working_dir": { "type": "string" },
                    "model": { "type": "string" },
                    "max_turns": { "type": "integer" }
                },
                "additionalProperties": false
            }),
        },
        executor: unsupported_subagent_executor(SPAWN_AGENT_TOOL),
    }
}

fn send_input_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: SEND_INPUT_TOOL.to_string(),
            description: "Send a message to a running subagent.".to_string(),
            parameters: json!({
                "type": "object",
                "required": ["agent_id", "message"],
                "properties": {
                    "agent_id": { "type": "string" },
                    "message": { "type": "string" }
                },
                "additionalProperties": false
            }),
        },
        executor: unsupported_subagent_executor(SEND_INPUT_TOOL),
    }
}

fn wait_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: WAIT_TOOL.to_string(),
            description: "Wait for a subagent to complete and return its result.".to_string(),
            parameters: json!({
                "type": "object",
                "required": ["agent_id"],
                "properties": {
                    "agent_id": { "type": "string" }
                },
                "additionalProperties": false
            }),
        },
        executor: unsupported_subagent_executor(WAIT_TOOL),
    }
}

fn close_agent_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: CLOSE_AGENT_TOOL.to_string(),
            description: "Terminate a subagent.".to_string(),
            parameters: json!({
                "type": "object",
                "required": ["agent_id"],
                "properties": {
                    "agent_id": { "type": "string" }
                },
                "additionalProperties": false
            }),
        },
        executor: unsupported_subagent_executor(CLOSE_AGENT_TOOL),
    }
}

fn unsupported_subagent_executor(tool_name: &'static str) -> ToolExecutor {
    Arc::new(move |_args, _env| {
        Box::pin(async move {
            Err(ToolError::Execution(format!(
                "{} can only run inside a live Session dispatcher",
                tool_name
            ))
            .into())
        })
    })
}

fn edit_file_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: EDIT_FILE_TOOL.to_string(),
            description: "Replace an exact string occurrence in a file.".to_string(),
            parameters: json!({
                "type": "object",
                "required": ["file_path", "old_string", "new_string"],
                "properties": {
                    "file_path": { "type": "string" },
                    "old_string": { "type": "string" },
                    "new_string": { "type": "string" },
                    "replace_all": { "type": "boolean" }
                },
                "additionalProperties": false
            }),
        },
        executor: Arc::new(|args, env| {
            Box::pin(async move {
                let file_path = required_string_argument(&args, "file_path")?;
                let old_string = required_string_argument(&args, "old_string")?;
                let new_string = required_string_argument(&args, "new_string")?;
                let replace_all = optional_bool_argument(&args, "replace_all")?.unwrap_or(false);
                if old_string.is_empty() {
                    return Err(
                        ToolError::Execution("old_string must not be empty".to_string()).into(),
                    );
                }

                let content = env.read_file(&file_path, None, None).await?;
                let replacement_count = content.match_indices(&old_string).count();
                if replacement_count == 0 {
                    return Err(ToolError::Execution(format!(
                        "old_string not found in '{}'",
                        file_path
                    ))
                    .into());
                }
                if replacement_count > 1 && !replace_all {
                    return Err(ToolError::Execution(format!(
                        "old_string is not unique in '{}': found {} matches; provide more context or set replace_all=true",
                        file_path, replacement_count
                    ))
                    .into());
                }

                let next_content = if replace_all {
                    content.replace(&old_string, &new_string)
                } else {
                    content.replacen(&old_string, &new_string, 1)
                };
                env.write_file(&file_path, &next_content).await?;

                Ok(format!(
                    "Updated {} ({} replacement{})",
                    file_path,
                    replacement_count,
                    if replacement_count == 1 { "" } else { "s" }
                ))
            })
        }),
    }
}

fn apply_patch_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: APPLY_PATCH_TOOL.to_string(),
            description: "Apply code changes using the patch format. Supports creating, deleting, and modifying files in a single operation.".to_string(),
            parameters: json!({
                "type": "object",
                "required": ["patch"],
                "properties": {
                    "patch": { "type": "string" }
                },
                "additionalProperties": false
            }),
        },
        executor: Arc::new(|args, env| {
            Box::pin(async move {
                let patch = required_string_argument(&args, "patch")?;
                let operations = parse_apply_patch(&patch)?;
                apply_patch_operations(&operations, env).await
            })
        }),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum PatchOperation {
    AddFile {
        path: String,
        lines: Vec<String>,
    },
    DeleteFile {
        path: String,
    },
    UpdateFile {
        path: String,
        move_to: Option<String>,
        hunks: Vec<PatchHunk>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct PatchHunk {
    header: String,
    lines: Vec<PatchHunkLine>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum PatchHunkLine {
    Context(String),
    Delete(String),
    Add(String),
    EndOfFile,
}

fn parse_apply_patch(patch: &str) -> Result<Vec<PatchOperation>, ToolError> {
    let lines: Vec<&str> = patch.lines().collect();
    if lines.first().copied() != Some("*** Begin Patch") {
        return Err(ToolError::Validation(
            "apply_patch payload must start with '*** Begin Patch'".to_string(),
        ));
    }
    if lines.last().copied() != Some("*** End Patch") {
        return Err(ToolError::Validation(
            "apply_patch payload must end with '*** End Patch'".to_string(),
        ));
    }

    let mut operations = Vec::new();
    let mut idx = 1usize;
    let end = lines.len().saturating_sub(1);
    while idx < end {
        let line = lines[idx];
        if line.trim().is_empty() {
            idx += 1;
            continue;
        }

        if let Some(path) = line.strip_prefix("*** Add File: ") {
            idx += 1;
            let mut added = Vec::new();
            while idx < end && !is_patch_operation_start(lines[idx]) {
                let Some(payload) = lines[idx].strip_prefix('+') else {
                    return Err(ToolError::Validation(format!(
                        "invalid add-file line: '{}'",
                        lines[idx]
                    )));
                };
                added.push(payload.to_string());
                idx += 1;
            }
            operations.push(PatchOperation::AddFile {
                path: path.to_string(),
                lines: added,
            });
            continue;
        }

        if let Some(path) = line.strip_prefix("*** Delete File: ") {
            operations.push(PatchOperation::DeleteFile {
                path: path.to_string(),
            });
            idx += 1;
            continue;
        }

        if let Some(path) = line.strip_prefix("*** Update File: ") {
            idx += 1;
            let mut move_to = None;
            if idx < end {
                if let Some(target) = lines[idx].strip_prefix("*** Move to: ") {
                    move_to = Some(target.to_string());
                    idx += 1;
                }
            }

            let mut hunks = Vec::new();
            while idx < end && !is_patch_operation_start(lines[idx]) {
                let header = lines[idx];
                if !header.starts_with("@@") {
                    return Err(ToolError::Validation(format!(
                        "invalid hunk header in update '{}': '{}'",
                        path, header
                    )));
                }
                idx += 1;

                let mut hunk_lines = Vec::new();
                while idx < end
                    && !is_patch_operation_start(lines[idx])
                    && !lines[idx].starts_with("@@")
                {
                    let hunk_line = lines[idx];
                    if hunk_line == "*** End of File" {
                        hunk_lines.push(PatchHunkLine::EndOfFile);
                        idx += 1;
                        continue;
                    }
                    let Some(prefix) = hunk_line.chars().next() else {
                        return Err(ToolError::Validation(
                            "empty hunk line is not allowed".to_string(),
                        ));
                    };
                    let value = hunk_line[1..].to_string();
                    let parsed = match prefix {
                        ' ' => PatchHunkLine::Context(value),
                        '-' => PatchHunkLine::Delete(value),
                        '+' => PatchHunkLine::Add(value),
                        _ => {
                            return Err(ToolError::Validation(format!(
                                "invalid hunk line prefix '{}' in '{}'",
                                prefix, hunk_line
                            )));
                        }
                    };
                    hunk_lines.push(parsed);
                    idx += 1;
                }

                if hunk_lines.is_empty() {
                    return Err(ToolError::Validation(format!(
                        "empty hunk in update '{}'",
                        path
                    )));
                }
                hunks.push(PatchHunk {
                    header: header.to_string(),
                    lines: hunk_lines,
                });
            }

            if hunks.is_empty() {
                return Err(ToolError::Validation(format!(
                    "update operation for '{}' must include at least one hunk",
                    path
                )));
            }

            operations.push(PatchOperation::UpdateFile {
                path: path.to_string(),
                move_to,
                hunks,
            });
            continue;
        }

        return Err(ToolError::Validation(format!(
            "unknown patch operation line: '{}'",
            line
        )));
    }

    if operations.is_empty() {
        return Err(ToolError::Validation(
            "patch must contain at least one operation".to_string(),
        ));
    }

    Ok(operations)
}

fn is_patch_operation_start(line: &str) -> bool {
    line.starts_with("*** Add File: ")
        || line.starts_with("*** Delete File: ")
        || line.starts_with("*** Update File: ")
}

async fn apply_patch_operations(
    operations: &[PatchOperation],
    env: Arc<dyn ExecutionEnvironment>,
) -> Result<String, AgentError> {
    let mut summaries = Vec::new();
    for operation in operations {
        match operation {
            PatchOperation::AddFile { path, lines } => {
                if env.file_exists(path).await? {
                    return Err(
                        ToolError::Execution(format!("file already exists: '{}'", path)).into(),
                    );
                }
                env.write_file(path, &lines.join("\n")).await?;
                summaries.push(format!("A {}", path));
            }
            PatchOperation::DeleteFile { path } => {
                if !env.file_exists(path).await? {
                    return Err(ToolError::Execution(format!("file not found: '{}'", path)).into());
                }
                env.delete_file(path).await?;
                summaries.push(format!("D {}", path));
            }
            PatchOperation::UpdateFile {
                path,
                move_to,
                hunks,
            } => {
                if !env.file_exists(path).await? {
                    return Err(ToolError::Execution(format!(
                        "cannot update missing file '{}'",
                        path
                    ))
                    .into());
                }

                let original = env.read_file(path, None, None).await?;
                let updated = apply_hunks_to_content(&original, hunks).map_err(AgentError::from)?;

                let move_target = move_to.as_deref().filter(|target| *target != path.as_str());
                if let Some(target_path) = move_target {
                    if env.file_exists(target_path).await? {
                        return Err(ToolError::Execution(format!(
                            "move target already exists: '{}'",
                            target_path
                        ))
                        .into());
                    }
                    env.write_file(path, &updated).await?;
                    env.move_file(path, target_path).await?;
                    summaries.push(format!("R {} -> {}", path, target_path));
                } else {
                    env.write_file(path, &updated).await?;
                    summaries.push(format!("M {}", path));
                }
            }
        }
    }

    Ok(format!("Applied patch:\n{}", summaries.join("\n")))
}

fn apply_hunks_to_content(content: &str, hunks: &[PatchHunk]) -> Result<String, ToolError> {
    let mut lines = split_content_lines(content);
    let had_trailing_newline = content.ends_with('\n');
    let mut search_from = 0usize;

    for hunk in hunks {
        let (old_lines, new_lines) = hunk_old_new_lines(hunk);
        if old_lines.is_empty() {
            let insert_at = search_from.min(lines.len());
            lines.splice(insert_at..insert_at, new_lines.clone());
            search_from = insert_at + new_lines.len();
            continue;
        }

        let position = find_subsequence(&lines, &old_lines, search_from)
            .or_else(|| find_subsequence(&lines, &old_lines, 0))
            .ok_or_else(|| {
                ToolError::Execution(format!("failed to match hunk '{}'", hunk.header))
            })?;
        let end = position + old_lines.len();
        lines.splice(position..end, new_lines.clone());
        search_from = position + new_lines.len();
    }

    let mut updated = lines.join("\n");
    if had_trailing_newline {
        updated.push('\n');
    }
    Ok(updated)
}

fn split_content_lines(content: &str) -> Vec<String> {
    if content.is_empty() {
        return Vec::new();
    }

    let mut lines: Vec<String> = content.split('\n').map(str::to_string).collect();
    if content.ends_with('\n') && lines.last().is_some_and(String::is_empty) {
        lines.pop();
    }
    lines
}

fn hunk_old_new_lines(hunk: &PatchHunk) -> (Vec<String>, Vec<String>) {
    let mut old_lines = Vec::new();
    let mut new_lines = Vec::new();
    for line in &hunk.lines {
        match line {
            PatchHunkLine::Context(value) => {
                old_lines.push(value.clone());
                new_lines.push(value.clone());
            }
            PatchHunkLine::Delete(value) => old_lines.push(value.clone()),
            PatchHunkLine::Add(value) => new_lines.push(value.clone()),
            PatchHunkLine::EndOfFile => {}
        }
    }
    (old_lines, new_lines)
}

fn find_subsequence(haystack: &[String], needle: &[String], start: usize) -> Option<usize> {
    if needle.is_empty() {
        return Some(start.min(haystack.len()));
    }
    if start >= haystack.len() || needle.len() > haystack.len() {
        return None;
    }

    let limit = haystack.len().saturating_sub(needle.len());
    for idx in start..=limit {
        if haystack[idx..idx + needle.len()] == *needle {
            return Some(idx);
        }
    }
    None
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
