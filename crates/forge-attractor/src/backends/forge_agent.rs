use crate::storage::{ContextId, TurnId};
use crate::{
    AttractorError, AttractorStageToAgentLinkRecord, AttractorStorageWriter, CxdbPersistenceMode,
    Graph, Node, NodeOutcome, NodeStatus, RuntimeContext,
    handlers::codergen::{CodergenBackend, CodergenBackendResult},
    hooks::{ToolHookBridge, ToolHookSummary, resolve_tool_hook_commands},
};
use async_trait::async_trait;
use forge_agent::{
    AgentError, Session, SessionPersistenceSnapshot, SubmitOptions, SubmitResult, ToolCallHook,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

#[async_trait]
pub trait AgentSubmitter: Send {
    async fn submit_with_result(
        &mut self,
        user_input: String,
        options: SubmitOptions,
    ) -> Result<SubmitResult, AgentError>;

    fn thread_key(&self) -> Option<&str>;

    fn set_thread_key(&mut self, thread_key: Option<String>);

    fn session_id(&self) -> &str;

    fn set_tool_call_hook(&mut self, hook: Option<Arc<dyn ToolCallHook>>);

    async fn persistence_snapshot(&mut self) -> Result<SessionPersistenceSnapshot, AgentError>;
}

#[async_trait]
impl AgentSubmitter for Session {
    async fn submit_with_result(
        &mut self,
        user_input: String,
        options: SubmitOptions,
    ) -> Result<SubmitResult, AgentError> {
        Session::submit_with_result(self, user_input, options).await
    }

    fn thread_key(&self) -> Option<&str> {
        Session::thread_key(self)
    }

    fn set_thread_key(&mut self, thread_key: Option<String>) {
        Session::set_thread_key(self, thread_key);
    }

    fn session_id(&self) -> &str {
        Session::id(self)
    }

    fn set_tool_call_hook(&mut self, hook: Option<Arc<dyn ToolCallHook>>) {
        Session::set_tool_call_hook(self, hook);
    }

    async fn persistence_snapshot(&mut self) -> Result<SessionPersistenceSnapshot, AgentError> {
        Session::persistence_snapshot(self).await
    }
}

#[derive(Clone, Debug)]
pub struct ForgeAgentCodergenAdapter {
    base_options: SubmitOptions,
}

impl Default for ForgeAgentCodergenAdapter {
    fn default() -> Self {
        Self {
            base_options: SubmitOptions::default(),
        }
    }
}

impl ForgeAgentCodergenAdapter {
    pub fn new(base_options: SubmitOptions) -> Self {
        Self { base_options }
    }

    pub fn submit_options_for_node(&self, node: &Node) -> SubmitOptions {
        let mut options = self.base_options.clone();
        if let Some(provider) = node.attrs.get_str("llm_provider") {
            if !provider.trim().is_empty() {
                options.provider = Some(provider.trim().to_string());
            }
        }
        if let Some(model) = node.attrs.get_str("llm_model") {
            if !model.trim().is_empty() {
                options.model = Some(model.trim().to_string());
            }
        }
        if let Some(reasoning) = node.attrs.get_str("reasoning_effort") {
            if !reasoning.trim().is_empty() {
                options.reasoning_effort = Some(reasoning.trim().to_ascii_lowercase());
            }
        }
        options
    }

    pub fn build_prompt(&self, node: &Node, graph: &Graph) -> String {
        let mut prompt = node.attrs.get_str("prompt").unwrap_or_default().to_string();
        if prompt.trim().is_empty() {
            prompt = node
                .attrs
                .get_str("label")
                .filter(|label| !label.trim().is_empty())
                .unwrap_or(node.id.as_str())
                .to_string();
        }
        if let Some(goal) = graph.attrs.get_str("goal") {
            prompt = prompt.replace("$goal", goal);
        }
        prompt
    }

    pub async fn execute_with_submitter(
        &self,
        submitter: &mut (dyn AgentSubmitter + Send),
        node: &Node,
        context: &RuntimeContext,
        graph: &Graph,
        stage_attempt_id: &str,
    ) -> Result<NodeOutcome, AttractorError> {
        submitter.set_thread_key(resolve_thread_key(node, context));

        let prompt = self.build_prompt(node, graph);
        let mut options = self.submit_options_for_node(node);
        options.metadata = Some(stage_metadata(node, stage_attempt_id));

        match submitter.submit_with_result(prompt, options).await {
            Ok(result) => Ok(map_submit_result_to_outcome(
                node,
                submitter.thread_key(),
                result,
            )),
            Err(error) => Ok(NodeOutcome::failure(error.to_string())),
        }
    }

    pub async fn execute_prompt_with_submitter(
        &self,
        submitter: &mut (dyn AgentSubmitter + Send),
        node: &Node,
        context: &RuntimeContext,
        prompt: String,
        stage_attempt_id: &str,
    ) -> Result<NodeOutcome, AttractorError> {
        submitter.set_thread_key(resolve_thread_key(node, context));

        let mut options = self.submit_options_for_node(node);
        options.metadata = Some(stage_metadata(node, stage_attempt_id));

        match submitter.submit_with_result(prompt, options).await {
            Ok(result) => Ok(map_submit_result_to_outcome(
                node,
                submitter.thread_key(),
                result,
            )),
            Err(error) => Ok(NodeOutcome::failure(error.to_string())),
        }
    }
}

pub struct ForgeAgentSessionBackend {
    adapter: ForgeAgentCodergenAdapter,
    submitter: Mutex<Box<dyn AgentSubmitter + Send>>,
    stage_link: Option<StageLinkConfig>,
}

#[derive(Clone)]
struct StageLinkConfig {
    writer: Arc<dyn AttractorStorageWriter>,
    mode: CxdbPersistenceMode,
}

impl ForgeAgentSessionBackend {
    pub fn new(
        adapter: ForgeAgentCodergenAdapter,
        submitter: Box<dyn AgentSubmitter + Send>,
    ) -> Self {
        Self {
            adapter,
            submitter: Mutex::new(submitter),
            stage_link: None,
        }
    }

    pub fn with_stage_link_writer(
        mut self,
        writer: Arc<dyn AttractorStorageWriter>,
        mode: CxdbPersistenceMode,
    ) -> Self {
        self.stage_link = Some(StageLinkConfig { writer, mode });
        self
    }
}

#[async_trait]
impl CodergenBackend for ForgeAgentSessionBackend {
    async fn run(
        &self,
        node: &Node,
        prompt: &str,
        context: &RuntimeContext,
        graph: &Graph,
    ) -> Result<CodergenBackendResult, AttractorError> {
        let stage_attempt_id = context
            .get("stage_attempt_id")
            .and_then(Value::as_str)
            .unwrap_or("attempt:1");
        let run_id = context
            .get("internal.lineage.root_run_id")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .or_else(|| {
                context
                    .get("run_id")
                    .and_then(Value::as_str)
                    .map(ToOwned::to_owned)
            })
            .unwrap_or_else(|| "unknown-run".to_string());
        let hook_commands = resolve_tool_hook_commands(node, graph);
        let mut submitter = self.submitter.lock().await;
        let hook_bridge = if hook_commands.is_empty() {
            None
        } else {
            Some(Arc::new(ToolHookBridge::new(
                run_id.clone(),
                node.id.clone(),
                stage_attempt_id.to_string(),
                hook_commands,
            )))
        };
        submitter.set_tool_call_hook(
            hook_bridge
                .as_ref()
                .map(|bridge| bridge.clone() as Arc<dyn ToolCallHook>),
        );
        let outcome = self
            .adapter
            .execute_prompt_with_submitter(
                submitter.as_mut(),
                node,
                context,
                prompt.to_string(),
                stage_attempt_id,
            )
            .await?;
        if let Some(stage_link) = self.stage_link.as_ref() {
            if let Err(error) = emit_stage_link_if_available(
                stage_link,
                submitter.as_mut(),
                context,
                run_id.as_str(),
                node.id.as_str(),
                stage_attempt_id,
            )
            .await
            {
                if stage_link.mode == CxdbPersistenceMode::Required {
                    submitter.set_tool_call_hook(None);
                    return Err(error);
                }
            }
        }
        submitter.set_tool_call_hook(None);
        let outcome = if let Some(bridge) = hook_bridge.as_ref() {
            apply_tool_hook_summary(outcome, bridge.summary())
        } else {
            outcome
        };
        Ok(CodergenBackendResult::Outcome(outcome))
    }
}

pub struct StageLinkEmission<'a> {
    pub writer: Arc<dyn AttractorStorageWriter>,
    pub context_id: &'a ContextId,
    pub run_id: &'a str,
    pub node_id: &'a str,
    pub stage_attempt_id: &'a str,
    pub agent_session_id: &'a str,
    pub agent_context_id: &'a ContextId,
    pub agent_head_turn_id: Option<TurnId>,
    pub parent_turn_id: Option<TurnId>,
    pub sequence_no: u64,
    pub thread_key: Option<String>,
}

fn encode_idempotency_part(part: &str) -> String {
    format!("{}:{}", part.len(), part)
}

fn attractor_idempotency_key(
    run_id: &str,
    node_id: &str,
    stage_attempt_id: &str,
    event_kind: &str,
    sequence_no: u64,
) -> String {
    format!(
        "forge-attractor:v1|{}|{}|{}|{}|{}",
        encode_idempotency_part(run_id),
        encode_idempotency_part(node_id),
        encode_idempotency_part(stage_attempt_id),
        encode_idempotency_part(event_kind),
        sequence_no
    )
}

pub async fn emit_stage_to_agent_link(
    request: StageLinkEmission<'_>,
) -> Result<(), AttractorError> {
    let record = AttractorStageToAgentLinkRecord {
        timestamp: timestamp_now(),
        run_id: request.run_id.to_string(),
        pipeline_context_id: request.context_id.clone(),
        node_id: request.node_id.to_string(),
        stage_attempt_id: request.stage_attempt_id.to_string(),
        agent_session_id: request.agent_session_id.to_string(),
        agent_context_id: request.agent_context_id.clone(),
        agent_head_turn_id: request.agent_head_turn_id,
        parent_turn_id: request.parent_turn_id,
        sequence_no: request.sequence_no,
        thread_key: request.thread_key,
    };
    let key = attractor_idempotency_key(
        request.run_id,
        request.node_id,
        request.stage_attempt_id,
        "stage_to_agent_link",
        request.sequence_no,
    );
    request
        .writer
        .append_stage_to_agent_link(request.context_id, record, key)
        .await?;
    Ok(())
}

async fn emit_stage_link_if_available(
    config: &StageLinkConfig,
    submitter: &mut (dyn AgentSubmitter + Send),
    context: &RuntimeContext,
    run_id: &str,
    node_id: &str,
    stage_attempt_id: &str,
) -> Result<(), AttractorError> {
    let Some(pipeline_context_id) = context
        .get("pipeline_context_id")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
    else {
        return Ok(());
    };

    let snapshot = submitter
        .persistence_snapshot()
        .await
        .map_err(|error| AttractorError::Runtime(error.to_string()))?;
    let Some(agent_context_id) = snapshot.context_id else {
        return Ok(());
    };

    let parent_turn_id = context
        .get("pipeline_parent_turn_id")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned);
    let sequence_no = context
        .get("pipeline_stage_link_sequence_no")
        .and_then(Value::as_u64)
        .unwrap_or(0);

    emit_stage_to_agent_link(StageLinkEmission {
        writer: config.writer.clone(),
        context_id: &pipeline_context_id,
        run_id,
        node_id,
        stage_attempt_id,
        agent_session_id: submitter.session_id(),
        agent_context_id: &agent_context_id,
        agent_head_turn_id: snapshot.head_turn_id,
        parent_turn_id,
        sequence_no,
        thread_key: submitter.thread_key().map(ToOwned::to_owned),
    })
    .await
}

fn stage_metadata(node: &Node, stage_attempt_id: &str) -> HashMap<String, String> {
    HashMap::from([
        ("node_id".to_string(), node.id.clone()),
        ("stage_attempt_id".to_string(), stage_attempt_id.to_string()),
    ])
}

fn resolve_thread_key(node: &Node, context: &RuntimeContext) -> Option<String> {
    if let Some(mode) = context
        .get("internal.fidelity.mode")
        .and_then(Value::as_str)
        .map(str::trim)
    {
        if !mode.is_empty() && mode != "full" {
            return None;
        }
    }

    if let Some(thread_key) = context
        .get("internal.fidelity.thread_key")
        .and_then(Value::as_str)
        .map(str::trim)
    {
        if !thread_key.is_empty() {
            return Some(thread_key.to_string());
        }
    }

    if let Some(thread_id) = node.attrs.get_str("thread_id") {
        if !thread_id.trim().is_empty() {
            return Some(thread_id.trim().to_string());
        }
    }
    context
        .get("thread_key")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
}

fn map_submit_result_to_outcome(
    node: &Node,
    active_thread_key: Option<&str>,
    result: SubmitResult,
) -> NodeOutcome {
    let mut updates = RuntimeContext::new();
    updates.insert("last_stage".to_string(), Value::String(node.id.clone()));
    updates.insert(
        "last_response".to_string(),
        Value::String(truncate(&result.assistant_text, 200)),
    );
    updates.insert(
        "agent.tool_call_count".to_string(),
        Value::Number((result.tool_call_count as u64).into()),
    );
    updates.insert(
        "agent.tool_error_count".to_string(),
        Value::Number((result.tool_error_count as u64).into()),
    );
    if let Some(thread) = active_thread_key.or(result.thread_key.as_deref()) {
        updates.insert("thread_key".to_string(), Value::String(thread.to_string()));
    }

    let status = if result.tool_error_count > 0 {
        NodeStatus::PartialSuccess
    } else {
        NodeStatus::Success
    };
    let notes = if result.tool_error_count > 0 {
        Some(format!(
            "completed with {} tool error(s)",
            result.tool_error_count
        ))
    } else {
        Some(format!("Stage completed: {}", node.id))
    };

    NodeOutcome {
        status,
        notes,
        context_updates: updates,
        preferred_label: None,
        suggested_next_ids: Vec::new(),
    }
}

fn apply_tool_hook_summary(mut outcome: NodeOutcome, summary: ToolHookSummary) -> NodeOutcome {
    let summary_json = serde_json::to_value(&summary).unwrap_or_else(|_| Value::Null);
    outcome
        .context_updates
        .insert("tool_hooks.summary".to_string(), summary_json);
    let summary_suffix = format!(
        "hooks(pre ok={}, pre skip={}, pre error={}, post ok={}, post non_zero={}, post error={})",
        summary.pre_ok,
        summary.pre_skip,
        summary.pre_error,
        summary.post_ok,
        summary.post_non_zero,
        summary.post_error
    );
    outcome.notes = Some(match outcome.notes.take() {
        Some(notes) if !notes.trim().is_empty() => format!("{notes}; {summary_suffix}"),
        _ => summary_suffix,
    });
    outcome
}

fn truncate(input: &str, max_len: usize) -> String {
    input.chars().take(max_len).collect()
}

fn timestamp_now() -> String {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!(
        "{}.{:03}Z",
        since_epoch.as_secs(),
        since_epoch.subsec_millis()
    )
}
