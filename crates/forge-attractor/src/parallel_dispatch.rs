use crate::git_checkpoint::{GitCheckpointer, parallel_branch_name};
use crate::subgraph::{SubgraphConfig, SubgraphOutcome, SubgraphRunner};
use crate::{AttractorError, Edge, Graph, NodeExecutor, NodeOutcome, NodeStatus, RuntimeContext};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// One branch's outcome, persisted to `parallel_results.json` and consumed
/// by `handlers::parallel_fan_in`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParallelBranchResult {
    pub branch_key: String,
    pub branch_name: String,
    pub start_node_id: String,
    pub stop_node_id: String,
    pub head_sha: String,
    pub last_node_id: String,
    pub status: String,
    pub notes: Option<String>,
    pub context_updates: RuntimeContext,
    pub completed_nodes: Vec<String>,
    pub worktree_path: Option<String>,
    pub error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ParallelDispatchConfig {
    pub run_id: String,
    pub parallel_node_id: String,
    pub run_branch_prefix: String,
    pub max_parallel: usize,
    pub max_node_visits: u32,
    pub loop_restart_signature_limit: u32,
}

/// Finds the node where every branch edge's target reconverges: preferring
/// a `parallel.fan_in`-shaped node, falling back to any commonly-reachable
/// node, closest by max distance then sum of distances then lexical id.
pub fn find_join_node(graph: &Graph, branch_targets: &[String]) -> Option<String> {
    if branch_targets.is_empty() {
        return None;
    }
    let reachable: Vec<BTreeMap<String, u32>> = branch_targets
        .iter()
        .map(|start| bfs_distances(graph, start))
        .collect();
    let common: Vec<&String> = reachable[0]
        .keys()
        .filter(|id| reachable.iter().all(|distances| distances.contains_key(*id)))
        .collect();
    if common.is_empty() {
        return None;
    }
    let fan_in_candidates: Vec<&String> = common
        .iter()
        .copied()
        .filter(|id| is_fan_in_shape(graph, id))
        .collect();
    let pool = if !fan_in_candidates.is_empty() {
        fan_in_candidates
    } else {
        common
    };
    pool.into_iter()
        .min_by(|a, b| {
            let max_a = reachable.iter().map(|d| d[*a]).max().unwrap_or(0);
            let max_b = reachable.iter().map(|d| d[*b]).max().unwrap_or(0);
            let sum_a: u32 = reachable.iter().map(|d| d[*a]).sum();
            let sum_b: u32 = reachable.iter().map(|d| d[*b]).sum();
            max_a.cmp(&max_b).then(sum_a.cmp(&sum_b)).then(a.cmp(b))
        })
        .cloned()
}

fn bfs_distances(graph: &Graph, start: &str) -> BTreeMap<String, u32> {
    let mut distances = BTreeMap::new();
    let mut queue = VecDeque::new();
    distances.insert(start.to_string(), 0u32);
    queue.push_back(start.to_string());
    while let Some(current) = queue.pop_front() {
        let distance = distances[&current];
        for edge in graph.outgoing_edges(&current) {
            if !distances.contains_key(&edge.to) {
                distances.insert(edge.to.clone(), distance + 1);
                queue.push_back(edge.to.clone());
            }
        }
    }
    distances
}

fn is_fan_in_shape(graph: &Graph, node_id: &str) -> bool {
    let Some(node) = graph.nodes.get(node_id) else {
        return false;
    };
    if node.attrs.get_str("type").map(str::trim) == Some("parallel.fan_in") {
        return true;
    }
    node.attrs
        .get_str("shape")
        .map(|shape| shape.trim().eq_ignore_ascii_case("tripleoctagon"))
        .unwrap_or(false)
}

fn sanitize_ref_component(raw: &str) -> String {
    let sanitized: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    if sanitized.is_empty() { "branch".to_string() } else { sanitized }
}

/// Runs every branch edge to the join node concurrently, bounded by
/// `max_parallel`, each in its own git worktree when a `GitCheckpointer` is
/// configured. Always returns a `success` outcome (branch failures surface
/// through `parallel.results`, not the dispatcher's own status) unless the
/// pre-dispatch commit or branch setup itself errors.
pub async fn dispatch_parallel(
    graph: &Graph,
    branch_edges: &[&Edge],
    join_node_id: &str,
    context: &RuntimeContext,
    executor: &dyn NodeExecutor,
    git: Option<&Arc<GitCheckpointer>>,
    config: &ParallelDispatchConfig,
) -> Result<NodeOutcome, AttractorError> {
    if branch_edges.is_empty() {
        return Ok(NodeOutcome::success());
    }

    let base_sha = match git {
        Some(checkpointer) => {
            checkpointer
                .commit_allow_empty(&format!(
                    "attractor({}): {} (success)",
                    config.run_id, config.parallel_node_id
                ))
                .await?
        }
        None => String::new(),
    };

    let mut branch_plans = Vec::with_capacity(branch_edges.len());
    for edge in branch_edges {
        let branch_key = sanitize_ref_component(&edge.to);
        let branch_name = parallel_branch_name(
            &config.run_branch_prefix,
            &config.run_id,
            &config.parallel_node_id,
            &branch_key,
        );
        let worktree_path = if let Some(checkpointer) = git {
            let path = checkpointer
                .repo_root()
                .join(".attractor-worktrees")
                .join(&config.run_id)
                .join(&config.parallel_node_id)
                .join(&branch_key);
            let _ = checkpointer.worktree_remove(&path).await;
            checkpointer.force_branch(&branch_name, &base_sha).await?;
            checkpointer.worktree_add(&path, &branch_name).await?;
            checkpointer.reset_hard(&path, &base_sha).await?;
            Some(path)
        } else {
            None
        };
        branch_plans.push((*edge, branch_key, branch_name, worktree_path));
    }

    let max_parallel = config.max_parallel.max(1);
    let base_sha_ref = &base_sha;
    let mut results: Vec<ParallelBranchResult> = stream::iter(branch_plans.into_iter())
        .map(|(edge, branch_key, branch_name, worktree_path)| {
            let branch_context = context.clone();
            let cancel = Arc::new(AtomicBool::new(false));
            async move {
                let runner = SubgraphRunner::new(graph, executor, cancel);
                let sub_config = SubgraphConfig {
                    stop_node_id: join_node_id.to_string(),
                    max_node_visits: config.max_node_visits,
                    loop_restart_signature_limit: config.loop_restart_signature_limit,
                };
                let outcome = runner.run(&edge.to, branch_context, &sub_config).await;
                branch_result_from_outcome(
                    branch_key,
                    branch_name,
                    edge.to.clone(),
                    join_node_id.to_string(),
                    base_sha_ref.clone(),
                    worktree_path,
                    outcome,
                )
            }
        })
        .buffer_unordered(max_parallel)
        .collect()
        .await;

    results.sort_by(|a, b| {
        (a.branch_key.as_str(), a.start_node_id.as_str())
            .cmp(&(b.branch_key.as_str(), b.start_node_id.as_str()))
    });

    let results_json: Vec<Value> = results
        .iter()
        .map(|result| serde_json::to_value(result).unwrap_or(Value::Null))
        .collect();
    let mut context_updates = RuntimeContext::new();
    context_updates.insert("parallel.results".to_string(), Value::Array(results_json));
    context_updates.insert(
        "parallel.join_node".to_string(),
        Value::String(join_node_id.to_string()),
    );
    context_updates.insert("parallel.base_sha".to_string(), Value::String(base_sha));

    Ok(NodeOutcome {
        status: NodeStatus::Success,
        notes: Some(format!(
            "dispatched {} branch(es) to join node '{join_node_id}'",
            results.len()
        )),
        context_updates,
        preferred_label: None,
        suggested_next_ids: vec![join_node_id.to_string()],
    })
}

fn branch_result_from_outcome(
    branch_key: String,
    branch_name: String,
    start_node_id: String,
    stop_node_id: String,
    head_sha: String,
    worktree_path: Option<PathBuf>,
    outcome: Result<SubgraphOutcome, AttractorError>,
) -> ParallelBranchResult {
    let worktree_path = worktree_path.map(|path| path.to_string_lossy().to_string());
    match outcome {
        Ok(SubgraphOutcome::Reached { node_id, context, node_outcomes }) => ParallelBranchResult {
            branch_key,
            branch_name,
            start_node_id,
            stop_node_id,
            head_sha,
            last_node_id: node_id,
            status: "success".to_string(),
            notes: node_outcomes.values().last().and_then(|outcome| outcome.notes.clone()),
            context_updates: context,
            completed_nodes: node_outcomes.keys().cloned().collect(),
            worktree_path,
            error: None,
        },
        Ok(SubgraphOutcome::Aborted { reason, context, node_outcomes }) => ParallelBranchResult {
            branch_key,
            branch_name,
            start_node_id,
            stop_node_id,
            head_sha,
            last_node_id: node_outcomes.keys().next_back().cloned().unwrap_or_default(),
            status: "fail".to_string(),
            notes: Some(reason),
            context_updates: context,
            completed_nodes: node_outcomes.keys().cloned().collect(),
            worktree_path,
            error: None,
        },
        Ok(SubgraphOutcome::Canceled) => ParallelBranchResult {
            branch_key,
            branch_name,
            start_node_id,
            stop_node_id,
            head_sha,
            last_node_id: String::new(),
            status: "fail".to_string(),
            notes: Some("canceled".to_string()),
            context_updates: RuntimeContext::new(),
            completed_nodes: Vec::new(),
            worktree_path,
            error: None,
        },
        Err(error) => ParallelBranchResult {
            branch_key,
            branch_name,
            start_node_id,
            stop_node_id,
            head_sha,
            last_node_id: String::new(),
            status: "fail".to_string(),
            notes: None,
            context_updates: RuntimeContext::new(),
            completed_nodes: Vec::new(),
            worktree_path,
            error: Some(error.to_string()),
        },
    }
}
