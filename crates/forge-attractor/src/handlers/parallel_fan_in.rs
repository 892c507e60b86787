use crate::failure::{self, FailureClass};
use crate::{
    AttractorError, Graph, Node, NodeOutcome, NodeStatus, RuntimeContext, handlers::NodeHandler,
};
use async_trait::async_trait;
use serde_json::{Value, json};

#[derive(Clone, Debug)]
struct Candidate {
    branch_key: String,
    branch_name: String,
    head_sha: String,
    status: NodeStatus,
    notes: Option<String>,
}

#[derive(Debug, Default)]
pub struct ParallelFanInHandler;

#[async_trait]
impl NodeHandler for ParallelFanInHandler {
    async fn execute(
        &self,
        _node: &Node,
        context: &RuntimeContext,
        _graph: &Graph,
    ) -> Result<NodeOutcome, AttractorError> {
        let Some(results) = context.get("parallel.results").and_then(Value::as_array) else {
            return Ok(NodeOutcome::failure(
                "No parallel results to evaluate".to_string(),
            ));
        };
        if results.is_empty() {
            return Ok(NodeOutcome::failure(
                "No parallel results to evaluate".to_string(),
            ));
        }

        let mut candidates: Vec<Candidate> =
            results.iter().filter_map(candidate_from_value).collect();
        if candidates.is_empty() {
            return Ok(NodeOutcome::failure(
                "No parseable parallel results to evaluate".to_string(),
            ));
        }

        candidates.sort_by(|left, right| {
            rank_status(left.status)
                .cmp(&rank_status(right.status))
                .then_with(|| left.branch_key.cmp(&right.branch_key))
                .then_with(|| left.head_sha.cmp(&right.head_sha))
        });

        let all_failed = candidates
            .iter()
            .all(|candidate| candidate.status == NodeStatus::Fail);

        if all_failed {
            let classes: Vec<FailureClass> = candidates
                .iter()
                .map(|candidate| {
                    failure::classify(&NodeOutcome::failure(
                        candidate.notes.clone().unwrap_or_default(),
                    ))
                })
                .collect();
            let aggregate_class = if classes
                .iter()
                .all(|class| *class == FailureClass::TransientInfra)
            {
                FailureClass::TransientInfra
            } else {
                FailureClass::Deterministic
            };
            let mut pairs: Vec<String> = candidates
                .iter()
                .map(|candidate| {
                    format!(
                        "{}:{}",
                        candidate.branch_key,
                        candidate.notes.clone().unwrap_or_default()
                    )
                })
                .collect();
            pairs.sort();
            let signature = truncate_chars(
                &format!(
                    "parallel_all_failed|{}|branches={}|{}",
                    aggregate_class.as_str(),
                    candidates.len(),
                    pairs.join(",")
                ),
                512,
            );

            let mut updates = RuntimeContext::new();
            updates.insert(
                "parallel.fan_in.candidate_count".to_string(),
                Value::Number((candidates.len() as u64).into()),
            );
            updates.insert(
                "meta.failure_class".to_string(),
                Value::String(aggregate_class.as_str().to_string()),
            );
            updates.insert(
                "meta.failure_signature".to_string(),
                Value::String(signature.clone()),
            );
            return Ok(NodeOutcome {
                status: NodeStatus::Fail,
                notes: Some(signature),
                context_updates: updates,
                preferred_label: None,
                suggested_next_ids: Vec::new(),
            });
        }

        let best = candidates
            .iter()
            .find(|candidate| candidate.status != NodeStatus::Fail)
            .expect("all_failed is false, so a non-fail candidate exists")
            .clone();

        let mut updates = RuntimeContext::new();
        updates.insert(
            "parallel.fan_in.best_id".to_string(),
            Value::String(best.branch_key.clone()),
        );
        updates.insert(
            "parallel.fan_in.best_outcome".to_string(),
            Value::String(best.status.as_str().to_string()),
        );
        updates.insert(
            "parallel.fan_in.winner_branch_name".to_string(),
            Value::String(best.branch_name.clone()),
        );
        updates.insert(
            "parallel.fan_in.winner_head_sha".to_string(),
            Value::String(best.head_sha.clone()),
        );
        updates.insert(
            "parallel.fan_in.candidate_count".to_string(),
            Value::Number((candidates.len() as u64).into()),
        );

        Ok(NodeOutcome {
            status: NodeStatus::Success,
            notes: Some(format!(
                "Selected best candidate: {} ({})",
                best.branch_key,
                best.status.as_str()
            )),
            context_updates: updates,
            preferred_label: None,
            suggested_next_ids: Vec::new(),
        })
    }
}

fn candidate_from_value(value: &Value) -> Option<Candidate> {
    let object = value.as_object()?;
    let branch_key = object
        .get("branch_key")
        .and_then(Value::as_str)
        .or_else(|| object.get("branch_id").and_then(Value::as_str))?
        .to_string();
    let branch_name = object
        .get("branch_name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let head_sha = object
        .get("head_sha")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let status = object
        .get("status")
        .and_then(Value::as_str)
        .and_then(parse_status)
        .unwrap_or(NodeStatus::Fail);
    let notes = object
        .get("notes")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .or_else(|| object.get("error").and_then(Value::as_str).map(ToOwned::to_owned));

    Some(Candidate {
        branch_key,
        branch_name,
        head_sha,
        status,
        notes,
    })
}

fn parse_status(value: &str) -> Option<NodeStatus> {
    match value.trim() {
        "success" => Some(NodeStatus::Success),
        "partial_success" => Some(NodeStatus::PartialSuccess),
        "retry" => Some(NodeStatus::Retry),
        "fail" => Some(NodeStatus::Fail),
        _ => None,
    }
}

fn rank_status(status: NodeStatus) -> u8 {
    match status {
        NodeStatus::Success => 0,
        NodeStatus::PartialSuccess => 1,
        NodeStatus::Retry => 2,
        NodeStatus::Fail => 3,
    }
}

fn truncate_chars(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        input.to_string()
    } else {
        input.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_dot;

    #[tokio::test(flavor = "current_thread")]
    async fn fan_in_selects_best_candidate_by_status_then_lexical_expected_success() {
        let graph = parse_dot("digraph G { n1 [shape=tripleoctagon] }").expect("graph parse");
        let node = graph.nodes.get("n1").expect("node exists");
        let mut context = RuntimeContext::new();
        context.insert(
            "parallel.results".to_string(),
            json!([
                {"branch_key": "a", "status": "partial_success", "head_sha": "aaa"},
                {"branch_key": "b", "status": "success", "head_sha": "ccc"},
                {"branch_key": "c", "status": "success", "head_sha": "bbb"}
            ]),
        );

        let outcome = ParallelFanInHandler
            .execute(node, &context, &graph)
            .await
            .expect("execute should succeed");

        assert_eq!(outcome.status, NodeStatus::Success);
        assert_eq!(
            outcome.context_updates.get("parallel.fan_in.best_id"),
            Some(&Value::String("b".to_string()))
        );
        assert_eq!(
            outcome.context_updates.get("parallel.fan_in.winner_head_sha"),
            Some(&Value::String("ccc".to_string()))
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fan_in_all_failed_expected_fail_with_signature() {
        let graph = parse_dot("digraph G { n1 [shape=tripleoctagon] }").expect("graph parse");
        let node = graph.nodes.get("n1").expect("node exists");
        let mut context = RuntimeContext::new();
        context.insert(
            "parallel.results".to_string(),
            json!([
                {"branch_key": "a", "status": "fail", "notes": "timeout contacting service"},
                {"branch_key": "b", "status": "fail", "notes": "timeout contacting service"}
            ]),
        );

        let outcome = ParallelFanInHandler
            .execute(node, &context, &graph)
            .await
            .expect("execute should succeed");

        assert_eq!(outcome.status, NodeStatus::Fail);
        assert!(
            outcome
                .notes
                .as_deref()
                .unwrap_or_default()
                .starts_with("parallel_all_failed|")
        );
    }
}
