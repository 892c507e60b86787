use crate::failure::{self, FailureClass};
use crate::routing::select_next_edge;
use crate::{AttractorError, Graph, NodeExecutor, NodeOutcome, NodeStatus, RuntimeContext};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Bounds one traversal performed by [`SubgraphRunner`]: where it stops, and
/// the two circuit breakers that keep a misbehaving subgraph from spinning
/// forever.
#[derive(Clone, Debug)]
pub struct SubgraphConfig {
    pub stop_node_id: String,
    pub max_node_visits: u32,
    pub loop_restart_signature_limit: u32,
}

#[derive(Clone, Debug)]
pub enum SubgraphOutcome {
    Reached {
        node_id: String,
        context: RuntimeContext,
        node_outcomes: BTreeMap<String, NodeOutcome>,
    },
    Aborted {
        reason: String,
        context: RuntimeContext,
        node_outcomes: BTreeMap<String, NodeOutcome>,
    },
    Canceled,
}

/// Linear traversal of a graph bounded by a stop node, used by
/// ParallelDispatcher to run one branch in isolation. Unlike the top-level
/// MainLoop, a subgraph never honors `loop_restart` (it has nowhere to
/// restart to) and aborts immediately on a structural failure rather than
/// attempting to route around it.
pub struct SubgraphRunner<'a> {
    graph: &'a Graph,
    executor: &'a dyn NodeExecutor,
    cancel: Arc<AtomicBool>,
}

impl<'a> SubgraphRunner<'a> {
    pub fn new(graph: &'a Graph, executor: &'a dyn NodeExecutor, cancel: Arc<AtomicBool>) -> Self {
        Self {
            graph,
            executor,
            cancel,
        }
    }

    pub async fn run(
        &self,
        start_node_id: &str,
        mut context: RuntimeContext,
        config: &SubgraphConfig,
    ) -> Result<SubgraphOutcome, AttractorError> {
        let mut visits: BTreeMap<String, u32> = BTreeMap::new();
        let mut signature_counts: BTreeMap<String, u32> = BTreeMap::new();
        let mut node_outcomes: BTreeMap<String, NodeOutcome> = BTreeMap::new();
        let mut current = start_node_id.to_string();

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                tracing::debug!(node = %current, "subgraph_canceled_exit");
                return Ok(SubgraphOutcome::Canceled);
            }

            if current == config.stop_node_id {
                return Ok(SubgraphOutcome::Reached {
                    node_id: current,
                    context,
                    node_outcomes,
                });
            }

            let visit_count = {
                let entry = visits.entry(current.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            if visit_count > config.max_node_visits {
                return Ok(SubgraphOutcome::Aborted {
                    reason: format!("node visit cap exceeded at '{current}'"),
                    context,
                    node_outcomes,
                });
            }

            let node = self.graph.nodes.get(&current).ok_or_else(|| {
                AttractorError::InvalidGraph(format!("unknown node '{current}' in subgraph"))
            })?;

            let outcome = self.executor.execute(node, &context, self.graph).await?;
            for (key, value) in &outcome.context_updates {
                context.insert(key.clone(), value.clone());
            }

            if outcome.status == NodeStatus::Fail {
                let class = failure::classify(&outcome);
                let reason = outcome.notes.clone().unwrap_or_default();
                if class == FailureClass::Structural {
                    node_outcomes.insert(current.clone(), outcome);
                    return Ok(SubgraphOutcome::Aborted {
                        reason: format!("structural failure at '{current}': {reason}"),
                        context,
                        node_outcomes,
                    });
                }

                let signature = failure::failure_signature(&current, class, &reason);
                let count = {
                    let entry = signature_counts.entry(signature.clone()).or_insert(0);
                    *entry += 1;
                    *entry
                };
                if count > config.loop_restart_signature_limit {
                    node_outcomes.insert(current.clone(), outcome);
                    return Ok(SubgraphOutcome::Aborted {
                        reason: format!("signature '{signature}' repeated {count} times"),
                        context,
                        node_outcomes,
                    });
                }
            }

            let next_edge = select_next_edge(self.graph, &current, &outcome, &context)
                .map(|edge| (edge.to.clone(), edge.attrs.get_bool("loop_restart") == Some(true)));
            node_outcomes.insert(current.clone(), outcome);

            match next_edge {
                Some((_, true)) => {
                    return Err(AttractorError::Runtime(format!(
                        "loop_restart is not permitted inside a subgraph (at '{current}')"
                    )));
                }
                Some((next_id, false)) => current = next_id,
                None => {
                    return Ok(SubgraphOutcome::Aborted {
                        reason: format!("no outgoing route from '{current}' before reaching stop node '{}'", config.stop_node_id),
                        context,
                        node_outcomes,
                    });
                }
            }
        }
    }
}
