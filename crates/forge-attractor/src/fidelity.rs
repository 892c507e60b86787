use crate::{Edge, Graph};

pub const DEFAULT_FIDELITY: &str = "compact";

pub fn is_valid_fidelity_mode(mode: &str) -> bool {
    matches!(
        mode,
        "full" | "truncate" | "compact" | "summary:low" | "summary:medium" | "summary:high"
    )
}

pub fn find_incoming_edge<'a>(
    graph: &'a Graph,
    target_node_id: &str,
    previous_node_id: Option<&'a str>,
) -> Option<&'a Edge> {
    let from = previous_node_id?;
    graph
        .outgoing_edges(from)
        .find(|edge| edge.to == target_node_id)
}

pub fn resolve_fidelity_mode(
    graph: &Graph,
    target_node_id: &str,
    incoming_edge: Option<&Edge>,
) -> String {
    if let Some(edge) = incoming_edge {
        if let Some(fidelity) = edge.attrs.get_str("fidelity") {
            let trimmed = fidelity.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }

    if let Some(node) = graph.nodes.get(target_node_id) {
        if let Some(fidelity) = node.attrs.get_str("fidelity") {
            let trimmed = fidelity.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }

    if let Some(fidelity) = graph.attrs.get_str("default_fidelity") {
        let trimmed = fidelity.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    DEFAULT_FIDELITY.to_string()
}

pub fn resolve_thread_key(
    graph: &Graph,
    target_node_id: &str,
    incoming_edge: Option<&Edge>,
    previous_node_id: Option<&str>,
) -> Option<String> {
    let node = graph.nodes.get(target_node_id)?;

    if let Some(thread_id) = node.attrs.get_str("thread_id") {
        let trimmed = thread_id.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }

    if let Some(edge) = incoming_edge {
        if let Some(thread_id) = edge.attrs.get_str("thread_id") {
            let trimmed = thread_id.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }

    for key in ["thread_id", "default_thread_id"] {
        if let Some(thread_id) = graph.attrs.get_str(key) {
            let trimmed = thread_id.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }

    if let Some(class_attr) = node.attrs.get_str("class") {
        if let Some(class_name) = class_attr
            .split(',')
            .map(|entry| entry.trim())
            .find(|entry| !entry.is_empty())
        {
            return Some(class_name.to_string());
        }
    }

    previous_node_id.map(ToOwned::to_owned)
}
