use crate::{Edge, Graph, NodeOutcome, RuntimeContext, evaluate_condition_expression};

pub fn select_next_edge<'a>(
    graph: &'a Graph,
    from_node_id: &'a str,
    outcome: &NodeOutcome,
    context: &RuntimeContext,
) -> Option<&'a Edge> {
    let edges: Vec<&Edge> = graph.outgoing_edges(from_node_id).collect();
    if edges.is_empty() {
        return None;
    }

    let condition_matched = condition_matched_edges(&edges, outcome, context);
    let eligible = eligible_edges(&edges, outcome, context);

    // Step 1: condition match narrows the pool; steps 2-5 still run against
    // that pool so a handler hint is never overridden by an arbitrary
    // weight/lexical tiebreak.
    let pool: Vec<&Edge> = if !condition_matched.is_empty() {
        condition_matched
    } else {
        eligible
    };
    if pool.len() == 1 {
        return Some(pool[0]);
    }

    // Step 2: preferred label, scanned across the whole pool.
    if let Some(preferred) = outcome.preferred_label.as_ref() {
        let preferred = normalize_label(preferred);
        if let Some(edge) = pool.iter().find(|edge| {
            normalize_label(edge.attrs.get_str("label").unwrap_or_default()) == preferred
        }) {
            return Some(*edge);
        }
    }

    // Step 3: suggested next ids, scanned across the whole pool.
    if !outcome.suggested_next_ids.is_empty() {
        for suggested in &outcome.suggested_next_ids {
            if let Some(edge) = pool.iter().find(|edge| edge.to == *suggested) {
                return Some(*edge);
            }
        }
    }

    // Step 4/5: weight then lexical within the pool.
    if !pool.is_empty() {
        return best_by_weight_then_lexical(pool.iter().copied());
    }

    // Fallback: all edges are conditional but none matched; pick any edge.
    best_by_weight_then_lexical(edges.iter().copied())
}

/// All outgoing edges whose handler-hint tiebreaks should be considered
/// together: the matched conditional pool, or all unconditional/true edges
/// when no condition matched. Used by MainLoop to detect implicit fan-out
/// (more than one edge eligible at once).
pub fn select_all_eligible_edges<'a>(
    graph: &'a Graph,
    from_node_id: &'a str,
    outcome: &NodeOutcome,
    context: &RuntimeContext,
) -> Vec<&'a Edge> {
    let edges: Vec<&Edge> = graph.outgoing_edges(from_node_id).collect();
    if edges.is_empty() {
        return Vec::new();
    }
    let condition_matched = condition_matched_edges(&edges, outcome, context);
    if !condition_matched.is_empty() {
        return condition_matched;
    }
    let eligible = eligible_edges(&edges, outcome, context);
    if !eligible.is_empty() {
        return eligible;
    }
    edges
}

fn condition_matched_edges<'a>(
    edges: &[&'a Edge],
    outcome: &NodeOutcome,
    context: &RuntimeContext,
) -> Vec<&'a Edge> {
    edges
        .iter()
        .copied()
        .filter(|edge| {
            let condition = edge.attrs.get_str("condition").unwrap_or_default().trim();
            !condition.is_empty()
                && evaluate_condition_expression(condition, outcome, context).unwrap_or(false)
        })
        .collect()
}

fn eligible_edges<'a>(
    edges: &[&'a Edge],
    outcome: &NodeOutcome,
    context: &RuntimeContext,
) -> Vec<&'a Edge> {
    edges
        .iter()
        .copied()
        .filter(|edge| {
            let condition = edge.attrs.get_str("condition").unwrap_or_default().trim();
            condition.is_empty()
                || evaluate_condition_expression(condition, outcome, context).unwrap_or(false)
        })
        .collect()
}

fn best_by_weight_then_lexical<'a, I>(edges: I) -> Option<&'a Edge>
where
    I: IntoIterator<Item = &'a Edge>,
{
    edges.into_iter().max_by(|left, right| {
        edge_weight(left)
            .cmp(&edge_weight(right))
            .then_with(|| right.to.cmp(&left.to))
    })
}

fn edge_weight(edge: &Edge) -> i64 {
    edge.attrs
        .get("weight")
        .and_then(|value| value.as_i64())
        .unwrap_or(0)
}

fn normalize_label(input: &str) -> String {
    let trimmed = input.trim().to_ascii_lowercase();

    if trimmed.starts_with('[') {
        if let Some((_, rest)) = trimmed.split_once(']') {
            return rest.trim().to_string();
        }
    }

    let bytes = trimmed.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphanumeric() && bytes[1] == b')' {
        return trimmed[2..].trim().to_string();
    }

    if bytes.len() >= 3 && bytes[0].is_ascii_alphanumeric() && bytes[1] == b' ' && bytes[2] == b'-'
    {
        return trimmed[3..].trim().to_string();
    }

    trimmed
}
