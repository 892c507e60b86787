use crate::AttractorError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

pub type RuntimeContext = BTreeMap<String, Value>;

const MAX_KEY_LENGTH: usize = 256;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub values: RuntimeContext,
    pub logs: Vec<String>,
}

#[derive(Clone, Default)]
pub struct ContextStore {
    inner: Arc<RwLock<ContextState>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct ContextState {
    values: RuntimeContext,
    logs: Vec<String>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(values: RuntimeContext) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ContextState {
                values,
                logs: Vec::new(),
            })),
        }
    }

    pub fn set(&self, key: impl Into<String>, value: Value) -> Result<(), AttractorError> {
        let key = key.into();
        validate_context_key(&key)?;
        let mut state = self
            .inner
            .write()
            .map_err(|_| AttractorError::Runtime("context write lock poisoned".to_string()))?;
        state.values.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>, AttractorError> {
        let state = self
            .inner
            .read()
            .map_err(|_| AttractorError::Runtime("context read lock poisoned".to_string()))?;
        Ok(state.values.get(key).cloned())
    }

    pub fn apply_updates(&self, updates: &RuntimeContext) -> Result<(), AttractorError> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut state = self
            .inner
            .write()
            .map_err(|_| AttractorError::Runtime("context write lock poisoned".to_string()))?;
        for (key, value) in updates {
            validate_context_key(key)?;
            state.values.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<(), AttractorError> {
        let mut state = self
            .inner
            .write()
            .map_err(|_| AttractorError::Runtime("context write lock poisoned".to_string()))?;
        state.values.remove(key);
        Ok(())
    }

    pub fn append_log(&self, entry: impl Into<String>) -> Result<(), AttractorError> {
        let mut state = self
            .inner
            .write()
            .map_err(|_| AttractorError::Runtime("context write lock poisoned".to_string()))?;
        state.logs.push(entry.into());
        Ok(())
    }

    pub fn snapshot(&self) -> Result<ContextSnapshot, AttractorError> {
        let state = self
            .inner
            .read()
            .map_err(|_| AttractorError::Runtime("context read lock poisoned".to_string()))?;
        Ok(ContextSnapshot {
            values: state.values.clone(),
            logs: state.logs.clone(),
        })
    }

    pub fn clone_isolated(&self) -> Result<Self, AttractorError> {
        let snapshot = self.snapshot()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(ContextState {
                values: snapshot.values,
                logs: snapshot.logs,
            })),
        })
    }
}

/// Builds the reset-but-partially-preserved context a loop restart starts
/// from: only `persist_keys` survive from the previous attempt's snapshot,
/// layered on top of the freshly mirrored graph attributes.
pub fn minimal_bag(
    persist_keys: &[String],
    previous_snapshot: &RuntimeContext,
    mirrored_graph_attrs: RuntimeContext,
) -> RuntimeContext {
    let mut context = mirrored_graph_attrs;
    for key in persist_keys {
        if let Some(value) = previous_snapshot.get(key) {
            context.insert(key.clone(), value.clone());
        }
    }
    context
}

/// Injects the `loop_restart.*` markers a restarted run's first node should
/// see.
pub fn inject_restart_markers(
    context: &mut RuntimeContext,
    iteration_count: u32,
    from_node: &str,
) {
    context.insert(
        "loop_restart.iteration_count".to_string(),
        Value::from(iteration_count),
    );
    context.insert(
        "loop_restart.from_node".to_string(),
        Value::String(from_node.to_string()),
    );
}

pub fn validate_context_key(key: &str) -> Result<(), AttractorError> {
    if key.is_empty() {
        return Err(AttractorError::Runtime(
            "context key cannot be empty".to_string(),
        ));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(AttractorError::Runtime(format!(
            "context key '{}' exceeds max length {}",
            key, MAX_KEY_LENGTH
        )));
    }

    for segment in key.split('.') {
        if segment.is_empty() {
            return Err(AttractorError::Runtime(format!(
                "context key '{}' contains an empty namespace segment",
                key
            )));
        }
        validate_key_segment(segment, key)?;
    }

    Ok(())
}

fn validate_key_segment(segment: &str, full_key: &str) -> Result<(), AttractorError> {
    let mut chars = segment.chars();
    let Some(first) = chars.next() else {
        return Err(AttractorError::Runtime(format!(
            "context key '{}' contains an empty namespace segment",
            full_key
        )));
    };
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(AttractorError::Runtime(format!(
            "context key '{}' has invalid segment '{}'",
            full_key, segment
        )));
    }

    if chars.any(|c| !(c.is_ascii_alphanumeric() || c == '_' || c == '-')) {
        return Err(AttractorError::Runtime(format!(
            "context key '{}' has invalid segment '{}'",
            full_key, segment
        )));
    }

    Ok(())
}
