use crate::{AttractorError, NodeOutcome, NodeStatus, PipelineStatus, RuntimeContext};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const CHECKPOINT_FILE_NAME: &str = "checkpoint.json";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub schema_version: u32,
    pub run_id: String,
    pub checkpoint_id: String,
    pub sequence_no: u64,
    pub timestamp: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointNodeOutcome {
    pub status: String,
    pub notes: Option<String>,
    pub preferred_label: Option<String>,
    pub suggested_next_ids: Vec<String>,
}

impl CheckpointNodeOutcome {
    pub fn from_runtime(outcome: &NodeOutcome) -> Self {
        Self {
            status: outcome.status.as_str().to_string(),
            notes: outcome.notes.clone(),
            preferred_label: outcome.preferred_label.clone(),
            suggested_next_ids: outcome.suggested_next_ids.clone(),
        }
    }

    pub fn to_runtime(&self) -> Result<NodeOutcome, AttractorError> {
        let status = NodeStatus::try_from(self.status.as_str())?;
        Ok(NodeOutcome {
            status,
            notes: self.notes.clone(),
            context_updates: RuntimeContext::new(),
            preferred_label: self.preferred_label.clone(),
            suggested_next_ids: self.suggested_next_ids.clone(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub metadata: CheckpointMetadata,
    pub current_node: String,
    pub next_node: Option<String>,
    pub completed_nodes: Vec<String>,
    pub node_retries: BTreeMap<String, u32>,
    pub node_outcomes: BTreeMap<String, CheckpointNodeOutcome>,
    pub context_values: RuntimeContext,
    pub logs: Vec<String>,
    pub current_node_fidelity: Option<String>,
    pub terminal_status: Option<String>,
    pub terminal_failure_reason: Option<String>,
    #[serde(default)]
    pub graph_dot_source_hash: Option<String>,
    #[serde(default)]
    pub graph_dot_source_ref: Option<String>,
    #[serde(default)]
    pub graph_snapshot_hash: Option<String>,
    #[serde(default)]
    pub graph_snapshot_ref: Option<String>,
}

impl CheckpointState {
    pub fn save_to_path(&self, path: &Path) -> Result<(), AttractorError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|error| {
                AttractorError::Runtime(format!(
                    "failed to create checkpoint parent directory '{}': {}",
                    parent.display(),
                    error
                ))
            })?;
        }

        let bytes = serde_json::to_vec_pretty(self).map_err(|error| {
            AttractorError::Runtime(format!("failed to serialize checkpoint: {error}"))
        })?;

        write_atomic(path, &bytes)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, AttractorError> {
        let bytes = fs::read(path).map_err(|error| {
            AttractorError::Runtime(format!(
                "failed reading checkpoint file '{}': {}",
                path.display(),
                error
            ))
        })?;
        serde_json::from_slice(&bytes).map_err(|error| {
            AttractorError::Runtime(format!(
                "failed deserializing checkpoint file '{}': {}",
                path.display(),
                error
            ))
        })
    }

    pub fn terminal_pipeline_status(&self) -> Result<Option<PipelineStatus>, AttractorError> {
        match self.terminal_status.as_deref() {
            Some("success") => Ok(Some(PipelineStatus::Success)),
            Some("fail") => Ok(Some(PipelineStatus::Fail)),
            Some(other) => Err(AttractorError::Runtime(format!(
                "checkpoint has unknown terminal status '{other}'"
            ))),
            None => Ok(None),
        }
    }
}

pub fn checkpoint_file_path(logs_root: &Path) -> PathBuf {
    logs_root.join(CHECKPOINT_FILE_NAME)
}

/// Writes `bytes` to `path` via a sibling temp file followed by a rename, so
/// a crash mid-write never leaves a half-written checkpoint behind.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), AttractorError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("checkpoint");
    let temp_path = parent.join(format!(".{file_name}.tmp"));

    let mut file = fs::File::create(&temp_path).map_err(|error| {
        AttractorError::Runtime(format!(
            "failed to create temp file '{}': {}",
            temp_path.display(),
            error
        ))
    })?;
    use std::io::Write;
    file.write_all(bytes).map_err(|error| {
        AttractorError::Runtime(format!("failed writing temp checkpoint: {error}"))
    })?;
    file.sync_all()
        .map_err(|error| AttractorError::Runtime(format!("failed to fsync checkpoint: {error}")))?;
    fs::rename(&temp_path, path).map_err(|error| {
        AttractorError::Runtime(format!(
            "failed to rename '{}' into place at '{}': {}",
            temp_path.display(),
            path.display(),
            error
        ))
    })
}

/// The on-disk layout a run's checkpoints and artifacts live in:
/// `manifest.json`, `graph.dot`, atomic `checkpoint.json`, a per-node
/// directory with `status.json` and opportunistic artifacts, an
/// append-only `progress.ndjson`, and `parallel/`/`restart-<N>/` subtrees.
/// `final.json` is written exactly once via create-then-rename.
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    pub fn graph_dot_path(&self) -> PathBuf {
        self.root.join("graph.dot")
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        checkpoint_file_path(&self.root)
    }

    pub fn progress_log_path(&self) -> PathBuf {
        self.root.join("progress.ndjson")
    }

    pub fn node_dir(&self, node_id: &str) -> PathBuf {
        self.root.join(node_id)
    }

    pub fn node_status_path(&self, node_id: &str) -> PathBuf {
        self.node_dir(node_id).join("status.json")
    }

    pub fn node_stage_archive_path(&self, node_id: &str) -> PathBuf {
        self.node_dir(node_id).join("stage.tgz")
    }

    pub fn node_panic_path(&self, node_id: &str) -> PathBuf {
        self.node_dir(node_id).join("panic.txt")
    }

    pub fn parallel_branch_dir(&self, node_id: &str, branch_key: &str) -> PathBuf {
        self.root
            .join("parallel")
            .join(node_id)
            .join(branch_key)
    }

    pub fn restart_dir(&self, restart_no: u32) -> PathBuf {
        self.root.join(format!("restart-{restart_no}"))
    }

    pub fn final_path(&self) -> PathBuf {
        self.root.join("final.json")
    }

    pub fn write_manifest(&self, manifest: &serde_json::Value) -> Result<(), AttractorError> {
        fs::create_dir_all(&self.root).map_err(|error| {
            AttractorError::Runtime(format!("failed to create checkpoint root: {error}"))
        })?;
        let bytes = serde_json::to_vec_pretty(manifest).map_err(|error| {
            AttractorError::Runtime(format!("failed to serialize manifest: {error}"))
        })?;
        write_atomic(&self.manifest_path(), &bytes)
    }

    pub fn write_node_status(
        &self,
        node_id: &str,
        status: &serde_json::Value,
    ) -> Result<(), AttractorError> {
        let dir = self.node_dir(node_id);
        fs::create_dir_all(&dir).map_err(|error| {
            AttractorError::Runtime(format!(
                "failed to create node directory '{}': {}",
                dir.display(),
                error
            ))
        })?;
        let bytes = serde_json::to_vec_pretty(status).map_err(|error| {
            AttractorError::Runtime(format!("failed to serialize node status: {error}"))
        })?;
        // Last-attempt-wins: each retry overwrites the same file.
        write_atomic(&self.node_status_path(node_id), &bytes)
    }

    /// Best-effort debug artifact written alongside a panicking handler's
    /// `status.json`; never on the success path.
    pub fn write_panic_log(&self, node_id: &str, message: &str) -> Result<(), AttractorError> {
        let dir = self.node_dir(node_id);
        fs::create_dir_all(&dir).map_err(|error| {
            AttractorError::Runtime(format!(
                "failed to create node directory '{}': {}",
                dir.display(),
                error
            ))
        })?;
        fs::write(self.node_panic_path(node_id), message).map_err(|error| {
            AttractorError::Runtime(format!("failed to write panic.txt: {error}"))
        })
    }

    /// Writes `<node_id>/stage.tgz`: a tar+gzip archive of every file under
    /// `source_dir` (the node's logs subtree), relative paths preserved.
    pub fn write_node_stage_archive(
        &self,
        node_id: &str,
        source_dir: &Path,
    ) -> Result<(), AttractorError> {
        if !source_dir.exists() {
            return Ok(());
        }
        let dir = self.node_dir(node_id);
        fs::create_dir_all(&dir).map_err(|error| {
            AttractorError::Runtime(format!(
                "failed to create node directory '{}': {}",
                dir.display(),
                error
            ))
        })?;
        let archive_path = self.node_stage_archive_path(node_id);
        let temp_path = dir.join(".stage.tgz.tmp");
        {
            let file = fs::File::create(&temp_path).map_err(|error| {
                AttractorError::Runtime(format!("failed to create stage archive: {error}"))
            })?;
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder
                .append_dir_all(".", source_dir)
                .map_err(|error| {
                    AttractorError::Runtime(format!("failed to append stage archive contents: {error}"))
                })?;
            builder
                .into_inner()
                .map_err(|error| {
                    AttractorError::Runtime(format!("failed to finish stage archive: {error}"))
                })?
                .finish()
                .map_err(|error| {
                    AttractorError::Runtime(format!("failed to flush stage archive: {error}"))
                })?;
        }
        fs::rename(&temp_path, &archive_path).map_err(|error| {
            AttractorError::Runtime(format!("failed to finalize stage archive: {error}"))
        })
    }

    pub fn append_progress(&self, line: &serde_json::Value) -> Result<(), AttractorError> {
        fs::create_dir_all(&self.root).map_err(|error| {
            AttractorError::Runtime(format!("failed to create checkpoint root: {error}"))
        })?;
        let mut serialized = serde_json::to_string(line).map_err(|error| {
            AttractorError::Runtime(format!("failed to serialize progress line: {error}"))
        })?;
        serialized.push('\n');
        use std::io::Write;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.progress_log_path())
            .map_err(|error| {
                AttractorError::Runtime(format!("failed to open progress.ndjson: {error}"))
            })?;
        file.write_all(serialized.as_bytes())
            .map_err(|error| AttractorError::Runtime(format!("failed to append progress: {error}")))
    }

    /// Writes `final.json` exactly once: a temp file is created then
    /// renamed into place, and a pre-existing `final.json` is left
    /// untouched so a second finalize attempt cannot clobber the first.
    pub fn write_final_once(&self, payload: &serde_json::Value) -> Result<(), AttractorError> {
        let final_path = self.final_path();
        if final_path.exists() {
            return Err(AttractorError::Runtime(
                "final.json already exists; a run may only finalize once".to_string(),
            ));
        }
        fs::create_dir_all(&self.root).map_err(|error| {
            AttractorError::Runtime(format!("failed to create checkpoint root: {error}"))
        })?;
        let bytes = serde_json::to_vec_pretty(payload).map_err(|error| {
            AttractorError::Runtime(format!("failed to serialize final.json: {error}"))
        })?;
        write_atomic(&final_path, &bytes)
    }
}

impl TryFrom<&str> for NodeStatus {
    type Error = AttractorError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "success" => Ok(Self::Success),
            "partial_success" => Ok(Self::PartialSuccess),
            "retry" => Ok(Self::Retry),
            "fail" => Ok(Self::Fail),
            other => Err(AttractorError::Runtime(format!(
                "unknown node status '{other}' in checkpoint"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn checkpoint_roundtrip_path_expected_preserves_fields() {
        let temp = TempDir::new().expect("temp dir should be created");
        let path = checkpoint_file_path(temp.path());
        let checkpoint = CheckpointState {
            metadata: CheckpointMetadata {
                schema_version: 1,
                run_id: "run-1".to_string(),
                checkpoint_id: "cp-1".to_string(),
                sequence_no: 5,
                timestamp: "123.000Z".to_string(),
            },
            current_node: "plan".to_string(),
            next_node: Some("review".to_string()),
            completed_nodes: vec!["start".to_string(), "plan".to_string()],
            node_retries: BTreeMap::from([("plan".to_string(), 1)]),
            node_outcomes: BTreeMap::from([(
                "plan".to_string(),
                CheckpointNodeOutcome {
                    status: "success".to_string(),
                    notes: Some("ok".to_string()),
                    preferred_label: None,
                    suggested_next_ids: vec![],
                },
            )]),
            context_values: BTreeMap::from([("outcome".to_string(), json!("success"))]),
            logs: vec!["checkpoint saved".to_string()],
            current_node_fidelity: Some("full".to_string()),
            terminal_status: None,
            terminal_failure_reason: None,
            graph_dot_source_hash: Some("dot-hash".to_string()),
            graph_dot_source_ref: Some("artifact://dot".to_string()),
            graph_snapshot_hash: Some("snapshot-hash".to_string()),
            graph_snapshot_ref: Some("artifact://snapshot".to_string()),
        };

        checkpoint
            .save_to_path(&path)
            .expect("checkpoint should save");
        let loaded = CheckpointState::load_from_path(&path).expect("checkpoint should load");
        assert_eq!(loaded, checkpoint);
    }

    #[test]
    fn checkpoint_store_writes_node_status_last_attempt_wins() {
        let temp = TempDir::new().expect("temp dir should be created");
        let store = CheckpointStore::new(temp.path());
        store
            .write_node_status("plan", &json!({"attempt": 1}))
            .expect("first write should succeed");
        store
            .write_node_status("plan", &json!({"attempt": 2}))
            .expect("second write should succeed");
        let bytes = fs::read(store.node_status_path("plan")).expect("status should exist");
        let value: serde_json::Value = serde_json::from_slice(&bytes).expect("valid json");
        assert_eq!(value["attempt"], 2);
    }

    #[test]
    fn checkpoint_store_final_json_written_exactly_once() {
        let temp = TempDir::new().expect("temp dir should be created");
        let store = CheckpointStore::new(temp.path());
        store
            .write_final_once(&json!({"status": "success"}))
            .expect("first finalize should succeed");
        let error = store
            .write_final_once(&json!({"status": "success"}))
            .expect_err("second finalize should fail");
        assert!(matches!(error, AttractorError::Runtime(message) if message.contains("only finalize once")));
    }

    #[test]
    fn checkpoint_store_progress_log_is_append_only() {
        let temp = TempDir::new().expect("temp dir should be created");
        let store = CheckpointStore::new(temp.path());
        store
            .append_progress(&json!({"seq": 1}))
            .expect("append should succeed");
        store
            .append_progress(&json!({"seq": 2}))
            .expect("append should succeed");
        let contents = fs::read_to_string(store.progress_log_path()).expect("log should exist");
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn checkpoint_node_outcome_to_runtime_expected_status_mapping() {
        let checkpoint_outcome = CheckpointNodeOutcome {
            status: "partial_success".to_string(),
            notes: Some("n".to_string()),
            preferred_label: Some("yes".to_string()),
            suggested_next_ids: vec!["a".to_string()],
        };

        let runtime = checkpoint_outcome
            .to_runtime()
            .expect("conversion should succeed");
        assert_eq!(runtime.status, NodeStatus::PartialSuccess);
        assert_eq!(runtime.preferred_label.as_deref(), Some("yes"));
    }

    #[test]
    fn checkpoint_store_writes_panic_log() {
        let temp = TempDir::new().expect("temp dir should be created");
        let store = CheckpointStore::new(temp.path());
        store
            .write_panic_log("plan", "handler panicked: boom")
            .expect("panic log write should succeed");
        let contents =
            fs::read_to_string(store.node_panic_path("plan")).expect("panic.txt should exist");
        assert_eq!(contents, "handler panicked: boom");
    }

    #[test]
    fn checkpoint_store_writes_stage_archive_from_source_dir() {
        let temp = TempDir::new().expect("temp dir should be created");
        let source = temp.path().join("source");
        fs::create_dir_all(&source).expect("source dir should be created");
        fs::write(source.join("stdout.log"), "hello").expect("write source file");
        let store = CheckpointStore::new(temp.path().join("checkpoint"));
        store
            .write_node_stage_archive("plan", &source)
            .expect("stage archive write should succeed");
        assert!(store.node_stage_archive_path("plan").exists());
    }
}
