use crate::error::Error;
use crate::state::MachineState;
use anyhow::Context;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// Progress of one job, persisted between runs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Timestamp of the last event consumed by the run that wrote this
    #[serde(default)]
    pub last_event_time: Option<DateTime<Utc>>,

    /// Per-entity machine states, kept opaque at this layer
    #[serde(default)]
    pub states: HashMap<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    /// Advance `last_event_time` to `at` if it is later.
    pub fn observe(&mut self, at: DateTime<Utc>) {
        if self.last_event_time.map_or(true, |last| at > last) {
            self.last_event_time = Some(at);
        }
    }

    /// Decode the stored states into typed machine states.
    pub fn decode_states<S: DeserializeOwned>(
        &self,
    ) -> Result<HashMap<String, MachineState<S>>, Error> {
        self.states
            .iter()
            .map(|(key, value)| {
                serde_json::from_value(value.clone())
                    .map(|state| (key.clone(), state))
                    .map_err(|e| Error::Checkpoint(format!("state of '{}': {}", key, e)))
            })
            .collect()
    }

    /// Replace the stored states with `states`.
    pub fn set_states<S: Serialize>(
        &mut self,
        states: &HashMap<String, MachineState<S>>,
    ) -> Result<(), Error> {
        let mut encoded = HashMap::with_capacity(states.len());
        for (key, state) in states {
            let value = serde_json::to_value(state)
                .map_err(|e| Error::Checkpoint(format!("state of '{}': {}", key, e)))?;
            encoded.insert(key.clone(), value);
        }
        self.states = encoded;
        Ok(())
    }
}

/// Persistence for job checkpoints.
pub trait CheckpointStore: Send + Sync {
    /// `None` when the job has never completed a run.
    fn get(&self, job_id: &str) -> Result<Option<Checkpoint>, Error>;

    fn put(&self, job_id: &str, checkpoint: &Checkpoint) -> Result<(), Error>;
}

/// One gzip-compressed JSON file per job under a directory.
pub struct FileCheckpointStore {
    directory: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// Path of the checkpoint file for `job_id`
    pub fn path_for(&self, job_id: &str) -> PathBuf {
        let name: String = job_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.directory.join(format!("{}.json.gz", name))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn get(&self, job_id: &str) -> Result<Option<Checkpoint>, Error> {
        let path = self.path_for(job_id);
        if !path.exists() {
            debug!(job = %job_id, path = %path.display(), "No checkpoint on disk");
            return Ok(None);
        }

        read_compressed(&path)
            .map(Some)
            .map_err(|e| Error::Checkpoint(format!("{:#}", e)))
    }

    fn put(&self, job_id: &str, checkpoint: &Checkpoint) -> Result<(), Error> {
        let path = self.path_for(job_id);
        write_compressed(&self.directory, &path, checkpoint)
            .map_err(|e| Error::Checkpoint(format!("{:#}", e)))?;

        info!(
            job = %job_id,
            path = %path.display(),
            entities = checkpoint.states.len(),
            "Checkpoint saved"
        );
        Ok(())
    }
}

fn read_compressed(path: &Path) -> anyhow::Result<Checkpoint> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open checkpoint {}", path.display()))?;

    let mut json = String::new();
    GzDecoder::new(file)
        .read_to_string(&mut json)
        .context("Failed to decompress checkpoint")?;

    serde_json::from_str(&json).context("Failed to deserialize checkpoint JSON")
}

/// Write to a temp file, fsync, then rename over the previous checkpoint.
fn write_compressed(directory: &Path, path: &Path, checkpoint: &Checkpoint) -> anyhow::Result<()> {
    fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create checkpoint directory {}", directory.display()))?;

    let json = serde_json::to_vec(checkpoint).context("Failed to serialize checkpoint")?;
    let tmp_path = path.with_extension("tmp");

    {
        let tmp_file = File::create(&tmp_path).context("Failed to create temporary checkpoint file")?;
        let mut encoder = GzEncoder::new(tmp_file, Compression::default());
        encoder
            .write_all(&json)
            .context("Failed to write compressed checkpoint")?;
        let file = encoder.finish().context("Failed to finish compression")?;
        file.sync_all().context("Failed to sync checkpoint file")?;
    }

    fs::rename(&tmp_path, path).context("Failed to rename temporary checkpoint file")?;
    Ok(())
}

/// In-process store, for tests and one-shot runs.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn get(&self, job_id: &str) -> Result<Option<Checkpoint>, Error> {
        let checkpoints = self
            .checkpoints
            .lock()
            .map_err(|_| Error::Checkpoint("checkpoint map poisoned".to_string()))?;
        Ok(checkpoints.get(job_id).cloned())
    }

    fn put(&self, job_id: &str, checkpoint: &Checkpoint) -> Result<(), Error> {
        let mut checkpoints = self
            .checkpoints
            .lock()
            .map_err(|_| Error::Checkpoint("checkpoint map poisoned".to_string()))?;
        checkpoints.insert(job_id.to_string(), checkpoint.clone());
        Ok(())
    }
}
