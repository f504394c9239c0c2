//! Durable per-handler checkpoints.
//!
//! A checkpoint is the `created_at` of the last event a subscription handler
//! processed successfully. [`CheckpointTracker`] keeps the current values in
//! memory and persists them through a [`CheckpointStore`] from one writer
//! task per handler.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Seconds subtracted from a checkpoint when resuming a subscription.
pub const CHECKPOINT_TOLERANCE: u64 = 360;

const CHECKPOINT_EXT: &str = "since";

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("invalid checkpoint name `{name}`: {reason}")]
    InvalidName { name: String, reason: &'static str },
    #[error("checkpoint `{0}` is not a timestamp")]
    Corrupt(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("replacing checkpoint: {0}")]
    Persist(#[from] tempfile::PersistError),
    #[error("checkpoint file task: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Storage for checkpoint values keyed by handler name.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<u64>, CheckpointError>;

    async fn set(&self, name: &str, ts: u64) -> Result<(), CheckpointError>;

    /// Every persisted checkpoint.
    async fn list(&self) -> Result<BTreeMap<String, u64>, CheckpointError>;

    /// Checkpoints of `names`; handlers without one are absent.
    async fn load(&self, names: &[String]) -> Result<HashMap<String, u64>, CheckpointError> {
        let mut found = HashMap::new();
        for name in names {
            if let Some(ts) = self.get(name).await? {
                found.insert(name.clone(), ts);
            }
        }
        Ok(found)
    }
}

/// Handler names become file names, so keep them to a single path segment.
pub fn validate_name(name: &str) -> Result<(), CheckpointError> {
    let invalid = |reason| {
        Err(CheckpointError::InvalidName {
            name: name.to_string(),
            reason,
        })
    };
    if name.is_empty() {
        return invalid("empty");
    }
    if name.contains('/') || name.contains('\\') {
        return invalid("contains a path separator");
    }
    if name == "." || name == ".." {
        return invalid("reserved");
    }
    if name.chars().any(char::is_control) {
        return invalid("contains control characters");
    }
    Ok(())
}

/// One `<name>.since` file per handler under `root`. File access runs on
/// the blocking pool, one operation at a time.
pub struct FileCheckpointStore {
    root: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, CheckpointError>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T, CheckpointError> + Send + 'static,
    {
        let root = self.root.clone();
        let lock = Arc::clone(&self.lock);
        tokio::task::spawn_blocking(move || {
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            op(&root)
        })
        .await?
    }
}

fn checkpoint_path(root: &Path, name: &str) -> PathBuf {
    root.join(format!("{name}.{CHECKPOINT_EXT}"))
}

fn parse_ts(name: &str, data: &str) -> Result<u64, CheckpointError> {
    data.trim()
        .parse()
        .map_err(|_| CheckpointError::Corrupt(name.to_string()))
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, name: &str) -> Result<Option<u64>, CheckpointError> {
        validate_name(name)?;
        let name = name.to_string();
        self.blocking(move |root| match fs::read_to_string(checkpoint_path(root, &name)) {
            Ok(data) => parse_ts(&name, &data).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn set(&self, name: &str, ts: u64) -> Result<(), CheckpointError> {
        validate_name(name)?;
        let name = name.to_string();
        self.blocking(move |root| {
            fs::create_dir_all(root)?;
            let tmp = tempfile::NamedTempFile::new_in(root)?;
            fs::write(tmp.path(), ts.to_string())?;
            tmp.persist(checkpoint_path(root, &name))?;
            Ok(())
        })
        .await
    }

    async fn list(&self) -> Result<BTreeMap<String, u64>, CheckpointError> {
        self.blocking(|root| {
            let mut out = BTreeMap::new();
            let entries = match fs::read_dir(root) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some(CHECKPOINT_EXT) {
                    continue;
                }
                let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let ts = parse_ts(name, &fs::read_to_string(&path)?)?;
                out.insert(name.to_string(), ts);
            }
            Ok(out)
        })
        .await
    }
}

/// Process-local store.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<BTreeMap<String, u64>>,
}

#[cfg(test)]
#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, name: &str) -> Result<Option<u64>, CheckpointError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied())
    }

    async fn set(&self, name: &str, ts: u64) -> Result<(), CheckpointError> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), ts);
        Ok(())
    }

    async fn list(&self) -> Result<BTreeMap<String, u64>, CheckpointError> {
        Ok(self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

/// In-memory checkpoint values backed by fire-and-forget writes.
///
/// `hit` updates the in-memory value immediately and hands the new value to
/// the handler's writer task. Writes for one handler are serialized and
/// coalesced, so the store always ends up with the most recent value.
/// Values are not forced to increase: an older event handled after a newer
/// one moves the checkpoint back.
pub struct CheckpointTracker {
    store: Arc<dyn CheckpointStore>,
    current: Mutex<HashMap<String, u64>>,
    writers: Mutex<HashMap<String, watch::Sender<u64>>>,
}

impl CheckpointTracker {
    /// Load the checkpoints of `names` from `store`.
    pub async fn load(
        store: Arc<dyn CheckpointStore>,
        names: &[String],
    ) -> Result<Self, CheckpointError> {
        let current = store.load(names).await?;
        debug!(loaded = current.len(), "checkpoints loaded");
        Ok(Self {
            store,
            current: Mutex::new(current),
            writers: Mutex::new(HashMap::new()),
        })
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
    }

    /// `since` for resuming `name`: the checkpoint minus
    /// [`CHECKPOINT_TOLERANCE`], or `None` without a checkpoint.
    pub fn resume_since(&self, name: &str) -> Option<u64> {
        self.get(name)
            .map(|ts| ts.saturating_sub(CHECKPOINT_TOLERANCE))
    }

    /// Record that `name` handled an event created at `ts`.
    pub fn hit(&self, name: &str, ts: u64) {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), ts);
        self.writer(name).send_replace(ts);
    }

    fn writer(&self, name: &str) -> watch::Sender<u64> {
        let mut writers = self.writers.lock().unwrap_or_else(|e| e.into_inner());
        writers
            .entry(name.to_string())
            .or_insert_with(|| {
                let (tx, mut rx) = watch::channel(0);
                let store = Arc::clone(&self.store);
                let name = name.to_string();
                tokio::spawn(async move {
                    while rx.changed().await.is_ok() {
                        let ts = *rx.borrow_and_update();
                        if let Err(e) = store.set(&name, ts).await {
                            warn!(handler = %name, ts, error = %e, "checkpoint write failed");
                        }
                    }
                });
                tx
            })
            .clone()
    }
}
