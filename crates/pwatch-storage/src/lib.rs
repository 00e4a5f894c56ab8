//! Snapshot, alert, event and profile stores for pwatch.
//!
//! The engine only talks to the traits; `MemoryStore` backs tests and
//! embedding, `JsonDirStore` keeps everything as JSON documents on disk.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pwatch_core::{Alert, AlertUpdate, ChangeEvent, ScrapeProfile, Snapshot};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pwatch-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed document {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("alert {0} not found")]
    AlertNotFound(Uuid),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertFilter {
    pub owner_id: Option<String>,
    pub alert_id: Option<Uuid>,
}

impl AlertFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn owner(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: Some(owner_id.into()),
            alert_id: None,
        }
    }

    pub fn matches(&self, alert: &Alert) -> bool {
        alert.is_active
            && self.owner_id.as_deref().map_or(true, |o| o == alert.owner_id)
            && self.alert_id.map_or(true, |id| id == alert.id)
    }
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Newest first, at most `limit`.
    async fn latest_snapshots(&self, owner_id: &str, limit: usize) -> Result<Vec<Snapshot>, StoreError>;
    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn list_active_alerts(&self, filter: &AlertFilter) -> Result<Vec<Alert>, StoreError>;
    async fn update_alert(&self, id: Uuid, update: &AlertUpdate) -> Result<(), StoreError>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Events whose id is already stored are ignored.
    async fn insert_change_events(&self, events: &[ChangeEvent]) -> Result<(), StoreError>;
    async fn events_for_alert(&self, alert_id: Uuid) -> Result<Vec<ChangeEvent>, StoreError>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn scrape_profile(&self, owner_id: &str) -> Result<Option<ScrapeProfile>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    snapshots: Vec<Snapshot>,
    alerts: BTreeMap<Uuid, Alert>,
    events: Vec<ChangeEvent>,
    profiles: HashMap<String, ScrapeProfile>,
    failing_snapshot_owners: HashSet<String>,
    failing_event_writes: bool,
    failing_alert_reads: bool,
    failing_alert_updates: bool,
}

/// In-process store. Failure switches let callers exercise error paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_alert(&self, alert: Alert) {
        self.state.lock().await.alerts.insert(alert.id, alert);
    }

    pub async fn put_profile(&self, profile: ScrapeProfile) {
        self.state
            .lock()
            .await
            .profiles
            .insert(profile.owner_id.clone(), profile);
    }

    pub async fn alert(&self, id: Uuid) -> Option<Alert> {
        self.state.lock().await.alerts.get(&id).cloned()
    }

    pub async fn all_events(&self) -> Vec<ChangeEvent> {
        self.state.lock().await.events.clone()
    }

    pub async fn fail_snapshot_reads_for(&self, owner_id: &str, failing: bool) {
        let mut state = self.state.lock().await;
        if failing {
            state.failing_snapshot_owners.insert(owner_id.to_string());
        } else {
            state.failing_snapshot_owners.remove(owner_id);
        }
    }

    pub async fn fail_event_writes(&self, failing: bool) {
        self.state.lock().await.failing_event_writes = failing;
    }

    pub async fn fail_alert_reads(&self, failing: bool) {
        self.state.lock().await.failing_alert_reads = failing;
    }

    pub async fn fail_alert_updates(&self, failing: bool) {
        self.state.lock().await.failing_alert_updates = failing;
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn latest_snapshots(&self, owner_id: &str, limit: usize) -> Result<Vec<Snapshot>, StoreError> {
        let state = self.state.lock().await;
        if state.failing_snapshot_owners.contains(owner_id) {
            return Err(StoreError::Unavailable(format!("snapshot reads for {owner_id}")));
        }
        let mut owned: Vec<Snapshot> = state
            .snapshots
            .iter()
            .filter(|s| s.owner_id == owner_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        owned.truncate(limit);
        Ok(owned)
    }

    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        self.state.lock().await.snapshots.push(snapshot.clone());
        Ok(())
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn list_active_alerts(&self, filter: &AlertFilter) -> Result<Vec<Alert>, StoreError> {
        let state = self.state.lock().await;
        if state.failing_alert_reads {
            return Err(StoreError::Unavailable("alert reads".to_string()));
        }
        Ok(state.alerts.values().filter(|a| filter.matches(a)).cloned().collect())
    }

    async fn update_alert(&self, id: Uuid, update: &AlertUpdate) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.failing_alert_updates {
            return Err(StoreError::Unavailable("alert updates".to_string()));
        }
        let alert = state.alerts.get_mut(&id).ok_or(StoreError::AlertNotFound(id))?;
        alert.apply(update);
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert_change_events(&self, events: &[ChangeEvent]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.failing_event_writes {
            return Err(StoreError::Unavailable("event writes".to_string()));
        }
        let known: HashSet<Uuid> = state.events.iter().map(|e| e.id).collect();
        let fresh: Vec<ChangeEvent> = events.iter().filter(|e| !known.contains(&e.id)).cloned().collect();
        state.events.extend(fresh);
        Ok(())
    }

    async fn events_for_alert(&self, alert_id: Uuid) -> Result<Vec<ChangeEvent>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.alert_id == alert_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn scrape_profile(&self, owner_id: &str) -> Result<Option<ScrapeProfile>, StoreError> {
        Ok(self.state.lock().await.profiles.get(owner_id).cloned())
    }
}

/// Directory-backed store:
///
/// ```text
/// <root>/alerts.json
/// <root>/profiles.json
/// <root>/snapshots/<owner>/<YYYYmmdd_HHMMSS>_<snapshot id>.json
/// <root>/events/<alert id>.json
/// ```
#[derive(Debug)]
pub struct JsonDirStore {
    root: PathBuf,
    /// Serializes read-modify-write cycles on shared documents.
    write_lock: Mutex<()>,
}

impl JsonDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn alerts_path(&self) -> PathBuf {
        self.root.join("alerts.json")
    }

    fn profiles_path(&self) -> PathBuf {
        self.root.join("profiles.json")
    }

    fn owner_dir(&self, owner_id: &str) -> PathBuf {
        self.root.join("snapshots").join(sanitize_segment(owner_id))
    }

    fn events_path(&self, alert_id: Uuid) -> PathBuf {
        self.root.join("events").join(format!("{alert_id}.json"))
    }

    pub fn snapshot_file_name(created_at: DateTime<Utc>, id: Uuid) -> String {
        format!("{}_{id}.json", created_at.format("%Y%m%d_%H%M%S"))
    }

    pub async fn save_alerts(&self, alerts: &[Alert]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        write_json_atomic(&self.alerts_path(), alerts).await
    }

    pub async fn save_profiles(&self, profiles: &[ScrapeProfile]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        write_json_atomic(&self.profiles_path(), profiles).await
    }

    async fn load_alerts(&self) -> Result<Vec<Alert>, StoreError> {
        Ok(read_json_if_exists(&self.alerts_path()).await?.unwrap_or_default())
    }
}

fn sanitize_segment(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

async fn read_json_if_exists<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_err(path)(err)),
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|source| StoreError::Malformed {
            path: path.to_path_buf(),
            source,
        })
}

/// Write via a uniquely named temp file in the target directory, then rename.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await.map_err(io_err(parent))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_err(&temp_path))?;
    file.write_all(&bytes).await.map_err(io_err(&temp_path))?;
    file.flush().await.map_err(io_err(&temp_path))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(io_err(path)(err));
    }
    Ok(())
}

#[async_trait]
impl SnapshotStore for JsonDirStore {
    async fn latest_snapshots(&self, owner_id: &str, limit: usize) -> Result<Vec<Snapshot>, StoreError> {
        let dir = self.owner_dir(owner_id);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_err(&dir)(err)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err(&dir))? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".json") && !name.starts_with('.') {
                names.push(name);
            }
        }
        // File names start with a sortable timestamp.
        names.sort();
        names.reverse();

        let mut snapshots = Vec::with_capacity(limit.min(names.len()));
        for name in names.into_iter().take(limit) {
            let path = dir.join(&name);
            if let Some(snapshot) = read_json_if_exists::<Snapshot>(&path).await? {
                snapshots.push(snapshot);
            }
        }
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        debug!(owner_id, count = snapshots.len(), "loaded snapshots");
        Ok(snapshots)
    }

    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let path = self
            .owner_dir(&snapshot.owner_id)
            .join(Self::snapshot_file_name(snapshot.created_at, snapshot.id));
        write_json_atomic(&path, snapshot).await
    }
}

#[async_trait]
impl AlertStore for JsonDirStore {
    async fn list_active_alerts(&self, filter: &AlertFilter) -> Result<Vec<Alert>, StoreError> {
        Ok(self
            .load_alerts()
            .await?
            .into_iter()
            .filter(|a| filter.matches(a))
            .collect())
    }

    async fn update_alert(&self, id: Uuid, update: &AlertUpdate) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut alerts = self.load_alerts().await?;
        let alert = alerts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(StoreError::AlertNotFound(id))?;
        alert.apply(update);
        write_json_atomic(&self.alerts_path(), &alerts).await
    }
}

#[async_trait]
impl EventStore for JsonDirStore {
    async fn insert_change_events(&self, events: &[ChangeEvent]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut by_alert: BTreeMap<Uuid, Vec<&ChangeEvent>> = BTreeMap::new();
        for event in events {
            by_alert.entry(event.alert_id).or_default().push(event);
        }
        for (alert_id, new_events) in by_alert {
            let path = self.events_path(alert_id);
            let mut stored: Vec<ChangeEvent> = read_json_if_exists(&path).await?.unwrap_or_default();
            let known: HashSet<Uuid> = stored.iter().map(|e| e.id).collect();
            let before = stored.len();
            stored.extend(new_events.into_iter().filter(|e| !known.contains(&e.id)).cloned());
            if stored.len() == before {
                debug!(%alert_id, "events already stored");
                continue;
            }
            write_json_atomic(&path, &stored).await?;
        }
        Ok(())
    }

    async fn events_for_alert(&self, alert_id: Uuid) -> Result<Vec<ChangeEvent>, StoreError> {
        Ok(read_json_if_exists(&self.events_path(alert_id))
            .await?
            .unwrap_or_default())
    }
}

#[async_trait]
impl ProfileStore for JsonDirStore {
    async fn scrape_profile(&self, owner_id: &str) -> Result<Option<ScrapeProfile>, StoreError> {
        let profiles: Vec<ScrapeProfile> = read_json_if_exists(&self.profiles_path())
            .await?
            .unwrap_or_default();
        Ok(profiles.into_iter().find(|p| p.owner_id == owner_id))
    }
}
