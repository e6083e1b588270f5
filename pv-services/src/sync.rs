//! Sync coordinator: last-write-wins reconciliation with the remote snapshot.
//!
//! One cycle:
//! 1. Recalibrate the clock against trusted time (best effort)
//! 2. Read the local store timestamp
//! 3. Resolve the remote snapshot (tracked id, else by exact name)
//! 4. Read its `lastModified` property
//! 5. Remote newer: download and replace the whole local store; otherwise
//!    nothing to do
//!
//! Cycles and pushes are single-flight: a request while one is running is
//! skipped, not queued. Network awaits never hold the store guard; only the
//! replacement itself, which runs on a blocking thread, does.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use pv_core::clock::{Clock, OffsetClock, SystemClock};
use pv_core::config::SyncConfig;
use pv_core::constants::{APP_DATA_FOLDER, DEFAULT_SYNC_INTERVAL_SECS, SNAPSHOT_MIME_TYPE, STORE_FILE_NAME};
use pv_core::error::{PvError, PvResult};
use pv_drive::blob::timestamp_properties;
use pv_drive::{BlobQuery, BlobStore, NewBlob, RemoteBlob, TimeSource};
use pv_models::StoreHandle;

use crate::event_bus::{AppEvent, EventBus};
use crate::service::{Service, ServiceState, StateCell};

pub const STATUS_UP_TO_DATE: &str = "Database is up to date";

/// Tunables for the coordinator.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub interval: Duration,
    /// Exact name of the remote snapshot.
    pub blob_name: String,
    pub mime_type: String,
    pub calibrate_clock: bool,
    /// Where downloads and exports are staged.
    pub temp_dir: PathBuf,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS),
            blob_name: STORE_FILE_NAME.to_string(),
            mime_type: SNAPSHOT_MIME_TYPE.to_string(),
            calibrate_clock: true,
            temp_dir: std::env::temp_dir(),
        }
    }
}

impl SyncSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_secs.max(1)),
            blob_name: config.blob_name.clone(),
            mime_type: config.mime_type.clone(),
            calibrate_clock: config.calibrate_clock,
            ..Self::default()
        }
    }
}

/// Result of one sync request.
#[derive(Debug)]
pub enum SyncOutcome {
    /// The remote snapshot was newer and replaced the local store.
    Pulled { remote_last_modified: i64 },
    /// The remote snapshot is not newer than the local store.
    UpToDate,
    /// No remote snapshot existed yet; the local store was uploaded.
    InitialPush { blob_id: String, last_modified: i64 },
    /// Another cycle or push was already running.
    Skipped,
    /// The cycle failed; the status string carries the same message.
    Failed(PvError),
}

impl SyncOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl std::fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pulled { remote_last_modified } => {
                write!(f, "pulled remote snapshot (lastModified {remote_last_modified})")
            }
            Self::UpToDate => write!(f, "{STATUS_UP_TO_DATE}"),
            Self::InitialPush { blob_id, last_modified } => {
                write!(f, "uploaded initial snapshot {blob_id} (lastModified {last_modified})")
            }
            Self::Skipped => write!(f, "skipped, sync already in progress"),
            Self::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// Observable sync state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncState {
    pub last_sync: Option<DateTime<Utc>>,
    pub status: String,
    pub enabled: bool,
    pub in_progress: bool,
    pub remote_id: Option<String>,
}

/// Releases the single-flight flag when dropped.
struct SyncGuard<'a>(&'a AtomicBool);

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Worker {
    stop_tx: watch::Sender<bool>,
    _handle: JoinHandle<()>,
}

/// Coordinates the local store with the remote snapshot.
pub struct SyncCoordinator {
    state: StateCell,
    store: StoreHandle,
    remote: Arc<dyn BlobStore>,
    time_source: Option<(Arc<dyn TimeSource>, Arc<OffsetClock>)>,
    event_bus: EventBus,
    settings: SyncSettings,
    in_progress: AtomicBool,
    enabled: AtomicBool,
    /// True until a cycle has seen the remote listing or uploaded the first
    /// snapshot.
    first_cycle: AtomicBool,
    status: Mutex<String>,
    last_sync: Mutex<Option<DateTime<Utc>>>,
    remote_id: Mutex<Option<String>>,
    worker: Mutex<Option<Worker>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SyncCoordinator {
    pub fn new(
        store: StoreHandle,
        remote: Arc<dyn BlobStore>,
        event_bus: EventBus,
        settings: SyncSettings,
    ) -> Self {
        Self {
            state: StateCell::new(),
            store,
            remote,
            time_source: None,
            event_bus,
            settings,
            in_progress: AtomicBool::new(false),
            enabled: AtomicBool::new(false),
            first_cycle: AtomicBool::new(true),
            status: Mutex::new("Not synced yet".to_string()),
            last_sync: Mutex::new(None),
            remote_id: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Recalibrate `clock` from `source` at the start of every cycle.
    /// `clock` should be the clock the store stamps writes with.
    pub fn with_time_source(mut self, source: Arc<dyn TimeSource>, clock: Arc<OffsetClock>) -> Self {
        self.time_source = Some((source, clock));
        self
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Current observable state.
    pub fn status(&self) -> SyncState {
        SyncState {
            last_sync: *lock(&self.last_sync),
            status: lock(&self.status).clone(),
            enabled: self.enabled.load(Ordering::Acquire),
            in_progress: self.in_progress.load(Ordering::Acquire),
            remote_id: lock(&self.remote_id).clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.worker).is_some()
    }

    // ─── Scheduling ──────────────────────────────────────────────────────

    /// Start the periodic timer. The first cycle runs immediately.
    /// Calling `start` on a running coordinator does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            debug!("sync timer already running");
            return;
        }

        self.enabled.store(true, Ordering::Release);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let this = Arc::clone(self);
        let period = self.settings.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !this.enabled.load(Ordering::Acquire) {
                            break;
                        }
                        let outcome = this.sync_now().await;
                        debug!("scheduled sync: {outcome}");
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("sync timer stopped");
        });

        *worker = Some(Worker { stop_tx, _handle: handle });
        info!("sync timer started (every {}s)", period.as_secs());
    }

    /// Disable the timer. A cycle already running finishes normally.
    pub fn stop(&self) {
        self.enabled.store(false, Ordering::Release);
        if let Some(worker) = lock(&self.worker).take() {
            let _ = worker.stop_tx.send(true);
            info!("sync timer stopped");
        }
    }

    // ─── Cycle ───────────────────────────────────────────────────────────

    fn try_begin(&self) -> Option<SyncGuard<'_>> {
        self.in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SyncGuard(&self.in_progress))
    }

    /// Run one cycle on the caller's task.
    pub async fn sync_now(&self) -> SyncOutcome {
        let Some(_guard) = self.try_begin() else {
            debug!("sync already in progress, skipping");
            return SyncOutcome::Skipped;
        };

        self.set_status("Syncing...", true);
        match self.run_cycle().await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("sync cycle failed: {e}");
                self.set_status(format!("Sync failed: {e}"), false);
                SyncOutcome::Failed(e)
            }
        }
    }

    async fn run_cycle(&self) -> PvResult<SyncOutcome> {
        self.calibrate_clock().await;

        let local = self.blocking(|store| store.current_timestamp()).await?;

        let blob = match self.resolve_blob().await? {
            Some(blob) => blob,
            None if self.first_cycle.swap(false, Ordering::AcqRel) => {
                info!("no remote snapshot yet, uploading the local store");
                let (blob, last_modified) = match self.push_locked().await {
                    Ok(pushed) => pushed,
                    Err(e) => {
                        // Still no remote snapshot; the next cycle uploads again.
                        self.first_cycle.store(true, Ordering::Release);
                        return Err(e);
                    }
                };
                self.mark_synced(format!("Uploaded initial snapshot: {}", now_label()));
                return Ok(SyncOutcome::InitialPush { blob_id: blob.id, last_modified });
            }
            None => {
                return Err(PvError::RemoteUnavailable(format!(
                    "remote snapshot {} not found",
                    self.settings.blob_name
                )));
            }
        };
        self.first_cycle.store(false, Ordering::Release);

        let remote = blob.last_modified()?;
        debug!("local last_modified={local}, remote last_modified={remote}");

        if remote > local {
            info!("remote snapshot is newer ({remote} > {local}), pulling");
            self.pull(&blob).await?;
            self.mark_synced(format!("Last synced: {}", now_label()));
            self.event_bus.emit(AppEvent::StoreReplaced { remote_last_modified: remote });
            Ok(SyncOutcome::Pulled { remote_last_modified: remote })
        } else {
            self.set_status(STATUS_UP_TO_DATE, false);
            Ok(SyncOutcome::UpToDate)
        }
    }

    async fn calibrate_clock(&self) {
        if !self.settings.calibrate_clock {
            return;
        }
        let Some((source, clock)) = &self.time_source else {
            return;
        };
        match source.now().await {
            Ok(trusted) => clock.calibrate(trusted, SystemClock.now()),
            Err(e) => warn!("clock calibration skipped: {e}"),
        }
    }

    /// Find the remote snapshot and fetch its current metadata.
    ///
    /// A tracked id that no longer resolves is forgotten and the snapshot is
    /// looked up by name again. When several files carry the name, the one
    /// with the newest `lastModified` wins.
    async fn resolve_blob(&self) -> PvResult<Option<RemoteBlob>> {
        let tracked = lock(&self.remote_id).clone();
        if let Some(id) = tracked {
            match self.remote.get_metadata(&id).await {
                Ok(blob) => return Ok(Some(blob)),
                Err(e) => {
                    warn!("tracked remote snapshot {id} unavailable ({e}), rediscovering");
                    *lock(&self.remote_id) = None;
                }
            }
        }

        let mut candidates = self
            .remote
            .list_files(&BlobQuery::named(&self.settings.blob_name))
            .await
            .map_err(|e| match e {
                PvError::RemoteUnavailable(_) => e,
                other => PvError::RemoteUnavailable(other.to_string()),
            })?;

        if candidates.is_empty() {
            return Ok(None);
        }
        if candidates.len() > 1 {
            warn!(
                "{} remote files named {}, using the newest",
                candidates.len(),
                self.settings.blob_name
            );
        }
        candidates.sort_by_key(|b| b.last_modified().unwrap_or(i64::MIN));
        let Some(chosen) = candidates.pop() else {
            return Ok(None);
        };

        let blob = self.remote.get_metadata(&chosen.id).await?;
        info!("tracking remote snapshot {} via {}", blob.id, self.remote.backend());
        *lock(&self.remote_id) = Some(blob.id.clone());
        Ok(Some(blob))
    }

    async fn pull(&self, blob: &RemoteBlob) -> PvResult<()> {
        let bytes = self.remote.download(&blob.id).await.map_err(|e| match e {
            PvError::DownloadFailed(_) => e,
            other => PvError::DownloadFailed(other.to_string()),
        })?;
        if bytes.is_empty() {
            return Err(PvError::DownloadFailed(format!("remote snapshot {} is empty", blob.id)));
        }

        let temp = self.temp_path("temp_db");
        tokio::fs::create_dir_all(&self.settings.temp_dir).await?;
        tokio::fs::write(&temp, &bytes)
            .await
            .map_err(|e| PvError::DownloadFailed(format!("cannot stage download: {e}")))?;
        debug!("staged {} bytes at {}", bytes.len(), temp.display());

        let candidate = temp.clone();
        let result = self.blocking(move |store| store.replace_with(&candidate)).await;
        remove_temp(&temp).await;

        if let Err(e) = &result {
            if !self.store.is_open() {
                self.event_bus.emit(AppEvent::StoreFault { message: e.to_string() });
            }
        }
        result
    }

    // ─── Push ────────────────────────────────────────────────────────────

    /// Upload the local store as the remote snapshot.
    ///
    /// Fails with `SyncInProgress` when a cycle or another push is running.
    pub async fn push(&self) -> PvResult<RemoteBlob> {
        let Some(_guard) = self.try_begin() else {
            return Err(PvError::SyncInProgress);
        };

        self.set_status("Uploading...", true);
        match self.push_locked().await {
            Ok((blob, last_modified)) => {
                self.mark_synced(format!("Uploaded: {} (lastModified {last_modified})", now_label()));
                Ok(blob)
            }
            Err(e) => {
                warn!("push failed: {e}");
                self.set_status(format!("Upload failed: {e}"), false);
                Err(e)
            }
        }
    }

    /// Export, upload, and remember the blob id. Caller holds the guard.
    async fn push_locked(&self) -> PvResult<(RemoteBlob, i64)> {
        tokio::fs::create_dir_all(&self.settings.temp_dir).await?;
        let export = self.temp_path("export_db");
        let dest = export.clone();
        let exported = self
            .blocking(move |store| store.export_snapshot_stamped(&dest))
            .await;
        let last_modified = match exported {
            Ok(stamp) => stamp,
            Err(e) => {
                remove_temp(&export).await;
                return Err(e);
            }
        };

        let uploaded = self.upload(&export, last_modified).await;
        remove_temp(&export).await;
        let blob = uploaded?;

        *lock(&self.remote_id) = Some(blob.id.clone());
        self.event_bus.emit(AppEvent::SnapshotPushed {
            blob_id: blob.id.clone(),
            last_modified,
        });
        info!("pushed snapshot {} (lastModified {last_modified})", blob.id);
        Ok((blob, last_modified))
    }

    async fn upload(&self, export: &Path, last_modified: i64) -> PvResult<RemoteBlob> {
        let bytes = tokio::fs::read(export).await?;
        let properties = timestamp_properties(last_modified);

        match self.resolve_blob().await? {
            Some(existing) => self.remote.update(&existing.id, properties, bytes).await,
            None => {
                self.remote
                    .create(NewBlob {
                        name: self.settings.blob_name.clone(),
                        mime_type: self.settings.mime_type.clone(),
                        parent: APP_DATA_FOLDER.to_string(),
                        properties,
                        bytes,
                    })
                    .await
            }
        }
    }

    // ─── Helpers ─────────────────────────────────────────────────────────

    /// Run a store operation on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> PvResult<T>
    where
        T: Send + 'static,
        F: FnOnce(StoreHandle) -> PvResult<T> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || op(store))
            .await
            .map_err(|e| PvError::Internal(format!("store task failed: {e}")))?
    }

    fn temp_path(&self, prefix: &str) -> PathBuf {
        self.settings
            .temp_dir
            .join(format!("{prefix}_{}.sqlite", uuid::Uuid::new_v4()))
    }

    fn set_status(&self, status: impl Into<String>, in_progress: bool) {
        let status = status.into();
        *lock(&self.status) = status.clone();
        self.event_bus.emit(AppEvent::SyncStatusChanged { status, in_progress });
    }

    fn mark_synced(&self, status: String) {
        *lock(&self.last_sync) = Some(Utc::now());
        self.set_status(status, false);
    }
}

fn now_label() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

async fn remove_temp(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove temp file {}: {e}", path.display());
        }
    }
}

impl Service for SyncCoordinator {
    fn name(&self) -> &str {
        "sync"
    }

    fn state(&self) -> ServiceState {
        self.state.get()
    }

    fn init(&self) -> PvResult<()> {
        self.state.set(ServiceState::Running);
        Ok(())
    }

    fn shutdown(&self) -> PvResult<()> {
        self.stop();
        self.state.set(ServiceState::Stopped);
        Ok(())
    }
}
