//! Application context: wires configuration, store, remote and services.
//!
//! The context is built first and started second, so a front end can
//! subscribe to the event bus in between and observe startup faults
//! (`AppEvent::StoreFault`) exactly like any later fault.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use pv_core::clock::OffsetClock;
use pv_core::config::{AppConfig, ConfigHandle, RemoteBackend, RemoteConfig};
use pv_core::constants::EVENT_BUS_CAPACITY;
use pv_core::error::{PvError, PvResult};
use pv_drive::{BlobStore, DriveClient, FolderBlobStore, HttpDateTimeSource};
use pv_models::{StoreConfig, StoreHandle};

use crate::event_bus::{AppEvent, EventBus};
use crate::repository::PatientRepository;
use crate::service::Service;
use crate::sync::{SyncCoordinator, SyncSettings};

/// Build the blob store selected by the `[remote]` section.
pub fn build_blob_store(remote: &RemoteConfig) -> PvResult<Arc<dyn BlobStore>> {
    match remote.backend {
        RemoteBackend::Drive => Ok(Arc::new(DriveClient::new(remote)?)),
        RemoteBackend::Folder => {
            if remote.folder_path.is_empty() {
                return Err(PvError::Config("remote.folder_path is required for the folder backend".into()));
            }
            Ok(Arc::new(FolderBlobStore::new(&remote.folder_path)))
        }
    }
}

pub struct AppContext {
    pub config: ConfigHandle,
    pub event_bus: EventBus,
    /// Clock every write is stamped with; calibrated by the coordinator.
    pub clock: Arc<OffsetClock>,
    pub store: StoreHandle,
    pub repository: Arc<PatientRepository>,
    coordinator: Option<Arc<SyncCoordinator>>,
    /// Why sync is unavailable, when it is.
    sync_error: Option<String>,
    services: Vec<Arc<dyn Service>>,
}

impl AppContext {
    /// Build from configuration. A remote that cannot be configured (for
    /// example, no Drive token) disables sync but not the local store.
    pub async fn build(config: ConfigHandle) -> PvResult<Self> {
        let snapshot = config.snapshot().await;
        let remote = build_blob_store(&snapshot.remote);
        Self::assemble(config, &snapshot, remote)
    }

    /// Build with an explicit remote, bypassing the `[remote]` section.
    pub async fn with_remote(config: ConfigHandle, remote: Arc<dyn BlobStore>) -> PvResult<Self> {
        let snapshot = config.snapshot().await;
        Self::assemble(config, &snapshot, Ok(remote))
    }

    fn assemble(
        config: ConfigHandle,
        snapshot: &AppConfig,
        remote: PvResult<Arc<dyn BlobStore>>,
    ) -> PvResult<Self> {
        let event_bus = EventBus::new(EVENT_BUS_CAPACITY);
        let clock = Arc::new(OffsetClock::new());
        let store = StoreHandle::new(StoreConfig::from_app_config(snapshot)?, clock.clone());

        let (coordinator, sync_error) = match remote {
            Ok(remote) => {
                let mut coordinator = SyncCoordinator::new(
                    store.clone(),
                    remote,
                    event_bus.clone(),
                    SyncSettings::from_config(&snapshot.sync),
                );
                if snapshot.sync.calibrate_clock {
                    let source = HttpDateTimeSource::new(
                        snapshot.sync.time_source_url.clone(),
                        Duration::from_millis(snapshot.remote.timeout_ms),
                    )?;
                    coordinator = coordinator.with_time_source(Arc::new(source), clock.clone());
                }
                (Some(Arc::new(coordinator)), None)
            }
            Err(e) => {
                warn!("sync disabled: {e}");
                (None, Some(e.to_string()))
            }
        };

        let mut repository = PatientRepository::new(store.clone(), event_bus.clone());
        if let Some(c) = &coordinator {
            repository = repository.with_coordinator(Arc::clone(c));
        }
        let repository = Arc::new(repository);

        let mut services: Vec<Arc<dyn Service>> = vec![repository.clone()];
        if let Some(c) = &coordinator {
            services.push(c.clone());
        }

        Ok(Self {
            config,
            event_bus,
            clock,
            store,
            repository,
            coordinator,
            sync_error,
            services,
        })
    }

    /// The sync coordinator, or the reason sync is not configured.
    pub fn coordinator(&self) -> PvResult<&Arc<SyncCoordinator>> {
        self.coordinator.as_ref().ok_or_else(|| {
            PvError::Config(
                self.sync_error
                    .clone()
                    .unwrap_or_else(|| "sync is not configured".into()),
            )
        })
    }

    /// Open the store, initialize services, and start the sync timer if
    /// `sync.auto_sync` is set.
    ///
    /// A store that fails to open is reported on the event bus and returned
    /// as `StoreUnavailable`; the context stays usable for diagnostics.
    pub async fn start(&self) -> PvResult<()> {
        let auto_sync = self.config.read().await.sync.auto_sync;

        let opened = self.store.open();
        match &opened {
            Ok(()) => self.event_bus.emit(AppEvent::StoreOpened {
                path: self.store.path().display().to_string(),
            }),
            Err(e) => {
                error!("store unavailable: {e}");
                self.event_bus.emit(AppEvent::StoreFault { message: e.to_string() });
            }
        }

        for service in &self.services {
            if let Err(e) = service.init() {
                warn!("service {} did not start: {e}", service.name());
            }
        }

        if opened.is_ok() && auto_sync {
            if let Some(c) = &self.coordinator {
                c.start();
            }
        }

        info!("application context started");
        opened
    }

    /// Stop services in reverse order and close the store.
    pub fn shutdown(&self) {
        for service in self.services.iter().rev() {
            if let Err(e) = service.shutdown() {
                warn!("service {} failed to shut down: {e}", service.name());
            }
        }
        self.store.close();
        info!("application context shut down");
    }

    /// Switch encryption at rest and remember the new setting in the
    /// in-memory configuration.
    pub async fn toggle_encryption(&self) -> PvResult<bool> {
        let store = self.store.clone();
        let enabled = tokio::task::spawn_blocking(move || store.toggle_encryption())
            .await
            .map_err(|e| PvError::Internal(format!("encryption task failed: {e}")))??;

        self.config.write().await.database.encrypted = enabled;
        self.event_bus.emit(AppEvent::EncryptionToggled { enabled });
        Ok(enabled)
    }

    /// Export directory from configuration (documents folder by default).
    pub async fn export_dir(&self) -> PvResult<PathBuf> {
        self.config.read().await.effective_export_dir()
    }
}
