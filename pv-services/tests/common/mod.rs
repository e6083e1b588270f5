//! Shared test utilities for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use tempfile::TempDir;

use pv_core::clock::ManualClock;
use pv_core::constants::APP_DATA_FOLDER;
use pv_core::error::{PvError, PvResult};
use pv_drive::blob::timestamp_properties;
use pv_drive::{BlobQuery, BlobStore, FolderBlobStore, NewBlob, RemoteBlob};
use pv_models::{EncryptionConfig, Patient, StoreConfig, StoreHandle};
use pv_services::{EventBus, PatientRepository, SyncCoordinator, SyncSettings};

pub const BLOB_NAME: &str = "patients.sqlite";

/// One simulated device: a store, its clock, and a coordinator talking to
/// a shared remote.
pub struct Device {
    pub store: StoreHandle,
    pub clock: Arc<ManualClock>,
    pub bus: EventBus,
    pub sync: Arc<SyncCoordinator>,
    pub repo: PatientRepository,
}

/// Open a store in `dir/<name>.sqlite` whose clock reads `now`.
pub fn create_store(dir: &Path, name: &str, now: i64) -> (StoreHandle, Arc<ManualClock>) {
    create_store_with(dir, name, now, EncryptionConfig::disabled())
}

pub fn create_store_with(
    dir: &Path,
    name: &str,
    now: i64,
    encryption: EncryptionConfig,
) -> (StoreHandle, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(now));
    let store = StoreHandle::open_with(
        StoreConfig::new(dir.join(format!("{name}.sqlite"))).with_encryption(encryption),
        clock.clone(),
    )
    .expect("failed to open test store");
    (store, clock)
}

/// Create a device named `name` in `dir` syncing against `remote`.
pub fn create_device(dir: &TempDir, name: &str, remote: Arc<dyn BlobStore>, now: i64) -> Device {
    create_device_with(dir, name, remote, now, EncryptionConfig::disabled())
}

pub fn create_device_with(
    dir: &TempDir,
    name: &str,
    remote: Arc<dyn BlobStore>,
    now: i64,
    encryption: EncryptionConfig,
) -> Device {
    let (store, clock) = create_store_with(dir.path(), name, now, encryption);
    let bus = EventBus::new(64);
    let settings = SyncSettings {
        blob_name: BLOB_NAME.to_string(),
        calibrate_clock: false,
        temp_dir: dir.path().join(format!("{name}-tmp")),
        ..SyncSettings::default()
    };
    let sync = Arc::new(SyncCoordinator::new(store.clone(), remote, bus.clone(), settings));
    let repo = PatientRepository::new(store.clone(), bus.clone()).with_coordinator(sync.clone());
    Device { store, clock, bus, sync, repo }
}

/// A folder-backed remote under `dir/remote`.
pub fn create_remote(dir: &TempDir) -> Arc<FolderBlobStore> {
    Arc::new(FolderBlobStore::new(dir.path().join("remote")))
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid test date")
}

/// A patient born before the epoch, so it validates under any test clock.
pub fn patient(first: &str, last: &str, mrn: &str) -> Patient {
    Patient::new(first, last, date(1955, 3, 14), mrn)
}

/// Build a snapshot holding `patients`, stamped `last_modified`, and upload
/// it to `remote` under [`BLOB_NAME`]. Returns the blob.
pub async fn seed_remote(
    dir: &TempDir,
    remote: &dyn BlobStore,
    patients: &[Patient],
    last_modified: i64,
) -> RemoteBlob {
    seed_remote_with(dir, remote, patients, last_modified, EncryptionConfig::disabled()).await
}

/// Like [`seed_remote`], with the snapshot encrypted as `encryption` says.
pub async fn seed_remote_with(
    dir: &TempDir,
    remote: &dyn BlobStore,
    patients: &[Patient],
    last_modified: i64,
    encryption: EncryptionConfig,
) -> RemoteBlob {
    let staging = dir.path().join("seed");
    std::fs::create_dir_all(&staging).expect("failed to create seed dir");
    let (store, _clock) =
        create_store_with(&staging, &format!("seed-{last_modified}"), last_modified, encryption);
    for p in patients {
        let mut p = p.clone();
        store.write(|conn| p.save(conn)).expect("failed to seed patient");
    }
    let export = staging.join(format!("export-{last_modified}.sqlite"));
    store.export_snapshot(&export).expect("failed to export seed");
    store.close();

    let bytes = std::fs::read(&export).expect("failed to read seed export");
    remote
        .create(NewBlob {
            name: BLOB_NAME.to_string(),
            mime_type: "application/x-sqlite3".to_string(),
            parent: APP_DATA_FOLDER.to_string(),
            properties: timestamp_properties(last_modified),
            bytes,
        })
        .await
        .expect("failed to upload seed")
}

/// Names of every patient in `store`, in load order.
pub fn patient_names(store: &StoreHandle) -> Vec<String> {
    store
        .read(|conn| Patient::load_all(conn))
        .expect("failed to load patients")
        .iter()
        .map(Patient::full_name)
        .collect()
}

/// Wraps a remote, counting downloads and optionally slowing them down so
/// concurrent cycles overlap.
pub struct CountingRemote {
    inner: Arc<dyn BlobStore>,
    delay: Duration,
    downloads: AtomicUsize,
    lists: AtomicUsize,
}

impl CountingRemote {
    pub fn new(inner: Arc<dyn BlobStore>, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            downloads: AtomicUsize::new(0),
            lists: AtomicUsize::new(0),
        }
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn lists(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for CountingRemote {
    fn backend(&self) -> &'static str {
        "counting"
    }

    async fn list_files(&self, query: &BlobQuery) -> PvResult<Vec<RemoteBlob>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        self.inner.list_files(query).await
    }

    async fn get_metadata(&self, id: &str) -> PvResult<RemoteBlob> {
        self.inner.get_metadata(id).await
    }

    async fn download(&self, id: &str) -> PvResult<Vec<u8>> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.download(id).await
    }

    async fn create(&self, blob: NewBlob) -> PvResult<RemoteBlob> {
        self.inner.create(blob).await
    }

    async fn update(
        &self,
        id: &str,
        properties: HashMap<String, String>,
        bytes: Vec<u8>,
    ) -> PvResult<RemoteBlob> {
        self.inner.update(id, properties, bytes).await
    }

    async fn delete(&self, id: &str) -> PvResult<()> {
        self.inner.delete(id).await
    }
}

/// Wraps a remote whose first `create` fails, as a dropped upload would.
pub struct FlakyCreateRemote {
    inner: Arc<dyn BlobStore>,
    failed_once: AtomicBool,
    creates: AtomicUsize,
}

impl FlakyCreateRemote {
    pub fn new(inner: Arc<dyn BlobStore>) -> Self {
        Self {
            inner,
            failed_once: AtomicBool::new(false),
            creates: AtomicUsize::new(0),
        }
    }

    /// Attempted creates, including the failed one.
    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for FlakyCreateRemote {
    fn backend(&self) -> &'static str {
        "flaky"
    }

    async fn list_files(&self, query: &BlobQuery) -> PvResult<Vec<RemoteBlob>> {
        self.inner.list_files(query).await
    }

    async fn get_metadata(&self, id: &str) -> PvResult<RemoteBlob> {
        self.inner.get_metadata(id).await
    }

    async fn download(&self, id: &str) -> PvResult<Vec<u8>> {
        self.inner.download(id).await
    }

    async fn create(&self, blob: NewBlob) -> PvResult<RemoteBlob> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if !self.failed_once.swap(true, Ordering::SeqCst) {
            return Err(PvError::RemoteUnavailable("connection reset during upload".into()));
        }
        self.inner.create(blob).await
    }

    async fn update(
        &self,
        id: &str,
        properties: HashMap<String, String>,
        bytes: Vec<u8>,
    ) -> PvResult<RemoteBlob> {
        self.inner.update(id, properties, bytes).await
    }

    async fn delete(&self, id: &str) -> PvResult<()> {
        self.inner.delete(id).await
    }
}
