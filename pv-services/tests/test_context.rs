//! Application context integration tests: records, events, encryption and
//! exports through the fully wired stack.

mod common;

use pv_core::config::{AppConfig, ConfigHandle, RemoteBackend};
use pv_core::constants::SQLITE_HEADER;
use pv_core::error::PvError;
use pv_services::{AppContext, AppEvent, SyncOutcome};
use tempfile::TempDir;

use common::patient;

fn config(dir: &TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.database.path = dir.path().join("data").join("patients.sqlite").display().to_string();
    config.database.encryption_key = "correct horse battery staple".into();
    config.database.export_dir = dir.path().join("documents").display().to_string();
    config.remote.backend = RemoteBackend::Folder;
    config.remote.folder_path = dir.path().join("remote").display().to_string();
    config.sync.calibrate_clock = false;
    config
}

async fn started(dir: &TempDir) -> AppContext {
    let ctx = AppContext::build(ConfigHandle::new(config(dir))).await.unwrap();
    ctx.start().await.unwrap();
    ctx
}

#[tokio::test]
async fn save_fetch_and_load_through_context() {
    let dir = TempDir::new().unwrap();
    let ctx = started(&dir).await;
    let mut rx = ctx.event_bus.subscribe();
    let before = ctx.store.current_timestamp().unwrap();

    let mut ada = patient("Ada", "Lovelace", "M1");
    let id = ctx.repository.save(&mut ada).unwrap();
    assert_eq!(ada.id, Some(id));
    assert_eq!(rx.recv().await.unwrap(), AppEvent::PatientSaved { id });

    let fetched = ctx.repository.fetch(id).unwrap().unwrap();
    assert_eq!(fetched, ada);
    assert_eq!(ctx.repository.load_all().unwrap().len(), 1);
    assert!(ctx.store.current_timestamp().unwrap() >= before);

    ada.notes = Some("allergic to penicillin".into());
    assert_eq!(ctx.repository.save(&mut ada).unwrap(), id);
    assert_eq!(
        ctx.repository.fetch(id).unwrap().unwrap().notes.as_deref(),
        Some("allergic to penicillin")
    );

    ctx.shutdown();
    assert!(matches!(ctx.repository.load_all(), Err(PvError::StoreUnavailable(_))));
}

#[tokio::test]
async fn push_through_context_creates_remote_snapshot() {
    let dir = TempDir::new().unwrap();
    let ctx = started(&dir).await;
    ctx.repository.save(&mut patient("Grace", "Hopper", "NAVY-1")).unwrap();

    let sync = ctx.coordinator().unwrap();
    let outcome = sync.sync_now().await;
    assert!(matches!(outcome, SyncOutcome::InitialPush { .. }), "{outcome}");
    assert!(matches!(sync.sync_now().await, SyncOutcome::UpToDate));

    ctx.shutdown();
}

#[tokio::test]
async fn toggling_encryption_keeps_records_and_updates_config() {
    let dir = TempDir::new().unwrap();
    let ctx = started(&dir).await;
    ctx.repository.save(&mut patient("Alan", "Turing", "GCHQ-2")).unwrap();
    let mut rx = ctx.event_bus.subscribe();

    assert!(ctx.toggle_encryption().await.unwrap());
    assert!(ctx.store.is_encrypted());
    assert!(ctx.config.read().await.database.encrypted);
    assert_eq!(rx.recv().await.unwrap(), AppEvent::EncryptionToggled { enabled: true });

    let header = std::fs::read(ctx.store.path()).unwrap();
    assert_ne!(&header[..16], SQLITE_HEADER.as_slice());
    assert_eq!(ctx.repository.load_all().unwrap().len(), 1);

    assert!(!ctx.toggle_encryption().await.unwrap());
    let header = std::fs::read(ctx.store.path()).unwrap();
    assert_eq!(&header[..16], SQLITE_HEADER.as_slice());
    assert_eq!(ctx.repository.load_all().unwrap().len(), 1);

    ctx.shutdown();
}

#[tokio::test]
async fn export_lands_in_configured_directory() {
    let dir = TempDir::new().unwrap();
    let ctx = started(&dir).await;
    ctx.repository.save(&mut patient("Ada", "Lovelace", "M1")).unwrap();

    let export_dir = ctx.export_dir().await.unwrap();
    let exported = ctx.store.export_to_documents(&export_dir).unwrap();
    assert!(exported.starts_with(dir.path().join("documents")));
    assert!(std::fs::metadata(&exported).unwrap().len() > 0);

    ctx.shutdown();
}
