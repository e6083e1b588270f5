//! Blob store backed by a plain directory.
//!
//! Each blob is two files: `<id>.blob` with the content and `<id>.json` with
//! its metadata. Both are written to a temporary name and renamed into place
//! so a reader on another device never sees a half-written file. Useful for
//! shared network folders and for exercising sync without a network.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, warn};

use pv_core::error::{PvError, PvResult};

use crate::blob::{BlobQuery, BlobStore, NewBlob, RemoteBlob};

const CONTENT_EXT: &str = "blob";
const METADATA_EXT: &str = "json";

#[derive(Debug, Clone)]
pub struct FolderBlobStore {
    root: PathBuf,
}

impl FolderBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn content_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.{CONTENT_EXT}"))
    }

    fn metadata_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.{METADATA_EXT}"))
    }

    async fn ensure_root(&self) -> PvResult<()> {
        fs::create_dir_all(&self.root).await.map_err(|e| {
            PvError::RemoteUnavailable(format!("cannot create {}: {e}", self.root.display()))
        })
    }

    async fn read_metadata(&self, id: &str) -> PvResult<RemoteBlob> {
        let path = self.metadata_path(id);
        let raw = fs::read(&path).await.map_err(|e| {
            PvError::RemoteUnavailable(format!("blob {id} not readable: {e}"))
        })?;
        serde_json::from_slice(&raw)
            .map_err(|e| PvError::InvalidMetadata(format!("blob {id} metadata corrupt: {e}")))
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> PvResult<()> {
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        let result = async {
            fs::write(&tmp, bytes).await?;
            fs::rename(&tmp, path).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp).await;
            return Err(PvError::RemoteUnavailable(format!(
                "cannot write {}: {e}",
                path.display()
            )));
        }
        Ok(())
    }

    async fn write_metadata(&self, blob: &RemoteBlob) -> PvResult<()> {
        let json = serde_json::to_vec_pretty(blob)?;
        self.write_atomic(&self.metadata_path(&blob.id), &json).await
    }
}

#[async_trait]
impl BlobStore for FolderBlobStore {
    fn backend(&self) -> &'static str {
        "folder"
    }

    async fn list_files(&self, query: &BlobQuery) -> PvResult<Vec<RemoteBlob>> {
        self.ensure_root().await?;
        let mut entries = fs::read_dir(&self.root).await.map_err(|e| {
            PvError::RemoteUnavailable(format!("cannot list {}: {e}", self.root.display()))
        })?;

        let mut blobs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PvError::RemoteUnavailable(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(METADATA_EXT) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.read_metadata(id).await {
                Ok(blob) if query.matches(&blob.name) => blobs.push(blob),
                Ok(_) => {}
                Err(e) => warn!("skipping unreadable blob metadata {}: {e}", path.display()),
            }
        }

        blobs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(blobs)
    }

    async fn get_metadata(&self, id: &str) -> PvResult<RemoteBlob> {
        self.read_metadata(id).await
    }

    async fn download(&self, id: &str) -> PvResult<Vec<u8>> {
        fs::read(self.content_path(id))
            .await
            .map_err(|e| PvError::DownloadFailed(format!("blob {id}: {e}")))
    }

    async fn create(&self, blob: NewBlob) -> PvResult<RemoteBlob> {
        self.ensure_root().await?;
        let id = uuid::Uuid::new_v4().simple().to_string();

        self.write_atomic(&self.content_path(&id), &blob.bytes).await?;
        let created = RemoteBlob {
            id,
            name: blob.name,
            mime_type: blob.mime_type,
            properties: blob.properties,
        };
        self.write_metadata(&created).await?;

        debug!("created folder blob {} ({} bytes)", created.id, blob.bytes.len());
        Ok(created)
    }

    async fn update(
        &self,
        id: &str,
        properties: HashMap<String, String>,
        bytes: Vec<u8>,
    ) -> PvResult<RemoteBlob> {
        let mut blob = self.read_metadata(id).await?;

        self.write_atomic(&self.content_path(id), &bytes).await?;
        blob.properties.extend(properties);
        self.write_metadata(&blob).await?;

        debug!("updated folder blob {id} ({} bytes)", bytes.len());
        Ok(blob)
    }

    async fn delete(&self, id: &str) -> PvResult<()> {
        self.read_metadata(id).await?;
        for path in [self.metadata_path(id), self.content_path(id)] {
            if let Err(e) = fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(PvError::RemoteUnavailable(format!(
                        "cannot remove {}: {e}",
                        path.display()
                    )));
                }
            }
        }
        Ok(())
    }
}
