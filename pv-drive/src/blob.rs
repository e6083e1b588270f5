//! Blob store boundary types.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use pv_core::constants::LAST_MODIFIED_PROPERTY;
use pv_core::error::{PvError, PvResult};

/// Metadata of a file held by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteBlob {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl RemoteBlob {
    /// The store timestamp recorded when this blob was uploaded.
    pub fn last_modified(&self) -> PvResult<i64> {
        let raw = self.properties.get(LAST_MODIFIED_PROPERTY).ok_or_else(|| {
            PvError::InvalidMetadata(format!("blob {} has no {LAST_MODIFIED_PROPERTY}", self.id))
        })?;
        raw.trim().parse::<i64>().map_err(|_| {
            PvError::InvalidMetadata(format!(
                "blob {} has unparsable {LAST_MODIFIED_PROPERTY} {raw:?}",
                self.id
            ))
        })
    }
}

/// Filter for [`BlobStore::list_files`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobQuery {
    /// Exact file name.
    pub name: Option<String>,
    /// Substring of the file name.
    pub name_contains: Option<String>,
}

impl BlobQuery {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: Some(name.into()), name_contains: None }
    }

    pub fn containing(fragment: impl Into<String>) -> Self {
        Self { name: None, name_contains: Some(fragment.into()) }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.name.as_deref().map_or(true, |n| n == name)
            && self.name_contains.as_deref().map_or(true, |f| name.contains(f))
    }
}

/// A file to create in the remote store.
#[derive(Debug, Clone)]
pub struct NewBlob {
    pub name: String,
    pub mime_type: String,
    pub parent: String,
    pub properties: HashMap<String, String>,
    pub bytes: Vec<u8>,
}

/// Properties map carrying a store timestamp.
pub fn timestamp_properties(last_modified: i64) -> HashMap<String, String> {
    HashMap::from([(LAST_MODIFIED_PROPERTY.to_string(), last_modified.to_string())])
}

/// Remote file store holding the shared snapshot.
///
/// Listing and metadata failures surface as `RemoteUnavailable`, transfer
/// failures during [`BlobStore::download`] as `DownloadFailed`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Short backend label for logs.
    fn backend(&self) -> &'static str;

    async fn list_files(&self, query: &BlobQuery) -> PvResult<Vec<RemoteBlob>>;

    async fn get_metadata(&self, id: &str) -> PvResult<RemoteBlob>;

    async fn download(&self, id: &str) -> PvResult<Vec<u8>>;

    async fn create(&self, blob: NewBlob) -> PvResult<RemoteBlob>;

    /// Replace the content of `id` and merge `properties` into its metadata.
    async fn update(
        &self,
        id: &str,
        properties: HashMap<String, String>,
        bytes: Vec<u8>,
    ) -> PvResult<RemoteBlob>;

    async fn delete(&self, id: &str) -> PvResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(props: &[(&str, &str)]) -> RemoteBlob {
        RemoteBlob {
            id: "b1".into(),
            name: "patients.sqlite".into(),
            mime_type: String::new(),
            properties: props.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn test_last_modified_parsing() {
        assert_eq!(blob(&[("lastModified", "1700000000")]).last_modified().unwrap(), 1_700_000_000);
        assert!(matches!(blob(&[]).last_modified(), Err(PvError::InvalidMetadata(_))));
        assert!(matches!(
            blob(&[("lastModified", "yesterday")]).last_modified(),
            Err(PvError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn test_query_matching() {
        assert!(BlobQuery::default().matches("anything"));
        assert!(BlobQuery::named("patients.sqlite").matches("patients.sqlite"));
        assert!(!BlobQuery::named("patients.sqlite").matches("patients.sqlite.bak"));
        assert!(BlobQuery::containing("db").matches("my_db_file"));
        assert!(!BlobQuery::containing("db").matches("notes.txt"));
    }

    #[test]
    fn test_blob_deserializes_drive_json() {
        let json = r#"{"id":"abc","name":"patients.sqlite","mimeType":"application/x-sqlite3","properties":{"lastModified":"42"}}"#;
        let blob: RemoteBlob = serde_json::from_str(json).unwrap();
        assert_eq!(blob.mime_type, "application/x-sqlite3");
        assert_eq!(blob.last_modified().unwrap(), 42);

        let bare: RemoteBlob = serde_json::from_str(r#"{"id":"x","name":"y"}"#).unwrap();
        assert!(bare.properties.is_empty());
    }
}
