use std::time::Duration;

use async_trait::async_trait;
use cloudsync_core::{ApiError, CloudClient, RemoteItem, RemoteItemType};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::paths::parent_server_path;
use super::record::{Account, RecordId, RecordKind, RemoteRecord};

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("api error: {0}")]
    Api(#[from] ApiError),
    #[error("remote unavailable: {0}")]
    Unavailable(String),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Api(err) => err.is_retryable(),
            RemoteError::Unavailable(_) => true,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RemoteError::Api(err) => err.retry_after(),
            RemoteError::Unavailable(_) => None,
        }
    }
}

/// A folder listing: the folder's own record, when the server reports it,
/// and its direct children.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteListing {
    pub folder: Option<RemoteRecord>,
    pub children: Vec<RemoteRecord>,
}

#[async_trait]
pub trait RemoteDirectory: Send + Sync {
    async fn list_folder(
        &self,
        account: &Account,
        path: &str,
    ) -> Result<RemoteListing, RemoteError>;

    /// `Ok(None)` means the server no longer has the record.
    async fn fetch_record(
        &self,
        account: &Account,
        id: &RecordId,
    ) -> Result<Option<RemoteRecord>, RemoteError>;
}

pub struct HttpRemoteDirectory {
    client: CloudClient,
}

impl HttpRemoteDirectory {
    pub fn new(client: CloudClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemoteDirectory for HttpRemoteDirectory {
    async fn list_folder(
        &self,
        account: &Account,
        path: &str,
    ) -> Result<RemoteListing, RemoteError> {
        let listing = self.client.list_folder_all(account.as_str(), path).await?;
        Ok(RemoteListing {
            folder: listing.folder.map(remote_record_from_item),
            children: listing
                .items
                .into_iter()
                .map(remote_record_from_item)
                .collect(),
        })
    }

    async fn fetch_record(
        &self,
        account: &Account,
        id: &RecordId,
    ) -> Result<Option<RemoteRecord>, RemoteError> {
        let item = self
            .client
            .fetch_record(account.as_str(), id.as_str())
            .await?;
        Ok(item.map(remote_record_from_item))
    }
}

fn remote_record_from_item(item: RemoteItem) -> RemoteRecord {
    let modified_at = parse_modified(item.modified.as_deref());
    RemoteRecord {
        parent_path: parent_server_path(&item.path).unwrap_or_else(|| "/".to_string()),
        id: item.id,
        name: item.name,
        kind: match item.item_type {
            RemoteItemType::File => RecordKind::File,
            RemoteItemType::Folder => RecordKind::Folder,
        },
        change_token: item.etag,
        size: item.size.map(|v| v as i64),
        modified_at,
    }
}

// Modification time is informational; an unparsable value is dropped.
fn parse_modified(value: Option<&str>) -> Option<i64> {
    let value = value?;
    match OffsetDateTime::parse(value, &Rfc3339) {
        Ok(parsed) => Some(parsed.unix_timestamp()),
        Err(err) => {
            tracing::debug!(value, %err, "ignoring unparsable modification time");
            None
        }
    }
}
