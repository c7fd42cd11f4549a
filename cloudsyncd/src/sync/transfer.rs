use async_trait::async_trait;
use tracing::{debug, warn};

use super::index::IndexStore;
use super::record::{Account, MetadataRecord, Selector};

/// Schedules a content download. Fire-and-forget: implementations report
/// their own failures instead of returning them to the reconciler.
#[async_trait]
pub trait TransferTrigger: Send + Sync {
    async fn request_download(
        &self,
        account: &Account,
        record: &MetadataRecord,
        selector: &Selector,
    );
}

/// Records download requests in the index database, one entry per record.
#[derive(Clone)]
pub struct QueuedDownloads {
    index: IndexStore,
}

impl QueuedDownloads {
    pub fn new(index: IndexStore) -> Self {
        Self { index }
    }
}

#[async_trait]
impl TransferTrigger for QueuedDownloads {
    async fn request_download(
        &self,
        account: &Account,
        record: &MetadataRecord,
        selector: &Selector,
    ) {
        match self.index.enqueue_download(account, record, selector).await {
            Ok(()) => debug!(
                %account,
                id = %record.id,
                path = %record.server_path(),
                %selector,
                "download queued"
            ),
            Err(err) => warn!(
                %account,
                id = %record.id,
                %err,
                "failed to queue download"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::record::{RecordId, RecordKind};

    #[tokio::test]
    async fn queued_downloads_land_in_index() {
        let index = IndexStore::in_memory().await.unwrap();
        let trigger = QueuedDownloads::new(index.clone());
        let account = Account::new("alice");
        let record = MetadataRecord {
            id: RecordId::new("1"),
            parent_path: "/Photos".into(),
            name: "a.jpg".into(),
            kind: RecordKind::File,
            change_token: Some("t1".into()),
            size: None,
            modified_at: None,
        };

        trigger
            .request_download(&account, &record, &Selector::manual_refresh())
            .await;
        trigger
            .request_download(&account, &record, &Selector::manual_refresh())
            .await;

        let pending = index.pending_downloads(&account).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].server_path, "/Photos/a.jpg");
    }
}
