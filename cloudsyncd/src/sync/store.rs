use async_trait::async_trait;

use super::index::StoreError;
use super::record::{Account, MetadataRecord};

/// Everything one folder's apply step writes, committed as a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SliceUpdate {
    pub added: Vec<MetadataRecord>,
    pub updated: Vec<MetadataRecord>,
    pub removed: Vec<MetadataRecord>,
    /// Bookkeeping for the folder itself; `None` leaves its row untouched.
    pub directory: Option<DirectoryUpdate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryUpdate {
    /// The folder's own change token, when the listing reported one.
    pub change_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryRecord {
    pub server_path: String,
    pub parent_path: Option<String>,
    pub change_token: Option<String>,
    pub last_read_at: i64,
}

/// Account-scoped persistent table of known records.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn has_account(&self, account: &Account) -> Result<bool, StoreError>;

    /// All stored records whose parent is `parent_path`.
    async fn load_slice(
        &self,
        account: &Account,
        parent_path: &str,
    ) -> Result<Vec<MetadataRecord>, StoreError>;

    /// Applies removals, then additions and updates, atomically.
    async fn apply_slice(
        &self,
        account: &Account,
        parent_path: &str,
        update: &SliceUpdate,
    ) -> Result<(), StoreError>;

    async fn directory(
        &self,
        account: &Account,
        server_path: &str,
    ) -> Result<Option<DirectoryRecord>, StoreError>;

    async fn child_directories(
        &self,
        account: &Account,
        parent_path: &str,
    ) -> Result<Vec<DirectoryRecord>, StoreError>;
}
