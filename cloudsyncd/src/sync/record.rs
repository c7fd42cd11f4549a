use std::fmt;

use super::engine::SyncError;

/// Opaque account identifier; every record and remote call is scoped by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Account(String);

impl Account {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    File,
    Folder,
}

impl RecordKind {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            RecordKind::File => "file",
            RecordKind::Folder => "folder",
        }
    }

    pub(crate) fn parse(value: &str) -> Option<Self> {
        match value {
            "file" => Some(RecordKind::File),
            "folder" => Some(RecordKind::Folder),
            _ => None,
        }
    }
}

/// One file or folder, as stored locally or as listed remotely.
///
/// `change_token` is the only field consulted for change detection; `size`
/// and `modified_at` are carried for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    pub id: RecordId,
    pub parent_path: String,
    pub name: String,
    pub kind: RecordKind,
    pub change_token: Option<String>,
    pub size: Option<i64>,
    pub modified_at: Option<i64>,
}

impl MetadataRecord {
    pub fn is_folder(&self) -> bool {
        self.kind == RecordKind::Folder
    }

    pub fn server_path(&self) -> String {
        super::paths::join_server_path(&self.parent_path, &self.name)
    }
}

/// A record as delivered by the remote side, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRecord {
    pub id: Option<String>,
    pub parent_path: String,
    pub name: String,
    pub kind: RecordKind,
    pub change_token: Option<String>,
    pub size: Option<i64>,
    pub modified_at: Option<i64>,
}

impl RemoteRecord {
    pub fn into_record(self) -> Result<MetadataRecord, SyncError> {
        let id = match self.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                return Err(SyncError::MalformedRecord(format!(
                    "record {:?} in {} has no id",
                    self.name, self.parent_path
                )));
            }
        };
        if self.name.is_empty() {
            return Err(SyncError::MalformedRecord(format!(
                "record {id} in {} has no name",
                self.parent_path
            )));
        }
        Ok(MetadataRecord {
            id: RecordId(id),
            parent_path: self.parent_path,
            name: self.name,
            kind: self.kind,
            change_token: self.change_token,
            size: self.size,
            modified_at: self.modified_at,
        })
    }
}

impl From<MetadataRecord> for RemoteRecord {
    fn from(record: MetadataRecord) -> Self {
        Self {
            id: Some(record.id.0),
            parent_path: record.parent_path,
            name: record.name,
            kind: record.kind,
            change_token: record.change_token,
            size: record.size,
            modified_at: record.modified_at,
        }
    }
}

/// Why a synchronization was requested. Carried for routing and logs only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Selector(String);

impl Selector {
    pub fn new(value: impl Into<String>) -> Result<Self, SyncError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(SyncError::InvalidRequest("selector is empty".into()));
        }
        Ok(Self(value))
    }

    pub fn manual_refresh() -> Self {
        Self("manual-refresh".into())
    }

    pub fn background_tick() -> Self {
        Self("background-tick".into())
    }

    pub fn change_notification() -> Self {
        Self("change-notification".into())
    }

    pub fn verify_sweep() -> Self {
        Self("verify-sweep".into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(id: Option<&str>, name: &str) -> RemoteRecord {
        RemoteRecord {
            id: id.map(str::to_string),
            parent_path: "/Photos".into(),
            name: name.into(),
            kind: RecordKind::File,
            change_token: Some("t1".into()),
            size: None,
            modified_at: None,
        }
    }

    #[test]
    fn remote_record_without_id_is_malformed() {
        assert!(matches!(
            remote(None, "a.jpg").into_record(),
            Err(SyncError::MalformedRecord(_))
        ));
        assert!(matches!(
            remote(Some("  "), "a.jpg").into_record(),
            Err(SyncError::MalformedRecord(_))
        ));
        assert!(matches!(
            remote(Some("1"), "").into_record(),
            Err(SyncError::MalformedRecord(_))
        ));
    }

    #[test]
    fn remote_record_with_id_converts() {
        let record = remote(Some("1"), "a.jpg").into_record().unwrap();
        assert_eq!(record.id, RecordId::new("1"));
        assert_eq!(record.server_path(), "/Photos/a.jpg");
    }

    #[test]
    fn empty_selector_is_rejected() {
        assert!(Selector::new("").is_err());
        assert!(Selector::new("   ").is_err());
        assert_eq!(Selector::new("pull").unwrap().as_str(), "pull");
    }
}
