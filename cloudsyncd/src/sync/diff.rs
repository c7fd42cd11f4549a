use std::collections::{HashMap, HashSet};

use super::engine::SyncError;
use super::record::{MetadataRecord, RecordId, RemoteRecord};

/// Difference between a stored folder slice and a fresh remote listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub added: Vec<MetadataRecord>,
    pub removed: Vec<MetadataRecord>,
    pub updated: Vec<MetadataRecord>,
    pub unchanged: Vec<MetadataRecord>,
    /// Unchanged records whose name, parent or kind moved under the same token.
    pub refreshed: Vec<MetadataRecord>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.updated.is_empty()
            && self.refreshed.is_empty()
    }

    pub fn counts(&self) -> ChangeCounts {
        ChangeCounts {
            added: self.added.len(),
            updated: self.updated.len(),
            removed: self.removed.len(),
        }
    }

    /// Added and updated records, in listing order.
    pub fn changed(&self) -> impl Iterator<Item = &MetadataRecord> {
        self.added.iter().chain(self.updated.iter())
    }

    /// Every record the store has to upsert, including metadata-only refreshes.
    pub fn upserts(&self) -> impl Iterator<Item = &MetadataRecord> {
        self.changed().chain(self.refreshed.iter())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeCounts {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

impl ChangeCounts {
    pub fn total(&self) -> usize {
        self.added + self.updated + self.removed
    }
}

impl std::ops::AddAssign for ChangeCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.added += rhs.added;
        self.updated += rhs.updated;
        self.removed += rhs.removed;
    }
}

#[derive(Debug, Default)]
pub struct DiffOutcome {
    pub changes: ChangeSet,
    pub rejected: Vec<SyncError>,
}

/// Validates the remote listing and diffs it against the stored slice.
///
/// Records are matched by id only. Every accepted remote record is
/// re-parented to `parent_path`. Records without an id, and later duplicates
/// of an id already seen in the listing, are rejected without aborting the
/// rest of the batch.
pub fn compute_change_set(
    parent_path: &str,
    local: &[MetadataRecord],
    remote: Vec<RemoteRecord>,
) -> DiffOutcome {
    let (remote, rejected) = validate_listing(parent_path, remote);
    let local_by_id: HashMap<&RecordId, &MetadataRecord> =
        local.iter().map(|record| (&record.id, record)).collect();
    let remote_ids: HashSet<RecordId> = remote.iter().map(|record| record.id.clone()).collect();

    let mut changes = ChangeSet::default();
    for record in remote {
        match local_by_id.get(&record.id) {
            None => changes.added.push(record),
            Some(stored) if stored.change_token != record.change_token => {
                changes.updated.push(record)
            }
            Some(stored) => {
                if record_moved(stored, &record) {
                    changes.refreshed.push(record.clone());
                }
                changes.unchanged.push(record)
            }
        }
    }
    changes.removed = local
        .iter()
        .filter(|record| !remote_ids.contains(&record.id))
        .cloned()
        .collect();

    DiffOutcome { changes, rejected }
}

/// True when a record kept its token but changed name, parent or kind.
pub(crate) fn record_moved(stored: &MetadataRecord, remote: &MetadataRecord) -> bool {
    stored.name != remote.name
        || stored.parent_path != remote.parent_path
        || stored.kind != remote.kind
}

/// Checks caller-supplied candidates against one remote listing.
///
/// Candidates already in the stored slice are diffed from their stored row,
/// so a stale token in the store is corrected even when the caller's copy is
/// current. Remote records the caller did not ask about are never reported
/// as added or updated. Anything absent from the listing is removed, whether
/// it came in as a candidate or is only known from the stored slice.
pub fn verify_candidates(
    parent_path: &str,
    candidates: &[MetadataRecord],
    stored: &[MetadataRecord],
    remote: Vec<RemoteRecord>,
) -> DiffOutcome {
    let remote_ids: HashSet<String> = remote
        .iter()
        .filter_map(|record| record.id.clone())
        .collect();
    let stored_by_id: HashMap<&RecordId, &MetadataRecord> =
        stored.iter().map(|record| (&record.id, record)).collect();
    let baseline: Vec<MetadataRecord> = candidates
        .iter()
        .map(|candidate| {
            stored_by_id
                .get(&candidate.id)
                .map_or_else(|| candidate.clone(), |row| (*row).clone())
        })
        .collect();

    let mut outcome = compute_change_set(parent_path, &baseline, remote);
    outcome.changes.added.clear();

    let candidate_ids: HashSet<&RecordId> = candidates.iter().map(|record| &record.id).collect();
    let vanished: Vec<MetadataRecord> = stored
        .iter()
        .filter(|record| {
            !candidate_ids.contains(&record.id) && !remote_ids.contains(record.id.as_str())
        })
        .cloned()
        .collect();
    outcome.changes.removed.extend(vanished);
    outcome
}

fn validate_listing(
    parent_path: &str,
    remote: Vec<RemoteRecord>,
) -> (Vec<MetadataRecord>, Vec<SyncError>) {
    let mut seen = HashSet::new();
    let mut accepted = Vec::with_capacity(remote.len());
    let mut rejected = Vec::new();
    for mut item in remote {
        item.parent_path = parent_path.to_string();
        match item.into_record() {
            Ok(record) if seen.insert(record.id.clone()) => accepted.push(record),
            Ok(record) => rejected.push(SyncError::MalformedRecord(format!(
                "duplicate id {} in listing of {parent_path}",
                record.id
            ))),
            Err(err) => rejected.push(err),
        }
    }
    (accepted, rejected)
}
