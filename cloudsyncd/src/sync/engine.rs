use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast, mpsc};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::diff::{
    ChangeCounts, ChangeSet, DiffOutcome, compute_change_set, record_moved, verify_candidates,
};
use super::jobs::{JobTracker, SyncJobKey};
use super::paths::normalize_server_path;
use super::record::{Account, MetadataRecord, RecordId, RecordKind, Selector};
use super::remote::{RemoteDirectory, RemoteError, RemoteListing};
use super::store::{DirectoryUpdate, MetadataStore, SliceUpdate};
use super::transfer::TransferTrigger;

const DEFAULT_MAX_PARALLEL_FOLDERS: usize = 4;
const DEFAULT_REPORT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("unknown or unauthenticated account: {0}")]
    AccountInvalid(String),
    #[error("remote unavailable for {path}: {reason}")]
    RemoteUnavailable {
        path: String,
        reason: String,
        retry_after: Option<Duration>,
    },
    #[error("malformed record: {0}")]
    MalformedRecord(String),
    #[error("failed to read stored metadata: {0}")]
    StoreReadFailed(String),
    #[error("failed to commit metadata: {0}")]
    StoreCommitFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl SyncError {
    fn remote(path: &str, err: &RemoteError) -> Self {
        SyncError::RemoteUnavailable {
            path: path.to_string(),
            reason: err.to_string(),
            retry_after: err.retry_after(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Completed,
    /// Another reconciliation holds the key; nothing was done.
    AlreadyInProgress,
    Failed,
}

/// Completion signal for one folder, file or verify request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub key: SyncJobKey,
    pub selector: Selector,
    pub status: SyncStatus,
    pub error: Option<SyncError>,
    pub counts: ChangeCounts,
    pub rejected: usize,
    pub transfers_requested: usize,
    pub subfolders_queued: usize,
}

impl SyncReport {
    fn new(key: SyncJobKey, selector: Selector) -> Self {
        Self {
            key,
            selector,
            status: SyncStatus::Completed,
            error: None,
            counts: ChangeCounts::default(),
            rejected: 0,
            transfers_requested: 0,
            subfolders_queued: 0,
        }
    }

    fn failed(mut self, error: SyncError) -> Self {
        self.status = SyncStatus::Failed;
        self.error = Some(error);
        self
    }

    pub fn success(&self) -> bool {
        self.status != SyncStatus::Failed
    }
}

/// Reports of a folder and every subfolder reconciled on its behalf.
#[derive(Debug, Clone, Default)]
pub struct TreeReport {
    pub reports: Vec<SyncReport>,
}

impl TreeReport {
    pub fn success(&self) -> bool {
        self.reports.iter().all(SyncReport::success)
    }

    pub fn totals(&self) -> ChangeCounts {
        let mut totals = ChangeCounts::default();
        for report in &self.reports {
            totals += report.counts;
        }
        totals
    }

    pub fn failures(&self) -> impl Iterator<Item = &SyncReport> {
        self.reports.iter().filter(|report| !report.success())
    }

    pub fn folders(&self) -> usize {
        self.reports.len()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    pub max_parallel_folders: usize,
    pub report_capacity: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_parallel_folders: DEFAULT_MAX_PARALLEL_FOLDERS,
            report_capacity: DEFAULT_REPORT_CAPACITY,
        }
    }
}

/// A unit of reconciliation work as submitted by a caller.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub account: Account,
    pub target: SyncTarget,
    pub selector: Selector,
    /// A record for the target the caller already holds.
    pub known_metadata: Option<MetadataRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTarget {
    Folder {
        server_url: String,
    },
    File {
        id: RecordId,
        file_name: String,
        server_url: String,
    },
}

impl SyncRequest {
    pub fn folder(account: &Account, server_url: &str, selector: &Selector) -> Self {
        Self {
            account: account.clone(),
            target: SyncTarget::Folder {
                server_url: server_url.to_string(),
            },
            selector: selector.clone(),
            known_metadata: None,
        }
    }

    pub fn file(
        account: &Account,
        id: &RecordId,
        file_name: &str,
        server_url: &str,
        selector: &Selector,
    ) -> Self {
        Self {
            account: account.clone(),
            target: SyncTarget::File {
                id: id.clone(),
                file_name: file_name.to_string(),
                server_url: server_url.to_string(),
            },
            selector: selector.clone(),
            known_metadata: None,
        }
    }

    pub fn with_known_metadata(mut self, record: MetadataRecord) -> Self {
        self.known_metadata = Some(record);
        self
    }
}

type ReportSink = Option<mpsc::UnboundedSender<SyncReport>>;

struct FolderJob {
    account: Account,
    server_url: String,
    selector: Selector,
    known: Option<MetadataRecord>,
    listing: Option<RemoteListing>,
}

struct Shared {
    remote: Arc<dyn RemoteDirectory>,
    store: Arc<dyn MetadataStore>,
    transfers: Arc<dyn TransferTrigger>,
    jobs: Arc<JobTracker>,
    workers: Arc<Semaphore>,
    tasks: TaskTracker,
    reports: broadcast::Sender<SyncReport>,
}

/// Reconciles cached metadata with remote listings.
///
/// Folder recursion fans out into tracked tasks bounded by
/// `max_parallel_folders`; a task never waits on another folder while it
/// holds a worker permit.
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Shared>,
}

impl Reconciler {
    pub fn new(
        remote: Arc<dyn RemoteDirectory>,
        store: Arc<dyn MetadataStore>,
        transfers: Arc<dyn TransferTrigger>,
        config: ReconcilerConfig,
    ) -> Self {
        let (reports, _) = broadcast::channel(config.report_capacity.max(1));
        Self {
            inner: Arc::new(Shared {
                remote,
                store,
                transfers,
                jobs: Arc::new(JobTracker::new()),
                workers: Arc::new(Semaphore::new(config.max_parallel_folders.max(1))),
                tasks: TaskTracker::new(),
                reports,
            }),
        }
    }

    pub fn jobs(&self) -> &Arc<JobTracker> {
        &self.inner.jobs
    }

    /// Every report produced from now on, including those of fan-out tasks.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncReport> {
        self.inner.reports.subscribe()
    }

    /// Reconciles one folder. Changed subfolders are queued as independent
    /// tasks and are not awaited.
    pub async fn synchronize_folder(
        &self,
        account: &Account,
        server_url: &str,
        selector: &Selector,
    ) -> SyncReport {
        self.run(SyncRequest::folder(account, server_url, selector))
            .await
    }

    pub async fn synchronize_file(
        &self,
        account: &Account,
        id: &RecordId,
        file_name: &str,
        server_url: &str,
        selector: &Selector,
    ) -> SyncReport {
        self.run(SyncRequest::file(account, id, file_name, server_url, selector))
            .await
    }

    pub async fn run(&self, request: SyncRequest) -> SyncReport {
        match request.target {
            SyncTarget::Folder { server_url } => {
                let job = FolderJob {
                    account: request.account,
                    server_url,
                    selector: request.selector,
                    known: request.known_metadata,
                    listing: None,
                };
                self.reconcile_folder(job, None).await
            }
            SyncTarget::File {
                id,
                file_name,
                server_url,
            } => {
                self.reconcile_file(
                    request.account,
                    id,
                    file_name,
                    server_url,
                    request.selector,
                    request.known_metadata,
                )
                .await
            }
        }
    }

    /// Same as `synchronize_folder`, for a caller that already fetched the
    /// folder listing.
    pub async fn synchronize_folder_with_listing(
        &self,
        account: &Account,
        server_url: &str,
        listing: RemoteListing,
        selector: &Selector,
    ) -> SyncReport {
        let job = FolderJob {
            account: account.clone(),
            server_url: server_url.to_string(),
            selector: selector.clone(),
            known: None,
            listing: Some(listing),
        };
        self.reconcile_folder(job, None).await
    }

    /// Reconciles a folder and waits for every subfolder it fans out to.
    pub async fn synchronize_tree(
        &self,
        account: &Account,
        server_url: &str,
        selector: &Selector,
    ) -> TreeReport {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let job = FolderJob {
            account: account.clone(),
            server_url: server_url.to_string(),
            selector: selector.clone(),
            known: None,
            listing: None,
        };
        self.reconcile_folder(job, Some(tx)).await;

        let mut tree = TreeReport::default();
        while let Some(report) = rx.recv().await {
            tree.reports.push(report);
        }
        tree
    }

    /// Re-validates previously known records of one folder against a single
    /// remote listing. With `with_download` false only metadata is updated.
    pub async fn verify_changes(
        &self,
        candidates: Vec<MetadataRecord>,
        server_url: &str,
        account: &Account,
        with_download: bool,
    ) -> SyncReport {
        let selector = Selector::verify_sweep();
        let server_url = match normalize_server_path(server_url) {
            Ok(path) => path,
            Err(err) => {
                let key = SyncJobKey::folder(account, server_url);
                let report = SyncReport::new(key, selector)
                    .failed(SyncError::InvalidRequest(err.to_string()));
                return self.finish(report, &None);
            }
        };
        let key = SyncJobKey::folder(account, server_url.clone());
        let report = SyncReport::new(key.clone(), selector.clone());

        if let Err(err) = self.check_account(account).await {
            return self.finish(report.failed(err), &None);
        }
        let Some(_guard) = self.inner.jobs.acquire(key) else {
            return self.finish(skipped(report), &None);
        };

        let listing = match self.inner.remote.list_folder(account, &server_url).await {
            Ok(listing) => listing,
            Err(err) => {
                warn!(%account, path = %server_url, %err, "verify: remote listing failed");
                return self.finish(report.failed(SyncError::remote(&server_url, &err)), &None);
            }
        };
        let stored = match self.inner.store.load_slice(account, &server_url).await {
            Ok(stored) => stored,
            Err(err) => {
                return self.finish(
                    report.failed(SyncError::StoreReadFailed(err.to_string())),
                    &None,
                );
            }
        };

        let directory_token = listing.folder.as_ref().and_then(|f| f.change_token.clone());
        let outcome = verify_candidates(&server_url, &candidates, &stored, listing.children);
        let report = match self
            .apply(account, &server_url, outcome, directory_token, report)
            .await
        {
            Ok((changes, report)) => {
                let mut report = report;
                if with_download {
                    report.transfers_requested =
                        self.trigger_downloads(account, &changes, &selector).await;
                }
                log_applied(&report, &server_url);
                report
            }
            Err(report) => report,
        };
        self.finish(report, &None)
    }

    /// Waits for every queued fan-out task to finish.
    pub async fn wait_idle(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
    }

    pub async fn shutdown(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }

    // Boxed so the spawned subfolder tasks have a nameable Send future.
    fn reconcile_folder(&self, job: FolderJob, sink: ReportSink) -> BoxFuture<'_, SyncReport> {
        self.reconcile_folder_inner(job, sink).boxed()
    }

    async fn reconcile_folder_inner(&self, job: FolderJob, sink: ReportSink) -> SyncReport {
        let _permit = self.worker_permit().await;
        let server_url = match normalize_server_path(&job.server_url) {
            Ok(path) => path,
            Err(err) => {
                let key = SyncJobKey::folder(&job.account, job.server_url.clone());
                let report = SyncReport::new(key, job.selector)
                    .failed(SyncError::InvalidRequest(err.to_string()));
                return self.finish(report, &sink);
            }
        };
        let account = job.account;
        let selector = job.selector;
        let key = SyncJobKey::folder(&account, server_url.clone());
        let report = SyncReport::new(key.clone(), selector.clone());

        if let Err(err) = self.check_account(&account).await {
            return self.finish(report.failed(err), &sink);
        }
        let Some(_guard) = self.inner.jobs.acquire(key) else {
            info!(%account, path = %server_url, %selector, "folder sync already in progress");
            return self.finish(skipped(report), &sink);
        };

        if job.listing.is_none()
            && let Some(known) = job.known.as_ref().filter(|known| known.is_folder())
            && known.change_token.is_some()
        {
            match self.inner.store.directory(&account, &server_url).await {
                Ok(Some(dir)) if dir.change_token == known.change_token => {
                    debug!(%account, path = %server_url, "folder token unchanged, listing skipped");
                    return self.finish(report, &sink);
                }
                Ok(_) => {}
                Err(err) => {
                    return self.finish(
                        report.failed(SyncError::StoreReadFailed(err.to_string())),
                        &sink,
                    );
                }
            }
        }

        let listing = match job.listing {
            Some(listing) => listing,
            None => match self.inner.remote.list_folder(&account, &server_url).await {
                Ok(listing) => listing,
                Err(err) => {
                    warn!(%account, path = %server_url, %selector, %err, "remote listing failed");
                    return self.finish(report.failed(SyncError::remote(&server_url, &err)), &sink);
                }
            },
        };

        let local = match self.inner.store.load_slice(&account, &server_url).await {
            Ok(local) => local,
            Err(err) => {
                return self.finish(
                    report.failed(SyncError::StoreReadFailed(err.to_string())),
                    &sink,
                );
            }
        };

        let directory_token = listing
            .folder
            .as_ref()
            .and_then(|folder| folder.change_token.clone())
            .or_else(|| job.known.as_ref().and_then(|k| k.change_token.clone()));
        let outcome = compute_change_set(&server_url, &local, listing.children);
        let (changes, mut report) = match self
            .apply(&account, &server_url, outcome, directory_token, report)
            .await
        {
            Ok(applied) => applied,
            Err(report) => return self.finish(report, &sink),
        };

        report.transfers_requested = self.trigger_downloads(&account, &changes, &selector).await;

        let subfolders = self.subfolders_to_visit(&account, &server_url, &changes).await;
        report.subfolders_queued = subfolders.len();
        for folder in subfolders {
            self.spawn_folder(
                FolderJob {
                    account: account.clone(),
                    server_url: folder.server_path(),
                    selector: selector.clone(),
                    known: Some(folder),
                    listing: None,
                },
                sink.clone(),
            );
        }

        log_applied(&report, &server_url);
        self.finish(report, &sink)
    }

    async fn reconcile_file(
        &self,
        account: Account,
        id: RecordId,
        file_name: String,
        server_url: String,
        selector: Selector,
        known: Option<MetadataRecord>,
    ) -> SyncReport {
        let key = SyncJobKey::file(&account, &id);
        let report = SyncReport::new(key.clone(), selector.clone());
        let server_url = match normalize_server_path(&server_url) {
            Ok(path) => path,
            Err(err) => {
                return self.finish(
                    report.failed(SyncError::InvalidRequest(err.to_string())),
                    &None,
                );
            }
        };

        if let Err(err) = self.check_account(&account).await {
            return self.finish(report.failed(err), &None);
        }
        let Some(_guard) = self.inner.jobs.acquire(key) else {
            info!(%account, %id, file = %file_name, "file sync already in progress");
            return self.finish(skipped(report), &None);
        };

        let remote = match known.filter(|record| record.id == id) {
            Some(record) => Some(record.into()),
            None => match self.inner.remote.fetch_record(&account, &id).await {
                Ok(remote) => remote,
                Err(err) => {
                    warn!(%account, %id, file = %file_name, %err, "remote record fetch failed");
                    return self.finish(report.failed(SyncError::remote(&server_url, &err)), &None);
                }
            },
        };

        let local = match self.inner.store.load_slice(&account, &server_url).await {
            Ok(local) => local,
            Err(err) => {
                return self.finish(
                    report.failed(SyncError::StoreReadFailed(err.to_string())),
                    &None,
                );
            }
        };
        let stored = local.into_iter().find(|record| record.id == id);

        let mut outcome = DiffOutcome::default();
        let mut target_slice = server_url.clone();
        match remote.map(|remote| remote.into_record()) {
            None => {
                if let Some(stored) = stored {
                    debug!(%account, %id, file = %file_name, "file removed remotely");
                    outcome.changes.removed.push(stored);
                }
            }
            Some(Err(err)) => {
                warn!(%account, %id, file = %file_name, %err, "skipping malformed record");
                outcome.rejected.push(err);
            }
            Some(Ok(record)) if record.id != id => {
                let err = SyncError::MalformedRecord(format!(
                    "requested {id} but server answered with {}",
                    record.id
                ));
                warn!(%account, %err, "skipping mismatched record");
                outcome.rejected.push(err);
            }
            Some(Ok(record)) => {
                target_slice = record.parent_path.clone();
                match stored {
                    None => outcome.changes.added.push(record),
                    Some(stored) if stored.change_token != record.change_token => {
                        outcome.changes.updated.push(record)
                    }
                    // A move keeps the token but lands in another slice.
                    Some(stored) if stored.parent_path != record.parent_path => {
                        outcome.changes.updated.push(record)
                    }
                    Some(stored) if record_moved(&stored, &record) => {
                        outcome.changes.refreshed.push(record.clone());
                        outcome.changes.unchanged.push(record)
                    }
                    Some(_) => outcome.changes.unchanged.push(record),
                }
            }
        }

        let (changes, mut report) = match self
            .apply_without_directory(&account, &target_slice, outcome, report)
            .await
        {
            Ok(applied) => applied,
            Err(report) => return self.finish(report, &None),
        };
        report.transfers_requested = self.trigger_downloads(&account, &changes, &selector).await;
        log_applied(&report, &target_slice);
        self.finish(report, &None)
    }

    async fn apply(
        &self,
        account: &Account,
        server_url: &str,
        outcome: DiffOutcome,
        directory_token: Option<String>,
        report: SyncReport,
    ) -> Result<(ChangeSet, SyncReport), SyncReport> {
        self.commit(
            account,
            server_url,
            outcome,
            Some(DirectoryUpdate {
                change_token: directory_token,
            }),
            report,
        )
        .await
    }

    async fn apply_without_directory(
        &self,
        account: &Account,
        server_url: &str,
        outcome: DiffOutcome,
        report: SyncReport,
    ) -> Result<(ChangeSet, SyncReport), SyncReport> {
        self.commit(account, server_url, outcome, None, report).await
    }

    async fn commit(
        &self,
        account: &Account,
        server_url: &str,
        outcome: DiffOutcome,
        directory: Option<DirectoryUpdate>,
        mut report: SyncReport,
    ) -> Result<(ChangeSet, SyncReport), SyncReport> {
        for err in &outcome.rejected {
            warn!(%account, path = %server_url, %err, "record rejected");
        }
        report.rejected = outcome.rejected.len();

        let changes = outcome.changes;
        if changes.is_empty() && directory.is_none() {
            return Ok((changes, report));
        }
        let update = SliceUpdate {
            added: changes.added.clone(),
            updated: changes
                .updated
                .iter()
                .chain(changes.refreshed.iter())
                .cloned()
                .collect(),
            removed: changes.removed.clone(),
            directory,
        };
        if let Err(err) = self
            .inner
            .store
            .apply_slice(account, server_url, &update)
            .await
        {
            warn!(%account, path = %server_url, %err, "metadata commit failed");
            return Err(report.failed(SyncError::StoreCommitFailed(err.to_string())));
        }
        report.counts = changes.counts();
        Ok((changes, report))
    }

    // Runs only after the slice has committed.
    async fn trigger_downloads(
        &self,
        account: &Account,
        changes: &ChangeSet,
        selector: &Selector,
    ) -> usize {
        let mut requested = 0;
        for record in changes
            .changed()
            .filter(|record| record.kind == RecordKind::File)
        {
            self.inner
                .transfers
                .request_download(account, record, selector)
                .await;
            requested += 1;
        }
        requested
    }

    /// Added or updated subfolders, plus unchanged ones whose own listing
    /// never caught up with the token their parent reports.
    async fn subfolders_to_visit(
        &self,
        account: &Account,
        server_url: &str,
        changes: &ChangeSet,
    ) -> Vec<MetadataRecord> {
        let mut visit: Vec<MetadataRecord> = changes
            .changed()
            .filter(|record| record.is_folder())
            .cloned()
            .collect();

        let unchanged_folders: Vec<&MetadataRecord> = changes
            .unchanged
            .iter()
            .filter(|record| record.is_folder())
            .collect();
        if unchanged_folders.is_empty() {
            return visit;
        }
        let read: HashMap<String, Option<String>> = match self
            .inner
            .store
            .child_directories(account, server_url)
            .await
        {
            Ok(dirs) => dirs
                .into_iter()
                .map(|dir| (dir.server_path, dir.change_token))
                .collect(),
            Err(err) => {
                warn!(%account, path = %server_url, %err, "could not check subfolder state");
                return visit;
            }
        };
        for folder in unchanged_folders {
            let caught_up = read
                .get(&folder.server_path())
                .is_some_and(|token| token.is_some() && *token == folder.change_token);
            if !caught_up {
                visit.push(folder.clone());
            }
        }
        visit
    }

    fn spawn_folder(&self, job: FolderJob, sink: ReportSink) {
        let this = self.clone();
        self.inner.tasks.spawn(async move {
            this.reconcile_folder(job, sink).await;
        });
    }

    async fn worker_permit(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.inner.workers).acquire_owned().await.ok()
    }

    async fn check_account(&self, account: &Account) -> Result<(), SyncError> {
        match self.inner.store.has_account(account).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(SyncError::AccountInvalid(account.to_string())),
            Err(err) => Err(SyncError::StoreReadFailed(err.to_string())),
        }
    }

    fn finish(&self, report: SyncReport, sink: &ReportSink) -> SyncReport {
        if let Some(sink) = sink {
            let _ = sink.send(report.clone());
        }
        let _ = self.inner.reports.send(report.clone());
        report
    }
}

fn skipped(mut report: SyncReport) -> SyncReport {
    report.status = SyncStatus::AlreadyInProgress;
    report
}

fn log_applied(report: &SyncReport, path: &str) {
    if report.counts.total() > 0 {
        info!(
            key = %report.key,
            path,
            selector = %report.selector,
            added = report.counts.added,
            updated = report.counts.updated,
            removed = report.counts.removed,
            transfers = report.transfers_requested,
            subfolders = report.subfolders_queued,
            "metadata reconciled"
        );
    } else {
        debug!(key = %report.key, path, selector = %report.selector, "no changes");
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
