use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cloudsync_core::CloudClient;
use tracing::{debug, error, info, warn};

use crate::config::DaemonConfig;
use crate::sync::backoff::Backoff;
use crate::sync::engine::{Reconciler, ReconcilerConfig, SyncError, SyncReport, TreeReport};
use crate::sync::index::{IndexStore, now_unix};
use crate::sync::record::Selector;
use crate::sync::remote::{HttpRemoteDirectory, RemoteDirectory};
use crate::sync::store::MetadataStore;
use crate::sync::transfer::QueuedDownloads;

pub struct DaemonRuntime {
    config: DaemonConfig,
    index: IndexStore,
    reconciler: Reconciler,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let index = IndexStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open index database at {:?}", config.db_path))?;
        let client = CloudClient::new(&config.server_url, config.token.clone())
            .with_context(|| format!("invalid server url {:?}", config.server_url))?
            .with_page_size(config.page_size);
        Self::from_parts(config, index, Arc::new(HttpRemoteDirectory::new(client))).await
    }

    /// Wires a runtime around an existing index and remote.
    pub async fn from_parts(
        config: DaemonConfig,
        index: IndexStore,
        remote: Arc<dyn RemoteDirectory>,
    ) -> anyhow::Result<Self> {
        index
            .register_account(&config.account)
            .await
            .context("failed to register account")?;
        let reconciler = Reconciler::new(
            remote,
            Arc::new(index.clone()),
            Arc::new(QueuedDownloads::new(index.clone())),
            ReconcilerConfig {
                max_parallel_folders: config.max_parallel_folders,
                ..ReconcilerConfig::default()
            },
        );
        Ok(Self {
            config,
            index,
            reconciler,
        })
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn index(&self) -> &IndexStore {
        &self.index
    }

    /// One full pass over the configured root.
    pub async fn run_once(&self) -> TreeReport {
        let tree = self
            .reconciler
            .synchronize_tree(
                &self.config.account,
                &self.config.remote_root,
                &Selector::manual_refresh(),
            )
            .await;
        log_tree(&tree, "sync pass finished");
        tree
    }

    /// Verifies every folder not read within the configured interval.
    pub async fn verify_sweep(&self) -> anyhow::Result<Vec<SyncReport>> {
        let interval = i64::try_from(self.config.verify_interval.as_secs()).unwrap_or(i64::MAX);
        self.verify_older_than(now_unix().saturating_sub(interval))
            .await
    }

    pub(crate) async fn verify_older_than(&self, cutoff: i64) -> anyhow::Result<Vec<SyncReport>> {
        let account = &self.config.account;
        let stale = self
            .index
            .stale_directories(account, cutoff)
            .await
            .context("failed to list stale directories")?;
        let mut reports = Vec::with_capacity(stale.len());
        for directory in stale {
            let candidates = self
                .index
                .load_slice(account, &directory.server_path)
                .await
                .with_context(|| format!("failed to load {}", directory.server_path))?;
            let report = self
                .reconciler
                .verify_changes(
                    candidates,
                    &directory.server_path,
                    account,
                    self.config.verify_with_download,
                )
                .await;
            if let Some(err) = &report.error {
                warn!(path = %directory.server_path, %err, "verify failed");
            }
            reports.push(report);
        }
        if !reports.is_empty() {
            debug!(folders = reports.len(), "verify sweep finished");
        }
        Ok(reports)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            account = %self.config.account,
            server = %self.config.server_url,
            root = %self.config.remote_root,
            db = %self.config.db_path.display(),
            "cloudsyncd started"
        );

        let runtime = Arc::new(self);

        let poll_runtime = Arc::clone(&runtime);
        let poll_handle = tokio::spawn(async move {
            let backoff = Backoff::default();
            let mut failures = 0u32;
            loop {
                let tree = poll_runtime
                    .reconciler
                    .synchronize_tree(
                        &poll_runtime.config.account,
                        &poll_runtime.config.remote_root,
                        &Selector::background_tick(),
                    )
                    .await;
                log_tree(&tree, "background sync finished");
                let delay = next_poll_delay(
                    &tree,
                    &mut failures,
                    poll_runtime.config.poll_interval,
                    &backoff,
                );
                tokio::time::sleep(delay).await;
            }
        });

        let verify_runtime = Arc::clone(&runtime);
        let verify_handle = tokio::spawn(async move {
            let interval = verify_runtime.config.verify_interval;
            loop {
                tokio::time::sleep(interval).await;
                if let Err(err) = verify_runtime.verify_sweep().await {
                    error!("verify sweep error: {err:#}");
                }
            }
        });

        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        info!("shutdown requested");

        poll_handle.abort();
        verify_handle.abort();
        runtime.reconciler.shutdown().await;
        info!("cloudsyncd stopped");
        Ok(())
    }
}

/// Delay before the next background pass. Remote failures back off
/// exponentially, honouring the largest `Retry-After` the server sent.
fn next_poll_delay(
    tree: &TreeReport,
    failures: &mut u32,
    interval: Duration,
    backoff: &Backoff,
) -> Duration {
    let mut remote_failed = false;
    let mut retry_after: Option<Duration> = None;
    for report in tree.failures() {
        if let Some(SyncError::RemoteUnavailable {
            retry_after: hint, ..
        }) = &report.error
        {
            remote_failed = true;
            retry_after = retry_after.max(*hint);
        }
    }
    if !remote_failed {
        *failures = 0;
        return interval;
    }
    let delay = backoff.delay_after(*failures, retry_after);
    *failures = failures.saturating_add(1);
    warn!(attempt = *failures, ?delay, "remote unavailable, backing off");
    delay
}

fn log_tree(tree: &TreeReport, message: &str) {
    let totals = tree.totals();
    let failed = tree.failures().count();
    if totals.total() > 0 || failed > 0 {
        info!(
            folders = tree.folders(),
            added = totals.added,
            updated = totals.updated,
            removed = totals.removed,
            failed,
            "{message}"
        );
    } else {
        debug!(folders = tree.folders(), "{message}");
    }
}

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
