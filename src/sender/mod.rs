//! Cycle orchestration.
//!
//! One cycle walks `recover -> connect -> identify -> schema -> per
//! directory { scan -> per group { deletions -> additions } } -> finalize`.
//! Around it sit the periodic scheduler and the liveness monitor; a
//! `sync_in_progress` flag drops overlapping ticks so at most one cycle
//! runs at a time.

use crate::baseline;
use crate::client::{SyncClient, TcpSyncClient};
use crate::config::SenderConfig;
use crate::error::{Result, SyncError};
use crate::identity;
use crate::inventory;
use crate::journal::{self, Journal};
use crate::shipper::{files, schema};
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub struct SyncSender {
    config: SenderConfig,
    sync_in_progress: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

impl SyncSender {
    pub fn new(config: SenderConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            sync_in_progress: Arc::new(AtomicBool::new(false)),
            shutdown,
        }
    }

    /// Shut the scheduler down after the current RPC returns. Coarse by
    /// design: in-flight chunks are not cancelled.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Run cycles at the configured period until `stop()`. The first cycle
    /// starts immediately.
    pub async fn run(&self) -> Result<()> {
        let monitor = self.spawn_monitor();
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.sync_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sync_all().await {
                        Ok(()) => {}
                        Err(e @ SyncError::Connection(_)) => {
                            error!("Sync cycle aborted: {e}");
                            self.stop();
                        }
                        Err(e) => {
                            // Rejection and local I/O trouble do not kill the
                            // daemon; the next tick retries from persisted state.
                            error!("Sync cycle failed: {e}");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        monitor.abort();
        info!("Sender stopped");
        Ok(())
    }

    /// One guarded cycle. Ticks that land while a cycle is still running
    /// are dropped.
    pub async fn sync_all(&self) -> Result<()> {
        if self
            .sync_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Previous cycle still running, skipping this tick");
            return Ok(());
        }

        let result = self.run_cycle().await;
        self.sync_in_progress.store(false, Ordering::SeqCst);
        result
    }

    /// Heartbeat log line at a fixed period while a cycle is in flight.
    fn spawn_monitor(&self) -> JoinHandle<()> {
        let flag = self.sync_in_progress.clone();
        let period = self.config.heartbeat_period();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if flag.load(Ordering::SeqCst) {
                            info!("Sync cycle in progress");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn run_cycle(&self) -> Result<()> {
        let config = &self.config;
        fs::create_dir_all(&config.sender_dir)?;

        // Reconcile an interrupted run before scanning anything.
        journal::reconcile(
            &config.journal_path(),
            &config.baseline_path(),
            &config.snapshot_dir(),
        )?;

        let identity = identity::get_or_create(&config.identity_path())?;

        info!("Connecting to receiver at {}", config.receiver_addr());
        let mut client = SyncClient::connect(&config.receiver_addr()).await?;

        let status = client.check(&config.sender_host, &identity).await?;
        if !status.success {
            return Err(SyncError::Rejected(status.error_msg));
        }
        client.start_sync().await?;
        info!("Cycle started");

        let schema_name = config
            .schema_log
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "schema.log".to_string());
        schema::ship_schema_log(
            &mut client,
            &config.schema_log,
            &config.cursor_path(),
            &schema_name,
        )
        .await?;

        let baseline = baseline::load(&config.baseline_path())?;

        // Baseline entries under none of the data directories ride through
        // to promotion untouched.
        let mut next_baseline: BTreeSet<PathBuf> = baseline
            .iter()
            .filter(|p| !config.data_dirs.iter().any(|d| p.starts_with(d)))
            .cloned()
            .collect();

        {
            let mut journal = Journal::open(&config.journal_path())?;

            for dir in &config.data_dirs {
                let mut inv = inventory::scan_data_dir(dir, &baseline)?;
                info!(
                    dir = %dir.display(),
                    groups = inv.all_groups.len(),
                    "Scanned data directory"
                );

                for group in inv.all_groups.clone() {
                    let deleted = inv.deleted.remove(&group).unwrap_or_default();
                    let to_send = inv.to_send.remove(&group).unwrap_or_default();
                    if deleted.is_empty() && to_send.is_empty() {
                        continue;
                    }

                    let status = client.init(&group).await?;
                    if !status.success {
                        return Err(SyncError::Connection(format!(
                            "init {group}: {}",
                            status.error_msg
                        )));
                    }

                    let last_local = inv.last_local.entry(group.clone()).or_default();

                    journal.begin_deletions()?;
                    files::ship_deletions(&mut client, &mut journal, &group, &deleted, last_local)
                        .await?;

                    journal.begin_data_files()?;
                    files::ship_additions(
                        &mut client,
                        &mut journal,
                        &group,
                        &to_send,
                        last_local,
                        &config.snapshot_dir(),
                    )
                    .await?;
                }

                for files in inv.last_local.values() {
                    next_baseline.extend(files.iter().cloned());
                }
            }
        }

        self.finalize(&mut client, &next_baseline).await;
        Ok(())
    }

    /// Promote the just-shipped file list to be the new baseline and close
    /// out the cycle. Everything past the promotion is best-effort: the
    /// data is already durable on the receiver.
    async fn finalize(&self, client: &mut TcpSyncClient, next_baseline: &BTreeSet<PathBuf>) {
        let config = &self.config;

        if let Err(e) = baseline::promote(&config.baseline_path(), next_baseline) {
            // Keep the journal: the next run re-folds the acknowledged
            // work into the baseline during recovery.
            warn!("Failed to promote baseline: {e}");
            return;
        }

        if let Err(e) = client.end_sync().await {
            warn!("endSync failed after all data shipped: {e}");
        }

        let snapshot_dir = config.snapshot_dir();
        if snapshot_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&snapshot_dir) {
                warn!("Failed to clear snapshot directory: {e}");
            }
        }

        // Commit point: the journal vanishing marks the cycle durable.
        if let Err(e) = fs::remove_file(config.journal_path()) {
            warn!("Failed to remove progress journal: {e}");
        }

        info!(files = next_baseline.len(), "Cycle finished, baseline promoted");
    }
}
