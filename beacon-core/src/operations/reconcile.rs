use crate::advertiser::{AdvertisementClient, Metadata};
use crate::context_id;
use crate::error::{BeaconError, Result};
use crate::planner::{self, BatchWindow};
use crate::storage::{AddrInfo, ContentCatalog, LedgerStore, NodeDirectory, RetrievalNode};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_BATCH_WIDTH: u64 = 25_000;

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Tick cadence; also the liveness window for retrieval nodes.
    pub interval: Duration,
    pub batch_width: u64,
    /// Upper bound on a single publish or retract call.
    pub call_timeout: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            batch_width: DEFAULT_BATCH_WIDTH,
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl ReconcileConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(BeaconError::Config(
                "advertisement interval must be positive".to_string(),
            ));
        }
        if self.batch_width == 0 || self.batch_width > u64::from(u32::MAX) {
            return Err(BeaconError::Config(format!(
                "batch width {} must be in 1..={}",
                self.batch_width,
                u32::MAX
            )));
        }
        if self.call_timeout.is_zero() {
            return Err(BeaconError::Config(
                "call timeout must be positive".to_string(),
            ));
        }
        chrono::Duration::from_std(self.interval)
            .map_err(|e| BeaconError::Config(format!("advertisement interval: {}", e)))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// The whole tick was abandoned (empty/unreadable catalog, node listing failure).
    pub skipped: bool,
    pub nodes_seen: usize,
    pub nodes_offline: usize,
    pub nodes_unreachable: usize,
    pub published: usize,
    pub republished: usize,
    pub up_to_date: usize,
    pub failed: usize,
}

enum WindowOutcome {
    UpToDate,
    Published,
    Republished,
    /// Announced, but the ledger write failed; retried next tick.
    Unrecorded,
    Failed,
}

/// Keeps the routing network's view of each retrieval node in line with the
/// content catalog by diffing planned batch windows against the ledger.
#[derive(Clone)]
pub struct ReconcileOperation {
    catalog: Arc<dyn ContentCatalog>,
    nodes: Arc<dyn NodeDirectory>,
    ledger: Arc<LedgerStore>,
    client: Arc<dyn AdvertisementClient>,
    config: ReconcileConfig,
}

impl ReconcileOperation {
    pub fn new(
        catalog: Arc<dyn ContentCatalog>,
        nodes: Arc<dyn NodeDirectory>,
        ledger: Arc<LedgerStore>,
        client: Arc<dyn AdvertisementClient>,
        config: ReconcileConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            catalog,
            nodes,
            ledger,
            client,
            config,
        })
    }

    /// Ticks until `cancel` fires. A tick that overruns the interval causes
    /// the missed ticks to be dropped rather than replayed.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.client.start().await?;

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            batch_width = self.config.batch_width,
            "Starting advertisement loop"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Advertisement loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let report = self.run_tick(Utc::now()).await;
                    tracing::info!(
                        skipped = report.skipped,
                        nodes = report.nodes_seen,
                        offline = report.nodes_offline,
                        published = report.published,
                        republished = report.republished,
                        up_to_date = report.up_to_date,
                        failed = report.failed,
                        "Advertisement tick finished"
                    );
                }
            }
        }

        self.client.shutdown().await
    }

    /// Runs one reconciliation pass as of `now`.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        tracing::info!("Starting advertisement tick");

        let highest = match self.catalog.highest_content_id().await {
            Ok(Some(highest)) => highest,
            Ok(None) => {
                tracing::info!("No contents to advertise");
                report.skipped = true;
                return report;
            }
            Err(error) => {
                tracing::warn!("Failed to get highest content id: {}", error);
                report.skipped = true;
                return report;
            }
        };

        let nodes = match self.nodes.list_nodes().await {
            Ok(nodes) => nodes,
            Err(error) => {
                tracing::error!("Failed to list retrieval nodes: {}", error);
                report.skipped = true;
                return report;
            }
        };

        let liveness = match chrono::Duration::from_std(self.config.interval) {
            Ok(window) => window,
            Err(error) => {
                tracing::error!("Advertisement interval out of range: {}", error);
                report.skipped = true;
                return report;
            }
        };

        for node in nodes {
            report.nodes_seen += 1;

            if !node.is_online(now, liveness) {
                tracing::debug!(node = %node.handle, "Skipping offline retrieval node");
                report.nodes_offline += 1;
                continue;
            }

            let addr_info = match node.addr_info() {
                Ok(addr_info) => addr_info,
                Err(error) => {
                    tracing::error!(
                        node = %node.handle,
                        "Failed to get retrieval node address info: {}",
                        error
                    );
                    report.nodes_unreachable += 1;
                    continue;
                }
            };

            let in_sync = self
                .reconcile_node(&node, &addr_info, highest, &mut report)
                .await;

            if in_sync {
                if let Err(error) = self.nodes.mark_advertised(&node.handle, now).await {
                    tracing::warn!(
                        node = %node.handle,
                        "Failed to record last advertisement: {}",
                        error
                    );
                }
            }
        }

        report
    }

    /// Returns true when every window of the node ended up recorded as advertised.
    async fn reconcile_node(
        &self,
        node: &RetrievalNode,
        addr_info: &AddrInfo,
        highest: u64,
        report: &mut TickReport,
    ) -> bool {
        let mut in_sync = true;

        for window in planner::plan(highest, self.config.batch_width) {
            match self.reconcile_window(node, addr_info, window).await {
                WindowOutcome::UpToDate => report.up_to_date += 1,
                WindowOutcome::Published => report.published += 1,
                WindowOutcome::Republished => report.republished += 1,
                WindowOutcome::Unrecorded => in_sync = false,
                WindowOutcome::Failed => {
                    report.failed += 1;
                    in_sync = false;
                }
            }
        }

        in_sync
    }

    async fn reconcile_window(
        &self,
        node: &RetrievalNode,
        addr_info: &AddrInfo,
        window: BatchWindow,
    ) -> WindowOutcome {
        let BatchWindow { first, count } = window;

        let existing = match self.ledger.get(&node.handle, first) {
            Ok(existing) => existing,
            Err(error) => {
                tracing::error!(
                    node = %node.handle,
                    first_content_id = first,
                    count,
                    "Failed to get published batch: {}",
                    error
                );
                return WindowOutcome::Failed;
            }
        };

        if existing.as_ref().is_some_and(|batch| batch.count == count) {
            tracing::debug!(
                node = %node.handle,
                first_content_id = first,
                count,
                "Skipping already advertised batch"
            );
            return WindowOutcome::UpToDate;
        }

        // Keyed on the configured width so the handle survives window growth.
        let context_id = match context_id::for_window(&addr_info.id, first, self.config.batch_width)
        {
            Ok(context_id) => context_id,
            Err(error) => {
                tracing::error!(
                    node = %node.handle,
                    first_content_id = first,
                    "Failed to make context id: {}",
                    error
                );
                return WindowOutcome::Failed;
            }
        };

        let previous = match &existing {
            Some(_) => match self
                .call("retract", self.client.retract(&addr_info.id, &context_id))
                .await
            {
                Ok(ad_id) => Some(ad_id.to_string()),
                Err(error) => {
                    tracing::warn!(
                        node = %node.handle,
                        first_content_id = first,
                        "Failed to remove batch (but continuing to re-publish anyway): {}",
                        error
                    );
                    None
                }
            },
            None => None,
        };

        let ad_id = match self
            .call(
                "publish",
                self.client.publish(addr_info, &context_id, Metadata::Bitswap),
            )
            .await
        {
            Ok(ad_id) => ad_id,
            Err(error) => {
                tracing::error!(
                    node = %node.handle,
                    first_content_id = first,
                    count,
                    "Failed to publish batch: {}",
                    error
                );
                return WindowOutcome::Failed;
            }
        };

        match existing {
            None => {
                tracing::info!(
                    node = %node.handle,
                    first_content_id = first,
                    count,
                    "Published new batch with advertisement {}",
                    ad_id
                );
                match self.ledger.insert(&node.handle, first, count) {
                    Ok(true) => WindowOutcome::Published,
                    Ok(false) => {
                        tracing::warn!(
                            node = %node.handle,
                            first_content_id = first,
                            count,
                            "Batch was already in the database, recorded count left as is"
                        );
                        WindowOutcome::Published
                    }
                    Err(error) => {
                        tracing::error!(
                            node = %node.handle,
                            first_content_id = first,
                            "Failed to write batch to database: {}",
                            error
                        );
                        WindowOutcome::Unrecorded
                    }
                }
            }
            Some(_) => {
                tracing::info!(
                    node = %node.handle,
                    first_content_id = first,
                    count,
                    "Updated incomplete batch with advertisement {} (removal {})",
                    ad_id,
                    previous.as_deref().unwrap_or("failed")
                );
                match self.ledger.update_count(&node.handle, first, count) {
                    Ok(true) => WindowOutcome::Republished,
                    Ok(false) => {
                        tracing::warn!(
                            node = %node.handle,
                            first_content_id = first,
                            count,
                            "Batch disappeared from the database before its count was updated"
                        );
                        WindowOutcome::Republished
                    }
                    Err(error) => {
                        tracing::error!(
                            node = %node.handle,
                            first_content_id = first,
                            "Failed to update batch in database: {}",
                            error
                        );
                        WindowOutcome::Unrecorded
                    }
                }
            }
        }
    }

    async fn call<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.config.call_timeout, fut)
            .await
            .map_err(|_| {
                BeaconError::Timeout(format!(
                    "{} did not finish within {:?}",
                    what, self.config.call_timeout
                ))
            })?
    }
}
