//! One poll-decide-act pass and the loop that repeats it.
//!
//! A pass takes a fresh inventory snapshot, joins it with process metadata,
//! groups it by tenant, selects victims and only then signals them. Nothing
//! carries over from one pass to the next.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::aggregator;
use crate::aggregator::TenantUsage;
use crate::aggregator::UsageRecord;
use crate::error::RegulatorError;
use crate::error::Result;
use crate::inventory::InventorySource;
use crate::inventory::RawProcess;
use crate::policy;
use crate::policy::EvictionDecision;
use crate::policy::Quota;
use crate::process_meta::ProcessMetadataSource;
use crate::terminator;
use crate::terminator::Terminator;

/// Summary of a single pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassReport {
    /// Records returned by the inventory.
    pub records_seen: usize,
    /// Records above the memory threshold with a resolvable owner.
    pub records_in_use: usize,
    pub tenants: usize,
    pub violations: usize,
    pub decisions: Vec<EvictionDecision>,
    pub terminated: Vec<u32>,
    pub failed: usize,
}

pub struct Regulator {
    inventory: Arc<dyn InventorySource>,
    metadata: Arc<dyn ProcessMetadataSource>,
    terminator: Arc<dyn Terminator>,
    quota: Quota,
}

impl Regulator {
    pub fn new(
        inventory: Arc<dyn InventorySource>,
        metadata: Arc<dyn ProcessMetadataSource>,
        terminator: Arc<dyn Terminator>,
        quota: Quota,
    ) -> Self {
        Self {
            inventory,
            metadata,
            terminator,
            quota,
        }
    }

    pub fn quota(&self) -> &Quota {
        &self.quota
    }

    /// Runs one pass. Never fails: an unavailable source or an unexpected
    /// fault is logged and yields an empty report.
    pub async fn run_pass(&self) -> PassReport {
        debug!(inventory = self.inventory.name(), "Starting regulation pass");
        match self.try_pass().await {
            Ok(report) => {
                info!(
                    records = report.records_seen,
                    in_use = report.records_in_use,
                    tenants = report.tenants,
                    violations = report.violations,
                    terminated = report.terminated.len(),
                    failed = report.failed,
                    "Regulation pass complete"
                );
                report
            }
            Err(err @ RegulatorError::SourceUnavailable { .. }) => {
                warn!(error = %err, "Inventory unavailable, pass ends without decisions");
                PassReport::default()
            }
            Err(err) => {
                error!(error = %err, "Regulation pass aborted");
                PassReport::default()
            }
        }
    }

    async fn try_pass(&self) -> Result<PassReport> {
        let inventory = Arc::clone(&self.inventory);
        let snapshot = tokio::task::spawn_blocking(move || inventory.query()).await??;
        let records_seen = snapshot.len();

        let in_use: Vec<RawProcess> = snapshot
            .into_iter()
            .filter(|p| aggregator::is_in_use(p.memory_used_mb, self.quota.memory_threshold_mb))
            .collect();

        let records = self.resolve(in_use).await?;
        let records_in_use = records.len();
        let usage = aggregator::aggregate(records);
        record_usage_metrics(&usage);

        let violations = policy::evaluate(&usage, &self.quota);
        for violation in &violations {
            warn!(
                tenant = %violation.tenant,
                devices = violation.device_count,
                limit = violation.limit,
                excess = violation.excess(),
                "Quota violation detected"
            );
        }

        // every decision is final before the first signal goes out
        let decisions = policy::decisions(&violations);
        let dispatched = terminator::dispatch(&decisions, self.terminator.as_ref());

        let report = PassReport {
            records_seen,
            records_in_use,
            tenants: usage.len(),
            violations: violations.len(),
            decisions,
            terminated: dispatched.terminated,
            failed: dispatched.failed.len(),
        };
        info!(
            target: "metrics.regulator_pass",
            records = report.records_seen as u64,
            in_use = report.records_in_use as u64,
            tenants = report.tenants as u64,
            violations = report.violations as u64,
            terminated = report.terminated.len() as u64,
            failed = report.failed as u64
        );
        Ok(report)
    }

    /// Looks up owner and start time for every process concurrently and
    /// waits for all of them before returning.
    async fn resolve(&self, processes: Vec<RawProcess>) -> Result<Vec<UsageRecord>> {
        let lookups = processes.into_iter().map(|process| {
            let metadata = Arc::clone(&self.metadata);
            tokio::task::spawn_blocking(move || {
                let found = metadata.lookup(process.pid);
                (process, found)
            })
        });

        let mut records = Vec::new();
        for joined in join_all(lookups).await {
            let (process, found) = joined?;
            let Some(found) = found else {
                debug!(pid = process.pid, "Process metadata unavailable, skipping");
                continue;
            };
            records.push(UsageRecord {
                device_id: process.device_id,
                pid: process.pid,
                memory_used_mb: process.memory_used_mb,
                owner_raw: found.owner,
                start_time: found.start_time,
            });
        }
        Ok(records)
    }

    /// Repeats passes every `interval` until `token` is cancelled. A pass
    /// that is already running completes before the loop exits.
    pub async fn run(&self, interval: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Regulation loop stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if AssertUnwindSafe(self.run_pass()).catch_unwind().await.is_err() {
                        error!("Regulation pass panicked, retrying on next interval");
                    }
                }
            }
        }
    }
}

fn record_usage_metrics(usage: &[TenantUsage]) {
    for tenant in usage {
        let processes: usize = tenant.devices.values().map(Vec::len).sum();
        info!(
            target: "metrics.tenant_usage",
            tag_tenant = tenant.tenant.as_str(),
            devices = tenant.device_count() as u64,
            processes = processes as u64
        );
    }
}
