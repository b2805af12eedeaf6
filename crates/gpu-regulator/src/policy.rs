//! Quota evaluation and victim selection.
//!
//! A tenant over its device limit keeps the devices whose earliest process
//! started first and loses one process on each of the remaining devices.
//! On a losing device the newest process is stopped, so long-running jobs
//! survive enforcement. Processes without a known start time are treated as
//! the newest. A tenant with no known start time at all has its devices
//! ordered by their lowest pid instead. Selection is a pure function of its
//! input.

use std::cmp::Ordering;

use chrono::DateTime;
use chrono::Utc;

use crate::aggregator::ProcessEntry;
use crate::aggregator::TenantUsage;
use crate::identity::Tenant;

pub const DEFAULT_MEMORY_THRESHOLD_MB: u64 = 2048;
pub const DEFAULT_MAX_DEVICES_PER_TENANT: usize = 2;

/// Process-wide limits, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    /// Processes at or below this much device memory are not counted.
    pub memory_threshold_mb: u64,
    pub max_devices_per_tenant: usize,
}

impl Default for Quota {
    fn default() -> Self {
        Self {
            memory_threshold_mb: DEFAULT_MEMORY_THRESHOLD_MB,
            max_devices_per_tenant: DEFAULT_MAX_DEVICES_PER_TENANT,
        }
    }
}

/// One process selected for termination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionDecision {
    pub tenant: Tenant,
    pub device_id: String,
    pub pid: u32,
}

/// A tenant over quota together with the evictions that bring it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub tenant: Tenant,
    pub device_count: usize,
    pub limit: usize,
    /// One decision per excess device, each on a distinct device.
    pub evictions: Vec<EvictionDecision>,
}

impl Violation {
    pub fn excess(&self) -> usize {
        self.device_count.saturating_sub(self.limit)
    }
}

/// Evaluates every tenant, returning only those in violation.
pub fn evaluate(usage: &[TenantUsage], quota: &Quota) -> Vec<Violation> {
    usage
        .iter()
        .filter_map(|tenant| evaluate_tenant(tenant, quota.max_devices_per_tenant))
        .collect()
}

/// Returns `None` when the tenant is within `limit` devices.
pub fn evaluate_tenant(usage: &TenantUsage, limit: usize) -> Option<Violation> {
    let device_count = usage.device_count();
    if device_count <= limit {
        return None;
    }

    // with no start time anywhere, fall back to pid order for devices too
    let all_unknown = usage
        .devices
        .values()
        .flatten()
        .all(|p| p.start_time.is_none());

    let mut devices: Vec<DeviceRank<'_>> = usage
        .devices
        .iter()
        .map(|(device_id, processes)| DeviceRank {
            device_id,
            earliest_start: earliest_start(processes),
            lowest_pid: processes.iter().map(|p| p.pid).min().unwrap_or(u32::MAX),
        })
        .collect();
    if all_unknown {
        devices.sort_by(|a, b| {
            a.lowest_pid
                .cmp(&b.lowest_pid)
                .then_with(|| a.device_id.cmp(b.device_id))
        });
    } else {
        devices.sort_by(protection_order);
    }

    let evictions = devices
        .into_iter()
        .skip(limit)
        .filter_map(|rank| {
            let victim = select_victim(&usage.devices[rank.device_id])?;
            Some(EvictionDecision {
                tenant: usage.tenant.clone(),
                device_id: rank.device_id.clone(),
                pid: victim.pid,
            })
        })
        .collect();

    Some(Violation {
        tenant: usage.tenant.clone(),
        device_count,
        limit,
        evictions,
    })
}

struct DeviceRank<'a> {
    device_id: &'a String,
    earliest_start: Option<DateTime<Utc>>,
    lowest_pid: u32,
}

fn earliest_start(processes: &[ProcessEntry]) -> Option<DateTime<Utc>> {
    processes.iter().filter_map(|p| p.start_time).min()
}

/// Most protected device first: known earliest start ascending, unknown
/// last, then device id.
fn protection_order(a: &DeviceRank<'_>, b: &DeviceRank<'_>) -> Ordering {
    a.earliest_start
        .is_none()
        .cmp(&b.earliest_start.is_none())
        .then_with(|| a.earliest_start.cmp(&b.earliest_start))
        .then_with(|| a.device_id.cmp(b.device_id))
}

/// Newest process on the device; unknown start counts as newest, ties go
/// to the lowest pid.
pub fn select_victim(processes: &[ProcessEntry]) -> Option<&ProcessEntry> {
    processes.iter().min_by(|a, b| {
        let newest_first = match (a.start_time, b.start_time) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a_start), Some(b_start)) => b_start.cmp(&a_start),
        };
        newest_first.then_with(|| a.pid.cmp(&b.pid))
    })
}

/// Flattens violations into the decisions to execute.
pub fn decisions(violations: &[Violation]) -> Vec<EvictionDecision> {
    violations
        .iter()
        .flat_map(|v| v.evictions.iter().cloned())
        .collect()
}
