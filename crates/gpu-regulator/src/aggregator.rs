//! Groups one inventory snapshot by tenant and device.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use tracing::debug;

use crate::identity;
use crate::identity::Tenant;

/// A GPU compute process joined with its process-table metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub device_id: String,
    pub pid: u32,
    pub memory_used_mb: u64,
    pub owner_raw: String,
    pub start_time: Option<DateTime<Utc>>,
}

/// A process occupying a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub start_time: Option<DateTime<Utc>>,
}

/// Devices held by one tenant during a single pass.
///
/// Every device maps to at least one process, in inventory order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantUsage {
    pub tenant: Tenant,
    pub devices: BTreeMap<String, Vec<ProcessEntry>>,
}

impl TenantUsage {
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}

/// A device only counts as in use above the threshold; equal is idle.
pub fn is_in_use(memory_used_mb: u64, threshold_mb: u64) -> bool {
    memory_used_mb > threshold_mb
}

/// Builds per-tenant usage, ordered by tenant.
///
/// Records with a blank owner are dropped. A pid listed twice on the same
/// device is kept once.
pub fn aggregate<I>(records: I) -> Vec<TenantUsage>
where
    I: IntoIterator<Item = UsageRecord>,
{
    let mut grouped: BTreeMap<Tenant, BTreeMap<String, Vec<ProcessEntry>>> = BTreeMap::new();

    for record in records {
        let Some(tenant) = identity::resolve(&record.owner_raw) else {
            debug!(pid = record.pid, "Dropping record without owner");
            continue;
        };

        let entry = ProcessEntry {
            pid: record.pid,
            start_time: record.start_time,
        };
        match grouped.entry(tenant).or_default().entry(record.device_id) {
            Entry::Vacant(slot) => {
                slot.insert(vec![entry]);
            }
            Entry::Occupied(mut slot) => {
                let processes = slot.get_mut();
                if !processes.iter().any(|p| p.pid == entry.pid) {
                    processes.push(entry);
                }
            }
        }
    }

    grouped
        .into_iter()
        .map(|(tenant, devices)| TenantUsage { tenant, devices })
        .collect()
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn record(device_id: &str, pid: u32, owner: &str) -> UsageRecord {
        UsageRecord {
            device_id: device_id.to_string(),
            pid,
            memory_used_mb: 4096,
            owner_raw: owner.to_string(),
            start_time: DateTime::from_timestamp(1_700_000_000 + i64::from(pid), 0),
        }
    }

    fn pids(usage: &TenantUsage, device_id: &str) -> Vec<u32> {
        usage.devices[device_id].iter().map(|p| p.pid).collect()
    }

    #[test]
    fn threshold_is_strict() {
        assert!(!is_in_use(2048, 2048));
        assert!(is_in_use(2049, 2048));
        assert!(!is_in_use(0, 0));
        assert!(is_in_use(1, 0));
    }

    #[test]
    fn groups_by_tenant_then_device() {
        let usage = aggregate(vec![
            record("GPU-1", 10, "alice"),
            record("GPU-2", 11, "alice"),
            record("GPU-1", 20, "bob"),
            record("GPU-1", 12, "alice"),
        ]);

        assert_eq!(usage.len(), 2);
        assert_eq!(usage[0].tenant.as_str(), "alice");
        assert_eq!(usage[0].device_count(), 2);
        assert_eq!(pids(&usage[0], "GPU-1"), vec![10, 12]);
        assert_eq!(pids(&usage[0], "GPU-2"), vec![11]);
        assert_eq!(usage[1].tenant.as_str(), "bob");
        assert_eq!(pids(&usage[1], "GPU-1"), vec![20]);
    }

    #[test]
    fn sub_accounts_collapse_into_one_tenant() {
        let usage = aggregate(vec![
            record("GPU-1", 10, "alice-a"),
            record("GPU-2", 11, "b-alice"),
        ]);

        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].tenant.as_str(), "alice");
        assert_eq!(usage[0].device_count(), 2);
    }

    #[test]
    fn blank_owners_are_dropped() {
        let usage = aggregate(vec![record("GPU-1", 10, "  "), record("GPU-1", 11, "")]);

        assert!(usage.is_empty());
    }

    #[test]
    fn duplicate_pid_on_device_is_kept_once() {
        let usage = aggregate(vec![record("GPU-1", 10, "alice"), record("GPU-1", 10, "alice")]);

        assert_eq!(pids(&usage[0], "GPU-1"), vec![10]);
    }

    #[test]
    fn contents_do_not_depend_on_input_order() {
        let records = vec![
            record("GPU-2", 11, "alice"),
            record("GPU-1", 20, "bob"),
            record("GPU-1", 10, "alice"),
        ];
        let mut reversed = records.clone();
        reversed.reverse();

        assert_eq!(aggregate(records), aggregate(reversed));
    }

    #[test]
    fn missing_start_time_is_preserved() {
        let mut r = record("GPU-1", 10, "alice");
        r.start_time = None;

        let usage = aggregate(vec![r]);

        assert_eq!(usage[0].devices["GPU-1"][0].start_time, None);
    }
}
