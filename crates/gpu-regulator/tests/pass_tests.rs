use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::DateTime;
use chrono::Utc;
use gpu_regulator::error::Result;
use gpu_regulator::inventory::parse_csv;
use gpu_regulator::inventory::InventorySource;
use gpu_regulator::inventory::RawProcess;
use gpu_regulator::process_meta::ProcessMetadata;
use gpu_regulator::process_meta::ProcessMetadataSource;
use gpu_regulator::terminator::Terminator;
use gpu_regulator::Quota;
use gpu_regulator::Regulator;
use gpu_regulator::RegulatorError;
use similar_asserts::assert_eq;
use test_log::test;

/// Serves a captured `nvidia-smi` CSV dump.
struct CsvInventory(&'static str);

impl InventorySource for CsvInventory {
    fn name(&self) -> &'static str {
        "csv"
    }

    fn query(&self) -> Result<Vec<RawProcess>> {
        Ok(parse_csv(self.0))
    }
}

struct ProcessTable(HashMap<u32, (&'static str, Option<i64>)>);

impl ProcessMetadataSource for ProcessTable {
    fn lookup(&self, pid: u32) -> Option<ProcessMetadata> {
        self.0.get(&pid).map(|(owner, minute)| ProcessMetadata {
            owner: owner.to_string(),
            start_time: minute.and_then(at),
        })
    }
}

/// Fails for pids that already exited, succeeds otherwise.
#[derive(Default)]
struct FlakyTerminator {
    gone: Vec<u32>,
    signalled: Mutex<Vec<u32>>,
}

impl Terminator for FlakyTerminator {
    fn terminate(&self, pid: u32) -> Result<()> {
        self.signalled.lock().expect("poisoned").push(pid);
        if self.gone.contains(&pid) {
            return Err(RegulatorError::TerminationFailure {
                pid,
                reason: "No such process (os error 3)".to_string(),
            });
        }
        Ok(())
    }
}

fn at(minute: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(1_700_038_800 + minute * 60, 0)
}

const SNAPSHOT: &str = "\
GPU-0000, 100, 8000
GPU-1111, 101, 8000
GPU-2222, 102, 8000
GPU-2222, 103, 9000
GPU-3333, 200, 12000
GPU-0000, 300, 4000
GPU-1111, 301, 4000
GPU-2222, 302, 1024
GPU-3333, 303, 2048
GPU-3333, 999, [N/A]
garbage line
";

fn table() -> ProcessTable {
    ProcessTable(HashMap::from([
        (100, ("ml-alice", Some(0))),
        (101, ("alice", Some(5))),
        (102, ("alice-dev", Some(10))),
        (103, ("alice", Some(20))),
        (200, ("bob", None)),
        (300, ("carol", Some(1))),
        (301, ("carol", Some(2))),
        (302, ("carol", Some(3))),
        (303, ("carol", Some(4))),
    ]))
}

fn decisions_by_tenant(report: &gpu_regulator::PassReport) -> BTreeMap<String, Vec<(String, u32)>> {
    let mut grouped: BTreeMap<String, Vec<(String, u32)>> = BTreeMap::new();
    for decision in &report.decisions {
        grouped
            .entry(decision.tenant.to_string())
            .or_default()
            .push((decision.device_id.clone(), decision.pid));
    }
    grouped
}

#[test(tokio::test)]
async fn full_pass_over_mixed_snapshot() {
    let terminator = Arc::new(FlakyTerminator::default());
    let regulator = Regulator::new(
        Arc::new(CsvInventory(SNAPSHOT)),
        Arc::new(table()),
        terminator.clone(),
        Quota::default(),
    );

    let report = regulator.run_pass().await;

    // two malformed lines are dropped before the pass sees them
    assert_eq!(report.records_seen, 9);
    // pids 302 and 303 are at or below the 2048 MB threshold
    assert_eq!(report.records_in_use, 7);
    assert_eq!(report.tenants, 3);
    assert_eq!(report.violations, 1);
    assert_eq!(
        decisions_by_tenant(&report),
        BTreeMap::from([("alice".to_string(), vec![("GPU-2222".to_string(), 103)])])
    );
    assert_eq!(report.terminated, vec![103]);
}

#[test(tokio::test)]
async fn failed_termination_is_reported_and_retried_next_pass() {
    let terminator = Arc::new(FlakyTerminator {
        gone: vec![103],
        ..Default::default()
    });
    let regulator = Regulator::new(
        Arc::new(CsvInventory(SNAPSHOT)),
        Arc::new(table()),
        terminator.clone(),
        Quota::default(),
    );

    let first = regulator.run_pass().await;
    let second = regulator.run_pass().await;

    assert_eq!(first.failed, 1);
    assert!(first.terminated.is_empty());
    assert_eq!(first.decisions, second.decisions);
    assert_eq!(*terminator.signalled.lock().expect("poisoned"), vec![103, 103]);
}

#[test(tokio::test)]
async fn tighter_quota_evicts_across_tenants() {
    let terminator = Arc::new(FlakyTerminator::default());
    let regulator = Regulator::new(
        Arc::new(CsvInventory(SNAPSHOT)),
        Arc::new(table()),
        terminator,
        Quota {
            memory_threshold_mb: 1000,
            max_devices_per_tenant: 1,
        },
    );

    let report = regulator.run_pass().await;

    assert_eq!(
        decisions_by_tenant(&report),
        BTreeMap::from([
            (
                "alice".to_string(),
                vec![
                    ("GPU-1111".to_string(), 101),
                    ("GPU-2222".to_string(), 103),
                ]
            ),
            (
                "carol".to_string(),
                vec![
                    ("GPU-1111".to_string(), 301),
                    ("GPU-2222".to_string(), 302),
                    ("GPU-3333".to_string(), 303),
                ]
            ),
        ])
    );
}
