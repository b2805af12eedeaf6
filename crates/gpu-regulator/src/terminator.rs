//! Termination of selected processes.

use std::collections::HashSet;
use std::io;

use tracing::info;
use tracing::warn;

use crate::error::RegulatorError;
use crate::error::Result;
use crate::policy::EvictionDecision;

/// Signal delivered to victim processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Signal {
    /// SIGTERM, lets the job clean up
    Term,
    /// SIGKILL
    Kill,
}

impl Signal {
    fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

pub trait Terminator: Send + Sync {
    /// Signals `pid`. Calling this for a pid that already exited is an
    /// error, never a panic.
    fn terminate(&self, pid: u32) -> Result<()>;
}

/// Sends a real signal with `kill(2)`.
pub struct SignalTerminator {
    signal: Signal,
}

impl SignalTerminator {
    pub fn new(signal: Signal) -> Self {
        Self { signal }
    }
}

impl Terminator for SignalTerminator {
    fn terminate(&self, pid: u32) -> Result<()> {
        // pid 0 and negative values address process groups
        let raw_pid = match libc::pid_t::try_from(pid) {
            Ok(raw_pid) if raw_pid > 0 => raw_pid,
            _ => {
                return Err(RegulatorError::TerminationFailure {
                    pid,
                    reason: "pid out of range".to_string(),
                })
            }
        };

        let rc = unsafe { libc::kill(raw_pid, self.signal.as_raw()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(RegulatorError::TerminationFailure {
                pid,
                reason: io::Error::last_os_error().to_string(),
            })
        }
    }
}

/// Logs instead of signalling.
pub struct DryRunTerminator;

impl Terminator for DryRunTerminator {
    fn terminate(&self, pid: u32) -> Result<()> {
        info!(pid, "Dry run, not sending signal");
        Ok(())
    }
}

/// Outcome of one dispatch round.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub terminated: Vec<u32>,
    pub failed: Vec<RegulatorError>,
}

/// Attempts every decision independently. A failure never stops the
/// remaining attempts and successes are never rolled back. A pid chosen on
/// several devices is signalled once.
pub fn dispatch(decisions: &[EvictionDecision], terminator: &dyn Terminator) -> DispatchReport {
    let mut report = DispatchReport::default();
    let mut attempted = HashSet::new();

    for decision in decisions {
        if !attempted.insert(decision.pid) {
            continue;
        }

        info!(
            tenant = %decision.tenant,
            device = %decision.device_id,
            pid = decision.pid,
            "Terminating process"
        );
        match terminator.terminate(decision.pid) {
            Ok(()) => {
                info!(pid = decision.pid, "Process terminated");
                report.terminated.push(decision.pid);
            }
            Err(err) => {
                warn!(pid = decision.pid, error = %err, "Termination failed");
                report.failed.push(err);
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::identity;

    /// Records calls and fails for the configured pids.
    #[derive(Default)]
    struct RecordingTerminator {
        calls: Mutex<Vec<u32>>,
        failing: Vec<u32>,
    }

    impl Terminator for RecordingTerminator {
        fn terminate(&self, pid: u32) -> Result<()> {
            self.calls.lock().expect("poisoned").push(pid);
            if self.failing.contains(&pid) {
                Err(RegulatorError::TerminationFailure {
                    pid,
                    reason: "No such process".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn decision(device_id: &str, pid: u32) -> EvictionDecision {
        EvictionDecision {
            tenant: identity::resolve("alice").expect("valid owner"),
            device_id: device_id.to_string(),
            pid,
        }
    }

    #[test]
    fn failure_does_not_short_circuit() {
        let terminator = RecordingTerminator {
            failing: vec![2],
            ..Default::default()
        };

        let report = dispatch(
            &[decision("D1", 1), decision("D2", 2), decision("D3", 3)],
            &terminator,
        );

        assert_eq!(*terminator.calls.lock().expect("poisoned"), vec![1, 2, 3]);
        assert_eq!(report.terminated, vec![1, 3]);
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(
            report.failed[0],
            RegulatorError::TerminationFailure { pid: 2, .. }
        ));
    }

    #[test]
    fn pid_on_two_devices_is_signalled_once() {
        let terminator = RecordingTerminator::default();

        let report = dispatch(&[decision("D1", 7), decision("D2", 7)], &terminator);

        assert_eq!(*terminator.calls.lock().expect("poisoned"), vec![7]);
        assert_eq!(report.terminated, vec![7]);
    }

    #[test]
    fn empty_decisions_do_nothing() {
        let terminator = RecordingTerminator::default();

        let report = dispatch(&[], &terminator);

        assert!(report.terminated.is_empty());
        assert!(report.failed.is_empty());
        assert!(terminator.calls.lock().expect("poisoned").is_empty());
    }

    #[test]
    fn dry_run_always_succeeds() {
        assert!(DryRunTerminator.terminate(12345).is_ok());
    }

    #[test]
    fn signal_refuses_process_group_pids() {
        let terminator = SignalTerminator::new(Signal::Term);

        assert!(terminator.terminate(0).is_err());
        assert!(terminator.terminate(u32::MAX).is_err());
    }

    #[test]
    fn signal_to_exited_pid_is_a_failure() {
        let mut child = std::process::Command::new("true")
            .spawn()
            .expect("spawn `true`");
        let pid = child.id();
        child.wait().expect("reap child");

        let err = SignalTerminator::new(Signal::Term)
            .terminate(pid)
            .expect_err("reaped pid should not accept signals");

        assert!(matches!(err, RegulatorError::TerminationFailure { .. }));
    }
}
