//! Owner and start time lookup for host processes, read from procfs.

use std::ffi::CStr;
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use chrono::DateTime;
use chrono::Utc;
use tracing::debug;

/// What the process table knows about a pid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessMetadata {
    /// Raw OS username of the effective owner.
    pub owner: String,
    /// `None` when the start time could not be determined.
    pub start_time: Option<DateTime<Utc>>,
}

pub trait ProcessMetadataSource: Send + Sync {
    /// Returns `None` when the pid has exited or its owner cannot be read.
    fn lookup(&self, pid: u32) -> Option<ProcessMetadata>;
}

/// Reads `/proc/<pid>/status` for the owner and `/proc/<pid>/stat` for the
/// start time.
pub struct ProcfsMetadata {
    root: PathBuf,
    clock_ticks: u64,
    boot_time: OnceLock<Option<i64>>,
}

impl Default for ProcfsMetadata {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcfsMetadata {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Uses an alternative procfs mount, e.g. the host's `/proc` bind-mounted
    /// into a container.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let clock_ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        Self {
            root: root.into(),
            clock_ticks: u64::try_from(clock_ticks).unwrap_or(100).max(1),
            boot_time: OnceLock::new(),
        }
    }

    fn boot_time(&self) -> Option<i64> {
        *self.boot_time.get_or_init(|| {
            let stat = fs::read_to_string(self.root.join("stat")).ok()?;
            parse_boot_time(&stat)
        })
    }

    fn owner(&self, pid: u32) -> Option<String> {
        let status = fs::read_to_string(self.root.join(pid.to_string()).join("status")).ok()?;
        let uid = parse_effective_uid(&status)?;
        Some(username(uid).unwrap_or_else(|| uid.to_string()))
    }

    fn start_time(&self, pid: u32) -> Option<DateTime<Utc>> {
        let stat = fs::read_to_string(self.root.join(pid.to_string()).join("stat")).ok()?;
        let ticks = parse_start_ticks(&stat)?;
        let boot_time = self.boot_time()?;

        let secs = i64::try_from(ticks / self.clock_ticks).ok()?;
        let nanos = (ticks % self.clock_ticks) * 1_000_000_000 / self.clock_ticks;
        DateTime::from_timestamp(boot_time.checked_add(secs)?, u32::try_from(nanos).ok()?)
    }
}

impl ProcessMetadataSource for ProcfsMetadata {
    fn lookup(&self, pid: u32) -> Option<ProcessMetadata> {
        let Some(owner) = self.owner(pid) else {
            debug!(pid, "Owner unresolved, process likely exited");
            return None;
        };
        let start_time = self.start_time(pid);
        if start_time.is_none() {
            debug!(pid, "Start time unresolved");
        }
        Some(ProcessMetadata { owner, start_time })
    }
}

/// `btime` line of `/proc/stat`, seconds since the epoch.
fn parse_boot_time(stat: &str) -> Option<i64> {
    stat.lines()
        .find_map(|line| line.strip_prefix("btime "))
        .and_then(|value| value.trim().parse().ok())
}

/// Second value of the `Uid:` line (real, effective, saved, fs).
fn parse_effective_uid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|ids| ids.split_whitespace().nth(1))
        .and_then(|uid| uid.parse().ok())
}

/// Field 22 of `/proc/<pid>/stat`, in clock ticks since boot.
fn parse_start_ticks(stat: &str) -> Option<u64> {
    // comm may contain spaces and parentheses; fields resume after the last ')'
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().nth(19)?.parse().ok()
}

fn username(uid: u32) -> Option<String> {
    let mut buf: Vec<libc::c_char> = vec![0; 1024];
    loop {
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        let rc = unsafe {
            libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
        };

        if rc == libc::ERANGE && buf.len() < 1 << 20 {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 || result.is_null() || pwd.pw_name.is_null() {
            return None;
        }
        let name = unsafe { CStr::from_ptr(pwd.pw_name) };
        return Some(name.to_string_lossy().into_owned());
    }
}
