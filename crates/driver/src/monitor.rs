//! Seam to the host's crash-reporting and sampling facilities
//!
//! Crash-log lookup and hung-process sampling are OS- and deployment-
//! specific; the driver only needs the two operations below. The default
//! [`NullCrashMonitor`] turns both into no-ops, in which case a crash still
//! yields a synthesized placeholder log.

use std::fmt::Debug;

/// Collaborator that can look up OS crash logs and sample hung processes.
pub trait CrashMonitor: Send + Sync + Debug {
    /// Find the crash log the OS produced for a crashed process, if any.
    fn find_crash_log(&self, process_name: &str, pid: Option<u32>) -> Option<String> {
        let _ = (process_name, pid);
        None
    }

    /// Request a sample/backtrace of an unresponsive process.
    fn sample_process(&self, process_name: &str, pid: Option<u32>) {
        let _ = (process_name, pid);
    }
}

/// Monitor used when the host offers no crash reporting.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCrashMonitor;

impl CrashMonitor for NullCrashMonitor {}
