//! Best-effort error reporting to the telemetry collaborator.
//!
//! The collector itself is external; the engine's contract is narrow:
//! report uncaught run errors, flush within a bound, and never let either
//! influence the primary exit path.

use std::io::Write;
use std::time::Duration;

use tracing::debug;

use tartlet_core::error::EngineError;

/// Upper bound on the flush at process exit.
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Handle to the telemetry sink.
pub struct Telemetry {
    report_path: Option<std::path::PathBuf>,
}

impl Telemetry {
    /// Creates the sink; the spool lives next to the VM home directory.
    #[must_use]
    pub fn new() -> Self {
        let report_path = tartlet_core::home_dir()
            .ok()
            .map(|home| home.join("crash-reports.log"));
        Self { report_path }
    }

    /// Records a fatal run error. Failures are swallowed.
    pub fn capture_error(&self, error: &EngineError) {
        let Some(path) = &self.report_path else {
            return;
        };
        let line = format!("run-failure\t{error}\n");
        let appended = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(err) = appended {
            debug!(error = %err, "telemetry spool write failed");
        }
    }

    /// Flushes the sink, bounded by [`FLUSH_TIMEOUT`]. The spool is plain
    /// appends, so this only yields to let the collector's uploader (an
    /// external process watching the spool) observe the write.
    pub async fn flush(&self) {
        let _ = tokio::time::timeout(FLUSH_TIMEOUT, tokio::task::yield_now()).await;
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_appends_to_spool() {
        let home = tempfile::tempdir().unwrap();
        let telemetry = Telemetry {
            report_path: Some(home.path().join("crash-reports.log")),
        };

        telemetry.capture_error(&EngineError::VmNotFound("ghost".into()));
        telemetry.capture_error(&EngineError::SuspendFailed("pause failed".into()));

        let spool =
            std::fs::read_to_string(home.path().join("crash-reports.log")).unwrap();
        let lines: Vec<_> = spool.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("ghost"));
        assert!(lines[1].contains("pause failed"));
    }

    #[test]
    fn test_capture_swallows_write_failures() {
        let telemetry = Telemetry {
            report_path: Some("/nonexistent-dir/spool.log".into()),
        };
        // Must not panic.
        telemetry.capture_error(&EngineError::internal("boom"));
    }
}
