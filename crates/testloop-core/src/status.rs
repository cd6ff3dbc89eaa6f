use crate::io::{epoch_now, read_json, write_json};
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use testloop_types::{RunReport, RunStatus};

pub const STATUS_FILE: &str = "status.json";
pub const REPORT_FILE: &str = "report.json";
pub const PID_FILE: &str = ".runner_pid";

const STALE_STATE: &str = "stale_runner";

pub fn write_status(runtime_dir: &Path, status: &RunStatus) -> Result<()> {
    write_json(&runtime_dir.join(STATUS_FILE), status)
}

pub fn write_report(runtime_dir: &Path, report: &RunReport) -> Result<()> {
    write_json(&runtime_dir.join(REPORT_FILE), report)
}

pub fn read_report(runtime_dir: &Path) -> Result<RunReport> {
    read_json(&runtime_dir.join(REPORT_FILE))
}

/// Reads the persisted run status. A `running` status whose runner process is
/// gone is rewritten as `stale_runner` and its pid file removed.
pub fn read_status(runtime_dir: &Path) -> Result<RunStatus> {
    let path = runtime_dir.join(STATUS_FILE);
    if !path.is_file() {
        bail!("status file not found at {}", path.display());
    }
    let mut status: RunStatus = read_json(&path)?;
    if status.state == "running" && runner_pid(runtime_dir).map_or(true, |pid| !is_pid_alive(pid)) {
        status.state = STALE_STATE.to_string();
        status.current_unit = None;
        status
            .last_error
            .get_or_insert_with(|| "runner process not found".to_string());
        status.updated_at_epoch = epoch_now();
        // Best effort: a read-only runtime dir still reports the stale state.
        let _ = write_json(&path, &status);
        let _ = fs::remove_file(runtime_dir.join(PID_FILE));
    }
    Ok(status)
}

/// Holds `.runner_pid` for the lifetime of a run.
pub struct RunnerPidGuard {
    path: PathBuf,
}

impl RunnerPidGuard {
    pub fn create(runtime_dir: &Path) -> Result<Self> {
        let path = runtime_dir.join(PID_FILE);
        fs::write(&path, process::id().to_string())
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(Self { path })
    }
}

impl Drop for RunnerPidGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn runner_pid(runtime_dir: &Path) -> Option<i32> {
    fs::read_to_string(runtime_dir.join(PID_FILE))
        .ok()?
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
}

#[cfg(unix)]
fn is_pid_alive(pid: i32) -> bool {
    // SAFETY: signal 0 only probes for existence and permission.
    let rc = unsafe { libc::kill(pid, 0) };
    // EPERM: the process exists under another user.
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn is_pid_alive(_pid: i32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use testloop_types::{UnitOutcome, UnitReport};

    fn make_status(state: &str) -> RunStatus {
        RunStatus {
            state: state.to_string(),
            model: "m".to_string(),
            current_unit: Some("Foo".to_string()),
            units_total: 3,
            units_processed: 1,
            build_count: 2,
            generation_calls: 4,
            last_error: None,
            run_started_at_epoch: 1000,
            updated_at_epoch: 1200,
        }
    }

    #[test]
    fn write_and_read_status() {
        let dir = tempdir().expect("tempdir");
        write_status(dir.path(), &make_status("completed")).expect("write");

        let read = read_status(dir.path()).expect("read");
        assert_eq!(read.state, "completed");
        assert_eq!(read.units_total, 3);
        assert_eq!(read.current_unit.as_deref(), Some("Foo"));
    }

    #[test]
    fn read_status_fails_when_missing() {
        let dir = tempdir().expect("tempdir");
        assert!(read_status(dir.path()).is_err());
    }

    #[test]
    fn running_status_without_pid_is_stale() {
        let dir = tempdir().expect("tempdir");
        write_status(dir.path(), &make_status("running")).expect("write");

        let read = read_status(dir.path()).expect("read");
        assert_eq!(read.state, STALE_STATE);
        assert!(!dir.path().join(PID_FILE).exists());
        assert!(read.current_unit.is_none());
        assert_eq!(read.last_error.as_deref(), Some("runner process not found"));
    }

    #[test]
    fn garbage_pid_file_counts_as_stale() {
        let dir = tempdir().expect("tempdir");
        write_status(dir.path(), &make_status("running")).expect("write");
        fs::write(dir.path().join(PID_FILE), "not-a-pid").expect("write pid");

        let read = read_status(dir.path()).expect("read");
        assert_eq!(read.state, STALE_STATE);
        let persisted: RunStatus =
            read_json(&dir.path().join(STATUS_FILE)).expect("persisted");
        assert_eq!(persisted.state, STALE_STATE);
    }

    #[test]
    fn finished_status_ignores_pid_file() {
        let dir = tempdir().expect("tempdir");
        write_status(dir.path(), &make_status("cancelled")).expect("write");

        let read = read_status(dir.path()).expect("read");
        assert_eq!(read.state, "cancelled");
        assert_eq!(read.current_unit.as_deref(), Some("Foo"));
    }

    #[test]
    fn running_status_with_live_pid_is_kept() {
        let dir = tempdir().expect("tempdir");
        write_status(dir.path(), &make_status("running")).expect("write");
        let _guard = RunnerPidGuard::create(dir.path()).expect("guard");

        let read = read_status(dir.path()).expect("read");
        assert_eq!(read.state, "running");
    }

    #[test]
    fn pid_guard_removes_file_on_drop() {
        let dir = tempdir().expect("tempdir");
        {
            let _guard = RunnerPidGuard::create(dir.path()).expect("guard");
            assert!(dir.path().join(PID_FILE).exists());
        }
        assert!(!dir.path().join(PID_FILE).exists());
    }

    #[test]
    fn report_round_trips_through_runtime_dir() {
        let dir = tempdir().expect("tempdir");
        let report = RunReport {
            units: vec![UnitReport {
                unit: "Foo".to_string(),
                outcome: UnitOutcome::PersistentFailure { refinements: 3 },
                builds: 4,
                started_at_epoch: 1,
                finished_at_epoch: 2,
            }],
            started_at_epoch: 1,
            finished_at_epoch: 2,
        };
        write_report(dir.path(), &report).expect("write");

        let read = read_report(dir.path()).expect("read");
        assert_eq!(read.units.len(), 1);
        assert_eq!(
            read.units[0].outcome,
            UnitOutcome::PersistentFailure { refinements: 3 }
        );
    }
}
