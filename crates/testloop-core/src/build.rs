use crate::io::append_build_log;
use anyhow::{Context, Result};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Decides whether a build log describes a failed compile.
pub trait FailurePredicate {
    fn is_failure(&self, log: &str) -> bool;
}

impl<F> FailurePredicate for F
where
    F: Fn(&str) -> bool,
{
    fn is_failure(&self, log: &str) -> bool {
        self(log)
    }
}

/// Substring match on one or more compiler error markers.
#[derive(Debug, Clone)]
pub struct MarkerPredicate {
    markers: Vec<String>,
}

impl MarkerPredicate {
    pub fn new(markers: Vec<String>) -> Self {
        Self {
            markers: markers.into_iter().filter(|m| !m.is_empty()).collect(),
        }
    }
}

impl FailurePredicate for MarkerPredicate {
    fn is_failure(&self, log: &str) -> bool {
        self.markers.iter().any(|m| log.contains(m.as_str()))
    }
}

#[derive(Debug, Clone)]
pub struct BuildLog {
    /// Combined stdout and stderr in arrival order.
    pub output: String,
    pub failed: bool,
    pub exit_ok: bool,
    pub timed_out: bool,
    /// Killed because the caller asked to stop.
    pub interrupted: bool,
}

pub struct BuildRunner {
    command: String,
    jobs: usize,
    timeout: Option<Duration>,
    predicate: Box<dyn FailurePredicate>,
    live_log_path: Option<PathBuf>,
}

impl BuildRunner {
    pub fn new(
        command: impl Into<String>,
        jobs: usize,
        predicate: Box<dyn FailurePredicate>,
    ) -> Self {
        Self {
            command: command.into(),
            jobs: jobs.max(1),
            timeout: None,
            predicate,
            live_log_path: None,
        }
    }

    /// A wall-clock limit after which the build is killed. `0` disables it.
    pub fn with_timeout_minutes(self, minutes: u64) -> Self {
        self.with_timeout(Duration::from_secs(minutes.saturating_mul(60)))
    }

    /// Same as [`with_timeout_minutes`](Self::with_timeout_minutes) at finer
    /// granularity. A zero duration disables the limit.
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = (!limit.is_zero()).then_some(limit);
        self
    }

    /// Mirrors build output, timestamped, into `path`.
    pub fn with_live_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.live_log_path = Some(path.into());
        self
    }

    pub fn command_line(&self) -> String {
        self.command.replace("{jobs}", &self.jobs.to_string())
    }

    pub fn classify(&self, output: &str) -> bool {
        self.predicate.is_failure(output)
    }

    /// Runs the full configure + compile sequence in `project_root`.
    ///
    /// A non-zero exit is not an error; only a spawn failure is.
    pub fn build(&self, project_root: &Path) -> Result<BuildLog> {
        self.build_until(project_root, &|| false)
    }

    /// Like [`build`](Self::build), but kills the build as soon as `stop`
    /// returns true. `stop` is polled a few times per second.
    pub fn build_until(&self, project_root: &Path, stop: &dyn Fn() -> bool) -> Result<BuildLog> {
        let command_line = self.command_line();
        info!(root = %project_root.display(), jobs = self.jobs, "starting build");
        debug!(command = %command_line, "build command");

        let mut command = Command::new("bash");
        command
            .arg("-c")
            .arg(&command_line)
            .current_dir(project_root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group, so a kill reaches cmake/make and subshells too.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = command
            .spawn()
            .with_context(|| format!("failed to execute build command `{command_line}`"))?;

        let stdout = child.stdout.take().context("failed to capture stdout")?;
        let stderr = child.stderr.take().context("failed to capture stderr")?;

        let (tx, rx) = mpsc::channel::<StreamEvent>();
        let stdout_handle = spawn_stream_reader(stdout, tx.clone());
        let stderr_handle = spawn_stream_reader(stderr, tx);

        let started = Instant::now();
        let mut timed_out = false;
        let mut interrupted = false;
        let mut finished = false;
        let mut exit_ok = false;
        let mut open_streams = 2_u8;
        let mut output = String::new();
        let mut live_log = self.live_log_path.as_deref();
        let mut killed_at: Option<Instant> = None;

        loop {
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(StreamEvent::Chunk(chunk)) => {
                    if let Some(path) = live_log {
                        if let Err(err) = append_build_log(path, &chunk) {
                            warn!(error = %format!("{err:#}"), "live build log disabled");
                            live_log = None;
                        }
                    }
                    output.push_str(&chunk);
                }
                Ok(StreamEvent::Closed) => {
                    open_streams = open_streams.saturating_sub(1);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    open_streams = 0;
                }
            }

            if !finished {
                if let Some(status) = child.try_wait().context("failed polling build")? {
                    finished = true;
                    exit_ok = status.success();
                }
            }

            // Descendants may outlive bash while holding the pipes open.
            let still_running = !finished || open_streams > 0;
            if still_running && !timed_out && !interrupted {
                let expired = self.timeout.is_some_and(|limit| started.elapsed() >= limit);
                if expired || stop() {
                    timed_out = expired;
                    interrupted = !expired;
                    kill_process_group(&mut child);
                    killed_at = Some(Instant::now());
                    if !finished {
                        let status = child.wait().context("failed waiting for build")?;
                        finished = true;
                        exit_ok = status.success();
                    }
                    warn!(timed_out, interrupted, "build killed");
                }
            }

            if finished && open_streams == 0 {
                break;
            }
            // A descendant that left the group can hold the pipes forever.
            if killed_at.is_some_and(|at| at.elapsed() >= KILL_GRACE) {
                warn!("build output still open after kill, detaching readers");
                break;
            }
        }

        if open_streams == 0 {
            for handle in [stdout_handle, stderr_handle] {
                let _ = handle.join();
            }
        }

        let failed = self.classify(&output);
        info!(
            failed,
            exit_ok,
            timed_out,
            interrupted,
            secs = started.elapsed().as_secs(),
            "build finished"
        );
        Ok(BuildLog {
            output,
            failed,
            exit_ok,
            timed_out,
            interrupted,
        })
    }
}

#[cfg(unix)]
fn kill_process_group(child: &mut Child) {
    let Ok(pgid) = i32::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };
    // SAFETY: plain signal delivery to the group created at spawn.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) {
    let _ = child.kill();
}

const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum StreamEvent {
    Chunk(String),
    Closed,
}

fn spawn_stream_reader<R>(reader: R, tx: mpsc::Sender<StreamEvent>) -> thread::JoinHandle<()>
where
    R: std::io::Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) | Err(_) => {
                    let _ = tx.send(StreamEvent::Closed);
                    break;
                }
                Ok(_) => {
                    let chunk = String::from_utf8_lossy(&line).into_owned();
                    let _ = tx.send(StreamEvent::Chunk(chunk));
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn marker() -> Box<dyn FailurePredicate> {
        Box::new(MarkerPredicate::new(vec!["error:".to_string()]))
    }

    #[test]
    fn marker_predicate_matches_substring() {
        let p = MarkerPredicate::new(vec!["error:".to_string()]);
        assert!(p.is_failure("foo.cc:3:1: error: expected ';'"));
        assert!(!p.is_failure("warning: unused variable"));
        assert!(!p.is_failure("Error handling is fine"));
    }

    #[test]
    fn empty_markers_never_match() {
        let p = MarkerPredicate::new(vec![String::new()]);
        assert!(!p.is_failure("anything"));
    }

    #[test]
    fn closures_are_predicates() {
        let p = |log: &str| log.contains("LNK2019");
        assert!(p.is_failure("main.obj : error LNK2019"));
    }

    #[test]
    fn jobs_placeholder_is_substituted() {
        let runner = BuildRunner::new("make -j{jobs}", 8, marker());
        assert_eq!(runner.command_line(), "make -j8");
    }

    #[test]
    fn zero_jobs_is_clamped_to_one() {
        let runner = BuildRunner::new("make -j{jobs}", 0, marker());
        assert_eq!(runner.command_line(), "make -j1");
    }

    #[test]
    fn marker_with_zero_exit_is_failed() {
        let dir = tempdir().expect("tempdir");
        let runner = BuildRunner::new("echo 'a.cc:1: error: boom'; exit 0", 1, marker());

        let log = runner.build(dir.path()).expect("build");

        assert!(log.exit_ok);
        assert!(log.failed);
    }

    #[test]
    fn nonzero_exit_without_marker_is_clean() {
        let dir = tempdir().expect("tempdir");
        let runner = BuildRunner::new("echo 'linking'; exit 2", 1, marker());

        let log = runner.build(dir.path()).expect("build");

        assert!(!log.exit_ok);
        assert!(!log.failed);
        assert!(log.output.contains("linking"));
    }

    #[test]
    fn stderr_is_captured_into_combined_output() {
        let dir = tempdir().expect("tempdir");
        let runner = BuildRunner::new("echo out; echo 'b.cc: error: bad' 1>&2", 1, marker());

        let log = runner.build(dir.path()).expect("build");

        assert!(log.output.contains("out\n"));
        assert!(log.output.contains("b.cc: error: bad"));
        assert!(log.failed);
    }

    #[test]
    fn timeout_kills_subshells_of_compound_command() {
        let dir = tempdir().expect("tempdir");
        let runner = BuildRunner::new("(sleep 30; echo late-output); echo done", 1, marker())
            .with_timeout(Duration::from_secs(1));

        let started = Instant::now();
        let log = runner.build(dir.path()).expect("build");

        assert!(started.elapsed() < Duration::from_secs(15));
        assert!(log.timed_out);
        assert!(!log.exit_ok);
        assert!(!log.output.contains("late-output"));
        assert!(!log.output.contains("done"));
    }

    #[test]
    fn timeout_reaches_background_job_holding_the_pipes() {
        let dir = tempdir().expect("tempdir");
        let runner = BuildRunner::new("echo started; sleep 30 &", 1, marker())
            .with_timeout(Duration::from_secs(1));

        let started = Instant::now();
        let log = runner.build(dir.path()).expect("build");

        assert!(started.elapsed() < Duration::from_secs(15));
        assert!(log.timed_out);
        assert!(log.output.contains("started"));
    }

    #[test]
    fn stop_request_kills_running_build() {
        let dir = tempdir().expect("tempdir");
        let command = "echo configuring; (sleep 30; echo late-output)";
        let runner = BuildRunner::new(command, 1, marker());
        let flag = dir.path().join("stop");
        fs::write(&flag, "").expect("write flag");

        let started = Instant::now();
        let log = runner
            .build_until(dir.path(), &|| flag.exists())
            .expect("build");

        assert!(started.elapsed() < Duration::from_secs(15));
        assert!(log.interrupted);
        assert!(!log.timed_out);
        assert!(!log.output.contains("late-output"));
    }

    #[test]
    fn zero_timeout_disables_limit() {
        let runner = BuildRunner::new("true", 1, marker()).with_timeout_minutes(0);
        assert!(runner.timeout.is_none());
    }

    #[test]
    fn unwritable_live_log_does_not_abort_build() {
        let dir = tempdir().expect("tempdir");
        let live = dir.path().join("missing").join("build.log");
        let runner = BuildRunner::new("echo 'x.cc: error: y'", 1, marker()).with_live_log(&live);

        let log = runner.build(dir.path()).expect("build");

        assert!(log.failed);
        assert!(log.output.contains("x.cc: error: y"));
        assert!(!live.exists());
    }

    #[test]
    fn runs_in_project_root_and_mirrors_live_log() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("marker.txt"), "here").expect("write");
        let live = dir.path().join("build.log");
        let runner = BuildRunner::new("cat marker.txt; echo", 1, marker()).with_live_log(&live);

        let log = runner.build(dir.path()).expect("build");

        assert!(log.output.contains("here"));
        assert!(fs::read_to_string(&live).expect("live log").contains("] here"));
    }
}
