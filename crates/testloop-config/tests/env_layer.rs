use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tempfile::tempdir;
use testloop_config::{load_run_config, CliOverrides, RefineScope};

// The environment is process-wide; tests in this file take turns.
static ENV_LOCK: Mutex<()> = Mutex::new(());

const KEYS: &[&str] = &[
    "RUN_ENV",
    "TESTLOOP_MODEL",
    "TESTLOOP_SOURCE_DIR",
    "TESTLOOP_MAX_REFINE_ATTEMPTS",
    "TESTLOOP_BUILD_JOBS",
    "TESTLOOP_ERROR_MARKERS",
    "TESTLOOP_REFINE_SCOPE",
    "TESTLOOP_REQUEST_TIMEOUT_SECS",
];

/// Holds the lock and clears every key it touched on drop.
struct ScopedEnv {
    _lock: MutexGuard<'static, ()>,
}

impl ScopedEnv {
    fn new(vars: &[(&str, &str)]) -> Self {
        let lock = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for key in KEYS {
            env::remove_var(key);
        }
        env::set_var("RUN_ENV", "production");
        for (key, value) in vars {
            env::set_var(key, value);
        }
        Self { _lock: lock }
    }
}

impl Drop for ScopedEnv {
    fn drop(&mut self) {
        for key in KEYS {
            env::remove_var(key);
        }
    }
}

#[test]
fn env_overrides_file_values() {
    let _env = ScopedEnv::new(&[
        ("TESTLOOP_MODEL", "env-model"),
        ("TESTLOOP_MAX_REFINE_ATTEMPTS", "7"),
        ("TESTLOOP_BUILD_JOBS", "3"),
        ("TESTLOOP_ERROR_MARKERS", "error:, fatal error ,"),
        ("TESTLOOP_REFINE_SCOPE", "unit"),
    ]);
    let dir = tempdir().expect("tempdir");
    fs::write(
        dir.path().join(".testlooprc"),
        "model = \"file-model\"\nmax_refine_attempts = 2\nbuild_jobs = 9\nrefine_scope = \"all\"\nerror_markers = [\"boom\"]\n",
    )
    .expect("testlooprc write");

    let cfg = load_run_config(dir.path(), &CliOverrides::default()).expect("load_run_config");

    assert_eq!(cfg.model, "env-model");
    assert_eq!(cfg.max_refine_attempts, 7);
    assert_eq!(cfg.build_jobs, 3);
    assert_eq!(
        cfg.error_markers,
        vec!["error:".to_string(), "fatal error".to_string()]
    );
    assert_eq!(cfg.refine_scope, RefineScope::Unit);
}

#[test]
fn cli_overrides_env_values() {
    let _env = ScopedEnv::new(&[
        ("TESTLOOP_MODEL", "env-model"),
        ("TESTLOOP_SOURCE_DIR", "env-src"),
        ("TESTLOOP_REQUEST_TIMEOUT_SECS", "30"),
        ("TESTLOOP_REFINE_SCOPE", "all"),
    ]);
    let dir = tempdir().expect("tempdir");

    let cfg = load_run_config(
        dir.path(),
        &CliOverrides {
            model: Some("cli-model".to_string()),
            source_dir: Some(PathBuf::from("cli-src")),
            request_timeout_secs: Some(5),
            refine_scope: Some(RefineScope::Unit),
            ..CliOverrides::default()
        },
    )
    .expect("load_run_config");

    assert_eq!(cfg.model, "cli-model");
    assert_eq!(cfg.source_dir, dir.path().join("cli-src"));
    assert_eq!(cfg.request_timeout_secs, 5);
    assert_eq!(cfg.refine_scope, RefineScope::Unit);
}

#[test]
fn unparsable_env_value_falls_through_to_file() {
    let _env = ScopedEnv::new(&[
        ("TESTLOOP_MAX_REFINE_ATTEMPTS", "lots"),
        ("TESTLOOP_SOURCE_DIR", "env-src"),
    ]);
    let dir = tempdir().expect("tempdir");
    fs::write(dir.path().join(".testlooprc"), "max_refine_attempts = 4\n")
        .expect("testlooprc write");

    let cfg = load_run_config(dir.path(), &CliOverrides::default()).expect("load_run_config");

    assert_eq!(cfg.max_refine_attempts, 4);
    assert_eq!(cfg.source_dir, dir.path().join("env-src"));
}
