use anyhow::Result;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::process::Command;
use testloop_config::{load_run_config, CliOverrides, RunConfig, RC_FILE};
use testloop_core::discover_units;

const DEFAULT_RUNTIME_DIR: &str = ".testloop";

#[derive(Debug, Clone, Serialize)]
pub struct DoctorCheck {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub cwd: String,
    pub ok: bool,
    pub checks: Vec<DoctorCheck>,
    pub warnings: Vec<String>,
    pub attempted_fixes: Vec<String>,
}

pub fn run_doctor(cwd: &Path, fix: bool) -> Result<DoctorReport> {
    let mut attempted_fixes = Vec::new();
    if fix {
        attempted_fixes = apply_doctor_fixes(cwd)?;
    }

    let checks = collect_doctor_checks(cwd);
    let warnings = collect_doctor_warnings(cwd);
    let failed = checks.iter().filter(|c| !c.ok).count();

    Ok(DoctorReport {
        cwd: cwd.display().to_string(),
        ok: failed == 0,
        checks,
        warnings,
        attempted_fixes,
    })
}

pub fn collect_doctor_checks(cwd: &Path) -> Vec<DoctorCheck> {
    let loaded = load_run_config(cwd, &CliOverrides::default());
    let mut checks = vec![check("config_loadable", match &loaded {
        Ok(_) => (true, "config loaded successfully".to_string()),
        Err(err) => (false, format!("config error: {err:#}")),
    })];

    let Ok(cfg) = loaded else {
        return checks;
    };
    checks.push(check("credential_present", check_credential(&cfg)));
    checks.push(check("source_dir_readable", check_source_dir(&cfg)));
    checks.push(check("build_description_present", check_build_description(&cfg)));
    checks.push(check("build_shell_available", check_shell()));
    checks.push(check("runtime_writable", check_runtime_writable(&cfg.runtime_dir)));
    checks
}

pub fn collect_doctor_warnings(cwd: &Path) -> Vec<String> {
    let mut warnings = Vec::new();
    if !cwd.join(RC_FILE).exists() {
        warnings.push(format!("missing {RC_FILE} (using only env/defaults)"));
    }
    if let Ok(cfg) = load_run_config(cwd, &CliOverrides::default()) {
        if cfg.request_timeout_secs == 0 {
            warnings.push(
                "request_timeout_secs = 0 leaves backend calls without a deadline".to_string(),
            );
        }
        if cfg.max_refine_attempts == 0 {
            warnings.push("max_refine_attempts = 0 disables refinement".to_string());
        }
    }
    warnings
}

pub fn apply_doctor_fixes(cwd: &Path) -> Result<Vec<String>> {
    let mut fixes = Vec::new();

    let runtime_dir = load_run_config(cwd, &CliOverrides::default())
        .map(|cfg| cfg.runtime_dir)
        .unwrap_or_else(|_| cwd.join(DEFAULT_RUNTIME_DIR));
    if !runtime_dir.exists() {
        fs::create_dir_all(&runtime_dir)?;
        fixes.push(format!("created runtime directory {}", runtime_dir.display()));
    }

    let rc = cwd.join(RC_FILE);
    if !rc.exists() {
        let template = "# testloop defaults\nsource_dir = \"controllers\"\noutput_dir = \"test\"\nmax_refine_attempts = 3\nrequest_timeout_secs = 120\n";
        fs::write(&rc, template)?;
        fixes.push(format!("created {RC_FILE} with baseline defaults"));
    }

    Ok(fixes)
}

fn check(name: &'static str, (ok, detail): (bool, String)) -> DoctorCheck {
    DoctorCheck { name, ok, detail }
}

fn check_credential(cfg: &RunConfig) -> (bool, String) {
    match cfg.require_api_key() {
        Ok(_) => (true, "API credential configured".to_string()),
        Err(err) => (false, err.to_string()),
    }
}

fn check_source_dir(cfg: &RunConfig) -> (bool, String) {
    match discover_units(
        &cfg.source_dir,
        &cfg.header_dir,
        &cfg.source_ext,
        &cfg.header_ext,
    ) {
        Ok(units) => {
            let paired = units.iter().filter(|u| u.header_path.is_file()).count();
            (
                true,
                format!(
                    "{} units in {} ({} with headers)",
                    units.len(),
                    cfg.source_dir.display(),
                    paired
                ),
            )
        }
        Err(err) => (false, format!("{err:#}")),
    }
}

fn check_build_description(cfg: &RunConfig) -> (bool, String) {
    if cfg.build_description.is_file() {
        (true, format!("{} found", cfg.build_description.display()))
    } else {
        (
            false,
            format!("{} not found", cfg.build_description.display()),
        )
    }
}

fn check_shell() -> (bool, String) {
    match Command::new("bash").arg("--version").output() {
        Ok(output) if output.status.success() => {
            let first = String::from_utf8_lossy(&output.stdout)
                .lines()
                .next()
                .unwrap_or("bash found")
                .to_string();
            (true, first)
        }
        Ok(output) => (
            false,
            format!("bash returned exit code {:?}", output.status.code()),
        ),
        Err(err) => (false, format!("bash not available: {}", err)),
    }
}

fn check_runtime_writable(runtime_dir: &Path) -> (bool, String) {
    if let Err(err) = fs::create_dir_all(runtime_dir) {
        return (false, format!("cannot create {}: {}", runtime_dir.display(), err));
    }
    let probe = runtime_dir.join(".doctor_write_probe");
    match fs::write(&probe, "test") {
        Ok(_) => {
            let _ = fs::remove_file(&probe);
            (true, format!("{} is writable", runtime_dir.display()))
        }
        Err(err) => (false, format!("cannot write to {}: {}", runtime_dir.display(), err)),
    }
}
