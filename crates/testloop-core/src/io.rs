use anyhow::{Context, Result};
use chrono::Local;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Writes `value` as pretty JSON through a sibling temp file and a rename, so
/// a concurrent `testloop status` never sees a half-written document.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to encode {}", path.display()))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, body).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to replace {}", path.display()))
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("invalid json in {}", path.display()))
}

/// Appends build output to `path`, one `[date time]` prefix per non-blank line.
pub fn append_build_log(path: &Path, chunk: &str) -> Result<()> {
    let stamped = stamp_lines(chunk);
    if stamped.is_empty() {
        return Ok(());
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open build log {}", path.display()))?;
    file.write_all(stamped.as_bytes())
        .with_context(|| format!("failed to append build log {}", path.display()))
}

pub fn stamp_lines(input: &str) -> String {
    let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    input
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| format!("[{stamp}] {line}\n"))
        .collect()
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("failed to create {}", path.display()))
}

pub fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
