use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One implementation/interface pair a test artifact is generated for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceUnit {
    pub name: String,
    pub source_path: PathBuf,
    pub header_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitOutcome {
    Clean { refinements: u32 },
    PersistentFailure { refinements: u32 },
    Skipped { reason: String },
    Cancelled,
}

impl UnitOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitOutcome::Clean { .. } => "clean",
            UnitOutcome::PersistentFailure { .. } => "persistent_failure",
            UnitOutcome::Skipped { .. } => "skipped",
            UnitOutcome::Cancelled => "cancelled",
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, UnitOutcome::Clean { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitReport {
    pub unit: String,
    pub outcome: UnitOutcome,
    pub builds: u32,
    pub started_at_epoch: u64,
    pub finished_at_epoch: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RunReport {
    pub units: Vec<UnitReport>,
    pub started_at_epoch: u64,
    pub finished_at_epoch: u64,
}

impl RunReport {
    pub fn count(&self, kind: &str) -> usize {
        self.units
            .iter()
            .filter(|u| u.outcome.as_str() == kind)
            .count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunStatus {
    pub state: String,
    pub model: String,
    pub current_unit: Option<String>,
    pub units_total: u64,
    pub units_processed: u64,
    pub build_count: u64,
    pub generation_calls: u64,
    pub last_error: Option<String>,
    pub run_started_at_epoch: u64,
    pub updated_at_epoch: u64,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self {
            state: "idle".to_string(),
            model: String::new(),
            current_unit: None,
            units_total: 0,
            units_processed: 0,
            build_count: 0,
            generation_calls: 0,
            last_error: None,
            run_started_at_epoch: 0,
            updated_at_epoch: 0,
        }
    }
}
