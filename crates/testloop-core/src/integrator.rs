use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;
use testloop_config::IntegrationConfig;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum IntegrationOutcome {
    Unchanged,
    Patched {
        added_include: bool,
        added_instrumentation: bool,
    },
    /// The build description could not be read; nothing was written.
    Unreadable,
}

/// Keeps the project's build description wired to the generated tests.
#[derive(Debug, Clone)]
pub struct BuildIntegrator {
    config: IntegrationConfig,
}

impl BuildIntegrator {
    pub fn new(config: &IntegrationConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Applies the patch in place. Safe to call every cycle.
    pub fn ensure_integrated(&self, path: &Path) -> Result<IntegrationOutcome> {
        let original = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "build description unreadable, skipping integration"
                );
                return Ok(IntegrationOutcome::Unreadable);
            }
        };

        let (patched, added_include, added_instrumentation) = self.patch(&original);
        if patched == original {
            debug!(path = %path.display(), "build description already integrated");
            return Ok(IntegrationOutcome::Unchanged);
        }

        fs::write(path, &patched)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(
            path = %path.display(),
            added_include,
            added_instrumentation,
            "build description patched"
        );
        Ok(IntegrationOutcome::Patched {
            added_include,
            added_instrumentation,
        })
    }

    fn patch(&self, text: &str) -> (String, bool, bool) {
        let mut out = text.to_string();
        let mut added_include = false;
        let mut added_instrumentation = false;

        if !out.contains(&self.config.include_marker) {
            out.push('\n');
            out.push_str(&self.config.include_directive);
            out.push('\n');
            added_include = true;
        }

        if !self.config.instrumentation_lines.is_empty()
            && !out.contains(&self.config.instrumentation_marker)
        {
            match out.find(&self.config.anchor) {
                Some(idx) => {
                    let mut block = self.config.instrumentation_lines.join("\n");
                    block.push('\n');
                    out.insert_str(idx, &block);
                    added_instrumentation = true;
                }
                None => {
                    warn!(anchor = %self.config.anchor, "anchor not found, no instrumentation");
                }
            }
        }

        (out, added_include, added_instrumentation)
    }
}
