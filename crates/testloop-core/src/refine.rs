use crate::prompt::PromptComposer;
use crate::store::ArtifactStore;
use anyhow::Result;
use testloop_config::RefineScope;
use testloop_engine::Generator;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefineSummary {
    /// Generation calls made.
    pub attempted: u32,
    pub rewritten: Vec<String>,
    pub failed: Vec<String>,
}

/// One refinement pass: every targeted artifact is sent back to the
/// generator together with the whole failing build log.
pub struct Refiner<'a> {
    store: &'a ArtifactStore,
    composer: &'a PromptComposer,
    generator: &'a dyn Generator,
}

impl<'a> Refiner<'a> {
    pub fn new(
        store: &'a ArtifactStore,
        composer: &'a PromptComposer,
        generator: &'a dyn Generator,
    ) -> Self {
        Self {
            store,
            composer,
            generator,
        }
    }

    /// Failures on one artifact are logged and never stop the others.
    pub fn refine(
        &self,
        build_log: &str,
        scope: RefineScope,
        current_unit: &str,
    ) -> Result<RefineSummary> {
        let targets = match scope {
            RefineScope::All => self.store.list()?,
            RefineScope::Unit => {
                if self.store.exists(current_unit) {
                    vec![current_unit.to_string()]
                } else {
                    Vec::new()
                }
            }
        };

        let mut summary = RefineSummary::default();
        for unit in targets {
            let previous = match self.store.read(&unit) {
                Ok(text) => text,
                Err(err) => {
                    warn!(artifact = %unit, error = %err, "artifact unreadable, not refined");
                    summary.failed.push(unit);
                    continue;
                }
            };

            let request = self.composer.compose_refinement(&previous, build_log);
            summary.attempted += 1;
            match self.generator.generate(&request) {
                Ok(fixed) => match self.store.write(&unit, &fixed) {
                    Ok(path) => {
                        info!(artifact = %unit, path = %path.display(), "artifact refined");
                        summary.rewritten.push(unit);
                    }
                    Err(err) => {
                        warn!(
                            artifact = %unit,
                            error = %format!("{err:#}"),
                            "failed to store refined artifact"
                        );
                        summary.failed.push(unit);
                    }
                },
                Err(err) => {
                    warn!(artifact = %unit, error = %err, "refinement failed, keeping previous");
                    summary.failed.push(unit);
                }
            }
        }
        Ok(summary)
    }
}
