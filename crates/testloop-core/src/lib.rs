//! Build-feedback test synthesis: generate a test per source unit, wire it
//! into the build, compile, and feed compiler failures back to the generator
//! until the build is clean or the refinement ceiling is hit.

pub mod build;
pub mod integrator;
pub mod io;
pub mod pipeline;
pub mod prompt;
pub mod refine;
pub mod status;
pub mod store;

#[cfg(test)]
mod testing;

pub use build::{BuildLog, BuildRunner, FailurePredicate, MarkerPredicate};
pub use integrator::{BuildIntegrator, IntegrationOutcome};
pub use pipeline::{discover_units, CancelToken, Pipeline, STOP_FILE};
pub use prompt::{PromptComposer, TemplateError};
pub use refine::{RefineSummary, Refiner};
pub use status::{read_report, read_status};
pub use store::{ArtifactStore, StoreError};
