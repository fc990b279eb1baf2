//! Image builder: recipes, dependency manifests, lint, step cache and
//! execution.

mod builder;
pub mod cache;
pub mod copy;
pub mod executor;
pub mod lint;
pub mod manifest;
pub mod python;
pub mod recipe;
pub mod snapshot;

use std::sync::Arc;

pub use builder::{BuildReport, Builder, StepOutcome};
pub use executor::{ChrootExecutor, HostExecutor, RunRequest, StepExecutor};
pub use lint::{LintRule, LintWarning};
pub use manifest::{DependencyManifest, Requirement};
pub use python::{InstallOptions, PythonServiceRecipe};
pub use recipe::{CommandForm, Instruction, Recipe, RecipeParseError};

use crate::runtime::Isolation;

/// The executor for an isolation mode.
pub fn executor_for(isolation: Isolation) -> Arc<dyn StepExecutor> {
    match isolation {
        Isolation::Host => Arc::new(HostExecutor),
        Isolation::Chroot => Arc::new(ChrootExecutor),
    }
}
