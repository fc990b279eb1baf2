//! Stevedore shared - types and constants used by the library, the CLI
//! and the test utilities.

pub mod constants;
pub mod errors;

pub use errors::{BuildError, StevedoreError, StevedoreResult, SupervisorError};
