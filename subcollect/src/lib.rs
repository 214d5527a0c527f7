pub mod aggregate;
pub mod batch;
pub mod cleanup;
pub mod config;
pub mod document;
pub mod driver;
pub mod error;
pub mod manifest;
pub mod migrator;
pub mod report;
pub mod store;
pub mod targets;
pub mod verifier;

pub use config::{PipelineConfig, RetryPolicy, RunMode};
pub use document::{Document, Fields, WriteOp};
pub use driver::Pipeline;
pub use error::{Result, SubcollectError};
pub use report::{MigrationStats, Phase, RunReport};
pub use store::{DocumentStore, SqliteStore};
pub use targets::MigrationTarget;
pub use verifier::Verification;
