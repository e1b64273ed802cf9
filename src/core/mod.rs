pub mod catalog;
pub mod engine;
pub mod error;
pub mod fixup;
pub mod matcher;
pub mod planner;
pub mod report;
pub mod rules;
pub mod run_log;

// Re-export common types for convenience
pub use catalog::{FileCatalog, SourceFile};
pub use engine::{run, RunOptions};
pub use error::{Error, ErrorCode, Result};
pub use fixup::{RenameEvent, RenameKind};
pub use report::{FileStatus, RunReport};
pub use rules::{RuleCategory, RuleSet, RuleSpec};
