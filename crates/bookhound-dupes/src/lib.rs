//! bookhound dupes: duplicate books, metadata variations, cross-library and
//! binary comparison.

pub mod algorithms;
pub mod binary;
pub mod engine;
pub mod error;
pub mod evaluate;
pub mod exemptions;
pub mod grouping;
pub mod hashing;
pub mod library_compare;
pub mod normalize;
pub mod presentation;
pub mod progress;
pub mod report;
pub mod rules;
pub mod variations;

pub use algorithms::{Algorithm, AlgorithmRegistry, Settings};
pub use engine::{DuplicateEngine, EngineOptions};
pub use error::{DupesError, EvaluationError, Result, RuleError};
pub use exemptions::{AuthorExemptions, BookExemptions, ExemptionScope, ExemptionStore};
pub use library_compare::{CompareState, LibraryComparison};
pub use progress::{Progress, RunControl, RunLog, Stage};
pub use report::{DuplicateReport, GroupId, ReportKind, labels};
pub use rules::{AlgorithmSpec, MatchRule, RuleSet, RuleSetStore, SortFilter, TypeHint};
pub use variations::VariationReport;
