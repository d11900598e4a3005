//! Descriptive statistics, LLM commentary and report files over local tables.

pub mod analyzer;
pub mod insight;
pub mod loader;
pub mod report;

pub use analyzer::{
    AnalysisResults, CategoricalSummary, CleanStrategy, DType, DataAnalyzer, Metadata,
    NumericSummary, Statistics, ValueCount,
};
pub use insight::{InsightClient, InsightConfig, VisualizationSuggestion};
pub use loader::{FileFormat, LoadError};
pub use report::{ReportError, ReportGenerator};

pub const CRATE_NAME: &str = "daa-analysis";
