pub mod compiling;
pub mod running;

/// Diagnostic for work cut short or skipped by the submission deadline.
pub(crate) const BUDGET_EXHAUSTED: &str = "submission time budget exhausted";
