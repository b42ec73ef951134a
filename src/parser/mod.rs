mod analyzer;

pub use analyzer::{query_type, AnalyzerError, SqlAnalysis, SqlAnalyzer, StatementKind, TableRef};
