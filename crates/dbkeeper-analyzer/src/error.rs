use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("failed to compile {name} pattern: {source}")]
    Pattern {
        name: &'static str,
        #[source]
        source: regex::Error,
    },
}

/// Compile a built-in pattern, naming it in the error.
pub(crate) fn compile(name: &'static str, pattern: &str) -> Result<regex::Regex, AnalyzerError> {
    regex::Regex::new(pattern).map_err(|source| AnalyzerError::Pattern { name, source })
}
