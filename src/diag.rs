/// Implemented by error types that can offer the operator an actionable
/// hint beyond the bare error chain (e.g. "run `comterm --config` to see
/// which file was loaded").
pub trait DiagnosableError {
    fn diagnose(&self) -> Vec<String> {
        vec![]
    }
}
