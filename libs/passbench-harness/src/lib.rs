/// Containerized functional-correctness harness.
///
/// **Pipeline:**
/// script (materialize candidate files) -> docker (one ephemeral container
/// per run) -> parser (summary counts + detailed report extraction) ->
/// scorer (candidate passed count normalized by the ground-truth baseline).
///
/// The harness knows nothing about pass@k aggregation; it produces one
/// persisted `ComparisonResult` artifact per sample attempt.
pub mod docker;
pub mod parser;
pub mod scorer;
pub mod script;
