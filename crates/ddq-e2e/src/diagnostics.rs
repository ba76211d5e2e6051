//! Batch assertions on a backend's diagnostic attributes.

use crate::scenarios::ScenarioError;
use ddq_proto::{DiagnosticAttribute, QueueBackend};

/// Asserts that every attribute in `attributes` is present (or absent).
///
/// All attributes are checked before failing, so the error lists every
/// mismatch rather than only the first.
pub fn assert_diagnostic_state(
    backend: &dyn QueueBackend,
    attributes: &[DiagnosticAttribute],
    expected_present: bool,
) -> Result<(), ScenarioError> {
    let mismatched: Vec<&str> = attributes
        .iter()
        .filter(|attribute| backend.has_diagnostic(**attribute) != expected_present)
        .map(|attribute| attribute.as_str())
        .collect();

    if mismatched.is_empty() {
        return Ok(());
    }

    let expectation = if expected_present { "present" } else { "absent" };
    Err(ScenarioError::Assertion(format!(
        "expected diagnostic attributes to be {}: {}",
        expectation,
        mismatched.join(", ")
    )))
}
