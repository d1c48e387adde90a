//! Stage failure taxonomy.
//!
//! Stages return `anyhow::Result` like the rest of the crate; the variants
//! here are what gets wrapped when a caller (or a test) needs to tell the
//! failure kinds apart. Use `err.downcast_ref::<StageError>()` to inspect.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StageError {
    /// A required config field or flag is missing. Nothing was spawned.
    #[error("{stage} refused: missing {}", missing.join(", "))]
    PreconditionNotMet {
        stage: &'static str,
        missing: Vec<String>,
    },

    /// A fail-fast external command exited non-zero.
    #[error("command failed ({status}): {command}")]
    ExternalProcessFailed { command: String, status: String },

    /// A resource (typically a partition node) never appeared.
    #[error("{resource} not ready after {attempts} attempts")]
    ResourceNotReady { resource: String, attempts: u32 },

    /// The operator supplied an empty or malformed answer.
    #[error("invalid {field}: {reason}")]
    UserInputInvalid { field: &'static str, reason: String },
}

impl StageError {
    pub fn precondition(stage: &'static str, missing: Vec<String>) -> Self {
        Self::PreconditionNotMet { stage, missing }
    }

    pub fn invalid_input(field: &'static str, reason: impl Into<String>) -> Self {
        Self::UserInputInvalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Return the [`StageError`] wrapped in an anyhow error chain, if any.
pub fn stage_error(err: &anyhow::Error) -> Option<&StageError> {
    err.chain().find_map(|cause| cause.downcast_ref::<StageError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn precondition_message_lists_missing_items() {
        let err = StageError::precondition("iso", vec!["isoTag".into(), "outputDir".into()]);
        assert_eq!(err.to_string(), "iso refused: missing isoTag, outputDir");
    }

    #[test]
    fn stage_error_found_through_context() {
        let result: anyhow::Result<()> = Err(StageError::invalid_input("size", "must be > 0"))
            .context("building image");
        let err = result.unwrap_err();
        assert!(matches!(
            stage_error(&err),
            Some(StageError::UserInputInvalid { field: "size", .. })
        ));
    }
}
