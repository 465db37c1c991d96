//! Stage and pipeline state machines with validated transitions.
//!
//! Stage lifecycle: Pending -> Running -> Succeeded/Failed
//! Pipeline lifecycle: Running -> Completed/Aborted

use harvest_core::types::{PipelineStatus, StageStatus};

use crate::error::PipelineError;

/// Validate that a stage status transition is allowed.
///
/// Valid transitions:
/// - Pending -> Running
/// - Running -> Succeeded
/// - Running -> Failed
pub fn validate_transition(from: StageStatus, to: StageStatus) -> Result<(), PipelineError> {
    let valid = matches!(
        (from, to),
        (StageStatus::Pending, StageStatus::Running)
            | (StageStatus::Running, StageStatus::Succeeded)
            | (StageStatus::Running, StageStatus::Failed)
    );

    if valid {
        Ok(())
    } else {
        Err(PipelineError::InvalidTransition(from, to))
    }
}

/// Validate that a pipeline status transition is allowed.
pub fn validate_pipeline_transition(
    from: PipelineStatus,
    to: PipelineStatus,
) -> Result<(), PipelineError> {
    let valid = matches!(
        (from, to),
        (PipelineStatus::Running, PipelineStatus::Completed)
            | (PipelineStatus::Running, PipelineStatus::Aborted)
    );

    if valid {
        Ok(())
    } else {
        Err(PipelineError::InvalidPipelineTransition(from, to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =====================================================================
    // Valid transitions
    // =====================================================================

    #[test]
    fn test_pending_to_running() {
        assert!(validate_transition(StageStatus::Pending, StageStatus::Running).is_ok());
    }

    #[test]
    fn test_running_to_succeeded() {
        assert!(validate_transition(StageStatus::Running, StageStatus::Succeeded).is_ok());
    }

    #[test]
    fn test_running_to_failed() {
        assert!(validate_transition(StageStatus::Running, StageStatus::Failed).is_ok());
    }

    #[test]
    fn test_pipeline_running_to_terminal() {
        assert!(
            validate_pipeline_transition(PipelineStatus::Running, PipelineStatus::Completed)
                .is_ok()
        );
        assert!(
            validate_pipeline_transition(PipelineStatus::Running, PipelineStatus::Aborted).is_ok()
        );
    }

    // =====================================================================
    // Invalid transitions
    // =====================================================================

    #[test]
    fn test_pending_to_succeeded_rejected() {
        let err = validate_transition(StageStatus::Pending, StageStatus::Succeeded).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidTransition(StageStatus::Pending, StageStatus::Succeeded)
        ));
    }

    #[test]
    fn test_terminal_states_are_final() {
        for from in [StageStatus::Succeeded, StageStatus::Failed] {
            for to in [
                StageStatus::Pending,
                StageStatus::Running,
                StageStatus::Succeeded,
                StageStatus::Failed,
            ] {
                assert!(validate_transition(from, to).is_err(), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_running_to_pending_rejected() {
        assert!(validate_transition(StageStatus::Running, StageStatus::Pending).is_err());
    }

    #[test]
    fn test_pipeline_terminal_states_are_final() {
        assert!(
            validate_pipeline_transition(PipelineStatus::Aborted, PipelineStatus::Completed)
                .is_err()
        );
        assert!(
            validate_pipeline_transition(PipelineStatus::Completed, PipelineStatus::Running)
                .is_err()
        );
    }
}
