use crate::CoreError;
use resman_store::{RequestState, TransitionRecord};

/// A request only ever moves from IN_PROGRESS to one terminal state.
pub fn validate_request_transition(from: RequestState, to: RequestState) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (
            RequestState::InProgress,
            RequestState::Completed | RequestState::Failed
        )
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition(format!(
            "request state cannot move from {from} to {to}"
        )))
    }
}

/// Move `record` to its terminal state, stamping `finishedAt` once.
pub fn finish_record(
    record: &mut TransitionRecord,
    state: RequestState,
    reason: Option<String>,
) -> Result<(), CoreError> {
    validate_request_transition(record.request_state, state)?;
    record.request_state = state;
    record.request_state_reason = reason;
    record.finished_at = Some(chrono::Utc::now().to_rfc3339());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        assert!(validate_request_transition(RequestState::InProgress, RequestState::Completed).is_ok());
        assert!(validate_request_transition(RequestState::InProgress, RequestState::Failed).is_ok());
    }

    #[test]
    fn invalid_transitions() {
        assert!(validate_request_transition(RequestState::Completed, RequestState::Failed).is_err());
        assert!(validate_request_transition(RequestState::Failed, RequestState::InProgress).is_err());
        assert!(validate_request_transition(RequestState::Completed, RequestState::InProgress).is_err());
        assert!(validate_request_transition(RequestState::InProgress, RequestState::InProgress).is_err());
        assert!(validate_request_transition(RequestState::Completed, RequestState::Completed).is_err());
    }

    #[test]
    fn finish_sets_finished_at_exactly_once() {
        let mut record = TransitionRecord::new(1, "Start");
        assert!(record.finished_at.is_none());
        finish_record(&mut record, RequestState::Completed, None).unwrap();
        let first = record.finished_at.clone();
        assert!(first.is_some());

        assert!(finish_record(&mut record, RequestState::Failed, Some("late".to_owned())).is_err());
        assert_eq!(record.finished_at, first);
        assert_eq!(record.request_state, RequestState::Completed);
        assert!(record.request_state_reason.is_none());
    }
}
