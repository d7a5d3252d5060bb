use crate::CoreError;
use ferry_schema::BuildStatus;

/// `queued → building → completed | failed`, plus `queued → failed` for a
/// build cancelled before it started. Terminal states are absorbing.
pub fn validate_transition(from: BuildStatus, to: BuildStatus) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (BuildStatus::Queued, BuildStatus::Building | BuildStatus::Failed)
            | (
                BuildStatus::Building,
                BuildStatus::Completed | BuildStatus::Failed
            )
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
