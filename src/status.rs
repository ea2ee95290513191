//! Status reporting
//!
//! A user status carries exactly one condition: `Ready`, or `NotReady` with the
//! reason and message of the step that failed.

use crate::conditions::{
    build_condition, same_conditions, set_condition, CONDITION_TRUE, REASON_RECONCILED,
    USER_CONDITION_NOT_READY, USER_CONDITION_READY,
};
use crate::crd::{UserCondition, UserStatus};
use crate::error::OperatorError;

/// Keep the previous condition of the same type so its transition time survives.
fn single_condition(previous: Option<&UserStatus>, condition: UserCondition) -> Vec<UserCondition> {
    let mut conditions: Vec<UserCondition> = previous
        .into_iter()
        .flat_map(|status| status.conditions.iter())
        .filter(|existing| existing.r#type == condition.r#type)
        .take(1)
        .cloned()
        .collect();
    set_condition(&mut conditions, condition);
    conditions
}

/// Status of a user that converged
pub fn ready_status(
    previous: Option<&UserStatus>,
    generation: i64,
    username: String,
    secret: Option<String>,
) -> UserStatus {
    let condition = build_condition(
        USER_CONDITION_READY,
        CONDITION_TRUE,
        REASON_RECONCILED,
        "User credentials, ACLs and quotas are in sync",
    );
    UserStatus {
        observed_generation: Some(generation),
        conditions: single_condition(previous, condition),
        username: Some(username),
        secret,
    }
}

/// Status of a user whose pass failed with `err`.
///
/// Username and secret are carried over from the previous status.
pub fn not_ready_status(
    previous: Option<&UserStatus>,
    generation: i64,
    err: &OperatorError,
) -> UserStatus {
    let condition = build_condition(
        USER_CONDITION_NOT_READY,
        CONDITION_TRUE,
        err.reason(),
        &err.to_string(),
    );
    UserStatus {
        observed_generation: Some(generation),
        conditions: single_condition(previous, condition),
        username: previous.and_then(|status| status.username.clone()),
        secret: previous.and_then(|status| status.secret.clone()),
    }
}

/// Whether writing `computed` would change what is stored
pub fn status_unchanged(stored: Option<&UserStatus>, computed: &UserStatus) -> bool {
    stored.is_some_and(|stored| {
        stored.observed_generation == computed.observed_generation
            && stored.username == computed.username
            && stored.secret == computed.secret
            && same_conditions(&stored.conditions, &computed.conditions)
    })
}

/// The single condition of a status, if any
pub fn current_condition(status: &UserStatus) -> Option<&UserCondition> {
    status.conditions.first()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_status() {
        let status = ready_status(None, 3, "CN=alice".to_string(), Some("alice".to_string()));
        assert_eq!(status.observed_generation, Some(3));
        assert_eq!(status.conditions.len(), 1);
        let condition = current_condition(&status).unwrap();
        assert_eq!(condition.r#type, "Ready");
        assert_eq!(condition.status, "True");
        assert_eq!(status.username.as_deref(), Some("CN=alice"));
    }

    #[test]
    fn test_failure_replaces_ready_condition() {
        let ready = ready_status(None, 1, "bob".to_string(), Some("bob".to_string()));
        let err = OperatorError::broker("unreachable", true);
        let failed = not_ready_status(Some(&ready), 2, &err);

        assert_eq!(failed.conditions.len(), 1);
        let condition = current_condition(&failed).unwrap();
        assert_eq!(condition.r#type, "NotReady");
        assert_eq!(condition.status, "True");
        assert_eq!(condition.reason.as_deref(), Some("BrokerAdapterFailed"));
        assert!(condition.message.as_deref().unwrap().contains("unreachable"));
        assert_eq!(failed.observed_generation, Some(2));
        assert_eq!(failed.secret.as_deref(), Some("bob"));
    }

    #[test]
    fn test_transition_time_kept_while_ready() {
        let mut first = ready_status(None, 1, "a".to_string(), None);
        first.conditions[0].last_transition_time = Some("2024-01-01T00:00:00Z".to_string());

        let second = ready_status(Some(&first), 2, "a".to_string(), None);
        assert_eq!(
            second.conditions[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
    }

    #[test]
    fn test_status_unchanged() {
        let stored = ready_status(None, 1, "a".to_string(), Some("a".to_string()));
        let again = ready_status(Some(&stored), 1, "a".to_string(), Some("a".to_string()));
        assert!(status_unchanged(Some(&stored), &again));

        let newer = ready_status(Some(&stored), 2, "a".to_string(), Some("a".to_string()));
        assert!(!status_unchanged(Some(&stored), &newer));
        assert!(!status_unchanged(None, &again));
    }
}
