//! Trigger events and the conditions pipelines declare for them.

use serde::{Deserialize, Serialize};

/// The declared condition under which a pipeline runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerCondition {
    /// Event name, e.g. `pull_request`
    pub event: String,

    /// Accepted event actions, e.g. `opened` (empty = any action)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<String>,
}

/// An event that starts a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerEvent {
    /// Event name
    pub event: String,

    /// Event action (e.g. `opened`, `synchronize`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    /// Source revision to verify
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

impl TriggerEvent {
    /// Create an event with no action or revision.
    pub fn new(event: impl Into<String>) -> Self {
        Self { event: event.into(), action: None, revision: None }
    }

    /// Set the action.
    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Set the revision.
    #[must_use]
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    /// Environment variables describing this event to step commands.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let mut vars = vec![("SHIPCHECK_EVENT".to_string(), self.event.clone())];
        if let Some(ref action) = self.action {
            vars.push(("SHIPCHECK_ACTION".to_string(), action.clone()));
        }
        if let Some(ref revision) = self.revision {
            vars.push(("SHIPCHECK_REVISION".to_string(), revision.clone()));
        }
        vars
    }
}

impl Default for TriggerEvent {
    fn default() -> Self {
        Self::new("pull_request").with_action("opened")
    }
}

impl TriggerCondition {
    /// Check whether an event satisfies this condition.
    pub fn matches(&self, event: &TriggerEvent) -> bool {
        if self.event != event.event {
            return false;
        }

        if self.types.is_empty() {
            return true;
        }

        event.action.as_ref().is_some_and(|action| self.types.iter().any(|t| t == action))
    }
}

/// Check an optional pipeline condition; pipelines without one run on every event.
pub fn should_run(condition: Option<&TriggerCondition>, event: &TriggerEvent) -> bool {
    condition.map_or(true, |c| c.matches(event))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pull_request_opened() -> TriggerCondition {
        TriggerCondition { event: "pull_request".to_string(), types: vec!["opened".to_string()] }
    }

    #[test]
    fn test_matching_event_and_action() {
        let event = TriggerEvent::new("pull_request").with_action("opened");
        assert!(pull_request_opened().matches(&event));
    }

    #[test]
    fn test_wrong_action_does_not_match() {
        let event = TriggerEvent::new("pull_request").with_action("closed");
        assert!(!pull_request_opened().matches(&event));

        let no_action = TriggerEvent::new("pull_request");
        assert!(!pull_request_opened().matches(&no_action));
    }

    #[test]
    fn test_wrong_event_does_not_match() {
        let event = TriggerEvent::new("push");
        assert!(!pull_request_opened().matches(&event));
    }

    #[test]
    fn test_empty_types_accepts_any_action() {
        let condition = TriggerCondition { event: "push".to_string(), types: Vec::new() };
        assert!(condition.matches(&TriggerEvent::new("push")));
        assert!(condition.matches(&TriggerEvent::new("push").with_action("forced")));
    }

    #[test]
    fn test_absent_condition_always_runs() {
        assert!(should_run(None, &TriggerEvent::new("anything")));
    }

    #[test]
    fn test_env_vars() {
        let event = TriggerEvent::default().with_revision("abc123");
        let vars = event.env_vars();

        assert!(vars.contains(&("SHIPCHECK_EVENT".to_string(), "pull_request".to_string())));
        assert!(vars.contains(&("SHIPCHECK_ACTION".to_string(), "opened".to_string())));
        assert!(vars.contains(&("SHIPCHECK_REVISION".to_string(), "abc123".to_string())));
    }
}
