use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{SessionId, TaskId, ToolCallId};

/// A tool call held back for human approval.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HitlTask {
    pub id: TaskId,
    pub session_id: SessionId,
    pub agent: String,
    pub tool_call_id: ToolCallId,
    pub tool_name: String,
    /// Arguments exactly as the model submitted them.
    pub arguments: Value,
    pub justification: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    Approve,
    Reject,
}

/// A human's answer to a [`HitlTask`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HitlDecision {
    pub outcome: DecisionOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Argument overrides, honored only on approve.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<Value>,
}

impl HitlDecision {
    pub fn approve() -> Self {
        Self {
            outcome: DecisionOutcome::Approve,
            comment: None,
            overrides: None,
        }
    }

    pub fn reject(comment: impl Into<String>) -> Self {
        Self {
            outcome: DecisionOutcome::Reject,
            comment: Some(comment.into()),
            overrides: None,
        }
    }

    pub fn with_overrides(mut self, overrides: Value) -> Self {
        self.overrides = Some(overrides);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn is_approved(&self) -> bool {
        self.outcome == DecisionOutcome::Approve
    }

    /// Arguments to execute with after approval.
    ///
    /// Object overrides replace matching keys of the original object; any other override
    /// replaces the arguments wholesale.
    pub fn effective_arguments(&self, original: &Value) -> Value {
        match (&self.overrides, original) {
            (None, _) => original.clone(),
            (Some(Value::Object(over)), Value::Object(orig)) => {
                let mut merged = orig.clone();
                for (k, v) in over {
                    let _ = merged.insert(k.clone(), v.clone());
                }
                Value::Object(merged)
            }
            (Some(over), _) => over.clone(),
        }
    }

    /// Observation fed back to the model when the call is rejected.
    pub fn rejection_observation(&self, tool_name: &str) -> String {
        match self.comment.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            Some(comment) => format!("[rejected] {tool_name} was not run: {comment}"),
            None => format!("[rejected] {tool_name} was not run"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn overrides_merge_over_object_arguments() {
        let original = json!({"path": "/tmp/a", "force": false});
        let decision = HitlDecision::approve().with_overrides(json!({"force": true}));
        assert_eq!(
            decision.effective_arguments(&original),
            json!({"path": "/tmp/a", "force": true})
        );
        assert_eq!(HitlDecision::approve().effective_arguments(&original), original);
        assert_eq!(
            HitlDecision::approve()
                .with_overrides(json!("raw"))
                .effective_arguments(&original),
            json!("raw")
        );
    }

    #[test]
    fn rejection_observation_carries_comment() {
        let d = HitlDecision::reject("too risky");
        assert!(!d.is_approved());
        assert_eq!(
            d.rejection_observation("delete_file"),
            "[rejected] delete_file was not run: too risky"
        );
        let d = HitlDecision::reject("  ");
        assert_eq!(d.rejection_observation("x"), "[rejected] x was not run");
    }

    #[test]
    fn decision_serde() {
        let d = HitlDecision::approve().with_comment("ok");
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json, json!({"outcome": "approve", "comment": "ok"}));
        let parsed: HitlDecision = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, d);
    }
}
