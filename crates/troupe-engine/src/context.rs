use std::collections::BTreeMap;

use serde_json::Value;

use troupe_core::ids::SessionId;

/// Contextual signals for one call: what skills activate on, what tool filters and
/// HITL predicates see.
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    pub prompt: String,
    pub session_id: Option<SessionId>,
    /// Caller-supplied attributes, e.g. `role` for tool visibility.
    pub attributes: BTreeMap<String, Value>,
}

impl CallContext {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        let _ = self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }
}
