use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// String-backed identifiers. Generated ids are `<prefix>_<uuid v7>`, so they sort by
/// creation time; caller-supplied ids are kept verbatim.
macro_rules! troupe_ids {
    ($($(#[$doc:meta])* $name:ident => $prefix:literal;)+) => {$(
        $(#[$doc])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            pub fn new() -> Self {
                Self(format!("{}_{}", Self::PREFIX, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::from_raw(s)
            }
        }
    )+};
}

troupe_ids! {
    /// Key of one conversation in the session store.
    SessionId => "sess";
    /// Model-assigned id pairing a tool call with its observation.
    ToolCallId => "call";
    /// One reasoning run; kept across a pause and its resume.
    RunId => "run";
    /// A human-in-the-loop approval request.
    TaskId => "hitl";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_has_prefix() {
        let id = SessionId::new();
        assert!(id.as_str().starts_with("sess_"), "got: {id}");
        assert_eq!(TaskId::PREFIX, "hitl");
    }

    #[test]
    fn tool_call_id_has_prefix() {
        let id = ToolCallId::new();
        assert!(id.as_str().starts_with("call_"), "got: {id}");
    }

    #[test]
    fn raw_ids_are_kept_verbatim() {
        let id = SessionId::from_raw("SA");
        assert_eq!(id.as_str(), "SA");
        assert_eq!(id, SessionId::from("SA"));
    }

    #[test]
    fn ids_are_unique() {
        let a = RunId::new();
        let b = RunId::new();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("run_"));
    }

    #[test]
    fn serde_is_transparent() {
        let id = TaskId::from_raw("hitl_1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#""hitl_1""#);
        let parsed: TaskId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }
}
