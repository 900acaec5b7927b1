//! Typed ID wrappers.
//!
//! IDs are opaque String wrappers (serde-transparent). Collaborators may hand
//! back their own identifiers (e.g. provider tool-call ids); locally generated
//! ids use UUID v4.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string value.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Create a new ID using UUID v4 (random).
            pub fn new_uuid() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// View as string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new_uuid()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

typed_id!(
    /// Unique identifier for a session.
    SessionId
);
typed_id!(
    /// Unique identifier for a message appended to a session.
    MessageId
);
typed_id!(
    /// Identifier of a proposed tool call. Unique within a session.
    ToolCallId
);
typed_id!(
    /// Identifier of an installed policy set.
    PolicySetId
);
typed_id!(
    /// Identity this agent enrolls with at the policy server.
    AgentId
);
typed_id!(
    /// Unique identifier for a pending escalation ticket.
    ApprovalId
);

impl PolicySetId {
    /// The policy set in force before any enterprise sync succeeds.
    pub fn builtin() -> Self {
        Self("builtin".to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_transparent() {
        let a = MessageId::default();
        let b = MessageId::default();
        assert_ne!(a, b);

        let json = serde_json::to_string(&ToolCallId::from_string("call-1")).unwrap();
        assert_eq!(json, "\"call-1\"");
    }

    #[test]
    fn builtin_policy_set_id() {
        assert_eq!(PolicySetId::builtin().as_str(), "builtin");
    }
}
