use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
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

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

// Session ids are supplied by the agent runtime and stored verbatim;
// new() exists for locally-spawned test sessions.
branded_id!(SessionId, "sess");
branded_id!(ClientId, "client");

impl SessionId {
    /// Parse a composite child session id of the form
    /// `{parent_uuid}_{sequence}_{timestamp}` and return the parent id.
    ///
    /// Producers that spawn subagents out-of-band encode the parent in the
    /// child id this way. The parse is strict: the prefix must be a real
    /// UUID and both suffix segments must be numeric, otherwise None.
    pub fn composite_parent(&self) -> Option<SessionId> {
        let s = self.0.as_str();
        // UUIDs are 36 chars and themselves contain no underscores.
        if s.len() < 38 || !s.is_char_boundary(36) {
            return None;
        }
        let (prefix, rest) = s.split_at(36);
        if Uuid::parse_str(prefix).is_err() {
            return None;
        }
        let mut parts = rest.strip_prefix('_')?.splitn(2, '_');
        let sequence = parts.next()?;
        let timestamp = parts.next()?;
        if sequence.is_empty() || timestamp.is_empty() {
            return None;
        }
        if !sequence.bytes().all(|b| b.is_ascii_digit())
            || !timestamp.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }
        Some(SessionId::from_raw(prefix))
    }
}
