//! Branded ID newtypes.
//!
//! Conversation and message identifiers are distinct newtype wrappers around
//! `String` so one can never be passed where the other is expected.
//!
//! A conversation ID is a `c` followed by six random alphanumeric characters
//! drawn from the operating system's CSPRNG. A message ID is a random
//! (version 4) UUID. Both are unique with overwhelming probability;
//! collisions surface as database constraint violations.

use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

const CONVERSATION_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const CONVERSATION_ID_RANDOM_LEN: usize = 6;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

opaque_id! {
    /// Identifier for a conversation: `c` + 6 random alphanumerics.
    ConversationId
}

opaque_id! {
    /// Identifier for a persisted message: a random UUID.
    MessageId
}

impl ConversationId {
    /// Generate a fresh conversation ID from the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = OsRng;
        let mut id = String::with_capacity(1 + CONVERSATION_ID_RANDOM_LEN);
        id.push('c');
        for _ in 0..CONVERSATION_ID_RANDOM_LEN {
            let idx = rng.gen_range(0..CONVERSATION_ID_ALPHABET.len());
            id.push(CONVERSATION_ID_ALPHABET[idx] as char);
        }
        Self(id)
    }
}

impl MessageId {
    /// Generate a fresh random message ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_id_shape() {
        let id = ConversationId::generate();
        assert_eq!(id.as_str().len(), 7);
        assert!(id.as_str().starts_with('c'));
        assert!(id
            .as_str()
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
    }

    #[test]
    fn conversation_ids_are_unique() {
        let a = ConversationId::generate();
        let b = ConversationId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn message_id_is_uuid() {
        let id = MessageId::generate();
        assert!(Uuid::parse_str(id.as_str()).is_ok());
    }

    #[test]
    fn display_and_from() {
        let id = ConversationId::from("cabc123");
        assert_eq!(format!("{id}"), "cabc123");
        let s: String = id.into();
        assert_eq!(s, "cabc123");
    }

    #[test]
    fn serde_is_transparent() {
        let id = MessageId::from("m-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"m-1\"");
        let back: MessageId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
