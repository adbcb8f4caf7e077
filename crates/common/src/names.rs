//! Validated event type and outcome names.
//!
//! Workflows declare their own step names as constants; the engine only knows
//! the built-in names used to start and finish a saga.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a string is not a valid event name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidName {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for InvalidName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid {} '{}': expected non-empty SCREAMING_SNAKE_CASE",
            self.kind, self.value
        )
    }
}

impl std::error::Error for InvalidName {}

/// Names are non-empty ASCII upper-case letters, digits and underscores,
/// starting with a letter.
const fn is_valid_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.is_empty() || !bytes[0].is_ascii_uppercase() {
        return false;
    }
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if !(c.is_ascii_uppercase() || c.is_ascii_digit() || c == b'_') {
            return false;
        }
        i += 1;
    }
    true
}

macro_rules! event_name {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(Cow<'static, str>);

        impl $name {
            /// Creates a name from a static string, checked at compile time
            /// when used in a `const` context.
            ///
            /// # Panics
            ///
            /// Panics if `name` is not SCREAMING_SNAKE_CASE.
            pub const fn from_static(name: &'static str) -> Self {
                assert!(is_valid_name(name), "event names must be SCREAMING_SNAKE_CASE");
                Self(Cow::Borrowed(name))
            }

            /// Parses a runtime string, e.g. one read from the wire or a database row.
            pub fn parse(name: impl Into<String>) -> Result<Self, InvalidName> {
                let name = name.into();
                if is_valid_name(&name) {
                    Ok(Self(Cow::Owned(name)))
                } else {
                    Err(InvalidName {
                        kind: $kind,
                        value: name,
                    })
                }
            }

            /// Returns the name as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = InvalidName;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = InvalidName;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(value)
            }
        }

        impl From<$name> for String {
            fn from(name: $name) -> Self {
                name.0.into_owned()
            }
        }
    };
}

event_name!(
    /// The type of a saga event; doubles as the name of the step that emits it.
    EventType,
    "event type"
);

event_name!(
    /// The outcome carried by a saga event.
    EventOutcome,
    "event outcome"
);

impl EventType {
    /// First event of every saga, published when the saga is started.
    pub const INITIATED: EventType = EventType::from_static("INITIATED");

    /// Emitted when a terminal transition is reached.
    pub const MARK_SAGA_COMPLETE: EventType = EventType::from_static("MARK_SAGA_COMPLETE");
}

impl EventOutcome {
    /// Outcome paired with [`EventType::INITIATED`].
    pub const INITIATE_SUCCESS: EventOutcome = EventOutcome::from_static("INITIATE_SUCCESS");

    /// Outcome paired with [`EventType::MARK_SAGA_COMPLETE`].
    pub const SAGA_COMPLETED: EventOutcome = EventOutcome::from_static("SAGA_COMPLETED");
}
