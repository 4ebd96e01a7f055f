// Copyright The Courier Authors
// SPDX-License-Identifier: Apache-2.0

//! Validated name types for channels and consumer groups.
//!
//! Both types parse-validate on construction and round-trip through serde as
//! plain strings, so they can be embedded directly in declaration files.
//! `Borrow<str>` lets registries keyed by these types look up with `&str`
//! without allocating.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Error produced when parsing a channel or group name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    /// The name was empty or whitespace-only.
    #[error("{kind} name must be non-empty")]
    Empty {
        /// Which name type failed validation.
        kind: &'static str,
    },
}

macro_rules! name_type {
    ($(#[$doc:meta])* $name:ident, $kind:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
        #[serde(try_from = "String", into = "String")]
        #[schemars(with = "String")]
        pub struct $name(String);

        impl $name {
            /// Parses and validates a name.
            pub fn parse(raw: &str) -> Result<Self, NameError> {
                if raw.trim().is_empty() {
                    return Err(NameError::Empty { kind: $kind });
                }
                Ok(Self(raw.to_owned()))
            }

            /// Returns the name as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Returns the owned name.
            #[must_use]
            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                self.as_str()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl TryFrom<String> for $name {
            type Error = NameError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(value.as_str())
            }
        }

        impl TryFrom<&str> for $name {
            type Error = NameError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::parse(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl From<$name> for Cow<'static, str> {
            fn from(value: $name) -> Self {
                Cow::Owned(value.0)
            }
        }
    };
}

name_type!(
    /// Name of a channel declaration/reference.
    ChannelName,
    "channel"
);

name_type!(
    /// Name of a consumer group.
    GroupName,
    "group"
);

impl Default for ChannelName {
    /// The [`DEFAULT_CHANNEL`](crate::DEFAULT_CHANNEL) name.
    fn default() -> Self {
        Self(crate::DEFAULT_CHANNEL.to_owned())
    }
}

impl Default for GroupName {
    /// The [`DEFAULT_GROUP`](crate::DEFAULT_GROUP) name.
    fn default() -> Self {
        Self(crate::DEFAULT_GROUP.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_name_rejects_empty_and_whitespace() {
        assert!(ChannelName::parse("").is_err());
        assert!(ChannelName::parse("   ").is_err());
        assert!(ChannelName::parse("orders").is_ok());
    }

    #[test]
    fn group_name_round_trips_through_serde() {
        let group: GroupName = serde_json::from_str("\"billing\"").unwrap();
        assert_eq!(group.as_str(), "billing");
        assert_eq!(serde_json::to_string(&group).unwrap(), "\"billing\"");
    }

    #[test]
    fn empty_name_fails_deserialization() {
        let result: Result<ChannelName, _> = serde_json::from_str("\"\"");
        assert!(result.is_err());
    }

    #[test]
    fn lookup_by_str_via_borrow() {
        use std::collections::HashMap;

        let mut map: HashMap<ChannelName, u32> = HashMap::new();
        let _ = map.insert(ChannelName::parse("orders").unwrap(), 1);
        assert_eq!(map.get("orders"), Some(&1));
    }
}
