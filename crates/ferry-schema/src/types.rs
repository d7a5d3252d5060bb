//! Newtype wrappers for string identifiers, providing compile-time type safety.
//!
//! All newtypes serialize/deserialize as plain strings so records stay readable.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

/// Separator placed between a module namespace and the original entity name.
pub const NAMESPACE_SEPARATOR: &str = "__";

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance from a string.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Return the inner string as a slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
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
    };
}

string_newtype!(
    /// Globally unique identifier of one pipeline execution.
    BuildId
);

string_newtype!(
    /// Identifier of a project composition.
    ProjectId
);

string_newtype!(
    /// Unique name of a reusable module.
    ModuleName
);

string_newtype!(
    /// Project-scoped prefix applied to every entity a module declares.
    Namespace
);

string_newtype!(
    /// Content digest in `<algorithm>:<hex>` form, e.g. `sha256:9f86d0...`.
    Digest
);

impl Namespace {
    /// Prefix an entity name with this namespace: `{namespace}__{name}`.
    pub fn prefix(&self, name: &str) -> String {
        format!("{}{NAMESPACE_SEPARATOR}{name}", self.0)
    }
}

impl Digest {
    /// Parse a digest string, accepting only `sha256:<64 hex>` and `sha512:<128 hex>`.
    pub fn parse(s: &str) -> Option<Self> {
        let (algo, hex) = s.split_once(':')?;
        let expected_len = match algo {
            "sha256" => 64,
            "sha512" => 128,
            _ => return None,
        };
        if hex.len() != expected_len || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self(format!("{algo}:{}", hex.to_ascii_lowercase())))
    }

    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map_or("", |(algo, _)| algo)
    }

    pub fn hex(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(_, hex)| hex)
    }

    /// Filesystem-safe stem: `sha256-<hex>`.
    pub fn file_stem(&self) -> String {
        self.0.replace(':', "-")
    }
}
