//! Validated names for cluster objects.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CtrlError, CtrlResult};

struct NameRules {
    kind: &'static str,
    min_len: usize,
    max_len: usize,
    extra_chars: &'static [char],
}

const NODE_RULES: NameRules = NameRules {
    kind: "node",
    min_len: 2,
    max_len: 255,
    extra_chars: &['_', '-', '.'],
};

const RESOURCE_RULES: NameRules = NameRules {
    kind: "resource",
    min_len: 2,
    max_len: 48,
    extra_chars: &['_', '-'],
};

const SNAPSHOT_RULES: NameRules = NameRules {
    kind: "snapshot",
    min_len: 2,
    max_len: 48,
    extra_chars: &['_', '-'],
};

fn validate(rules: &NameRules, name: &str) -> CtrlResult<()> {
    let invalid = |reason| CtrlError::InvalidName {
        kind: rules.kind,
        name: name.to_string(),
        reason,
    };
    if name.len() < rules.min_len {
        return Err(invalid("name is too short"));
    }
    if name.len() > rules.max_len {
        return Err(invalid("name is too long"));
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return Err(invalid("name must start with a letter or '_'")),
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || rules.extra_chars.contains(&c)) {
        return Err(invalid("name contains invalid characters"));
    }
    Ok(())
}

macro_rules! name_type {
    ($(#[$doc:meta])* $name:ident, $rules:expr) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Validates and wraps a name.
            pub fn new(name: impl Into<String>) -> CtrlResult<Self> {
                let name = name.into();
                validate(&$rules, &name)?;
                Ok(Self(name))
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
            type Err = CtrlError;

            fn from_str(s: &str) -> CtrlResult<Self> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = CtrlError;

            fn try_from(s: String) -> CtrlResult<Self> {
                Self::new(s)
            }
        }

        impl From<$name> for String {
            fn from(name: $name) -> String {
                name.0
            }
        }
    };
}

name_type!(
    /// Name of a satellite node.
    NodeName,
    NODE_RULES
);

name_type!(
    /// Name of a resource definition.
    ResourceName,
    RESOURCE_RULES
);

name_type!(
    /// Name of a snapshot definition, unique per resource.
    SnapshotName,
    SNAPSHOT_RULES
);
