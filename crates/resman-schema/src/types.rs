//! Identifier newtypes shared by every resman layer.
//!
//! Both serialize transparently so the wire format stays plain.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

/// Fully qualified resource type name, `resource::<kind>::<version>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeName(String);

impl TypeName {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Type name derived from a resource directory name.
    pub fn for_kind(kind: &str) -> Self {
        Self(format!("resource::{kind}::1.0"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The name with `:`, `.` and `-` replaced by `_`, as used in event payloads.
    pub fn normalized(&self) -> String {
        self.0
            .chars()
            .map(|c| if matches!(c, ':' | '.' | '-') { '_' } else { c })
            .collect()
    }
}

impl Deref for TypeName {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for TypeName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl From<&str> for TypeName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for TypeName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Process-lifetime-unique resource instance identifier.
///
/// Clients see it as a decimal string; it is allocated monotonically and
/// never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(u64);

impl ResourceId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ResourceId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(Self)
    }
}
