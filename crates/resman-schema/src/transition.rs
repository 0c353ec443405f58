use serde::{Deserialize, Serialize};
use std::fmt;

/// The fixed six-name lifecycle shared by every resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StandardTransition {
    Install,
    Configure,
    Start,
    Integrity,
    Stop,
    Uninstall,
}

impl StandardTransition {
    pub const ALL: [StandardTransition; 6] = [
        StandardTransition::Install,
        StandardTransition::Configure,
        StandardTransition::Start,
        StandardTransition::Integrity,
        StandardTransition::Stop,
        StandardTransition::Uninstall,
    ];

    /// Case-insensitive lookup; `None` for anything outside the standard set.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(name))
    }

    /// Lowercase name, as used for lifecycle command lookup.
    pub fn as_str(self) -> &'static str {
        match self {
            StandardTransition::Install => "install",
            StandardTransition::Configure => "configure",
            StandardTransition::Start => "start",
            StandardTransition::Integrity => "integrity",
            StandardTransition::Stop => "stop",
            StandardTransition::Uninstall => "uninstall",
        }
    }
}

impl fmt::Display for StandardTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
