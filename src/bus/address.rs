//! Agent identities
//!
//! Provides type-safe identities for the agents that read and write the bus.
//!
//! # Identity Format
//!
//! An identity is either a bare name or a compound path:
//!
//! - `worker` - a bare agent name
//! - `team/worker` - agent `worker` in group `team`
//! - `org/team/worker` - groups may nest; the name is always the last segment
//!
//! Filenames only carry the base name, so comparisons between an identity
//! taken from a filename and one taken from frontmatter must be lenient.
//!
//! # Examples
//!
//! ```
//! use meshbus::bus::AgentId;
//!
//! let id: AgentId = "mesh-x/agent-y".parse().unwrap();
//! assert_eq!(id.base_name(), "agent-y");
//! assert_eq!(id.group(), Some("mesh-x"));
//! assert!(id.matches("agent-y"));
//! assert!(!id.matches("mesh-x/agent-z"));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for identity parsing
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("agent identity cannot be empty")]
    Empty,

    #[error("agent name cannot be empty in '{0}'")]
    EmptyName(String),

    #[error("agent group cannot contain empty segments in '{0}'")]
    EmptyGroupSegment(String),

    #[error("agent identity contains invalid characters: '{0}'")]
    InvalidCharacters(String),
}

/// A validated agent identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentId(String);

impl AgentId {
    /// Create an identity from a string
    ///
    /// # Errors
    /// Returns an error if the identity is empty, has an empty segment, or
    /// contains whitespace, control characters, or `>`.
    pub fn new(id: impl Into<String>) -> Result<Self, AddressError> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Create an identity from a group and a name
    pub fn compound(group: &str, name: &str) -> Result<Self, AddressError> {
        Self::new(format!("{}/{}", group, name))
    }

    /// The full identity as written in frontmatter
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The trailing segment after the last `/` (the whole identity if bare)
    pub fn base_name(&self) -> &str {
        base_name(&self.0)
    }

    /// Everything before the last `/`, if any
    pub fn group(&self) -> Option<&str> {
        self.0.rsplit_once('/').map(|(group, _)| group)
    }

    /// Check whether this is a `group/name` identity
    pub fn is_compound(&self) -> bool {
        self.0.contains('/')
    }

    /// Lenient identity comparison
    ///
    /// When both sides are compound they must be identical. Otherwise only the
    /// base names are compared, which lets a filename-derived base name match
    /// a full frontmatter identity.
    pub fn matches(&self, other: &str) -> bool {
        let other = other.trim();
        if self.is_compound() && other.contains('/') {
            self.0 == other
        } else {
            self.base_name() == base_name(other)
        }
    }

    fn validate(id: &str) -> Result<(), AddressError> {
        if id.is_empty() {
            return Err(AddressError::Empty);
        }

        if id
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == '>')
        {
            return Err(AddressError::InvalidCharacters(id.to_string()));
        }

        if base_name(id).is_empty() {
            return Err(AddressError::EmptyName(id.to_string()));
        }

        if let Some((group, _)) = id.rsplit_once('/') {
            if group.split('/').any(str::is_empty) {
                return Err(AddressError::EmptyGroupSegment(id.to_string()));
            }
        }

        Ok(())
    }
}

/// The trailing segment of a possibly compound identity string
pub fn base_name(id: &str) -> &str {
    id.rsplit('/').next().unwrap_or(id)
}

impl FromStr for AgentId {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.trim())
    }
}

impl TryFrom<String> for AgentId {
    type Error = AddressError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl TryFrom<&str> for AgentId {
    type Error = AddressError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<AgentId> for String {
    fn from(id: AgentId) -> Self {
        id.0
    }
}

impl AsRef<str> for AgentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
