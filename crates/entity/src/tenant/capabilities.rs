//! Caller capability tags.
//!
//! Fields and scopes declare the capability tags they require; the default
//! [`CapabilityPolicy`](crate::access::CapabilityPolicy) grants access when
//! the caller holds at least one of them.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// The set of capability tags granted to a caller.
///
/// # Examples
///
/// ```
/// use helios_entity::tenant::Capabilities;
///
/// let full = Capabilities::all();
/// assert!(full.has("admin"));
///
/// let caps = Capabilities::from_tags(["posts.read", "posts.write"]);
/// assert!(caps.has("posts.read"));
/// assert!(!caps.has("admin"));
/// assert!(caps.has_any(&["admin".to_string(), "posts.write".to_string()]));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Granted tags. Ignored when `all` is set.
    tags: HashSet<String>,
    /// Grants every tag.
    all: bool,
}

impl Capabilities {
    /// Capabilities that satisfy every check.
    pub fn all() -> Self {
        Self {
            tags: HashSet::new(),
            all: true,
        }
    }

    /// No capabilities at all.
    pub fn none() -> Self {
        Self::default()
    }

    /// Capabilities consisting of exactly the given tags.
    pub fn from_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
            all: false,
        }
    }

    /// Adds a tag.
    pub fn grant(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Returns `true` if the tag is granted.
    pub fn has(&self, tag: &str) -> bool {
        self.all || self.tags.contains(tag)
    }

    /// Returns `true` if at least one of the tags is granted.
    pub fn has_any(&self, tags: &[String]) -> bool {
        self.all || tags.iter().any(|t| self.tags.contains(t))
    }

    /// Returns `true` if every check passes.
    pub fn is_all(&self) -> bool {
        self.all
    }
}
