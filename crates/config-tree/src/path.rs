//! Topic paths
//!
//! A node's identity is its path from the root. Paths render as
//! `/segment/segment/...`; the root is `/`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Path of a node in the configuration tree
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TopicPath {
    segments: Vec<String>,
}

impl TopicPath {
    /// The root path `/`
    pub fn root() -> Self {
        Self { segments: Vec::new() }
    }

    /// Parse a path from text
    ///
    /// A leading `/` is optional; empty segments and embedded NUL bytes are
    /// rejected.
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.strip_prefix('/').unwrap_or(text);
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let mut segments = Vec::new();
        for segment in trimmed.split('/') {
            if segment.is_empty() || segment.contains('\0') {
                return Err(Error::InvalidPath {
                    path: text.to_string(),
                });
            }
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    /// Build a path from segments
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// The path segments, root-first
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// True for the root path
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Append a segment, producing a child path
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// The parent path, or `None` at the root
    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// The final segment, or `None` at the root
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// True when `self` is `prefix` or a descendant of it
    pub fn starts_with(&self, prefix: &TopicPath) -> bool {
        self.segments.len() >= prefix.segments.len()
            && self.segments[..prefix.segments.len()] == prefix.segments[..]
    }
}

impl fmt::Display for TopicPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return write!(f, "/");
        }
        for segment in &self.segments {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}

impl TryFrom<String> for TopicPath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<TopicPath> for String {
    fn from(path: TopicPath) -> Self {
        path.to_string()
    }
}

impl std::str::FromStr for TopicPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let path = TopicPath::parse("/services/main/lifecycle/run").unwrap();
        assert_eq!(path.segments().len(), 4);
        assert_eq!(path.to_string(), "/services/main/lifecycle/run");

        let bare = TopicPath::parse("services/main").unwrap();
        assert_eq!(bare.to_string(), "/services/main");
    }

    #[test]
    fn test_root() {
        let root = TopicPath::parse("/").unwrap();
        assert!(root.is_root());
        assert_eq!(root.to_string(), "/");
        assert!(root.parent().is_none());
    }

    #[test]
    fn test_invalid_paths() {
        assert!(TopicPath::parse("/a//b").is_err());
        assert!(TopicPath::parse("/a/\0b").is_err());
    }

    #[test]
    fn test_parent_child() {
        let path = TopicPath::parse("/services/main").unwrap();
        assert_eq!(path.name(), Some("main"));
        assert_eq!(path.parent().unwrap().to_string(), "/services");
        assert_eq!(path.child("version").to_string(), "/services/main/version");
    }

    #[test]
    fn test_starts_with() {
        let prefix = TopicPath::parse("/services/main").unwrap();
        let deep = TopicPath::parse("/services/main/lifecycle/run").unwrap();
        let other = TopicPath::parse("/services/mainline").unwrap();
        assert!(deep.starts_with(&prefix));
        assert!(prefix.starts_with(&prefix));
        assert!(!other.starts_with(&prefix));
        assert!(deep.starts_with(&TopicPath::root()));
    }
}
