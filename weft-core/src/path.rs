//! Document paths.
//!
//! A path is a sequence of object keys and list indices addressing a
//! location inside a JSON document. The empty path addresses the root.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One step of a [`Path`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl PathSegment {
    pub fn as_index(&self) -> Option<usize> {
        match self {
            PathSegment::Index(i) => Some(*i),
            PathSegment::Key(_) => None,
        }
    }

    pub fn as_key(&self) -> Option<&str> {
        match self {
            PathSegment::Key(k) => Some(k),
            PathSegment::Index(_) => None,
        }
    }
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(key: String) -> Self {
        PathSegment::Key(key)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

pub type Path = Vec<PathSegment>;

/// True when `prefix` addresses a strict ancestor of `path`.
pub fn is_strict_prefix(prefix: &[PathSegment], path: &[PathSegment]) -> bool {
    prefix.len() < path.len() && path[..prefix.len()] == *prefix
}

/// Renders a path as `fields.name[2]`, root as `<root>`.
pub struct PathDisplay<'a>(pub &'a [PathSegment]);

impl fmt::Display for PathDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "<root>");
        }
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                PathSegment::Key(k) if i == 0 => write!(f, "{k}")?,
                PathSegment::Key(k) => write!(f, ".{k}")?,
                PathSegment::Index(idx) => write!(f, "[{idx}]")?,
            }
        }
        Ok(())
    }
}

/// Builds a [`Path`] from a mix of keys and indices.
///
/// ```
/// use weft_core::{path, PathSegment};
/// let p = path!["items", 2usize, "title"];
/// assert_eq!(p[1], PathSegment::Index(2));
/// ```
#[macro_export]
macro_rules! path {
    () => { ::std::vec::Vec::<$crate::PathSegment>::new() };
    ($($segment:expr),+ $(,)?) => {
        vec![$($crate::PathSegment::from($segment)),+]
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_mixes_keys_and_indices() {
        let p: Path = path!["fields", "tags", 3usize];
        assert_eq!(PathDisplay(&p).to_string(), "fields.tags[3]");
        assert_eq!(PathDisplay(&[]).to_string(), "<root>");
    }

    #[test]
    fn test_strict_prefix() {
        let a: Path = path!["a"];
        let ab: Path = path!["a", "b"];
        assert!(is_strict_prefix(&a, &ab));
        assert!(!is_strict_prefix(&ab, &ab));
        assert!(!is_strict_prefix(&ab, &a));
        assert!(is_strict_prefix(&[], &a));
    }

    #[test]
    fn test_segments_deserialize_untagged() {
        let p: Path = serde_json::from_str(r#"["items", 0, "x"]"#).unwrap();
        assert_eq!(p, path!["items", 0usize, "x"]);
        assert!(serde_json::from_str::<Path>("[-1]").is_err());
    }
}
