//! Hierarchical symbol paths, the primary key for every named entity.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Path {
    segments: Vec<String>,
    absolute: bool,
}

impl Path {
    pub fn new(segments: Vec<String>, absolute: bool) -> Self {
        Path { segments, absolute }
    }

    pub fn root() -> Self {
        Path {
            segments: Vec::new(),
            absolute: true,
        }
    }

    pub fn relative(name: impl Into<String>) -> Self {
        Path {
            segments: vec![name.into()],
            absolute: false,
        }
    }

    /// Parse `a/b/c` (relative) or `/a/b/c` (absolute).
    pub fn parse(text: &str) -> Self {
        let absolute = text.starts_with('/');
        let segments = text
            .trim_start_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Path { segments, absolute }
    }

    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn head(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    /// The final segment: the unqualified name.
    pub fn name(&self) -> &str {
        self.segments
            .last()
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// All segments after the head.
    pub fn tail(&self) -> Path {
        Path {
            segments: self.segments.iter().skip(1).cloned().collect(),
            absolute: false,
        }
    }

    pub fn parent(&self) -> Path {
        let mut segments = self.segments.clone();
        segments.pop();
        Path {
            segments,
            absolute: self.absolute,
        }
    }

    pub fn extend(&self, segment: impl Into<String>) -> Path {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Path {
            segments,
            absolute: self.absolute,
        }
    }

    pub fn is_prefix_of(&self, other: &Path) -> bool {
        other.segments.len() >= self.segments.len()
            && self.segments.iter().zip(&other.segments).all(|(a, b)| a == b)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.absolute {
            write!(f, "/")?;
        }
        write!(f, "{}", self.segments.join("/"))
    }
}
