//! Source spans and the file table behind them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index into the [`SourceMap`] file table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub u32);

/// Byte range within one source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub file: FileId,
    /// Byte offset of the start in the source
    pub start: u32,
    /// Byte offset of the end (exclusive) in the source
    pub end: u32,
}

impl Span {
    pub fn new(file: FileId, start: usize, end: usize) -> Self {
        Self {
            file,
            start: start as u32,
            end: end as u32,
        }
    }

    pub fn dummy() -> Self {
        Self {
            file: FileId(0),
            start: 0,
            end: 0,
        }
    }

    pub fn merge(self, other: Span) -> Span {
        Span {
            file: self.file,
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFile {
    pub name: String,
    pub text: String,
}

/// Owns every source file fed to one compilation and renders diagnostic
/// locations as `path:start-end`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceMap {
    files: Vec<SourceFile>,
}

impl SourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, name: impl Into<String>, text: impl Into<String>) -> FileId {
        let id = FileId(self.files.len() as u32);
        self.files.push(SourceFile {
            name: name.into(),
            text: text.into(),
        });
        id
    }

    pub fn name_of(&self, file: FileId) -> &str {
        &self.files[file.0 as usize].name
    }

    pub fn text_of(&self, file: FileId) -> &str {
        &self.files[file.0 as usize].text
    }

    pub fn files(&self) -> impl Iterator<Item = (FileId, &SourceFile)> {
        self.files
            .iter()
            .enumerate()
            .map(|(i, f)| (FileId(i as u32), f))
    }

    /// True when `span` lies within the file it claims to come from.
    pub fn is_valid(&self, span: Span) -> bool {
        self.files
            .get(span.file.0 as usize)
            .map(|f| span.start <= span.end && span.end as usize <= f.text.len())
            .unwrap_or(false)
    }

    pub fn location(&self, span: Span) -> String {
        format!("{}:{}", self.name_of(span.file), span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge() {
        let f = FileId(0);
        let a = Span::new(f, 4, 9);
        let b = Span::new(f, 7, 15);
        let m = a.merge(b);
        assert_eq!(m.start, 4);
        assert_eq!(m.end, 15);
    }

    #[test]
    fn test_location_rendering() {
        let mut map = SourceMap::new();
        let id = map.add_file("zkevm.cdl", "(module mem)");
        assert_eq!(map.location(Span::new(id, 1, 7)), "zkevm.cdl:1-7");
    }

    #[test]
    fn test_span_validity() {
        let mut map = SourceMap::new();
        let id = map.add_file("a.cdl", "(defcolumns X)");
        assert!(map.is_valid(Span::new(id, 0, 14)));
        assert!(!map.is_valid(Span::new(id, 0, 15)));
        assert!(!map.is_valid(Span::new(FileId(3), 0, 1)));
    }
}
