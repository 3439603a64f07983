//! Spanned syntax errors, batched by every phase and never thrown.

use crate::compiler::span::{SourceMap, Span};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct SyntaxError {
    pub span: Span,
    pub message: String,
}

impl SyntaxError {
    pub fn new(span: Span, message: impl Into<String>) -> Self {
        SyntaxError {
            span,
            message: message.into(),
        }
    }

    /// `path:span "message"`, the reporting format of the whole pipeline.
    pub fn render(&self, sources: &SourceMap) -> String {
        format!("{} \"{}\"", sources.location(self.span), self.message)
    }
}

/// Order diagnostics by file, then by span within the file.
pub fn sort_diagnostics(errors: &mut [SyntaxError]) {
    errors.sort_by_key(|e| (e.span.file, e.span.start, e.span.end));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::span::FileId;

    #[test]
    fn test_render() {
        let mut sources = SourceMap::new();
        let id = sources.add_file("mem.cdl", "(defcolumns)");
        let e = SyntaxError::new(Span::new(id, 1, 11), "malformed declaration");
        assert_eq!(e.render(&sources), "mem.cdl:1-11 \"malformed declaration\"");
    }

    #[test]
    fn test_sorting() {
        let f = FileId(0);
        let mut errors = vec![
            SyntaxError::new(Span::new(f, 9, 12), "b"),
            SyntaxError::new(Span::new(f, 2, 4), "a"),
        ];
        sort_diagnostics(&mut errors);
        assert_eq!(errors[0].message, "a");
    }
}
