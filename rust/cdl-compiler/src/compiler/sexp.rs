//! S-expression reader: UTF-8 source to a spanned tree of atoms and lists.
//!
//! This is the boundary between the outer CLI and the compiler core; the
//! parser proper never touches raw text. `( )` read as lists, `[ ]` as
//! arrays, `{ }` as sets; `;` starts a line comment.

use num_bigint::BigInt;
use num_traits::Num;

use crate::compiler::errors::SyntaxError;
use crate::compiler::span::{FileId, Span};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sexp {
    Symbol(String, Span),
    Number(BigInt, Span),
    Text(String, Span),
    List(Vec<Sexp>, Span),
    Array(Vec<Sexp>, Span),
    Set(Vec<Sexp>, Span),
}

impl Sexp {
    pub fn span(&self) -> Span {
        match self {
            Sexp::Symbol(_, s)
            | Sexp::Number(_, s)
            | Sexp::Text(_, s)
            | Sexp::List(_, s)
            | Sexp::Array(_, s)
            | Sexp::Set(_, s) => *s,
        }
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Sexp::Symbol(name, _) => Some(name),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<&BigInt> {
        match self {
            Sexp::Number(n, _) => Some(n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Sexp]> {
        match self {
            Sexp::List(items, _) => Some(items),
            _ => None,
        }
    }
}

/// Canonical one-line rendering, used to compare forms independently of
/// where they were written.
impl std::fmt::Display for Sexp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn items(f: &mut std::fmt::Formatter<'_>, xs: &[Sexp]) -> std::fmt::Result {
            for (i, x) in xs.iter().enumerate() {
                if i > 0 {
                    write!(f, " ")?;
                }
                write!(f, "{}", x)?;
            }
            Ok(())
        }
        match self {
            Sexp::Symbol(name, _) => write!(f, "{}", name),
            Sexp::Number(n, _) => write!(f, "{}", n),
            Sexp::Text(t, _) => write!(f, "{:?}", t),
            Sexp::List(xs, _) => {
                write!(f, "(")?;
                items(f, xs)?;
                write!(f, ")")
            }
            Sexp::Array(xs, _) => {
                write!(f, "[")?;
                items(f, xs)?;
                write!(f, "]")
            }
            Sexp::Set(xs, _) => {
                write!(f, "{{")?;
                items(f, xs)?;
                write!(f, "}}")
            }
        }
    }
}

/// Characters that may appear anywhere in a symbol. The parser enforces the
/// stricter identifier rules; the reader is permissive so that operator
/// heads (`+`, `<=`, `!=`) and attribute keywords (`:i128`) read as plain
/// symbols.
fn is_symbol_char(c: char) -> bool {
    c.is_alphanumeric() || "_'$-!@~+*=<>^:/.%".contains(c)
}

fn is_symbol_start(c: char) -> bool {
    is_symbol_char(c) && !c.is_ascii_digit()
}

pub struct Reader<'a> {
    source: &'a str,
    chars: Vec<char>,
    pos: usize,
    byte_offset: usize,
    file: FileId,
}

impl<'a> Reader<'a> {
    pub fn new(source: &'a str, file: FileId) -> Self {
        Self {
            source,
            chars: source.chars().collect(),
            pos: 0,
            byte_offset: 0,
            file,
        }
    }

    /// Read every top-level form in the file.
    pub fn read_all(mut self) -> Result<Vec<Sexp>, SyntaxError> {
        let mut forms = Vec::new();
        loop {
            self.skip_trivia();
            if self.current().is_none() {
                return Ok(forms);
            }
            forms.push(self.read_form()?);
        }
    }

    fn current(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos + 1).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        self.byte_offset += ch.len_utf8();
        Some(ch)
    }

    fn span_from(&self, start: usize) -> Span {
        Span::new(self.file, start, self.byte_offset)
    }

    fn skip_trivia(&mut self) {
        while let Some(ch) = self.current() {
            if ch.is_whitespace() {
                self.advance();
            } else if ch == ';' {
                while let Some(c) = self.current() {
                    if c == '\n' {
                        break;
                    }
                    self.advance();
                }
            } else {
                break;
            }
        }
    }

    fn read_form(&mut self) -> Result<Sexp, SyntaxError> {
        let start = self.byte_offset;
        match self.current() {
            Some('(') => self.read_delimited('(', ')', start),
            Some('[') => self.read_delimited('[', ']', start),
            Some('{') => self.read_delimited('{', '}', start),
            Some(c @ (')' | ']' | '}')) => {
                self.advance();
                Err(SyntaxError::new(
                    self.span_from(start),
                    format!("unexpected '{}'", c),
                ))
            }
            Some('"') => self.read_string(start),
            Some(c) if c.is_ascii_digit() => self.read_number(start, false),
            Some('-') if self.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) => {
                self.advance();
                self.read_number(start, true)
            }
            Some(c) if is_symbol_start(c) => self.read_symbol(start),
            Some(c) => {
                self.advance();
                Err(SyntaxError::new(
                    self.span_from(start),
                    format!("unexpected character '{}'", c),
                ))
            }
            None => Err(SyntaxError::new(
                self.span_from(start),
                "unexpected end of input",
            )),
        }
    }

    fn read_delimited(&mut self, open: char, close: char, start: usize) -> Result<Sexp, SyntaxError> {
        self.advance(); // consume the opener
        let mut items = Vec::new();
        loop {
            self.skip_trivia();
            match self.current() {
                None => {
                    return Err(SyntaxError::new(
                        self.span_from(start),
                        format!("unclosed '{}'", open),
                    ))
                }
                Some(c) if c == close => {
                    self.advance();
                    let span = self.span_from(start);
                    return Ok(match open {
                        '(' => Sexp::List(items, span),
                        '[' => Sexp::Array(items, span),
                        _ => Sexp::Set(items, span),
                    });
                }
                Some(c @ (')' | ']' | '}')) => {
                    self.advance();
                    return Err(SyntaxError::new(
                        self.span_from(start),
                        format!("expected '{}', found '{}'", close, c),
                    ));
                }
                Some(_) => items.push(self.read_form()?),
            }
        }
    }

    fn read_string(&mut self, start: usize) -> Result<Sexp, SyntaxError> {
        self.advance(); // opening quote
        let mut text = String::new();
        loop {
            match self.advance() {
                None => {
                    return Err(SyntaxError::new(
                        self.span_from(start),
                        "unterminated string literal",
                    ))
                }
                Some('"') => return Ok(Sexp::Text(text, self.span_from(start))),
                Some('\\') => match self.advance() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some(c @ ('"' | '\\')) => text.push(c),
                    _ => {
                        return Err(SyntaxError::new(
                            self.span_from(start),
                            "invalid escape sequence",
                        ))
                    }
                },
                Some(c) => text.push(c),
            }
        }
    }

    fn read_number(&mut self, start: usize, negative: bool) -> Result<Sexp, SyntaxError> {
        let text_start = self.byte_offset;
        let radix = if self.current() == Some('0') && matches!(self.peek(), Some('x') | Some('X')) {
            self.advance();
            self.advance();
            16
        } else {
            10
        };
        let digits_start = self.byte_offset;
        while let Some(c) = self.current() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.advance();
            } else {
                break;
            }
        }
        let raw: String = self.source[digits_start..self.byte_offset]
            .chars()
            .filter(|c| *c != '_')
            .collect();
        let span = self.span_from(start);
        if raw.is_empty() {
            return Err(SyntaxError::new(span, "invalid numeral"));
        }
        match BigInt::from_str_radix(&raw, radix) {
            Ok(n) => Ok(Sexp::Number(if negative { -n } else { n }, span)),
            Err(_) => Err(SyntaxError::new(
                span,
                format!(
                    "invalid numeral '{}'",
                    &self.source[text_start..self.byte_offset]
                ),
            )),
        }
    }

    fn read_symbol(&mut self, start: usize) -> Result<Sexp, SyntaxError> {
        while let Some(c) = self.current() {
            if is_symbol_char(c) {
                self.advance();
            } else {
                break;
            }
        }
        let name = self.source[start..self.byte_offset].to_string();
        Ok(Sexp::Symbol(name, self.span_from(start)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(src: &str) -> Vec<Sexp> {
        Reader::new(src, FileId(0)).read_all().unwrap()
    }

    fn read_err(src: &str) -> SyntaxError {
        Reader::new(src, FileId(0)).read_all().unwrap_err()
    }

    #[test]
    fn test_atoms() {
        let forms = read("X 42 0xff -3 \"hi\"");
        assert_eq!(forms.len(), 5);
        assert_eq!(forms[0].as_symbol(), Some("X"));
        assert_eq!(forms[1].as_number(), Some(&BigInt::from(42)));
        assert_eq!(forms[2].as_number(), Some(&BigInt::from(255)));
        assert_eq!(forms[3].as_number(), Some(&BigInt::from(-3)));
        assert!(matches!(&forms[4], Sexp::Text(t, _) if t == "hi"));
    }

    #[test]
    fn test_nested_lists() {
        let forms = read("(defconstraint c1 () (vanishes! X))");
        assert_eq!(forms.len(), 1);
        let items = forms[0].as_list().unwrap();
        assert_eq!(items[0].as_symbol(), Some("defconstraint"));
        assert_eq!(items[3].as_list().unwrap()[0].as_symbol(), Some("vanishes!"));
    }

    #[test]
    fn test_brackets_and_sets() {
        // `1:3` reads as the numeral 1 followed by the keyword `:3`.
        let forms = read("[1:3] {2}");
        let Sexp::Array(items, _) = &forms[0] else {
            panic!("expected array");
        };
        assert_eq!(items[0].as_number(), Some(&BigInt::from(1)));
        assert_eq!(items[1].as_symbol(), Some(":3"));
        assert!(matches!(&forms[1], Sexp::Set(items, _) if items.len() == 1));
    }

    #[test]
    fn test_operator_symbols() {
        let forms = read("(+ X 1) (<= A B) :i128 ~x'");
        assert_eq!(forms[0].as_list().unwrap()[0].as_symbol(), Some("+"));
        assert_eq!(forms[1].as_list().unwrap()[0].as_symbol(), Some("<="));
        assert_eq!(forms[2].as_symbol(), Some(":i128"));
        assert_eq!(forms[3].as_symbol(), Some("~x'"));
    }

    #[test]
    fn test_comments_are_trivia() {
        let forms = read("; header\n(a) ; trailing\n(b)");
        assert_eq!(forms.len(), 2);
    }

    #[test]
    fn test_spans_cover_source() {
        let src = "(defcolumns X)";
        let forms = read(src);
        let span = forms[0].span();
        assert_eq!((span.start, span.end), (0, src.len() as u32));
    }

    #[test]
    fn test_unclosed_list() {
        let e = read_err("(defcolumns X");
        assert!(e.message.contains("unclosed"));
    }

    #[test]
    fn test_mismatched_close() {
        let e = read_err("(a]");
        assert!(e.message.contains("expected ')'"));
    }

    #[test]
    fn test_unterminated_string() {
        let e = read_err("\"abc");
        assert!(e.message.contains("unterminated"));
    }
}
