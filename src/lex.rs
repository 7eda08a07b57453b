use std::{fmt::Display, sync::Arc};

use miette::{NamedSource, SourceSpan};

use crate::{
    error::{Result, ScriptError},
    ops,
};

/// A named piece of script text shared by every location that points into it.
#[derive(Debug)]
pub struct SourceFile {
    name: String,
    named: NamedSource<String>,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        Arc::new(SourceFile {
            named: NamedSource::new(&name, text.into()),
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn text(&self) -> &str {
        self.named.inner()
    }

    pub(crate) fn named(&self) -> &NamedSource<String> {
        &self.named
    }
}

#[derive(Debug, Clone)]
pub struct Location {
    pub source: Arc<SourceFile>,
    pub offset: usize,
    pub len: usize,
}

impl PartialEq for Location {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.source, &other.source)
            && self.offset == other.offset
            && self.len == other.len
    }
}

impl Location {
    pub fn new(source: &Arc<SourceFile>, offset: usize, len: usize) -> Self {
        Location {
            source: Arc::clone(source),
            offset,
            len,
        }
    }

    pub fn span(&self) -> SourceSpan {
        SourceSpan::from(self.offset..self.offset + self.len)
    }

    /// Extend this location so it ends where `other` ends.
    pub fn to(&self, other: &Location) -> Location {
        let end = (other.offset + other.len).max(self.offset + self.len);
        Location::new(&self.source, self.offset, end - self.offset)
    }

    pub fn line(&self) -> usize {
        let text = self.source.text().as_bytes();
        let end = self.offset.min(text.len());
        text[..end].iter().filter(|b| **b == b'\n').count() + 1
    }

    pub fn column(&self) -> usize {
        let text = self.source.text().as_bytes();
        let end = self.offset.min(text.len());
        let line_start = text[..end]
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(0, |i| i + 1);
        end - line_start + 1
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.source.name(), self.line(), self.column())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Token<'de> {
    pub kind: TokenKind,
    pub literal: &'de str,
    pub offset: usize,
    /// A line break separates this token from the previous one.
    pub newline_before: bool,
}

impl Token<'_> {
    pub fn is(&self, kind: TokenKind, literal: &str) -> bool {
        self.kind == kind && self.literal == literal
    }

    pub fn is_op(&self, symbol: &str) -> bool {
        self.is(TokenKind::Op, symbol)
    }

    pub fn is_keyword(&self, keyword: &str) -> bool {
        self.is(TokenKind::Keyword, keyword)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TokenKind {
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Semicolon,
    Dollar,
    DotDot,
    Op,
    Keyword,
    Ident,
    String,
    Integer(i64),
    Decimal(f64),
}

impl Display for Token<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lit = self.literal;
        match self.kind {
            TokenKind::LeftParen => write!(f, "LEFT_PAREN {lit} null"),
            TokenKind::RightParen => write!(f, "RIGHT_PAREN {lit} null"),
            TokenKind::LeftBrace => write!(f, "LEFT_BRACE {lit} null"),
            TokenKind::RightBrace => write!(f, "RIGHT_BRACE {lit} null"),
            TokenKind::LeftBracket => write!(f, "LEFT_BRACKET {lit} null"),
            TokenKind::RightBracket => write!(f, "RIGHT_BRACKET {lit} null"),
            TokenKind::Comma => write!(f, "COMMA {lit} null"),
            TokenKind::Semicolon => write!(f, "SEMICOLON {lit} null"),
            TokenKind::Dollar => write!(f, "DOLLAR {lit} null"),
            TokenKind::DotDot => write!(f, "DOT_DOT {lit} null"),
            TokenKind::Op => write!(f, "OPERATOR {lit} null"),
            TokenKind::Keyword => write!(f, "{} {lit} null", lit.to_uppercase()),
            TokenKind::Ident => write!(f, "IDENTIFIER {lit} null"),
            TokenKind::String => write!(f, "STRING \"{lit}\" {}", unescape(lit)),
            TokenKind::Integer(n) => write!(f, "INTEGER {lit} {n}"),
            TokenKind::Decimal(n) => {
                if n == n.trunc() {
                    write!(f, "DECIMAL {lit} {n}.0")
                } else {
                    write!(f, "DECIMAL {lit} {n}")
                }
            }
        }
    }
}

/// Resolve the escape sequences of a string literal body.
pub fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

pub struct Lexer<'de> {
    source: &'de Arc<SourceFile>,
    whole: &'de str,
    rest: &'de str,
    byte: usize,
    newline: bool,
}

impl<'de> Lexer<'de> {
    pub fn new(source: &'de Arc<SourceFile>) -> Self {
        let input = source.text();
        Lexer {
            source,
            whole: input,
            rest: input,
            byte: 0,
            newline: false,
        }
    }

    fn location(&self, offset: usize, len: usize) -> Location {
        Location::new(self.source, offset, len)
    }

    fn token(&mut self, kind: TokenKind, literal: &'de str, offset: usize) -> Token<'de> {
        let newline_before = std::mem::take(&mut self.newline);
        Token {
            kind,
            literal,
            offset,
            newline_before,
        }
    }
}

impl<'de> Iterator for Lexer<'de> {
    type Item = Result<Token<'de>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let mut chars = self.rest.chars();
            let c = chars.next()?;
            let start = self.byte;
            let cur = self.rest;

            enum Start {
                String(char),
                Ident,
                Number,
                Symbol,
            }

            let started = match c {
                '\n' => {
                    self.newline = true;
                    self.rest = chars.as_str();
                    self.byte += 1;
                    continue;
                }
                ' ' | '\r' | '\t' => {
                    self.rest = chars.as_str();
                    self.byte += 1;
                    continue;
                }
                '/' if cur.starts_with("//") => {
                    let new_line = cur.find('\n').unwrap_or(cur.len());
                    self.byte += new_line;
                    self.rest = &cur[new_line..];
                    continue;
                }
                '"' | '\'' => Start::String(c),
                'a'..='z' | 'A'..='Z' | '_' => Start::Ident,
                '0'..='9' => Start::Number,
                _ => Start::Symbol,
            };

            match started {
                Start::String(quote) => {
                    let body = &cur[1..];
                    let mut escaped = false;
                    let end = body.char_indices().find_map(|(i, ch)| {
                        if escaped {
                            escaped = false;
                            None
                        } else if ch == '\\' {
                            escaped = true;
                            None
                        } else if ch == quote {
                            Some(i)
                        } else {
                            None
                        }
                    });
                    let Some(end) = end else {
                        return Some(Err(ScriptError::parse(
                            "unterminated string",
                            self.location(start, self.whole.len() - start),
                        )
                        .with_help(format!(
                            "add a trailing `{quote}` to terminate the string literal"
                        ))));
                    };
                    let literal = &body[..end];
                    self.byte += end + 2;
                    self.rest = &body[end + 1..];
                    return Some(Ok(self.token(TokenKind::String, literal, start)));
                }
                Start::Ident => {
                    let first_non_ident = cur
                        .find(|c| !matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '_'))
                        .unwrap_or(cur.len());
                    let literal = &cur[..first_non_ident];
                    self.byte += literal.len();
                    self.rest = &cur[literal.len()..];

                    let kind = if ops::table().is_keyword(literal) {
                        TokenKind::Keyword
                    } else {
                        TokenKind::Ident
                    };
                    return Some(Ok(self.token(kind, literal, start)));
                }
                Start::Number => {
                    let digits = |s: &str| s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
                    let mut len = digits(cur);
                    let fraction = cur[len..]
                        .strip_prefix('.')
                        .is_some_and(|after| after.starts_with(|c: char| c.is_ascii_digit()));
                    if fraction {
                        len += 1 + digits(&cur[len + 1..]);
                    }
                    let literal = &cur[..len];
                    self.byte += len;
                    self.rest = &cur[len..];

                    let kind = if fraction {
                        literal.parse().map(TokenKind::Decimal).map_err(|e| e.to_string())
                    } else {
                        literal.parse().map(TokenKind::Integer).map_err(|e| e.to_string())
                    };
                    return Some(match kind {
                        Ok(kind) => Ok(self.token(kind, literal, start)),
                        Err(e) => Err(ScriptError::parse(
                            format!("invalid numeric literal: {e}"),
                            self.location(start, len),
                        )),
                    });
                }
                Start::Symbol => {
                    let Some(symbol) = ops::table()
                        .symbols()
                        .iter()
                        .find(|symbol| cur.starts_with(**symbol))
                    else {
                        return Some(Err(ScriptError::parse(
                            format!("Unexpected character: {c}"),
                            self.location(start, c.len_utf8()),
                        )
                        .with_help(format!("remove or correct the character: `{c}`"))));
                    };
                    let literal = &cur[..symbol.len()];
                    self.byte += literal.len();
                    self.rest = &cur[literal.len()..];

                    let kind = match literal {
                        "(" => TokenKind::LeftParen,
                        ")" => TokenKind::RightParen,
                        "{" => TokenKind::LeftBrace,
                        "}" => TokenKind::RightBrace,
                        "[" => TokenKind::LeftBracket,
                        "]" => TokenKind::RightBracket,
                        "," => TokenKind::Comma,
                        ";" => TokenKind::Semicolon,
                        "$" => TokenKind::Dollar,
                        ".." => TokenKind::DotDot,
                        _ => TokenKind::Op,
                    };
                    return Some(Ok(self.token(kind, literal, start)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(text: &str) -> Vec<TokenKind> {
        let source = SourceFile::new("test", text);
        Lexer::new(&source)
            .map(|token| token.unwrap().kind)
            .collect()
    }

    #[test]
    fn ranges_are_not_decimals() {
        assert_eq!(
            kinds("[1..5]"),
            vec![
                TokenKind::LeftBracket,
                TokenKind::Integer(1),
                TokenKind::DotDot,
                TokenKind::Integer(5),
                TokenKind::RightBracket,
            ]
        );
        assert_eq!(kinds("2.5"), vec![TokenKind::Decimal(2.5)]);
    }

    #[test]
    fn longest_symbol_wins() {
        let source = SourceFile::new("test", "a := b <=> c");
        let literals: Vec<_> = Lexer::new(&source)
            .map(|token| token.unwrap().literal)
            .collect();
        assert_eq!(literals, vec!["a", ":=", "b", "<=>", "c"]);
    }

    #[test]
    fn newlines_are_recorded() {
        let source = SourceFile::new("test", "a\n(b)");
        let tokens: Vec<_> = Lexer::new(&source).map(|t| t.unwrap()).collect();
        assert!(!tokens[0].newline_before);
        assert!(tokens[1].newline_before);
        assert!(!tokens[2].newline_before);
    }

    #[test]
    fn strings_keep_escapes_until_unescaped() {
        let source = SourceFile::new("test", r#"'it\'s' "a\nb""#);
        let tokens: Vec<_> = Lexer::new(&source).map(|t| t.unwrap()).collect();
        assert_eq!(unescape(tokens[0].literal), "it's");
        assert_eq!(unescape(tokens[1].literal), "a\nb");
    }

    #[test]
    fn unterminated_string_reports_line() {
        let source = SourceFile::new("test", "a = 1\nb = \"oops");
        let err = Lexer::new(&source)
            .find_map(|token| token.err())
            .unwrap();
        assert_eq!(err.line(), Some(2));
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            kinds("1 // ignored\n2"),
            vec![TokenKind::Integer(1), TokenKind::Integer(2)]
        );
    }
}
