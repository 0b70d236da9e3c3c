//! Shared lexer for the template and configuration grammars.
//!
//! Both grammars are brace-structured with C-style comments. Words cover
//! identifiers and unquoted values (`eth0`, `192.0.2.0/24`, `-1`); values
//! containing characters outside the word set (IPv6 addresses, MAC
//! addresses, anything with spaces) are written as quoted strings.

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TokenKind {
    /// Identifier or unquoted value.
    Word(String),
    /// `%`-prefixed clause keyword, e.g. `%allow`.
    Clause(String),
    /// Double-quoted string, unescaped.
    Str(String),
    /// Configuration operator (`=`, `:=`, `!=`, `<`, `<=`, `>`, `>=`,
    /// `+=`, `-=`, `*=`, `/=`).
    Op(String),
    LBrace,
    RBrace,
    Semi,
    Comma,
    Colon,
    At,
}

#[derive(Debug, Clone)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub line: u32,
}

fn is_word_start(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/')
}

/// Tokenizes `text`, reporting errors against `source_hint`.
pub(crate) fn tokenize(text: &str, source_hint: &str) -> Result<Vec<Token>, Error> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    let mut line: u32 = 1;

    macro_rules! push {
        ($kind:expr) => {
            tokens.push(Token { kind: $kind, line })
        };
    }

    while let Some(c) = chars.next() {
        match c {
            '\n' => line += 1,
            c if c.is_whitespace() => {}
            '/' => match chars.peek() {
                Some('/') => {
                    // Line comment.
                    for c in chars.by_ref() {
                        if c == '\n' {
                            line += 1;
                            break;
                        }
                    }
                }
                Some('*') => {
                    chars.next();
                    let start_line = line;
                    let mut closed = false;
                    while let Some(c) = chars.next() {
                        match c {
                            '\n' => line += 1,
                            '*' if chars.peek() == Some(&'/') => {
                                chars.next();
                                closed = true;
                                break;
                            }
                            _ => {}
                        }
                    }
                    if !closed {
                        return Err(Error::parse(
                            source_hint,
                            start_line,
                            "unterminated comment",
                        ));
                    }
                }
                Some('=') => {
                    chars.next();
                    push!(TokenKind::Op("/=".to_owned()));
                }
                _ => {
                    return Err(Error::parse(source_hint, line, "unexpected '/'"));
                }
            },
            '"' => {
                let start_line = line;
                let mut s = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some(other) => s.push(other),
                            None => break,
                        },
                        '\n' => {
                            line += 1;
                            s.push('\n');
                        }
                        other => s.push(other),
                    }
                }
                if !closed {
                    return Err(Error::parse(source_hint, start_line, "unterminated string"));
                }
                push!(TokenKind::Str(s));
            }
            '{' => push!(TokenKind::LBrace),
            '}' => push!(TokenKind::RBrace),
            ';' => push!(TokenKind::Semi),
            ',' => push!(TokenKind::Comma),
            '@' => push!(TokenKind::At),
            ':' => {
                if chars.peek() == Some(&'=') {
                    chars.next();
                    push!(TokenKind::Op(":=".to_owned()));
                } else {
                    push!(TokenKind::Colon);
                }
            }
            '=' => push!(TokenKind::Op("=".to_owned())),
            '!' => {
                if chars.peek() == Some(&'=') {
                    chars.next();
                    push!(TokenKind::Op("!=".to_owned()));
                } else {
                    return Err(Error::parse(source_hint, line, "unexpected '!'"));
                }
            }
            '<' | '>' => {
                let mut op = c.to_string();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    op.push('=');
                }
                push!(TokenKind::Op(op));
            }
            '+' | '*' => {
                if chars.peek() == Some(&'=') {
                    chars.next();
                    push!(TokenKind::Op(format!("{c}=")));
                } else {
                    return Err(Error::parse(source_hint, line, format!("unexpected '{c}'")));
                }
            }
            '%' => {
                let mut s = String::from('%');
                while let Some(&c) = chars.peek() {
                    if is_word_char(c) {
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if s.len() == 1 {
                    return Err(Error::parse(source_hint, line, "bare '%'"));
                }
                push!(TokenKind::Clause(s));
            }
            c if c == '-' && chars.peek() == Some(&'=') => {
                chars.next();
                push!(TokenKind::Op("-=".to_owned()));
            }
            c if is_word_start(c) => {
                let mut s = String::from(c);
                while let Some(&c) = chars.peek() {
                    if is_word_char(c) {
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                push!(TokenKind::Word(s));
            }
            other => {
                return Err(Error::parse(
                    source_hint,
                    line,
                    format!("unexpected character '{other}'"),
                ));
            }
        }
    }
    Ok(tokens)
}

/// A cursor over a token stream, shared by both parsers.
pub(crate) struct Cursor<'a> {
    tokens: &'a [Token],
    pos: usize,
    source_hint: &'a str,
}

impl<'a> Cursor<'a> {
    pub fn new(tokens: &'a [Token], source_hint: &'a str) -> Self {
        Cursor {
            tokens,
            pos: 0,
            source_hint,
        }
    }

    pub fn peek(&self) -> Option<&'a TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    pub fn next(&mut self) -> Option<&'a Token> {
        let t = self.tokens.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    /// Line of the current token, or of the last token at end of input.
    pub fn line(&self) -> u32 {
        self.tokens
            .get(self.pos.min(self.tokens.len().saturating_sub(1)))
            .map_or(0, |t| t.line)
    }

    pub fn error(&self, message: impl Into<String>) -> Error {
        Error::parse(self.source_hint, self.line(), message)
    }

    pub fn error_at(&self, line: u32, message: impl Into<String>) -> Error {
        Error::parse(self.source_hint, line, message)
    }

    pub fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<(), Error> {
        match self.next() {
            Some(t) if t.kind == *kind => Ok(()),
            Some(t) => Err(Error::parse(
                self.source_hint,
                t.line,
                format!("expected {what}, found {:?}", t.kind),
            )),
            None => Err(self.error(format!("expected {what}, found end of input"))),
        }
    }

    /// Consumes a word token.
    pub fn expect_word(&mut self, what: &str) -> Result<String, Error> {
        match self.next() {
            Some(Token {
                kind: TokenKind::Word(w),
                ..
            }) => Ok(w.clone()),
            Some(t) => Err(Error::parse(
                self.source_hint,
                t.line,
                format!("expected {what}, found {:?}", t.kind),
            )),
            None => Err(self.error(format!("expected {what}, found end of input"))),
        }
    }

    /// Consumes a string token.
    pub fn expect_str(&mut self, what: &str) -> Result<String, Error> {
        match self.next() {
            Some(Token {
                kind: TokenKind::Str(s),
                ..
            }) => Ok(s.clone()),
            Some(t) => Err(Error::parse(
                self.source_hint,
                t.line,
                format!("expected {what}, found {:?}", t.kind),
            )),
            None => Err(self.error(format!("expected {what}, found end of input"))),
        }
    }

    /// Consumes a word or a quoted string; both render values.
    pub fn expect_value(&mut self, what: &str) -> Result<String, Error> {
        match self.next() {
            Some(Token {
                kind: TokenKind::Word(w),
                ..
            }) => Ok(w.clone()),
            Some(Token {
                kind: TokenKind::Str(s),
                ..
            }) => Ok(s.clone()),
            Some(Token {
                kind: TokenKind::Op(op),
                line,
            }) => Err(Error::parse(
                self.source_hint,
                *line,
                format!("expected {what}, found operator '{op}'"),
            )),
            Some(t) => Err(Error::parse(
                self.source_hint,
                t.line,
                format!("expected {what}, found {:?}", t.kind),
            )),
            None => Err(self.error(format!("expected {what}, found end of input"))),
        }
    }

    /// Consumes the next token if it matches `kind`.
    pub fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek() == Some(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(text: &str) -> Vec<TokenKind> {
        tokenize(text, "test")
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn words_ops_and_punctuation() {
        assert_eq!(
            kinds("mtu = 1500;"),
            vec![
                TokenKind::Word("mtu".to_owned()),
                TokenKind::Op("=".to_owned()),
                TokenKind::Word("1500".to_owned()),
                TokenKind::Semi,
            ]
        );
        assert_eq!(
            kinds("a := b != c <= d >= e += f -= g *= h /= i"),
            vec![
                TokenKind::Word("a".to_owned()),
                TokenKind::Op(":=".to_owned()),
                TokenKind::Word("b".to_owned()),
                TokenKind::Op("!=".to_owned()),
                TokenKind::Word("c".to_owned()),
                TokenKind::Op("<=".to_owned()),
                TokenKind::Word("d".to_owned()),
                TokenKind::Op(">=".to_owned()),
                TokenKind::Word("e".to_owned()),
                TokenKind::Op("+=".to_owned()),
                TokenKind::Word("f".to_owned()),
                TokenKind::Op("-=".to_owned()),
                TokenKind::Word("g".to_owned()),
                TokenKind::Op("*=".to_owned()),
                TokenKind::Word("h".to_owned()),
                TokenKind::Op("/=".to_owned()),
                TokenKind::Word("i".to_owned()),
            ]
        );
    }

    #[test]
    fn comments_are_skipped_and_lines_tracked() {
        let tokens = tokenize("/* marker */\n// note\nfoo {\n}\n", "test").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Word("foo".to_owned()));
        assert_eq!(tokens[0].line, 3);
        assert_eq!(tokens[2].line, 4);
    }

    #[test]
    fn strings_and_clauses() {
        assert_eq!(
            kinds("%help: \"the \\\"mtu\\\"\";"),
            vec![
                TokenKind::Clause("%help".to_owned()),
                TokenKind::Colon,
                TokenKind::Str("the \"mtu\"".to_owned()),
                TokenKind::Semi,
            ]
        );
    }

    #[test]
    fn words_cover_values() {
        assert_eq!(
            kinds("192.0.2.0/24 -1 eth0.100"),
            vec![
                TokenKind::Word("192.0.2.0/24".to_owned()),
                TokenKind::Word("-1".to_owned()),
                TokenKind::Word("eth0.100".to_owned()),
            ]
        );
    }

    #[test]
    fn unterminated_string_pinpoints_line() {
        let err = tokenize("x {\n  y = \"oops;\n}\n", "f.tp").unwrap_err();
        assert!(err.to_string().contains("f.tp:2"), "{err}");
    }
}
