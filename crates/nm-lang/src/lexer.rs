//! NM Script tokenizer.
//!
//! Input is raw bytes: scripts arriving from packs or disk may carry encoding
//! damage, and the lexer's contract is to validate UTF-8 itself, code point
//! by code point. Invalid sequences (overlong forms, surrogate code points,
//! values past U+10FFFF, truncated tails) are reported and *skipped* so the
//! surrounding tokens stay usable. All other errors accumulate the same way;
//! the caller decides whether any error is fatal.

use crate::token::{Location, Token, TokenKind};
use thiserror::Error;

/// Maximum block-comment nesting before the lexer reports
/// [`LexErrorKind::CommentDepthExceeded`].
pub const MAX_COMMENT_DEPTH: u32 = 128;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LexErrorKind {
    #[error("invalid UTF-8 byte sequence")]
    InvalidUtf8,
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unclosed block comment")]
    UnclosedBlockComment,
    #[error("block comments nest at most {MAX_COMMENT_DEPTH} deep")]
    CommentDepthExceeded,
    #[error("colour literal has {found} hex digits; expected 3, 6, or 8")]
    InvalidColorLiteral { found: usize },
    #[error("unexpected character '{0}'")]
    UnexpectedCharacter(char),
}

#[derive(Debug, Error, Clone, PartialEq)]
#[error("{location}: {kind}")]
pub struct LexError {
    pub kind: LexErrorKind,
    pub location: Location,
}

pub struct Lexer<'a> {
    bytes: &'a [u8],
    pos: usize,
    line: u32,
    column: u32,
    tokens: Vec<Token>,
    errors: Vec<LexError>,
}

/// Tokenize a source buffer. Returns the token stream (always terminated by
/// an `EndOfFile` token) together with every error encountered.
pub fn tokenize_bytes(source: &[u8]) -> (Vec<Token>, Vec<LexError>) {
    Lexer::new(source).run()
}

/// Strict wrapper over [`tokenize_bytes`]: any lex error fails the call.
pub fn tokenize(source: &str) -> Result<Vec<Token>, Vec<LexError>> {
    let (tokens, errors) = tokenize_bytes(source.as_bytes());
    if errors.is_empty() {
        Ok(tokens)
    } else {
        Err(errors)
    }
}

impl<'a> Lexer<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            line: 1,
            column: 1,
            tokens: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn run(mut self) -> (Vec<Token>, Vec<LexError>) {
        while self.pos < self.bytes.len() {
            let loc = self.here();
            let Some(c) = self.next_char() else { continue };
            match c {
                ' ' | '\t' | '\r' | '\n' => {}
                '/' if self.peek_byte() == Some(b'/') => self.skip_line_comment(),
                '/' if self.peek_byte() == Some(b'*') => self.skip_block_comment(loc),
                '"' => self.lex_string(loc),
                '#' => self.lex_color(loc),
                '0'..='9' => self.lex_number(c, loc),
                _ if is_identifier_start(c) => self.lex_identifier(c, loc),
                _ => self.lex_operator(c, loc),
            }
        }
        let eof = self.here();
        self.tokens.push(Token::new(TokenKind::EndOfFile, "", eof));
        if !self.errors.is_empty() {
            tracing::debug!(
                target: "lang.lexer",
                errors = self.errors.len(),
                tokens = self.tokens.len(),
                "tokenized with errors"
            );
        }
        (self.tokens, self.errors)
    }

    fn here(&self) -> Location {
        Location::new(self.line, self.column)
    }

    fn error(&mut self, kind: LexErrorKind, location: Location) {
        self.errors.push(LexError { kind, location });
    }

    fn peek_byte(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    /// Decode the next code point, advancing position and line/column
    /// bookkeeping. On malformed input this reports `InvalidUtf8`, skips the
    /// offending bytes, and returns `None` so the main loop simply resumes.
    fn next_char(&mut self) -> Option<char> {
        match decode_utf8(&self.bytes[self.pos..]) {
            Ok((c, width)) => {
                self.pos += width;
                if c == '\n' {
                    self.line += 1;
                    self.column = 1;
                } else {
                    self.column += 1;
                }
                Some(c)
            }
            Err(skip) => {
                let loc = self.here();
                self.error(LexErrorKind::InvalidUtf8, loc);
                self.pos += skip;
                self.column += 1;
                None
            }
        }
    }

    /// Peek the next code point without consuming. Malformed bytes peek as
    /// `None`; the subsequent `next_char` will report them.
    fn peek_char(&self) -> Option<char> {
        decode_utf8(&self.bytes[self.pos..]).ok().map(|(c, _)| c)
    }

    fn skip_line_comment(&mut self) {
        while let Some(b) = self.peek_byte() {
            if b == b'\n' {
                break;
            }
            self.next_char();
        }
    }

    fn skip_block_comment(&mut self, start: Location) {
        self.next_char(); // consume '*'
        let mut depth: u32 = 1;
        let mut depth_reported = false;
        while depth > 0 {
            let Some(b) = self.peek_byte() else {
                self.error(LexErrorKind::UnclosedBlockComment, start);
                return;
            };
            if b == b'/' && self.bytes.get(self.pos + 1) == Some(&b'*') {
                self.next_char();
                self.next_char();
                depth += 1;
                if depth > MAX_COMMENT_DEPTH && !depth_reported {
                    self.error(LexErrorKind::CommentDepthExceeded, start);
                    depth_reported = true;
                }
            } else if b == b'*' && self.bytes.get(self.pos + 1) == Some(&b'/') {
                self.next_char();
                self.next_char();
                depth -= 1;
            } else {
                self.next_char();
            }
        }
    }

    fn lex_string(&mut self, start: Location) {
        let mut value = String::new();
        loop {
            let Some(c) = self.peek_char() else {
                if self.pos >= self.bytes.len() {
                    self.error(LexErrorKind::UnterminatedString, start);
                    break;
                }
                // Malformed byte inside the literal: report and skip it.
                self.next_char();
                continue;
            };
            match c {
                '"' => {
                    self.next_char();
                    break;
                }
                '\n' => {
                    self.error(LexErrorKind::UnterminatedString, start);
                    break;
                }
                '\\' => {
                    self.next_char();
                    match self.peek_char() {
                        Some('n') => {
                            self.next_char();
                            value.push('\n');
                        }
                        Some('t') => {
                            self.next_char();
                            value.push('\t');
                        }
                        Some('"') => {
                            self.next_char();
                            value.push('"');
                        }
                        Some('\\') => {
                            self.next_char();
                            value.push('\\');
                        }
                        Some(other) => {
                            // Unknown escape: keep both characters verbatim.
                            self.next_char();
                            value.push('\\');
                            value.push(other);
                        }
                        None => {
                            self.error(LexErrorKind::UnterminatedString, start);
                            break;
                        }
                    }
                }
                _ => {
                    self.next_char();
                    value.push(c);
                }
            }
        }
        self.tokens.push(Token::new(TokenKind::Str, value, start));
    }

    fn lex_color(&mut self, start: Location) {
        let mut digits = String::new();
        while let Some(c) = self.peek_char() {
            if c.is_ascii_hexdigit() {
                self.next_char();
                digits.push(c);
            } else {
                break;
            }
        }
        match digits.len() {
            3 | 6 | 8 => {
                let lexeme = format!("#{digits}");
                self.tokens.push(Token::new(TokenKind::Str, lexeme, start));
            }
            found => self.error(LexErrorKind::InvalidColorLiteral { found }, start),
        }
    }

    fn lex_number(&mut self, first: char, start: Location) {
        let mut text = String::new();
        text.push(first);
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                self.next_char();
                text.push(c);
            } else {
                break;
            }
        }
        // A '.' makes this a float only when a digit follows; otherwise the
        // dot is a separate token (property access).
        let is_float = self.peek_byte() == Some(b'.')
            && self
                .bytes
                .get(self.pos + 1)
                .is_some_and(|b| b.is_ascii_digit());
        if is_float {
            self.next_char();
            text.push('.');
            while let Some(c) = self.peek_char() {
                if c.is_ascii_digit() {
                    self.next_char();
                    text.push(c);
                } else {
                    break;
                }
            }
            let mut token = Token::new(TokenKind::Float, text.clone(), start);
            token.float_value = Some(text.parse().unwrap_or(0.0));
            self.tokens.push(token);
        } else {
            let mut token = Token::new(TokenKind::Integer, text.clone(), start);
            token.int_value = Some(text.parse().unwrap_or(0));
            self.tokens.push(token);
        }
    }

    fn lex_identifier(&mut self, first: char, start: Location) {
        let mut text = String::new();
        text.push(first);
        while let Some(c) = self.peek_char() {
            if is_identifier_continue(c) {
                self.next_char();
                text.push(c);
            } else {
                break;
            }
        }
        let kind = TokenKind::keyword(&text).unwrap_or(TokenKind::Identifier);
        self.tokens.push(Token::new(kind, text, start));
    }

    fn lex_operator(&mut self, c: char, start: Location) {
        let kind = match c {
            '=' => {
                if self.peek_byte() == Some(b'=') {
                    self.next_char();
                    TokenKind::Equal
                } else {
                    TokenKind::Assign
                }
            }
            '!' => {
                if self.peek_byte() == Some(b'=') {
                    self.next_char();
                    TokenKind::NotEqual
                } else {
                    self.error(LexErrorKind::UnexpectedCharacter('!'), start);
                    return;
                }
            }
            '<' => {
                if self.peek_byte() == Some(b'=') {
                    self.next_char();
                    TokenKind::LessEqual
                } else {
                    TokenKind::Less
                }
            }
            '>' => {
                if self.peek_byte() == Some(b'=') {
                    self.next_char();
                    TokenKind::GreaterEqual
                } else {
                    TokenKind::Greater
                }
            }
            '-' => {
                if self.peek_byte() == Some(b'>') {
                    self.next_char();
                    TokenKind::Arrow
                } else {
                    TokenKind::Minus
                }
            }
            '+' => TokenKind::Plus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '(' => TokenKind::LeftParen,
            ')' => TokenKind::RightParen,
            '{' => TokenKind::LeftBrace,
            '}' => TokenKind::RightBrace,
            '[' => TokenKind::LeftBracket,
            ']' => TokenKind::RightBracket,
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            ';' => TokenKind::Semicolon,
            '.' => TokenKind::Dot,
            other => {
                self.error(LexErrorKind::UnexpectedCharacter(other), start);
                return;
            }
        };
        let lexeme = match kind {
            TokenKind::Equal => "==".to_string(),
            TokenKind::NotEqual => "!=".to_string(),
            TokenKind::LessEqual => "<=".to_string(),
            TokenKind::GreaterEqual => ">=".to_string(),
            TokenKind::Arrow => "->".to_string(),
            _ => c.to_string(),
        };
        self.tokens.push(Token::new(kind, lexeme, start));
    }
}

fn is_identifier_start(c: char) -> bool {
    c == '_' || c.is_alphabetic()
}

fn is_identifier_continue(c: char) -> bool {
    c == '_' || c.is_alphanumeric() || is_combining_mark(c)
}

/// Combining-mark blocks accepted in identifier continuation position.
fn is_combining_mark(c: char) -> bool {
    matches!(
        c,
        '\u{0300}'..='\u{036f}'
            | '\u{1ab0}'..='\u{1aff}'
            | '\u{1dc0}'..='\u{1dff}'
            | '\u{20d0}'..='\u{20ff}'
            | '\u{fe20}'..='\u{fe2f}'
    )
}

/// Strict UTF-8 decoder. Returns the code point and its byte width, or the
/// number of bytes to skip past the malformed sequence. Rejects overlong
/// encodings, the surrogate range U+D800..=U+DFFF, and anything above
/// U+10FFFF.
fn decode_utf8(bytes: &[u8]) -> Result<(char, usize), usize> {
    let b0 = *bytes.first().ok_or(0usize)?;
    if b0 < 0x80 {
        return Ok((b0 as char, 1));
    }
    let (width, min) = match b0 {
        0xc2..=0xdf => (2, 0x80u32),
        0xe0..=0xef => (3, 0x800),
        0xf0..=0xf4 => (4, 0x10000),
        // 0xc0/0xc1 are always-overlong leads; 0xf5+ is out of range;
        // stray continuation bytes land here too.
        _ => return Err(1),
    };
    if bytes.len() < width {
        // Truncated sequence at end of input: skip whatever is left.
        return Err(bytes.len());
    }
    let mut cp = (b0 as u32) & (0x7f >> width);
    for (i, &b) in bytes[1..width].iter().enumerate() {
        if b & 0xc0 != 0x80 {
            // Skip the valid prefix only; the offender is re-examined.
            return Err(i + 1);
        }
        cp = (cp << 6) | (b as u32 & 0x3f);
    }
    if cp < min || cp > 0x10ffff || (0xd800..=0xdfff).contains(&cp) {
        return Err(width);
    }
    // The range checks above are exactly char's validity conditions.
    Ok((char::from_u32(cp).unwrap(), width))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn tokenizes_keywords() {
        assert_eq!(
            kinds("character scene show hide say choice"),
            vec![
                TokenKind::Character,
                TokenKind::Scene,
                TokenKind::Show,
                TokenKind::Hide,
                TokenKind::Say,
                TokenKind::Choice,
                TokenKind::EndOfFile,
            ]
        );
    }

    #[test]
    fn identifier_lexeme_round_trips() {
        for ident in ["Hero", "myVariable", "_private", "héros", "日本語", "e\u{0301}tat"] {
            let tokens = tokenize(ident).unwrap();
            assert_eq!(tokens.len(), 2, "{ident}");
            assert_eq!(tokens[0].kind, TokenKind::Identifier);
            assert_eq!(tokens[0].lexeme, ident);
        }
    }

    #[test]
    fn tokenizes_numbers() {
        let tokens = tokenize("0 42 12345 0.0 3.14").unwrap();
        assert_eq!(tokens[0].int_value, Some(0));
        assert_eq!(tokens[1].int_value, Some(42));
        assert_eq!(tokens[2].int_value, Some(12345));
        assert_eq!(tokens[3].kind, TokenKind::Float);
        assert_eq!(tokens[3].float_value, Some(0.0));
        assert_eq!(tokens[4].float_value, Some(3.14));
    }

    #[test]
    fn string_escapes() {
        let tokens = tokenize(r#""line1\nline2" "tab\there" "quote\"here" "back\\slash""#).unwrap();
        assert_eq!(tokens[0].lexeme, "line1\nline2");
        assert_eq!(tokens[1].lexeme, "tab\there");
        assert_eq!(tokens[2].lexeme, "quote\"here");
        assert_eq!(tokens[3].lexeme, "back\\slash");
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let (_, errors) = tokenize_bytes(b"say \"oops");
        assert!(errors
            .iter()
            .any(|e| e.kind == LexErrorKind::UnterminatedString));
    }

    #[test]
    fn operators_and_arrow() {
        assert_eq!(
            kinds("= + - * / % == != < <= > >= ->"),
            vec![
                TokenKind::Assign,
                TokenKind::Plus,
                TokenKind::Minus,
                TokenKind::Star,
                TokenKind::Slash,
                TokenKind::Percent,
                TokenKind::Equal,
                TokenKind::NotEqual,
                TokenKind::Less,
                TokenKind::LessEqual,
                TokenKind::Greater,
                TokenKind::GreaterEqual,
                TokenKind::Arrow,
                TokenKind::EndOfFile,
            ]
        );
    }

    #[test]
    fn color_literals_of_valid_lengths() {
        for (src, lexeme) in [("#fff", "#fff"), ("#A1b2C3", "#A1b2C3"), ("#a1b2c3d4", "#a1b2c3d4")]
        {
            let tokens = tokenize(src).unwrap();
            assert_eq!(tokens[0].kind, TokenKind::Str);
            assert_eq!(tokens[0].lexeme, lexeme);
        }
    }

    #[test]
    fn color_literals_of_invalid_lengths() {
        for (src, found) in [("#abcd", 4), ("#abcde", 5), ("#abcdefa", 7), ("#abcdefabc", 9)] {
            let (_, errors) = tokenize_bytes(src.as_bytes());
            assert_eq!(
                errors[0].kind,
                LexErrorKind::InvalidColorLiteral { found },
                "{src}"
            );
        }
    }

    #[test]
    fn nested_block_comments_within_limit() {
        let src = format!("{}{}say \"ok\"", "/*".repeat(128), "*/".repeat(128));
        let tokens = tokenize(&src).unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Say);
    }

    #[test]
    fn comment_depth_129_is_rejected() {
        let src = format!("{}{}", "/*".repeat(129), "*/".repeat(129));
        let (_, errors) = tokenize_bytes(src.as_bytes());
        assert!(errors
            .iter()
            .any(|e| e.kind == LexErrorKind::CommentDepthExceeded));
    }

    #[test]
    fn unclosed_block_comment() {
        let (_, errors) = tokenize_bytes(b"/* /* */");
        assert_eq!(errors[0].kind, LexErrorKind::UnclosedBlockComment);
    }

    #[test]
    fn invalid_utf8_is_skipped_not_fatal() {
        // 0xC0 0xAF is the classic overlong encoding of '/'.
        let (tokens, errors) = tokenize_bytes(b"say \xc0\xaf wait");
        assert!(errors.iter().any(|e| e.kind == LexErrorKind::InvalidUtf8));
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind).collect();
        assert!(kinds.contains(&TokenKind::Say));
        assert!(kinds.contains(&TokenKind::Wait));
    }

    #[test]
    fn surrogate_and_out_of_range_sequences_rejected() {
        // 0xED 0xA0 0x80 encodes U+D800; 0xF4 0x90 0x80 0x80 encodes U+110000.
        for bad in [&b"\xed\xa0\x80"[..], &b"\xf4\x90\x80\x80"[..]] {
            let (_, errors) = tokenize_bytes(bad);
            assert!(errors.iter().any(|e| e.kind == LexErrorKind::InvalidUtf8));
        }
    }

    #[test]
    fn truncated_sequence_at_eof_is_skipped() {
        let (tokens, errors) = tokenize_bytes(b"goto \xe6\x97");
        assert!(errors.iter().any(|e| e.kind == LexErrorKind::InvalidUtf8));
        assert_eq!(tokens[0].kind, TokenKind::Goto);
        assert_eq!(tokens.last().unwrap().kind, TokenKind::EndOfFile);
    }

    #[test]
    fn locations_are_one_based_lines_and_columns() {
        let tokens = tokenize("say\n  \"hi\"").unwrap();
        assert_eq!(tokens[0].location, Location::new(1, 1));
        assert_eq!(tokens[1].location, Location::new(2, 3));
    }
}
