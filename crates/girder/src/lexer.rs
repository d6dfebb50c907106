//! Longest-Match Lexer
//!
//! Produces the token stream the parser consumes: punctuation via
//! longest-match over the symbol map, identifiers checked against the word
//! symbols and keywords, double-quoted strings with backslash escapes,
//! integer and number literals, `//` line comments, and `/* */` block
//! comments.

use crate::error::{SourceOrigin, SyntaxError};
use crate::token::{PUNCTUATION, Token, TokenKind, word_symbol};

pub struct Lexer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    origin: SourceOrigin,
    index: usize,
    row: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str, origin: SourceOrigin) -> Self {
        Lexer {
            source,
            bytes: source.as_bytes(),
            origin,
            index: 0,
            row: 1,
            column: 1,
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, SyntaxError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia()?;
            if self.at_end() {
                break;
            }
            tokens.push(self.next_token()?);
        }
        Ok(tokens)
    }

    fn at_end(&self) -> bool {
        self.index >= self.bytes.len()
    }

    fn peek(&self) -> u8 {
        self.bytes[self.index]
    }

    fn rest(&self) -> &'a str {
        &self.source[self.index..]
    }

    fn advance(&mut self, len: usize) {
        for _ in 0..len {
            if self.index >= self.bytes.len() {
                break;
            }
            if self.bytes[self.index] == b'\n' {
                self.row += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
            self.index += 1;
        }
    }

    fn skip_trivia(&mut self) -> Result<(), SyntaxError> {
        loop {
            if self.at_end() {
                return Ok(());
            }
            let byte = self.peek();
            if byte.is_ascii_whitespace() {
                self.advance(1);
            } else if self.rest().starts_with("//") {
                while !self.at_end() && self.peek() != b'\n' {
                    self.advance(1);
                }
            } else if self.rest().starts_with("/*") {
                let start = self.position();
                self.advance(2);
                loop {
                    if self.at_end() {
                        return Err(self.error_at(start, "unterminated block comment"));
                    }
                    if self.rest().starts_with("*/") {
                        self.advance(2);
                        break;
                    }
                    self.advance(1);
                }
            } else {
                return Ok(());
            }
        }
    }

    fn position(&self) -> (usize, usize, usize) {
        (self.index, self.row, self.column)
    }

    fn next_token(&mut self) -> Result<Token, SyntaxError> {
        let (index, row, column) = self.position();
        let byte = self.peek();

        let kind = if byte == b'"' {
            self.string_literal()?
        } else if byte.is_ascii_digit() {
            self.numeric_literal()?
        } else if is_identifier_start(byte) {
            self.identifier_or_word()
        } else {
            self.punctuation()?
        };

        Ok(Token {
            kind,
            index,
            row,
            column,
        })
    }

    fn string_literal(&mut self) -> Result<TokenKind, SyntaxError> {
        let start = self.position();
        self.advance(1);
        let mut text = String::new();
        loop {
            if self.at_end() {
                return Err(self.error_at(start, "unterminated string literal"));
            }
            match self.peek() {
                b'"' => {
                    self.advance(1);
                    return Ok(TokenKind::StringLiteral(text));
                }
                b'\\' => {
                    self.advance(1);
                    if self.at_end() {
                        return Err(self.error_at(start, "unterminated string escape"));
                    }
                    let escaped = self.peek();
                    text.push(match escaped {
                        b'n' => '\n',
                        b't' => '\t',
                        b'r' => '\r',
                        b'0' => '\0',
                        b'"' => '"',
                        b'\\' => '\\',
                        other => {
                            return Err(self.error_here(format!(
                                "unknown string escape '\\{}'",
                                other as char
                            )));
                        }
                    });
                    self.advance(1);
                }
                _ => {
                    let ch = self.rest().chars().next().expect("in-bounds char");
                    text.push(ch);
                    self.advance(ch.len_utf8());
                }
            }
        }
    }

    fn numeric_literal(&mut self) -> Result<TokenKind, SyntaxError> {
        let start_index = self.index;
        while !self.at_end() && self.peek().is_ascii_digit() {
            self.advance(1);
        }
        // A dot makes it a number literal, but only when digits follow
        // (so `5.Method()` still lexes as selection).
        let mut is_number = false;
        if !self.at_end()
            && self.peek() == b'.'
            && self
                .bytes
                .get(self.index + 1)
                .is_some_and(u8::is_ascii_digit)
        {
            is_number = true;
            self.advance(1);
            while !self.at_end() && self.peek().is_ascii_digit() {
                self.advance(1);
            }
        }
        let text = &self.source[start_index..self.index];
        if is_number {
            text.parse::<f64>()
                .map(TokenKind::Number)
                .map_err(|_| self.error_here(format!("invalid number literal '{}'", text)))
        } else {
            text.parse::<i64>()
                .map(TokenKind::Integer)
                .map_err(|_| self.error_here(format!("integer literal '{}' out of range", text)))
        }
    }

    fn identifier_or_word(&mut self) -> TokenKind {
        let start_index = self.index;
        while !self.at_end() && is_identifier_continue(self.peek()) {
            self.advance(1);
        }
        let text = &self.source[start_index..self.index];
        // Word symbols and keywords carry no interrupter bit: they only
        // match complete identifiers.
        word_symbol(text).unwrap_or_else(|| TokenKind::Identifier(text.to_string()))
    }

    fn punctuation(&mut self) -> Result<TokenKind, SyntaxError> {
        let rest = self.rest();
        for &(symbol, separator) in PUNCTUATION {
            if rest.starts_with(symbol) {
                self.advance(symbol.len());
                return Ok(TokenKind::Separator(separator));
            }
        }
        let ch = rest.chars().next().expect("non-empty rest");
        Err(self.error_here(format!("unexpected character '{}'", ch)))
    }

    fn error_here(&self, message: impl Into<String>) -> SyntaxError {
        self.error_at(self.position(), message)
    }

    fn error_at(
        &self,
        (index, row, column): (usize, usize, usize),
        message: impl Into<String>,
    ) -> SyntaxError {
        SyntaxError {
            origin: self.origin.clone(),
            index,
            row,
            column,
            line: source_line(self.source, row),
            message: message.into(),
        }
    }
}

fn is_identifier_start(byte: u8) -> bool {
    byte.is_ascii_alphabetic() || byte == b'_'
}

fn is_identifier_continue(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

/// The 1-indexed source line, for syntax error rendering.
pub(crate) fn source_line(source: &str, row: usize) -> String {
    source
        .lines()
        .nth(row.saturating_sub(1))
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{Keyword, Separator};

    fn lex(source: &str) -> Vec<TokenKind> {
        Lexer::new(source, SourceOrigin::Immediate)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_longest_match_operators() {
        assert_eq!(
            lex("a >>= b"),
            vec![
                TokenKind::Identifier("a".to_string()),
                TokenKind::Separator(Separator::ShiftRightAssignment),
                TokenKind::Identifier("b".to_string()),
            ]
        );
        // `>|` must win over `>` followed by `|`.
        assert_eq!(
            lex("a >| b")[1],
            TokenKind::Separator(Separator::BitwiseXor)
        );
        assert_eq!(lex("a -> b")[1], TokenKind::Separator(Separator::Direct));
    }

    #[test]
    fn test_word_operators_do_not_interrupt_identifiers() {
        assert_eq!(
            lex("android"),
            vec![TokenKind::Identifier("android".to_string())]
        );
        assert_eq!(
            lex("a and b")[1],
            TokenKind::Separator(Separator::LogicalAnd)
        );
        assert_eq!(lex("newt"), vec![TokenKind::Identifier("newt".to_string())]);
        assert_eq!(lex("new t")[0], TokenKind::Separator(Separator::NewObject));
    }

    #[test]
    fn test_keywords_and_literals() {
        assert_eq!(
            lex("local x = true;"),
            vec![
                TokenKind::Keyword(Keyword::Local),
                TokenKind::Identifier("x".to_string()),
                TokenKind::Separator(Separator::Assignment),
                TokenKind::Keyword(Keyword::LiteralTrue),
                TokenKind::Separator(Separator::EndStatement),
            ]
        );
    }

    #[test]
    fn test_numeric_literals() {
        assert_eq!(lex("42"), vec![TokenKind::Integer(42)]);
        assert_eq!(lex("3.25"), vec![TokenKind::Number(3.25)]);
        // Dot with no digit after stays selection.
        assert_eq!(
            lex("5.Size"),
            vec![
                TokenKind::Integer(5),
                TokenKind::Separator(Separator::Dot),
                TokenKind::Identifier("Size".to_string()),
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            lex(r#""a\n\"b\"""#),
            vec![TokenKind::StringLiteral("a\n\"b\"".to_string())]
        );
    }

    #[test]
    fn test_comments() {
        assert_eq!(
            lex("1 // comment\n2 /* block\n comment */ 3"),
            vec![
                TokenKind::Integer(1),
                TokenKind::Integer(2),
                TokenKind::Integer(3),
            ]
        );
    }

    #[test]
    fn test_unterminated_string_errors() {
        let result = Lexer::new("\"abc", SourceOrigin::Immediate).tokenize();
        let error = result.unwrap_err();
        assert!(error.message.contains("unterminated string"));
        assert_eq!(error.row, 1);
    }

    #[test]
    fn test_positions() {
        let tokens = Lexer::new("a\n  b", SourceOrigin::Immediate)
            .tokenize()
            .unwrap();
        assert_eq!((tokens[0].row, tokens[0].column), (1, 1));
        assert_eq!((tokens[1].row, tokens[1].column), (2, 3));
    }
}
