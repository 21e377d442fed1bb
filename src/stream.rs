use crate::error::{Error, Result};
use crate::lexer::{Token, TokenKind};
use crate::source::Source;

/// Cursor over the tokens of one template. The last token is always `Eof`.
#[derive(Debug, Clone)]
pub struct TokenStream {
    tokens: Vec<Token>,
    current: usize,
    source: Source,
}

impl TokenStream {
    pub fn new(mut tokens: Vec<Token>, source: Source) -> Self {
        if tokens.last().map_or(true, |t| t.kind != TokenKind::Eof) {
            let (line, column) = tokens.last().map_or((1, 1), |t| (t.line, t.column));
            tokens.push(Token {
                kind: TokenKind::Eof,
                value: String::new(),
                line,
                column,
            });
        }
        Self {
            tokens,
            current: 0,
            source,
        }
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn current(&self) -> &Token {
        &self.tokens[self.current]
    }

    /// Consumes the current token and returns it. `Eof` is never consumed.
    pub fn next(&mut self) -> Token {
        let token = self.tokens[self.current].clone();
        if self.current + 1 < self.tokens.len() {
            self.current += 1;
        }
        token
    }

    /// Looks `n` tokens ahead of the current one, clamped to `Eof`.
    pub fn look(&self, n: usize) -> &Token {
        let index = (self.current + n).min(self.tokens.len() - 1);
        &self.tokens[index]
    }

    pub fn test(&self, kind: TokenKind, value: Option<&str>) -> bool {
        self.current().test(kind, value)
    }

    pub fn test_any(&self, kind: TokenKind, values: &[&str]) -> bool {
        values.iter().any(|v| self.current().is(kind, v))
    }

    pub fn next_if(&mut self, kind: TokenKind, value: Option<&str>) -> Option<Token> {
        if self.test(kind, value) {
            Some(self.next())
        } else {
            None
        }
    }

    pub fn is_eof(&self) -> bool {
        self.current().kind == TokenKind::Eof
    }

    /// Consumes a token of `kind` (and `value`, if given) or fails with
    /// `[message. ]Unexpected token ... ("kind" expected ...).`
    pub fn expect(&mut self, kind: TokenKind, value: Option<&str>, message: Option<&str>) -> Result<Token> {
        if self.test(kind, value) {
            return Ok(self.next());
        }
        let token = self.current();
        let mut text = String::new();
        if let Some(message) = message {
            text.push_str(message);
            text.push_str(". ");
        }
        text.push_str(&format!("Unexpected token \"{}\"", token.kind));
        if !token.value.is_empty() {
            text.push_str(&format!(" of value \"{}\"", token.value));
        }
        text.push_str(&format!(" (\"{kind}\" expected"));
        if let Some(value) = value {
            text.push_str(&format!(" with value \"{value}\""));
        }
        text.push_str(").");
        Err(Error::syntax(text, token.line, token.column, &self.source))
    }
}
