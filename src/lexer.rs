use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::source::Source;
use crate::stream::TokenStream;

static VERBATIM_START: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\{%[-~]?\s*verbatim\s*(?:-%\}\s*|~%\}[ \t\x00\x0B]*|%\}\n?)").expect("valid regex")
});
static VERBATIM_END: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{%([-~]?)\s*endverbatim\s*(?:-%\}\s*|~%\}[ \t\x00\x0B]*|%\}\n?)").expect("valid regex")
});
static BLOCK_END: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:-%\}\s*|~%\}[ \t\x00\x0B]*|%\}\n?)").expect("valid regex")
});
static VAR_END: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:-\}\}\s*|~\}\}[ \t\x00\x0B]*|\}\})").expect("valid regex")
});
static COMMENT_END: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:-#\}\s*|~#\}[ \t\x00\x0B]*|#\})\n?").expect("valid regex")
});
static INTERPOLATION_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*\}").expect("valid regex"));
static NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z_\x7f-\x{ffff}][a-zA-Z0-9_\x7f-\x{ffff}]*").expect("valid regex")
});
static NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]+(?:\.[0-9]+)?(?:[eE][+\-][0-9]+)?").expect("valid regex"));

const PUNCTUATION: &str = "()[]{}?:.,|";
const HORIZONTAL_WHITESPACE: &[char] = &[' ', '\t', '\0', '\x0B'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Text,
    BlockStart,
    BlockEnd,
    VarStart,
    VarEnd,
    Name,
    Number,
    String,
    Operator,
    Punctuation,
    InterpolationStart,
    InterpolationEnd,
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TokenKind::Text => "text",
            TokenKind::BlockStart => "begin of statement block",
            TokenKind::BlockEnd => "end of statement block",
            TokenKind::VarStart => "begin of print statement",
            TokenKind::VarEnd => "end of print statement",
            TokenKind::Name => "name",
            TokenKind::Number => "number",
            TokenKind::String => "string",
            TokenKind::Operator => "operator",
            TokenKind::Punctuation => "punctuation",
            TokenKind::InterpolationStart => "begin of string interpolation",
            TokenKind::InterpolationEnd => "end of string interpolation",
            TokenKind::Eof => "end of template",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub value: String,
    pub line: usize,
    pub column: usize,
}

impl Token {
    pub fn test(&self, kind: TokenKind, value: Option<&str>) -> bool {
        self.kind == kind && value.map_or(true, |v| self.value == v)
    }

    pub fn is(&self, kind: TokenKind, value: &str) -> bool {
        self.kind == kind && self.value == value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Data,
    Block,
    Var,
    String,
    Interpolation,
}

/// Turns template text into tokens. Tag semantics are left to the parser.
pub fn tokenize(source: &Source, registry: &Registry) -> Result<TokenStream> {
    let tokens = Tokenizer::new(source, registry).run()?;
    tracing::trace!(template = source.name(), tokens = tokens.len(), "tokenized template");
    Ok(TokenStream::new(tokens, source.clone()))
}

pub struct Tokenizer<'a> {
    source: &'a Source,
    input: String,
    cursor: usize,
    line: usize,
    column: usize,
    tokens: Vec<Token>,
    state: State,
    states: Vec<State>,
    // (opening delimiter, line, column)
    brackets: Vec<(String, usize, usize)>,
    operators: Vec<String>,
    tag_start: (usize, usize),
}

impl<'a> Tokenizer<'a> {
    pub fn new(source: &'a Source, registry: &Registry) -> Self {
        Self {
            source,
            input: source.code().replace("\r\n", "\n").replace('\r', "\n"),
            cursor: 0,
            line: 1,
            column: 1,
            tokens: Vec::new(),
            state: State::Data,
            states: Vec::new(),
            brackets: Vec::new(),
            operators: registry.operator_symbols(),
            tag_start: (1, 1),
        }
    }

    pub fn run(mut self) -> Result<Vec<Token>> {
        while self.cursor < self.input.len() {
            match self.state {
                State::Data => self.lex_data()?,
                State::Block => self.lex_block()?,
                State::Var => self.lex_var()?,
                State::String => self.lex_string()?,
                State::Interpolation => self.lex_interpolation()?,
            }
        }

        if let Some((expect, line, column)) = self.brackets.pop() {
            return Err(self.error(format!("Unclosed \"{expect}\"."), line, column));
        }
        match self.state {
            State::Block => {
                let (line, column) = self.tag_start;
                return Err(self.error("Unclosed \"block\".", line, column));
            }
            State::Var => {
                let (line, column) = self.tag_start;
                return Err(self.error("Unclosed \"variable\".", line, column));
            }
            _ => {}
        }

        let (line, column) = (self.line, self.column);
        self.tokens.push(Token {
            kind: TokenKind::Eof,
            value: String::new(),
            line,
            column,
        });
        Ok(self.tokens)
    }

    fn remaining(&self) -> &str {
        &self.input[self.cursor..]
    }

    fn advance(&mut self, n: usize) {
        let end = (self.cursor + n).min(self.input.len());
        for c in self.input[self.cursor..end].chars() {
            if c == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        self.cursor = end;
    }

    fn error(&self, message: impl Into<String>, line: usize, column: usize) -> Error {
        Error::syntax(message, line, column, self.source)
    }

    fn push(&mut self, kind: TokenKind, value: impl Into<String>, line: usize, column: usize) {
        let value = value.into();
        if kind == TokenKind::Text && value.is_empty() {
            return;
        }
        self.tokens.push(Token {
            kind,
            value,
            line,
            column,
        });
    }

    fn push_state(&mut self, state: State) {
        self.states.push(self.state);
        self.state = state;
    }

    fn pop_state(&mut self) {
        self.state = self.states.pop().unwrap_or(State::Data);
    }

    fn lex_data(&mut self) -> Result<()> {
        let rest = self.remaining();
        let next_tag = ["{{", "{%", "{#"].iter().filter_map(|d| rest.find(d)).min();

        let Some(offset) = next_tag else {
            let text = rest.to_string();
            let (line, column) = (self.line, self.column);
            self.push(TokenKind::Text, text, line, column);
            self.advance(self.input.len() - self.cursor);
            return Ok(());
        };

        let delimiter = rest[offset..offset + 2].to_string();
        let modifier = rest[offset + 2..].chars().next().filter(|c| *c == '-' || *c == '~');
        let mut text = &rest[..offset];
        match modifier {
            Some('-') => text = text.trim_end(),
            Some('~') => text = text.trim_end_matches(HORIZONTAL_WHITESPACE),
            _ => {}
        }
        let text = text.to_string();
        let (line, column) = (self.line, self.column);
        self.push(TokenKind::Text, text, line, column);
        self.advance(offset);

        let (line, column) = (self.line, self.column);
        self.tag_start = (line, column);
        let delimiter_len = 2 + modifier.map_or(0, |_| 1);
        match delimiter.as_str() {
            "{#" => self.lex_comment(),
            "{%" => {
                if let Some(found) = VERBATIM_START.find(self.remaining()) {
                    let len = found.end();
                    self.advance(len);
                    return self.lex_verbatim(line, column);
                }
                self.push(TokenKind::BlockStart, "", line, column);
                self.advance(delimiter_len);
                self.push_state(State::Block);
                Ok(())
            }
            _ => {
                self.push(TokenKind::VarStart, "", line, column);
                self.advance(delimiter_len);
                self.push_state(State::Var);
                Ok(())
            }
        }
    }

    fn lex_comment(&mut self) -> Result<()> {
        let (line, column) = self.tag_start;
        let Some(end) = COMMENT_END.find(&self.input[self.cursor + 2..]) else {
            return Err(self.error("Unclosed comment.", line, column));
        };
        let len = 2 + end.end();
        self.advance(len);
        Ok(())
    }

    fn lex_verbatim(&mut self, line: usize, column: usize) -> Result<()> {
        let rest = self.remaining();
        let Some(captures) = VERBATIM_END.captures(rest) else {
            return Err(self.error(
                "Unexpected end of file: Unclosed \"verbatim\" block.",
                line,
                column,
            ));
        };
        let Some(whole) = captures.get(0) else {
            return Ok(());
        };
        let mut text = &rest[..whole.start()];
        match captures.get(1).map(|m| m.as_str()) {
            Some("-") => text = text.trim_end(),
            Some("~") => text = text.trim_end_matches(HORIZONTAL_WHITESPACE),
            _ => {}
        }
        let text = text.to_string();
        let end = whole.end();
        let (text_line, text_column) = (self.line, self.column);
        self.push(TokenKind::Text, text, text_line, text_column);
        self.advance(end);
        Ok(())
    }

    fn lex_block(&mut self) -> Result<()> {
        if self.brackets.is_empty() {
            if let Some(end) = BLOCK_END.find(self.remaining()) {
                let len = end.end();
                let (line, column) = self.position_after_whitespace();
                self.push(TokenKind::BlockEnd, "", line, column);
                self.advance(len);
                self.pop_state();
                return Ok(());
            }
        }
        self.lex_expression()
    }

    fn lex_var(&mut self) -> Result<()> {
        if self.brackets.is_empty() {
            if let Some(end) = VAR_END.find(self.remaining()) {
                let len = end.end();
                let (line, column) = self.position_after_whitespace();
                self.push(TokenKind::VarEnd, "", line, column);
                self.advance(len);
                self.pop_state();
                return Ok(());
            }
        }
        self.lex_expression()
    }

    fn position_after_whitespace(&self) -> (usize, usize) {
        let (mut line, mut column) = (self.line, self.column);
        for c in self.remaining().chars().take_while(|c| c.is_whitespace()) {
            if c == '\n' {
                line += 1;
                column = 1;
            } else {
                column += 1;
            }
        }
        (line, column)
    }

    fn lex_expression(&mut self) -> Result<()> {
        let skipped = self.remaining().len() - self.remaining().trim_start().len();
        self.advance(skipped);
        if self.cursor >= self.input.len() {
            return Ok(());
        }

        let (line, column) = (self.line, self.column);

        if let Some((operator, len)) = self.match_operator() {
            self.push(TokenKind::Operator, operator, line, column);
            self.advance(len);
            return Ok(());
        }

        if let Some(found) = NAME.find(self.remaining()) {
            let name = found.as_str().to_string();
            self.push(TokenKind::Name, name.as_str(), line, column);
            self.advance(name.len());
            return Ok(());
        }

        if let Some(found) = NUMBER.find(self.remaining()) {
            let number = found.as_str().to_string();
            self.push(TokenKind::Number, number.as_str(), line, column);
            self.advance(number.len());
            return Ok(());
        }

        let Some(first) = self.remaining().chars().next() else {
            return Ok(());
        };

        if PUNCTUATION.contains(first) {
            match first {
                '(' | '[' | '{' => self.brackets.push((first.to_string(), line, column)),
                ')' | ']' | '}' => {
                    let Some((expect, open_line, open_column)) = self.brackets.pop() else {
                        return Err(self.error(format!("Unexpected \"{first}\"."), line, column));
                    };
                    let matching = match expect.as_str() {
                        "(" => ')',
                        "[" => ']',
                        "{" => '}',
                        _ => '\0',
                    };
                    if matching != first {
                        return Err(self.error(format!("Unclosed \"{expect}\"."), open_line, open_column));
                    }
                }
                _ => {}
            }
            self.push(TokenKind::Punctuation, first.to_string(), line, column);
            self.advance(1);
            return Ok(());
        }

        if first == '\'' || first == '"' {
            return self.lex_quoted(first, line, column);
        }

        Err(self.error(format!("Unexpected character \"{first}\"."), line, column))
    }

    /// Matches the longest operator at the cursor. Word operators need a word
    /// boundary and accept any run of whitespace between their words.
    fn match_operator(&self) -> Option<(String, usize)> {
        let rest = self.remaining();
        let after_dot = self
            .tokens
            .last()
            .is_some_and(|t| t.kind == TokenKind::Punctuation && (t.value == "." || t.value == "|"));

        for operator in &self.operators {
            let is_word = operator.starts_with(|c: char| c.is_ascii_alphabetic());
            if !is_word {
                if rest.starts_with(operator.as_str()) {
                    return Some((operator.clone(), operator.len()));
                }
                continue;
            }
            if after_dot {
                continue;
            }

            let mut len = 0;
            let mut matched = true;
            for (i, word) in operator.split(' ').enumerate() {
                if i > 0 {
                    let gap = rest[len..].len() - rest[len..].trim_start().len();
                    if gap == 0 {
                        matched = false;
                        break;
                    }
                    len += gap;
                }
                if !rest[len..].starts_with(word) {
                    matched = false;
                    break;
                }
                len += word.len();
            }
            let boundary = rest[len.min(rest.len())..]
                .chars()
                .next()
                .map_or(true, |c| !(c.is_alphanumeric() || c == '_'));
            if matched && boundary {
                return Some((operator.clone(), len));
            }
        }
        None
    }

    fn lex_quoted(&mut self, quote: char, line: usize, column: usize) -> Result<()> {
        let rest = self.remaining();
        let mut end = None;
        let mut interpolated = false;
        let mut chars = rest.char_indices().skip(1).peekable();
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => {
                    chars.next();
                }
                '#' if quote == '"' && chars.peek().is_some_and(|(_, n)| *n == '{') => {
                    interpolated = true;
                    break;
                }
                c if c == quote => {
                    end = Some(i);
                    break;
                }
                _ => {}
            }
        }

        if interpolated {
            self.brackets.push(("\"".to_string(), line, column));
            self.advance(1);
            self.push_state(State::String);
            return Ok(());
        }

        let Some(end) = end else {
            return Err(self.error(format!("Unclosed \"{quote}\"."), line, column));
        };
        let value = unescape(&rest[1..end]);
        self.push(TokenKind::String, value, line, column);
        self.advance(end + 1);
        Ok(())
    }

    fn lex_string(&mut self) -> Result<()> {
        let (line, column) = (self.line, self.column);
        let rest = self.remaining();

        if rest.starts_with("#{") {
            self.brackets.push(("#{".to_string(), line, column));
            self.push(TokenKind::InterpolationStart, "", line, column);
            self.advance(2);
            self.push_state(State::Interpolation);
            return Ok(());
        }

        if rest.starts_with('"') {
            self.brackets.pop();
            self.advance(1);
            self.pop_state();
            return Ok(());
        }

        let mut end = rest.len();
        let mut chars = rest.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => {
                    chars.next();
                }
                '"' => {
                    end = i;
                    break;
                }
                '#' if chars.peek().is_some_and(|(_, n)| *n == '{') => {
                    end = i;
                    break;
                }
                _ => {}
            }
        }
        let value = unescape(&rest[..end]);
        self.push(TokenKind::String, value, line, column);
        self.advance(end);
        Ok(())
    }

    fn lex_interpolation(&mut self) -> Result<()> {
        let closes = self.brackets.last().is_some_and(|(b, _, _)| b == "#{");
        if closes {
            if let Some(end) = INTERPOLATION_END.find(self.remaining()) {
                let len = end.end();
                let (line, column) = self.position_after_whitespace();
                self.brackets.pop();
                self.push(TokenKind::InterpolationEnd, "", line, column);
                self.advance(len);
                self.pop_state();
                return Ok(());
            }
        }
        self.lex_expression()
    }
}

/// Resolves backslash escapes the way C-style string literals do; an unknown
/// escape keeps only the escaped character.
fn unescape(raw: &str) -> String {
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
            Some('v') => out.push('\x0B'),
            Some('f') => out.push('\x0C'),
            Some('e') => out.push('\x1B'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(code: &str) -> Vec<Token> {
        Tokenizer::new(&Source::new(code, "test", ""), &Registry::default())
            .run()
            .expect("lexes")
    }

    fn kinds_and_values(code: &str) -> Vec<(TokenKind, String)> {
        lex(code).into_iter().map(|t| (t.kind, t.value)).collect()
    }

    fn lex_err(code: &str) -> Error {
        Tokenizer::new(&Source::new(code, "test", ""), &Registry::default())
            .run()
            .expect_err("should fail")
    }

    #[test]
    fn text_and_print() {
        use TokenKind::*;
        assert_eq!(
            kinds_and_values("Hi {{ name|upper }}!"),
            vec![
                (Text, "Hi ".into()),
                (VarStart, "".into()),
                (Name, "name".into()),
                (Punctuation, "|".into()),
                (Name, "upper".into()),
                (VarEnd, "".into()),
                (Text, "!".into()),
                (Eof, "".into()),
            ]
        );
    }

    #[test]
    fn tracks_lines_and_columns() {
        let tokens = lex("a\n  {{ x }}\n{% if y %}");
        let x = tokens.iter().find(|t| t.value == "x").unwrap();
        assert_eq!((x.line, x.column), (2, 6));
        let start = tokens.iter().find(|t| t.kind == TokenKind::BlockStart).unwrap();
        assert_eq!((start.line, start.column), (3, 1));
    }

    #[test]
    fn whitespace_control() {
        let tokens = kinds_and_values("a  \n {{- x -}}  \n b");
        assert_eq!(tokens[0], (TokenKind::Text, "a".into()));
        assert_eq!(tokens[4], (TokenKind::Text, "b".into()));

        let tokens = kinds_and_values("a \n {{~ x ~}} \n b");
        assert_eq!(tokens[0], (TokenKind::Text, "a \n".into()));
        assert_eq!(tokens[4], (TokenKind::Text, "\n b".into()));
    }

    #[test]
    fn block_end_eats_one_newline() {
        let tokens = kinds_and_values("{% if x %}\n\nyes");
        assert_eq!(tokens[4], (TokenKind::Text, "\nyes".into()));
    }

    #[test]
    fn comments_are_dropped() {
        let tokens = kinds_and_values("a{# {{ ignored }} #}b");
        assert_eq!(tokens, vec![
            (TokenKind::Text, "a".into()),
            (TokenKind::Text, "b".into()),
            (TokenKind::Eof, "".into()),
        ]);
    }

    #[test]
    fn verbatim_is_a_single_text_token() {
        let tokens = kinds_and_values("{% verbatim %}{{ raw }}{% if %}{% endverbatim %}!");
        assert_eq!(tokens[0], (TokenKind::Text, "{{ raw }}{% if %}".into()));
        assert_eq!(tokens[1], (TokenKind::Text, "!".into()));
    }

    #[test]
    fn word_operators_need_boundaries() {
        let tokens = kinds_and_values("{{ notation not in inx }}");
        assert_eq!(tokens[1], (TokenKind::Name, "notation".into()));
        assert_eq!(tokens[2], (TokenKind::Operator, "not in".into()));
        assert_eq!(tokens[3], (TokenKind::Name, "inx".into()));
    }

    #[test]
    fn multi_word_operator_with_extra_whitespace() {
        let tokens = kinds_and_values("{{ a starts   with b }}");
        assert_eq!(tokens[2], (TokenKind::Operator, "starts with".into()));
    }

    #[test]
    fn numbers_and_ranges() {
        let tokens = kinds_and_values("{{ 1..3 }}{{ 2.5e+3 }}");
        assert_eq!(tokens[1], (TokenKind::Number, "1".into()));
        assert_eq!(tokens[2], (TokenKind::Operator, "..".into()));
        assert_eq!(tokens[3], (TokenKind::Number, "3".into()));
        assert_eq!(tokens[6], (TokenKind::Number, "2.5e+3".into()));
    }

    #[test]
    fn string_escapes() {
        let tokens = kinds_and_values(r#"{{ 'it\'s\n' ~ "a\"b" }}"#);
        assert_eq!(tokens[1], (TokenKind::String, "it's\n".into()));
        assert_eq!(tokens[3], (TokenKind::String, "a\"b".into()));
    }

    #[test]
    fn string_interpolation() {
        use TokenKind::*;
        assert_eq!(
            kinds_and_values(r#"{{ "a #{ b ~ "c" } d" }}"#),
            vec![
                (VarStart, "".into()),
                (String, "a ".into()),
                (InterpolationStart, "".into()),
                (Name, "b".into()),
                (Operator, "~".into()),
                (String, "c".into()),
                (InterpolationEnd, "".into()),
                (String, " d".into()),
                (VarEnd, "".into()),
                (Eof, "".into()),
            ]
        );
    }

    #[test]
    fn hash_inside_interpolation_balances_braces() {
        let tokens = kinds_and_values(r##"{{ "#{ {a: 1}.a }" }}"##);
        assert!(tokens.iter().any(|t| t.0 == TokenKind::InterpolationEnd));
    }

    #[test]
    fn unterminated_constructs() {
        assert_eq!(lex_err("{{ 'abc }}").raw_message(), "Unclosed \"'\".");
        assert_eq!(lex_err("{{ \"a #{ b }").raw_message(), "Unclosed \"\"\".");
        assert_eq!(lex_err("{{ \"a #{ b").raw_message(), "Unclosed \"#{\".");
        assert_eq!(lex_err("{{ foo").raw_message(), "Unclosed \"variable\".");
        assert_eq!(lex_err("x\n{% if").raw_message(), "Unclosed \"block\".");
        assert_eq!(lex_err("{# nope").raw_message(), "Unclosed comment.");
        assert_eq!(lex_err("{{ (a }}").raw_message(), "Unclosed \"(\".");
        assert_eq!(lex_err("{{ a) }}").raw_message(), "Unexpected \")\".");
        assert_eq!(
            lex_err("{% verbatim %}x").raw_message(),
            "Unexpected end of file: Unclosed \"verbatim\" block."
        );
    }

    #[test]
    fn unexpected_character_reports_position() {
        let err = lex_err("\n{{ a @ b }}");
        assert_eq!(err.raw_message(), "Unexpected character \"@\".");
        assert_eq!(err.line(), Some(2));
        assert_eq!(err.message(), "Unexpected character \"@\" in \"test\" at line 2.");
    }

    #[test]
    fn crlf_is_normalized() {
        let tokens = lex("a\r\n{{ b }}");
        assert_eq!(tokens[0].value, "a\n");
        assert_eq!(tokens[2].line, 2);
    }
}
