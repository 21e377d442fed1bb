//! Error types shared by every stage of the pipeline.
//!
//! All errors wrap a [`Diagnostic`]: a raw message plus the optional line,
//! column and [`Source`] it relates to. The displayed message is derived from
//! those fields on demand, so stages can attach a Source, move the line or
//! append detail without ever duplicating the ` in "name" at line n` suffix.

use std::fmt;

use thiserror::Error;

use crate::source::Source;

/// Raw error state. [`Diagnostic::message`] renders it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    raw_message: String,
    line: Option<usize>,
    column: Option<usize>,
    source: Option<Source>,
}

impl Diagnostic {
    pub fn new(raw_message: impl Into<String>) -> Self {
        Self {
            raw_message: raw_message.into(),
            line: None,
            column: None,
            source: None,
        }
    }

    pub fn raw_message(&self) -> &str {
        &self.raw_message
    }

    pub fn line(&self) -> Option<usize> {
        self.line
    }

    pub fn column(&self) -> Option<usize> {
        self.column
    }

    pub fn source_context(&self) -> Option<&Source> {
        self.source.as_ref()
    }

    pub fn set_line(&mut self, line: Option<usize>) {
        self.line = line;
    }

    pub fn set_column(&mut self, column: Option<usize>) {
        self.column = column;
    }

    pub fn set_source_context(&mut self, source: Option<Source>) {
        self.source = source;
    }

    pub fn append_message(&mut self, detail: &str) {
        self.raw_message.push_str(detail);
    }

    /// Renders the displayed message.
    ///
    /// A trailing `.` or `?` of the raw message stays at the very end, after
    /// the ` in "<name>"` and ` at line <n>` suffixes. A line of 0 counts as
    /// unknown.
    pub fn message(&self) -> String {
        let mut message = self.raw_message.clone();

        let dot = message.ends_with('.');
        if dot {
            message.pop();
        }

        let question_mark = message.ends_with('?');
        if question_mark {
            message.pop();
        }

        if let Some(source) = &self.source {
            if !source.name().is_empty() {
                message.push_str(&format!(" in \"{}\"", source.name()));
            }
        }

        if let Some(line) = self.line.filter(|line| *line > 0) {
            message.push_str(&format!(" at line {line}"));
        }

        if dot {
            message.push('.');
        }
        if question_mark {
            message.push('?');
        }

        message
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

/// Every failure the engine can surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Malformed template text; aborts the compilation.
    #[error("{0}")]
    Syntax(Diagnostic),

    /// A template, parent or trait could not be found.
    #[error("{0}")]
    Loader(Diagnostic),

    /// Failure while compiling against the registry or while rendering.
    #[error("{0}")]
    Runtime(Diagnostic),

    /// The compiler received a tree the parser can never produce.
    #[error("internal error: {0}")]
    Internal(Diagnostic),
}

impl Error {
    pub fn syntax(message: impl Into<String>, line: usize, column: usize, source: &Source) -> Self {
        let mut diagnostic = Diagnostic::new(message);
        diagnostic.set_line(Some(line));
        diagnostic.set_column(Some(column));
        diagnostic.set_source_context(Some(source.clone()));
        Error::Syntax(diagnostic)
    }

    pub fn loader(message: impl Into<String>) -> Self {
        Error::Loader(Diagnostic::new(message))
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Error::Runtime(Diagnostic::new(message))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(Diagnostic::new(message))
    }

    pub fn diagnostic(&self) -> &Diagnostic {
        match self {
            Error::Syntax(d) | Error::Loader(d) | Error::Runtime(d) | Error::Internal(d) => d,
        }
    }

    pub fn diagnostic_mut(&mut self) -> &mut Diagnostic {
        match self {
            Error::Syntax(d) | Error::Loader(d) | Error::Runtime(d) | Error::Internal(d) => d,
        }
    }

    pub fn message(&self) -> String {
        self.diagnostic().message()
    }

    pub fn raw_message(&self) -> &str {
        self.diagnostic().raw_message()
    }

    pub fn line(&self) -> Option<usize> {
        self.diagnostic().line()
    }

    pub fn source_context(&self) -> Option<&Source> {
        self.diagnostic().source_context()
    }

    pub fn set_line(&mut self, line: Option<usize>) {
        self.diagnostic_mut().set_line(line);
    }

    pub fn set_source_context(&mut self, source: Option<Source>) {
        self.diagnostic_mut().set_source_context(source);
    }

    pub fn append_message(&mut self, detail: &str) {
        self.diagnostic_mut().append_message(detail);
    }

    pub fn with_line(mut self, line: usize) -> Self {
        self.set_line(Some(line));
        self
    }

    pub fn with_source(mut self, source: &Source) -> Self {
        self.set_source_context(Some(source.clone()));
        self
    }

    /// Fills in the line and Source only where they are still unknown.
    pub(crate) fn located(mut self, line: usize, source: &Source) -> Self {
        if let Error::Loader(_) = self {
            return self;
        }
        if self.line().is_none() && line > 0 {
            self.set_line(Some(line));
        }
        if self.source_context().is_none() {
            self.set_source_context(Some(source.clone()));
        }
        self
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Names from `candidates` close enough to `name` to be worth suggesting.
pub(crate) fn alternatives<'a>(name: &str, candidates: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut found: Vec<(usize, String)> = candidates
        .into_iter()
        .filter_map(|candidate| {
            let distance = strsim::levenshtein(name, candidate);
            if distance <= name.len() / 3 || candidate.contains(name) {
                Some((distance, candidate.to_string()))
            } else {
                None
            }
        })
        .collect();
    found.sort();
    found.into_iter().map(|(_, candidate)| candidate).collect()
}

/// Appends ` Did you mean "a", "b"?` when there is anything to suggest.
pub(crate) fn suggest(error: &mut Error, alternatives: &[String]) {
    if alternatives.is_empty() {
        return;
    }
    let quoted: Vec<String> = alternatives.iter().map(|a| format!("\"{a}\"")).collect();
    error.append_message(&format!(" Did you mean {}?", quoted.join(", ")));
}
