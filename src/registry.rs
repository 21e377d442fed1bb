//! The extension registry: everything the lexer, parser and compiler need to
//! know about tags, operators, filters, functions and tests.
//!
//! The set of handler *kinds* is closed (the [`Tag`], [`UnaryOp`] and
//! [`BinaryOp`] enums); the registry maps names and symbols onto them, so a
//! host can alias a tag or drop an operator without touching the parser.
//! Filters, functions and tests are plain function pointers.

use indexmap::IndexMap;
use serde::Serialize;

use crate::builtins;
use crate::value::Value;

pub type FilterFn = fn(&Value, &[Value]) -> Result<Value, String>;
pub type FunctionFn = fn(&[Value]) -> Result<Value, String>;
pub type TestFn = fn(&Value, &[Value]) -> Result<bool, String>;

/// Statement handlers known to the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    If,
    For,
    Set,
    Block,
    Extends,
    Use,
    Embed,
    Macro,
    Import,
    From,
    Include,
    Sandbox,
    With,
    Apply,
    Do,
    AutoEscape,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Associativity {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum UnaryOp {
    Not,
    Neg,
    Pos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BinaryOp {
    Or,
    And,
    BitOr,
    BitXor,
    BitAnd,
    Eq,
    NotEq,
    Spaceship,
    Lt,
    Gt,
    Ge,
    Le,
    NotIn,
    In,
    Matches,
    StartsWith,
    EndsWith,
    Range,
    Add,
    Sub,
    Concat,
    Mul,
    Div,
    FloorDiv,
    Mod,
    /// Handled by the parser as a test application.
    Is,
    /// Handled by the parser as a negated test application.
    IsNot,
    Pow,
    NullCoalesce,
}

#[derive(Debug, Clone, Copy)]
pub struct UnaryOperator {
    pub precedence: u16,
    pub op: UnaryOp,
}

#[derive(Debug, Clone, Copy)]
pub struct BinaryOperator {
    pub precedence: u16,
    pub associativity: Associativity,
    pub op: BinaryOp,
}

#[derive(Debug, Clone, Copy)]
pub struct Filter {
    pub call: FilterFn,
    /// The result is already safe markup and must not be escaped again.
    pub safe: bool,
    /// The input is evaluated without strict-variable checks.
    pub lenient: bool,
}

impl Filter {
    pub fn new(call: FilterFn) -> Self {
        Self {
            call,
            safe: false,
            lenient: false,
        }
    }

    pub fn safe(mut self) -> Self {
        self.safe = true;
        self
    }

    pub fn lenient(mut self) -> Self {
        self.lenient = true;
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Function {
    Native(FunctionFn),
    /// Renders another template and returns its output.
    Include,
    /// Compiles a template from a string at render time.
    TemplateFromString,
}

#[derive(Debug, Clone, Copy)]
pub struct Test {
    pub call: TestFn,
    pub lenient: bool,
}

impl Test {
    pub fn new(call: TestFn) -> Self {
        Self { call, lenient: false }
    }

    pub fn lenient(mut self) -> Self {
        self.lenient = true;
        self
    }
}

/// Read-only capability table consulted during compilation and rendering.
#[derive(Debug, Clone)]
pub struct Registry {
    tags: IndexMap<String, Tag>,
    unary: IndexMap<String, UnaryOperator>,
    binary: IndexMap<String, BinaryOperator>,
    filters: IndexMap<String, Filter>,
    functions: IndexMap<String, Function>,
    tests: IndexMap<String, Test>,
}

impl Default for Registry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register_core();
        builtins::register(&mut registry);
        registry
    }
}

impl Registry {
    /// A registry without any tag, operator, filter, function or test.
    pub fn empty() -> Self {
        Self {
            tags: IndexMap::new(),
            unary: IndexMap::new(),
            binary: IndexMap::new(),
            filters: IndexMap::new(),
            functions: IndexMap::new(),
            tests: IndexMap::new(),
        }
    }

    fn register_core(&mut self) {
        use Associativity::{Left, Right};

        for (name, tag) in [
            ("if", Tag::If),
            ("for", Tag::For),
            ("set", Tag::Set),
            ("block", Tag::Block),
            ("extends", Tag::Extends),
            ("use", Tag::Use),
            ("embed", Tag::Embed),
            ("macro", Tag::Macro),
            ("import", Tag::Import),
            ("from", Tag::From),
            ("include", Tag::Include),
            ("sandbox", Tag::Sandbox),
            ("with", Tag::With),
            ("apply", Tag::Apply),
            ("do", Tag::Do),
            ("autoescape", Tag::AutoEscape),
        ] {
            self.add_tag(name, tag);
        }

        for (symbol, precedence, op) in [
            ("not", 50, UnaryOp::Not),
            ("-", 500, UnaryOp::Neg),
            ("+", 500, UnaryOp::Pos),
        ] {
            self.add_unary_operator(symbol, UnaryOperator { precedence, op });
        }

        for (symbol, precedence, op, associativity) in [
            ("or", 10, BinaryOp::Or, Left),
            ("and", 15, BinaryOp::And, Left),
            ("b-or", 16, BinaryOp::BitOr, Left),
            ("b-xor", 17, BinaryOp::BitXor, Left),
            ("b-and", 18, BinaryOp::BitAnd, Left),
            ("==", 20, BinaryOp::Eq, Left),
            ("!=", 20, BinaryOp::NotEq, Left),
            ("<=>", 20, BinaryOp::Spaceship, Left),
            ("<", 20, BinaryOp::Lt, Left),
            (">", 20, BinaryOp::Gt, Left),
            (">=", 20, BinaryOp::Ge, Left),
            ("<=", 20, BinaryOp::Le, Left),
            ("not in", 20, BinaryOp::NotIn, Left),
            ("in", 20, BinaryOp::In, Left),
            ("matches", 20, BinaryOp::Matches, Left),
            ("starts with", 20, BinaryOp::StartsWith, Left),
            ("ends with", 20, BinaryOp::EndsWith, Left),
            ("..", 25, BinaryOp::Range, Left),
            ("+", 30, BinaryOp::Add, Left),
            ("-", 30, BinaryOp::Sub, Left),
            ("~", 40, BinaryOp::Concat, Left),
            ("*", 60, BinaryOp::Mul, Left),
            ("/", 60, BinaryOp::Div, Left),
            ("//", 60, BinaryOp::FloorDiv, Left),
            ("%", 60, BinaryOp::Mod, Left),
            ("is", 100, BinaryOp::Is, Left),
            ("is not", 100, BinaryOp::IsNot, Left),
            ("**", 200, BinaryOp::Pow, Right),
            ("??", 300, BinaryOp::NullCoalesce, Right),
        ] {
            self.add_binary_operator(
                symbol,
                BinaryOperator {
                    precedence,
                    associativity,
                    op,
                },
            );
        }
    }

    pub fn add_tag(&mut self, name: impl Into<String>, tag: Tag) {
        self.tags.insert(name.into(), tag);
    }

    pub fn add_unary_operator(&mut self, symbol: impl Into<String>, operator: UnaryOperator) {
        self.unary.insert(symbol.into(), operator);
    }

    pub fn add_binary_operator(&mut self, symbol: impl Into<String>, operator: BinaryOperator) {
        self.binary.insert(symbol.into(), operator);
    }

    pub fn add_filter(&mut self, name: impl Into<String>, filter: Filter) {
        self.filters.insert(name.into(), filter);
    }

    pub fn add_function(&mut self, name: impl Into<String>, function: Function) {
        self.functions.insert(name.into(), function);
    }

    pub fn add_test(&mut self, name: impl Into<String>, test: Test) {
        self.tests.insert(name.into(), test);
    }

    pub fn tag(&self, name: &str) -> Option<Tag> {
        self.tags.get(name).copied()
    }

    pub fn unary_operator(&self, symbol: &str) -> Option<UnaryOperator> {
        self.unary.get(symbol).copied()
    }

    pub fn binary_operator(&self, symbol: &str) -> Option<BinaryOperator> {
        self.binary.get(symbol).copied()
    }

    pub fn filter(&self, name: &str) -> Option<Filter> {
        self.filters.get(name).copied()
    }

    pub fn function(&self, name: &str) -> Option<Function> {
        self.functions.get(name).copied()
    }

    pub fn test(&self, name: &str) -> Option<Test> {
        self.tests.get(name).copied()
    }

    pub fn tag_names(&self) -> impl Iterator<Item = &str> {
        self.tags.keys().map(String::as_str)
    }

    pub fn filter_names(&self) -> impl Iterator<Item = &str> {
        self.filters.keys().map(String::as_str)
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn test_names(&self) -> impl Iterator<Item = &str> {
        self.tests.keys().map(String::as_str)
    }

    /// Every operator symbol the lexer must recognize, longest first.
    ///
    /// `=` is included for named arguments and `set` assignments.
    pub fn operator_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .unary
            .keys()
            .chain(self.binary.keys())
            .cloned()
            .chain(std::iter::once("=".to_string()))
            .collect();
        symbols.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        symbols.dedup();
        symbols
    }
}
