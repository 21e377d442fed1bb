//! The executable form of a template.
//!
//! A [`CompiledTemplate`] is plain data: an instruction list for the body,
//! one per block and macro, and a description of its parent and traits. The
//! renderer in `eval` walks it. Every container is ordered so the serialized
//! [`CompiledTemplate::artifact`] is byte-identical for identical input.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::Serialize;

use crate::builtins::EscapeStrategy;
use crate::error::{Error, Result};
use crate::registry::{BinaryOp, UnaryOp};
use crate::source::Source;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AttrKind {
    /// `a.b`: mapping key, sequence index or macro of a template value.
    Any,
    /// `a[b]`: item access only.
    Array,
    /// `a.b(...)`
    Method,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MacroTarget {
    SelfRef,
    Alias(String),
}

#[derive(Debug, Clone, Serialize)]
pub enum Expr {
    Const(Value),
    Name {
        name: String,
        /// Never an error, even with `strict_variables`.
        lenient: bool,
        line: usize,
    },
    SelfRef,
    Context,
    Array(Vec<Expr>),
    Hash(Vec<(Expr, Expr)>),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
        line: usize,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
        line: usize,
    },
    Conditional {
        test: Box<Expr>,
        /// Absent for `a ?: b`, where the test value itself is the result.
        then: Option<Box<Expr>>,
        otherwise: Box<Expr>,
    },
    Filter {
        name: String,
        input: Box<Expr>,
        args: Vec<Expr>,
        line: usize,
    },
    Test {
        name: String,
        input: Box<Expr>,
        args: Vec<Expr>,
        line: usize,
    },
    GetAttr {
        object: Box<Expr>,
        key: Box<Expr>,
        args: Vec<Expr>,
        kind: AttrKind,
        lenient: bool,
        line: usize,
    },
    Function {
        name: String,
        args: Vec<Expr>,
        line: usize,
    },
    Include {
        template: Box<Expr>,
        variables: Option<Box<Expr>>,
        with_context: Option<Box<Expr>>,
        ignore_missing: Option<Box<Expr>>,
        sandboxed: Option<Box<Expr>>,
        line: usize,
    },
    TemplateFromString {
        code: Box<Expr>,
        name: Option<Box<Expr>>,
        line: usize,
    },
    MacroCall {
        target: MacroTarget,
        name: String,
        args: Vec<Expr>,
        named: Vec<(String, Expr)>,
        line: usize,
    },
    BlockCall {
        name: Box<Expr>,
        template: Option<Box<Expr>>,
        line: usize,
    },
    ParentCall {
        block: String,
        line: usize,
    },
}

#[derive(Debug, Clone, Serialize)]
pub enum Instr {
    Text(String),
    Print {
        expr: Expr,
        /// `None` when autoescaping is off or the expression is known safe.
        escape: Option<EscapeStrategy>,
        line: usize,
    },
    If {
        branches: Vec<(Expr, Vec<Instr>)>,
        otherwise: Vec<Instr>,
    },
    For {
        key: Option<String>,
        value: String,
        seq: Expr,
        body: Vec<Instr>,
        otherwise: Vec<Instr>,
        line: usize,
    },
    Set {
        names: Vec<String>,
        values: Vec<Expr>,
    },
    Capture {
        name: String,
        body: Vec<Instr>,
    },
    DisplayBlock {
        name: String,
        line: usize,
    },
    /// `global` imports belong to the template and are seen by its blocks
    /// and macros; the others only by the running block or macro.
    Import {
        alias: String,
        template: Expr,
        global: bool,
        line: usize,
    },
    Include {
        template: Expr,
        variables: Option<Expr>,
        only: bool,
        ignore_missing: bool,
        line: usize,
    },
    Embed {
        index: usize,
        variables: Option<Expr>,
        only: bool,
        ignore_missing: bool,
        line: usize,
    },
    With {
        variables: Option<Expr>,
        only: bool,
        body: Vec<Instr>,
    },
    Do(Expr),
    Sandbox(Vec<Instr>),
    /// Source line marker, emitted in debug mode.
    Line(usize),
}

#[derive(Debug, Clone, Serialize)]
pub enum ParentRef {
    None,
    Fixed(String),
    /// Evaluated against the render context.
    Dynamic(Expr),
}

#[derive(Debug, Clone, Serialize)]
pub struct TraitRef {
    pub template: String,
    /// Block name in the trait => name in the using template.
    pub renames: IndexMap<String, String>,
    pub line: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MacroDef {
    /// Parameters in declaration order with their default values.
    pub params: Vec<(String, Expr)>,
    pub body: Vec<Instr>,
    pub line: usize,
}

/// Tags, filters and functions a template uses, checked by sandboxes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Features {
    pub tags: BTreeSet<String>,
    pub filters: BTreeSet<String>,
    pub functions: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompiledTemplate {
    pub(crate) name: String,
    pub(crate) source: Source,
    pub(crate) parent: ParentRef,
    pub(crate) traitable: bool,
    pub(crate) traits: Vec<TraitRef>,
    pub(crate) blocks: IndexMap<String, Vec<Instr>>,
    pub(crate) macros: IndexMap<String, MacroDef>,
    pub(crate) body: Vec<Instr>,
    pub(crate) embedded: Vec<CompiledTemplate>,
    pub(crate) features: Features,
}

impl CompiledTemplate {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The Source this unit was compiled from. Its code is blank unless the
    /// environment runs in debug mode.
    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn parent(&self) -> &ParentRef {
        &self.parent
    }

    /// Whether `use` may take blocks from this template.
    pub fn is_traitable(&self) -> bool {
        self.traitable
    }

    pub fn traits(&self) -> &[TraitRef] {
        &self.traits
    }

    pub fn has_block(&self, name: &str) -> bool {
        self.blocks.contains_key(name)
    }

    pub fn block_names(&self) -> impl Iterator<Item = &str> {
        self.blocks.keys().map(String::as_str)
    }

    pub fn has_macro(&self, name: &str) -> bool {
        self.macros.contains_key(name)
    }

    pub fn features(&self) -> &Features {
        &self.features
    }

    /// Features of this unit and all its embedded units.
    pub(crate) fn all_features(&self) -> Features {
        let mut features = self.features.clone();
        for embedded in &self.embedded {
            let nested = embedded.all_features();
            features.tags.extend(nested.tags);
            features.filters.extend(nested.filters);
            features.functions.extend(nested.functions);
        }
        features
    }

    /// Storable form for a compiled-template cache.
    pub fn artifact(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::internal(format!("Unable to serialize template \"{}\": {e}.", self.name)))
    }
}
