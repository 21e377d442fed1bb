//! Token stream to [`Module`].
//!
//! The statement loop lives here; expressions are in [`expression`] and the
//! per-tag handlers in [`tags`]. Besides building the tree, the parser
//! collects blocks, macros and traits into the module and enforces the rules
//! that only make sense with the whole template in view (one `extends`, no
//! stray output in a child template, unique block and macro names).

mod expression;
mod tags;

use indexmap::IndexMap;

use crate::ast::{Module, Node, NodeType};
use crate::error::{alternatives, suggest, Error, Result};
use crate::lexer::{Token, TokenKind};
use crate::registry::Registry;
use crate::stream::TokenStream;

/// Names brought into scope by `import` and `from`.
#[derive(Debug, Clone, PartialEq)]
enum Imported {
    /// `import "x" as alias`: `alias.name()` calls a macro of "x".
    Template,
    /// `from "x" import name as alias`: `alias()` calls `name` through the
    /// hidden template alias.
    Macro { template: String, name: String },
}

/// Closing tags a nested body stops at, plus the opening tag for messages.
struct Until<'a> {
    names: &'a [&'a str],
    tag: &'a str,
    line: usize,
}

/// Per-module state. Embedded templates get a fresh one while their body
/// is parsed.
#[derive(Default)]
struct ModuleState {
    blocks: IndexMap<String, Node>,
    block_stack: Vec<String>,
    macros: IndexMap<String, Node>,
    traits: Vec<Node>,
    parent: Option<Node>,
    embedded: Vec<Module>,
    imported: Vec<IndexMap<String, Imported>>,
    in_macro: bool,
}

pub struct Parser<'a> {
    stream: TokenStream,
    registry: &'a Registry,
    state: ModuleState,
}

/// Parses a whole template.
pub fn parse(stream: TokenStream, registry: &Registry) -> Result<Module> {
    let mut parser = Parser::new(stream, registry);
    let module = parser.parse_module()?;
    tracing::trace!(
        template = module.source.name(),
        blocks = module.blocks().map_or(0, Node::len),
        macros = module.macros().map_or(0, Node::len),
        "parsed module"
    );
    Ok(module)
}

impl<'a> Parser<'a> {
    pub fn new(stream: TokenStream, registry: &'a Registry) -> Self {
        Self {
            stream,
            registry,
            state: ModuleState {
                imported: vec![IndexMap::new()],
                ..ModuleState::default()
            },
        }
    }

    pub fn parse_module(&mut self) -> Result<Module> {
        let body = self.subparse(None)?;
        if !self.stream.is_eof() {
            let token = self.stream.current().clone();
            return Err(self.error_at(format!("Unexpected token \"{}\".", token.kind), &token));
        }
        self.finish_module(body)
    }

    fn finish_module(&mut self, body: Node) -> Result<Module> {
        let body = if self.state.parent.is_some() {
            self.filter_child_body(body)?
        } else {
            body
        };

        let state = std::mem::take(&mut self.state);
        let mut node = Node::new(NodeType::Module, 1, 1).with_child("body", fold_constants(body));
        if let Some(parent) = state.parent {
            node.set_child("parent", parent);
        }

        let mut blocks = Node::new(NodeType::Body, 1, 1);
        for (name, block) in state.blocks {
            blocks.set_child(&name, fold_constants(block));
        }
        node.set_child("blocks", blocks);

        let mut macros = Node::new(NodeType::Body, 1, 1);
        for (name, def) in state.macros {
            macros.set_child(&name, fold_constants(def));
        }
        node.set_child("macros", macros);

        node.set_child("traits", Node::list(NodeType::Body, state.traits, 1, 1));

        Ok(Module {
            node,
            source: self.stream.source().clone(),
            embedded: state.embedded,
        })
    }

    /// Parses statements until EOF or, with `until`, until one of its closing
    /// tags. The stream is then left on the closing tag's name.
    fn subparse(&mut self, until: Option<Until<'_>>) -> Result<Node> {
        let start = self.stream.current();
        let (line, column) = (start.line, start.column);
        let mut body = Node::new(NodeType::Body, line, column);

        loop {
            let token = self.stream.current().clone();
            match token.kind {
                TokenKind::Text => {
                    self.stream.next();
                    body.push(Node::new(NodeType::Text, token.line, token.column).with_attr("data", token.value));
                }
                TokenKind::VarStart => {
                    self.stream.next();
                    let expr = self.parse_expression(0)?;
                    self.stream.expect(TokenKind::VarEnd, None, None)?;
                    body.push(Node::new(NodeType::Print, token.line, token.column).with_child("expr", expr));
                }
                TokenKind::BlockStart => {
                    self.stream.next();
                    let name = self.stream.current().clone();
                    if name.kind != TokenKind::Name {
                        return Err(self.error_at("A block must start with a tag name.", &name));
                    }

                    if let Some(until) = &until {
                        if until.names.contains(&name.value.as_str()) {
                            return Ok(body);
                        }
                    }

                    let Some(tag) = self.registry.tag(&name.value) else {
                        let mut err = match &until {
                            Some(until) => self.error_at(
                                format!(
                                    "Unexpected \"{}\" tag (expecting closing tag for the \"{}\" tag defined near line {}).",
                                    name.value, until.tag, until.line
                                ),
                                &name,
                            ),
                            None => self.error_at(format!("Unknown \"{}\" tag.", name.value), &name),
                        };
                        if until.is_none() {
                            suggest(&mut err, &alternatives(&name.value, self.registry.tag_names()));
                        }
                        return Err(err);
                    };

                    self.stream.next();
                    if let Some(mut node) = self.parse_tag(tag, &name)? {
                        if node.attr("tag").is_none() {
                            node.set_attr("tag", name.value.as_str());
                        }
                        body.push(node);
                    }
                }
                TokenKind::Eof => {
                    if let Some(until) = until {
                        return Err(self.error_at(
                            format!(
                                "Unexpected end of template (expecting closing tag for the \"{}\" tag defined near line {}).",
                                until.tag, until.line
                            ),
                            &token,
                        ));
                    }
                    return Ok(body);
                }
                _ => {
                    return Err(self.error_at(
                        format!("Unexpected token \"{}\" of value \"{}\".", token.kind, token.value),
                        &token,
                    ));
                }
            }
        }
    }

    /// Body of a template with `extends`: whitespace, blocks and statements
    /// without output are kept, anything printed is an error.
    fn filter_child_body(&self, body: Node) -> Result<Node> {
        let mut kept = Node::new(NodeType::Body, body.line, body.column);
        for node in body.into_nodes() {
            if let Some(node) = self.filter_child_node(node)? {
                kept.push(node);
            }
        }
        Ok(kept)
    }

    fn filter_child_node(&self, node: Node) -> Result<Option<Node>> {
        match node.ty {
            NodeType::Text if node.is_blank_text() => Ok(None),
            NodeType::BlockReference => Ok(None),
            NodeType::Text | NodeType::Print | NodeType::Include | NodeType::Embed => Err(Error::syntax(
                "A template that extends another one cannot include content outside Twig blocks. Did you forget to put the content inside a {% block %} tag?",
                node.line,
                node.column,
                self.stream.source(),
            )),
            // captured output never reaches the page
            NodeType::Set if node.bool_attr("capture") => Ok(Some(node)),
            NodeType::Body | NodeType::If | NodeType::For | NodeType::With | NodeType::AutoEscape => {
                let ty = node.ty;
                let (line, column) = (node.line, node.column);
                let mut rebuilt = Node::new(ty, line, column);
                for (key, attr) in node.attributes() {
                    rebuilt.set_attr(key, attr.clone());
                }
                for (key, child) in node.children() {
                    let child = match child.ty {
                        NodeType::Body => self.filter_child_body(child.clone())?,
                        _ => child.clone(),
                    };
                    rebuilt.set_child(key, child);
                }
                Ok(Some(rebuilt))
            }
            _ => Ok(Some(node)),
        }
    }

    fn error_at(&self, message: impl Into<String>, token: &Token) -> Error {
        Error::syntax(message, token.line, token.column, self.stream.source())
    }

    fn error_at_node(&self, message: impl Into<String>, node: &Node) -> Error {
        Error::syntax(message, node.line, node.column, self.stream.source())
    }

    fn push_import_scope(&mut self) {
        self.state.imported.push(IndexMap::new());
    }

    fn pop_import_scope(&mut self) {
        self.state.imported.pop();
    }

    fn add_imported(&mut self, alias: &str, imported: Imported) {
        if let Some(scope) = self.state.imported.last_mut() {
            scope.insert(alias.to_string(), imported);
        }
    }

    fn imported(&self, alias: &str) -> Option<&Imported> {
        self.state.imported.iter().rev().find_map(|scope| scope.get(alias))
    }

    fn is_main_scope(&self) -> bool {
        self.state.block_stack.is_empty() && !self.state.in_macro
    }
}

/// Folds `"a" ~ "b"` into one constant.
fn fold_constants(node: Node) -> Node {
    node.transform(&mut |node| {
        if node.ty != NodeType::Binary || node.str_attr("operator") != Some("~") {
            return node;
        }
        let left = node.child("left").and_then(constant_text);
        let right = node.child("right").and_then(constant_text);
        let folded = match (left, right) {
            (Some(left), Some(right)) => Some(format!("{left}{right}")),
            _ => None,
        };
        match folded {
            Some(text) => Node::constant(text, node.line, node.column),
            None => node,
        }
    })
}

fn constant_text(node: &Node) -> Option<&str> {
    match node.ty {
        NodeType::Constant => node.str_attr("value"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Attr;
    use crate::lexer::tokenize;
    use crate::source::Source;

    pub(super) fn parse_str(code: &str) -> Result<Module> {
        let registry = Registry::default();
        let source = Source::new(code, "index", "");
        parse(tokenize(&source, &registry)?, &registry)
    }

    fn body(code: &str) -> Node {
        parse_str(code).unwrap().body().unwrap().clone()
    }

    fn print_expr(code: &str) -> Node {
        body(code).child("0").unwrap().child("expr").unwrap().clone()
    }

    #[test]
    fn multiplication_binds_tighter() {
        let expr = print_expr("{{ 1 + 2 * 3 }}");
        assert_eq!(expr.str_attr("operator"), Some("+"));
        let right = expr.child("right").unwrap();
        assert_eq!(right.str_attr("operator"), Some("*"));
    }

    #[test]
    fn parentheses_become_nesting() {
        let expr = print_expr("{{ (1 + 2) * 3 }}");
        assert_eq!(expr.str_attr("operator"), Some("*"));
        assert_eq!(expr.child("left").unwrap().str_attr("operator"), Some("+"));
    }

    #[test]
    fn power_is_right_associative() {
        let expr = print_expr("{{ 2 ** 3 ** 2 }}");
        assert_eq!(expr.child("left").unwrap().ty, NodeType::Constant);
        assert_eq!(expr.child("right").unwrap().str_attr("operator"), Some("**"));
    }

    #[test]
    fn literal_concatenation_is_folded() {
        let expr = print_expr("{{ 'a' ~ 'b' ~ 'c' }}");
        assert_eq!(expr.ty, NodeType::Constant);
        assert_eq!(expr.attr("value"), Some(&Attr::Str("abc".into())));
    }

    #[test]
    fn interpolation_becomes_concatenation() {
        let expr = print_expr(r#"{{ "Hi #{name}!" }}"#);
        assert_eq!(expr.str_attr("operator"), Some("~"));
    }

    #[test]
    fn blocks_are_collected() {
        let module = parse_str("{% if x %}{% block a %}A{% endblock %}{% endif %}{% block b 'B' %}").unwrap();
        let names: Vec<&str> = module.blocks().unwrap().children().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn duplicate_block_is_rejected() {
        let err = parse_str("{% block a %}{% endblock %}\n{% block a %}{% endblock %}").unwrap_err();
        assert_eq!(err.raw_message(), "The block 'a' has already been defined line 1.");
        assert_eq!(err.line(), Some(2));
    }

    #[test]
    fn duplicate_macro_is_rejected() {
        let err = parse_str("{% macro m() %}{% endmacro %}{% macro m() %}{% endmacro %}").unwrap_err();
        assert_eq!(err.raw_message(), "The macro \"m\" has already been defined line 1.");
    }

    #[test]
    fn single_extends() {
        let err = parse_str("{% extends 'a' %}{% extends 'b' %}").unwrap_err();
        assert_eq!(err.raw_message(), "Multiple extends tags are forbidden.");
    }

    #[test]
    fn extends_inside_block() {
        let err = parse_str("{% block a %}{% extends 'b' %}{% endblock %}").unwrap_err();
        assert_eq!(err.raw_message(), "Cannot use \"extend\" in a block.");
    }

    #[test]
    fn child_content_outside_blocks() {
        let err = parse_str("{% extends 'base' %}\nHello").unwrap_err();
        assert!(err.raw_message().starts_with("A template that extends another one cannot include content outside Twig blocks."));
        assert_eq!(err.line(), Some(2));

        let err = parse_str("{% extends 'base' %}{% if x %}{{ y }}{% endif %}").unwrap_err();
        assert!(err.raw_message().starts_with("A template that extends another one"));

        assert!(parse_str("{% extends 'base' %}\n  {# c #}\n{% set x = 1 %}{% block a %}A{% endblock %}\n").is_ok());
    }

    #[test]
    fn unknown_tag_suggests() {
        let err = parse_str("{% iff x %}").unwrap_err();
        assert_eq!(err.raw_message(), "Unknown \"iff\" tag. Did you mean \"if\"?");
    }

    #[test]
    fn unexpected_closing_tag() {
        let err = parse_str("{% if x %}\n{% endfor %}").unwrap_err();
        assert_eq!(
            err.raw_message(),
            "Unexpected \"endfor\" tag (expecting closing tag for the \"if\" tag defined near line 1)."
        );
        assert_eq!(err.line(), Some(2));
    }

    #[test]
    fn traits_record_renames() {
        let module = parse_str("{% use 'a' with x as y %}").unwrap();
        let traits = module.traits().unwrap();
        let first = traits.child("0").unwrap();
        assert_eq!(first.ty, NodeType::Use);
        assert_eq!(first.child("targets").unwrap().str_attr("x"), Some("y"));
    }

    #[test]
    fn imported_alias_becomes_macro_call() {
        let body = body("{% import 'forms' as f %}{{ f.input('a') }}");
        assert_eq!(body.child("0").unwrap().ty, NodeType::Import);
        let print = body.child("1").unwrap().child("expr").unwrap();
        assert_eq!(print.ty, NodeType::MacroCall);
        assert_eq!(print.str_attr("template"), Some("f"));
        assert_eq!(print.str_attr("name"), Some("input"));
    }

    #[test]
    fn from_import_function_syntax() {
        let body = body("{% from 'forms' import input as field %}{{ field('a') }}");
        let call = body.child("1").unwrap().child("expr").unwrap();
        assert_eq!(call.ty, NodeType::MacroCall);
        assert_eq!(call.str_attr("name"), Some("input"));
        assert!(call.str_attr("template").unwrap().starts_with("__internal_"));
    }

    #[test]
    fn parent_outside_block() {
        let err = parse_str("{{ parent() }}").unwrap_err();
        assert_eq!(err.raw_message(), "Calling the \"parent\" function outside a block is forbidden.");
    }

    #[test]
    fn embedded_templates_get_their_own_module() {
        let module = parse_str("{% embed 'base' %}{% block a %}x{% endblock %}{% endembed %}").unwrap();
        assert_eq!(module.embedded.len(), 1);
        assert!(module.blocks().unwrap().is_empty());
        assert!(module.embedded[0].blocks().unwrap().has_child("a"));
        assert!(module.embedded[0].parent().is_some());
    }

    #[test]
    fn sandbox_only_allows_includes() {
        let err = parse_str("{% sandbox %}{{ x }}{% endsandbox %}").unwrap_err();
        assert_eq!(err.raw_message(), "Only \"include\" tags are allowed within a \"sandbox\" section.");
        assert!(parse_str("{% sandbox %}\n{% include 'x' %}\n{% endsandbox %}").is_ok());
    }

    #[test]
    fn set_needs_matching_counts() {
        let err = parse_str("{% set a, b = 1 %}").unwrap_err();
        assert_eq!(
            err.raw_message(),
            "When using set, you must have the same number of variables and assignments."
        );
    }

    #[test]
    fn expression_errors() {
        let err = parse_str("{{ [1 2] }}").unwrap_err();
        assert_eq!(
            err.raw_message(),
            "A sequence element must be followed by a comma. Unexpected token \"number\" of value \"2\" (\"punctuation\" expected with value \",\")."
        );
        let err = parse_str("{{ }}").unwrap_err();
        assert_eq!(err.raw_message(), "Unexpected token \"end of print statement\".");
    }
}
