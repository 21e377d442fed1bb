//! [`Module`] to [`CompiledTemplate`].
//!
//! The parser guarantees the tree's shape; a node the compiler does not
//! expect is an [`Error::Internal`]. Names that only the registry can
//! resolve (filters, functions, tests) are checked here, so a typo fails at
//! load time rather than halfway through a render.

use indexmap::IndexMap;

use crate::ast::{Attr, Module, Node, NodeType};
use crate::builtins::EscapeStrategy;
use crate::compiled::{
    AttrKind, CompiledTemplate, Expr, Features, Instr, MacroDef, MacroTarget, ParentRef, TraitRef,
};
use crate::config::Config;
use crate::error::{alternatives, suggest, Error, Result};
use crate::registry::{Function, Registry};
use crate::source::Source;
use crate::value::Value;

/// Compiles a parsed module and its embedded templates.
pub fn compile(module: &Module, registry: &Registry, config: &Config) -> Result<CompiledTemplate> {
    let mut compiler = Compiler {
        registry,
        config,
        source: &module.source,
        features: Features::default(),
        escape: vec![config.autoescape],
        blocks: IndexMap::new(),
        module,
    };
    let unit = compiler.compile_module()?;
    tracing::debug!(
        template = unit.name(),
        blocks = unit.blocks.len(),
        macros = unit.macros.len(),
        embedded = unit.embedded.len(),
        "compiled template"
    );
    Ok(unit)
}

struct Compiler<'a> {
    registry: &'a Registry,
    config: &'a Config,
    source: &'a Source,
    module: &'a Module,
    features: Features,
    /// Innermost autoescape strategy last.
    escape: Vec<Option<EscapeStrategy>>,
    blocks: IndexMap<String, Vec<Instr>>,
}

impl<'a> Compiler<'a> {
    fn compile_module(&mut self) -> Result<CompiledTemplate> {
        let module = self.module;

        let parent = match module.parent() {
            None => ParentRef::None,
            Some(node) => {
                self.features.tags.insert("extends".to_string());
                match (node.ty, node.attr("value")) {
                    (NodeType::Constant, Some(Attr::Str(name))) => ParentRef::Fixed(name.clone()),
                    _ => ParentRef::Dynamic(self.expr(node, false)?),
                }
            }
        };

        let mut traits = Vec::new();
        for node in module.traits().into_iter().flat_map(Node::nodes) {
            self.features.tags.insert("use".to_string());
            let template = node
                .child("template")
                .and_then(|t| t.str_attr("value"))
                .ok_or_else(|| self.internal("use statement without a template name", node))?;
            let renames = node
                .child("targets")
                .map(|targets| {
                    targets
                        .attributes()
                        .filter_map(|(name, alias)| match alias {
                            Attr::Str(alias) => Some((name.to_string(), alias.clone())),
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_default();
            traits.push(TraitRef {
                template: template.to_string(),
                renames,
                line: node.line,
            });
        }

        let body = match module.body() {
            Some(body) => self.statements(body)?,
            None => return Err(Error::internal("Module without a body.").with_source(self.source)),
        };

        // Blocks never displayed from the body (child templates) still need
        // their own instructions.
        for (name, node) in module.blocks().into_iter().flat_map(Node::children) {
            if !self.blocks.contains_key(name) {
                self.compile_block(name, node)?;
            }
        }
        let mut blocks = IndexMap::new();
        for (name, _) in module.blocks().into_iter().flat_map(Node::children) {
            if let Some(instrs) = self.blocks.swap_remove(name) {
                blocks.insert(name.to_string(), instrs);
            }
        }

        let mut macros = IndexMap::new();
        for (name, node) in module.macros().into_iter().flat_map(Node::children) {
            self.features.tags.insert("macro".to_string());
            macros.insert(name.to_string(), self.compile_macro(node)?);
        }

        let embedded = module
            .embedded
            .iter()
            .map(|embedded| compile(embedded, self.registry, self.config))
            .collect::<Result<Vec<_>>>()?;

        let source = if self.config.debug {
            module.source.clone()
        } else {
            module.source.without_code()
        };

        Ok(CompiledTemplate {
            name: module.source.name().to_string(),
            source,
            traitable: matches!(parent, ParentRef::None),
            parent,
            traits,
            blocks,
            macros,
            body,
            embedded,
            features: std::mem::take(&mut self.features),
        })
    }

    fn compile_block(&mut self, name: &str, block: &Node) -> Result<()> {
        // reserve the slot first so nested references don't recurse forever
        self.blocks.insert(name.to_string(), Vec::new());
        let body = match block.child("body") {
            Some(body) => self.statements(body)?,
            None => Vec::new(),
        };
        self.blocks.insert(name.to_string(), body);
        Ok(())
    }

    fn compile_macro(&mut self, node: &Node) -> Result<MacroDef> {
        let mut params = Vec::new();
        if let Some(arguments) = node.child("arguments") {
            for (name, default) in arguments.children() {
                params.push((name.to_string(), self.expr(default, false)?));
            }
        }
        let body = match node.child("body") {
            Some(body) => self.statements(body)?,
            None => Vec::new(),
        };
        Ok(MacroDef {
            params,
            body,
            line: node.line,
        })
    }

    fn statements(&mut self, body: &Node) -> Result<Vec<Instr>> {
        let mut out = Vec::new();
        self.statement(body, &mut out)?;
        Ok(out)
    }

    fn statement(&mut self, node: &Node, out: &mut Vec<Instr>) -> Result<()> {
        if let Some(tag) = node.str_attr("tag") {
            self.features.tags.insert(tag.to_string());
        }
        if self.config.debug && !matches!(node.ty, NodeType::Body | NodeType::Text) {
            out.push(Instr::Line(node.line));
        }

        match node.ty {
            NodeType::Body => {
                for child in node.nodes() {
                    self.statement(child, out)?;
                }
            }
            NodeType::Text => {
                let data = node.str_attr("data").unwrap_or_default();
                if !data.is_empty() {
                    out.push(Instr::Text(data.to_string()));
                }
            }
            NodeType::Print => {
                let expr_node = self.child(node, "expr")?;
                let escape = self.escape_for(expr_node);
                out.push(Instr::Print {
                    expr: self.expr(expr_node, false)?,
                    escape,
                    line: node.line,
                });
            }
            NodeType::If => {
                let tests: Vec<&Node> = self.child(node, "tests")?.nodes().collect();
                let mut branches = Vec::new();
                for pair in tests.chunks(2) {
                    let [condition, body] = pair else {
                        return Err(self.internal("if statement with an odd number of tests", node));
                    };
                    branches.push((self.expr(condition, false)?, self.statements(body)?));
                }
                let otherwise = match node.child("else") {
                    Some(body) => self.statements(body)?,
                    None => Vec::new(),
                };
                out.push(Instr::If { branches, otherwise });
            }
            NodeType::For => {
                let value = self
                    .child(node, "value_target")?
                    .str_attr("name")
                    .ok_or_else(|| self.internal("loop target without a name", node))?
                    .to_string();
                let key = node
                    .child("key_target")
                    .and_then(|k| k.str_attr("name"))
                    .map(str::to_string);
                let seq = self.expr(self.child(node, "seq")?, false)?;
                let body = self.statements(self.child(node, "body")?)?;
                let otherwise = match node.child("else") {
                    Some(body) => self.statements(body)?,
                    None => Vec::new(),
                };
                out.push(Instr::For {
                    key,
                    value,
                    seq,
                    body,
                    otherwise,
                    line: node.line,
                });
            }
            NodeType::Set => {
                let names = match node.attr("names") {
                    Some(Attr::Strs(names)) => names.clone(),
                    _ => return Err(self.internal("set statement without targets", node)),
                };
                if node.bool_attr("capture") {
                    let name = names
                        .into_iter()
                        .next()
                        .ok_or_else(|| self.internal("capture without a target", node))?;
                    let body = self.statements(self.child(node, "body")?)?;
                    out.push(Instr::Capture { name, body });
                } else {
                    let values = self
                        .child(node, "values")?
                        .nodes()
                        .map(|value| self.expr(value, false))
                        .collect::<Result<Vec<_>>>()?;
                    out.push(Instr::Set { names, values });
                }
            }
            NodeType::BlockReference => {
                let name = node
                    .str_attr("name")
                    .ok_or_else(|| self.internal("block reference without a name", node))?;
                if !self.blocks.contains_key(name) {
                    let block = self
                        .module
                        .blocks()
                        .and_then(|blocks| blocks.child(name))
                        .ok_or_else(|| self.internal("reference to an unknown block", node))?;
                    self.compile_block(name, block)?;
                }
                out.push(Instr::DisplayBlock {
                    name: name.to_string(),
                    line: node.line,
                });
            }
            NodeType::Import => {
                let alias = node
                    .str_attr("var")
                    .ok_or_else(|| self.internal("import without an alias", node))?
                    .to_string();
                let template = self.expr(self.child(node, "expr")?, false)?;
                out.push(Instr::Import {
                    alias,
                    template,
                    global: node.bool_attr("global"),
                    line: node.line,
                });
            }
            NodeType::Include => {
                let template = self.expr(self.child(node, "expr")?, false)?;
                let variables = self.optional_expr(node, "variables")?;
                out.push(Instr::Include {
                    template,
                    variables,
                    only: node.bool_attr("only"),
                    ignore_missing: node.bool_attr("ignore_missing"),
                    line: node.line,
                });
            }
            NodeType::Embed => {
                let index = match node.attr("index") {
                    Some(Attr::Int(i)) => *i as usize,
                    _ => return Err(self.internal("embed without an index", node)),
                };
                let variables = self.optional_expr(node, "variables")?;
                out.push(Instr::Embed {
                    index,
                    variables,
                    only: node.bool_attr("only"),
                    ignore_missing: node.bool_attr("ignore_missing"),
                    line: node.line,
                });
            }
            NodeType::Sandbox => {
                let body = self.statements(self.child(node, "body")?)?;
                out.push(Instr::Sandbox(body));
            }
            NodeType::With => {
                let variables = self.optional_expr(node, "variables")?;
                let body = self.statements(self.child(node, "body")?)?;
                out.push(Instr::With {
                    variables,
                    only: node.bool_attr("only"),
                    body,
                });
            }
            NodeType::Do => {
                let expr = self.expr(self.child(node, "expr")?, false)?;
                out.push(Instr::Do(expr));
            }
            NodeType::AutoEscape => {
                let strategy = match node.attr("strategy") {
                    Some(Attr::Str(name)) => Some(EscapeStrategy::from_name(name).ok_or_else(|| {
                        self.runtime(format!("Invalid escaping strategy \"{name}\"."), node)
                    })?),
                    _ => None,
                };
                self.escape.push(strategy);
                let body = self.statements(self.child(node, "body")?);
                self.escape.pop();
                out.extend(body?);
            }
            other => {
                return Err(self.internal(&format!("unexpected {other:?} node in a statement list"), node));
            }
        }
        Ok(())
    }

    fn escape_for(&self, expr: &Node) -> Option<EscapeStrategy> {
        let strategy = self.escape.last().copied().flatten()?;
        if self.is_safe(expr) {
            None
        } else {
            Some(strategy)
        }
    }

    /// Expressions whose output never needs escaping.
    fn is_safe(&self, node: &Node) -> bool {
        match node.ty {
            NodeType::Constant
            | NodeType::MacroCall
            | NodeType::BlockFunction
            | NodeType::ParentFunction => true,
            NodeType::Filter => node
                .str_attr("name")
                .and_then(|name| self.registry.filter(name))
                .is_some_and(|filter| filter.safe),
            NodeType::FunctionCall => matches!(
                node.str_attr("name").and_then(|name| self.registry.function(name)),
                Some(Function::Include)
            ),
            NodeType::Conditional => {
                // `a ?: b` yields the test value itself
                let result = node.child("then").or_else(|| node.child("test"));
                result.is_some_and(|n| self.is_safe(n)) && node.child("else").is_some_and(|n| self.is_safe(n))
            }
            _ => false,
        }
    }

    fn optional_expr(&mut self, node: &Node, key: &str) -> Result<Option<Expr>> {
        node.child(key).map(|child| self.expr(child, false)).transpose()
    }

    fn expr(&mut self, node: &Node, lenient: bool) -> Result<Expr> {
        let line = node.line;
        Ok(match node.ty {
            NodeType::Constant => Expr::Const(constant_value(node.attr("value"))),
            NodeType::Name => {
                let name = node
                    .str_attr("name")
                    .ok_or_else(|| self.internal("name without a value", node))?;
                match name {
                    "_context" => Expr::Context,
                    _ => Expr::Name {
                        name: name.to_string(),
                        lenient,
                        line,
                    },
                }
            }
            NodeType::TemplateReference => Expr::SelfRef,
            NodeType::Array => Expr::Array(
                node.nodes()
                    .map(|item| self.expr(item, false))
                    .collect::<Result<Vec<_>>>()?,
            ),
            NodeType::Hash => {
                let items: Vec<&Node> = node.nodes().collect();
                let mut pairs = Vec::new();
                for pair in items.chunks(2) {
                    let [key, value] = pair else {
                        return Err(self.internal("mapping with a key but no value", node));
                    };
                    pairs.push((self.expr(key, false)?, self.expr(value, false)?));
                }
                Expr::Hash(pairs)
            }
            NodeType::Unary => {
                let symbol = node.str_attr("operator").unwrap_or_default();
                let operator = self
                    .registry
                    .unary_operator(symbol)
                    .ok_or_else(|| self.internal(&format!("unknown unary operator \"{symbol}\""), node))?;
                Expr::Unary {
                    op: operator.op,
                    expr: Box::new(self.expr(self.child(node, "node")?, false)?),
                    line,
                }
            }
            NodeType::Binary => {
                let symbol = node.str_attr("operator").unwrap_or_default();
                let operator = self
                    .registry
                    .binary_operator(symbol)
                    .ok_or_else(|| self.internal(&format!("unknown binary operator \"{symbol}\""), node))?;
                let left_lenient = operator.op == crate::registry::BinaryOp::NullCoalesce;
                Expr::Binary {
                    op: operator.op,
                    left: Box::new(self.expr(self.child(node, "left")?, left_lenient)?),
                    right: Box::new(self.expr(self.child(node, "right")?, false)?),
                    line,
                }
            }
            NodeType::Conditional => Expr::Conditional {
                test: Box::new(self.expr(self.child(node, "test")?, false)?),
                then: match node.child("then") {
                    Some(then) => Some(Box::new(self.expr(then, false)?)),
                    None => None,
                },
                otherwise: Box::new(self.expr(self.child(node, "else")?, false)?),
            },
            NodeType::Filter => {
                let name = node.str_attr("name").unwrap_or_default().to_string();
                let Some(filter) = self.registry.filter(&name) else {
                    let mut err = self.runtime(format!("Unknown \"{name}\" filter."), node);
                    suggest(&mut err, &alternatives(&name, self.registry.filter_names()));
                    return Err(err);
                };
                self.features.filters.insert(name.clone());
                let args = self.positional_arguments(node, &format!("filter \"{name}\""))?;
                Expr::Filter {
                    name,
                    input: Box::new(self.expr(self.child(node, "node")?, filter.lenient)?),
                    args,
                    line,
                }
            }
            NodeType::Test => {
                let name = node.str_attr("name").unwrap_or_default().to_string();
                let Some(test) = self.registry.test(&name) else {
                    let mut err = self.runtime(format!("Unknown \"{name}\" test."), node);
                    suggest(&mut err, &alternatives(&name, self.registry.test_names()));
                    return Err(err);
                };
                let args = self.positional_arguments(node, &format!("test \"{name}\""))?;
                Expr::Test {
                    name,
                    input: Box::new(self.expr(self.child(node, "node")?, test.lenient)?),
                    args,
                    line,
                }
            }
            NodeType::GetAttr => {
                let kind = match node.str_attr("kind") {
                    Some("array") => AttrKind::Array,
                    Some("method") => AttrKind::Method,
                    _ => AttrKind::Any,
                };
                let args = match node.child("arguments") {
                    Some(arguments) if arguments.ty == NodeType::Arguments => {
                        self.positional_arguments(node, "method call")?
                    }
                    // `attribute(obj, key, [args])`
                    Some(arguments) if arguments.ty == NodeType::Array => arguments
                        .nodes()
                        .map(|arg| self.expr(arg, false))
                        .collect::<Result<Vec<_>>>()?,
                    Some(arguments) => vec![self.expr(arguments, false)?],
                    None => Vec::new(),
                };
                Expr::GetAttr {
                    object: Box::new(self.expr(self.child(node, "node")?, lenient)?),
                    key: Box::new(self.expr(self.child(node, "attribute")?, false)?),
                    args,
                    kind,
                    lenient,
                    line,
                }
            }
            NodeType::FunctionCall => self.function_call(node)?,
            NodeType::MacroCall => {
                let template = node.str_attr("template").unwrap_or_default();
                let target = match template {
                    "_self" => MacroTarget::SelfRef,
                    alias => MacroTarget::Alias(alias.to_string()),
                };
                let mut args = Vec::new();
                let mut named = Vec::new();
                for (key, value) in self.child(node, "arguments")?.children() {
                    let value = self.expr(value, false)?;
                    if key.parse::<usize>().is_ok() {
                        args.push(value);
                    } else {
                        named.push((key.to_string(), value));
                    }
                }
                Expr::MacroCall {
                    target,
                    name: node.str_attr("name").unwrap_or_default().to_string(),
                    args,
                    named,
                    line,
                }
            }
            NodeType::BlockFunction => Expr::BlockCall {
                name: Box::new(self.expr(self.child(node, "name")?, false)?),
                template: match node.child("template") {
                    Some(template) => Some(Box::new(self.expr(template, false)?)),
                    None => None,
                },
                line,
            },
            NodeType::ParentFunction => Expr::ParentCall {
                block: node.str_attr("name").unwrap_or_default().to_string(),
                line,
            },
            other => {
                return Err(self.internal(&format!("unexpected {other:?} node in an expression"), node));
            }
        })
    }

    fn function_call(&mut self, node: &Node) -> Result<Expr> {
        let name = node.str_attr("name").unwrap_or_default().to_string();
        let line = node.line;
        let Some(function) = self.registry.function(&name) else {
            let mut err = self.runtime(format!("Unknown \"{name}\" function."), node);
            suggest(&mut err, &alternatives(&name, self.registry.function_names()));
            return Err(err);
        };
        self.features.functions.insert(name.clone());

        match function {
            Function::Native(_) => {
                let args = self.positional_arguments(node, &format!("function \"{name}\""))?;
                Ok(Expr::Function { name, args, line })
            }
            Function::Include => {
                let mut slots = self.bind_arguments(
                    node,
                    &name,
                    &["template", "variables", "with_context", "ignore_missing", "sandboxed"],
                )?;
                let template = slots[0]
                    .take()
                    .ok_or_else(|| self.runtime("The \"include\" function needs a template.".to_string(), node))?;
                Ok(Expr::Include {
                    template: Box::new(template),
                    variables: slots[1].take().map(Box::new),
                    with_context: slots[2].take().map(Box::new),
                    ignore_missing: slots[3].take().map(Box::new),
                    sandboxed: slots[4].take().map(Box::new),
                    line,
                })
            }
            Function::TemplateFromString => {
                let mut slots = self.bind_arguments(node, &name, &["template", "name"])?;
                let code = slots[0].take().ok_or_else(|| {
                    self.runtime("The \"template_from_string\" function needs a template.".to_string(), node)
                })?;
                Ok(Expr::TemplateFromString {
                    code: Box::new(code),
                    name: slots[1].take().map(Box::new),
                    line,
                })
            }
        }
    }

    /// Maps positional and named arguments onto known parameter names.
    fn bind_arguments(&mut self, node: &Node, function: &str, params: &[&str]) -> Result<Vec<Option<Expr>>> {
        let mut slots: Vec<Option<Expr>> = params.iter().map(|_| None).collect();
        let Some(arguments) = node.child("arguments") else {
            return Ok(slots);
        };
        for (key, value) in arguments.children() {
            let index = match key.parse::<usize>() {
                Ok(index) => index,
                Err(_) => params.iter().position(|p| *p == key).ok_or_else(|| {
                    self.runtime(
                        format!("Unknown argument \"{key}\" for function \"{function}\"."),
                        node,
                    )
                })?,
            };
            if index >= slots.len() {
                return Err(self.runtime(format!("Too many arguments for function \"{function}\"."), node));
            }
            slots[index] = Some(self.expr(value, false)?);
        }
        Ok(slots)
    }

    fn positional_arguments(&mut self, node: &Node, callable: &str) -> Result<Vec<Expr>> {
        let Some(arguments) = node.child("arguments") else {
            return Ok(Vec::new());
        };
        let mut args = Vec::new();
        for (key, value) in arguments.children() {
            if key.parse::<usize>().is_err() {
                return Err(self.runtime(
                    format!("Named arguments are not supported for {callable}."),
                    node,
                ));
            }
            args.push(self.expr(value, false)?);
        }
        Ok(args)
    }

    fn child<'n>(&self, node: &'n Node, key: &str) -> Result<&'n Node> {
        node.child(key)
            .ok_or_else(|| self.internal(&format!("{:?} node without a \"{key}\" child", node.ty), node))
    }

    fn runtime(&self, message: String, node: &Node) -> Error {
        Error::runtime(message).located(node.line, self.source)
    }

    fn internal(&self, message: &str, node: &Node) -> Error {
        Error::internal(format!("Compiler received an invalid tree: {message}."))
            .with_line(node.line)
            .with_source(self.source)
    }
}

fn constant_value(attr: Option<&Attr>) -> Value {
    match attr {
        None | Some(Attr::Null) => Value::Null,
        Some(Attr::Bool(b)) => Value::Bool(*b),
        Some(Attr::Int(i)) => Value::Int(*i),
        Some(Attr::Float(f)) => Value::Float(*f),
        Some(Attr::Str(s)) => Value::String(s.clone()),
        Some(Attr::Strs(items)) => Value::Array(items.iter().map(|s| Value::String(s.clone())).collect()),
    }
}
