//! The renderer.
//!
//! Rendering walks the instruction lists of a [`CompiledTemplate`]. Each
//! template, block and macro runs in its own [`Frame`], which records the
//! template whose instructions are running, the inheritance chain blocks are
//! dispatched through and the imports local to it. Imports made at the top
//! level of a template are bound as the body reaches them and are shared by
//! that template's blocks and macros for the rest of the render.
//!
//! A child template runs its body first (assignments and imports only), then
//! its parent is resolved against the resulting context and displayed in
//! turn; the root of the chain produces the output. Block lookups always
//! start at the most derived template.
//!
//! [`CompiledTemplate`]: crate::compiled::CompiledTemplate

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;
use regex::{Regex, RegexBuilder};

use crate::builtins::{integer_range, loop_variable};
use crate::compiled::{AttrKind, Expr, Instr, MacroTarget, ParentRef};
use crate::context::Context;
use crate::environment::{Environment, LoadedTemplate};
use crate::error::{Error, Result};
use crate::registry::{BinaryOp, Function, UnaryOp};
use crate::value::{TemplateRef, Value};

type Chain = Rc<Vec<Arc<LoadedTemplate>>>;

/// Imported templates by alias.
type Imports = IndexMap<String, Arc<LoadedTemplate>>;

/// Identity of a loaded template for the duration of one render.
fn identity(template: &Arc<LoadedTemplate>) -> usize {
    Arc::as_ptr(template) as usize
}

pub(crate) fn render(env: &Environment, template: &Arc<LoadedTemplate>, mut ctx: Context) -> Result<String> {
    tracing::trace!(template = template.name(), "rendering template");
    let mut out = String::new();
    Evaluator::new(env).display(template, &mut ctx, &mut out, false)?;
    Ok(out)
}

pub(crate) fn render_block(env: &Environment, template: &Arc<LoadedTemplate>, name: &str, ctx: Context) -> Result<String> {
    let evaluator = Evaluator::new(env);
    let chain = evaluator.resolve_chain(template, &ctx)?;
    let frame = Evaluator::bare_frame(template, Rc::new(chain), false);
    let mut out = String::new();
    evaluator.display_block(name, &frame, &ctx, &mut out, 0)?;
    Ok(out)
}

/// Where the running block was found, for `parent()`.
#[derive(Debug, Clone, Copy)]
enum BlockOrigin {
    /// Defined by the template at this index of the chain.
    Level(usize),
    /// Borrowed through `use`; `Frame::template` is the donor.
    Trait,
}

struct Frame {
    template: Arc<LoadedTemplate>,
    chain: Chain,
    block: Option<(String, BlockOrigin)>,
    /// Imports made inside the running block or macro.
    macros: Imports,
    sandboxed: bool,
    line: usize,
}

struct Evaluator<'env> {
    env: &'env Environment,
    /// Top-level imports of each template seen during the render.
    globals: RefCell<HashMap<usize, Imports>>,
}

impl<'env> Evaluator<'env> {
    fn new(env: &'env Environment) -> Self {
        Self {
            env,
            globals: RefCell::default(),
        }
    }

    fn strict(&self) -> bool {
        self.env.config().strict_variables
    }

    fn error(&self, frame: &Frame, line: usize, message: impl Into<String>) -> Error {
        let line = if line > 0 { line } else { frame.line };
        Error::runtime(message).located(line, &frame.template.source)
    }

    fn bare_frame(template: &Arc<LoadedTemplate>, chain: Chain, sandboxed: bool) -> Frame {
        Frame {
            template: Arc::clone(template),
            chain,
            block: None,
            macros: IndexMap::new(),
            sandboxed,
            line: 0,
        }
    }

    /// The top-level import `alias` of `template`.
    ///
    /// A template whose body has not run during this render, such as a macro
    /// library, gets its top-level assignments and imports evaluated once
    /// against an empty context.
    fn global_import(&self, template: &Arc<LoadedTemplate>, alias: &str) -> Result<Option<Arc<LoadedTemplate>>> {
        let id = identity(template);
        if !self.globals.borrow().contains_key(&id) {
            self.globals.borrow_mut().insert(id, Imports::new());
            let mut frame = Self::bare_frame(template, Rc::new(vec![Arc::clone(template)]), false);
            let mut ctx = Context::default();
            let mut discarded = String::new();
            for instr in &template.unit.body {
                if matches!(instr, Instr::Set { .. } | Instr::Import { global: true, .. }) {
                    self.exec_one(instr, &mut frame, &mut ctx, &mut discarded)?;
                }
            }
        }
        Ok(self.globals.borrow().get(&id).and_then(|imports| imports.get(alias)).cloned())
    }

    // Templates

    fn display(&self, template: &Arc<LoadedTemplate>, ctx: &mut Context, out: &mut String, sandboxed: bool) -> Result<()> {
        self.display_chain(template, ctx, out, sandboxed, false).map(|_| ())
    }

    /// Runs `template` and its ancestors. With `optional_parent`, a direct
    /// parent that cannot be loaded stops the render and `false` is returned.
    fn display_chain(
        &self,
        template: &Arc<LoadedTemplate>,
        ctx: &mut Context,
        out: &mut String,
        sandboxed: bool,
        optional_parent: bool,
    ) -> Result<bool> {
        let mut chain = vec![Arc::clone(template)];
        loop {
            let current = Arc::clone(&chain[chain.len() - 1]);
            if sandboxed {
                self.check_policy(&current)?;
            }
            self.globals.borrow_mut().entry(identity(&current)).or_default();
            let mut frame = Self::bare_frame(&current, Rc::new(chain.clone()), sandboxed);
            self.exec(&current.unit.body, &mut frame, ctx, out)?;

            let parent = match self.parent_of(&current, &frame, ctx) {
                Err(Error::Loader(_)) if optional_parent && chain.len() == 1 => return Ok(false),
                parent => parent?,
            };
            match parent {
                None => return Ok(true),
                Some(parent) => {
                    check_cycle(&chain, &parent)?;
                    tracing::debug!(template = current.name(), parent = parent.name(), "resolved parent");
                    chain.push(parent);
                }
            }
        }
    }

    /// The whole inheritance chain, most derived first, without running any
    /// body.
    fn resolve_chain(&self, template: &Arc<LoadedTemplate>, ctx: &Context) -> Result<Vec<Arc<LoadedTemplate>>> {
        let mut chain = vec![Arc::clone(template)];
        loop {
            let current = Arc::clone(&chain[chain.len() - 1]);
            let frame = Self::bare_frame(&current, Rc::new(Vec::new()), false);
            match self.parent_of(&current, &frame, ctx)? {
                None => return Ok(chain),
                Some(parent) => {
                    check_cycle(&chain, &parent)?;
                    chain.push(parent);
                }
            }
        }
    }

    fn parent_of(&self, template: &LoadedTemplate, frame: &Frame, ctx: &Context) -> Result<Option<Arc<LoadedTemplate>>> {
        match template.unit.parent() {
            ParentRef::None => Ok(None),
            ParentRef::Fixed(name) => self.env.load_template(name, Some(&template.source)).map(Some),
            ParentRef::Dynamic(expr) => {
                let value = self.eval(expr, frame, ctx)?;
                self.template_value(&value, frame, 0).map(Some)
            }
        }
    }

    fn check_policy(&self, template: &LoadedTemplate) -> Result<()> {
        let policy = &self.env.config().security_policy;
        let mut units = vec![template];
        units.extend(template.trait_blocks.values().map(|block| block.template.as_ref()));
        for unit in units {
            policy
                .check(&unit.unit.all_features())
                .map_err(|message| Error::runtime(message).with_source(&unit.source))?;
        }
        Ok(())
    }

    /// Turns a template name, a list of candidate names or a template value
    /// into a loaded template.
    fn template_value(&self, value: &Value, frame: &Frame, line: usize) -> Result<Arc<LoadedTemplate>> {
        let from = Some(&frame.template.source);
        match value {
            Value::Template(template) => Ok(Arc::clone(&template.0)),
            Value::String(name) | Value::Markup(name) => self.env.load_template(name, from),
            Value::Array(candidates) => {
                let mut names = Vec::new();
                for candidate in candidates {
                    match candidate {
                        Value::Template(template) => return Ok(Arc::clone(&template.0)),
                        Value::String(name) | Value::Markup(name) => {
                            if self.env.loader().exists(name, from) {
                                return self.env.load_template(name, from);
                            }
                            names.push(format!("\"{name}\""));
                        }
                        other => {
                            return Err(self.error(
                                frame,
                                line,
                                format!("A template name must be a string, got \"{}\".", other.type_name()),
                            ))
                        }
                    }
                }
                Err(Error::loader(format!(
                    "Unable to find one of the following templates: {}.",
                    names.join(", ")
                )))
            }
            other => Err(self.error(
                frame,
                line,
                format!("A template name must be a string, got \"{}\".", other.type_name()),
            )),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn include(
        &self,
        frame: &Frame,
        ctx: &Context,
        template: &Value,
        variables: Option<Value>,
        with_context: bool,
        ignore_missing: bool,
        sandboxed: bool,
        line: usize,
    ) -> Result<String> {
        let loaded = match self.template_value(template, frame, line) {
            Ok(loaded) => loaded,
            Err(Error::Loader(_)) if ignore_missing => return Ok(String::new()),
            Err(err) => return Err(err),
        };
        let mut vars = if with_context { ctx.flatten() } else { IndexMap::new() };
        vars.extend(self.variables(variables, frame, line, "include")?);

        let mut inner = Context::new(vars);
        let mut out = String::new();
        self.display(&loaded, &mut inner, &mut out, sandboxed)?;
        Ok(out)
    }

    fn variables(&self, value: Option<Value>, frame: &Frame, line: usize, tag: &str) -> Result<IndexMap<String, Value>> {
        match value {
            None | Some(Value::Undefined) | Some(Value::Null) => Ok(IndexMap::new()),
            Some(Value::Map(vars)) => Ok(vars),
            Some(other) => Err(self.error(
                frame,
                line,
                format!(
                    "Variables passed to the \"{tag}\" tag must be a mapping, got \"{}\".",
                    other.type_name()
                ),
            )),
        }
    }

    // Blocks

    /// Displays the most derived definition of `name`.
    fn display_block(&self, name: &str, frame: &Frame, ctx: &Context, out: &mut String, line: usize) -> Result<()> {
        let chain = Rc::clone(&frame.chain);
        for (level, template) in chain.iter().enumerate() {
            if template.unit.has_block(name) {
                return self.run_block(template, name, BlockOrigin::Level(level), frame, ctx, out);
            }
            if let Some(block) = template.trait_blocks.get(name) {
                return self.run_block(&block.template, &block.name, BlockOrigin::Trait, frame, ctx, out);
            }
        }
        Err(self.error(
            frame,
            line,
            format!("Block \"{name}\" on template \"{}\" does not exist.", frame.template.name()),
        ))
    }

    fn run_block(
        &self,
        template: &Arc<LoadedTemplate>,
        name: &str,
        origin: BlockOrigin,
        caller: &Frame,
        ctx: &Context,
        out: &mut String,
    ) -> Result<()> {
        let Some(instrs) = template.unit.blocks.get(name) else {
            return Err(Error::internal(format!(
                "Block \"{name}\" vanished from template \"{}\".",
                template.name()
            )));
        };
        let mut frame = Self::bare_frame(template, Rc::clone(&caller.chain), caller.sandboxed);
        frame.block = Some((name.to_string(), origin));
        // assignments inside a block stay inside it
        let mut ctx = ctx.clone();
        self.exec(instrs, &mut frame, &mut ctx, out)
    }

    fn parent_block(&self, frame: &Frame, ctx: &Context, line: usize) -> Result<String> {
        let Some((name, origin)) = &frame.block else {
            return Err(self.error(frame, line, "Calling the \"parent\" function outside a block is forbidden."));
        };
        let mut out = String::new();

        if let Some(block) = frame.template.trait_blocks.get(name) {
            self.run_block(&block.template, &block.name, BlockOrigin::Trait, frame, ctx, &mut out)?;
            return Ok(out);
        }

        let no_parent = || {
            self.error(
                frame,
                line,
                format!("The template has no parent and no traits defining the \"{name}\" block."),
            )
        };
        let level = match origin {
            BlockOrigin::Trait => return Err(no_parent()),
            BlockOrigin::Level(level) => *level,
        };
        let Some(parent) = frame.chain.get(level + 1) else {
            return Err(no_parent());
        };

        let chain = Rc::clone(&frame.chain);
        for (index, template) in chain.iter().enumerate().skip(level + 1) {
            if template.unit.has_block(name) {
                self.run_block(template, name, BlockOrigin::Level(index), frame, ctx, &mut out)?;
                return Ok(out);
            }
            if let Some(block) = template.trait_blocks.get(name) {
                self.run_block(&block.template, &block.name, BlockOrigin::Trait, frame, ctx, &mut out)?;
                return Ok(out);
            }
        }
        Err(self.error(
            frame,
            line,
            format!(
                "Block \"{name}\" should not call parent() in \"{}\" as the block does not exist in the parent template \"{}\".",
                frame.template.name(),
                parent.name()
            ),
        ))
    }

    // Macros

    fn call_macro(
        &self,
        template: &Arc<LoadedTemplate>,
        name: &str,
        args: Vec<Value>,
        named: Vec<(String, Value)>,
        caller: &Frame,
        line: usize,
    ) -> Result<Value> {
        let Some(definition) = template.unit.macros.get(name) else {
            return Err(self.error(
                caller,
                line,
                format!("Macro \"{name}\" is not defined in template \"{}\".", template.name()),
            ));
        };

        let mut frame = Self::bare_frame(template, Rc::new(vec![Arc::clone(template)]), caller.sandboxed);
        frame.line = definition.line;
        let empty = Context::default();
        let mut positional = args.into_iter();
        let mut named: IndexMap<String, Value> = named.into_iter().collect();
        let mut vars = IndexMap::new();
        for (param, default) in &definition.params {
            let value = match positional.next() {
                Some(value) => value,
                None => match named.shift_remove(param) {
                    Some(value) => value,
                    None => self.eval(default, &frame, &empty)?,
                },
            };
            vars.insert(param.clone(), value);
        }
        if let Some(unknown) = named.keys().next() {
            return Err(self.error(
                caller,
                line,
                format!("Macro \"{name}\" has no argument named \"{unknown}\"."),
            ));
        }
        vars.insert("varargs".to_string(), Value::Array(positional.collect()));

        let mut ctx = Context::new(vars);
        frame.line = 0;
        let mut out = String::new();
        self.exec(&definition.body, &mut frame, &mut ctx, &mut out)?;
        Ok(Value::Markup(out))
    }

    fn macro_template(&self, target: &MacroTarget, frame: &Frame, ctx: &Context, name: &str, line: usize) -> Result<Arc<LoadedTemplate>> {
        match target {
            MacroTarget::SelfRef => Ok(Arc::clone(&frame.template)),
            MacroTarget::Alias(alias) => {
                if let Some(template) = frame.macros.get(alias) {
                    return Ok(Arc::clone(template));
                }
                if let Some(template) = self.global_import(&frame.template, alias)? {
                    return Ok(template);
                }
                match ctx.get(alias) {
                    Some(Value::Template(template)) => Ok(Arc::clone(&template.0)),
                    _ => Err(self.error(
                        frame,
                        line,
                        format!("Macro \"{name}\" is not defined in template \"{alias}\"."),
                    )),
                }
            }
        }
    }

    // Statements

    fn exec(&self, instrs: &[Instr], frame: &mut Frame, ctx: &mut Context, out: &mut String) -> Result<()> {
        for instr in instrs {
            self.exec_one(instr, frame, ctx, out)?;
        }
        Ok(())
    }

    fn exec_one(&self, instr: &Instr, frame: &mut Frame, ctx: &mut Context, out: &mut String) -> Result<()> {
        match instr {
            Instr::Text(text) => out.push_str(text),
            Instr::Line(line) => frame.line = *line,
            Instr::Print { expr, escape, line } => {
                frame.line = *line;
                let value = self.eval(expr, frame, ctx)?;
                let text = value.render().map_err(|m| self.error(frame, *line, m))?;
                match escape {
                    Some(strategy) if !value.is_safe() => out.push_str(&strategy.escape(&text)),
                    _ => out.push_str(&text),
                }
            }
            Instr::If { branches, otherwise } => {
                for (condition, body) in branches {
                    if self.eval(condition, frame, ctx)?.is_truthy() {
                        return self.exec(body, frame, ctx, out);
                    }
                }
                self.exec(otherwise, frame, ctx, out)?;
            }
            Instr::For {
                key,
                value,
                seq,
                body,
                otherwise,
                line,
            } => {
                frame.line = *line;
                let items = self.eval(seq, frame, ctx)?.iter_pairs();
                if items.is_empty() {
                    return self.exec(otherwise, frame, ctx, out);
                }
                ctx.push(IndexMap::new());
                let result = self.exec_loop(items, key.as_deref(), value, body, frame, ctx, out);
                ctx.pop();
                result?;
            }
            Instr::Set { names, values } => {
                let values = values
                    .iter()
                    .map(|value| self.eval(value, frame, ctx))
                    .collect::<Result<Vec<_>>>()?;
                for (name, value) in names.iter().zip(values) {
                    ctx.set(name, value);
                }
            }
            Instr::Capture { name, body } => {
                let mut captured = String::new();
                self.exec(body, frame, ctx, &mut captured)?;
                ctx.set(name, Value::Markup(captured));
            }
            Instr::DisplayBlock { name, line } => {
                frame.line = *line;
                self.display_block(name, frame, ctx, out, *line)?;
            }
            Instr::Import {
                alias,
                template,
                global,
                line,
            } => {
                frame.line = *line;
                let value = self.eval(template, frame, ctx)?;
                let loaded = self.template_value(&value, frame, *line)?;
                if *global {
                    self.globals
                        .borrow_mut()
                        .entry(identity(&frame.template))
                        .or_default()
                        .insert(alias.clone(), loaded);
                } else {
                    frame.macros.insert(alias.clone(), loaded);
                }
            }
            Instr::Include {
                template,
                variables,
                only,
                ignore_missing,
                line,
            } => {
                frame.line = *line;
                let template = self.eval(template, frame, ctx)?;
                let variables = variables.as_ref().map(|v| self.eval(v, frame, ctx)).transpose()?;
                let output = self.include(
                    frame,
                    ctx,
                    &template,
                    variables,
                    !only,
                    *ignore_missing,
                    frame.sandboxed,
                    *line,
                )?;
                out.push_str(&output);
            }
            Instr::Embed {
                index,
                variables,
                only,
                ignore_missing,
                line,
            } => {
                frame.line = *line;
                let Some(embedded) = frame.template.embedded.get(*index).cloned() else {
                    return Err(Error::internal(format!(
                        "Embedded template {index} is missing from \"{}\".",
                        frame.template.name()
                    )));
                };
                let variables = variables.as_ref().map(|v| self.eval(v, frame, ctx)).transpose()?;
                let mut vars = if *only { IndexMap::new() } else { ctx.flatten() };
                vars.extend(self.variables(variables, frame, *line, "embed")?);

                let mut inner = Context::new(vars);
                let mut output = String::new();
                if self.display_chain(&embedded, &mut inner, &mut output, frame.sandboxed, *ignore_missing)? {
                    out.push_str(&output);
                }
            }
            Instr::With { variables, only, body } => {
                let value = variables.as_ref().map(|v| self.eval(v, frame, ctx)).transpose()?;
                let vars = self.variables(value, frame, 0, "with")?;
                if *only {
                    let mut inner = Context::new(vars);
                    self.exec(body, frame, &mut inner, out)?;
                } else {
                    ctx.push(vars);
                    let result = self.exec(body, frame, ctx, out);
                    ctx.pop();
                    result?;
                }
            }
            Instr::Do(expr) => {
                self.eval(expr, frame, ctx)?;
            }
            Instr::Sandbox(body) => {
                let was = frame.sandboxed;
                frame.sandboxed = true;
                let result = self.exec(body, frame, ctx, out);
                frame.sandboxed = was;
                result?;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn exec_loop(
        &self,
        items: Vec<(Value, Value)>,
        key: Option<&str>,
        value: &str,
        body: &[Instr],
        frame: &mut Frame,
        ctx: &mut Context,
        out: &mut String,
    ) -> Result<()> {
        let length = items.len();
        for (index, (item_key, item)) in items.into_iter().enumerate() {
            if let Some(key) = key {
                ctx.insert(key, item_key);
            }
            ctx.insert(value, item);
            ctx.insert("loop", loop_variable(index, length));
            self.exec(body, frame, ctx, out)?;
        }
        Ok(())
    }

    // Expressions

    fn eval_all(&self, exprs: &[Expr], frame: &Frame, ctx: &Context) -> Result<Vec<Value>> {
        exprs.iter().map(|expr| self.eval(expr, frame, ctx)).collect()
    }

    fn eval_flag(&self, expr: Option<&Expr>, default: bool, frame: &Frame, ctx: &Context) -> Result<bool> {
        match expr {
            Some(expr) => Ok(self.eval(expr, frame, ctx)?.is_truthy()),
            None => Ok(default),
        }
    }

    fn eval(&self, expr: &Expr, frame: &Frame, ctx: &Context) -> Result<Value> {
        match expr {
            Expr::Const(value) => Ok(value.clone()),
            Expr::Name { name, lenient, line } => match ctx.get(name) {
                Some(value) => Ok(value.clone()),
                None if self.strict() && !lenient => {
                    Err(self.error(frame, *line, format!("Variable \"{name}\" does not exist.")))
                }
                None => Ok(Value::Undefined),
            },
            Expr::SelfRef => Ok(Value::Template(TemplateRef(Arc::clone(&frame.template)))),
            Expr::Context => Ok(Value::Map(ctx.flatten())),
            Expr::Array(items) => self.eval_all(items, frame, ctx).map(Value::Array),
            Expr::Hash(pairs) => {
                let mut map = IndexMap::new();
                for (key, value) in pairs {
                    let key = self.eval(key, frame, ctx)?.to_string();
                    map.insert(key, self.eval(value, frame, ctx)?);
                }
                Ok(Value::Map(map))
            }
            Expr::Unary { op, expr, line } => {
                let value = self.eval(expr, frame, ctx)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
                    UnaryOp::Neg => value.neg(),
                    UnaryOp::Pos => value.pos(),
                }
                .map_err(|m| self.error(frame, *line, m))
            }
            Expr::Binary { op, left, right, line } => self.binary(*op, left, right, *line, frame, ctx),
            Expr::Conditional { test, then, otherwise } => {
                let value = self.eval(test, frame, ctx)?;
                match (value.is_truthy(), then) {
                    (true, Some(then)) => self.eval(then, frame, ctx),
                    (true, None) => Ok(value),
                    (false, _) => self.eval(otherwise, frame, ctx),
                }
            }
            Expr::Filter { name, input, args, line } => {
                let Some(filter) = self.env.registry().filter(name) else {
                    return Err(self.error(frame, *line, format!("Unknown \"{name}\" filter.")));
                };
                let input = self.eval(input, frame, ctx)?;
                let args = self.eval_all(args, frame, ctx)?;
                (filter.call)(&input, &args).map_err(|m| self.error(frame, *line, m))
            }
            Expr::Test { name, input, args, line } => {
                let Some(test) = self.env.registry().test(name) else {
                    return Err(self.error(frame, *line, format!("Unknown \"{name}\" test.")));
                };
                let input = self.eval(input, frame, ctx)?;
                let args = self.eval_all(args, frame, ctx)?;
                (test.call)(&input, &args)
                    .map(Value::Bool)
                    .map_err(|m| self.error(frame, *line, m))
            }
            Expr::GetAttr {
                object,
                key,
                args,
                kind,
                lenient,
                line,
            } => {
                let object = self.eval(object, frame, ctx)?;
                let key = self.eval(key, frame, ctx)?;
                if let (Value::Template(template), false) = (&object, *kind == AttrKind::Array) {
                    let args = self.eval_all(args, frame, ctx)?;
                    return self.call_macro(&template.0, &key.to_string(), args, Vec::new(), frame, *line);
                }
                if let Some(value) = object.get_item(&key) {
                    return Ok(value);
                }
                if *lenient || !self.strict() {
                    return Ok(Value::Undefined);
                }
                Err(self.error(frame, *line, missing_attribute(&object, &key, *kind)))
            }
            Expr::Function { name, args, line } => match self.env.registry().function(name) {
                Some(Function::Native(call)) => {
                    let args = self.eval_all(args, frame, ctx)?;
                    call(&args).map_err(|m| self.error(frame, *line, m))
                }
                _ => Err(self.error(frame, *line, format!("Unknown \"{name}\" function."))),
            },
            Expr::Include {
                template,
                variables,
                with_context,
                ignore_missing,
                sandboxed,
                line,
            } => {
                let template = self.eval(template, frame, ctx)?;
                let variables = variables.as_deref().map(|v| self.eval(v, frame, ctx)).transpose()?;
                let with_context = self.eval_flag(with_context.as_deref(), true, frame, ctx)?;
                let ignore_missing = self.eval_flag(ignore_missing.as_deref(), false, frame, ctx)?;
                let sandboxed = self.eval_flag(sandboxed.as_deref(), false, frame, ctx)? || frame.sandboxed;
                self.include(
                    frame,
                    ctx,
                    &template,
                    variables,
                    with_context,
                    ignore_missing,
                    sandboxed,
                    *line,
                )
                .map(Value::Markup)
            }
            Expr::TemplateFromString { code, name, line } => {
                let code = self.eval(code, frame, ctx)?.to_string();
                let name = match name {
                    Some(name) => match self.eval(name, frame, ctx)? {
                        value if value.is_none() => None,
                        value => Some(value.to_string()),
                    },
                    None => None,
                };
                self.env
                    .template_from_string(&code, name.as_deref())
                    .map(|template| Value::Template(TemplateRef(template)))
                    .map_err(|e| e.located(*line, &frame.template.source))
            }
            Expr::MacroCall {
                target,
                name,
                args,
                named,
                line,
            } => {
                let template = self.macro_template(target, frame, ctx, name, *line)?;
                let args = self.eval_all(args, frame, ctx)?;
                let named = named
                    .iter()
                    .map(|(key, value)| -> Result<(String, Value)> { Ok((key.clone(), self.eval(value, frame, ctx)?)) })
                    .collect::<Result<Vec<_>>>()?;
                self.call_macro(&template, name, args, named, frame, *line)
            }
            Expr::BlockCall { name, template, line } => {
                let name = self.eval(name, frame, ctx)?.to_string();
                let mut out = String::new();
                match template {
                    None => self.display_block(&name, frame, ctx, &mut out, *line)?,
                    Some(template) => {
                        let value = self.eval(template, frame, ctx)?;
                        let loaded = self.template_value(&value, frame, *line)?;
                        let chain = self.resolve_chain(&loaded, ctx)?;
                        let target = Self::bare_frame(&loaded, Rc::new(chain), frame.sandboxed);
                        self.display_block(&name, &target, ctx, &mut out, *line)?;
                    }
                }
                Ok(Value::Markup(out))
            }
            Expr::ParentCall { line, .. } => self.parent_block(frame, ctx, *line).map(Value::Markup),
        }
    }

    fn binary(&self, op: BinaryOp, left: &Expr, right: &Expr, line: usize, frame: &Frame, ctx: &Context) -> Result<Value> {
        match op {
            BinaryOp::And => {
                let left = self.eval(left, frame, ctx)?.is_truthy();
                return Ok(Value::Bool(left && self.eval(right, frame, ctx)?.is_truthy()));
            }
            BinaryOp::Or => {
                let left = self.eval(left, frame, ctx)?.is_truthy();
                return Ok(Value::Bool(left || self.eval(right, frame, ctx)?.is_truthy()));
            }
            BinaryOp::NullCoalesce => {
                let left = self.eval(left, frame, ctx)?;
                return if left.is_none() { self.eval(right, frame, ctx) } else { Ok(left) };
            }
            BinaryOp::Is | BinaryOp::IsNot => {
                return Err(Error::internal("Test operators reached the renderer as binary operators."));
            }
            _ => {}
        }

        let l = self.eval(left, frame, ctx)?;
        let r = self.eval(right, frame, ctx)?;
        let result = match op {
            BinaryOp::BitOr => l.bit_op(&r, "b-or", |a, b| a | b),
            BinaryOp::BitXor => l.bit_op(&r, "b-xor", |a, b| a ^ b),
            BinaryOp::BitAnd => l.bit_op(&r, "b-and", |a, b| a & b),
            BinaryOp::Eq => Ok(Value::Bool(l.loose_eq(&r))),
            BinaryOp::NotEq => Ok(Value::Bool(!l.loose_eq(&r))),
            BinaryOp::Spaceship => Ok(Value::Int(match l.compare(&r) {
                Some(Ordering::Less) => -1,
                Some(Ordering::Greater) => 1,
                _ => 0,
            })),
            BinaryOp::Lt => Ok(Value::Bool(l.compare(&r) == Some(Ordering::Less))),
            BinaryOp::Gt => Ok(Value::Bool(l.compare(&r) == Some(Ordering::Greater))),
            BinaryOp::Le => Ok(Value::Bool(matches!(
                l.compare(&r),
                Some(Ordering::Less | Ordering::Equal)
            ))),
            BinaryOp::Ge => Ok(Value::Bool(matches!(
                l.compare(&r),
                Some(Ordering::Greater | Ordering::Equal)
            ))),
            BinaryOp::In => Ok(Value::Bool(r.contains(&l))),
            BinaryOp::NotIn => Ok(Value::Bool(!r.contains(&l))),
            BinaryOp::Matches => pattern(&r.to_string()).map(|re| Value::Bool(re.is_match(&l.to_string()))),
            BinaryOp::StartsWith => Ok(Value::Bool(l.to_string().starts_with(&r.to_string()))),
            BinaryOp::EndsWith => Ok(Value::Bool(l.to_string().ends_with(&r.to_string()))),
            BinaryOp::Range => range(&l, &r),
            BinaryOp::Add => l.add(&r),
            BinaryOp::Sub => l.sub(&r),
            BinaryOp::Mul => l.mul(&r),
            BinaryOp::Div => l.div(&r),
            BinaryOp::FloorDiv => l.floor_div(&r),
            BinaryOp::Mod => l.rem(&r),
            BinaryOp::Pow => l.pow(&r),
            BinaryOp::Concat => Ok(Value::String(format!("{l}{r}"))),
            BinaryOp::And | BinaryOp::Or | BinaryOp::NullCoalesce | BinaryOp::Is | BinaryOp::IsNot => {
                return Err(Error::internal("Short-circuit operator evaluated eagerly."));
            }
        };
        result.map_err(|m| self.error(frame, line, m))
    }
}

fn check_cycle(chain: &[Arc<LoadedTemplate>], parent: &Arc<LoadedTemplate>) -> Result<()> {
    if !chain.iter().any(|t| t.name() == parent.name()) {
        return Ok(());
    }
    let mut names: Vec<String> = chain.iter().map(|t| format!("\"{}\"", t.name())).collect();
    names.push(format!("\"{}\"", parent.name()));
    let last = &chain[chain.len() - 1];
    Err(Error::runtime(format!("Circular inheritance detected: {}.", names.join(" -> "))).with_source(&last.source))
}

fn missing_attribute(object: &Value, key: &Value, kind: AttrKind) -> String {
    let keys = |pairs: Vec<(Value, Value)>| {
        pairs
            .into_iter()
            .map(|(k, _)| k.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };
    let what = if kind == AttrKind::Array { "a key" } else { "an attribute" };
    match object {
        Value::Map(_) => format!(
            "Key \"{key}\" for mapping with keys \"{}\" does not exist.",
            keys(object.iter_pairs())
        ),
        Value::Array(_) => format!(
            "Key \"{key}\" for sequence with keys \"{}\" does not exist.",
            keys(object.iter_pairs())
        ),
        Value::Undefined | Value::Null => {
            format!("Impossible to access {what} (\"{key}\") on a null variable.")
        }
        other => format!(
            "Impossible to access {what} (\"{key}\") on a {} variable (\"{other}\").",
            other.type_name()
        ),
    }
}

/// `a..b` over integers or single characters.
fn range(low: &Value, high: &Value) -> std::result::Result<Value, String> {
    if let (Some(low), Some(high)) = (low.as_i64(), high.as_i64()) {
        return Ok(Value::Array(integer_range(low, high, 1)));
    }
    let single = |value: &Value| {
        let text = value.as_str()?;
        let mut chars = text.chars();
        let first = chars.next()?;
        chars.next().is_none().then_some(first)
    };
    match (single(low), single(high)) {
        (Some(low), Some(high)) => {
            let (a, b) = (low as u32, high as u32);
            let codes: Vec<u32> = if a <= b { (a..=b).collect() } else { (b..=a).rev().collect() };
            Ok(Value::Array(
                codes
                    .into_iter()
                    .filter_map(char::from_u32)
                    .map(|c| Value::String(c.to_string()))
                    .collect(),
            ))
        }
        _ => Err(format!(
            "The range operator expects integers or single characters, got \"{}\" and \"{}\".",
            low.type_name(),
            high.type_name()
        )),
    }
}

/// Compiles a delimited pattern such as `/^a/i`.
fn pattern(source: &str) -> std::result::Result<Regex, String> {
    let Some(delimiter) = source.chars().next() else {
        return Err("Empty regular expression.".to_string());
    };
    let closing = match delimiter {
        '(' => ')',
        '{' => '}',
        '[' => ']',
        '<' => '>',
        other => other,
    };
    let body = &source[delimiter.len_utf8()..];
    let Some(end) = body.rfind(closing) else {
        return Err(format!("No ending delimiter \"{closing}\" found in \"{source}\"."));
    };

    let mut builder = RegexBuilder::new(&body[..end]);
    for flag in body[end + closing.len_utf8()..].chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            'u' => builder.unicode(true),
            other => return Err(format!("Unknown modifier \"{other}\" in \"{source}\".")),
        };
    }
    builder
        .build()
        .map_err(|e| format!("Invalid regular expression \"{source}\": {e}."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delimited_patterns() {
        assert!(pattern("/^ab/").unwrap().is_match("abc"));
        assert!(pattern("/^AB/i").unwrap().is_match("abc"));
        assert!(pattern("{a.c}s").unwrap().is_match("a\nc"));
        assert!(pattern("#x#").unwrap().is_match("yxy"));
        assert_eq!(
            pattern("/abc").unwrap_err(),
            "No ending delimiter \"/\" found in \"/abc\"."
        );
        assert!(pattern("/a/q").unwrap_err().starts_with("Unknown modifier \"q\""));
    }

    #[test]
    fn ranges() {
        assert_eq!(
            range(&Value::Int(1), &Value::Int(3)).unwrap(),
            Value::from(vec![1i64, 2, 3])
        );
        assert_eq!(
            range(&Value::Int(2), &Value::Int(0)).unwrap(),
            Value::from(vec![2i64, 1, 0])
        );
        assert_eq!(
            range(&Value::from("c"), &Value::from("a")).unwrap(),
            Value::from(vec!["c", "b", "a"])
        );
        assert!(range(&Value::from("ab"), &Value::from("c")).is_err());
    }

    #[test]
    fn missing_attribute_messages() {
        let map = Value::Map(IndexMap::from([("a".to_string(), Value::Int(1)), ("b".to_string(), Value::Int(2))]));
        assert_eq!(
            missing_attribute(&map, &Value::from("c"), AttrKind::Any),
            "Key \"c\" for mapping with keys \"a, b\" does not exist."
        );
        assert_eq!(
            missing_attribute(&Value::Null, &Value::from("c"), AttrKind::Array),
            "Impossible to access a key (\"c\") on a null variable."
        );
        assert_eq!(
            missing_attribute(&Value::Int(3), &Value::from("c"), AttrKind::Any),
            "Impossible to access an attribute (\"c\") on a integer variable (\"3\")."
        );
    }
}
