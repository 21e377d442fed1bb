//! Loading, linking and caching templates.
//!
//! [`Environment`] owns the loader, the registry and the configuration. A
//! template is compiled once per environment and linked with the blocks of
//! the templates it `use`s; parents are resolved at render time because a
//! parent may be an expression.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock};

use indexmap::IndexMap;
use serde::Serialize;

use crate::ast::Module;
use crate::compiled::CompiledTemplate;
use crate::compiler::compile;
use crate::config::Config;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::eval;
use crate::lexer::tokenize;
use crate::loader::Loader;
use crate::parser::parse;
use crate::registry::Registry;
use crate::source::Source;
use crate::stream::TokenStream;

/// A block borrowed from another template through `use`.
#[derive(Debug, Clone)]
pub(crate) struct BlockRef {
    /// Name of the block inside `template`.
    pub(crate) name: String,
    pub(crate) template: Arc<LoadedTemplate>,
}

/// A compiled unit linked with its trait blocks.
#[derive(Debug)]
pub(crate) struct LoadedTemplate {
    pub(crate) unit: Arc<CompiledTemplate>,
    /// Full text, for error messages, whatever the compiled unit keeps.
    pub(crate) source: Source,
    /// Blocks provided by `use`, keyed by their name in this template.
    pub(crate) trait_blocks: IndexMap<String, BlockRef>,
    pub(crate) embedded: Vec<Arc<LoadedTemplate>>,
}

impl LoadedTemplate {
    pub(crate) fn name(&self) -> &str {
        self.unit.name()
    }

    /// Own blocks win over trait blocks.
    pub(crate) fn has_block(&self, name: &str) -> bool {
        self.unit.has_block(name) || self.trait_blocks.contains_key(name)
    }
}

pub struct Environment {
    loader: Box<dyn Loader>,
    registry: Registry,
    config: Config,
    cache: RwLock<HashMap<String, Arc<LoadedTemplate>>>,
}

impl Environment {
    pub fn new(loader: impl Loader + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            registry: Registry::default(),
            config: Config::default(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self.clear_cache();
        self
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self.clear_cache();
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn loader(&self) -> &dyn Loader {
        self.loader.as_ref()
    }

    /// Forgets every compiled template and the loader's remembered lookups.
    pub fn clear_cache(&self) {
        self.cache.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.loader.clear_cache();
    }

    pub fn tokenize(&self, source: &Source) -> Result<TokenStream> {
        tokenize(source, &self.registry)
    }

    pub fn parse(&self, stream: TokenStream) -> Result<Module> {
        parse(stream, &self.registry)
    }

    /// Runs the whole pipeline on one Source, without touching the cache.
    pub fn compile_source(&self, source: &Source) -> Result<CompiledTemplate> {
        let module = self.parse(self.tokenize(source)?)?;
        compile(&module, &self.registry, &self.config)
    }

    pub fn load(&self, name: &str) -> Result<Template<'_>> {
        Ok(Template {
            env: self,
            loaded: self.load_template(name, None)?,
        })
    }

    pub fn render(&self, name: &str, ctx: impl Serialize) -> Result<String> {
        self.load(name)?.render(ctx)
    }

    /// Compiles a template from a string. Without a name, one is derived
    /// from the code.
    pub fn create_template(&self, code: &str, name: Option<&str>) -> Result<Template<'_>> {
        Ok(Template {
            env: self,
            loaded: self.template_from_string(code, name)?,
        })
    }

    pub(crate) fn template_from_string(&self, code: &str, name: Option<&str>) -> Result<Arc<LoadedTemplate>> {
        let name = match name {
            Some(name) => name.to_string(),
            None => {
                let mut hasher = DefaultHasher::new();
                code.hash(&mut hasher);
                format!("__string_template__{:016x}", hasher.finish())
            }
        };
        self.link(Source::new(code, name, ""), &mut Vec::new())
    }

    pub(crate) fn load_template(&self, name: &str, from: Option<&Source>) -> Result<Arc<LoadedTemplate>> {
        self.load_template_in(name, from, &mut Vec::new())
    }

    /// `using` holds the templates whose traits are being linked, to catch
    /// `use` cycles.
    fn load_template_in(&self, name: &str, from: Option<&Source>, using: &mut Vec<String>) -> Result<Arc<LoadedTemplate>> {
        let key = self.loader.resolve(name, from)?;
        if let Some(hit) = self.cache.read().unwrap_or_else(PoisonError::into_inner).get(&key) {
            tracing::trace!(template = name, "template cache hit");
            return Ok(Arc::clone(hit));
        }

        if using.contains(&key) {
            let mut path: Vec<String> = using.iter().map(|k| format!("\"{k}\"")).collect();
            path.push(format!("\"{key}\""));
            return Err(Error::runtime(format!(
                "Circular trait usage detected: {}.",
                path.join(" -> ")
            )));
        }

        tracing::debug!(template = name, key = key.as_str(), "loading template");
        let source = self.loader.get_source_context(name, from)?;
        using.push(key.clone());
        let linked = self.link(source, using);
        using.pop();
        let linked = linked?;

        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::clone(&linked));
        Ok(linked)
    }

    fn link(&self, source: Source, using: &mut Vec<String>) -> Result<Arc<LoadedTemplate>> {
        let unit = Arc::new(self.compile_source(&source)?);
        self.link_unit(unit, source, using)
    }

    fn link_unit(&self, unit: Arc<CompiledTemplate>, source: Source, using: &mut Vec<String>) -> Result<Arc<LoadedTemplate>> {
        let trait_blocks = self.resolve_traits(&unit, &source, using)?;
        let embedded = unit
            .embedded
            .iter()
            .map(|embedded| self.link_unit(Arc::new(embedded.clone()), source.clone(), using))
            .collect::<Result<Vec<_>>>()?;
        Ok(Arc::new(LoadedTemplate {
            unit,
            source,
            trait_blocks,
            embedded,
        }))
    }

    /// Merges the blocks of every used template, later `use` statements
    /// winning over earlier ones.
    fn resolve_traits(
        &self,
        unit: &CompiledTemplate,
        source: &Source,
        using: &mut Vec<String>,
    ) -> Result<IndexMap<String, BlockRef>> {
        let mut merged = IndexMap::new();
        for used in unit.traits() {
            let donor = self
                .load_template_in(&used.template, Some(source), using)
                .map_err(|e| e.located(used.line, source))?;
            if !donor.unit.is_traitable() {
                return Err(Error::runtime(format!(
                    "Template \"{}\" cannot be used as a trait.",
                    used.template
                ))
                .located(used.line, source));
            }

            let mut blocks: IndexMap<String, BlockRef> = donor.trait_blocks.clone();
            for name in donor.unit.block_names() {
                blocks.insert(
                    name.to_string(),
                    BlockRef {
                        name: name.to_string(),
                        template: Arc::clone(&donor),
                    },
                );
            }

            for (original, alias) in &used.renames {
                let Some(block) = blocks.shift_remove(original) else {
                    return Err(Error::runtime(format!(
                        "Block \"{original}\" is not defined in trait \"{}\".",
                        used.template
                    ))
                    .located(used.line, source));
                };
                blocks.insert(alias.clone(), block);
            }

            tracing::debug!(
                template = unit.name(),
                used = used.template.as_str(),
                blocks = blocks.len(),
                "merged trait blocks"
            );
            merged.extend(blocks);
        }
        Ok(merged)
    }
}

/// A loaded template, ready to render.
#[derive(Clone)]
pub struct Template<'env> {
    env: &'env Environment,
    loaded: Arc<LoadedTemplate>,
}

impl std::fmt::Debug for Template<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Template").field("loaded", &self.loaded).finish_non_exhaustive()
    }
}

impl Template<'_> {
    pub fn name(&self) -> &str {
        self.loaded.name()
    }

    pub fn source(&self) -> &Source {
        &self.loaded.source
    }

    pub fn compiled(&self) -> &CompiledTemplate {
        &self.loaded.unit
    }

    /// Whether the template defines `name` itself or through `use`.
    pub fn has_block(&self, name: &str) -> bool {
        self.loaded.has_block(name)
    }

    pub fn render(&self, ctx: impl Serialize) -> Result<String> {
        eval::render(self.env, &self.loaded, Context::from_serialize(ctx)?)
    }

    /// Renders a single block, dispatched through the template's parents.
    pub fn render_block(&self, name: &str, ctx: impl Serialize) -> Result<String> {
        eval::render_block(self.env, &self.loaded, name, Context::from_serialize(ctx)?)
    }
}
