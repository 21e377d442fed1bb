//! Template retrieval.
//!
//! The engine asks a [`Loader`] for template text by name; where the text
//! lives is up to the implementation. [`ArrayLoader`] keeps templates in
//! memory, which is all tests and string-based setups need.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::source::Source;

pub trait Loader: Send + Sync {
    /// Fetches the template called `name`. `from` is the template asking,
    /// when there is one.
    fn get_source_context(&self, name: &str, from: Option<&Source>) -> Result<Source>;

    fn exists(&self, name: &str, from: Option<&Source>) -> bool;

    /// Whether a unit compiled at `time` (seconds since the epoch) is still
    /// current.
    fn is_fresh(&self, name: &str, time: u64, from: Option<&Source>) -> Result<bool>;

    /// Canonical identity of `name`, used as the cache key.
    fn resolve(&self, name: &str, from: Option<&Source>) -> Result<String>;

    /// Drops whatever the loader remembers between lookups.
    fn clear_cache(&self) {}
}

/// Normalizes a template name and rejects names that contain NUL bytes or
/// climb above the root with `..`.
///
/// Both `/` and `\` separate segments, so `a\..\..\b` and `a/../../b` are
/// rejected alike.
pub fn validate_name(name: &str) -> Result<String> {
    if name.contains('\0') {
        return Err(Error::loader("A template name cannot contain NUL bytes."));
    }

    let mut level: i64 = 0;
    let mut segments = Vec::new();
    for segment in name.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                level -= 1;
                segments.pop();
            }
            other => {
                level += 1;
                segments.push(other);
            }
        }
        if level < 0 {
            return Err(Error::loader(format!(
                "Looks like you try to load a template outside configured directories ({name})."
            )));
        }
    }

    if segments.is_empty() {
        return Err(Error::loader("A template name cannot be empty."));
    }
    Ok(segments.join("/"))
}

/// Failed lookups an [`ArrayLoader`] keeps before starting over.
pub const MAX_CACHED_FAILURES: usize = 1024;

/// In-memory templates keyed by name.
///
/// Failed lookups are remembered per requested name, so asking twice for a
/// missing template validates the name once. Adding a template under that
/// name forgets the failure. At most [`MAX_CACHED_FAILURES`] names are
/// remembered.
#[derive(Debug, Default)]
pub struct ArrayLoader {
    templates: RwLock<IndexMap<String, String>>,
    errors: Mutex<HashMap<String, Error>>,
    validations: AtomicUsize,
}

impl ArrayLoader {
    pub fn new<N, C>(templates: impl IntoIterator<Item = (N, C)>) -> Self
    where
        N: Into<String>,
        C: Into<String>,
    {
        let loader = Self::default();
        for (name, code) in templates {
            loader.set_template(name, code);
        }
        loader
    }

    pub fn set_template(&self, name: impl Into<String>, code: impl Into<String>) {
        let name = name.into();
        let key = validate_name(&name).unwrap_or_else(|_| name.clone());
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|requested, _| requested != &name && validate_name(requested).ok().as_ref() != Some(&key));
        self.templates
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, code.into());
    }

    /// How many times a name has gone through validation.
    pub fn validations(&self) -> usize {
        self.validations.load(Ordering::Relaxed)
    }

    fn find(&self, name: &str) -> Result<(String, String)> {
        if let Some(err) = self.errors.lock().unwrap_or_else(PoisonError::into_inner).get(name) {
            return Err(err.clone());
        }

        self.validations.fetch_add(1, Ordering::Relaxed);
        let found = validate_name(name).and_then(|key| {
            self.templates
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&key)
                .map(|code| (key.clone(), code.clone()))
                .ok_or_else(|| Error::loader(format!("Template \"{name}\" is not defined.")))
        });

        if let Err(err) = &found {
            tracing::debug!(template = name, "caching failed template lookup");
            let mut errors = self.errors.lock().unwrap_or_else(PoisonError::into_inner);
            if errors.len() >= MAX_CACHED_FAILURES {
                errors.clear();
            }
            errors.insert(name.to_string(), err.clone());
        }
        found
    }
}

impl Loader for ArrayLoader {
    fn get_source_context(&self, name: &str, _from: Option<&Source>) -> Result<Source> {
        let (key, code) = self.find(name)?;
        Ok(Source::new(code, name, key))
    }

    fn exists(&self, name: &str, _from: Option<&Source>) -> bool {
        self.find(name).is_ok()
    }

    fn is_fresh(&self, name: &str, _time: u64, _from: Option<&Source>) -> Result<bool> {
        self.find(name).map(|_| true)
    }

    fn resolve(&self, name: &str, _from: Option<&Source>) -> Result<String> {
        self.find(name).map(|(key, _)| key)
    }

    fn clear_cache(&self) {
        self.errors.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}
