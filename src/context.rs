use indexmap::IndexMap;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::value::Value;

/// Variables visible while rendering, innermost scope last.
///
/// `for` and `with` push a scope; assignments update the nearest existing
/// binding, so a `set` inside a loop body changes a variable defined before
/// the loop.
#[derive(Debug, Clone, Default)]
pub struct Context {
    scopes: Vec<IndexMap<String, Value>>,
}

impl Context {
    pub fn new(vars: IndexMap<String, Value>) -> Self {
        Self { scopes: vec![vars] }
    }

    /// Builds a context from anything serializing to a JSON object.
    pub fn from_serialize(ctx: impl Serialize) -> Result<Self> {
        let json = serde_json::to_value(ctx)
            .map_err(|e| Error::runtime(format!("Unable to serialize the context: {e}.")))?;
        match json {
            serde_json::Value::Object(map) => Ok(Self::new(
                map.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
            )),
            serde_json::Value::Null => Ok(Self::default()),
            _ => Err(Error::runtime("Context must be a mapping.")),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn set(&mut self, name: &str, value: Value) {
        if let Some(slot) = self.scopes.iter_mut().rev().find_map(|scope| scope.get_mut(name)) {
            *slot = value;
            return;
        }
        self.insert(name, value);
    }

    /// Binds in the innermost scope, shadowing outer bindings.
    pub fn insert(&mut self, name: &str, value: Value) {
        if self.scopes.is_empty() {
            self.scopes.push(IndexMap::new());
        }
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), value);
        }
    }

    pub fn push(&mut self, vars: IndexMap<String, Value>) {
        self.scopes.push(vars);
    }

    pub fn pop(&mut self) {
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    /// All visible variables, inner bindings winning.
    pub fn flatten(&self) -> IndexMap<String, Value> {
        let mut all = IndexMap::new();
        for scope in &self.scopes {
            for (name, value) in scope {
                all.insert(name.clone(), value.clone());
            }
        }
        all
    }

    pub fn names(&self) -> Vec<String> {
        self.flatten().into_keys().collect()
    }
}
