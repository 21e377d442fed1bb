//! shimmytwig: a Twig-style template compiler.
//!
//! Templates go through a fixed pipeline: the lexer turns text into tokens,
//! the parser builds a [`Module`] tree, and the compiler lowers that tree into
//! a [`CompiledTemplate`]: plain data that the renderer walks. An
//! [`Environment`] ties the pipeline to a [`Loader`] and caches what it
//! compiles.
//!
//! Supported:
//! - Block inheritance with `extends`, `block`, `parent()` and `block()`.
//! - Horizontal reuse with `use` (including `with a as b` renames) and
//!   `embed`.
//! - Macros with default arguments, `import`, `from ... import` and `_self`.
//! - `if`, `for` (with `loop` and `else`), `set`, `with`, `apply`, `do`,
//!   `include`, `sandbox`, `autoescape` and `verbatim`.
//! - Filters, functions, tests and operators from a [`Registry`].
//!
//! Whitespace semantics:
//! - `{{-`, `{%-`, `{#-` and their closing forms trim all adjacent
//!   whitespace; the `~` forms trim spaces and tabs only.
//! - A single newline right after `%}` or `#}` is dropped.
//! - `\r\n` and `\r` become `\n`.
//!
//! ```
//! use shimmytwig::{ArrayLoader, Environment};
//! use serde_json::json;
//!
//! let env = Environment::new(ArrayLoader::new([
//!     ("base.html", "<h1>{% block title %}Home{% endblock %}</h1>"),
//!     ("page.html", "{% extends 'base.html' %}{% block title %}{{ name }}{% endblock %}"),
//! ]));
//! let html = env.render("page.html", json!({"name": "<About>"})).unwrap();
//! assert_eq!(html, "<h1>&lt;About&gt;</h1>");
//! ```

pub mod ast;
pub mod builtins;
pub mod compiled;
pub mod compiler;
pub mod config;
pub mod context;
pub mod environment;
mod eval;
pub mod error;
pub mod lexer;
pub mod loader;
pub mod parser;
pub mod registry;
pub mod source;
pub mod stream;
pub mod value;

pub use ast::{Module, Node, NodeType};
pub use builtins::EscapeStrategy;
pub use compiled::CompiledTemplate;
pub use config::{Config, SecurityPolicy};
pub use context::Context;
pub use environment::{Environment, Template};
pub use error::{Diagnostic, Error, Result};
pub use loader::{validate_name, ArrayLoader, Loader};
pub use registry::Registry;
pub use source::Source;
pub use value::Value;

/// Renders a single template string against `ctx`.
///
/// The template cannot extend, include or import anything but itself.
pub fn render_template(code: &str, ctx: impl serde::Serialize) -> Result<String> {
    let env = Environment::new(ArrayLoader::default());
    env.create_template(code, None)?.render(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_a_string() {
        let out = render_template("Hello {{ name|upper }}!", json!({"name": "world"})).unwrap();
        assert_eq!(out, "Hello WORLD!");
    }

    #[test]
    fn newlines_after_tags_are_dropped() {
        let out = render_template("{% for i in 1..2 %}\n{{ i }}\n{% endfor %}\n", json!({})).unwrap();
        assert_eq!(out, "1\n2\n");
    }

    #[test]
    fn missing_includes_are_loader_errors() {
        let err = render_template("{% include 'nope.html' %}", json!({})).unwrap_err();
        assert!(matches!(err, Error::Loader(_)));
        assert_eq!(err.message(), "Template \"nope.html\" is not defined.");
    }
}
