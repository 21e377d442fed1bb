//! One handler per tag. Each starts right after the tag name and consumes
//! everything up to and including the closing `%}` of its end tag.

use indexmap::IndexMap;

use crate::ast::{Attr, Module, Node, NodeType};
use crate::error::Result;
use crate::lexer::{Token, TokenKind};
use crate::registry::Tag;

use super::{Imported, ModuleState, Parser, Until};

impl<'a> Parser<'a> {
    pub(super) fn parse_tag(&mut self, tag: Tag, token: &Token) -> Result<Option<Node>> {
        match tag {
            Tag::If => self.parse_if(token).map(Some),
            Tag::For => self.parse_for(token).map(Some),
            Tag::Set => self.parse_set(token).map(Some),
            Tag::Block => self.parse_block(token).map(Some),
            Tag::Extends => self.parse_extends(token).map(|_| None),
            Tag::Use => self.parse_use(token).map(|_| None),
            Tag::Embed => self.parse_embed(token).map(Some),
            Tag::Macro => self.parse_macro(token).map(|_| None),
            Tag::Import => self.parse_import(token).map(Some),
            Tag::From => self.parse_from(token).map(Some),
            Tag::Include => self.parse_include(token).map(Some),
            Tag::Sandbox => self.parse_sandbox(token).map(Some),
            Tag::With => self.parse_with(token).map(Some),
            Tag::Apply => self.parse_apply(token).map(Some),
            Tag::Do => self.parse_do(token).map(Some),
            Tag::AutoEscape => self.parse_autoescape(token).map(Some),
        }
    }

    fn end_of_tag(&mut self) -> Result<()> {
        self.stream.expect(TokenKind::BlockEnd, None, None)?;
        Ok(())
    }

    /// Consumes `{% <name> %}` after a body, the name already being current.
    fn end_of_body(&mut self) -> Result<Token> {
        let name = self.stream.next();
        self.end_of_tag()?;
        Ok(name)
    }

    fn parse_if(&mut self, token: &Token) -> Result<Node> {
        let mut tests = Node::new(NodeType::Body, token.line, token.column);
        let mut node = Node::new(NodeType::If, token.line, token.column);

        let condition = self.parse_expression(0)?;
        self.end_of_tag()?;
        let until = ["elseif", "elif", "else", "endif"];
        let body = self.subparse(Some(Until { names: &until, tag: "if", line: token.line }))?;
        tests.push(condition);
        tests.push(body);

        loop {
            let end = self.stream.next();
            match end.value.as_str() {
                "else" => {
                    self.end_of_tag()?;
                    let otherwise =
                        self.subparse(Some(Until { names: &["endif"], tag: "if", line: token.line }))?;
                    node.set_child("else", otherwise);
                }
                "elseif" | "elif" => {
                    let condition = self.parse_expression(0)?;
                    self.end_of_tag()?;
                    let body = self.subparse(Some(Until { names: &until, tag: "if", line: token.line }))?;
                    tests.push(condition);
                    tests.push(body);
                }
                "endif" => {
                    self.end_of_tag()?;
                    break;
                }
                other => {
                    return Err(self.error_at(format!("Unexpected \"{other}\" tag."), &end));
                }
            }
        }

        Ok(node.with_child("tests", tests))
    }

    fn parse_for(&mut self, token: &Token) -> Result<Node> {
        let mut targets = self.parse_assignment_expression()?;
        self.stream.expect(TokenKind::Operator, Some("in"), None)?;
        let seq = self.parse_expression(0)?;
        self.end_of_tag()?;

        let until = ["else", "endfor"];
        let body = self.subparse(Some(Until { names: &until, tag: "for", line: token.line }))?;
        let mut node = Node::new(NodeType::For, token.line, token.column)
            .with_child("seq", seq)
            .with_child("body", body);
        if self.end_of_body()?.value == "else" {
            let otherwise = self.subparse(Some(Until { names: &["endfor"], tag: "for", line: token.line }))?;
            self.end_of_body()?;
            node.set_child("else", otherwise);
        }

        if targets.len() > 2 {
            return Err(self.error_at_node("Only two loop targets are allowed (key and value).", &targets[2]));
        }
        let value = targets.pop();
        let key = targets.pop();
        if let Some(key) = key {
            node.set_child("key_target", key);
        }
        if let Some(value) = value {
            node.set_child("value_target", value);
        }
        Ok(node)
    }

    fn parse_set(&mut self, token: &Token) -> Result<Node> {
        let targets = self.parse_assignment_expression()?;
        let names: Vec<String> = targets
            .iter()
            .filter_map(|t| t.str_attr("name").map(str::to_string))
            .collect();
        let node = Node::new(NodeType::Set, token.line, token.column).with_attr("names", names.clone());

        if self.stream.next_if(TokenKind::Operator, Some("=")).is_some() {
            let values = self.parse_multitarget_expression()?;
            self.end_of_tag()?;
            if names.len() != values.len() {
                return Err(self.error_at(
                    "When using set, you must have the same number of variables and assignments.",
                    token,
                ));
            }
            return Ok(node
                .with_attr("capture", false)
                .with_child("values", Node::list(NodeType::Body, values, token.line, token.column)));
        }

        if names.len() > 1 {
            return Err(self.error_at("When using set with a block, you cannot have a multi-target.", token));
        }
        self.end_of_tag()?;
        let body = self.subparse(Some(Until { names: &["endset"], tag: "set", line: token.line }))?;
        self.end_of_body()?;
        Ok(node.with_attr("capture", true).with_child("body", body))
    }

    fn parse_block(&mut self, token: &Token) -> Result<Node> {
        let name = self.stream.expect(TokenKind::Name, None, None)?;
        if let Some(existing) = self.state.blocks.get(&name.value) {
            return Err(self.error_at(
                format!("The block '{}' has already been defined line {}.", name.value, existing.line),
                &name,
            ));
        }
        // reserved up front so a nested block of the same name is rejected
        self.state.blocks.insert(
            name.value.clone(),
            Node::new(NodeType::Block, token.line, token.column).with_attr("name", name.value.as_str()),
        );
        self.state.block_stack.push(name.value.clone());
        self.push_import_scope();

        let body = if self.stream.next_if(TokenKind::BlockEnd, None).is_some() {
            let body = self.subparse(Some(Until { names: &["endblock"], tag: "block", line: token.line }))?;
            self.stream.next();
            if let Some(end_name) = self.stream.next_if(TokenKind::Name, None) {
                if end_name.value != name.value {
                    return Err(self.error_at(
                        format!(
                            "Expected endblock for block \"{}\" (but \"{}\" given).",
                            name.value, end_name.value
                        ),
                        &end_name,
                    ));
                }
            }
            self.end_of_tag()?;
            body
        } else {
            let expr = self.parse_expression(0)?;
            self.end_of_tag()?;
            let print = Node::new(NodeType::Print, expr.line, expr.column).with_child("expr", expr);
            Node::list(NodeType::Body, vec![print], token.line, token.column)
        };

        self.pop_import_scope();
        self.state.block_stack.pop();

        let block = Node::new(NodeType::Block, token.line, token.column)
            .with_attr("name", name.value.as_str())
            .with_child("body", body);
        self.state.blocks.insert(name.value.clone(), block);

        Ok(Node::new(NodeType::BlockReference, token.line, token.column).with_attr("name", name.value))
    }

    fn parse_extends(&mut self, token: &Token) -> Result<()> {
        if !self.state.block_stack.is_empty() {
            return Err(self.error_at("Cannot use \"extend\" in a block.", token));
        }
        if self.state.in_macro {
            return Err(self.error_at("Cannot use \"extend\" in a macro.", token));
        }
        if self.state.parent.is_some() {
            return Err(self.error_at("Multiple extends tags are forbidden.", token));
        }
        let parent = self.parse_expression(0)?;
        self.end_of_tag()?;
        self.state.parent = Some(parent);
        Ok(())
    }

    fn parse_use(&mut self, token: &Token) -> Result<()> {
        let template = self.parse_expression(0)?;
        if template.ty != NodeType::Constant || template.str_attr("value").is_none() {
            return Err(self.error_at(
                "The template references in a \"use\" statement must be a string.",
                token,
            ));
        }

        let mut targets = Node::new(NodeType::Body, token.line, token.column);
        if self.stream.next_if(TokenKind::Name, Some("with")).is_some() {
            loop {
                let name = self.stream.expect(TokenKind::Name, None, None)?;
                let mut alias = name.value.clone();
                if self.stream.next_if(TokenKind::Name, Some("as")).is_some() {
                    alias = self.stream.expect(TokenKind::Name, None, None)?.value;
                }
                targets.set_attr(&name.value, alias);
                if self.stream.next_if(TokenKind::Punctuation, Some(",")).is_none() {
                    break;
                }
            }
        }
        self.end_of_tag()?;

        self.state.traits.push(
            Node::new(NodeType::Use, token.line, token.column)
                .with_attr("tag", "use")
                .with_child("template", template)
                .with_child("targets", targets),
        );
        Ok(())
    }

    /// `ignore missing`, `with <expr>` and `only`, shared by include and embed.
    fn parse_include_options(&mut self, node: &mut Node) -> Result<()> {
        let mut ignore_missing = false;
        if self.stream.next_if(TokenKind::Name, Some("ignore")).is_some() {
            self.stream.expect(TokenKind::Name, Some("missing"), None)?;
            ignore_missing = true;
        }
        if self.stream.next_if(TokenKind::Name, Some("with")).is_some() {
            let variables = self.parse_expression(0)?;
            node.set_child("variables", variables);
        }
        let only = self.stream.next_if(TokenKind::Name, Some("only")).is_some();
        node.set_attr("ignore_missing", ignore_missing);
        node.set_attr("only", only);
        self.end_of_tag()
    }

    fn parse_include(&mut self, token: &Token) -> Result<Node> {
        let template = self.parse_expression(0)?;
        let mut node = Node::new(NodeType::Include, token.line, token.column).with_child("expr", template);
        self.parse_include_options(&mut node)?;
        Ok(node)
    }

    fn parse_embed(&mut self, token: &Token) -> Result<Node> {
        let parent = self.parse_expression(0)?;
        let mut node = Node::new(NodeType::Embed, token.line, token.column);
        self.parse_include_options(&mut node)?;

        let outer = std::mem::replace(
            &mut self.state,
            ModuleState {
                imported: vec![IndexMap::new()],
                parent: Some(parent),
                ..ModuleState::default()
            },
        );
        let parsed = self
            .subparse(Some(Until { names: &["endembed"], tag: "embed", line: token.line }))
            .and_then(|body| {
                self.stream.next();
                self.end_of_tag()?;
                self.finish_module(body)
            });
        self.state = outer;
        let mut module: Module = parsed?;
        module.node.set_attr("index", self.state.embedded.len());
        module.node.line = token.line;

        node.set_attr("index", self.state.embedded.len());
        self.state.embedded.push(module);
        Ok(node)
    }

    fn parse_macro(&mut self, token: &Token) -> Result<()> {
        let name = self.stream.expect(TokenKind::Name, None, None)?;
        let arguments = self.parse_arguments(true)?;
        self.end_of_tag()?;

        if let Some(existing) = self.state.macros.get(&name.value) {
            return Err(self.error_at(
                format!("The macro \"{}\" has already been defined line {}.", name.value, existing.line),
                &name,
            ));
        }

        let was_in_macro = std::mem::replace(&mut self.state.in_macro, true);
        self.push_import_scope();
        let body = self.subparse(Some(Until { names: &["endmacro"], tag: "macro", line: token.line }));
        self.pop_import_scope();
        self.state.in_macro = was_in_macro;
        let body = body?;

        self.stream.next();
        if let Some(end_name) = self.stream.next_if(TokenKind::Name, None) {
            if end_name.value != name.value {
                return Err(self.error_at(
                    format!(
                        "Expected endmacro for macro \"{}\" (but \"{}\" given).",
                        name.value, end_name.value
                    ),
                    &end_name,
                ));
            }
        }
        self.end_of_tag()?;

        let def = Node::new(NodeType::Macro, token.line, token.column)
            .with_attr("name", name.value.as_str())
            .with_attr("tag", "macro")
            .with_child("arguments", arguments)
            .with_child("body", body);
        self.state.macros.insert(name.value, def);
        Ok(())
    }

    fn parse_import(&mut self, token: &Token) -> Result<Node> {
        let template = self.parse_expression(0)?;
        self.stream.expect(TokenKind::Name, Some("as"), None)?;
        let alias = self.stream.expect(TokenKind::Name, None, None)?;
        self.end_of_tag()?;

        self.add_imported(&alias.value, Imported::Template);
        Ok(Node::new(NodeType::Import, token.line, token.column)
            .with_attr("var", alias.value)
            .with_attr("global", self.is_main_scope())
            .with_child("expr", template))
    }

    fn parse_from(&mut self, token: &Token) -> Result<Node> {
        let template = self.parse_expression(0)?;
        self.stream.expect(TokenKind::Name, Some("import"), None)?;

        let internal = format!("__internal_{}_{}", token.line, token.column);
        loop {
            let name = self.stream.expect(TokenKind::Name, None, None)?;
            let mut alias = name.value.clone();
            if self.stream.next_if(TokenKind::Name, Some("as")).is_some() {
                alias = self.stream.expect(TokenKind::Name, None, None)?.value;
            }
            self.add_imported(
                &alias,
                Imported::Macro {
                    template: internal.clone(),
                    name: name.value,
                },
            );
            if self.stream.next_if(TokenKind::Punctuation, Some(",")).is_none() {
                break;
            }
        }
        self.end_of_tag()?;

        Ok(Node::new(NodeType::Import, token.line, token.column)
            .with_attr("var", internal)
            .with_attr("global", self.is_main_scope())
            .with_child("expr", template))
    }

    fn parse_sandbox(&mut self, token: &Token) -> Result<Node> {
        self.end_of_tag()?;
        let body = self.subparse(Some(Until { names: &["endsandbox"], tag: "sandbox", line: token.line }))?;
        self.end_of_body()?;

        for node in body.nodes() {
            if node.ty != NodeType::Include && !node.is_blank_text() {
                return Err(self.error_at_node(
                    "Only \"include\" tags are allowed within a \"sandbox\" section.",
                    node,
                ));
            }
        }
        Ok(Node::new(NodeType::Sandbox, token.line, token.column).with_child("body", body))
    }

    fn parse_with(&mut self, token: &Token) -> Result<Node> {
        let mut node = Node::new(NodeType::With, token.line, token.column);
        if !self.stream.test(TokenKind::BlockEnd, None) && !self.stream.test(TokenKind::Name, Some("only")) {
            node.set_child("variables", self.parse_expression(0)?);
        }
        let only = self.stream.next_if(TokenKind::Name, Some("only")).is_some();
        self.end_of_tag()?;
        let body = self.subparse(Some(Until { names: &["endwith"], tag: "with", line: token.line }))?;
        self.end_of_body()?;
        Ok(node.with_attr("only", only).with_child("body", body))
    }

    /// `{% apply f|g %}body{% endapply %}` captures the body into a local
    /// and prints it through the filters.
    fn parse_apply(&mut self, token: &Token) -> Result<Node> {
        let local = format!("_apply_{}_{}", token.line, token.column);
        let reference = Node::new(NodeType::Name, token.line, token.column).with_attr("name", local.as_str());
        let filtered = self.parse_filter_expression_raw(reference)?;
        self.end_of_tag()?;
        let body = self.subparse(Some(Until { names: &["endapply"], tag: "apply", line: token.line }))?;
        self.end_of_body()?;

        let capture = Node::new(NodeType::Set, token.line, token.column)
            .with_attr("tag", "apply")
            .with_attr("names", vec![local])
            .with_attr("capture", true)
            .with_child("body", body);
        let print = Node::new(NodeType::Print, token.line, token.column).with_child("expr", filtered);
        Ok(Node::list(NodeType::Body, vec![capture, print], token.line, token.column))
    }

    fn parse_do(&mut self, token: &Token) -> Result<Node> {
        let expr = self.parse_expression(0)?;
        self.end_of_tag()?;
        Ok(Node::new(NodeType::Do, token.line, token.column).with_child("expr", expr))
    }

    fn parse_autoescape(&mut self, token: &Token) -> Result<Node> {
        let strategy = if self.stream.test(TokenKind::BlockEnd, None) {
            Attr::Str("html".to_string())
        } else {
            let expr = self.parse_expression(0)?;
            match expr.attr("value") {
                Some(Attr::Str(s)) if expr.ty == NodeType::Constant => Attr::Str(s.clone()),
                Some(Attr::Bool(false)) if expr.ty == NodeType::Constant => Attr::Bool(false),
                _ => {
                    return Err(self.error_at_node("An escaping strategy must be a string or false.", &expr));
                }
            }
        };
        self.end_of_tag()?;
        let body = self.subparse(Some(Until {
            names: &["endautoescape"],
            tag: "autoescape",
            line: token.line,
        }))?;
        self.end_of_body()?;
        Ok(Node::new(NodeType::AutoEscape, token.line, token.column)
            .with_attr("strategy", strategy)
            .with_child("body", body))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::parse_str;
    use crate::ast::NodeType;

    #[test]
    fn if_chain() {
        let module = parse_str("{% if a %}1{% elseif b %}2{% elif c %}3{% else %}4{% endif %}").unwrap();
        let node = module.body().unwrap().child("0").unwrap();
        assert_eq!(node.ty, NodeType::If);
        assert_eq!(node.child("tests").unwrap().len(), 6);
        assert!(node.has_child("else"));
        assert_eq!(node.str_attr("tag"), Some("if"));
    }

    #[test]
    fn for_with_key_and_else() {
        let module = parse_str("{% for k, v in items %}{{ k }}{% else %}none{% endfor %}").unwrap();
        let node = module.body().unwrap().child("0").unwrap();
        assert_eq!(node.child("key_target").unwrap().str_attr("name"), Some("k"));
        assert_eq!(node.child("value_target").unwrap().str_attr("name"), Some("v"));
        assert!(node.has_child("else"));
    }

    #[test]
    fn capture_set() {
        let module = parse_str("{% set x %}hello{% endset %}").unwrap();
        let node = module.body().unwrap().child("0").unwrap();
        assert!(node.bool_attr("capture"));
        let err = parse_str("{% set a, b %}x{% endset %}").unwrap_err();
        assert_eq!(err.raw_message(), "When using set with a block, you cannot have a multi-target.");
    }

    #[test]
    fn endblock_name_must_match() {
        let err = parse_str("{% block a %}{% endblock b %}").unwrap_err();
        assert_eq!(err.raw_message(), "Expected endblock for block \"a\" (but \"b\" given).");
    }

    #[test]
    fn use_requires_a_string() {
        let err = parse_str("{% use name %}").unwrap_err();
        assert_eq!(
            err.raw_message(),
            "The template references in a \"use\" statement must be a string."
        );
    }

    #[test]
    fn include_options() {
        let module = parse_str("{% include 'a' ignore missing with {x: 1} only %}").unwrap();
        let node = module.body().unwrap().child("0").unwrap();
        assert!(node.bool_attr("ignore_missing"));
        assert!(node.bool_attr("only"));
        assert!(node.has_child("variables"));
    }

    #[test]
    fn apply_desugars_to_capture_and_print() {
        let module = parse_str("{% apply upper %}hi{% endapply %}").unwrap();
        let node = module.body().unwrap().child("0").unwrap();
        assert_eq!(node.ty, NodeType::Body);
        assert_eq!(node.child("0").unwrap().ty, NodeType::Set);
        assert_eq!(node.child("1").unwrap().ty, NodeType::Print);
    }

    #[test]
    fn autoescape_strategy() {
        let err = parse_str("{% autoescape x %}{% endautoescape %}").unwrap_err();
        assert_eq!(err.raw_message(), "An escaping strategy must be a string or false.");
        assert!(parse_str("{% autoescape false %}{{ x }}{% endautoescape %}").is_ok());
    }

    #[test]
    fn macro_arguments() {
        let module = parse_str("{% macro input(name, value = '', type = 'text') %}{% endmacro input %}").unwrap();
        let def = module.macros().unwrap().child("input").unwrap();
        let names: Vec<&str> = def.child("arguments").unwrap().children().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["name", "value", "type"]);
    }

    #[test]
    fn unclosed_if() {
        let err = parse_str("{% if a %}\nx").unwrap_err();
        assert_eq!(
            err.raw_message(),
            "Unexpected end of template (expecting closing tag for the \"if\" tag defined near line 1)."
        );
    }
}
