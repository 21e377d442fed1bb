//! Precedence climbing over the registry's operator table.

use crate::ast::{Attr, Node, NodeType};
use crate::error::Result;
use crate::lexer::{Token, TokenKind};
use crate::registry::{Associativity, BinaryOp};

use super::{Imported, Parser};

impl<'a> Parser<'a> {
    pub(super) fn parse_expression(&mut self, precedence: u16) -> Result<Node> {
        let mut expr = self.get_primary()?;

        loop {
            let token = self.stream.current().clone();
            if token.kind != TokenKind::Operator {
                break;
            }
            let Some(operator) = self.registry.binary_operator(&token.value) else {
                break;
            };
            if operator.precedence < precedence {
                break;
            }
            self.stream.next();

            expr = match operator.op {
                BinaryOp::Is => self.parse_test_expression(expr, &token)?,
                BinaryOp::IsNot => {
                    let test = self.parse_test_expression(expr, &token)?;
                    Node::new(NodeType::Unary, token.line, token.column)
                        .with_attr("operator", "not")
                        .with_child("node", test)
                }
                _ => {
                    let next_precedence = match operator.associativity {
                        Associativity::Left => operator.precedence + 1,
                        Associativity::Right => operator.precedence,
                    };
                    let right = self.parse_expression(next_precedence)?;
                    Node::new(NodeType::Binary, token.line, token.column)
                        .with_attr("operator", token.value.as_str())
                        .with_child("left", expr)
                        .with_child("right", right)
                }
            };
        }

        if precedence == 0 {
            return self.parse_conditional_expression(expr);
        }
        Ok(expr)
    }

    fn get_primary(&mut self) -> Result<Node> {
        let token = self.stream.current().clone();

        if token.kind == TokenKind::Operator {
            if let Some(operator) = self.registry.unary_operator(&token.value) {
                self.stream.next();
                let operand = self.parse_expression(operator.precedence)?;
                return Ok(Node::new(NodeType::Unary, token.line, token.column)
                    .with_attr("operator", token.value.as_str())
                    .with_child("node", operand));
            }
        }

        if token.is(TokenKind::Punctuation, "(") {
            self.stream.next();
            let expr = self.parse_expression(0)?;
            self.stream.expect(
                TokenKind::Punctuation,
                Some(")"),
                Some("An opened parenthesis is not properly closed"),
            )?;
            return self.parse_postfix_expression(expr);
        }

        self.parse_primary_expression()
    }

    fn parse_conditional_expression(&mut self, mut expr: Node) -> Result<Node> {
        while self.stream.test(TokenKind::Punctuation, Some("?")) {
            let token = self.stream.next();
            let mut conditional = Node::new(NodeType::Conditional, token.line, token.column);

            if self.stream.next_if(TokenKind::Punctuation, Some(":")).is_some() {
                let otherwise = self.parse_expression(0)?;
                conditional.set_attr("elvis", true);
                expr = conditional.with_child("test", expr).with_child("else", otherwise);
                continue;
            }

            let then = self.parse_expression(0)?;
            let otherwise = if self.stream.next_if(TokenKind::Punctuation, Some(":")).is_some() {
                self.parse_expression(0)?
            } else {
                Node::constant("", token.line, token.column)
            };
            expr = conditional
                .with_child("test", expr)
                .with_child("then", then)
                .with_child("else", otherwise);
        }
        Ok(expr)
    }

    fn parse_primary_expression(&mut self) -> Result<Node> {
        let token = self.stream.current().clone();
        let (line, column) = (token.line, token.column);

        let node = match token.kind {
            TokenKind::Name => {
                self.stream.next();
                match token.value.as_str() {
                    "true" | "TRUE" => Node::constant(true, line, column),
                    "false" | "FALSE" => Node::constant(false, line, column),
                    "null" | "NULL" | "none" | "NONE" => Node::constant(Attr::Null, line, column),
                    _ if self.stream.test(TokenKind::Punctuation, Some("(")) => {
                        self.parse_function_call(&token)?
                    }
                    "_self" => Node::new(NodeType::TemplateReference, line, column),
                    name => Node::new(NodeType::Name, line, column).with_attr("name", name),
                }
            }
            TokenKind::Number => {
                self.stream.next();
                match token.value.parse::<i64>() {
                    Ok(i) => Node::constant(i, line, column),
                    Err(_) => match token.value.parse::<f64>() {
                        Ok(f) => Node::constant(f, line, column),
                        Err(_) => return Err(self.error_at(format!("Invalid number \"{}\".", token.value), &token)),
                    },
                }
            }
            TokenKind::String | TokenKind::InterpolationStart => self.parse_string_expression()?,
            TokenKind::Punctuation if token.value == "[" => self.parse_sequence_expression()?,
            TokenKind::Punctuation if token.value == "{" => self.parse_mapping_expression()?,
            _ => {
                let message = if token.value.is_empty() {
                    format!("Unexpected token \"{}\".", token.kind)
                } else {
                    format!("Unexpected token \"{}\" of value \"{}\".", token.kind, token.value)
                };
                return Err(self.error_at(message, &token));
            }
        };

        self.parse_postfix_expression(node)
    }

    fn parse_string_expression(&mut self) -> Result<Node> {
        let start = self.stream.current().clone();
        let mut parts = Vec::new();
        let mut next_can_be_string = true;

        loop {
            if next_can_be_string && self.stream.test(TokenKind::String, None) {
                let token = self.stream.next();
                parts.push(Node::constant(token.value, token.line, token.column));
                next_can_be_string = false;
            } else if self.stream.next_if(TokenKind::InterpolationStart, None).is_some() {
                parts.push(self.parse_expression(0)?);
                self.stream.expect(TokenKind::InterpolationEnd, None, None)?;
                next_can_be_string = true;
            } else {
                break;
            }
        }

        let mut parts = parts.into_iter();
        let Some(mut expr) = parts.next() else {
            return Ok(Node::constant("", start.line, start.column));
        };
        for part in parts {
            expr = Node::new(NodeType::Binary, start.line, start.column)
                .with_attr("operator", "~")
                .with_child("left", expr)
                .with_child("right", part);
        }
        Ok(expr)
    }

    fn parse_sequence_expression(&mut self) -> Result<Node> {
        let open = self.stream.expect(
            TokenKind::Punctuation,
            Some("["),
            Some("A sequence element was expected"),
        )?;
        let mut node = Node::new(NodeType::Array, open.line, open.column);
        let mut first = true;
        while !self.stream.test(TokenKind::Punctuation, Some("]")) {
            if !first {
                self.stream.expect(
                    TokenKind::Punctuation,
                    Some(","),
                    Some("A sequence element must be followed by a comma"),
                )?;
                // trailing comma
                if self.stream.test(TokenKind::Punctuation, Some("]")) {
                    break;
                }
            }
            first = false;
            node.push(self.parse_expression(0)?);
        }
        self.stream.expect(
            TokenKind::Punctuation,
            Some("]"),
            Some("An opened sequence is not properly closed"),
        )?;
        Ok(node)
    }

    fn parse_mapping_expression(&mut self) -> Result<Node> {
        let open = self.stream.expect(
            TokenKind::Punctuation,
            Some("{"),
            Some("A mapping element was expected"),
        )?;
        let mut node = Node::new(NodeType::Hash, open.line, open.column);
        let mut first = true;
        while !self.stream.test(TokenKind::Punctuation, Some("}")) {
            if !first {
                self.stream.expect(
                    TokenKind::Punctuation,
                    Some(","),
                    Some("A mapping value must be followed by a comma"),
                )?;
                if self.stream.test(TokenKind::Punctuation, Some("}")) {
                    break;
                }
            }
            first = false;

            let token = self.stream.current().clone();
            let key = match token.kind {
                TokenKind::String | TokenKind::Name => {
                    self.stream.next();
                    // `{ name }` is short for `{ name: name }`
                    if token.kind == TokenKind::Name
                        && (self.stream.test(TokenKind::Punctuation, Some(","))
                            || self.stream.test(TokenKind::Punctuation, Some("}")))
                    {
                        let value = Node::new(NodeType::Name, token.line, token.column)
                            .with_attr("name", token.value.as_str());
                        node.push(Node::constant(token.value, token.line, token.column));
                        node.push(value);
                        continue;
                    }
                    Node::constant(token.value, token.line, token.column)
                }
                TokenKind::Number => {
                    self.stream.next();
                    Node::constant(token.value, token.line, token.column)
                }
                TokenKind::Punctuation if token.value == "(" => self.parse_expression(0)?,
                _ => {
                    return Err(self.error_at(
                        format!(
                            "A mapping key must be a quoted string, a number, a name, or an expression enclosed in parentheses (unexpected token \"{}\" of value \"{}\".",
                            token.kind, token.value
                        ),
                        &token,
                    ));
                }
            };

            self.stream.expect(
                TokenKind::Punctuation,
                Some(":"),
                Some("A mapping key must be followed by a colon (:)"),
            )?;
            let value = self.parse_expression(0)?;
            node.push(key);
            node.push(value);
        }
        self.stream.expect(
            TokenKind::Punctuation,
            Some("}"),
            Some("An opened mapping is not properly closed"),
        )?;
        Ok(node)
    }

    pub(super) fn parse_postfix_expression(&mut self, mut node: Node) -> Result<Node> {
        loop {
            let token = self.stream.current().clone();
            if token.kind != TokenKind::Punctuation {
                break;
            }
            node = match token.value.as_str() {
                "." | "[" => self.parse_subscript_expression(node)?,
                "|" => self.parse_filter_expression(node)?,
                _ => break,
            };
        }
        Ok(node)
    }

    fn parse_function_call(&mut self, name: &Token) -> Result<Node> {
        let (line, column) = (name.line, name.column);
        match name.value.as_str() {
            "parent" => {
                self.parse_arguments(false)?;
                let Some(block) = self.state.block_stack.last().cloned() else {
                    return Err(self.error_at(
                        "Calling the \"parent\" function outside a block is forbidden.",
                        name,
                    ));
                };
                if self.state.parent.is_none() && self.state.traits.is_empty() {
                    return Err(self.error_at(
                        "Calling the \"parent\" function on a template that does not extend nor \"use\" another template is forbidden.",
                        name,
                    ));
                }
                Ok(Node::new(NodeType::ParentFunction, line, column).with_attr("name", block))
            }
            "block" => {
                let arguments = self.parse_arguments(false)?;
                let mut args = arguments.into_nodes();
                let Some(block) = args.next() else {
                    return Err(self.error_at("The \"block\" function takes one argument (the block name).", name));
                };
                let mut node = Node::new(NodeType::BlockFunction, line, column).with_child("name", block);
                if let Some(template) = args.next() {
                    node.set_child("template", template);
                }
                Ok(node)
            }
            "attribute" => {
                let arguments = self.parse_arguments(false)?;
                let mut args = arguments.into_nodes();
                let (Some(object), Some(attribute)) = (args.next(), args.next()) else {
                    return Err(self.error_at(
                        "The \"attribute\" function takes at least two arguments (the variable and the attributes).",
                        name,
                    ));
                };
                let mut node = Node::new(NodeType::GetAttr, line, column)
                    .with_attr("kind", "any")
                    .with_child("node", object)
                    .with_child("attribute", attribute);
                if let Some(arguments) = args.next() {
                    node.set_attr("kind", "method");
                    node.set_child("arguments", arguments);
                }
                Ok(node)
            }
            alias => {
                let arguments = self.parse_arguments(false)?;
                if let Some(Imported::Macro { template, name: macro_name }) = self.imported(alias).cloned() {
                    return Ok(Node::new(NodeType::MacroCall, line, column)
                        .with_attr("template", template)
                        .with_attr("name", macro_name)
                        .with_child("arguments", arguments));
                }
                Ok(Node::new(NodeType::FunctionCall, line, column)
                    .with_attr("name", alias)
                    .with_child("arguments", arguments))
            }
        }
    }

    fn parse_subscript_expression(&mut self, node: Node) -> Result<Node> {
        let token = self.stream.next();
        let (line, column) = (token.line, token.column);

        if token.value == "." {
            let attribute = self.stream.next();
            if attribute.kind != TokenKind::Name && attribute.kind != TokenKind::Number {
                return Err(self.error_at("Expected name or number.", &attribute));
            }

            let macro_target = match node.ty {
                NodeType::TemplateReference => Some("_self".to_string()),
                NodeType::Name => node
                    .str_attr("name")
                    .filter(|alias| self.imported(alias) == Some(&Imported::Template))
                    .map(str::to_string),
                _ => None,
            };
            if let Some(template) = macro_target {
                let arguments = if self.stream.test(TokenKind::Punctuation, Some("(")) {
                    self.parse_arguments(false)?
                } else {
                    Node::new(NodeType::Arguments, line, column)
                };
                return Ok(Node::new(NodeType::MacroCall, attribute.line, attribute.column)
                    .with_attr("template", template)
                    .with_attr("name", attribute.value.as_str())
                    .with_child("arguments", arguments));
            }

            let key = Node::constant(attribute.value.as_str(), attribute.line, attribute.column);
            let mut get = Node::new(NodeType::GetAttr, line, column)
                .with_attr("kind", "any")
                .with_child("node", node)
                .with_child("attribute", key);
            if self.stream.test(TokenKind::Punctuation, Some("(")) {
                get.set_attr("kind", "method");
                get.set_child("arguments", self.parse_arguments(false)?);
            }
            return Ok(get);
        }

        // `[` : item access or slice
        let start = if self.stream.test(TokenKind::Punctuation, Some(":")) {
            Node::constant(0i64, line, column)
        } else {
            self.parse_expression(0)?
        };
        let is_slice = self.stream.next_if(TokenKind::Punctuation, Some(":")).is_some();

        if is_slice {
            let length = if self.stream.test(TokenKind::Punctuation, Some("]")) {
                Node::constant(Attr::Null, line, column)
            } else {
                self.parse_expression(0)?
            };
            self.stream.expect(TokenKind::Punctuation, Some("]"), None)?;
            let arguments = Node::list(NodeType::Arguments, vec![start, length], line, column);
            return Ok(Node::new(NodeType::Filter, line, column)
                .with_attr("name", "slice")
                .with_child("node", node)
                .with_child("arguments", arguments));
        }

        self.stream.expect(TokenKind::Punctuation, Some("]"), None)?;
        Ok(Node::new(NodeType::GetAttr, line, column)
            .with_attr("kind", "array")
            .with_child("node", node)
            .with_child("attribute", start))
    }

    fn parse_filter_expression(&mut self, node: Node) -> Result<Node> {
        self.stream.next();
        self.parse_filter_expression_raw(node)
    }

    /// Parses `name(args)|name2...` applied to `node`; the leading `|` has
    /// already been consumed.
    pub(super) fn parse_filter_expression_raw(&mut self, mut node: Node) -> Result<Node> {
        loop {
            let name = self.stream.expect(TokenKind::Name, None, None)?;
            let arguments = if self.stream.test(TokenKind::Punctuation, Some("(")) {
                self.parse_arguments(false)?
            } else {
                Node::new(NodeType::Arguments, name.line, name.column)
            };
            node = Node::new(NodeType::Filter, name.line, name.column)
                .with_attr("name", name.value.as_str())
                .with_child("node", node)
                .with_child("arguments", arguments);

            if self.stream.next_if(TokenKind::Punctuation, Some("|")).is_none() {
                break;
            }
        }
        Ok(node)
    }

    fn parse_test_expression(&mut self, node: Node, operator: &Token) -> Result<Node> {
        let first = self.stream.expect(TokenKind::Name, None, Some("Expected a test name"))?;
        let mut name = first.value.clone();

        if self.registry.test(&name).is_none() && self.stream.test(TokenKind::Name, None) {
            let two_words = format!("{} {}", name, self.stream.current().value);
            if self.registry.test(&two_words).is_some() {
                self.stream.next();
                name = two_words;
            }
        }

        let arguments = if self.stream.test(TokenKind::Punctuation, Some("(")) {
            self.parse_arguments(false)?
        } else {
            Node::new(NodeType::Arguments, first.line, first.column)
        };

        Ok(Node::new(NodeType::Test, operator.line, operator.column)
            .with_attr("name", name)
            .with_child("node", node)
            .with_child("arguments", arguments))
    }

    /// `(a, b, name = c)`. In a macro definition every argument must be a
    /// name, optionally with a constant default.
    pub(super) fn parse_arguments(&mut self, definition: bool) -> Result<Node> {
        let open = self.stream.expect(
            TokenKind::Punctuation,
            Some("("),
            Some("A list of arguments must begin with an opening parenthesis"),
        )?;
        let mut arguments = Node::new(NodeType::Arguments, open.line, open.column);
        let mut named = false;

        while !self.stream.test(TokenKind::Punctuation, Some(")")) {
            if !arguments.is_empty() {
                self.stream.expect(
                    TokenKind::Punctuation,
                    Some(","),
                    Some("Arguments must be separated by a comma"),
                )?;
                if self.stream.test(TokenKind::Punctuation, Some(")")) {
                    break;
                }
            }

            if definition {
                let token = self.stream.expect(TokenKind::Name, None, Some("An argument must be a name"))?;
                if arguments.has_child(&token.value) {
                    return Err(self.error_at(
                        format!("The argument \"{}\" cannot be defined twice.", token.value),
                        &token,
                    ));
                }
                let default = if self.stream.next_if(TokenKind::Operator, Some("=")).is_some() {
                    let value = self.parse_expression(0)?;
                    if !is_constant_expression(&value) {
                        return Err(self.error_at_node(
                            "A default value for an argument must be a constant (a boolean, a string, a number, a sequence, or a mapping).",
                            &value,
                        ));
                    }
                    value
                } else {
                    Node::constant(Attr::Null, token.line, token.column)
                };
                arguments.set_child(&token.value, default);
                continue;
            }

            let current = self.stream.current().clone();
            if current.kind == TokenKind::Name && self.stream.look(1).is(TokenKind::Operator, "=") {
                if arguments.has_child(&current.value) {
                    return Err(self.error_at(format!("Argument \"{}\" is defined twice.", current.value), &current));
                }
                self.stream.next();
                self.stream.next();
                let value = self.parse_expression(0)?;
                arguments.set_child(&current.value, value);
                named = true;
                continue;
            }

            if named {
                return Err(self.error_at("Positional arguments cannot be used after named arguments.", &current));
            }
            arguments.push(self.parse_expression(0)?);
        }

        self.stream.expect(
            TokenKind::Punctuation,
            Some(")"),
            Some("A list of arguments must be closed by a parenthesis"),
        )?;
        Ok(arguments)
    }

    /// A name target for `set`, `for` and `import ... as`.
    pub(super) fn parse_assignment_expression(&mut self) -> Result<Vec<Node>> {
        let mut targets = Vec::new();
        loop {
            let token = self.stream.expect(
                TokenKind::Name,
                None,
                Some("Only variables can be assigned to"),
            )?;
            if matches!(token.value.as_str(), "true" | "false" | "none" | "null" | "_self" | "_context") {
                return Err(self.error_at(format!("You cannot assign a value to \"{}\".", token.value), &token));
            }
            targets.push(Node::new(NodeType::AssignName, token.line, token.column).with_attr("name", token.value));
            if self.stream.next_if(TokenKind::Punctuation, Some(",")).is_none() {
                break;
            }
        }
        Ok(targets)
    }

    pub(super) fn parse_multitarget_expression(&mut self) -> Result<Vec<Node>> {
        let mut targets = Vec::new();
        loop {
            targets.push(self.parse_expression(0)?);
            if self.stream.next_if(TokenKind::Punctuation, Some(",")).is_none() {
                break;
            }
        }
        Ok(targets)
    }
}

fn is_constant_expression(node: &Node) -> bool {
    match node.ty {
        NodeType::Constant => true,
        NodeType::Array | NodeType::Hash => node.nodes().all(is_constant_expression),
        NodeType::Unary => {
            matches!(node.str_attr("operator"), Some("-") | Some("+"))
                && node.child("node").is_some_and(is_constant_expression)
        }
        NodeType::Binary => node.str_attr("operator") == Some("~") && node.nodes().all(is_constant_expression),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::parse_str;
    use crate::ast::{Attr, Node, NodeType};

    fn expr(code: &str) -> Node {
        let module = parse_str(&format!("{{{{ {code} }}}}")).unwrap();
        module.body().unwrap().child("0").unwrap().child("expr").unwrap().clone()
    }

    #[test]
    fn literals() {
        assert_eq!(expr("42").attr("value"), Some(&Attr::Int(42)));
        assert_eq!(expr("4.5").attr("value"), Some(&Attr::Float(4.5)));
        assert_eq!(expr("none").attr("value"), Some(&Attr::Null));
        assert_eq!(expr("'x'").attr("value"), Some(&Attr::Str("x".into())));
    }

    #[test]
    fn ternaries() {
        let full = expr("a ? b : c");
        assert_eq!(full.ty, NodeType::Conditional);
        assert!(full.has_child("then"));
        let elvis = expr("a ?: c");
        assert!(elvis.bool_attr("elvis"));
        assert!(!elvis.has_child("then"));
        let short = expr("a ? b");
        assert_eq!(short.child("else").unwrap().attr("value"), Some(&Attr::Str(String::new())));
    }

    #[test]
    fn filters_chain_left_to_right() {
        let node = expr("name|lower|replace({'a': 'b'})");
        assert_eq!(node.str_attr("name"), Some("replace"));
        assert_eq!(node.child("node").unwrap().str_attr("name"), Some("lower"));
        assert_eq!(node.child("arguments").unwrap().len(), 1);
    }

    #[test]
    fn two_word_tests_and_negation() {
        let node = expr("x is not divisible by(3)");
        assert_eq!(node.ty, NodeType::Unary);
        let test = node.child("node").unwrap();
        assert_eq!(test.ty, NodeType::Test);
        assert_eq!(test.str_attr("name"), Some("divisible by"));
    }

    #[test]
    fn attribute_access() {
        let node = expr("a.b[c].d(1)");
        assert_eq!(node.str_attr("kind"), Some("method"));
        let inner = node.child("node").unwrap();
        assert_eq!(inner.str_attr("kind"), Some("array"));
    }

    #[test]
    fn slices() {
        let node = expr("a[1:2]");
        assert_eq!(node.ty, NodeType::Filter);
        assert_eq!(node.str_attr("name"), Some("slice"));
        let node = expr("a[:2]");
        assert_eq!(node.child("arguments").unwrap().child("0").unwrap().attr("value"), Some(&Attr::Int(0)));
        let node = expr("a[1:]");
        assert_eq!(node.child("arguments").unwrap().child("1").unwrap().attr("value"), Some(&Attr::Null));
    }

    #[test]
    fn named_arguments() {
        let node = expr("range(1, high=3)");
        let args = node.child("arguments").unwrap();
        assert!(args.has_child("0"));
        assert!(args.has_child("high"));

        let err = parse_str("{{ f(a=1, 2) }}").unwrap_err();
        assert_eq!(err.raw_message(), "Positional arguments cannot be used after named arguments.");
    }

    #[test]
    fn mapping_keys() {
        let node = expr("{ a: 1, 'b': 2, 3: 4, (c): 5, d }");
        assert_eq!(node.len(), 10);
        assert_eq!(node.child("9").unwrap().ty, NodeType::Name);
    }

    #[test]
    fn unary_binds_by_precedence() {
        let node = expr("not a and b");
        assert_eq!(node.str_attr("operator"), Some("and"));
        let node = expr("-2 ** 2");
        assert_eq!(node.str_attr("operator"), Some("**"));
    }

    #[test]
    fn null_coalescing() {
        let node = expr("a ?? b ?? c");
        assert_eq!(node.str_attr("operator"), Some("??"));
        assert_eq!(node.child("right").unwrap().str_attr("operator"), Some("??"));
    }

    #[test]
    fn macro_defaults_must_be_constant() {
        let err = parse_str("{% macro m(a = b) %}{% endmacro %}").unwrap_err();
        assert!(err.raw_message().starts_with("A default value for an argument must be a constant"));
    }
}
