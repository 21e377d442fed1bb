use indexmap::IndexMap;

use crate::source::Source;

/// Kinds of nodes the parser produces. Expressions and statements share one
/// tree shape; the kind decides which attributes and children are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    // expressions
    Constant,
    Name,
    AssignName,
    TemplateReference,
    Array,
    Hash,
    Unary,
    Binary,
    Conditional,
    Filter,
    Test,
    GetAttr,
    FunctionCall,
    MacroCall,
    BlockFunction,
    ParentFunction,
    Arguments,

    // statements
    Module,
    Body,
    Text,
    Print,
    If,
    For,
    Set,
    Block,
    BlockReference,
    Macro,
    Import,
    Include,
    Embed,
    Use,
    Sandbox,
    With,
    Do,
    AutoEscape,
}

/// Non-child metadata attached to a node.
#[derive(Debug, Clone, PartialEq)]
pub enum Attr {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Strs(Vec<String>),
}

impl From<bool> for Attr {
    fn from(b: bool) -> Self {
        Attr::Bool(b)
    }
}

impl From<i64> for Attr {
    fn from(i: i64) -> Self {
        Attr::Int(i)
    }
}

impl From<usize> for Attr {
    fn from(i: usize) -> Self {
        Attr::Int(i as i64)
    }
}

impl From<f64> for Attr {
    fn from(f: f64) -> Self {
        Attr::Float(f)
    }
}

impl From<&str> for Attr {
    fn from(s: &str) -> Self {
        Attr::Str(s.to_string())
    }
}

impl From<String> for Attr {
    fn from(s: String) -> Self {
        Attr::Str(s)
    }
}

impl From<Vec<String>> for Attr {
    fn from(s: Vec<String>) -> Self {
        Attr::Strs(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub ty: NodeType,
    pub line: usize,
    pub column: usize,
    attributes: IndexMap<String, Attr>,
    children: IndexMap<String, Node>,
}

impl Node {
    pub fn new(ty: NodeType, line: usize, column: usize) -> Self {
        Self {
            ty,
            line,
            column,
            attributes: IndexMap::new(),
            children: IndexMap::new(),
        }
    }

    /// A node whose children are keyed `"0"`, `"1"`, ... in order.
    pub fn list(ty: NodeType, items: Vec<Node>, line: usize, column: usize) -> Self {
        let mut node = Self::new(ty, line, column);
        for item in items {
            node.push(item);
        }
        node
    }

    pub fn constant(value: impl Into<Attr>, line: usize, column: usize) -> Self {
        Self::new(NodeType::Constant, line, column).with_attr("value", value)
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<Attr>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn with_child(mut self, key: &str, node: Node) -> Self {
        self.set_child(key, node);
        self
    }

    pub fn set_attr(&mut self, key: &str, value: impl Into<Attr>) {
        self.attributes.insert(key.to_string(), value.into());
    }

    pub fn set_child(&mut self, key: &str, node: Node) {
        self.children.insert(key.to_string(), node);
    }

    /// Appends under the next numeric key.
    pub fn push(&mut self, node: Node) {
        let key = self.children.len().to_string();
        self.children.insert(key, node);
    }

    pub fn attr(&self, key: &str) -> Option<&Attr> {
        self.attributes.get(key)
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &Attr)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn str_attr(&self, key: &str) -> Option<&str> {
        match self.attributes.get(key) {
            Some(Attr::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn bool_attr(&self, key: &str) -> bool {
        matches!(self.attributes.get(key), Some(Attr::Bool(true)))
    }

    pub fn child(&self, key: &str) -> Option<&Node> {
        self.children.get(key)
    }

    pub fn child_mut(&mut self, key: &str) -> Option<&mut Node> {
        self.children.get_mut(key)
    }

    pub fn has_child(&self, key: &str) -> bool {
        self.children.contains_key(key)
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.children.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.children.values()
    }

    pub fn into_nodes(self) -> impl Iterator<Item = Node> {
        self.children.into_values()
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Pre-order walk over this node and all descendants.
    pub fn visit<F: FnMut(&Node)>(&self, f: &mut F) {
        f(self);
        for child in self.children.values() {
            child.visit(f);
        }
    }

    /// Post-order rewrite: children are transformed before their parent.
    pub fn transform<F: FnMut(Node) -> Node>(mut self, f: &mut F) -> Node {
        let children = std::mem::take(&mut self.children);
        self.children = children
            .into_iter()
            .map(|(key, child)| (key, child.transform(f)))
            .collect();
        f(self)
    }

    /// Whitespace-only text.
    pub fn is_blank_text(&self) -> bool {
        self.ty == NodeType::Text && self.str_attr("data").map_or(true, |d| d.trim().is_empty())
    }
}

/// The root of one parsed template.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub node: Node,
    pub source: Source,
    /// Anonymous child templates created by `embed`, indexed by position.
    pub embedded: Vec<Module>,
}

impl Module {
    pub fn body(&self) -> Option<&Node> {
        self.node.child("body")
    }

    pub fn parent(&self) -> Option<&Node> {
        self.node.child("parent")
    }

    pub fn blocks(&self) -> Option<&Node> {
        self.node.child("blocks")
    }

    pub fn macros(&self) -> Option<&Node> {
        self.node.child("macros")
    }

    pub fn traits(&self) -> Option<&Node> {
        self.node.child("traits")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(data: &str) -> Node {
        Node::new(NodeType::Text, 1, 1).with_attr("data", data)
    }

    #[test]
    fn list_keys_are_positional() {
        let body = Node::list(NodeType::Body, vec![text("a"), text("b")], 1, 1);
        let keys: Vec<&str> = body.children().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["0", "1"]);
        assert_eq!(body.child("1").and_then(|n| n.str_attr("data")), Some("b"));
    }

    #[test]
    fn visit_is_preorder() {
        let body = Node::list(NodeType::Body, vec![text("a"), text("b")], 1, 1);
        let mut seen = Vec::new();
        body.visit(&mut |n| seen.push(n.ty));
        assert_eq!(seen, vec![NodeType::Body, NodeType::Text, NodeType::Text]);
    }

    #[test]
    fn transform_rewrites_children_first() {
        let body = Node::list(NodeType::Body, vec![text("a"), text("b")], 1, 1);
        let mut order = Vec::new();
        let body = body.transform(&mut |mut n| {
            order.push(n.ty);
            if n.ty == NodeType::Text {
                let data = n.str_attr("data").unwrap_or("").to_uppercase();
                n.set_attr("data", data);
            }
            n
        });
        assert_eq!(order, vec![NodeType::Text, NodeType::Text, NodeType::Body]);
        assert_eq!(body.child("0").and_then(|n| n.str_attr("data")), Some("A"));
    }

    #[test]
    fn blank_text() {
        assert!(text(" \n\t").is_blank_text());
        assert!(!text(" x ").is_blank_text());
    }
}
