//! Recursive input sanitation for untrusted payloads.
//!
//! # Rules
//!
//! - Strings: drop C0 controls (`0x00..=0x1F`) and DEL (`0x7F`) except `\n`
//!   and `\t`, then truncate to `max_string_length` characters
//! - Arrays: sanitize each element one level deeper, order and length kept
//! - Objects: strip control characters from keys, sanitize values one level
//!   deeper
//! - Containers at `depth >= max_depth` are emitted empty; their children are
//!   pruned, not replaced with placeholders
//! - Numbers, booleans and null pass through
//!
//! JSON values are trees, so [`Sanitizer::sanitize`] cannot meet a cycle.
//! Payloads assembled from shared references are expressed as a
//! [`PayloadGraph`] arena, and [`Sanitizer::sanitize_graph`] rejects cyclic
//! graphs with [`SanitizeError::CycleDetected`] before lowering them to JSON.

use std::fmt;

use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Maximum characters kept from any string.
pub const DEFAULT_MAX_STRING_LENGTH: usize = 10_000;

/// Containers nested this deep are emptied.
pub const DEFAULT_MAX_DEPTH: usize = 5;

/// Limits applied by the [`Sanitizer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SanitizationPolicy {
    pub max_string_length: usize,
    pub max_depth: usize,
}

impl Default for SanitizationPolicy {
    fn default() -> Self {
        Self {
            max_string_length: DEFAULT_MAX_STRING_LENGTH,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// Index of a node inside a [`PayloadGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SanitizeError {
    #[error("payload graph contains a cycle through node {0}")]
    CycleDetected(NodeId),

    #[error("payload graph references missing node {0}")]
    DanglingNode(NodeId),
}

/// One value in a [`PayloadGraph`]. Containers refer to children by id, so a
/// node may be shared or even refer back to an ancestor.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Undefined,
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<NodeId>),
    Object(Vec<(String, NodeId)>),
}

/// Arena of payload nodes.
#[derive(Debug, Clone, Default)]
pub struct PayloadGraph {
    nodes: Vec<Node>,
}

impl PayloadGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    /// Overwrite an existing node; this is how back-references get wired up.
    pub fn replace(&mut self, id: NodeId, node: Node) -> Result<(), SanitizeError> {
        let slot = self
            .nodes
            .get_mut(id.0)
            .ok_or(SanitizeError::DanglingNode(id))?;
        *slot = node;
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Load a JSON tree, returning the graph and its root.
    pub fn from_json(value: &Value) -> (Self, NodeId) {
        let mut graph = Self::new();
        let root = graph.insert_json(value);
        (graph, root)
    }

    fn insert_json(&mut self, value: &Value) -> NodeId {
        let node = match value {
            Value::Null => Node::Null,
            Value::Bool(b) => Node::Bool(*b),
            Value::Number(n) => Node::Number(n.clone()),
            Value::String(s) => Node::String(s.clone()),
            Value::Array(items) => Node::Array(items.iter().map(|v| self.insert_json(v)).collect()),
            Value::Object(map) => Node::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.insert_json(v)))
                    .collect(),
            ),
        };
        self.insert(node)
    }

    fn child(&self, id: NodeId, index: usize) -> Option<NodeId> {
        match self.node(id)? {
            Node::Array(children) => children.get(index).copied(),
            Node::Object(entries) => entries.get(index).map(|(_, child)| *child),
            _ => None,
        }
    }

    /// Iterative three-colour DFS from `root`. Shared (diamond) references are
    /// fine; only a reference back to a node on the current path is a cycle.
    fn check_acyclic(&self, root: NodeId) -> Result<(), SanitizeError> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            Unvisited,
            OnPath,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let Some(root_mark) = marks.get_mut(root.0) else {
            return Err(SanitizeError::DanglingNode(root));
        };
        *root_mark = Mark::OnPath;

        let mut stack: Vec<(NodeId, usize)> = vec![(root, 0)];
        while let Some(&(id, next)) = stack.last() {
            let Some(child) = self.child(id, next) else {
                if let Some(mark) = marks.get_mut(id.0) {
                    *mark = Mark::Done;
                }
                stack.pop();
                continue;
            };

            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }

            match marks.get_mut(child.0) {
                None => return Err(SanitizeError::DanglingNode(child)),
                Some(Mark::OnPath) => return Err(SanitizeError::CycleDetected(child)),
                Some(Mark::Done) => {}
                Some(mark @ Mark::Unvisited) => {
                    *mark = Mark::OnPath;
                    stack.push((child, 0));
                }
            }
        }
        Ok(())
    }
}

/// Is `c` removed by the sanitizer?
pub fn is_stripped(c: char) -> bool {
    (c <= '\u{1f}' && c != '\n' && c != '\t') || c == '\u{7f}'
}

/// Strip control characters without truncating (used for object keys).
pub fn strip_controls(input: &str) -> String {
    input.chars().filter(|c| !is_stripped(*c)).collect()
}

/// Stateless sanitizer carrying its limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sanitizer {
    policy: SanitizationPolicy,
}

impl Sanitizer {
    pub fn new(policy: SanitizationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> SanitizationPolicy {
        self.policy
    }

    /// Strip control characters, then truncate to `max_string_length` chars.
    pub fn sanitize_string(&self, input: &str) -> String {
        input
            .chars()
            .filter(|c| !is_stripped(*c))
            .take(self.policy.max_string_length)
            .collect()
    }

    /// Sanitize a JSON value starting at depth 0.
    pub fn sanitize(&self, value: &Value) -> Value {
        self.sanitize_at(value, 0)
    }

    /// Sanitize a JSON value that sits `depth` levels below the payload root.
    pub fn sanitize_at(&self, value: &Value, depth: usize) -> Value {
        match value {
            Value::String(s) => Value::String(self.sanitize_string(s)),
            Value::Array(_) | Value::Object(_) if depth >= self.policy.max_depth => {
                empty_like(value)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.sanitize_at(item, depth + 1))
                    .collect(),
            ),
            // Keys equal after stripping collapse; the later one in key order wins.
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, item)| (strip_controls(key), self.sanitize_at(item, depth + 1)))
                    .collect(),
            ),
            Value::Null | Value::Bool(_) | Value::Number(_) => value.clone(),
        }
    }

    /// Sanitize a payload graph and lower it to JSON.
    ///
    /// `Undefined` object members are dropped and `Undefined` array elements
    /// become `null` so array length is preserved; an `Undefined` root lowers
    /// to `null`.
    ///
    /// # Errors
    ///
    /// - [`SanitizeError::CycleDetected`] if any node reachable from `root`
    ///   refers back to one of its ancestors
    /// - [`SanitizeError::DanglingNode`] if a reference points outside the arena
    pub fn sanitize_graph(
        &self,
        graph: &PayloadGraph,
        root: NodeId,
    ) -> Result<Value, SanitizeError> {
        graph.check_acyclic(root)?;
        Ok(self.lower(graph, root, 0)?.unwrap_or(Value::Null))
    }

    fn lower(
        &self,
        graph: &PayloadGraph,
        id: NodeId,
        depth: usize,
    ) -> Result<Option<Value>, SanitizeError> {
        let node = graph.node(id).ok_or(SanitizeError::DanglingNode(id))?;
        let value = match node {
            Node::Undefined => return Ok(None),
            Node::Null => Value::Null,
            Node::Bool(b) => Value::Bool(*b),
            Node::Number(n) => Value::Number(n.clone()),
            Node::String(s) => Value::String(self.sanitize_string(s)),
            Node::Array(_) if depth >= self.policy.max_depth => Value::Array(Vec::new()),
            Node::Object(_) if depth >= self.policy.max_depth => Value::Object(Map::new()),
            Node::Array(children) => Value::Array(
                children
                    .iter()
                    .map(|child| Ok(self.lower(graph, *child, depth + 1)?.unwrap_or(Value::Null)))
                    .collect::<Result<_, SanitizeError>>()?,
            ),
            Node::Object(entries) => {
                let mut map = Map::with_capacity(entries.len());
                for (key, child) in entries {
                    if let Some(item) = self.lower(graph, *child, depth + 1)? {
                        map.insert(strip_controls(key), item);
                    }
                }
                Value::Object(map)
            }
        };
        Ok(Some(value))
    }
}

fn empty_like(container: &Value) -> Value {
    match container {
        Value::Array(_) => Value::Array(Vec::new()),
        _ => Value::Object(Map::new()),
    }
}

/// Sanitize with the default policy.
pub fn sanitize(value: &Value) -> Value {
    Sanitizer::default().sanitize(value)
}
