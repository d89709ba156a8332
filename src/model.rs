use serde::{Deserialize, Serialize};
use std::fmt;

/// Note tags attached to nodes
pub mod notes {
    pub const EXTENSION_POINT: &str = "extension_point";
    pub const ALLOWS_CUSTOM_DATA: &str = "allows_custom_data";
    pub const EXTENSION_CHAIN_TRUNCATED: &str = "extension_chain_truncated";
    pub const CYCLE_DETECTED: &str = "cycle_detected";
    pub const RECURSION_TRUNCATED: &str = "recursion_truncated";
    pub const RECURSIVE_REFERENCE: &str = "recursive_reference";
    pub const UNRESOLVED_TYPE: &str = "unresolved_type";
    pub const UNRESOLVED_REFERENCE: &str = "unresolved_reference";
    pub const CHOICE: &str = "choice";

    pub fn inherits_from(depth: usize) -> String {
        format!("inherits_from_{}_types", depth)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Section,
    Field,
    Choice,
}

/// Upper occurrence bound of an element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MaxOccurs {
    Bounded(u32),
    Unbounded,
}

impl MaxOccurs {
    /// Parse an XSD `maxOccurs` attribute, falling back to 1 on junk
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("unbounded") {
            MaxOccurs::Unbounded
        } else {
            MaxOccurs::Bounded(raw.parse().unwrap_or(1))
        }
    }
}

impl Default for MaxOccurs {
    fn default() -> Self {
        MaxOccurs::Bounded(1)
    }
}

impl fmt::Display for MaxOccurs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaxOccurs::Bounded(n) => write!(f, "{}", n),
            MaxOccurs::Unbounded => f.write_str("unbounded"),
        }
    }
}

/// One position in the bounded tree
///
/// Nodes are immutable once a build completes and are shared between cache
/// tiers behind an `Arc`. `children` keeps declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaNode {
    pub path: String,
    pub name: String,
    pub kind: NodeKind,
    pub data_type: Option<String>,
    pub min_occurs: u32,
    pub max_occurs: MaxOccurs,
    pub enum_values: Vec<String>,
    pub notes: Vec<String>,
    pub description: Option<String>,
    pub children: Vec<SchemaNode>,
}

impl SchemaNode {
    pub fn new(path: impl Into<String>, name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            kind,
            data_type: None,
            min_occurs: 1,
            max_occurs: MaxOccurs::default(),
            enum_values: Vec::new(),
            notes: Vec::new(),
            description: None,
            children: Vec::new(),
        }
    }

    pub fn is_repeatable(&self) -> bool {
        match self.max_occurs {
            MaxOccurs::Unbounded => true,
            MaxOccurs::Bounded(n) => n > 1,
        }
    }

    pub fn has_note(&self, note: &str) -> bool {
        self.notes.iter().any(|n| n == note)
    }

    /// Add a note, keeping notes a set
    pub fn add_note(&mut self, note: impl Into<String>) {
        let note = note.into();
        if !self.has_note(&note) {
            self.notes.push(note);
        }
    }

    pub fn child(&self, name: &str) -> Option<&SchemaNode> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Pre-order traversal of this node and all descendants
    pub fn iter(&self) -> Iter<'_> {
        Iter { stack: vec![self] }
    }

    pub fn node_count(&self) -> usize {
        self.iter().count()
    }

    /// Find a descendant (or self) by its path
    pub fn find(&self, path: &str) -> Option<&SchemaNode> {
        let mut current = self;
        if current.path == path {
            return Some(current);
        }
        // Paths are prefix-structured, so only one child can lead to the target.
        'descend: loop {
            for child in &current.children {
                if child.path == path {
                    return Some(child);
                }
                if path.starts_with(&child.path)
                    && path.as_bytes().get(child.path.len()) == Some(&b'/')
                {
                    current = child;
                    continue 'descend;
                }
            }
            return None;
        }
    }

    /// Copy of this subtree keeping nodes down to `max_depth` levels below it
    ///
    /// Nodes at the cut-off depth keep their content but lose their children.
    pub fn pruned(&self, max_depth: usize) -> SchemaNode {
        let mut node = self.clone_shallow();
        if max_depth > 0 {
            node.children = self
                .children
                .iter()
                .map(|c| c.pruned(max_depth - 1))
                .collect();
        }
        node
    }

    fn clone_shallow(&self) -> SchemaNode {
        SchemaNode {
            path: self.path.clone(),
            name: self.name.clone(),
            kind: self.kind,
            data_type: self.data_type.clone(),
            min_occurs: self.min_occurs,
            max_occurs: self.max_occurs,
            enum_values: self.enum_values.clone(),
            notes: self.notes.clone(),
            description: self.description.clone(),
            children: Vec::new(),
        }
    }
}

/// Pre-order iterator over a node tree
pub struct Iter<'a> {
    stack: Vec<&'a SchemaNode>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a SchemaNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}
