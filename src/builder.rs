//! Depth-limited tree construction over a parsed schema.
//!
//! Inheritance is flattened: a derived type's node receives the particles of
//! its inlined ancestors (most-base first) followed by its own. Two limits
//! bound the output. The extension limit comes from the shared
//! [`ExtensionIndex`]; the recursion limit caps element nesting and is checked
//! first, so a node at the recursion limit is cut without consulting its
//! extension chain.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::config::ParserConfig;
use crate::error::{BuildIssue, Result, SchemaTreeError};
use crate::extension::{ExtensionChain, ExtensionIndex};
use crate::model::{NodeKind, SchemaNode, notes};
use crate::type_system::{
    ComplexType, Compositor, ElementDecl, InlineType, Particle, SimpleType, TypeRef, TypeSystem,
    local_name,
};

/// Name of the designated custom-data element
pub const EXTENSION_ELEMENT: &str = "extension";

/// A built tree plus the problems recovered while building it
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub root: SchemaNode,
    pub issues: Vec<BuildIssue>,
}

/// Shared flag that stops a build which nobody is waiting for anymore
#[derive(Debug, Clone, Default)]
pub struct BuildCancel(Arc<AtomicBool>);

impl BuildCancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

enum Content<'a> {
    Complex {
        complex: &'a ComplexType,
        origin: Option<&'a str>,
    },
    Simple(&'a SimpleType),
    Builtin(&'a str),
    Unresolved(&'a str),
    Untyped,
}

pub struct TreeBuilder<'a> {
    types: &'a TypeSystem,
    index: &'a ExtensionIndex,
    config: &'a ParserConfig,
    ref_memo: Option<HashMap<&'a str, &'a ElementDecl>>,
    ref_chain: Vec<&'a str>,
    issues: Vec<BuildIssue>,
    cancel: BuildCancel,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(types: &'a TypeSystem, index: &'a ExtensionIndex, config: &'a ParserConfig) -> Self {
        Self {
            types,
            index,
            config,
            ref_memo: None,
            ref_chain: Vec::new(),
            issues: Vec::new(),
            cancel: BuildCancel::default(),
        }
    }

    /// Abandon the build once `cancel` is set
    pub fn cancel_on(mut self, cancel: &BuildCancel) -> Self {
        self.cancel = cancel.clone();
        self
    }

    /// Build the tree under `root_name`, or under the first top-level element
    pub fn build(mut self, root_name: Option<&str>) -> Result<BuildOutput> {
        let decl = match root_name {
            Some(name) => self.types.element(name),
            None => self.types.elements.iter().find(|e| e.name.is_some()),
        }
        .ok_or_else(|| SchemaTreeError::RootNotDeclared {
            name: root_name.unwrap_or("<first element>").to_string(),
        })?;

        let name = decl.display_name();
        self.ref_chain.push(name);
        let root = self.element_node(decl, decl, "", 0, None);
        self.ref_chain.pop();

        if self.cancel.is_cancelled() {
            debug!(root = %root.path, "Tree build cancelled");
            return Err(SchemaTreeError::BuildCancelled);
        }

        debug!(
            root = %root.path,
            nodes = root.node_count(),
            issues = self.issues.len(),
            "Tree built"
        );

        Ok(BuildOutput {
            root,
            issues: self.issues,
        })
    }

    /// Build the full tree and return the subtree at `path`
    pub fn build_subtree(self, root_name: Option<&str>, path: &str) -> Result<BuildOutput> {
        let output = self.build(root_name)?;
        let root = output
            .root
            .find(path)
            .cloned()
            .ok_or_else(|| SchemaTreeError::NodeNotFound {
                path: path.to_string(),
            })?;
        Ok(BuildOutput {
            root,
            issues: output.issues,
        })
    }

    fn lookup_ref(&mut self, name: &str) -> Option<&'a ElementDecl> {
        if !self.config.cache_resolved_refs {
            return self.types.element(name);
        }
        let types = self.types;
        let memo = self.ref_memo.get_or_insert_with(|| {
            let mut memo = HashMap::new();
            for decl in &types.elements {
                if let Some(name) = decl.name.as_deref() {
                    memo.entry(name).or_insert(decl);
                }
            }
            memo
        });
        memo.get(name).copied()
    }

    /// Build the node for `decl`, taking occurrence bounds from `occurs`
    fn element_node(
        &mut self,
        decl: &'a ElementDecl,
        occurs: &'a ElementDecl,
        parent_path: &str,
        depth: usize,
        compositor: Option<Compositor>,
    ) -> SchemaNode {
        if let Some(reference) = decl.reference.as_deref() {
            return self.reference_node(local_name(reference), decl, parent_path, depth, compositor);
        }

        let name = decl.display_name();
        let path = format!("{}/{}", parent_path, name);
        let mut node = SchemaNode::new(path, name, NodeKind::Field);
        node.min_occurs = occurs.min_occurs;
        node.max_occurs = occurs.max_occurs;
        node.description = decl.documentation.clone();
        if compositor == Some(Compositor::Choice) {
            node.add_note(notes::CHOICE);
        }

        if name == EXTENSION_ELEMENT {
            mark_extension_point(&mut node);
            return node;
        }

        match self.content_of(decl) {
            Content::Complex { complex, origin } => {
                self.fill_complex(&mut node, complex, origin, depth);
            }
            Content::Simple(simple) => {
                let (data_type, enum_values) = self.simple_details(simple);
                node.data_type = data_type;
                node.enum_values = enum_values;
            }
            Content::Builtin(builtin) => node.data_type = Some(builtin.to_string()),
            Content::Unresolved(type_name) => {
                let issue = BuildIssue::TypeReferenceUnresolved {
                    path: node.path.clone(),
                    name: type_name.to_string(),
                };
                node.add_note(notes::UNRESOLVED_TYPE);
                node.add_note(issue.note());
                debug!(path = %node.path, type_name, "Unresolved type reference");
                self.issues.push(issue);
            }
            Content::Untyped => {}
        }

        node
    }

    fn reference_node(
        &mut self,
        target_name: &'a str,
        decl: &'a ElementDecl,
        parent_path: &str,
        depth: usize,
        compositor: Option<Compositor>,
    ) -> SchemaNode {
        let is_extension = target_name == EXTENSION_ELEMENT;
        let target = if is_extension && !self.config.resolve_extension_refs {
            None
        } else {
            self.lookup_ref(target_name)
        };

        let path = format!("{}/{}", parent_path, target_name);
        let mut leaf = SchemaNode::new(path, target_name, NodeKind::Field);
        leaf.min_occurs = decl.min_occurs;
        leaf.max_occurs = decl.max_occurs;
        if compositor == Some(Compositor::Choice) {
            leaf.add_note(notes::CHOICE);
        }

        if is_extension {
            if let Some(target) = target {
                leaf.description = target.documentation.clone();
                leaf.data_type = target.type_name.as_deref().map(|t| local_name(t).to_string());
            }
            mark_extension_point(&mut leaf);
            return leaf;
        }

        let Some(target) = target else {
            let issue = BuildIssue::ElementReferenceUnresolved {
                path: leaf.path.clone(),
                name: target_name.to_string(),
            };
            leaf.add_note(notes::UNRESOLVED_REFERENCE);
            leaf.add_note(issue.note());
            debug!(path = %leaf.path, reference = target_name, "Unresolved element reference");
            self.issues.push(issue);
            return leaf;
        };

        if self.ref_chain.contains(&target_name) {
            leaf.kind = NodeKind::Section;
            leaf.description = target.documentation.clone();
            leaf.add_note(notes::RECURSIVE_REFERENCE);
            return leaf;
        }

        self.ref_chain.push(target_name);
        let node = self.element_node(target, decl, parent_path, depth, compositor);
        self.ref_chain.pop();
        node
    }

    fn content_of(&self, decl: &'a ElementDecl) -> Content<'a> {
        if let Some(inline) = &decl.inline {
            return match inline {
                InlineType::Complex(complex) => Content::Complex {
                    complex,
                    origin: None,
                },
                InlineType::Simple(simple) => Content::Simple(simple),
            };
        }

        let Some(type_name) = decl.type_name.as_deref() else {
            return Content::Untyped;
        };
        match self.types.lookup_type(type_name) {
            TypeRef::Complex(complex) => Content::Complex {
                complex,
                origin: complex.name.as_deref(),
            },
            TypeRef::Simple(simple) => Content::Simple(simple),
            TypeRef::Builtin(builtin) => Content::Builtin(builtin),
            TypeRef::Unresolved => Content::Unresolved(type_name),
        }
    }

    fn fill_complex(
        &mut self,
        node: &mut SchemaNode,
        complex: &'a ComplexType,
        origin: Option<&'a str>,
        depth: usize,
    ) {
        if node.description.is_none() {
            node.description = complex.documentation.clone();
        }

        if complex.simple_content {
            if let Some(base) = complex.base.as_deref() {
                match self.types.lookup_type(base) {
                    TypeRef::Builtin(builtin) => node.data_type = Some(builtin.to_string()),
                    TypeRef::Simple(simple) => {
                        let (data_type, enum_values) = self.simple_details(simple);
                        node.data_type = data_type;
                        node.enum_values = enum_values;
                    }
                    TypeRef::Complex(_) | TypeRef::Unresolved => {}
                }
            }
            return;
        }

        node.kind = NodeKind::Section;
        if self.cancel.is_cancelled() {
            return;
        }
        if depth >= self.config.max_recursion_depth {
            node.add_note(notes::RECURSION_TRUNCATED);
            return;
        }

        let chain: Cow<'a, ExtensionChain> = match (origin, complex.extension_base()) {
            (Some(name), _) => self
                .index
                .chain(name)
                .map(Cow::Borrowed)
                .unwrap_or_default(),
            (None, Some(base)) => Cow::Owned(ExtensionChain::walk(
                self.types,
                None,
                base,
                self.index.max_depth(),
            )),
            (None, None) => Cow::Owned(ExtensionChain::default()),
        };
        self.annotate_chain(node, &chain, origin);

        let mut particles: Vec<&'a Particle> = Vec::new();
        for base in chain.bases.iter().rev() {
            if let Some(ancestor) = self.types.complex_type(base) {
                particles.extend(ancestor.particles.iter());
            }
        }
        if particles.is_empty() && complex.is_choice() {
            node.kind = NodeKind::Choice;
        }
        particles.extend(complex.particles.iter());

        // First declaration wins so sibling paths stay unique
        let mut seen: HashSet<&str> = HashSet::new();
        for particle in particles {
            if !seen.insert(particle.element.display_name()) {
                continue;
            }
            let child = self.element_node(
                &particle.element,
                &particle.element,
                &node.path,
                depth + 1,
                Some(particle.compositor),
            );
            node.children.push(child);
        }
    }

    fn annotate_chain(&mut self, node: &mut SchemaNode, chain: &ExtensionChain, origin: Option<&str>) {
        if let Some(base) = chain.unresolved_base.as_deref() {
            let issue = BuildIssue::TypeReferenceUnresolved {
                path: node.path.clone(),
                name: base.to_string(),
            };
            node.add_note(notes::UNRESOLVED_TYPE);
            node.add_note(issue.note());
            self.issues.push(issue);
        }

        if !self.config.track_extension_metadata {
            return;
        }

        if chain.truncated {
            node.add_note(notes::EXTENSION_CHAIN_TRUNCATED);
            node.add_note(notes::inherits_from(chain.depth()));
            let omitted = chain
                .omitted
                .iter()
                .take(3)
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            let summary = format!(
                "Inherits from {} types; not expanded beyond {}: {}{}",
                chain.depth(),
                chain.bases.len(),
                omitted,
                if chain.omitted.len() > 3 { ", ..." } else { "" }
            );
            node.description = Some(match node.description.take() {
                Some(existing) => format!("{} ({})", existing, summary),
                None => summary,
            });
        }

        if chain.cycle_detected {
            let origin = origin.unwrap_or(node.name.as_str()).to_string();
            let mut cycle = vec![origin.clone()];
            cycle.extend(chain.bases.iter().cloned());
            cycle.extend(chain.omitted.iter().cloned());
            cycle.extend(chain.cycle_at.iter().cloned());
            let issue = BuildIssue::CycleDetected {
                type_name: origin,
                cycle,
            };
            node.add_note(notes::CYCLE_DETECTED);
            node.add_note(issue.note());
            self.issues.push(issue);
        }
    }

    /// Primitive type and most-derived enumeration along a simple-type chain
    fn simple_details(&self, simple: &'a SimpleType) -> (Option<String>, Vec<String>) {
        let mut enum_values: Vec<String> = Vec::new();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut current = simple;

        loop {
            if enum_values.is_empty() {
                for value in &current.enumerations {
                    if !enum_values.contains(value) {
                        enum_values.push(value.clone());
                    }
                }
            }
            if let Some(name) = current.name.as_deref()
                && !visited.insert(name)
            {
                return (None, enum_values);
            }
            let Some(base) = current.base.as_deref() else {
                return (None, enum_values);
            };
            match self.types.lookup_type(base) {
                TypeRef::Builtin(builtin) => return (Some(builtin.to_string()), enum_values),
                TypeRef::Simple(next) => current = next,
                TypeRef::Complex(_) | TypeRef::Unresolved => return (None, enum_values),
            }
        }
    }
}

fn mark_extension_point(node: &mut SchemaNode) {
    node.kind = NodeKind::Field;
    node.children.clear();
    node.add_note(notes::EXTENSION_POINT);
    node.add_note(notes::ALLOWS_CUSTOM_DATA);
}
