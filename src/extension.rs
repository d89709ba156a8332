use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::type_system::{TypeRef, TypeSystem};

/// Ancestors of one complex type, most-derived first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionChain {
    /// Base types inlined into the derived type, at most `max_depth` long
    pub bases: Vec<String>,
    pub truncated: bool,
    pub cycle_detected: bool,
    /// The type that reappeared in its own ancestor walk
    pub cycle_at: Option<String>,
    /// Ancestors beyond the depth limit, in walk order
    pub omitted: Vec<String>,
    pub unresolved_base: Option<String>,
}

impl ExtensionChain {
    /// True inheritance depth, counting omitted ancestors
    pub fn depth(&self) -> usize {
        self.bases.len() + self.omitted.len()
    }

    /// Walk the base-type references starting at `first_base`.
    ///
    /// `origin` seeds the visited set so a type that extends itself through
    /// its ancestors is reported as a cycle. Walking continues past the depth
    /// limit only to name the omitted ancestors; nothing past it is inlined.
    pub fn walk(
        types: &TypeSystem,
        origin: Option<&str>,
        first_base: &str,
        max_depth: usize,
    ) -> Self {
        let mut chain = ExtensionChain::default();
        let mut visited: HashSet<&str> = origin.into_iter().collect();
        let mut next = Some(first_base);

        while let Some(base) = next {
            let complex = match types.lookup_type(base) {
                TypeRef::Complex(complex) => complex,
                TypeRef::Builtin(_) | TypeRef::Simple(_) => break,
                TypeRef::Unresolved => {
                    chain.unresolved_base = Some(base.to_string());
                    break;
                }
            };
            let name = complex.name.as_deref().unwrap_or(base);

            if !visited.insert(name) {
                chain.cycle_detected = true;
                chain.cycle_at = Some(name.to_string());
                break;
            }

            if chain.bases.len() < max_depth {
                chain.bases.push(name.to_string());
            } else {
                chain.truncated = true;
                chain.omitted.push(name.to_string());
            }

            next = complex.extension_base();
        }

        chain
    }
}

/// Extension chains of every named complex type in one schema
///
/// Built once per (schema load, depth limit) and shared read-only by all
/// builds against that schema.
#[derive(Debug, Clone, Default)]
pub struct ExtensionIndex {
    max_depth: usize,
    chains: HashMap<String, ExtensionChain>,
}

impl ExtensionIndex {
    pub fn build(types: &TypeSystem, max_depth: usize) -> Self {
        let mut chains = HashMap::new();

        for name in &types.complex_order {
            let Some(base) = types
                .complex_types
                .get(name)
                .and_then(|complex| complex.extension_base())
            else {
                continue;
            };
            let chain = ExtensionChain::walk(types, Some(name), base, max_depth);
            if chain.cycle_detected {
                debug!(
                    type_name = %name,
                    cycle_at = ?chain.cycle_at,
                    "Extension cycle detected"
                );
            }
            chains.insert(name.clone(), chain);
        }

        debug!(
            chains = chains.len(),
            max_depth, "Extension index built"
        );

        Self { max_depth, chains }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn chain(&self, type_name: &str) -> Option<&ExtensionChain> {
        self.chains.get(type_name)
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    pub fn cycles(&self) -> impl Iterator<Item = (&str, &ExtensionChain)> {
        self.chains
            .iter()
            .filter(|(_, chain)| chain.cycle_detected)
            .map(|(name, chain)| (name.as_str(), chain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(body: &str) -> TypeSystem {
        let doc = format!(
            r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">{}</xs:schema>"#,
            body
        );
        TypeSystem::parse(&doc).unwrap()
    }

    fn extends(name: &str, base: &str, field: &str) -> String {
        format!(
            r#"<xs:complexType name="{name}"><xs:complexContent><xs:extension base="{base}">
<xs:sequence><xs:element name="{field}" type="xs:string"/></xs:sequence>
</xs:extension></xs:complexContent></xs:complexType>"#
        )
    }

    fn root(name: &str, field: &str) -> String {
        format!(
            r#"<xs:complexType name="{name}"><xs:sequence><xs:element name="{field}" type="xs:string"/></xs:sequence></xs:complexType>"#
        )
    }

    #[test]
    fn test_cycle_keeps_chain_up_to_cycle_point() {
        let types = schema(&[extends("C", "B", "c"), extends("B", "A", "b"), extends("A", "C", "a")].concat());
        let index = ExtensionIndex::build(&types, 3);

        let chain = index.chain("C").unwrap();
        assert_eq!(chain.bases, vec!["B", "A"]);
        assert!(chain.cycle_detected);
        assert_eq!(chain.cycle_at.as_deref(), Some("C"));
        assert!(!chain.truncated);
        assert_eq!(index.cycles().count(), 3);
    }

    #[test]
    fn test_deep_chain_is_truncated() {
        let body = [
            root("L0", "f0"),
            extends("L1", "L0", "f1"),
            extends("L2", "L1", "f2"),
            extends("L3", "L2", "f3"),
            extends("L4", "L3", "f4"),
            extends("L5", "L4", "f5"),
        ]
        .concat();
        let types = schema(&body);
        let index = ExtensionIndex::build(&types, 3);

        let chain = index.chain("L5").unwrap();
        assert_eq!(chain.bases, vec!["L4", "L3", "L2"]);
        assert!(chain.truncated);
        assert_eq!(chain.omitted, vec!["L1", "L0"]);
        assert_eq!(chain.depth(), 5);
        assert!(!chain.cycle_detected);

        let shallow = index.chain("L2").unwrap();
        assert_eq!(shallow.bases, vec!["L1", "L0"]);
        assert!(!shallow.truncated);

        assert!(index.chain("L0").is_none());
        assert_eq!(index.len(), 5);
    }

    #[test]
    fn test_indexing_is_deterministic() {
        let body = [
            root("Base", "id"),
            extends("Mid", "Base", "m"),
            extends("Leaf", "Mid", "l"),
        ]
        .concat();
        let types = schema(&body);

        let first = ExtensionIndex::build(&types, 2);
        let second = ExtensionIndex::build(&types, 2);
        for name in ["Mid", "Leaf"] {
            assert_eq!(first.chain(name), second.chain(name));
        }
    }

    #[test]
    fn test_unresolved_and_builtin_bases() {
        let body = [
            extends("Orphan", "Missing", "o"),
            extends("Plain", "xs:anyType", "p"),
        ]
        .concat();
        let types = schema(&body);
        let index = ExtensionIndex::build(&types, 3);

        let orphan = index.chain("Orphan").unwrap();
        assert!(orphan.bases.is_empty());
        assert_eq!(orphan.unresolved_base.as_deref(), Some("Missing"));

        let plain = index.chain("Plain").unwrap();
        assert!(plain.bases.is_empty());
        assert!(plain.unresolved_base.is_none());
    }

    #[test]
    fn test_zero_depth_omits_every_ancestor() {
        let body = [root("A", "a"), extends("B", "A", "b")].concat();
        let types = schema(&body);
        let index = ExtensionIndex::build(&types, 0);

        let chain = index.chain("B").unwrap();
        assert!(chain.bases.is_empty());
        assert!(chain.truncated);
        assert_eq!(chain.omitted, vec!["A"]);
    }
}
