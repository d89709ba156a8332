//! Extraction of element and type declarations from an XSD document.
//!
//! The document is read into a small element tree with `quick-xml` and then
//! walked once to collect top-level elements and named types. Only the parts
//! of XSD that shape the node tree are kept: particles, extension bases,
//! simple-type restrictions with enumerations and documentation text.

use std::collections::{HashMap, HashSet};

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::error::{Result, SchemaTreeError};
use crate::model::MaxOccurs;

pub const XSD_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema";

const BUILTIN_TYPES: &[&str] = &[
    "anyType",
    "anySimpleType",
    "anyURI",
    "base64Binary",
    "boolean",
    "byte",
    "date",
    "dateTime",
    "decimal",
    "double",
    "duration",
    "float",
    "gDay",
    "gMonth",
    "gMonthDay",
    "gYear",
    "gYearMonth",
    "hexBinary",
    "ID",
    "IDREF",
    "int",
    "integer",
    "language",
    "long",
    "Name",
    "NCName",
    "negativeInteger",
    "NMTOKEN",
    "nonNegativeInteger",
    "nonPositiveInteger",
    "normalizedString",
    "positiveInteger",
    "QName",
    "short",
    "string",
    "time",
    "token",
    "unsignedByte",
    "unsignedInt",
    "unsignedLong",
    "unsignedShort",
];

/// Strip a namespace prefix from a qualified name
pub fn local_name(qualified: &str) -> &str {
    qualified
        .split_once(':')
        .map(|(_, local)| local)
        .unwrap_or(qualified)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compositor {
    Sequence,
    Choice,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Derivation {
    Extension,
    Restriction,
}

/// An `xs:element` declaration, top-level or local
#[derive(Debug, Clone, PartialEq)]
pub struct ElementDecl {
    pub name: Option<String>,
    pub reference: Option<String>,
    pub type_name: Option<String>,
    pub min_occurs: u32,
    pub max_occurs: MaxOccurs,
    pub inline: Option<InlineType>,
    pub documentation: Option<String>,
}

impl ElementDecl {
    /// Name the element appears under in the tree
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or_else(|| self.reference.as_deref().map(local_name))
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InlineType {
    Complex(ComplexType),
    Simple(SimpleType),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Particle {
    pub compositor: Compositor,
    pub element: ElementDecl,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComplexType {
    pub name: Option<String>,
    pub base: Option<String>,
    pub derivation: Option<Derivation>,
    pub simple_content: bool,
    pub particles: Vec<Particle>,
    pub documentation: Option<String>,
}

impl ComplexType {
    /// Base type this type inherits content from, if any
    pub fn extension_base(&self) -> Option<&str> {
        match (self.derivation, self.simple_content) {
            (Some(Derivation::Extension), false) => self.base.as_deref(),
            _ => None,
        }
    }

    /// True when every own particle sits inside a `choice`
    pub fn is_choice(&self) -> bool {
        !self.particles.is_empty()
            && self
                .particles
                .iter()
                .all(|p| p.compositor == Compositor::Choice)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimpleType {
    pub name: Option<String>,
    pub base: Option<String>,
    pub enumerations: Vec<String>,
    pub documentation: Option<String>,
}

/// Outcome of looking up a `type` or `base` attribute
#[derive(Debug, Clone, Copy)]
pub enum TypeRef<'a> {
    Builtin(&'a str),
    Simple(&'a SimpleType),
    Complex(&'a ComplexType),
    Unresolved,
}

/// Declarations of one schema document
#[derive(Debug, Clone, Default)]
pub struct TypeSystem {
    pub elements: Vec<ElementDecl>,
    pub complex_types: HashMap<String, ComplexType>,
    /// Named complex types in document order
    pub complex_order: Vec<String>,
    pub simple_types: HashMap<String, SimpleType>,
    xsd_prefixes: HashSet<String>,
}

impl TypeSystem {
    pub fn parse(content: &str) -> Result<Self> {
        let root = read_document(content)?;
        if root.name != "schema" {
            return Err(SchemaTreeError::SchemaParsing {
                details: format!("root element is '{}', expected 'schema'", root.name),
            });
        }

        let mut types = TypeSystem::default();
        for (key, value) in &root.attrs {
            if value != XSD_NAMESPACE {
                continue;
            }
            if let Some(prefix) = key.strip_prefix("xmlns:") {
                types.xsd_prefixes.insert(prefix.to_string());
            }
        }

        for child in &root.children {
            match child.name.as_str() {
                "element" => types.elements.push(parse_element(child)),
                "complexType" => {
                    let complex = parse_complex(child);
                    if let Some(name) = complex.name.clone()
                        && !types.complex_types.contains_key(&name)
                    {
                        types.complex_order.push(name.clone());
                        types.complex_types.insert(name, complex);
                    }
                }
                "simpleType" => {
                    let simple = parse_simple(child);
                    if let Some(name) = simple.name.clone() {
                        types.simple_types.entry(name).or_insert(simple);
                    }
                }
                _ => {}
            }
        }

        Ok(types)
    }

    /// Top-level element declaration by name
    pub fn element(&self, name: &str) -> Option<&ElementDecl> {
        self.elements
            .iter()
            .find(|e| e.name.as_deref() == Some(name))
    }

    pub fn complex_type(&self, name: &str) -> Option<&ComplexType> {
        self.complex_types.get(local_name(name))
    }

    pub fn lookup_type(&self, qualified: &str) -> TypeRef<'_> {
        let (prefix, local) = match qualified.split_once(':') {
            Some((prefix, local)) => (Some(prefix), local),
            None => (None, qualified),
        };

        if prefix.is_some_and(|p| self.xsd_prefixes.contains(p)) {
            return match BUILTIN_TYPES.iter().find(|b| **b == local) {
                Some(builtin) => TypeRef::Builtin(*builtin),
                None => TypeRef::Unresolved,
            };
        }
        if let Some(complex) = self.complex_types.get(local) {
            return TypeRef::Complex(complex);
        }
        if let Some(simple) = self.simple_types.get(local) {
            return TypeRef::Simple(simple);
        }
        match BUILTIN_TYPES.iter().find(|b| **b == local) {
            Some(builtin) => TypeRef::Builtin(*builtin),
            None => TypeRef::Unresolved,
        }
    }

    pub fn is_builtin(&self, qualified: &str) -> bool {
        matches!(self.lookup_type(qualified), TypeRef::Builtin(_))
    }
}

/// Minimal element tree produced by the reader
#[derive(Debug, Default)]
struct XmlElement {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<XmlElement>,
    text: String,
}

impl XmlElement {
    fn from_start(start: &BytesStart<'_>) -> Result<Self> {
        let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let mut attrs = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(quick_xml::Error::from)?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value()?.into_owned();
            attrs.push((key, value));
        }
        Ok(Self {
            name,
            attrs,
            ..Self::default()
        })
    }

    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.children.iter().filter(move |c| c.name == name)
    }
}

fn read_document(content: &str) -> Result<XmlElement> {
    let mut reader = Reader::from_str(content);
    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        match reader.read_event()? {
            Event::Start(start) => stack.push(XmlElement::from_start(&start)?),
            Event::Empty(start) => {
                let element = XmlElement::from_start(&start)?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::End(_) => {
                let element = stack.pop().ok_or_else(|| SchemaTreeError::SchemaParsing {
                    details: "unbalanced closing tag".to_string(),
                })?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Text(text) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&text.unescape()?);
                }
            }
            Event::CData(data) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = stack.last() {
        return Err(SchemaTreeError::SchemaParsing {
            details: format!("unexpected end of document inside <{}>", open.name),
        });
    }
    root.ok_or_else(|| SchemaTreeError::SchemaParsing {
        details: "document has no root element".to_string(),
    })
}

fn attach(
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
    element: XmlElement,
) -> Result<()> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(element);
    } else if root.is_none() {
        *root = Some(element);
    } else {
        return Err(SchemaTreeError::SchemaParsing {
            details: "document has more than one root element".to_string(),
        });
    }
    Ok(())
}

fn documentation(node: &XmlElement) -> Option<String> {
    let text = node
        .children_named("annotation")
        .flat_map(|a| a.children_named("documentation"))
        .map(|d| d.text.split_whitespace().collect::<Vec<_>>().join(" "))
        .find(|t| !t.is_empty())?;
    Some(text)
}

fn parse_element(node: &XmlElement) -> ElementDecl {
    let inline = node.children.iter().find_map(|c| match c.name.as_str() {
        "complexType" => Some(InlineType::Complex(parse_complex(c))),
        "simpleType" => Some(InlineType::Simple(parse_simple(c))),
        _ => None,
    });

    ElementDecl {
        name: node.attr("name").map(str::to_string),
        reference: node.attr("ref").map(str::to_string),
        type_name: node.attr("type").map(str::to_string),
        min_occurs: node
            .attr("minOccurs")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(1),
        max_occurs: node
            .attr("maxOccurs")
            .map(MaxOccurs::parse)
            .unwrap_or_default(),
        inline,
        documentation: documentation(node),
    }
}

fn compositor(name: &str) -> Option<Compositor> {
    match name {
        "sequence" => Some(Compositor::Sequence),
        "choice" => Some(Compositor::Choice),
        "all" => Some(Compositor::All),
        _ => None,
    }
}

/// Flatten nested compositors, tagging each element with its innermost one
fn collect_particles(node: &XmlElement, kind: Compositor, out: &mut Vec<Particle>) {
    for child in &node.children {
        if child.name == "element" {
            out.push(Particle {
                compositor: kind,
                element: parse_element(child),
            });
        } else if let Some(nested) = compositor(&child.name) {
            collect_particles(child, nested, out);
        }
    }
}

fn parse_complex(node: &XmlElement) -> ComplexType {
    let mut complex = ComplexType {
        name: node.attr("name").map(str::to_string),
        base: None,
        derivation: None,
        simple_content: false,
        particles: Vec::new(),
        documentation: documentation(node),
    };

    for child in &node.children {
        if let Some(kind) = compositor(&child.name) {
            collect_particles(child, kind, &mut complex.particles);
            continue;
        }
        let simple_content = match child.name.as_str() {
            "complexContent" => false,
            "simpleContent" => true,
            _ => continue,
        };
        for derived in &child.children {
            let derivation = match derived.name.as_str() {
                "extension" => Derivation::Extension,
                "restriction" => Derivation::Restriction,
                _ => continue,
            };
            complex.derivation = Some(derivation);
            complex.simple_content = simple_content;
            complex.base = derived.attr("base").map(str::to_string);
            for inner in &derived.children {
                if let Some(kind) = compositor(&inner.name) {
                    collect_particles(inner, kind, &mut complex.particles);
                }
            }
        }
    }

    complex
}

fn parse_simple(node: &XmlElement) -> SimpleType {
    let restriction = node.children_named("restriction").next();
    SimpleType {
        name: node.attr("name").map(str::to_string),
        base: restriction.and_then(|r| r.attr("base")).map(str::to_string),
        enumerations: restriction
            .map(|r| {
                r.children_named("enumeration")
                    .filter_map(|e| e.attr("value"))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        documentation: documentation(node),
    }
}
