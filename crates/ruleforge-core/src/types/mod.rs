//! # Core Type Definitions
//!
//! This module contains the closed data model shared by every component:
//! - Field model (`FieldType`, `FieldValue`, `FieldDef`)
//! - Fact type descriptors and their structural fingerprint
//! - Error types (`KnowledgeError`)
//!
//! ## Determinism Guarantees
//!
//! All types in this module:
//! - Implement `Ord` where they can appear in a `BTreeMap`/`BTreeSet`
//! - Serialize to identical bytes for identical values (no maps, no floats)

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// =============================================================================
// FIELD MODEL
// =============================================================================

/// The closed set of field types a declared fact may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FieldType {
    /// UTF-8 text.
    String,
    /// Signed 64-bit integer (`int` and `long` in rule sources).
    Int,
    /// Boolean (`boolean` in rule sources).
    Bool,
}

impl FieldType {
    /// Parse a type keyword from a rule source.
    #[must_use]
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "String" | "string" => Some(Self::String),
            "int" | "long" | "Integer" | "Long" => Some(Self::Int),
            "boolean" | "Boolean" => Some(Self::Bool),
            _ => None,
        }
    }

    /// Canonical name used in fingerprints and summaries.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::String => "String",
            Self::Int => "int",
            Self::Bool => "boolean",
        }
    }

    /// Whether `<`, `<=`, `>`, `>=` are defined for this type.
    #[must_use]
    pub const fn is_ordered(self) -> bool {
        matches!(self, Self::Int)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete field value held by a fact or a compiled literal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FieldValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl FieldValue {
    /// The type of this value.
    #[must_use]
    pub const fn field_type(&self) -> FieldType {
        match self {
            Self::Str(_) => FieldType::String,
            Self::Int(_) => FieldType::Int,
            Self::Bool(_) => FieldType::Bool,
        }
    }

    /// The value an unassigned field of the given type starts with.
    #[must_use]
    pub fn default_for(field_type: FieldType) -> Self {
        match field_type {
            FieldType::String => Self::Str(String::new()),
            FieldType::Int => Self::Int(0),
            FieldType::Bool => Self::Bool(false),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{:?}", s),
            Self::Int(i) => write!(f, "{}", i),
            Self::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// One `(fieldName, fieldType)` pair of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
}

impl FieldDef {
    #[must_use]
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

// =============================================================================
// FACT TYPE DESCRIPTOR
// =============================================================================

/// Where a fact type came from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TypeOrigin {
    /// Declared inside rule-definition source of the named package.
    DeclaredInPackage(String),
    /// Supplied by the host through `TypeRegistry::register`.
    External,
}

impl TypeOrigin {
    /// The origin tag, e.g. `declared-in-package:com.acme.rules`.
    #[must_use]
    pub fn tag(&self) -> String {
        match self {
            Self::DeclaredInPackage(pkg) => format!("declared-in-package:{}", pkg),
            Self::External => "external".to_string(),
        }
    }

    /// The declaring package, if the type was declared in rule source.
    #[must_use]
    pub fn package(&self) -> Option<&str> {
        match self {
            Self::DeclaredInPackage(pkg) => Some(pkg),
            Self::External => None,
        }
    }
}

/// Structural fingerprint of a field list.
///
/// BLAKE3 over the field `name:type` pairs sorted lexicographically and joined
/// with `\n`; the first 8 bytes of the digest, little-endian. This value is
/// part of the snapshot format: changing it invalidates every snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TypeFingerprint(pub u64);

impl TypeFingerprint {
    /// Compute the fingerprint of a field list.
    #[must_use]
    pub fn of_fields(fields: &[FieldDef]) -> Self {
        let mut pairs: Vec<String> = fields
            .iter()
            .map(|f| format!("{}:{}", f.name, f.field_type.as_str()))
            .collect();
        pairs.sort();
        let digest = blake3::hash(pairs.join("\n").as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        Self(u64::from_le_bytes(head))
    }

    /// Get the raw value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TypeFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A compiled, immutable fact type.
///
/// Two descriptors under the same qualified name are interchangeable only when
/// they are equal as values: same ordered field list and same origin.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FactTypeDescriptor {
    /// Qualified name (`package.Simple`).
    pub name: String,
    /// Ordered field list.
    pub fields: Vec<FieldDef>,
    pub origin: TypeOrigin,
}

impl FactTypeDescriptor {
    #[must_use]
    pub fn new(name: impl Into<String>, fields: Vec<FieldDef>, origin: TypeOrigin) -> Self {
        Self {
            name: name.into(),
            fields,
            origin,
        }
    }

    /// Descriptor for a type declared in rule source of `package`.
    #[must_use]
    pub fn declared(package: &str, simple_name: &str, fields: Vec<FieldDef>) -> Self {
        Self::new(
            qualify(package, simple_name),
            fields,
            TypeOrigin::DeclaredInPackage(package.to_string()),
        )
    }

    /// The last segment of the qualified name.
    #[must_use]
    pub fn simple_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }

    /// Lookup a field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    #[must_use]
    pub fn fingerprint(&self) -> TypeFingerprint {
        TypeFingerprint::of_fields(&self.fields)
    }

    /// Exact structural match (fields in order and origin tag).
    #[must_use]
    pub fn is_structurally_equal(&self, other: &Self) -> bool {
        self == other
    }
}

/// Join a package name and a simple name.
#[must_use]
pub fn qualify(package: &str, simple_name: &str) -> String {
    if package.is_empty() {
        simple_name.to_string()
    } else {
        format!("{}.{}", package, simple_name)
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in the knowledge core.
///
/// - No silent failures
/// - Every error is a synchronous result; nothing is retried automatically
/// - Mutation errors leave the knowledge base unchanged
#[derive(Debug, Error)]
pub enum KnowledgeError {
    /// Rule-definition source is malformed; no partial package is produced.
    #[error("Compile error at line {line}: {message}")]
    Compile { line: usize, message: String },

    /// A fact type referenced during compilation or materialization is unknown.
    #[error("Unresolved type: {0}")]
    UnresolvedType(String),

    /// A package with this name is already present.
    #[error("Duplicate package: {0}")]
    DuplicatePackage(String),

    /// No package with this name is present.
    #[error("Unknown package: {0}")]
    UnknownPackage(String),

    /// Two structurally different descriptors share a qualified name.
    #[error("Type conflict on {type_name}: {detail}")]
    TypeConflict { type_name: String, detail: String },

    /// A snapshot references a type that is neither in the registry nor
    /// declared by a package of the same deserialization unit.
    #[error("Unresolved type {type_name} while deserializing package {package}")]
    UnresolvedTypeAtDeserialization { type_name: String, package: String },

    /// Packages cannot be replaced once a session has been materialized.
    #[error("Package reload rejected: knowledge base already materialized a session")]
    ReloadAfterMaterialization,

    /// A fact does not fit its type descriptor.
    #[error("Invalid fact: {0}")]
    InvalidFact(String),

    /// The agenda exceeded its firing budget.
    #[error("Firing limit of {0} activations exceeded")]
    FiringLimitExceeded(usize),

    /// A serialization error occurred.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A deserialization error occurred.
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(String),
}

impl KnowledgeError {
    pub(crate) fn compile(line: usize, message: impl Into<String>) -> Self {
        Self::Compile {
            line,
            message: message.into(),
        }
    }

    pub(crate) fn conflict(type_name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::TypeConflict {
            type_name: type_name.into(),
            detail: detail.into(),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, FieldType)]) -> Vec<FieldDef> {
        pairs.iter().map(|(n, t)| FieldDef::new(*n, *t)).collect()
    }

    #[test]
    fn fingerprint_ignores_field_order() {
        let a = fields(&[("name", FieldType::String), ("hits", FieldType::Int)]);
        let b = fields(&[("hits", FieldType::Int), ("name", FieldType::String)]);
        assert_eq!(TypeFingerprint::of_fields(&a), TypeFingerprint::of_fields(&b));
    }

    #[test]
    fn fingerprint_changes_with_field_type() {
        let a = fields(&[("hits", FieldType::Int)]);
        let b = fields(&[("hits", FieldType::String)]);
        assert_ne!(TypeFingerprint::of_fields(&a), TypeFingerprint::of_fields(&b));
    }

    #[test]
    fn structural_equality_includes_origin() {
        let f = fields(&[("name", FieldType::String)]);
        let a = FactTypeDescriptor::declared("com.acme", "Fact", f.clone());
        let b = FactTypeDescriptor::new("com.acme.Fact", f, TypeOrigin::External);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert!(!a.is_structurally_equal(&b));
    }

    #[test]
    fn origin_tag_format() {
        let origin = TypeOrigin::DeclaredInPackage("com.acme.facts".to_string());
        assert_eq!(origin.tag(), "declared-in-package:com.acme.facts");
    }

    #[test]
    fn simple_name_is_last_segment() {
        let d = FactTypeDescriptor::declared("com.acme.facts", "Fact", Vec::new());
        assert_eq!(d.name, "com.acme.facts.Fact");
        assert_eq!(d.simple_name(), "Fact");
    }

    #[test]
    fn field_type_keywords() {
        assert_eq!(FieldType::from_keyword("long"), Some(FieldType::Int));
        assert_eq!(FieldType::from_keyword("boolean"), Some(FieldType::Bool));
        assert_eq!(FieldType::from_keyword("double"), None);
    }
}
