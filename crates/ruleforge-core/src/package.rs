//! # Compiled Package Model
//!
//! The executable form produced by the rule compiler.
//!
//! Rule bodies reference fact types by qualified name plus structural
//! fingerprint ([`TypeRef`]), never by runtime identity. That is what lets a
//! compiled package cross a process boundary and be re-bound to whatever
//! handles the reading side's registry holds.
//!
//! Packages are immutable after compilation. Replacing a package means
//! substituting the whole value.

use crate::primitives::MAX_CONDITION_DEPTH;
use crate::types::{FactTypeDescriptor, FieldValue, TypeFingerprint};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// =============================================================================
// TYPE REFERENCE
// =============================================================================

/// Reference from an executable body to a fact type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TypeRef {
    /// Qualified type name.
    pub name: String,
    pub fingerprint: TypeFingerprint,
}

impl TypeRef {
    #[must_use]
    pub fn to(descriptor: &FactTypeDescriptor) -> Self {
        Self {
            name: descriptor.name.clone(),
            fingerprint: descriptor.fingerprint(),
        }
    }
}

// =============================================================================
// CONDITIONS
// =============================================================================

/// Comparison operator of a field constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    /// Evaluate `left op right`.
    ///
    /// Values of different types never satisfy a constraint.
    #[must_use]
    pub fn test(self, left: &FieldValue, right: &FieldValue) -> bool {
        if left.field_type() != right.field_type() {
            return false;
        }
        match self {
            Self::Eq => left == right,
            Self::Ne => left != right,
            Self::Lt => left < right,
            Self::Le => left <= right,
            Self::Gt => left > right,
            Self::Ge => left >= right,
        }
    }

    #[must_use]
    pub const fn is_ordering(self) -> bool {
        matches!(self, Self::Lt | Self::Le | Self::Gt | Self::Ge)
    }

    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// `field op literal` inside a pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Constraint {
    pub field: String,
    pub op: CompareOp,
    pub value: FieldValue,
}

/// Match facts of one type that satisfy every constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pattern {
    pub type_ref: TypeRef,
    pub constraints: Vec<Constraint>,
}

/// Left-hand condition tree of a rule.
///
/// Serialized as a flat postorder node list, so decoding never recurses and
/// rejects trees deeper than [`MAX_CONDITION_DEPTH`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "ConditionNodes", try_from = "ConditionNodes")]
pub enum Condition {
    Pattern(Pattern),
    /// Conjunction; an empty conjunction always holds.
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
    Exists(Box<Condition>),
    Eval(bool),
}

impl Condition {
    /// Nesting depth; a leaf has depth 1.
    #[must_use]
    pub fn depth(&self) -> usize {
        match self {
            Self::Pattern(_) | Self::Eval(_) => 1,
            Self::All(children) | Self::Any(children) => {
                1 + children.iter().map(Self::depth).max().unwrap_or(0)
            }
            Self::Not(inner) | Self::Exists(inner) => 1 + inner.depth(),
        }
    }

    fn collect_type_refs<'a>(&'a self, out: &mut BTreeSet<&'a TypeRef>) {
        match self {
            Self::Pattern(p) => {
                out.insert(&p.type_ref);
            }
            Self::All(children) | Self::Any(children) => {
                for child in children {
                    child.collect_type_refs(out);
                }
            }
            Self::Not(inner) | Self::Exists(inner) => inner.collect_type_refs(out),
            Self::Eval(_) => {}
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum ConditionNode {
    Pattern(Pattern),
    /// Combines the preceding `n` nodes.
    All(u32),
    Any(u32),
    Not,
    Exists,
    Eval(bool),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConditionNodes(Vec<ConditionNode>);

enum Walk {
    Visit(Condition),
    Emit(ConditionNode),
}

impl From<Condition> for ConditionNodes {
    fn from(root: Condition) -> Self {
        let mut out = Vec::new();
        let mut stack = vec![Walk::Visit(root)];
        while let Some(step) = stack.pop() {
            match step {
                Walk::Emit(node) => out.push(node),
                Walk::Visit(Condition::Pattern(p)) => out.push(ConditionNode::Pattern(p)),
                Walk::Visit(Condition::Eval(b)) => out.push(ConditionNode::Eval(b)),
                Walk::Visit(Condition::Not(inner)) => {
                    stack.push(Walk::Emit(ConditionNode::Not));
                    stack.push(Walk::Visit(*inner));
                }
                Walk::Visit(Condition::Exists(inner)) => {
                    stack.push(Walk::Emit(ConditionNode::Exists));
                    stack.push(Walk::Visit(*inner));
                }
                Walk::Visit(Condition::All(children)) => {
                    stack.push(Walk::Emit(ConditionNode::All(children.len() as u32)));
                    stack.extend(children.into_iter().rev().map(Walk::Visit));
                }
                Walk::Visit(Condition::Any(children)) => {
                    stack.push(Walk::Emit(ConditionNode::Any(children.len() as u32)));
                    stack.extend(children.into_iter().rev().map(Walk::Visit));
                }
            }
        }
        Self(out)
    }
}

impl TryFrom<ConditionNodes> for Condition {
    type Error = String;

    fn try_from(nodes: ConditionNodes) -> Result<Self, Self::Error> {
        // (subtree, depth)
        let mut stack: Vec<(Condition, usize)> = Vec::new();
        for node in nodes.0 {
            let item = match node {
                ConditionNode::Pattern(p) => (Condition::Pattern(p), 1),
                ConditionNode::Eval(b) => (Condition::Eval(b), 1),
                ConditionNode::Not | ConditionNode::Exists => {
                    let (inner, depth) = stack
                        .pop()
                        .ok_or_else(|| "condition operator without operand".to_string())?;
                    let inner = Box::new(inner);
                    let cond = if matches!(node, ConditionNode::Not) {
                        Condition::Not(inner)
                    } else {
                        Condition::Exists(inner)
                    };
                    (cond, depth + 1)
                }
                ConditionNode::All(n) | ConditionNode::Any(n) => {
                    let n = n as usize;
                    if n > stack.len() {
                        return Err(format!("condition group of {} lacks operands", n));
                    }
                    let parts = stack.split_off(stack.len() - n);
                    let depth = 1 + parts.iter().map(|(_, d)| *d).max().unwrap_or(0);
                    let children = parts.into_iter().map(|(c, _)| c).collect();
                    let cond = if matches!(node, ConditionNode::All(_)) {
                        Condition::All(children)
                    } else {
                        Condition::Any(children)
                    };
                    (cond, depth)
                }
            };
            if item.1 > MAX_CONDITION_DEPTH {
                return Err(format!(
                    "condition nested deeper than {} levels",
                    MAX_CONDITION_DEPTH
                ));
            }
            stack.push(item);
        }
        match (stack.pop(), stack.is_empty()) {
            (Some((cond, _)), true) => Ok(cond),
            _ => Err("malformed condition node list".to_string()),
        }
    }
}

// =============================================================================
// ACTIONS
// =============================================================================

/// Right-hand action of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    /// Insert a new fact; `values` covers every field in descriptor order.
    Insert {
        type_ref: TypeRef,
        values: Vec<(String, FieldValue)>,
    },
    /// Record a message in the session output.
    Log(String),
}

// =============================================================================
// RULE
// =============================================================================

/// One compiled rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompiledRule {
    pub name: String,
    pub salience: i32,
    pub condition: Condition,
    pub actions: Vec<Action>,
}

impl CompiledRule {
    /// Every type referenced by the condition tree or the actions.
    #[must_use]
    pub fn type_refs(&self) -> BTreeSet<&TypeRef> {
        let mut refs = BTreeSet::new();
        self.condition.collect_type_refs(&mut refs);
        for action in &self.actions {
            if let Action::Insert { type_ref, .. } = action {
                refs.insert(type_ref);
            }
        }
        refs
    }
}

// =============================================================================
// PACKAGE
// =============================================================================

/// A named, versioned, self-contained unit of compiled rules and declared types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPackage {
    name: String,
    version: u32,
    rules: Vec<CompiledRule>,
    declared_types: Vec<FactTypeDescriptor>,
    dependencies: BTreeSet<String>,
}

impl CompiledPackage {
    /// Assemble a package. Declared types are kept sorted by name.
    pub(crate) fn new(
        name: impl Into<String>,
        version: u32,
        rules: Vec<CompiledRule>,
        mut declared_types: Vec<FactTypeDescriptor>,
        dependencies: BTreeSet<String>,
    ) -> Self {
        declared_types.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            name: name.into(),
            version,
            rules,
            declared_types,
            dependencies,
        }
    }

    /// Qualified package name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Rules in source order.
    #[must_use]
    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    #[must_use]
    pub fn rule(&self, name: &str) -> Option<&CompiledRule> {
        self.rules.iter().find(|r| r.name == name)
    }

    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Fact types declared by this package, sorted by qualified name.
    #[must_use]
    pub fn declared_types(&self) -> &[FactTypeDescriptor] {
        &self.declared_types
    }

    #[must_use]
    pub fn declared_type(&self, name: &str) -> Option<&FactTypeDescriptor> {
        self.declared_types.iter().find(|d| d.name == name)
    }

    #[must_use]
    pub fn declares(&self, name: &str) -> bool {
        self.declared_type(name).is_some()
    }

    /// Qualified names referenced but not declared here.
    #[must_use]
    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    /// Every type reference of every rule body.
    #[must_use]
    pub fn type_refs(&self) -> BTreeSet<&TypeRef> {
        self.rules.iter().flat_map(CompiledRule::type_refs).collect()
    }
}

// =============================================================================
// TESTS
// =============================================================================
