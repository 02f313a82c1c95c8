//! # Session Module
//!
//! One execution context derived from a knowledge base.
//!
//! A session holds:
//! - an immutable view of the packages and type handles taken at
//!   materialization (shared by `Arc`, never updated afterwards)
//! - its own working memory of facts
//! - the refraction set of activations already fired
//!
//! The agenda here is a small, exhaustive matcher. It recomputes every
//! activation after each firing, so it is only meant for the fact volumes a
//! host test or CLI run produces.

use crate::package::{Action, CompiledPackage, Condition, Pattern};
use crate::primitives::{DEFAULT_MAX_FIRINGS, MAX_MATCH_TUPLES};
use crate::registry::TypeHandle;
use crate::types::{FieldValue, KnowledgeError};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

// =============================================================================
// SESSION VIEW
// =============================================================================

/// Packages and type handles as of materialization.
#[derive(Debug)]
pub(crate) struct SessionView {
    /// Sorted by package name.
    pub packages: Vec<Arc<CompiledPackage>>,
    /// Every type a rule body references, plus every declared type.
    pub types: BTreeMap<String, TypeHandle>,
}

impl SessionView {
    pub fn holds(&self, handle: &TypeHandle) -> bool {
        self.types.values().any(|h| h == handle)
    }
}

// =============================================================================
// FACTS
// =============================================================================

/// Identifier of a fact within one session. Assigned in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FactId(pub u64);

impl fmt::Display for FactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

/// A fact in working memory.
#[derive(Debug, Clone)]
pub struct Fact {
    pub id: FactId,
    pub type_handle: TypeHandle,
    /// One value per descriptor field, in descriptor order.
    pub values: Vec<(String, FieldValue)>,
}

impl Fact {
    /// Value of a field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.values.iter().find(|(n, _)| n == field).map(|(_, v)| v)
    }

    /// Qualified type name.
    #[must_use]
    pub fn type_name(&self) -> &str {
        self.type_handle.name()
    }

    fn matches(&self, pattern: &Pattern) -> bool {
        self.type_name() == pattern.type_ref.name
            && pattern.constraints.iter().all(|c| {
                self.get(&c.field)
                    .is_some_and(|value| c.op.test(value, &c.value))
            })
    }
}

// =============================================================================
// ACTIVATIONS
// =============================================================================

/// Refraction key: a rule fires at most once per fact tuple.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ActivationKey {
    package: String,
    rule: usize,
    tuple: Vec<FactId>,
}

#[derive(Debug)]
struct Activation {
    salience: i32,
    key: ActivationKey,
}

impl Activation {
    /// Salience descending, then package name, rule order and fact tuple.
    fn priority(&self, other: &Self) -> Ordering {
        other
            .salience
            .cmp(&self.salience)
            .then_with(|| self.key.cmp(&other.key))
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// An execution session.
///
/// Note: Session does NOT implement Clone. Every session is a distinct
/// holder of its knowledge base view.
#[derive(Debug)]
pub struct Session {
    view: Arc<SessionView>,
    facts: BTreeMap<FactId, Fact>,
    next_fact: u64,
    fired: BTreeSet<ActivationKey>,
    output: Vec<String>,
    max_firings: usize,
}

impl Session {
    pub(crate) fn new(view: Arc<SessionView>) -> Self {
        Self {
            view,
            facts: BTreeMap::new(),
            next_fact: 1,
            fired: BTreeSet::new(),
            output: Vec::new(),
            max_firings: DEFAULT_MAX_FIRINGS,
        }
    }

    /// Set the activation budget of each [`Session::fire_all_rules`] call.
    pub fn set_max_firings(&mut self, max_firings: usize) {
        self.max_firings = max_firings;
    }

    #[must_use]
    pub fn max_firings(&self) -> usize {
        self.max_firings
    }

    // =========================================================================
    // VIEW
    // =========================================================================

    /// Names of the packages this session was materialized with.
    #[must_use]
    pub fn package_names(&self) -> Vec<&str> {
        self.view.packages.iter().map(|p| p.name()).collect()
    }

    /// Total number of rules visible to this session.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.view.packages.iter().map(|p| p.rule_count()).sum()
    }

    /// Runtime handle bound to a type name in this session.
    #[must_use]
    pub fn type_handle(&self, name: &str) -> Option<&TypeHandle> {
        self.view.types.get(name)
    }

    // =========================================================================
    // WORKING MEMORY
    // =========================================================================

    /// Insert a fact. Unassigned fields take their type default.
    pub fn insert(
        &mut self,
        type_name: &str,
        values: Vec<(String, FieldValue)>,
    ) -> Result<FactId, KnowledgeError> {
        let handle = self
            .view
            .types
            .get(type_name)
            .cloned()
            .ok_or_else(|| {
                KnowledgeError::InvalidFact(format!("unknown fact type {}", type_name))
            })?;

        let descriptor = handle.descriptor();
        let mut assigned: BTreeMap<String, FieldValue> = BTreeMap::new();
        for (name, value) in values {
            let field = descriptor.field(&name).ok_or_else(|| {
                KnowledgeError::InvalidFact(format!("{} has no field `{}`", type_name, name))
            })?;
            if field.field_type != value.field_type() {
                return Err(KnowledgeError::InvalidFact(format!(
                    "{}.{} expects {}, got {}",
                    type_name,
                    name,
                    field.field_type,
                    value.field_type()
                )));
            }
            if assigned.insert(name.clone(), value).is_some() {
                return Err(KnowledgeError::InvalidFact(format!(
                    "{}.{} assigned twice",
                    type_name, name
                )));
            }
        }

        let values = descriptor
            .fields
            .iter()
            .map(|f| {
                let value = assigned
                    .remove(&f.name)
                    .unwrap_or_else(|| FieldValue::default_for(f.field_type));
                (f.name.clone(), value)
            })
            .collect();
        Ok(self.push_fact(handle, values))
    }

    fn push_fact(&mut self, type_handle: TypeHandle, values: Vec<(String, FieldValue)>) -> FactId {
        let id = FactId(self.next_fact);
        self.next_fact += 1;
        self.facts.insert(
            id,
            Fact {
                id,
                type_handle,
                values,
            },
        );
        id
    }

    #[must_use]
    pub fn fact(&self, id: FactId) -> Option<&Fact> {
        self.facts.get(&id)
    }

    /// Facts in insertion order.
    pub fn facts(&self) -> impl Iterator<Item = &Fact> {
        self.facts.values()
    }

    /// Facts of one type in insertion order.
    #[must_use]
    pub fn facts_of(&self, type_name: &str) -> Vec<&Fact> {
        self.facts
            .values()
            .filter(|f| f.type_name() == type_name)
            .collect()
    }

    #[must_use]
    pub fn fact_count(&self) -> usize {
        self.facts.len()
    }

    /// Messages recorded by `log` actions, oldest first.
    #[must_use]
    pub fn output(&self) -> &[String] {
        &self.output
    }

    // =========================================================================
    // AGENDA
    // =========================================================================

    /// Fire activations until none remain. Returns the number fired.
    pub fn fire_all_rules(&mut self) -> Result<usize, KnowledgeError> {
        let mut fired = 0;
        while let Some(next) = self.next_activation()? {
            if fired >= self.max_firings {
                return Err(KnowledgeError::FiringLimitExceeded(self.max_firings));
            }
            self.fire(next)?;
            fired += 1;
        }
        tracing::debug!(fired, facts = self.facts.len(), "agenda drained");
        Ok(fired)
    }

    fn next_activation(&self) -> Result<Option<Activation>, KnowledgeError> {
        let mut best: Option<Activation> = None;
        for package in &self.view.packages {
            for (index, rule) in package.rules().iter().enumerate() {
                for tuple in self.evaluate(&rule.condition)? {
                    let key = ActivationKey {
                        package: package.name().to_string(),
                        rule: index,
                        tuple,
                    };
                    if self.fired.contains(&key) {
                        continue;
                    }
                    let candidate = Activation {
                        salience: rule.salience,
                        key,
                    };
                    let better = best
                        .as_ref()
                        .is_none_or(|b| candidate.priority(b) == Ordering::Less);
                    if better {
                        best = Some(candidate);
                    }
                }
            }
        }
        Ok(best)
    }

    fn fire(&mut self, activation: Activation) -> Result<(), KnowledgeError> {
        let view = Arc::clone(&self.view);
        let package = view
            .packages
            .iter()
            .find(|p| p.name() == activation.key.package)
            .ok_or_else(|| KnowledgeError::UnknownPackage(activation.key.package.clone()))?;
        let rule = package.rules().get(activation.key.rule).ok_or_else(|| {
            KnowledgeError::InvalidFact(format!(
                "rule #{} missing from {}",
                activation.key.rule,
                package.name()
            ))
        })?;

        tracing::debug!(
            package = package.name(),
            rule = %rule.name,
            salience = rule.salience,
            tuple = ?activation.key.tuple,
            "firing rule"
        );

        for action in &rule.actions {
            match action {
                Action::Insert { type_ref, values } => {
                    let handle = view
                        .types
                        .get(&type_ref.name)
                        .cloned()
                        .ok_or_else(|| KnowledgeError::UnresolvedType(type_ref.name.clone()))?;
                    self.push_fact(handle, values.clone());
                }
                Action::Log(message) => {
                    tracing::debug!(rule = %rule.name, "{}", message);
                    self.output.push(message.clone());
                }
            }
        }
        self.fired.insert(activation.key);
        Ok(())
    }

    /// Fact tuples satisfying a condition.
    fn evaluate(&self, condition: &Condition) -> Result<Vec<Vec<FactId>>, KnowledgeError> {
        let tuples = match condition {
            Condition::Pattern(pattern) => self
                .facts
                .values()
                .filter(|f| f.matches(pattern))
                .map(|f| vec![f.id])
                .collect(),
            Condition::All(parts) => {
                let mut acc: Vec<Vec<FactId>> = vec![Vec::new()];
                for part in parts {
                    let right = self.evaluate(part)?;
                    if acc.len().saturating_mul(right.len()) > MAX_MATCH_TUPLES {
                        return Err(KnowledgeError::FiringLimitExceeded(MAX_MATCH_TUPLES));
                    }
                    acc = acc
                        .iter()
                        .flat_map(|l| {
                            right.iter().map(move |r| {
                                let mut joined = l.clone();
                                joined.extend_from_slice(r);
                                joined
                            })
                        })
                        .collect();
                    if acc.is_empty() {
                        break;
                    }
                }
                acc
            }
            Condition::Any(parts) => {
                let mut acc = Vec::new();
                for part in parts {
                    acc.extend(self.evaluate(part)?);
                }
                acc
            }
            Condition::Not(inner) => unit_if(self.evaluate(inner)?.is_empty()),
            Condition::Exists(inner) => unit_if(!self.evaluate(inner)?.is_empty()),
            Condition::Eval(value) => unit_if(*value),
        };
        if tuples.len() > MAX_MATCH_TUPLES {
            return Err(KnowledgeError::FiringLimitExceeded(MAX_MATCH_TUPLES));
        }
        Ok(tuples)
    }
}

fn unit_if(holds: bool) -> Vec<Vec<FactId>> {
    if holds { vec![Vec::new()] } else { Vec::new() }
}

// =============================================================================
// TESTS
// =============================================================================
