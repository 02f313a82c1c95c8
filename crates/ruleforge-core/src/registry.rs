//! # Type Registry
//!
//! Resolves qualified fact-type names to runtime type handles.
//!
//! A registry is bound to exactly one [`LoadingContext`] at construction.
//! Handles synthesized by one registry are only comparable with handles of
//! the same context; a snapshot that relies on synthesized handles must be
//! read in a process using the same context identifier as the writer.
//!
//! Cloning a `TypeRegistry` clones the handle, not the entries: the clones
//! observe each other's registrations. Independent registries never share
//! entries unless the caller passes the same registry explicitly.

use crate::primitives::DEFAULT_LOADING_CONTEXT;
use crate::types::{FactTypeDescriptor, KnowledgeError, TypeFingerprint, TypeOrigin};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

// =============================================================================
// LOADING CONTEXT
// =============================================================================

/// Scope within which synthesized runtime type handles are valid.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LoadingContext(String);

impl LoadingContext {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LoadingContext {
    fn default() -> Self {
        Self::new(DEFAULT_LOADING_CONTEXT)
    }
}

impl fmt::Display for LoadingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// TYPE HANDLE
// =============================================================================

/// How a runtime type came into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleProvenance {
    /// Supplied by the host via [`TypeRegistry::register`].
    Registered,
    /// Generated for a type declared in rule source.
    Synthesized,
}

#[derive(Debug)]
struct RuntimeType {
    id: u64,
    context: LoadingContext,
    descriptor: FactTypeDescriptor,
    fingerprint: TypeFingerprint,
    provenance: HandleProvenance,
}

/// A runtime type handle.
///
/// Handles compare by identity: two handles are equal only if they were
/// produced by the same registration.
#[derive(Debug, Clone)]
pub struct TypeHandle(Arc<RuntimeType>);

impl TypeHandle {
    fn new(
        id: u64,
        context: LoadingContext,
        descriptor: FactTypeDescriptor,
        provenance: HandleProvenance,
    ) -> Self {
        let fingerprint = descriptor.fingerprint();
        Self(Arc::new(RuntimeType {
            id,
            context,
            descriptor,
            fingerprint,
            provenance,
        }))
    }

    /// Identifier unique within the owning registry.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.0.id
    }

    #[must_use]
    pub fn context(&self) -> &LoadingContext {
        &self.0.context
    }

    #[must_use]
    pub fn descriptor(&self) -> &FactTypeDescriptor {
        &self.0.descriptor
    }

    /// Qualified type name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0.descriptor.name
    }

    #[must_use]
    pub fn fingerprint(&self) -> TypeFingerprint {
        self.0.fingerprint
    }

    #[must_use]
    pub fn provenance(&self) -> HandleProvenance {
        self.0.provenance
    }
}

impl PartialEq for TypeHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for TypeHandle {}

// =============================================================================
// REGISTRY DELTA
// =============================================================================

/// Registrations staged by a knowledge base mutation or a snapshot read.
///
/// Nothing touches the registry until [`TypeRegistry::apply`] succeeds.
#[derive(Debug, Clone, Default)]
pub(crate) struct RegistryDelta {
    pub register: Vec<TypeHandle>,
    pub unregister: Vec<TypeHandle>,
}

impl RegistryDelta {
    pub fn is_empty(&self) -> bool {
        self.register.is_empty() && self.unregister.is_empty()
    }

    /// A handle staged for registration under `name`.
    pub fn staged(&self, name: &str) -> Option<&TypeHandle> {
        self.register.iter().find(|h| h.name() == name)
    }

    /// Take back a handle staged for removal under `name`.
    pub fn revive(&mut self, name: &str) -> Option<TypeHandle> {
        let pos = self.unregister.iter().position(|h| h.name() == name)?;
        Some(self.unregister.remove(pos))
    }

    pub fn is_unregistering(&self, name: &str) -> bool {
        self.unregister.iter().any(|h| h.name() == name)
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

#[derive(Debug, Default)]
struct RegistryState {
    entries: BTreeMap<String, TypeHandle>,
}

/// Mapping from qualified type name to runtime type handle.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    context: LoadingContext,
    state: Arc<RwLock<RegistryState>>,
    next_id: Arc<AtomicU64>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new(LoadingContext::default())
    }
}

impl TypeRegistry {
    /// Create an empty registry bound to `context`.
    #[must_use]
    pub fn new(context: LoadingContext) -> Self {
        Self {
            context,
            state: Arc::new(RwLock::new(RegistryState::default())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    #[must_use]
    pub fn context(&self) -> &LoadingContext {
        &self.context
    }

    /// Register an externally supplied fact type.
    ///
    /// Registering a structurally equal descriptor twice returns the existing
    /// handle. A different descriptor under the same name is a conflict.
    pub fn register(&self, descriptor: FactTypeDescriptor) -> Result<TypeHandle, KnowledgeError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = state.entries.get(&descriptor.name) {
            if existing.descriptor().is_structurally_equal(&descriptor) {
                return Ok(existing.clone());
            }
            return Err(conflict_with(existing, &descriptor));
        }
        let handle = self.make_handle(descriptor, HandleProvenance::Registered);
        state
            .entries
            .insert(handle.name().to_string(), handle.clone());
        Ok(handle)
    }

    /// Lookup the handle bound to a qualified name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<TypeHandle> {
        self.read_state(|s| s.entries.get(name).cloned())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.read_state(|s| s.entries.contains_key(name))
    }

    /// All registered names in lexicographic order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.read_state(|s| s.entries.keys().cloned().collect())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read_state(|s| s.entries.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether two registry values share the same entries.
    #[must_use]
    pub fn same_registry(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Create a handle for a declared type without registering it.
    pub(crate) fn synthesize(&self, descriptor: FactTypeDescriptor) -> TypeHandle {
        self.make_handle(descriptor, HandleProvenance::Synthesized)
    }

    /// Apply a staged delta atomically.
    ///
    /// Removals only drop an entry if it is still bound to the staged handle.
    /// Registrations fail with `TypeConflict` if the name was bound to a
    /// different type in the meantime; in that case nothing is applied.
    pub(crate) fn apply(&self, delta: &RegistryDelta) -> Result<(), KnowledgeError> {
        if delta.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        for handle in &delta.register {
            if let Some(existing) = state.entries.get(handle.name()) {
                let removed = delta.unregister.iter().any(|h| h == existing);
                if !removed && existing != handle {
                    return Err(conflict_with(existing, handle.descriptor()));
                }
            }
        }

        for handle in &delta.unregister {
            if state.entries.get(handle.name()) == Some(handle) {
                state.entries.remove(handle.name());
            }
        }
        for handle in &delta.register {
            state
                .entries
                .insert(handle.name().to_string(), handle.clone());
        }
        Ok(())
    }

    fn make_handle(
        &self,
        descriptor: FactTypeDescriptor,
        provenance: HandleProvenance,
    ) -> TypeHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        TypeHandle::new(id, self.context.clone(), descriptor, provenance)
    }

    fn read_state<T>(&self, f: impl FnOnce(&RegistryState) -> T) -> T {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }
}

fn conflict_with(existing: &TypeHandle, incoming: &FactTypeDescriptor) -> KnowledgeError {
    let detail = if existing.fingerprint() != incoming.fingerprint() {
        format!(
            "fingerprint {} differs from registered {}",
            incoming.fingerprint(),
            existing.fingerprint()
        )
    } else {
        format!(
            "origin {} differs from registered {}",
            incoming.origin.tag(),
            existing.descriptor().origin.tag()
        )
    };
    KnowledgeError::conflict(&incoming.name, detail)
}

/// Descriptor for a host-supplied type.
#[must_use]
pub fn external_type(name: &str, fields: Vec<crate::types::FieldDef>) -> FactTypeDescriptor {
    FactTypeDescriptor::new(name, fields, TypeOrigin::External)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FieldDef, FieldType};

    fn fact(fields: &[(&str, FieldType)]) -> FactTypeDescriptor {
        FactTypeDescriptor::declared(
            "com.acme.facts",
            "Fact",
            fields.iter().map(|(n, t)| FieldDef::new(*n, *t)).collect(),
        )
    }

    #[test]
    fn register_equal_descriptor_returns_same_handle() {
        let registry = TypeRegistry::default();
        let a = registry
            .register(fact(&[("name", FieldType::String)]))
            .expect("register");
        let b = registry
            .register(fact(&[("name", FieldType::String)]))
            .expect("register again");
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn register_different_descriptor_conflicts() {
        let registry = TypeRegistry::default();
        registry
            .register(fact(&[("name", FieldType::String)]))
            .expect("register");
        let result = registry.register(fact(&[("name", FieldType::Int)]));
        assert!(matches!(result, Err(KnowledgeError::TypeConflict { .. })));
    }

    #[test]
    fn handles_compare_by_identity() {
        let registry = TypeRegistry::default();
        let a = registry.synthesize(fact(&[]));
        let b = registry.synthesize(fact(&[]));
        assert_ne!(a, b);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.provenance(), HandleProvenance::Synthesized);
    }

    #[test]
    fn clones_share_entries() {
        let registry = TypeRegistry::new(LoadingContext::new("app"));
        let shared = registry.clone();
        registry.register(fact(&[])).expect("register");
        assert!(shared.contains("com.acme.facts.Fact"));
        assert!(shared.same_registry(&registry));
        assert!(!TypeRegistry::default().same_registry(&registry));
    }

    #[test]
    fn apply_registers_and_unregisters() {
        let registry = TypeRegistry::default();
        let old = registry.register(fact(&[])).expect("register");
        let new = registry.synthesize(fact(&[("hits", FieldType::Int)]));

        let delta = RegistryDelta {
            register: vec![new.clone()],
            unregister: vec![old],
        };
        registry.apply(&delta).expect("apply");
        assert_eq!(registry.get("com.acme.facts.Fact"), Some(new));
    }

    #[test]
    fn apply_is_all_or_nothing() {
        let registry = TypeRegistry::default();
        registry.register(fact(&[])).expect("register");
        let other = external_type("com.acme.Other", Vec::new());
        let delta = RegistryDelta {
            register: vec![
                registry.synthesize(other),
                registry.synthesize(fact(&[("x", FieldType::Bool)])),
            ],
            unregister: Vec::new(),
        };
        assert!(registry.apply(&delta).is_err());
        assert!(!registry.contains("com.acme.Other"));
    }

    #[test]
    fn handle_carries_context() {
        let registry = TypeRegistry::new(LoadingContext::new("worker-a"));
        let handle = registry.register(fact(&[])).expect("register");
        assert_eq!(handle.context().as_str(), "worker-a");
    }
}
