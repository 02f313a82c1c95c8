//! # Knowledge Base
//!
//! Aggregates compiled packages into one namespace and derives sessions.
//!
//! ## Mutation Discipline
//!
//! One `Mutex` guards the whole base. Every mutation runs against a staged
//! copy of the state plus a [`RegistryDelta`]; the delta is applied to the
//! registry and the copy committed only when every step succeeded. A failed
//! call leaves both the base and the registry untouched.
//!
//! ## Stale-Type Retention
//!
//! Removing the last package that declares a type normally unregisters the
//! type. If a live session still holds the type's handle, the type is
//! retained instead, logged, and reported by [`KnowledgeBase::retained_types`]
//! until the last such session is dropped.

use crate::package::{CompiledPackage, TypeRef};
use crate::registry::{RegistryDelta, TypeHandle, TypeRegistry};
use crate::reload::ReloadState;
use crate::session::{Session, SessionView};
use crate::types::{FactTypeDescriptor, KnowledgeError};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

// =============================================================================
// REPORTS
// =============================================================================

/// Outcome of [`KnowledgeBase::remove_package`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemovalReport {
    pub package: String,
    /// Types unregistered by this removal.
    pub purged: Vec<String>,
    /// Types no longer declared but still held by a live session.
    pub retained: Vec<String>,
}

/// A type whose declaring package was removed while a session held it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedType {
    pub name: String,
    /// Last package that declared the type.
    pub removed_package: String,
}

// =============================================================================
// STATE
// =============================================================================

#[derive(Debug, Clone)]
struct TypeEntry {
    handle: TypeHandle,
    declared_by: BTreeSet<String>,
}

#[derive(Debug, Clone)]
struct Retention {
    handle: TypeHandle,
    removed_package: String,
}

#[derive(Debug, Clone, Default)]
struct BaseState {
    packages: BTreeMap<String, Arc<CompiledPackage>>,
    types: BTreeMap<String, TypeEntry>,
    retained: BTreeMap<String, Retention>,
    sessions: Vec<Weak<SessionView>>,
    materialized: bool,
}

impl BaseState {
    fn held_by_session(&self, handle: &TypeHandle) -> bool {
        self.sessions
            .iter()
            .filter_map(Weak::upgrade)
            .any(|view| view.holds(handle))
    }
}

// =============================================================================
// STAGING
// =============================================================================

/// A staged mutation of a knowledge base.
pub(crate) struct Staging<'a> {
    registry: &'a TypeRegistry,
    state: BaseState,
    delta: RegistryDelta,
}

impl Staging<'_> {
    pub fn is_materialized(&self) -> bool {
        self.state.materialized
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.packages.contains_key(name)
    }

    /// Drop dead sessions and release retained types nobody holds anymore.
    fn sweep(&mut self) {
        self.state.sessions.retain(|w| w.strong_count() > 0);
        let released: Vec<String> = self
            .state
            .retained
            .iter()
            .filter(|(_, r)| !self.state.held_by_session(&r.handle))
            .map(|(name, _)| name.clone())
            .collect();
        for name in released {
            if let Some(retention) = self.state.retained.remove(&name) {
                tracing::info!(type_name = %name, "retained type released");
                self.delta.unregister.push(retention.handle);
            }
        }
    }

    pub fn add(&mut self, package: CompiledPackage) -> Result<(), KnowledgeError> {
        if self.contains(package.name()) {
            return Err(KnowledgeError::DuplicatePackage(package.name().to_string()));
        }

        for descriptor in package.declared_types() {
            self.declare(package.name(), descriptor)?;
        }

        self.state
            .packages
            .insert(package.name().to_string(), Arc::new(package));
        Ok(())
    }

    /// Every rule body reference to a type of the base view must match the
    /// fingerprint the view holds. Checked over all packages, so a new
    /// declaration cannot break a package compiled earlier.
    fn verify(&self) -> Result<(), KnowledgeError> {
        for package in self.state.packages.values() {
            for type_ref in package.type_refs() {
                if let Some(entry) = self.state.types.get(&type_ref.name) {
                    check_ref(package.name(), type_ref, &entry.handle, "base")?;
                }
            }
        }
        Ok(())
    }

    fn declare(
        &mut self,
        package: &str,
        descriptor: &FactTypeDescriptor,
    ) -> Result<(), KnowledgeError> {
        let name = descriptor.name.as_str();

        if let Some(entry) = self.state.types.get_mut(name) {
            if !entry.handle.descriptor().is_structurally_equal(descriptor) {
                return Err(KnowledgeError::conflict(
                    name,
                    format!(
                        "package {} redeclares a type already declared by {}",
                        package,
                        entry.declared_by.iter().cloned().collect::<Vec<_>>().join(", ")
                    ),
                ));
            }
            entry.declared_by.insert(package.to_string());
            return Ok(());
        }

        let handle = self.bind(descriptor)?;
        self.state.types.insert(
            name.to_string(),
            TypeEntry {
                handle,
                declared_by: BTreeSet::from([package.to_string()]),
            },
        );
        Ok(())
    }

    /// Find or create the handle for a type entering the view.
    fn bind(&mut self, descriptor: &FactTypeDescriptor) -> Result<TypeHandle, KnowledgeError> {
        let name = descriptor.name.as_str();

        if let Some(retention) = self.state.retained.get(name) {
            if retention.handle.descriptor().is_structurally_equal(descriptor) {
                let handle = retention.handle.clone();
                self.state.retained.remove(name);
                return Ok(handle);
            }
            // The session keeps its handle; the registry moves on.
            self.delta.unregister.push(retention.handle.clone());
        }

        if let Some(handle) = self.delta.revive(name) {
            if handle.descriptor().is_structurally_equal(descriptor) {
                return Ok(handle);
            }
            self.delta.unregister.push(handle);
        }

        if let Some(existing) = self.registry.get(name) {
            if existing.descriptor().is_structurally_equal(descriptor) {
                return Ok(existing);
            }
            if !self.delta.is_unregistering(name) {
                return Err(KnowledgeError::conflict(
                    name,
                    format!(
                        "registry already binds a different type ({})",
                        existing.descriptor().origin.tag()
                    ),
                ));
            }
        }

        if let Some(staged) = self.delta.staged(name) {
            return Ok(staged.clone());
        }
        let handle = self.registry.synthesize(descriptor.clone());
        self.delta.register.push(handle.clone());
        Ok(handle)
    }

    pub fn remove(&mut self, name: &str) -> Result<RemovalReport, KnowledgeError> {
        let package = self
            .state
            .packages
            .remove(name)
            .ok_or_else(|| KnowledgeError::UnknownPackage(name.to_string()))?;

        let mut report = RemovalReport {
            package: name.to_string(),
            ..RemovalReport::default()
        };

        for descriptor in package.declared_types() {
            let Some(entry) = self.state.types.get_mut(&descriptor.name) else {
                continue;
            };
            entry.declared_by.remove(name);
            if !entry.declared_by.is_empty() {
                continue;
            }
            let Some(entry) = self.state.types.remove(&descriptor.name) else {
                continue;
            };
            if self.state.held_by_session(&entry.handle) {
                tracing::warn!(
                    type_name = %descriptor.name,
                    package = %name,
                    "package removed but type retained by a live session"
                );
                self.state.retained.insert(
                    descriptor.name.clone(),
                    Retention {
                        handle: entry.handle,
                        removed_package: name.to_string(),
                    },
                );
                report.retained.push(descriptor.name.clone());
            } else {
                self.delta.unregister.push(entry.handle);
                report.purged.push(descriptor.name.clone());
            }
        }
        Ok(report)
    }

    /// Resolve the handle of every rule body reference.
    fn resolve_view(&self) -> Result<BTreeMap<String, TypeHandle>, KnowledgeError> {
        let mut types: BTreeMap<String, TypeHandle> = self
            .state
            .types
            .iter()
            .map(|(name, entry)| (name.clone(), entry.handle.clone()))
            .collect();

        for package in self.state.packages.values() {
            for type_ref in package.type_refs() {
                if let Some(handle) = types.get(&type_ref.name) {
                    check_ref(package.name(), type_ref, handle, "base")?;
                    continue;
                }
                let handle = self
                    .registry
                    .get(&type_ref.name)
                    .ok_or_else(|| KnowledgeError::UnresolvedType(type_ref.name.clone()))?;
                check_ref(package.name(), type_ref, &handle, "registry")?;
                types.insert(type_ref.name.clone(), handle);
            }
        }

        for (name, handle) in &types {
            if let Some(entry) = self.state.types.get(name) {
                if entry.handle.fingerprint() != handle.fingerprint() {
                    return Err(KnowledgeError::conflict(name, "view and registry disagree"));
                }
            }
        }
        Ok(types)
    }
}

fn check_ref(
    package: &str,
    type_ref: &TypeRef,
    handle: &TypeHandle,
    holder: &str,
) -> Result<(), KnowledgeError> {
    if handle.fingerprint() == type_ref.fingerprint {
        return Ok(());
    }
    Err(KnowledgeError::conflict(
        &type_ref.name,
        format!(
            "package {} expects fingerprint {}, {} holds {}",
            package,
            type_ref.fingerprint,
            holder,
            handle.fingerprint()
        ),
    ))
}

// =============================================================================
// KNOWLEDGE BASE
// =============================================================================

/// An aggregate of compiled packages producing execution sessions.
#[derive(Debug)]
pub struct KnowledgeBase {
    registry: TypeRegistry,
    state: Mutex<BaseState>,
}

impl KnowledgeBase {
    /// Create an empty base that registers its declared types in `registry`.
    #[must_use]
    pub fn new(registry: TypeRegistry) -> Self {
        Self {
            registry,
            state: Mutex::new(BaseState::default()),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    fn lock(&self) -> MutexGuard<'_, BaseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on a staged copy of the base and commit it if `f` succeeds.
    pub(crate) fn transact<T>(
        &self,
        f: impl FnOnce(&mut Staging<'_>) -> Result<T, KnowledgeError>,
    ) -> Result<T, KnowledgeError> {
        let mut guard = self.lock();
        let mut staging = Staging {
            registry: &self.registry,
            state: guard.clone(),
            delta: RegistryDelta::default(),
        };
        staging.sweep();
        let out = f(&mut staging)?;
        staging.verify()?;
        self.registry.apply(&staging.delta)?;
        *guard = staging.state;
        Ok(out)
    }

    // =========================================================================
    // MUTATION
    // =========================================================================

    /// Add a package.
    pub fn add_package(&self, package: CompiledPackage) -> Result<(), KnowledgeError> {
        let name = package.name().to_string();
        let rules = package.rule_count();
        self.transact(|s| s.add(package))?;
        tracing::info!(package = %name, rules, "package added");
        Ok(())
    }

    /// Remove a package and release the types only it declared.
    pub fn remove_package(&self, name: &str) -> Result<RemovalReport, KnowledgeError> {
        let report = self.transact(|s| s.remove(name))?;
        tracing::info!(
            package = %name,
            purged = report.purged.len(),
            retained = report.retained.len(),
            "package removed"
        );
        Ok(report)
    }

    /// Derive a new session.
    ///
    /// The first successful call marks the base materialized, permanently.
    pub fn materialize(&self) -> Result<Session, KnowledgeError> {
        let (view, first) = self.transact(|s| {
            let types = s.resolve_view()?;
            let view = Arc::new(SessionView {
                packages: s.state.packages.values().cloned().collect(),
                types,
            });
            s.state.sessions.push(Arc::downgrade(&view));
            let first = !s.state.materialized;
            s.state.materialized = true;
            Ok((view, first))
        })?;

        if first {
            tracing::info!(
                packages = view.packages.len(),
                types = view.types.len(),
                "knowledge base materialized"
            );
        }
        Ok(Session::new(view))
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    #[must_use]
    pub fn package(&self, name: &str) -> Option<Arc<CompiledPackage>> {
        self.lock().packages.get(name).cloned()
    }

    #[must_use]
    pub fn contains_package(&self, name: &str) -> bool {
        self.lock().packages.contains_key(name)
    }

    /// Package names in lexicographic order.
    #[must_use]
    pub fn package_names(&self) -> Vec<String> {
        self.lock().packages.keys().cloned().collect()
    }

    /// Packages in lexicographic order of name.
    #[must_use]
    pub fn packages(&self) -> Vec<Arc<CompiledPackage>> {
        self.lock().packages.values().cloned().collect()
    }

    #[must_use]
    pub fn package_count(&self) -> usize {
        self.lock().packages.len()
    }

    /// Total number of rules across all packages.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.lock().packages.values().map(|p| p.rule_count()).sum()
    }

    /// Handle of a type declared by a package of this base.
    #[must_use]
    pub fn fact_type(&self, name: &str) -> Option<TypeHandle> {
        self.lock().types.get(name).map(|e| e.handle.clone())
    }

    /// Handles of all declared types, sorted by name.
    #[must_use]
    pub fn fact_types(&self) -> Vec<TypeHandle> {
        self.lock().types.values().map(|e| e.handle.clone()).collect()
    }

    #[must_use]
    pub fn is_materialized(&self) -> bool {
        self.lock().materialized
    }

    #[must_use]
    pub fn reload_state(&self) -> ReloadState {
        if self.is_materialized() {
            ReloadState::Materialized
        } else {
            ReloadState::Fresh
        }
    }

    /// Number of sessions still alive.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.lock()
            .sessions
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Types retained for live sessions after their package was removed.
    ///
    /// Releases retained types whose sessions have ended before reporting.
    #[must_use]
    pub fn retained_types(&self) -> Vec<RetainedType> {
        let collect = |state: &BaseState| {
            state
                .retained
                .iter()
                .map(|(name, r)| RetainedType {
                    name: name.clone(),
                    removed_package: r.removed_package.clone(),
                })
                .collect::<Vec<_>>()
        };
        match self.transact(|s| Ok(collect(&s.state))) {
            Ok(retained) => retained,
            Err(e) => {
                tracing::warn!(error = %e, "failed to release retained types");
                collect(&self.lock())
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
