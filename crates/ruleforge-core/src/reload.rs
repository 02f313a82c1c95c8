//! # Package Reload
//!
//! Hot replacement of rule packages in a knowledge base.
//!
//! ## State Machine
//!
//! - `Fresh`: no session has been derived; same-named packages may be
//!   replaced.
//! - `Materialized`: a session exists; every replace is rejected with
//!   `ReloadAfterMaterialization`. Build a new knowledge base instead.
//!
//! The transition is one-way and only [`KnowledgeBase::materialize`] makes it.
//!
//! Packages whose name carries a reserved segment (`generated`, `model`)
//! hold type-support declarations and are never replaced.

use crate::knowledge::KnowledgeBase;
use crate::package::CompiledPackage;
use crate::primitives::RESERVED_PACKAGE_SEGMENTS;
use crate::types::KnowledgeError;

/// Reload state of a knowledge base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadState {
    Fresh,
    Materialized,
}

/// Which package names count as generated/internal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadPolicy {
    pub reserved_segments: Vec<String>,
}

impl Default for ReloadPolicy {
    fn default() -> Self {
        Self {
            reserved_segments: RESERVED_PACKAGE_SEGMENTS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }
}

impl ReloadPolicy {
    #[must_use]
    pub fn new(reserved_segments: Vec<String>) -> Self {
        Self { reserved_segments }
    }

    /// Whether any dot-separated segment of `package` is reserved.
    #[must_use]
    pub fn is_internal(&self, package: &str) -> bool {
        package
            .split('.')
            .any(|segment| self.reserved_segments.iter().any(|r| r == segment))
    }
}

/// Outcome of a successful [`PackageReloadCoordinator::replace`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReloadReport {
    /// Packages swapped for their new version.
    pub replaced: Vec<String>,
    /// Generated/internal packages left alone.
    pub skipped_internal: Vec<String>,
    /// Packages with no same-named counterpart in the base.
    pub skipped_absent: Vec<String>,
}

impl ReloadReport {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.replaced.is_empty()
    }
}

/// Implements the hot-swap protocol.
#[derive(Debug, Clone, Default)]
pub struct PackageReloadCoordinator {
    policy: ReloadPolicy,
}

impl PackageReloadCoordinator {
    #[must_use]
    pub fn new(policy: ReloadPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn policy(&self) -> &ReloadPolicy {
        &self.policy
    }

    /// Replace every same-named, non-internal package of `kbase`.
    ///
    /// The whole call is one transaction: if any replacement fails
    /// validation, the base keeps all of its original packages.
    pub fn replace(
        &self,
        kbase: &KnowledgeBase,
        new_packages: Vec<CompiledPackage>,
    ) -> Result<ReloadReport, KnowledgeError> {
        let result = kbase.transact(|s| {
            if s.is_materialized() {
                return Err(KnowledgeError::ReloadAfterMaterialization);
            }
            let mut report = ReloadReport::default();
            for package in new_packages {
                let name = package.name().to_string();
                if self.policy.is_internal(&name) {
                    report.skipped_internal.push(name);
                } else if !s.contains(&name) {
                    report.skipped_absent.push(name);
                } else {
                    s.remove(&name)?;
                    s.add(package)?;
                    report.replaced.push(name);
                }
            }
            Ok(report)
        });

        match &result {
            Ok(report) => tracing::info!(
                replaced = ?report.replaced,
                skipped_internal = report.skipped_internal.len(),
                skipped_absent = report.skipped_absent.len(),
                "packages reloaded"
            ),
            Err(e) => tracing::warn!(error = %e, "package reload rejected"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::RuleCompiler;
    use crate::registry::TypeRegistry;

    const FACTS: &str = "package com.acme.rules.generated.facts;\n\
                         declare Item\n  sku : String\nend";
    const RULES_V1: &str = "package com.acme.rules;\n\
                            import com.acme.rules.generated.facts.Item;\n\
                            rule \"a\" when Item() then log \"a\"; end";
    const RULES_V2: &str = "package com.acme.rules;\nversion 2;\n\
                            import com.acme.rules.generated.facts.Item;\n\
                            rule \"a\" when Item() then log \"a\"; end\n\
                            rule \"b\" when Item() then log \"b\"; end";

    fn compile(source: &str) -> CompiledPackage {
        RuleCompiler::new().compile(source, &[FACTS]).expect("compile")
    }

    fn base() -> KnowledgeBase {
        let kb = KnowledgeBase::new(TypeRegistry::default());
        kb.add_package(RuleCompiler::new().compile(FACTS, &[]).expect("facts"))
            .expect("add facts");
        kb.add_package(compile(RULES_V1)).expect("add rules");
        kb
    }

    #[test]
    fn segments_mark_internal_packages() {
        let policy = ReloadPolicy::default();
        assert!(policy.is_internal("com.acme.rules.generated.facts"));
        assert!(policy.is_internal("model"));
        assert!(!policy.is_internal("com.acme.modeling"));
        assert!(!policy.is_internal("com.acme.rules"));
    }

    #[test]
    fn fresh_base_accepts_replacement() {
        let kb = base();
        let report = PackageReloadCoordinator::default()
            .replace(&kb, vec![compile(RULES_V2)])
            .expect("replace");
        assert_eq!(report.replaced, vec!["com.acme.rules".to_string()]);
        assert_eq!(kb.package("com.acme.rules").map(|p| p.version()), Some(2));
        assert_eq!(kb.rule_count(), 2);
    }

    #[test]
    fn internal_and_absent_packages_are_skipped() {
        let kb = base();
        let facts = RuleCompiler::new().compile(FACTS, &[]).expect("facts");
        let stray = RuleCompiler::new()
            .compile("package com.acme.stray;", &[])
            .expect("stray");
        let report = PackageReloadCoordinator::default()
            .replace(&kb, vec![facts, stray])
            .expect("replace");
        assert!(report.is_noop());
        assert_eq!(report.skipped_internal.len(), 1);
        assert_eq!(report.skipped_absent, vec!["com.acme.stray".to_string()]);
        assert!(!kb.contains_package("com.acme.stray"));
    }

    #[test]
    fn materialized_base_rejects_replacement() {
        let kb = base();
        let _session = kb.materialize().expect("materialize");
        assert_eq!(kb.reload_state(), ReloadState::Materialized);
        let result = PackageReloadCoordinator::default().replace(&kb, vec![compile(RULES_V2)]);
        assert!(matches!(result, Err(KnowledgeError::ReloadAfterMaterialization)));
        assert_eq!(kb.package("com.acme.rules").map(|p| p.version()), Some(1));
    }

    #[test]
    fn custom_policy_segments() {
        let policy = ReloadPolicy::new(vec!["support".to_string()]);
        assert!(policy.is_internal("com.acme.support"));
        assert!(!policy.is_internal("com.acme.generated"));
    }
}
