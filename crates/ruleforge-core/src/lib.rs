//! # ruleforge-core
//!
//! The knowledge core for Ruleforge - THE LOGIC.
//!
//! This crate compiles declarative rule and fact-type definitions into
//! packages, aggregates them into knowledge bases, persists those to
//! versioned binary snapshots, and swaps rule packages in place before the
//! first session is derived.
//!
//! ## Data Flow
//!
//! ```text
//! rule text -> RuleCompiler -> CompiledPackage -> KnowledgeBase::add_package
//! KnowledgeBase -> write_base -> bytes -> read_base(bytes, registry) -> KnowledgeBase
//! KnowledgeBase + packages -> PackageReloadCoordinator::replace -> KnowledgeBase
//! ```
//!
//! ## Architectural Constraints
//!
//! - Synchronous and pure: no async, no network, no file I/O
//! - Deterministic: identical inputs encode to identical bytes
//! - No hidden global state: registries and compilers are passed explicitly

// =============================================================================
// MODULES
// =============================================================================

pub mod compiler;
pub mod formats;
pub mod knowledge;
pub mod package;
pub mod primitives;
pub mod registry;
pub mod reload;
pub mod session;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    FactTypeDescriptor, FieldDef, FieldType, FieldValue, KnowledgeError, TypeFingerprint,
    TypeOrigin, qualify,
};

// =============================================================================
// RE-EXPORTS: Knowledge Core
// =============================================================================

pub use compiler::RuleCompiler;
pub use knowledge::{KnowledgeBase, RemovalReport, RetainedType};
pub use package::{
    Action, CompareOp, CompiledPackage, CompiledRule, Condition, Constraint, Pattern, TypeRef,
};
pub use registry::{HandleProvenance, LoadingContext, TypeHandle, TypeRegistry, external_type};
pub use reload::{PackageReloadCoordinator, ReloadPolicy, ReloadReport, ReloadState};
pub use session::{Fact, FactId, Session};

// =============================================================================
// RE-EXPORTS: Formats (from formats module)
// =============================================================================

pub use formats::{
    Decoded, PackageRecord, SnapshotHeader, SnapshotKind, SnapshotSummary, TypeRecord, peek_header,
    read, read_base, read_packages, snapshot_checksum, summarize, write_base, write_packages,
};
