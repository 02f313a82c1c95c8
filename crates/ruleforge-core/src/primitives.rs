//! # Primitives
//!
//! Hardcoded constants for the Ruleforge knowledge core.
//!
//! These values are compiled into the binary and are immutable at runtime.
//! Anything that reaches the snapshot format is versioned by
//! [`FORMAT_VERSION`].

/// Magic bytes for the snapshot header.
pub const MAGIC_BYTES: [u8; 4] = *b"RFKB";

/// Current snapshot format version.
///
/// Increment this when making breaking changes to the snapshot layout or to
/// the structural fingerprint.
pub const FORMAT_VERSION: u32 = 1;

/// Maximum accepted snapshot size, validated before any payload parsing.
pub const MAX_SNAPSHOT_SIZE: usize = 256 * 1024 * 1024; // 256 MB

/// Maximum number of packages a snapshot header may announce.
pub const MAX_PACKAGE_COUNT: u32 = 100_000;

/// Default package version when a definition has no `version` statement.
pub const DEFAULT_PACKAGE_VERSION: u32 = 1;

/// Default agenda budget for a single `fire_all_rules` call.
pub const DEFAULT_MAX_FIRINGS: usize = 10_000;

/// Name segments that mark a package as generated/internal.
///
/// Internal packages hold synthesized type-support declarations and are never
/// replaced by a reload.
pub const RESERVED_PACKAGE_SEGMENTS: &[&str] = &["generated", "model"];

/// Loading context used when the host does not name one.
pub const DEFAULT_LOADING_CONTEXT: &str = "default";

// =============================================================================
// INPUT VALIDATION LIMITS
// =============================================================================

/// Maximum length of a single rule-definition source.
pub const MAX_SOURCE_LENGTH: usize = 4 * 1024 * 1024;

/// Maximum number of fields a declared type may carry.
pub const MAX_FIELDS_PER_TYPE: usize = 256;

/// Maximum number of tuples one condition may produce during matching.
///
/// Bounds the cross product of multi-pattern rules.
pub const MAX_MATCH_TUPLES: usize = 100_000;

/// Maximum nesting depth of a rule condition.
///
/// Applies to source syntax and to compiled condition trees, including
/// trees decoded from snapshots.
pub const MAX_CONDITION_DEPTH: usize = 64;
