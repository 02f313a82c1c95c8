//! # Snapshot Codec
//!
//! Binary snapshots of a knowledge base or of a bare package set.
//!
//! Format:
//! ```text
//! [header_len: u32 LE] [SnapshotHeader (postcard)] [SnapshotBody (postcard)]
//! ```
//!
//! Packages are written in lexicographic order of name with their declared
//! types inline. Rule bodies are the compiled form and reference types by
//! qualified name plus structural fingerprint.
//!
//! ## Type Binding on Read
//!
//! Every type of the snapshot is resolved against the caller's registry:
//! 1. registry entry with an equal descriptor: bind to it
//! 2. no entry, declared by a package of this snapshot: synthesize and register
//! 3. no entry, declared elsewhere: `UnresolvedTypeAtDeserialization`
//!
//! The whole plan is computed before the registry is touched, so a failed
//! read registers nothing.

use crate::knowledge::KnowledgeBase;
use crate::package::{CompiledPackage, CompiledRule, TypeRef};
use crate::primitives::{FORMAT_VERSION, MAGIC_BYTES, MAX_PACKAGE_COUNT, MAX_SNAPSHOT_SIZE};
use crate::registry::{RegistryDelta, TypeRegistry};
use crate::types::{FactTypeDescriptor, KnowledgeError, TypeFingerprint};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// HEADER
// =============================================================================

/// Entity kind held by a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotKind {
    FullBase,
    PackageSet,
}

impl SnapshotKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FullBase => "full-base",
            Self::PackageSet => "package-set",
        }
    }
}

/// Header preceding the snapshot body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub magic: [u8; 4],
    pub format_version: u32,
    pub kind: SnapshotKind,
    pub package_count: u32,
    /// Loading context of the writer. Empty for package sets.
    pub context: String,
    /// BLAKE3 of the body bytes, first 8 bytes little-endian.
    pub checksum: u64,
}

impl SnapshotHeader {
    /// Validate magic, version and announced counts.
    pub fn validate(&self) -> Result<(), KnowledgeError> {
        if self.magic != MAGIC_BYTES {
            return Err(KnowledgeError::DeserializationError(
                "Invalid file format".to_string(),
            ));
        }
        if self.format_version != FORMAT_VERSION {
            return Err(KnowledgeError::DeserializationError(format!(
                "Unsupported format version: {} (expected {})",
                self.format_version, FORMAT_VERSION
            )));
        }
        if self.package_count > MAX_PACKAGE_COUNT {
            return Err(KnowledgeError::DeserializationError(format!(
                "Package count {} exceeds maximum allowed {}",
                self.package_count, MAX_PACKAGE_COUNT
            )));
        }
        Ok(())
    }
}

// =============================================================================
// BODY
// =============================================================================

/// A declared type with its stored fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRecord {
    pub descriptor: FactTypeDescriptor,
    pub fingerprint: TypeFingerprint,
}

/// One package as stored in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub name: String,
    pub version: u32,
    pub rules: Vec<CompiledRule>,
    pub types: Vec<TypeRecord>,
    /// Sorted.
    pub dependencies: Vec<String>,
}

impl From<&CompiledPackage> for PackageRecord {
    fn from(package: &CompiledPackage) -> Self {
        Self {
            name: package.name().to_string(),
            version: package.version(),
            rules: package.rules().to_vec(),
            types: package
                .declared_types()
                .iter()
                .map(|d| TypeRecord {
                    descriptor: d.clone(),
                    fingerprint: d.fingerprint(),
                })
                .collect(),
            dependencies: package.dependencies().iter().cloned().collect(),
        }
    }
}

impl From<PackageRecord> for CompiledPackage {
    fn from(record: PackageRecord) -> Self {
        CompiledPackage::new(
            record.name,
            record.version,
            record.rules,
            record.types.into_iter().map(|t| t.descriptor).collect(),
            record.dependencies.into_iter().collect(),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotBody {
    /// Sorted by name.
    packages: Vec<PackageRecord>,
    /// Registry references of a full base: types used by rule bodies but
    /// declared by no package of the base.
    external_types: Vec<TypeRef>,
}

/// Result of [`read`].
#[derive(Debug)]
pub enum Decoded {
    Base(KnowledgeBase),
    Packages(Vec<CompiledPackage>),
}

/// Content overview of a snapshot, without binding any type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub header: SnapshotHeader,
    pub packages: Vec<PackageRecord>,
    pub external_types: Vec<TypeRef>,
}

/// BLAKE3 of `body`, first 8 bytes little-endian.
#[must_use]
pub fn snapshot_checksum(body: &[u8]) -> u64 {
    let digest = blake3::hash(body);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(head)
}

// =============================================================================
// WRITE
// =============================================================================

/// Encode a whole knowledge base.
pub fn write_base(kbase: &KnowledgeBase) -> Result<Vec<u8>, KnowledgeError> {
    let packages = kbase.packages();
    let declared: BTreeSet<&str> = packages
        .iter()
        .flat_map(|p| p.declared_types().iter().map(|d| d.name.as_str()))
        .collect();
    let external_types: BTreeSet<TypeRef> = packages
        .iter()
        .flat_map(|p| p.type_refs())
        .filter(|r| !declared.contains(r.name.as_str()))
        .cloned()
        .collect();

    let body = SnapshotBody {
        packages: packages.iter().map(|p| PackageRecord::from(p.as_ref())).collect(),
        external_types: external_types.into_iter().collect(),
    };
    encode(
        SnapshotKind::FullBase,
        kbase.registry().context().as_str(),
        &body,
    )
}

/// Encode a bare set of packages.
pub fn write_packages(packages: &[CompiledPackage]) -> Result<Vec<u8>, KnowledgeError> {
    let mut records: Vec<PackageRecord> = packages.iter().map(PackageRecord::from).collect();
    records.sort_by(|a, b| a.name.cmp(&b.name));
    if let Some(pair) = records.windows(2).find(|w| w[0].name == w[1].name) {
        return Err(KnowledgeError::DuplicatePackage(pair[0].name.clone()));
    }
    let body = SnapshotBody {
        packages: records,
        external_types: Vec::new(),
    };
    encode(SnapshotKind::PackageSet, "", &body)
}

fn encode(kind: SnapshotKind, context: &str, body: &SnapshotBody) -> Result<Vec<u8>, KnowledgeError> {
    let package_count = u32::try_from(body.packages.len())
        .ok()
        .filter(|n| *n <= MAX_PACKAGE_COUNT)
        .ok_or_else(|| {
            KnowledgeError::SerializationError(format!(
                "{} packages exceed maximum allowed {}",
                body.packages.len(),
                MAX_PACKAGE_COUNT
            ))
        })?;

    let body_bytes = postcard::to_allocvec(body)
        .map_err(|e| KnowledgeError::SerializationError(format!("Body: {}", e)))?;
    let header = SnapshotHeader {
        magic: MAGIC_BYTES,
        format_version: FORMAT_VERSION,
        kind,
        package_count,
        context: context.to_string(),
        checksum: snapshot_checksum(&body_bytes),
    };
    let header_bytes = postcard::to_allocvec(&header)
        .map_err(|e| KnowledgeError::SerializationError(format!("Header: {}", e)))?;
    let header_len = u32::try_from(header_bytes.len())
        .map_err(|_| KnowledgeError::SerializationError("Header too large".to_string()))?;

    let mut out = Vec::with_capacity(4 + header_bytes.len() + body_bytes.len());
    out.extend_from_slice(&header_len.to_le_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&body_bytes);

    tracing::debug!(
        kind = kind.as_str(),
        packages = package_count,
        bytes = out.len(),
        "snapshot written"
    );
    Ok(out)
}

// =============================================================================
// READ
// =============================================================================

fn split(data: &[u8]) -> Result<(SnapshotHeader, &[u8]), KnowledgeError> {
    if data.len() > MAX_SNAPSHOT_SIZE {
        return Err(KnowledgeError::DeserializationError(format!(
            "Snapshot size {} exceeds maximum allowed {}",
            data.len(),
            MAX_SNAPSHOT_SIZE
        )));
    }
    let Some(len_bytes) = data.get(..4) else {
        return Err(KnowledgeError::DeserializationError(
            "Data too short".to_string(),
        ));
    };
    let header_len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
        as usize;
    let header_end = 4usize
        .checked_add(header_len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| {
            KnowledgeError::DeserializationError("Data too short for header".to_string())
        })?;

    let header: SnapshotHeader = postcard::from_bytes(&data[4..header_end])
        .map_err(|e| KnowledgeError::DeserializationError(format!("Header: {}", e)))?;
    header.validate()?;
    Ok((header, &data[header_end..]))
}

fn decode(data: &[u8]) -> Result<(SnapshotHeader, SnapshotBody), KnowledgeError> {
    let (header, body_bytes) = split(data)?;

    let computed = snapshot_checksum(body_bytes);
    if computed != header.checksum {
        return Err(KnowledgeError::DeserializationError(format!(
            "Checksum mismatch: expected {:016x}, got {:016x}",
            header.checksum, computed
        )));
    }

    let body: SnapshotBody = postcard::from_bytes(body_bytes)
        .map_err(|e| KnowledgeError::DeserializationError(format!("Body: {}", e)))?;
    if body.packages.len() != header.package_count as usize {
        return Err(KnowledgeError::DeserializationError(
            "Package count mismatch".to_string(),
        ));
    }
    if let Some(pair) = body.packages.windows(2).find(|w| w[0].name >= w[1].name) {
        return Err(KnowledgeError::DeserializationError(format!(
            "Packages not in canonical order at {}",
            pair[1].name
        )));
    }
    Ok((header, body))
}

/// Read only the header.
pub fn peek_header(data: &[u8]) -> Result<SnapshotHeader, KnowledgeError> {
    split(data).map(|(header, _)| header)
}

/// Decode a snapshot without touching any registry.
pub fn summarize(data: &[u8]) -> Result<SnapshotSummary, KnowledgeError> {
    let (header, body) = decode(data)?;
    Ok(SnapshotSummary {
        header,
        packages: body.packages,
        external_types: body.external_types,
    })
}

/// Compute the registrations a read needs, or the reason it cannot proceed.
fn plan(body: &SnapshotBody, registry: &TypeRegistry) -> Result<RegistryDelta, KnowledgeError> {
    let mut declared: BTreeMap<&str, &FactTypeDescriptor> = BTreeMap::new();
    for package in &body.packages {
        for record in &package.types {
            let descriptor = &record.descriptor;
            if record.fingerprint != descriptor.fingerprint() {
                return Err(KnowledgeError::DeserializationError(format!(
                    "Stored fingerprint of {} does not match its fields",
                    descriptor.name
                )));
            }
            if let Some(previous) = declared.insert(descriptor.name.as_str(), descriptor) {
                if !previous.is_structurally_equal(descriptor) {
                    return Err(KnowledgeError::conflict(
                        &descriptor.name,
                        format!("declared differently by package {}", package.name),
                    ));
                }
            }
        }
    }

    let mut delta = RegistryDelta::default();
    for (name, descriptor) in &declared {
        match registry.get(name) {
            Some(existing) if existing.descriptor().is_structurally_equal(descriptor) => {}
            Some(existing) => {
                return Err(KnowledgeError::conflict(
                    *name,
                    format!(
                        "registry binds fingerprint {} ({}), snapshot declares {} ({})",
                        existing.fingerprint(),
                        existing.descriptor().origin.tag(),
                        descriptor.fingerprint(),
                        descriptor.origin.tag()
                    ),
                ));
            }
            None => delta.register.push(registry.synthesize((*descriptor).clone())),
        }
    }

    for package in &body.packages {
        let refs: BTreeSet<&TypeRef> = package.rules.iter().flat_map(|r| r.type_refs()).collect();
        for type_ref in refs {
            let fingerprint = match declared.get(type_ref.name.as_str()) {
                Some(descriptor) => descriptor.fingerprint(),
                None => registry
                    .get(&type_ref.name)
                    .map(|h| h.fingerprint())
                    .ok_or_else(|| KnowledgeError::UnresolvedTypeAtDeserialization {
                        type_name: type_ref.name.clone(),
                        package: package.name.clone(),
                    })?,
            };
            if fingerprint != type_ref.fingerprint {
                return Err(KnowledgeError::conflict(
                    &type_ref.name,
                    format!(
                        "package {} was compiled against fingerprint {}, found {}",
                        package.name, type_ref.fingerprint, fingerprint
                    ),
                ));
            }
        }
    }
    Ok(delta)
}

/// Decode a snapshot, binding its types through `registry`.
pub fn read(data: &[u8], registry: &TypeRegistry) -> Result<Decoded, KnowledgeError> {
    let (header, body) = decode(data)?;

    if !header.context.is_empty() && header.context != registry.context().as_str() {
        tracing::warn!(
            written = %header.context,
            reading = %registry.context(),
            "snapshot written under a different loading context"
        );
    }

    let delta = plan(&body, registry)?;
    registry.apply(&delta)?;
    let synthesized = delta.register.len();
    let packages: Vec<CompiledPackage> = body.packages.into_iter().map(CompiledPackage::from).collect();

    tracing::info!(
        kind = header.kind.as_str(),
        packages = packages.len(),
        synthesized,
        "snapshot read"
    );

    match header.kind {
        SnapshotKind::PackageSet => Ok(Decoded::Packages(packages)),
        SnapshotKind::FullBase => {
            let kbase = KnowledgeBase::new(registry.clone());
            for package in packages {
                if let Err(e) = kbase.add_package(package) {
                    let rollback = RegistryDelta {
                        register: Vec::new(),
                        unregister: delta.register,
                    };
                    if let Err(undo) = registry.apply(&rollback) {
                        tracing::warn!(error = %undo, "failed to roll back snapshot types");
                    }
                    return Err(e);
                }
            }
            Ok(Decoded::Base(kbase))
        }
    }
}

/// Decode a full-base snapshot.
pub fn read_base(data: &[u8], registry: &TypeRegistry) -> Result<KnowledgeBase, KnowledgeError> {
    expect_kind(data, SnapshotKind::FullBase)?;
    match read(data, registry)? {
        Decoded::Base(kbase) => Ok(kbase),
        Decoded::Packages(_) => Err(kind_error(SnapshotKind::FullBase)),
    }
}

/// Decode a package-set snapshot.
pub fn read_packages(
    data: &[u8],
    registry: &TypeRegistry,
) -> Result<Vec<CompiledPackage>, KnowledgeError> {
    expect_kind(data, SnapshotKind::PackageSet)?;
    match read(data, registry)? {
        Decoded::Packages(packages) => Ok(packages),
        Decoded::Base(_) => Err(kind_error(SnapshotKind::PackageSet)),
    }
}

fn expect_kind(data: &[u8], kind: SnapshotKind) -> Result<(), KnowledgeError> {
    if peek_header(data)?.kind == kind {
        Ok(())
    } else {
        Err(kind_error(kind))
    }
}

fn kind_error(expected: SnapshotKind) -> KnowledgeError {
    KnowledgeError::DeserializationError(format!("Expected a {} snapshot", expected.as_str()))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::RuleCompiler;
    use crate::package::Condition;
    use crate::primitives::MAX_CONDITION_DEPTH;
    use crate::registry::{HandleProvenance, LoadingContext, external_type};
    use crate::types::{FieldDef, FieldType};

    const FACTS: &str = r#"
package com.acme.rules.generated.facts;
declare TransientFact
    name : String
end
"#;

    const RULES: &str = r#"
package com.acme.rules;
import com.acme.rules.generated.facts.TransientFact;
rule "seed" when then insert TransientFact(name = "x"); end
rule "see" when TransientFact() then log "seen"; end
"#;

    fn packages() -> (CompiledPackage, CompiledPackage) {
        let compiler = RuleCompiler::new();
        (
            compiler.compile(FACTS, &[]).expect("facts"),
            compiler.compile(RULES, &[FACTS]).expect("rules"),
        )
    }

    fn full_base() -> KnowledgeBase {
        let (facts, rules) = packages();
        let kb = KnowledgeBase::new(TypeRegistry::default());
        kb.add_package(facts).expect("facts");
        kb.add_package(rules).expect("rules");
        kb
    }

    #[test]
    fn header_describes_content() {
        let bytes = write_base(&full_base()).expect("write");
        let header = peek_header(&bytes).expect("header");
        assert_eq!(header.kind, SnapshotKind::FullBase);
        assert_eq!(header.package_count, 2);
        assert_eq!(header.context, "default");
        assert_eq!(header.format_version, FORMAT_VERSION);
    }

    #[test]
    fn base_round_trip_synthesizes_declared_types() {
        let bytes = write_base(&full_base()).expect("write");
        let registry = TypeRegistry::default();
        let kb = read_base(&bytes, &registry).expect("read");

        assert_eq!(kb.package_count(), 2);
        assert_eq!(kb.rule_count(), 2);
        let handle = kb
            .fact_type("com.acme.rules.generated.facts.TransientFact")
            .expect("declared type");
        assert_eq!(handle.provenance(), HandleProvenance::Synthesized);
        assert_eq!(
            registry.get("com.acme.rules.generated.facts.TransientFact"),
            Some(handle)
        );
    }

    #[test]
    fn package_order_is_canonical() {
        let (facts, rules) = packages();
        let a = write_packages(&[facts.clone(), rules.clone()]).expect("a");
        let b = write_packages(&[rules, facts]).expect("b");
        assert_eq!(a, b);
    }

    #[test]
    fn rules_alone_do_not_resolve() {
        let (_, rules) = packages();
        let bytes = write_packages(&[rules]).expect("write");
        let registry = TypeRegistry::default();
        let result = read_packages(&bytes, &registry);
        assert!(matches!(
            result,
            Err(KnowledgeError::UnresolvedTypeAtDeserialization { ref package, .. })
                if package == "com.acme.rules"
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn registry_entry_binds_existing_handle() {
        let (facts, rules) = packages();
        let registry = TypeRegistry::default();
        let existing = registry
            .register(facts.declared_types()[0].clone())
            .expect("register");

        let bytes = write_packages(&[rules]).expect("write");
        let decoded = read_packages(&bytes, &registry).expect("read");
        assert_eq!(decoded.len(), 1);
        assert_eq!(
            registry.get("com.acme.rules.generated.facts.TransientFact"),
            Some(existing)
        );
    }

    #[test]
    fn conflicting_registry_entry_fails_cleanly() {
        let registry = TypeRegistry::default();
        registry
            .register(external_type(
                "com.acme.rules.generated.facts.TransientFact",
                vec![FieldDef::new("name", FieldType::Int)],
            ))
            .expect("register");
        let bytes = write_base(&full_base()).expect("write");
        let result = read_base(&bytes, &registry);
        assert!(matches!(result, Err(KnowledgeError::TypeConflict { .. })));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn external_types_listed_for_full_base() {
        let registry = TypeRegistry::default();
        registry
            .register(external_type(
                "com.host.Order",
                vec![FieldDef::new("total", FieldType::Int)],
            ))
            .expect("register");
        let src = "package com.acme;\nimport com.host.Order;\n\
                   rule \"r\" when Order() then log \"o\"; end";
        let pkg = RuleCompiler::with_registry(registry.clone())
            .compile(src, &[])
            .expect("compile");
        let kb = KnowledgeBase::new(registry);
        kb.add_package(pkg).expect("add");

        let summary = summarize(&write_base(&kb).expect("write")).expect("summary");
        assert_eq!(summary.external_types.len(), 1);
        assert_eq!(summary.external_types[0].name, "com.host.Order");
    }

    #[test]
    fn kind_mismatch_rejected() {
        let bytes = write_base(&full_base()).expect("write");
        let result = read_packages(&bytes, &TypeRegistry::default());
        assert!(matches!(result, Err(KnowledgeError::DeserializationError(_))));
    }

    #[test]
    fn context_mismatch_still_reads() {
        let bytes = write_base(&full_base()).expect("write");
        let registry = TypeRegistry::new(LoadingContext::new("other"));
        assert!(read_base(&bytes, &registry).is_ok());
    }

    #[test]
    fn duplicate_package_in_set_rejected() {
        let (facts, _) = packages();
        let result = write_packages(&[facts.clone(), facts]);
        assert!(matches!(result, Err(KnowledgeError::DuplicatePackage(_))));
    }

    // =========================================================================
    // Corrupted input
    // =========================================================================

    #[test]
    fn empty_and_short_data() {
        assert!(peek_header(&[]).is_err());
        assert!(peek_header(&[0x01, 0x02, 0x03]).is_err());
    }

    #[test]
    fn header_length_exceeds_data() {
        let mut data = vec![0xe8, 0x03, 0x00, 0x00];
        data.extend_from_slice(&[0x00, 0x00, 0x00]);
        assert!(peek_header(&data).is_err());
    }

    #[test]
    fn invalid_magic_bytes() {
        let mut bytes = write_base(&full_base()).expect("write");
        bytes[4] = 0xFF;
        let result = read(&bytes, &TypeRegistry::default());
        assert!(matches!(result, Err(KnowledgeError::DeserializationError(_))));
    }

    #[test]
    fn corrupted_body_fails_checksum() {
        let mut bytes = write_base(&full_base()).expect("write");
        if let Some(last) = bytes.last_mut() {
            *last ^= 0xFF;
        }
        let registry = TypeRegistry::default();
        let result = read(&bytes, &registry);
        assert!(
            matches!(&result, Err(KnowledgeError::DeserializationError(m)) if m.contains("Checksum"))
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn truncated_body_fails() {
        let bytes = write_base(&full_base()).expect("write");
        let truncated = &bytes[..bytes.len() - 3];
        assert!(read(truncated, &TypeRegistry::default()).is_err());
    }

    #[test]
    fn over_deep_condition_rejected_before_binding() {
        let mut condition = Condition::Eval(true);
        for _ in 0..=MAX_CONDITION_DEPTH {
            condition = Condition::Not(Box::new(condition));
        }
        let rule = CompiledRule {
            name: "deep".to_string(),
            salience: 0,
            condition,
            actions: Vec::new(),
        };
        let package =
            CompiledPackage::new("com.acme.deep", 1, vec![rule], Vec::new(), BTreeSet::new());
        let bytes = write_packages(&[package]).expect("write");

        let registry = TypeRegistry::default();
        assert!(matches!(
            read(&bytes, &registry),
            Err(KnowledgeError::DeserializationError(_))
        ));
        assert!(summarize(&bytes).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn reading_does_not_mutate_snapshot() {
        let bytes = write_base(&full_base()).expect("write");
        let copy = bytes.clone();
        read(&bytes, &TypeRegistry::default()).expect("first");
        read(&bytes, &TypeRegistry::default()).expect("second");
        assert_eq!(bytes, copy);
    }
}
