//! # CLI Command Implementations
//!
//! Each command does its file I/O here and returns a report; printing is
//! left to [`super::execute`].

use ruleforge_core::primitives::{MAX_SNAPSHOT_SIZE, MAX_SOURCE_LENGTH};
use ruleforge_core::{
    CompiledPackage, FieldValue, KnowledgeBase, KnowledgeError, LoadingContext,
    PackageReloadCoordinator, ReloadPolicy, RuleCompiler, SnapshotSummary, TypeRegistry,
    peek_header, read_base, read_packages, summarize, write_base, write_packages,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

// =============================================================================
// FILE SIZE LIMITS
// =============================================================================

/// Maximum size of a rule definition file.
const MAX_SOURCE_FILE_SIZE: u64 = MAX_SOURCE_LENGTH as u64;

/// Maximum size of a snapshot file.
const MAX_SNAPSHOT_FILE_SIZE: u64 = MAX_SNAPSHOT_SIZE as u64;

/// Maximum size of a facts file (100 MB).
const MAX_FACTS_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Validate file size before reading.
fn validate_file_size(path: &Path, max_size: u64) -> Result<(), KnowledgeError> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| KnowledgeError::IoError(format!("Cannot read file metadata: {}", e)))?;

    if metadata.len() > max_size {
        return Err(KnowledgeError::IoError(format!(
            "File size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            max_size
        )));
    }
    Ok(())
}

/// Canonicalize an input path and ensure it names a regular file.
fn validate_file_path(path: &Path) -> Result<PathBuf, KnowledgeError> {
    let canonical = path.canonicalize().map_err(|e| {
        KnowledgeError::IoError(format!("Invalid file path '{}': {}", path.display(), e))
    })?;

    if !canonical.is_file() {
        return Err(KnowledgeError::IoError(format!(
            "Path '{}' is not a regular file",
            path.display()
        )));
    }

    Ok(canonical)
}

/// Resolve an output path against its canonicalized parent directory.
fn validate_output_path(path: &Path) -> Result<PathBuf, KnowledgeError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let canonical_parent = parent.canonicalize().map_err(|e| {
        KnowledgeError::IoError(format!(
            "Invalid output directory '{}': {}",
            parent.display(),
            e
        ))
    })?;

    let file_name = path.file_name().ok_or_else(|| {
        KnowledgeError::IoError(format!("Invalid output path '{}'", path.display()))
    })?;

    let output = canonical_parent.join(file_name);
    if output.is_dir() {
        return Err(KnowledgeError::IoError(format!(
            "Output path '{}' is a directory",
            path.display()
        )));
    }
    Ok(output)
}

fn read_text(path: &Path, max_size: u64) -> Result<String, KnowledgeError> {
    let validated = validate_file_path(path)?;
    validate_file_size(&validated, max_size)?;
    std::fs::read_to_string(&validated)
        .map_err(|e| KnowledgeError::IoError(format!("Read file '{}': {}", path.display(), e)))
}

fn read_snapshot(path: &Path) -> Result<Vec<u8>, KnowledgeError> {
    let validated = validate_file_path(path)?;
    validate_file_size(&validated, MAX_SNAPSHOT_FILE_SIZE)?;
    std::fs::read(&validated)
        .map_err(|e| KnowledgeError::IoError(format!("Read file '{}': {}", path.display(), e)))
}

fn write_snapshot(path: &Path, data: &[u8]) -> Result<PathBuf, KnowledgeError> {
    let validated = validate_output_path(path)?;
    std::fs::write(&validated, data)
        .map_err(|e| KnowledgeError::IoError(format!("Write file '{}': {}", path.display(), e)))?;
    Ok(validated)
}

fn read_declared(paths: &[PathBuf]) -> Result<Vec<String>, KnowledgeError> {
    paths
        .iter()
        .map(|p| read_text(p, MAX_SOURCE_FILE_SIZE))
        .collect()
}

/// Checksum field of a written snapshot, as hex.
fn checksum_of(data: &[u8]) -> Result<String, KnowledgeError> {
    Ok(format!("{:016x}", peek_header(data)?.checksum))
}

// =============================================================================
// REPORTS
// =============================================================================

/// Result of a command that writes a snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct WriteReport {
    pub kind: String,
    pub output: String,
    pub packages: Vec<String>,
    pub rules: usize,
    pub bytes: usize,
    pub checksum: String,
}

impl fmt::Display for WriteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Wrote {} snapshot: {} bytes to {}",
            self.kind, self.bytes, self.output
        )?;
        writeln!(f, "Checksum: {}", self.checksum)?;
        write!(
            f,
            "Packages: {} ({} rules)",
            self.packages.join(", "),
            self.rules
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PackageSummary {
    pub name: String,
    pub version: u32,
    pub rules: Vec<String>,
    pub declared_types: Vec<String>,
    pub dependencies: Vec<String>,
}

/// Result of [`cmd_inspect`].
#[derive(Debug, Clone, Serialize)]
pub struct InspectReport {
    pub kind: String,
    pub format_version: u32,
    pub context: String,
    pub checksum: String,
    pub packages: Vec<PackageSummary>,
    pub external_types: Vec<String>,
}

impl From<SnapshotSummary> for InspectReport {
    fn from(summary: SnapshotSummary) -> Self {
        Self {
            kind: summary.header.kind.as_str().to_string(),
            format_version: summary.header.format_version,
            context: summary.header.context,
            checksum: format!("{:016x}", summary.header.checksum),
            packages: summary
                .packages
                .into_iter()
                .map(|p| PackageSummary {
                    name: p.name,
                    version: p.version,
                    rules: p.rules.into_iter().map(|r| r.name).collect(),
                    declared_types: p.types.into_iter().map(|t| t.descriptor.name).collect(),
                    dependencies: p.dependencies,
                })
                .collect(),
            external_types: summary
                .external_types
                .into_iter()
                .map(|t| t.name)
                .collect(),
        }
    }
}

impl fmt::Display for InspectReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Kind:           {}", self.kind)?;
        writeln!(f, "Format version: {}", self.format_version)?;
        if !self.context.is_empty() {
            writeln!(f, "Context:        {}", self.context)?;
        }
        write!(f, "Checksum:       {}", self.checksum)?;
        for package in &self.packages {
            write!(
                f,
                "\n  {} v{}: {} rules",
                package.name,
                package.version,
                package.rules.len()
            )?;
            if !package.declared_types.is_empty() {
                write!(f, "\n    declares: {}", package.declared_types.join(", "))?;
            }
            if !package.dependencies.is_empty() {
                write!(f, "\n    depends on: {}", package.dependencies.join(", "))?;
            }
        }
        if !self.external_types.is_empty() {
            write!(f, "\nExternal types: {}", self.external_types.join(", "))?;
        }
        Ok(())
    }
}

/// Result of [`cmd_fire`].
#[derive(Debug, Clone, Serialize)]
pub struct FireReport {
    pub fired: usize,
    pub facts: usize,
    pub output: Vec<String>,
}

impl fmt::Display for FireReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Fired {} activations ({} facts in working memory)",
            self.fired, self.facts
        )?;
        for line in &self.output {
            write!(f, "\n  {}", line)?;
        }
        Ok(())
    }
}

/// Result of [`cmd_reload`].
#[derive(Debug, Clone, Serialize)]
pub struct SwapReport {
    pub replaced: Vec<String>,
    pub skipped_internal: Vec<String>,
    pub skipped_absent: Vec<String>,
    pub written: WriteReport,
}

impl fmt::Display for SwapReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.replaced.is_empty() {
            writeln!(f, "No package replaced")?;
        } else {
            writeln!(f, "Replaced: {}", self.replaced.join(", "))?;
        }
        if !self.skipped_internal.is_empty() {
            writeln!(f, "Skipped (internal): {}", self.skipped_internal.join(", "))?;
        }
        if !self.skipped_absent.is_empty() {
            writeln!(f, "Skipped (absent): {}", self.skipped_absent.join(", "))?;
        }
        write!(f, "{}", self.written)
    }
}

// =============================================================================
// COMPILE / BUILD COMMANDS
// =============================================================================

/// Compile one definition and write it as a package-set snapshot.
pub fn cmd_compile(
    source: &Path,
    declared: &[PathBuf],
    output: &Path,
) -> Result<WriteReport, KnowledgeError> {
    let definition = read_text(source, MAX_SOURCE_FILE_SIZE)?;
    let declared = read_declared(declared)?;
    let declared: Vec<&str> = declared.iter().map(String::as_str).collect();

    let package = RuleCompiler::new().compile(&definition, &declared)?;
    let data = write_packages(std::slice::from_ref(&package))?;
    let written = write_snapshot(output, &data)?;

    tracing::info!(package = package.name(), output = %written.display(), "package compiled");

    Ok(WriteReport {
        kind: "package-set".to_string(),
        output: written.display().to_string(),
        packages: vec![package.name().to_string()],
        rules: package.rule_count(),
        bytes: data.len(),
        checksum: checksum_of(&data)?,
    })
}

/// Compile every definition into one base and write a full-base snapshot.
pub fn cmd_build(
    sources: &[PathBuf],
    declared: &[PathBuf],
    output: &Path,
    context: &LoadingContext,
) -> Result<WriteReport, KnowledgeError> {
    let declared = read_declared(declared)?;
    let declared: Vec<&str> = declared.iter().map(String::as_str).collect();

    let compiler = RuleCompiler::new();
    let kbase = KnowledgeBase::new(TypeRegistry::new(context.clone()));
    for source in sources {
        let definition = read_text(source, MAX_SOURCE_FILE_SIZE)?;
        kbase.add_package(compiler.compile(&definition, &declared)?)?;
    }

    let data = write_base(&kbase)?;
    let written = write_snapshot(output, &data)?;

    tracing::info!(
        packages = kbase.package_count(),
        output = %written.display(),
        "knowledge base built"
    );

    Ok(WriteReport {
        kind: "full-base".to_string(),
        output: written.display().to_string(),
        packages: kbase.package_names(),
        rules: kbase.rule_count(),
        bytes: data.len(),
        checksum: checksum_of(&data)?,
    })
}

// =============================================================================
// INSPECT COMMAND
// =============================================================================

/// Summarize a snapshot without binding its types.
pub fn cmd_inspect(input: &Path) -> Result<InspectReport, KnowledgeError> {
    let data = read_snapshot(input)?;
    Ok(InspectReport::from(summarize(&data)?))
}

// =============================================================================
// FIRE COMMAND
// =============================================================================

/// One entry of a facts file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FactInput {
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default)]
    fields: serde_json::Map<String, serde_json::Value>,
}

fn field_value(
    type_name: &str,
    field: &str,
    value: &serde_json::Value,
) -> Result<FieldValue, KnowledgeError> {
    match value {
        serde_json::Value::String(s) => Ok(FieldValue::Str(s.clone())),
        serde_json::Value::Bool(b) => Ok(FieldValue::Bool(*b)),
        serde_json::Value::Number(n) => n.as_i64().map(FieldValue::Int).ok_or_else(|| {
            KnowledgeError::InvalidFact(format!(
                "{}.{}: {} is not a 64-bit integer",
                type_name, field, n
            ))
        }),
        other => Err(KnowledgeError::InvalidFact(format!(
            "{}.{}: unsupported value {}",
            type_name, field, other
        ))),
    }
}

/// Parse a facts file into `(type, fields)` pairs.
fn parse_facts(text: &str) -> Result<Vec<(String, Vec<(String, FieldValue)>)>, KnowledgeError> {
    let inputs: Vec<FactInput> = serde_json::from_str(text)
        .map_err(|e| KnowledgeError::DeserializationError(format!("Facts file: {}", e)))?;

    inputs
        .into_iter()
        .map(|input| {
            let values = input
                .fields
                .iter()
                .map(|(field, value)| {
                    Ok((field.clone(), field_value(&input.type_name, field, value)?))
                })
                .collect::<Result<Vec<_>, KnowledgeError>>()?;
            Ok((input.type_name, values))
        })
        .collect()
}

/// Read a base, materialize a session, insert facts and fire all rules.
pub fn cmd_fire(
    input: &Path,
    facts: Option<&Path>,
    context: &LoadingContext,
    max_firings: usize,
) -> Result<FireReport, KnowledgeError> {
    let data = read_snapshot(input)?;
    let facts = match facts {
        Some(path) => parse_facts(&read_text(path, MAX_FACTS_FILE_SIZE)?)?,
        None => Vec::new(),
    };

    let kbase = read_base(&data, &TypeRegistry::new(context.clone()))?;
    let mut session = kbase.materialize()?;
    session.set_max_firings(max_firings);
    for (type_name, values) in facts {
        session.insert(&type_name, values)?;
    }
    let fired = session.fire_all_rules()?;

    Ok(FireReport {
        fired,
        facts: session.fact_count(),
        output: session.output().to_vec(),
    })
}

// =============================================================================
// RELOAD COMMAND
// =============================================================================

/// Registry to decode a package set against: every type of the base except
/// the ones the set declares itself. A changed redeclaration is then judged
/// by the replace transaction instead of failing the read.
fn reload_registry(
    kbase: &KnowledgeBase,
    package_data: &[u8],
    context: &LoadingContext,
) -> Result<TypeRegistry, KnowledgeError> {
    let redeclared: BTreeSet<String> = summarize(package_data)?
        .packages
        .into_iter()
        .flat_map(|p| p.types.into_iter().map(|t| t.descriptor.name))
        .collect();

    let scratch = TypeRegistry::new(context.clone());
    for name in kbase.registry().names() {
        if redeclared.contains(&name) {
            continue;
        }
        if let Some(handle) = kbase.registry().get(&name) {
            scratch.register(handle.descriptor().clone())?;
        }
    }
    Ok(scratch)
}

/// Replace packages of a base snapshot and write the result.
///
/// The package set is decoded into its own registry; the base binds the new
/// declarations when the packages are swapped in.
pub fn cmd_reload(
    input: &Path,
    packages: &Path,
    output: &Path,
    context: &LoadingContext,
    policy: ReloadPolicy,
) -> Result<SwapReport, KnowledgeError> {
    let base_data = read_snapshot(input)?;
    let package_data = read_snapshot(packages)?;

    let kbase = read_base(&base_data, &TypeRegistry::new(context.clone()))?;
    let scratch = reload_registry(&kbase, &package_data, context)?;
    let new_packages: Vec<CompiledPackage> = read_packages(&package_data, &scratch)?;

    let report = PackageReloadCoordinator::new(policy).replace(&kbase, new_packages)?;

    let data = write_base(&kbase)?;
    let written = write_snapshot(output, &data)?;

    Ok(SwapReport {
        replaced: report.replaced,
        skipped_internal: report.skipped_internal,
        skipped_absent: report.skipped_absent,
        written: WriteReport {
            kind: "full-base".to_string(),
            output: written.display().to_string(),
            packages: kbase.package_names(),
            rules: kbase.rule_count(),
            bytes: data.len(),
            checksum: checksum_of(&data)?,
        },
    })
}

