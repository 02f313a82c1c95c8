//! Integration tests for the Ruleforge CLI commands.
//!
//! Commands are called directly against files in a temporary directory.

// Allow unwrap and panic in tests - these are standard for test code
#![allow(clippy::unwrap_used, clippy::panic)]

use ruleforge::cli::{cmd_build, cmd_compile, cmd_fire, cmd_inspect, cmd_reload};
use ruleforge::config::Config;
use ruleforge_core::{KnowledgeError, LoadingContext, ReloadPolicy};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const FACTS: &str = r#"
package com.acme.rules.generated.facts;

declare TransientFact
    name : String
    hits : int
end
"#;

const RULES: &str = r#"
package com.acme.rules;
import com.acme.rules.generated.facts.TransientFact;

rule "Insert transient"
when
then
    insert TransientFact(name = "hello");
end

rule "Greet"
when
    TransientFact(name == "hello")
then
    log "Hello";
end
"#;

const RULES_V2: &str = r#"
package com.acme.rules;
version 2;
import com.acme.rules.generated.facts.TransientFact;

rule "Insert transient"
when
then
    insert TransientFact(name = "hello");
end

rule "Greet"
when
    TransientFact(name == "hello")
then
    log "Hello";
end

rule "Count hits"
    salience -1
when
    TransientFact(hits > 2)
then
    log "Busy";
end
"#;

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

fn context() -> LoadingContext {
    LoadingContext::new("cli-tests")
}

/// Build `base.rfkb` from the facts and rules definitions.
fn build_base(dir: &TempDir) -> PathBuf {
    let facts = write(dir, "facts.drl", FACTS);
    let rules = write(dir, "rules.drl", RULES);
    let output = dir.path().join("base.rfkb");
    cmd_build(&[facts.clone(), rules], &[facts], &output, &context()).unwrap();
    output
}

fn fire(base: &Path, facts: Option<&Path>) -> ruleforge::cli::FireReport {
    cmd_fire(base, facts, &context(), 100).unwrap()
}

// =============================================================================
// COMPILE / BUILD
// =============================================================================

#[test]
fn test_compile_writes_package_set() {
    let dir = TempDir::new().unwrap();
    let facts = write(&dir, "facts.drl", FACTS);
    let rules = write(&dir, "rules.drl", RULES);
    let output = dir.path().join("rules.rfp");

    let report = cmd_compile(&rules, &[facts], &output).unwrap();

    assert_eq!(report.kind, "package-set");
    assert_eq!(report.packages, vec!["com.acme.rules".to_string()]);
    assert_eq!(report.rules, 2);
    assert_eq!(report.bytes as u64, std::fs::metadata(&output).unwrap().len());
}

#[test]
fn test_compile_is_deterministic() {
    let dir = TempDir::new().unwrap();
    let facts = write(&dir, "facts.drl", FACTS);
    let rules = write(&dir, "rules.drl", RULES);
    let a = dir.path().join("a.rfp");
    let b = dir.path().join("b.rfp");

    let first = cmd_compile(&rules, std::slice::from_ref(&facts), &a).unwrap();
    let second = cmd_compile(&rules, &[facts], &b).unwrap();

    assert_eq!(first.checksum, second.checksum);
    assert_eq!(std::fs::read(&a).unwrap(), std::fs::read(&b).unwrap());
}

#[test]
fn test_compile_reports_unresolved_import() {
    let dir = TempDir::new().unwrap();
    let rules = write(&dir, "rules.drl", RULES);
    let output = dir.path().join("rules.rfp");

    let err = cmd_compile(&rules, &[], &output).unwrap_err();

    assert!(matches!(err, KnowledgeError::UnresolvedType(name)
        if name == "com.acme.rules.generated.facts.TransientFact"));
    assert!(!output.exists());
}

#[test]
fn test_missing_source_is_io_error() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("out.rfp");

    let err = cmd_compile(&dir.path().join("absent.drl"), &[], &output).unwrap_err();

    assert!(matches!(err, KnowledgeError::IoError(_)));
}

#[test]
fn test_output_into_missing_directory_is_io_error() {
    let dir = TempDir::new().unwrap();
    let facts = write(&dir, "facts.drl", FACTS);
    let output = dir.path().join("missing").join("out.rfp");

    let err = cmd_compile(&facts, &[], &output).unwrap_err();

    assert!(matches!(err, KnowledgeError::IoError(_)));
}

#[test]
fn test_build_lists_packages_in_name_order() {
    let dir = TempDir::new().unwrap();
    let facts = write(&dir, "facts.drl", FACTS);
    let rules = write(&dir, "rules.drl", RULES);
    let output = dir.path().join("base.rfkb");

    let report = cmd_build(&[rules, facts.clone()], &[facts], &output, &context()).unwrap();

    assert_eq!(report.kind, "full-base");
    assert_eq!(
        report.packages,
        vec![
            "com.acme.rules".to_string(),
            "com.acme.rules.generated.facts".to_string()
        ]
    );
    assert_eq!(report.rules, 2);
}

// =============================================================================
// INSPECT
// =============================================================================

#[test]
fn test_inspect_base() {
    let dir = TempDir::new().unwrap();
    let base = build_base(&dir);

    let report = cmd_inspect(&base).unwrap();

    assert_eq!(report.kind, "full-base");
    assert_eq!(report.context, "cli-tests");
    assert_eq!(report.packages.len(), 2);
    let rules = &report.packages[0];
    assert_eq!(rules.name, "com.acme.rules");
    assert_eq!(rules.rules, vec!["Insert transient", "Greet"]);
    assert_eq!(
        rules.dependencies,
        vec!["com.acme.rules.generated.facts.TransientFact"]
    );
    assert_eq!(
        report.packages[1].declared_types,
        vec!["com.acme.rules.generated.facts.TransientFact"]
    );
    assert!(report.external_types.is_empty());
}

#[test]
fn test_inspect_report_serializes_to_json() {
    let dir = TempDir::new().unwrap();
    let base = build_base(&dir);

    let report = cmd_inspect(&base).unwrap();
    let json = serde_json::to_value(&report).unwrap();

    assert_eq!(json["kind"], "full-base");
    assert_eq!(json["packages"][0]["version"], 1);
}

#[test]
fn test_inspect_rejects_garbage() {
    let dir = TempDir::new().unwrap();
    let junk = write(&dir, "junk.rfkb", "definitely not a snapshot");

    let err = cmd_inspect(&junk).unwrap_err();

    assert!(matches!(err, KnowledgeError::DeserializationError(_)));
}

// =============================================================================
// FIRE
// =============================================================================

#[test]
fn test_fire_base() {
    let dir = TempDir::new().unwrap();
    let base = build_base(&dir);

    let report = fire(&base, None);

    assert_eq!(report.fired, 2);
    assert_eq!(report.facts, 1);
    assert_eq!(report.output, vec!["Hello".to_string()]);
}

#[test]
fn test_fire_with_facts_file() {
    let dir = TempDir::new().unwrap();
    let base = build_base(&dir);
    let facts = write(
        &dir,
        "facts.json",
        r#"[{"type": "com.acme.rules.generated.facts.TransientFact", "fields": {"name": "hello", "hits": 3}}]"#,
    );

    let report = fire(&base, Some(facts.as_path()));

    assert_eq!(report.fired, 3);
    assert_eq!(report.facts, 2);
    assert_eq!(report.output, vec!["Hello".to_string(), "Hello".to_string()]);
}

#[test]
fn test_fire_rejects_unknown_fact_type() {
    let dir = TempDir::new().unwrap();
    let base = build_base(&dir);
    let facts = write(&dir, "facts.json", r#"[{"type": "com.acme.Nope"}]"#);

    let err = cmd_fire(&base, Some(facts.as_path()), &context(), 100).unwrap_err();

    assert!(matches!(err, KnowledgeError::InvalidFact(_)));
}

#[test]
fn test_fire_rejects_malformed_facts() {
    let dir = TempDir::new().unwrap();
    let base = build_base(&dir);
    let facts = write(&dir, "facts.json", r#"{"type": "not an array"}"#);

    let err = cmd_fire(&base, Some(facts.as_path()), &context(), 100).unwrap_err();

    assert!(matches!(err, KnowledgeError::DeserializationError(_)));
}

#[test]
fn test_fire_rejects_package_set() {
    let dir = TempDir::new().unwrap();
    let facts = write(&dir, "facts.drl", FACTS);
    let set = dir.path().join("facts.rfp");
    cmd_compile(&facts, &[], &set).unwrap();

    let err = cmd_fire(&set, None, &context(), 100).unwrap_err();

    assert!(matches!(err, KnowledgeError::DeserializationError(_)));
}

#[test]
fn test_fire_honours_limit() {
    let dir = TempDir::new().unwrap();
    let base = build_base(&dir);

    let err = cmd_fire(&base, None, &context(), 1).unwrap_err();

    assert!(matches!(err, KnowledgeError::FiringLimitExceeded(1)));
}

// =============================================================================
// RELOAD
// =============================================================================

#[test]
fn test_reload_replaces_rules() {
    let dir = TempDir::new().unwrap();
    let base = build_base(&dir);
    let facts = write(&dir, "facts.drl", FACTS);
    let rules_v2 = write(&dir, "rules_v2.drl", RULES_V2);
    let set = dir.path().join("rules_v2.rfp");
    cmd_compile(&rules_v2, &[facts], &set).unwrap();
    let output = dir.path().join("base_v2.rfkb");

    let report = cmd_reload(&base, &set, &output, &context(), ReloadPolicy::default()).unwrap();

    assert_eq!(report.replaced, vec!["com.acme.rules".to_string()]);
    assert_eq!(report.written.rules, 3);

    let inspected = cmd_inspect(&output).unwrap();
    assert_eq!(inspected.packages[0].version, 2);

    let fact_file = write(
        &dir,
        "busy.json",
        r#"[{"type": "com.acme.rules.generated.facts.TransientFact", "fields": {"name": "x", "hits": 9}}]"#,
    );
    let fired = fire(&output, Some(fact_file.as_path()));
    assert_eq!(fired.output, vec!["Hello".to_string(), "Busy".to_string()]);
}

#[test]
fn test_reload_skips_internal_packages() {
    let dir = TempDir::new().unwrap();
    let base = build_base(&dir);
    let facts = write(&dir, "facts.drl", FACTS);
    let set = dir.path().join("facts.rfp");
    cmd_compile(&facts, &[], &set).unwrap();
    let output = dir.path().join("same.rfkb");

    let report = cmd_reload(&base, &set, &output, &context(), ReloadPolicy::default()).unwrap();

    assert!(report.replaced.is_empty());
    assert_eq!(
        report.skipped_internal,
        vec!["com.acme.rules.generated.facts".to_string()]
    );
    assert_eq!(std::fs::read(&base).unwrap(), std::fs::read(&output).unwrap());
}

#[test]
fn test_reload_with_custom_policy_replaces_generated_package() {
    let dir = TempDir::new().unwrap();
    let base = build_base(&dir);
    let facts = write(&dir, "facts.drl", FACTS);
    let set = dir.path().join("facts.rfp");
    cmd_compile(&facts, &[], &set).unwrap();
    let output = dir.path().join("swapped.rfkb");

    let policy = ReloadPolicy::new(vec!["internal".to_string()]);
    let report = cmd_reload(&base, &set, &output, &context(), policy).unwrap();

    assert_eq!(
        report.replaced,
        vec!["com.acme.rules.generated.facts".to_string()]
    );
    assert_eq!(fire(&output, None).fired, 2);
}

#[test]
fn test_reload_rejects_declaration_breaking_rules() {
    let dir = TempDir::new().unwrap();
    let base = build_base(&dir);
    let narrow = write(
        &dir,
        "narrow.drl",
        "package com.acme.rules.generated.facts;\ndeclare TransientFact\n    name : String\nend\n",
    );
    let set = dir.path().join("narrow.rfp");
    cmd_compile(&narrow, &[], &set).unwrap();
    let output = dir.path().join("broken.rfkb");

    let policy = ReloadPolicy::new(vec!["internal".to_string()]);
    let err = cmd_reload(&base, &set, &output, &context(), policy).unwrap_err();

    assert!(matches!(err, KnowledgeError::TypeConflict { .. }));
    assert!(!output.exists());
    assert_eq!(fire(&base, None).fired, 2);
}

// =============================================================================
// CONFIG
// =============================================================================

#[test]
fn test_config_file_is_loaded() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "ruleforge.toml",
        "[registry]\ncontext = \"from-file\"\n\n[engine]\nmax_firings = 7\n",
    );

    let config = Config::load(Some(path.as_path())).unwrap();

    assert_eq!(config.registry.context, "from-file");
    assert_eq!(config.engine.max_firings, 7);
}

#[test]
fn test_missing_explicit_config_is_error() {
    let dir = TempDir::new().unwrap();

    let err = Config::load(Some(dir.path().join("absent.toml").as_path())).unwrap_err();

    assert!(matches!(err, KnowledgeError::IoError(_)));
}
