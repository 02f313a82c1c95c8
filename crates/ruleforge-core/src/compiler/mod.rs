//! # Rule Compiler
//!
//! Turns rule-definition text plus declared-type sources into a
//! [`CompiledPackage`].
//!
//! Compilation is pure: no filesystem access, no mutation of the inputs or
//! of the optional [`TypeRegistry`] used for external type lookups. The same
//! inputs always produce the same package, so encoded snapshots are
//! reproducible.
//!
//! ## Type Resolution
//!
//! A simple name `T` used inside package `P` resolves, in order, to:
//! 1. `P.T` declared in the compile unit
//! 2. an `import` whose last segment is `T`
//! 3. the single declaration named `T` among the declared-type sources
//! 4. `P.T` in the caller-supplied registry
//!
//! Qualified names are looked up in the compile unit, then the registry.

mod lexer;
mod parser;

use crate::package::{Action, CompiledPackage, CompiledRule, Condition, Constraint, Pattern, TypeRef};
use crate::primitives::{
    DEFAULT_PACKAGE_VERSION, MAX_CONDITION_DEPTH, MAX_FIELDS_PER_TYPE, MAX_SOURCE_LENGTH,
};
use crate::registry::TypeRegistry;
use crate::types::{FactTypeDescriptor, FieldDef, FieldType, FieldValue, KnowledgeError, qualify};
use parser::{ActionAst, CondAst, DeclareAst, RuleAst, SourceUnit, parse};
use std::collections::{BTreeMap, BTreeSet};

/// Compiles rule definitions into packages.
///
/// Holds an optional registry for resolving types that are not declared in
/// the compile unit. The registry is only read.
#[derive(Debug, Clone, Default)]
pub struct RuleCompiler {
    registry: Option<TypeRegistry>,
}

impl RuleCompiler {
    /// Compiler that only resolves types declared in the compile unit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiler that falls back to `registry` for unresolved references.
    #[must_use]
    pub fn with_registry(registry: TypeRegistry) -> Self {
        Self {
            registry: Some(registry),
        }
    }

    /// Compile one rule definition.
    ///
    /// `declared_type_sources` may only contain `package`, `import` and
    /// `declare` statements. Their declarations are available for
    /// resolution. Declarations of the definition itself, and of sources
    /// with the same package statement, become declared types of the
    /// result; the rest become dependencies when referenced.
    pub fn compile(
        &self,
        definition: &str,
        declared_type_sources: &[&str],
    ) -> Result<CompiledPackage, KnowledgeError> {
        let unit = parse_bounded(definition)?;

        let mut type_units = Vec::with_capacity(declared_type_sources.len());
        for source in declared_type_sources {
            let type_unit = parse_bounded(source)?;
            if let Some(rule) = type_unit.rules.first() {
                return Err(KnowledgeError::compile(
                    rule.line,
                    format!(
                        "declared-type source for package {} must not contain rules",
                        type_unit.package
                    ),
                ));
            }
            type_units.push(type_unit);
        }

        let mut scope = Scope::new(&unit.package, self.registry.as_ref());
        for declare in &unit.declares {
            scope.declare(&unit.package, declare, true)?;
        }
        for type_unit in &type_units {
            let own = type_unit.package == unit.package;
            for declare in &type_unit.declares {
                scope.declare(&type_unit.package, declare, own)?;
            }
        }
        for (import, line) in &unit.imports {
            scope.import(import, *line)?;
        }

        let rules = lower_rules(&unit, &scope)?;

        let declared: Vec<FactTypeDescriptor> = scope
            .unit_types
            .values()
            .filter(|d| scope.own.contains(&d.name))
            .cloned()
            .collect();
        let dependencies: BTreeSet<String> = rules
            .iter()
            .flat_map(CompiledRule::type_refs)
            .map(|r| r.name.clone())
            .filter(|name| !declared.iter().any(|d| &d.name == name))
            .collect();

        let version = match unit.version {
            None => DEFAULT_PACKAGE_VERSION,
            Some((v, line)) => u32::try_from(v)
                .map_err(|_| KnowledgeError::compile(line, format!("invalid version {}", v)))?,
        };

        tracing::debug!(
            package = %unit.package,
            rules = rules.len(),
            declared_types = declared.len(),
            dependencies = dependencies.len(),
            "compiled package"
        );

        Ok(CompiledPackage::new(
            unit.package,
            version,
            rules,
            declared,
            dependencies,
        ))
    }
}

fn parse_bounded(source: &str) -> Result<SourceUnit, KnowledgeError> {
    if source.len() > MAX_SOURCE_LENGTH {
        return Err(KnowledgeError::compile(
            1,
            format!(
                "source of {} bytes exceeds maximum {}",
                source.len(),
                MAX_SOURCE_LENGTH
            ),
        ));
    }
    parse(source)
}

// =============================================================================
// RESOLUTION SCOPE
// =============================================================================

struct Scope<'a> {
    package: &'a str,
    registry: Option<&'a TypeRegistry>,
    /// Every declaration of the compile unit, keyed by qualified name.
    unit_types: BTreeMap<String, FactTypeDescriptor>,
    /// Declarations that belong to the produced package.
    own: BTreeSet<String>,
    /// Simple name -> qualified name, from `import` statements.
    imports: BTreeMap<String, String>,
}

impl<'a> Scope<'a> {
    fn new(package: &'a str, registry: Option<&'a TypeRegistry>) -> Self {
        Self {
            package,
            registry,
            unit_types: BTreeMap::new(),
            own: BTreeSet::new(),
            imports: BTreeMap::new(),
        }
    }

    /// Add a declaration. A qualified `declare a.b.T` lives in namespace
    /// `a.b` regardless of the package statement around it.
    fn declare(
        &mut self,
        package: &str,
        declare: &DeclareAst,
        own: bool,
    ) -> Result<(), KnowledgeError> {
        if declare.fields.len() > MAX_FIELDS_PER_TYPE {
            return Err(KnowledgeError::compile(
                declare.line,
                format!(
                    "type {} has more than {} fields",
                    declare.name, MAX_FIELDS_PER_TYPE
                ),
            ));
        }

        let mut fields: Vec<FieldDef> = Vec::with_capacity(declare.fields.len());
        for field in &declare.fields {
            let field_type = FieldType::from_keyword(&field.type_keyword).ok_or_else(|| {
                KnowledgeError::compile(
                    field.line,
                    format!("unknown field type `{}`", field.type_keyword),
                )
            })?;
            if fields.iter().any(|f| f.name == field.name) {
                return Err(KnowledgeError::compile(
                    field.line,
                    format!("duplicate field `{}` in {}", field.name, declare.name),
                ));
            }
            fields.push(FieldDef::new(&field.name, field_type));
        }

        let descriptor = match declare.name.rsplit_once('.') {
            Some((namespace, simple)) => FactTypeDescriptor::declared(namespace, simple, fields),
            None => FactTypeDescriptor::declared(package, &declare.name, fields),
        };
        if own {
            self.own.insert(descriptor.name.clone());
        }
        if let Some(existing) = self.unit_types.get(&descriptor.name) {
            if existing.is_structurally_equal(&descriptor) {
                return Ok(());
            }
            return Err(KnowledgeError::conflict(
                &descriptor.name,
                "declared twice with different fields in one compile unit",
            ));
        }
        self.unit_types.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    fn import(&mut self, qualified: &str, line: usize) -> Result<(), KnowledgeError> {
        self.lookup_qualified(qualified)
            .ok_or_else(|| KnowledgeError::UnresolvedType(qualified.to_string()))?;
        let simple = qualified.rsplit('.').next().unwrap_or(qualified).to_string();
        if let Some(previous) = self.imports.get(&simple) {
            if previous != qualified {
                return Err(KnowledgeError::compile(
                    line,
                    format!("import {} clashes with {}", qualified, previous),
                ));
            }
        }
        self.imports.insert(simple, qualified.to_string());
        Ok(())
    }

    fn lookup_qualified(&self, name: &str) -> Option<FactTypeDescriptor> {
        if let Some(d) = self.unit_types.get(name) {
            return Some(d.clone());
        }
        self.registry
            .and_then(|r| r.get(name))
            .map(|h| h.descriptor().clone())
    }

    fn resolve(&self, name: &str, line: usize) -> Result<FactTypeDescriptor, KnowledgeError> {
        if name.contains('.') {
            return self
                .lookup_qualified(name)
                .ok_or_else(|| KnowledgeError::UnresolvedType(name.to_string()));
        }

        let local = qualify(self.package, name);
        if let Some(d) = self.unit_types.get(&local) {
            return Ok(d.clone());
        }
        if let Some(imported) = self.imports.get(name) {
            return self
                .lookup_qualified(imported)
                .ok_or_else(|| KnowledgeError::UnresolvedType(imported.clone()));
        }

        let mut candidates = self.unit_types.values().filter(|d| d.simple_name() == name);
        if let Some(first) = candidates.next() {
            if let Some(second) = candidates.next() {
                return Err(KnowledgeError::compile(
                    line,
                    format!(
                        "ambiguous type `{}`: {} or {}; add an import",
                        name, first.name, second.name
                    ),
                ));
            }
            return Ok(first.clone());
        }

        self.registry
            .and_then(|r| r.get(&local))
            .map(|h| h.descriptor().clone())
            .ok_or(KnowledgeError::UnresolvedType(local))
    }
}

// =============================================================================
// LOWERING
// =============================================================================

fn lower_rules(unit: &SourceUnit, scope: &Scope<'_>) -> Result<Vec<CompiledRule>, KnowledgeError> {
    let mut seen = BTreeSet::new();
    let mut rules = Vec::with_capacity(unit.rules.len());
    for rule in &unit.rules {
        if !seen.insert(rule.name.as_str()) {
            return Err(KnowledgeError::compile(
                rule.line,
                format!("duplicate rule name {:?}", rule.name),
            ));
        }
        rules.push(lower_rule(rule, scope)?);
    }
    Ok(rules)
}

fn lower_rule(rule: &RuleAst, scope: &Scope<'_>) -> Result<CompiledRule, KnowledgeError> {
    let salience = i32::try_from(rule.salience).map_err(|_| {
        KnowledgeError::compile(rule.line, format!("salience {} out of range", rule.salience))
    })?;

    let mut conditions = rule
        .conditions
        .iter()
        .map(|c| lower_condition(c, scope))
        .collect::<Result<Vec<_>, _>>()?;
    let condition = if conditions.len() == 1 {
        conditions.remove(0)
    } else {
        Condition::All(conditions)
    };
    if condition.depth() > MAX_CONDITION_DEPTH {
        return Err(KnowledgeError::compile(
            rule.line,
            format!(
                "rule {} has a condition nested deeper than {} levels",
                rule.name, MAX_CONDITION_DEPTH
            ),
        ));
    }

    let actions = rule
        .actions
        .iter()
        .map(|a| lower_action(a, scope))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CompiledRule {
        name: rule.name.clone(),
        salience,
        condition,
        actions,
    })
}

fn lower_condition(cond: &CondAst, scope: &Scope<'_>) -> Result<Condition, KnowledgeError> {
    Ok(match cond {
        CondAst::Pattern {
            type_name,
            constraints,
            line,
        } => {
            let descriptor = scope.resolve(type_name, *line)?;
            let mut lowered = Vec::with_capacity(constraints.len());
            for c in constraints {
                let field = field_of(&descriptor, &c.field, c.line)?;
                check_literal(&descriptor, field, &c.value, c.line)?;
                if c.op.is_ordering() && !field.field_type.is_ordered() {
                    return Err(KnowledgeError::compile(
                        c.line,
                        format!(
                            "operator {} is not defined for {} field `{}`",
                            c.op.symbol(),
                            field.field_type,
                            field.name
                        ),
                    ));
                }
                lowered.push(Constraint {
                    field: c.field.clone(),
                    op: c.op,
                    value: c.value.clone(),
                });
            }
            Condition::Pattern(Pattern {
                type_ref: TypeRef::to(&descriptor),
                constraints: lowered,
            })
        }
        CondAst::And(parts) => Condition::All(
            parts
                .iter()
                .map(|p| lower_condition(p, scope))
                .collect::<Result<_, _>>()?,
        ),
        CondAst::Or(parts) => Condition::Any(
            parts
                .iter()
                .map(|p| lower_condition(p, scope))
                .collect::<Result<_, _>>()?,
        ),
        CondAst::Not(inner) => Condition::Not(Box::new(lower_condition(inner, scope)?)),
        CondAst::Exists(inner) => Condition::Exists(Box::new(lower_condition(inner, scope)?)),
        CondAst::Eval(value) => Condition::Eval(*value),
    })
}

fn lower_action(action: &ActionAst, scope: &Scope<'_>) -> Result<Action, KnowledgeError> {
    match action {
        ActionAst::Log(message) => Ok(Action::Log(message.clone())),
        ActionAst::Insert {
            type_name,
            assigns,
            line,
        } => {
            let descriptor = scope.resolve(type_name, *line)?;
            let mut assigned: BTreeMap<&str, &FieldValue> = BTreeMap::new();
            for (name, value, a_line) in assigns {
                let field = field_of(&descriptor, name, *a_line)?;
                check_literal(&descriptor, field, value, *a_line)?;
                if assigned.insert(name.as_str(), value).is_some() {
                    return Err(KnowledgeError::compile(
                        *a_line,
                        format!("field `{}` assigned twice", name),
                    ));
                }
            }
            let values = descriptor
                .fields
                .iter()
                .map(|f| {
                    let value = assigned
                        .get(f.name.as_str())
                        .map(|v| (*v).clone())
                        .unwrap_or_else(|| FieldValue::default_for(f.field_type));
                    (f.name.clone(), value)
                })
                .collect();
            Ok(Action::Insert {
                type_ref: TypeRef::to(&descriptor),
                values,
            })
        }
    }
}

fn field_of<'d>(
    descriptor: &'d FactTypeDescriptor,
    name: &str,
    line: usize,
) -> Result<&'d FieldDef, KnowledgeError> {
    descriptor.field(name).ok_or_else(|| {
        KnowledgeError::compile(
            line,
            format!("type {} has no field `{}`", descriptor.name, name),
        )
    })
}

fn check_literal(
    descriptor: &FactTypeDescriptor,
    field: &FieldDef,
    value: &FieldValue,
    line: usize,
) -> Result<(), KnowledgeError> {
    if value.field_type() == field.field_type {
        return Ok(());
    }
    Err(KnowledgeError::compile(
        line,
        format!(
            "{}.{} is {}, found {} literal {}",
            descriptor.simple_name(),
            field.name,
            field.field_type,
            value.field_type(),
            value
        ),
    ))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::external_type;

    const DECLARED_FACT: &str = r#"
package com.acme.rules.generated.facts;

declare TransientFact
    name : String
    hits : int
end
"#;

    const RULES_ONLY: &str = r#"
package com.acme.rules;
import com.acme.rules.generated.facts.TransientFact;

rule "Seed"
    salience 10
when
then
    insert TransientFact(name = "seed");
end

rule "Observe"
when
    TransientFact(hits >= 0)
then
    log "observed";
end
"#;

    #[test]
    fn compiles_rules_against_declared_sources() {
        let pkg = RuleCompiler::new()
            .compile(RULES_ONLY, &[DECLARED_FACT])
            .expect("compile");

        assert_eq!(pkg.name(), "com.acme.rules");
        assert_eq!(pkg.rule_count(), 2);
        assert!(pkg.declared_types().is_empty());
        assert!(
            pkg.dependencies()
                .contains("com.acme.rules.generated.facts.TransientFact")
        );
        assert_eq!(pkg.rule("Seed").map(|r| r.salience), Some(10));
    }

    #[test]
    fn deeply_nested_negation_fails_without_overflow() {
        let source = format!(
            "package p;\nrule \"deep\" when {}eval(true) then end",
            "not ".repeat(200_000)
        );
        let result = RuleCompiler::new().compile(&source, &[]);
        assert!(matches!(result, Err(KnowledgeError::Compile { .. })));
    }

    #[test]
    fn lowered_condition_depth_is_bounded() {
        // Each level lowers to Any[.., All[.., inner]]: two tree levels per paren.
        let levels = MAX_CONDITION_DEPTH / 2 + 1;
        let source = format!(
            "package p;\nrule \"wide\" when {}eval(true){} then end",
            "(eval(true) or eval(true) and ".repeat(levels),
            ")".repeat(levels)
        );
        let err = RuleCompiler::new()
            .compile(&source, &[])
            .expect_err("too deep once lowered");
        assert!(matches!(err, KnowledgeError::Compile { message, .. } if message.contains("wide")));
    }

    #[test]
    fn declared_only_package_has_no_dependencies() {
        let pkg = RuleCompiler::new()
            .compile(DECLARED_FACT, &[])
            .expect("compile");
        assert_eq!(pkg.rule_count(), 0);
        assert_eq!(pkg.declared_types().len(), 1);
        assert!(pkg.dependencies().is_empty());
        assert_eq!(
            pkg.declared_types()[0].origin.tag(),
            "declared-in-package:com.acme.rules.generated.facts"
        );
    }

    #[test]
    fn insert_fills_default_values_in_field_order() {
        let pkg = RuleCompiler::new()
            .compile(RULES_ONLY, &[DECLARED_FACT])
            .expect("compile");
        let seed = pkg.rule("Seed").expect("seed rule");
        let expected = vec![
            ("name".to_string(), FieldValue::Str("seed".into())),
            ("hits".to_string(), FieldValue::Int(0)),
        ];
        assert!(matches!(
            &seed.actions[0],
            Action::Insert { values, .. } if *values == expected
        ));
    }

    #[test]
    fn missing_type_is_unresolved_with_qualified_name() {
        let result = RuleCompiler::new().compile(RULES_ONLY, &[]);
        assert!(matches!(
            result,
            Err(KnowledgeError::UnresolvedType(name))
                if name == "com.acme.rules.generated.facts.TransientFact"
        ));
    }

    #[test]
    fn simple_name_without_import_is_qualified_by_package() {
        let src = "package com.acme;\nrule \"r\" when Missing() then end";
        let result = RuleCompiler::new().compile(src, &[]);
        assert!(matches!(
            result,
            Err(KnowledgeError::UnresolvedType(name)) if name == "com.acme.Missing"
        ));
    }

    #[test]
    fn registry_supplies_external_types() {
        let registry = TypeRegistry::default();
        registry
            .register(external_type(
                "com.host.Order",
                vec![FieldDef::new("total", FieldType::Int)],
            ))
            .expect("register");
        let src = "package com.acme;\nimport com.host.Order;\n\
                   rule \"big\" when Order(total > 100) then log \"big\"; end";

        let pkg = RuleCompiler::with_registry(registry)
            .compile(src, &[])
            .expect("compile");
        assert!(pkg.dependencies().contains("com.host.Order"));
    }

    #[test]
    fn unknown_field_is_a_compile_error() {
        let src = "package p;\ndeclare F\n a : int\nend\nrule \"r\" when F(b == 1) then end";
        let result = RuleCompiler::new().compile(src, &[]);
        assert!(matches!(result, Err(KnowledgeError::Compile { line: 5, .. })));
    }

    #[test]
    fn literal_type_must_match_field() {
        let src = "package p;\ndeclare F\n a : int\nend\nrule \"r\" when F(a == \"x\") then end";
        assert!(matches!(
            RuleCompiler::new().compile(src, &[]),
            Err(KnowledgeError::Compile { .. })
        ));
    }

    #[test]
    fn ordering_on_strings_is_rejected() {
        let src = "package p;\ndeclare F\n a : String\nend\nrule \"r\" when F(a < \"x\") then end";
        assert!(RuleCompiler::new().compile(src, &[]).is_err());
    }

    #[test]
    fn duplicate_rule_names_rejected() {
        let src = "package p;\nrule \"r\" when then end\nrule \"r\" when then end";
        assert!(matches!(
            RuleCompiler::new().compile(src, &[]),
            Err(KnowledgeError::Compile { line: 3, .. })
        ));
    }

    #[test]
    fn declared_source_with_rules_rejected() {
        let result = RuleCompiler::new().compile(DECLARED_FACT, &[RULES_ONLY]);
        assert!(matches!(result, Err(KnowledgeError::Compile { .. })));
    }

    #[test]
    fn compilation_is_deterministic() {
        let compiler = RuleCompiler::new();
        let a = compiler.compile(RULES_ONLY, &[DECLARED_FACT]).expect("first");
        let b = compiler.compile(RULES_ONLY, &[DECLARED_FACT]).expect("second");
        assert_eq!(a, b);
    }

    #[test]
    fn compile_does_not_touch_registry() {
        let registry = TypeRegistry::default();
        let compiler = RuleCompiler::with_registry(registry.clone());
        compiler
            .compile(DECLARED_FACT, &[])
            .expect("compile");
        assert!(registry.is_empty());
    }
}
