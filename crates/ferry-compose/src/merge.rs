//! Namespaced union of per-module manifests.
//!
//! Every service, network, volume, config, and secret a module declares is
//! renamed `{namespace}__{name}`, and every reference to a renamed entity
//! inside the same module is rewritten to match. Namespaces never contain
//! the separator and never end in `_`, so a prefixed name maps back to exactly
//! one namespace and the union of modules cannot collide. Entity maps keep
//! insertion order, so the merged document lists modules in merge order.

use crate::MergeError;
use ferry_schema::{
    ComposeDocument, EntityRenames, External, ModuleDependency, ModuleName, Namespace,
    ResourceDef, UnresolvedVar, VarMap, NAMESPACE_SEPARATOR,
};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use indexmap::IndexMap;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Namespace used for builds submitted from a single ad-hoc manifest.
pub const ADHOC_NAMESPACE: &str = "adhoc";

/// One module instance to merge, with its effective variables already resolved.
#[derive(Debug, Clone)]
pub struct ModuleInput {
    pub module: ModuleName,
    pub version: String,
    pub namespace: Namespace,
    pub manifest: String,
    pub variables: VarMap,
    pub dependencies: Vec<ModuleDependency>,
}

/// Per-module summary carried alongside the merged document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedModule {
    pub module: ModuleName,
    pub version: String,
    pub namespace: Namespace,
    /// Renamed service keys this module contributed.
    pub services: Vec<String>,
    pub dependencies: Vec<ModuleDependency>,
}

#[derive(Debug, Clone)]
pub struct MergeOutput {
    pub document: ComposeDocument,
    /// Placeholders left in the document, forwarded to the linter.
    pub unresolved: Vec<UnresolvedVar>,
    pub modules: Vec<MergedModule>,
}

fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.to_ascii_lowercase().chars() {
        if c == '_' && out.ends_with('_') {
            continue;
        }
        if c.is_ascii_alphanumeric() || matches!(c, '_' | '-') {
            out.push(c);
        }
    }
    out.trim_end_matches('_').to_owned()
}

/// True when `{namespace}__{name}` can be split back unambiguously.
pub fn is_valid_namespace(ns: &str) -> bool {
    !ns.is_empty() && !ns.contains(NAMESPACE_SEPARATOR) && !ns.ends_with('_')
}

/// Derive a namespace for each `(module, order)` link, in the given order.
///
/// The namespace is the module name lowered and reduced to `[a-z0-9_-]`,
/// with runs of `_` collapsed and trailing `_` dropped. When the same module
/// appears more than once, every occurrence gets its position appended
/// (`web-1`, `web-3`); a further counter is added if that name is already
/// taken by another module.
pub fn assign_namespaces(links: &[(&str, u32)]) -> Vec<Namespace> {
    let bases: Vec<String> = links
        .iter()
        .map(|(name, order)| {
            let base = sanitize(name);
            if base.is_empty() {
                format!("m{order}")
            } else {
                base
            }
        })
        .collect();
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for base in &bases {
        *counts.entry(base.as_str()).or_default() += 1;
    }
    let mut taken: HashSet<String> = bases
        .iter()
        .filter(|b| counts[b.as_str()] == 1)
        .cloned()
        .collect();

    bases
        .iter()
        .zip(links)
        .map(|(base, (_, order))| {
            if counts[base.as_str()] == 1 {
                return Namespace::new(base.clone());
            }
            let mut candidate = format!("{base}-{order}");
            let mut n = 1;
            while !taken.insert(candidate.clone()) {
                n += 1;
                candidate = format!("{base}-{order}-{n}");
            }
            Namespace::new(candidate)
        })
        .collect()
}

/// Merge module manifests in the given order.
///
/// `project_name`, when set, replaces any top-level `name:` the modules
/// declare. Unresolved placeholders are not an error here.
pub fn merge(inputs: &[ModuleInput], project_name: Option<&str>) -> Result<MergeOutput, MergeError> {
    let mut seen = HashSet::new();
    for input in inputs {
        if !is_valid_namespace(input.namespace.as_str()) {
            return Err(MergeError::InvalidNamespace(input.namespace.to_string()));
        }
        if !seen.insert(input.namespace.as_str()) {
            return Err(MergeError::DuplicateNamespace(input.namespace.to_string()));
        }
    }

    let mut merged = ComposeDocument::default();
    let mut unresolved = Vec::new();
    let mut modules = Vec::with_capacity(inputs.len());

    for input in inputs {
        let (doc, module_unresolved) =
            ComposeDocument::parse_interpolated(&input.manifest, &input.variables).map_err(|e| {
                MergeError::Configuration {
                    module: input.module.to_string(),
                    reason: e.to_string(),
                }
            })?;
        unresolved.extend(module_unresolved.into_iter().map(|u| UnresolvedVar {
            name: u.name,
            location: format!("{}:{}", input.module, u.location),
        }));

        let services = union_module(&mut merged, doc, &input.namespace)?;
        tracing::debug!(
            "merged module '{}' as namespace '{}' ({} services)",
            input.module,
            input.namespace,
            services.len()
        );
        modules.push(MergedModule {
            module: input.module.clone(),
            version: input.version.clone(),
            namespace: input.namespace.clone(),
            services,
            dependencies: input.dependencies.clone(),
        });
    }

    if let Some(name) = project_name {
        merged.name = Some(name.to_owned());
    }

    Ok(MergeOutput {
        document: merged,
        unresolved,
        modules,
    })
}

fn renames_for(doc: &ComposeDocument, ns: &Namespace) -> EntityRenames {
    let map = |keys: Vec<&String>| -> BTreeMap<String, String> {
        keys.into_iter().map(|k| (k.clone(), ns.prefix(k))).collect()
    };
    EntityRenames {
        services: map(doc.services.keys().collect()),
        networks: map(doc.networks.keys().collect()),
        volumes: map(doc.volumes.keys().collect()),
        configs: map(doc.configs.keys().collect()),
        secrets: map(doc.secrets.keys().collect()),
    }
}

/// Rename one module's document into `merged`. Returns the renamed service keys.
fn union_module(
    merged: &mut ComposeDocument,
    doc: ComposeDocument,
    ns: &Namespace,
) -> Result<Vec<String>, MergeError> {
    let renames = renames_for(&doc, ns);
    let ComposeDocument {
        version,
        name: _,
        services,
        networks,
        volumes,
        configs,
        secrets,
        extra,
    } = doc;

    if let Some(version) = version {
        match &merged.version {
            None => merged.version = Some(version),
            Some(existing) if versions_compatible(existing, &version) => {}
            Some(existing) => {
                return Err(MergeError::IncompatibleSchemaVersion {
                    field: "version".to_owned(),
                    first: existing.clone(),
                    second: version,
                });
            }
        }
    }

    let mut service_names = Vec::with_capacity(services.len());
    for (key, mut service) in services {
        service.rewrite_references(&renames);
        let new_key = ns.prefix(&key);
        service_names.push(new_key.clone());
        insert_unique(&mut merged.services, "service", new_key, service)?;
    }

    for (kind, target, source) in [
        ("network", &mut merged.networks, networks),
        ("volume", &mut merged.volumes, volumes),
        ("config", &mut merged.configs, configs),
        ("secret", &mut merged.secrets, secrets),
    ] {
        for (key, def) in source {
            let def = def.map(|d| keep_external_name(d, &key));
            insert_unique(target, kind, ns.prefix(&key), def)?;
        }
    }

    for (key, value) in extra {
        merge_top_level(merged, ns, key, value)?;
    }

    Ok(service_names)
}

fn insert_unique<V>(
    target: &mut IndexMap<String, V>,
    kind: &'static str,
    key: String,
    value: V,
) -> Result<(), MergeError> {
    if target.contains_key(&key) {
        return Err(MergeError::NameCollision { kind, name: key });
    }
    target.insert(key, value);
    Ok(())
}

/// External resources keep their real name after the key is prefixed.
fn keep_external_name(mut def: ResourceDef, original: &str) -> ResourceDef {
    if !def.is_external() || def.name.is_some() {
        return def;
    }
    if let Some(External::Named(named)) = &def.external {
        if named.name.is_some() {
            return def;
        }
    }
    def.name = Some(original.to_owned());
    def
}

fn merge_top_level(
    merged: &mut ComposeDocument,
    ns: &Namespace,
    key: String,
    value: Value,
) -> Result<(), MergeError> {
    // Structured extension blocks are module-private; everything else must agree.
    let structured = matches!(value, Value::Mapping(_) | Value::Sequence(_));
    let key = match key.strip_prefix("x-") {
        Some(rest) if structured => format!("x-{}", ns.prefix(rest)),
        _ => key,
    };
    insert_compatible(merged, key, value)
}

fn insert_compatible(merged: &mut ComposeDocument, key: String, value: Value) -> Result<(), MergeError> {
    match merged.extra.get(&key) {
        None => {
            merged.extra.insert(key, value);
            Ok(())
        }
        Some(existing) if *existing == value => Ok(()),
        Some(existing) => Err(MergeError::IncompatibleSchemaVersion {
            field: key,
            first: render(existing),
            second: render(&value),
        }),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_owned())
            .unwrap_or_default(),
    }
}

/// `"3"` and `"3.0"` are the same schema version; otherwise compare text.
fn versions_compatible(a: &str, b: &str) -> bool {
    let (a, b) = (a.trim(), b.trim());
    if a == b {
        return true;
    }
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => (x - y).abs() < f64::EPSILON,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input(module: &str, ns: &str, manifest: &str) -> ModuleInput {
        ModuleInput {
            module: ModuleName::new(module),
            version: "1.0".to_owned(),
            namespace: Namespace::new(ns),
            manifest: manifest.to_owned(),
            variables: VarMap::new(),
            dependencies: Vec::new(),
        }
    }

    #[test]
    fn clean_merge_prefixes_services() {
        let out = merge(
            &[
                input("web", "web", "services:\n  app:\n    image: nginx\n"),
                input("db", "db", "services:\n  app:\n    image: postgres\n"),
            ],
            None,
        )
        .unwrap();
        let keys: Vec<&String> = out.document.services.keys().collect();
        assert_eq!(keys, vec!["web__app", "db__app"]);
        assert_eq!(out.modules[0].services, vec!["web__app".to_owned()]);
        assert_eq!(out.modules[1].services, vec!["db__app".to_owned()]);
    }

    #[test]
    fn references_follow_renames() {
        let out = merge(
            &[input(
                "shop",
                "shop",
                r"
services:
  api:
    image: api
    depends_on: [db]
    networks: [back]
    volumes: ['data:/data', '/host:/host']
  db:
    image: postgres
networks:
  back: {}
volumes:
  data: {}
",
            )],
            None,
        )
        .unwrap();
        let api = &out.document.services["shop__api"];
        assert_eq!(api.service_refs(), vec!["shop__db"]);
        assert_eq!(api.network_refs(), vec!["shop__back"]);
        assert_eq!(api.volume_refs(), vec!["shop__data"]);
        assert!(out.document.networks.contains_key("shop__back"));
        assert!(out.document.volumes.contains_key("shop__data"));
    }

    #[test]
    fn external_resources_keep_real_name() {
        let out = merge(
            &[input(
                "web",
                "web",
                "services:\n  app:\n    image: a\n    networks: [proxy]\nnetworks:\n  proxy:\n    external: true\n",
            )],
            None,
        )
        .unwrap();
        let def = out.document.networks["web__proxy"].as_ref().unwrap();
        assert_eq!(def.name.as_deref(), Some("proxy"));
        assert_eq!(
            out.document.services["web__app"].network_refs(),
            vec!["web__proxy"]
        );
    }

    #[test]
    fn variables_are_substituted_per_module() {
        let mut web = input("web", "web", "services:\n  app:\n    image: nginx:${TAG}\n");
        web.variables = [("TAG".to_owned(), json!("1.25"))].into_iter().collect();
        let db = input("db", "db", "services:\n  app:\n    image: postgres:${TAG}\n");
        let out = merge(&[web, db], None).unwrap();
        assert_eq!(
            out.document.services["web__app"].image.as_deref(),
            Some("nginx:1.25")
        );
        assert_eq!(out.unresolved.len(), 1);
        assert_eq!(out.unresolved[0].name, "TAG");
        assert_eq!(out.unresolved[0].location, "db:services.app.image");
    }

    #[test]
    fn duplicate_namespace_is_rejected() {
        let err = merge(
            &[input("a", "same", "{}"), input("b", "same", "{}")],
            None,
        )
        .unwrap_err();
        assert!(matches!(err, MergeError::DuplicateNamespace(ns) if ns == "same"));
    }

    #[test]
    fn numeric_versions_are_compatible() {
        let out = merge(
            &[input("a", "a", "version: '3'\n"), input("b", "b", "version: 3.0\n")],
            None,
        )
        .unwrap();
        assert_eq!(out.document.version.as_deref(), Some("3"));
    }

    #[test]
    fn incompatible_versions_abort() {
        let err = merge(
            &[input("a", "a", "version: '2.4'\n"), input("b", "b", "version: '3.8'\n")],
            None,
        )
        .unwrap_err();
        match err {
            MergeError::IncompatibleSchemaVersion { field, first, second } => {
                assert_eq!(field, "version");
                assert_eq!(first, "2.4");
                assert_eq!(second, "3.8");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn differing_top_level_scalar_aborts() {
        let err = merge(
            &[input("a", "a", "x-tier: gold\n"), input("b", "b", "x-tier: silver\n")],
            None,
        )
        .unwrap_err();
        assert!(matches!(err, MergeError::IncompatibleSchemaVersion { field, .. } if field == "x-tier"));
    }

    #[test]
    fn extension_blocks_are_namespaced() {
        let out = merge(
            &[
                input("a", "a", "x-common:\n  restart: always\n"),
                input("b", "b", "x-common:\n  restart: never\n"),
            ],
            None,
        )
        .unwrap();
        assert!(out.document.extra.contains_key("x-a__common"));
        assert!(out.document.extra.contains_key("x-b__common"));
    }

    #[test]
    fn project_name_replaces_module_names() {
        let out = merge(&[input("a", "a", "name: alpha\n")], Some("shop")).unwrap();
        assert_eq!(out.document.name.as_deref(), Some("shop"));
    }

    #[test]
    fn malformed_manifest_is_configuration_error() {
        let err = merge(&[input("a", "a", "services: [unclosed\n")], None).unwrap_err();
        assert!(matches!(err, MergeError::Configuration { module, .. } if module == "a"));
    }

    #[test]
    fn separator_in_namespace_is_rejected() {
        let err = merge(
            &[
                input("a", "a", "services:\n  b__c:\n    image: x\n"),
                input("a__b", "a__b", "services:\n  c:\n    image: y\n"),
            ],
            None,
        )
        .unwrap_err();
        assert!(matches!(err, MergeError::InvalidNamespace(ns) if ns == "a__b"));

        let err = merge(&[input("a", "a_", "{}")], None).unwrap_err();
        assert!(matches!(err, MergeError::InvalidNamespace(_)));
    }

    #[test]
    fn underscored_entity_names_stay_distinct() {
        let names = assign_namespaces(&[("a", 1), ("a__b", 2)]);
        let out = merge(
            &[
                input("a", names[0].as_str(), "services:\n  b__c:\n    image: x\n"),
                input("a__b", names[1].as_str(), "services:\n  c:\n    image: y\n"),
            ],
            None,
        )
        .unwrap();
        let keys: Vec<&String> = out.document.services.keys().collect();
        assert_eq!(keys, vec!["a__b__c", "a_b__c"]);
    }

    #[test]
    fn existing_key_is_never_overwritten() {
        let mut services = IndexMap::new();
        insert_unique(&mut services, "service", "a__b".to_owned(), 1).unwrap();
        let err = insert_unique(&mut services, "service", "a__b".to_owned(), 2).unwrap_err();
        assert!(matches!(err, MergeError::NameCollision { kind: "service", .. }));
        assert_eq!(services["a__b"], 1);
    }

    #[test]
    fn repeated_module_suffix_avoids_other_modules() {
        let ns = assign_namespaces(&[("web", 1), ("web-3", 2), ("web", 3)]);
        let ns: Vec<&str> = ns.iter().map(Namespace::as_str).collect();
        assert_eq!(ns, vec!["web-1", "web-3", "web-3-2"]);
    }

    #[test]
    fn sanitized_namespaces_are_valid() {
        let ns = assign_namespaces(&[("a__b", 1), ("x_", 2), ("__", 3), ("Mixed_Case__Name", 4)]);
        let ns: Vec<&str> = ns.iter().map(Namespace::as_str).collect();
        assert_eq!(ns, vec!["a_b", "x", "m3", "mixed_case_name"]);
        assert!(ns.iter().all(|n| is_valid_namespace(n)));
    }

    #[test]
    fn namespaces_from_module_names() {
        let ns = assign_namespaces(&[("Web", 1), ("db", 2), ("web", 3), ("***", 4)]);
        let ns: Vec<&str> = ns.iter().map(Namespace::as_str).collect();
        assert_eq!(ns, vec!["web-1", "db", "web-3", "m4"]);
    }
}
