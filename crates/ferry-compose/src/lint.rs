//! Policy rules over a merged document.
//!
//! Every registered rule runs on every lint pass; rules never see each other's
//! findings and never mutate the document.

use crate::merge::{MergeOutput, MergedModule};
use ferry_schema::{ComposeDocument, HostBinding, UnresolvedVar};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Warning => write!(f, "WARNING"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub rule: String,
    pub location: String,
    pub message: String,
}

impl Finding {
    pub fn error(rule: &str, location: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            rule: rule.to_owned(),
            location: location.into(),
            message: message.into(),
        }
    }

    pub fn warning(rule: &str, location: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(rule, location, message)
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}: {}",
            self.severity, self.rule, self.location, self.message
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintReport {
    pub findings: Vec<Finding>,
}

impl LintReport {
    pub fn errors(&self) -> impl Iterator<Item = &Finding> {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Finding> {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Warning)
    }

    pub fn has_errors(&self) -> bool {
        self.errors().next().is_some()
    }

    /// All ERROR findings joined into one message.
    pub fn error_summary(&self) -> String {
        self.errors()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Everything a rule may inspect.
#[derive(Debug, Clone, Copy)]
pub struct LintContext<'a> {
    pub document: &'a ComposeDocument,
    pub unresolved: &'a [UnresolvedVar],
    pub modules: &'a [MergedModule],
}

impl<'a> LintContext<'a> {
    pub fn from_merge(output: &'a MergeOutput) -> Self {
        Self {
            document: &output.document,
            unresolved: &output.unresolved,
            modules: &output.modules,
        }
    }
}

pub trait LintRule: Send + Sync {
    fn id(&self) -> &'static str;
    fn check(&self, ctx: &LintContext<'_>, findings: &mut Vec<Finding>);
}

pub struct Linter {
    rules: Vec<Box<dyn LintRule>>,
}

impl Default for Linter {
    fn default() -> Self {
        let mut linter = Self::empty();
        linter.register(ForbiddenBuild);
        linter.register(MissingImage);
        linter.register(UnresolvedVariable);
        linter.register(HostPortCollision);
        linter.register(DanglingReference);
        linter.register(ModuleDependencyRule);
        linter.register(PrivilegedCapabilities);
        linter
    }
}

impl Linter {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn register(&mut self, rule: impl LintRule + 'static) -> &mut Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn rule_ids(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.id()).collect()
    }

    pub fn lint(&self, ctx: &LintContext<'_>) -> LintReport {
        let mut findings = Vec::new();
        for rule in &self.rules {
            let before = findings.len();
            rule.check(ctx, &mut findings);
            tracing::debug!("lint rule {} produced {} finding(s)", rule.id(), findings.len() - before);
        }
        LintReport { findings }
    }
}

pub struct ForbiddenBuild;

impl LintRule for ForbiddenBuild {
    fn id(&self) -> &'static str {
        "forbidden-build"
    }

    fn check(&self, ctx: &LintContext<'_>, findings: &mut Vec<Finding>) {
        for (name, service) in &ctx.document.services {
            if service.build.is_some() {
                findings.push(Finding::error(
                    self.id(),
                    format!("services.{name}.build"),
                    "image builds are not allowed; reference a prebuilt image",
                ));
            }
        }
    }
}

pub struct MissingImage;

impl LintRule for MissingImage {
    fn id(&self) -> &'static str {
        "missing-image"
    }

    fn check(&self, ctx: &LintContext<'_>, findings: &mut Vec<Finding>) {
        for (name, service) in &ctx.document.services {
            if service.image.is_none() && service.build.is_none() {
                findings.push(Finding::error(
                    self.id(),
                    format!("services.{name}"),
                    "service declares no image",
                ));
            }
        }
    }
}

pub struct UnresolvedVariable;

impl LintRule for UnresolvedVariable {
    fn id(&self) -> &'static str {
        "unresolved-variable"
    }

    fn check(&self, ctx: &LintContext<'_>, findings: &mut Vec<Finding>) {
        for var in ctx.unresolved {
            findings.push(Finding::error(
                self.id(),
                var.location.clone(),
                format!("variable ${{{}}} is not set and has no default", var.name),
            ));
        }
    }
}

/// Same host port and protocol: ERROR when bound to the same address,
/// WARNING when spread over different explicit addresses. A missing bind
/// address counts as `0.0.0.0`, which overlaps every address and so makes
/// any second binding of the port an ERROR.
pub struct HostPortCollision;

const WILDCARD_ADDRESS: &str = "0.0.0.0";

impl LintRule for HostPortCollision {
    fn id(&self) -> &'static str {
        "host-port-collision"
    }

    fn check(&self, ctx: &LintContext<'_>, findings: &mut Vec<Finding>) {
        // (port, protocol) -> address -> services
        let mut by_port: BTreeMap<(u16, String), BTreeMap<String, Vec<&str>>> = BTreeMap::new();
        for (name, service) in &ctx.document.services {
            for HostBinding {
                address,
                port,
                protocol,
            } in service.host_bindings()
            {
                let address = address.unwrap_or_else(|| WILDCARD_ADDRESS.to_owned());
                by_port
                    .entry((port, protocol))
                    .or_default()
                    .entry(address)
                    .or_default()
                    .push(name);
            }
        }

        for ((port, protocol), addresses) in &by_port {
            if addresses.contains_key(WILDCARD_ADDRESS) {
                let users: Vec<String> = addresses
                    .iter()
                    .flat_map(|(address, services)| {
                        services.iter().map(move |s| {
                            if address == WILDCARD_ADDRESS {
                                (*s).to_owned()
                            } else {
                                format!("{s} ({address})")
                            }
                        })
                    })
                    .collect();
                if users.len() > 1 {
                    findings.push(Finding::error(
                        self.id(),
                        format!("ports.{WILDCARD_ADDRESS}:{port}/{protocol}"),
                        format!(
                            "host port {port}/{protocol} on {WILDCARD_ADDRESS} is published by {}",
                            users.join(", ")
                        ),
                    ));
                }
                continue;
            }
            for (address, services) in addresses {
                if services.len() > 1 {
                    findings.push(Finding::error(
                        self.id(),
                        format!("ports.{address}:{port}/{protocol}"),
                        format!(
                            "host port {port}/{protocol} on {address} is published by {}",
                            services.join(", ")
                        ),
                    ));
                }
            }
            if addresses.len() > 1 {
                let spread: Vec<String> = addresses
                    .iter()
                    .map(|(address, services)| format!("{address} ({})", services.join(", ")))
                    .collect();
                findings.push(Finding::warning(
                    self.id(),
                    format!("ports.{port}/{protocol}"),
                    format!(
                        "host port {port}/{protocol} is published on several addresses: {}",
                        spread.join(", ")
                    ),
                ));
            }
        }
    }
}

/// Every reference must name an entity declared in the merged document.
/// Declared external entities count as declared; the implicit `default`
/// network always exists.
pub struct DanglingReference;

impl LintRule for DanglingReference {
    fn id(&self) -> &'static str {
        "dangling-reference"
    }

    fn check(&self, ctx: &LintContext<'_>, findings: &mut Vec<Finding>) {
        let doc = ctx.document;
        let mut report = |service: &str, field: &str, kind: &str, target: &str| {
            findings.push(Finding::error(
                self.id(),
                format!("services.{service}.{field}"),
                format!("{kind} '{target}' is not declared"),
            ));
        };

        for (name, service) in &doc.services {
            for (field, target) in service.service_refs_by_field() {
                if !doc.services.contains_key(target) {
                    report(name, field, "service", target);
                }
            }
            for target in service.network_refs() {
                if target != "default" && !doc.networks.contains_key(target) {
                    report(name, "networks", "network", target);
                }
            }
            for target in service.volume_refs() {
                if !doc.volumes.contains_key(target) {
                    report(name, "volumes", "volume", target);
                }
            }
            for target in service.config_refs() {
                if !doc.configs.contains_key(target) {
                    report(name, "configs", "config", target);
                }
            }
            for target in service.secret_refs() {
                if !doc.secrets.contains_key(target) {
                    report(name, "secrets", "secret", target);
                }
            }
        }
    }
}

/// A module's declared dependency on another module must be satisfied by
/// the same composition.
pub struct ModuleDependencyRule;

impl LintRule for ModuleDependencyRule {
    fn id(&self) -> &'static str {
        "module-dependency"
    }

    fn check(&self, ctx: &LintContext<'_>, findings: &mut Vec<Finding>) {
        let present: BTreeSet<&str> = ctx.modules.iter().map(|m| m.module.as_str()).collect();
        for module in ctx.modules {
            for dep in &module.dependencies {
                if present.contains(dep.module.as_str()) {
                    continue;
                }
                let location = format!("modules.{}", module.module);
                if dep.optional {
                    findings.push(Finding::warning(
                        self.id(),
                        location,
                        format!("optional dependency '{}' is not part of the project", dep.module),
                    ));
                } else {
                    findings.push(Finding::error(
                        self.id(),
                        location,
                        format!("required module '{}' is not part of the project", dep.module),
                    ));
                }
            }
        }
    }
}

pub struct PrivilegedCapabilities;

impl LintRule for PrivilegedCapabilities {
    fn id(&self) -> &'static str {
        "privileged-capabilities"
    }

    fn check(&self, ctx: &LintContext<'_>, findings: &mut Vec<Finding>) {
        for (name, service) in &ctx.document.services {
            if service.privileged.as_ref().is_some_and(ferry_schema::Flag::is_set) {
                findings.push(Finding::warning(
                    self.id(),
                    format!("services.{name}.privileged"),
                    "service runs in privileged mode",
                ));
            }
            if !service.cap_add.is_empty() {
                findings.push(Finding::warning(
                    self.id(),
                    format!("services.{name}.cap_add"),
                    format!("service adds capabilities: {}", service.cap_add.join(", ")),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_schema::{ModuleDependency, ModuleName, Namespace};

    fn lint_yaml(yaml: &str) -> LintReport {
        let document = ComposeDocument::from_yaml_str(yaml).unwrap();
        Linter::default().lint(&LintContext {
            document: &document,
            unresolved: &[],
            modules: &[],
        })
    }

    fn rules(report: &LintReport) -> Vec<(&str, Severity)> {
        report
            .findings
            .iter()
            .map(|f| (f.rule.as_str(), f.severity))
            .collect()
    }

    #[test]
    fn clean_document_has_no_findings() {
        let report = lint_yaml(
            "services:\n  a:\n    image: nginx\n    ports: ['8080:80']\n  b:\n    image: redis\n    depends_on: [a]\n",
        );
        assert!(report.findings.is_empty(), "{report:?}");
    }

    #[test]
    fn build_directive_is_error() {
        let report = lint_yaml("services:\n  a:\n    build: .\n");
        assert_eq!(rules(&report), vec![("forbidden-build", Severity::Error)]);
        assert_eq!(report.findings[0].location, "services.a.build");
    }

    #[test]
    fn missing_image_is_error() {
        let report = lint_yaml("services:\n  a:\n    command: sleep\n");
        assert_eq!(rules(&report), vec![("missing-image", Severity::Error)]);
    }

    #[test]
    fn same_address_port_is_error() {
        let report = lint_yaml(
            "services:\n  a:\n    image: x\n    ports: ['8080:80']\n  b:\n    image: y\n    ports: ['0.0.0.0:8080:81']\n",
        );
        assert_eq!(rules(&report), vec![("host-port-collision", Severity::Error)]);
        assert!(report.findings[0].message.contains("a, b"));
    }

    #[test]
    fn different_protocols_do_not_collide() {
        let report = lint_yaml(
            "services:\n  a:\n    image: x\n    ports: ['53:53/udp']\n  b:\n    image: y\n    ports: ['53:53/tcp']\n",
        );
        assert!(report.findings.is_empty());
    }

    #[test]
    fn cross_address_port_is_warning() {
        let report = lint_yaml(
            "services:\n  a:\n    image: x\n    ports: ['127.0.0.1:8080:80']\n  b:\n    image: y\n    ports: ['10.0.0.1:8080:80']\n",
        );
        assert_eq!(rules(&report), vec![("host-port-collision", Severity::Warning)]);
        assert!(!report.has_errors());
    }

    #[test]
    fn wildcard_port_collides_with_explicit_address() {
        let report = lint_yaml(
            "services:\n  a:\n    image: x\n    ports: ['8080:80']\n  b:\n    image: y\n    ports: ['127.0.0.1:8080:80']\n",
        );
        assert_eq!(rules(&report), vec![("host-port-collision", Severity::Error)]);
        assert_eq!(report.findings[0].location, "ports.0.0.0.0:8080/tcp");
        assert!(report.findings[0].message.contains("a, b (127.0.0.1)"));
    }

    #[test]
    fn single_wildcard_binding_is_clean() {
        let report = lint_yaml("services:\n  a:\n    image: x\n    ports: ['8080:80', '8443:443']\n");
        assert!(report.findings.is_empty(), "{report:?}");
    }

    #[test]
    fn dangling_service_reference_names_its_field() {
        let report = lint_yaml(
            "services:\n  a:\n    image: x\n    links: [ghost]\n    network_mode: 'service:vpn'\n    volumes_from: [store]\n",
        );
        let locations: Vec<&str> = report.findings.iter().map(|f| f.location.as_str()).collect();
        assert_eq!(
            locations,
            vec![
                "services.a.links",
                "services.a.network_mode",
                "services.a.volumes_from",
            ]
        );
    }

    #[test]
    fn dangling_references_are_reported() {
        let report = lint_yaml(
            "services:\n  a:\n    image: x\n    depends_on: [ghost]\n    networks: [default, nowhere]\n    volumes: ['data:/data']\n    secrets: [key]\n",
        );
        let messages: Vec<&str> = report.findings.iter().map(|f| f.message.as_str()).collect();
        assert_eq!(
            messages,
            vec![
                "service 'ghost' is not declared",
                "network 'nowhere' is not declared",
                "volume 'data' is not declared",
                "secret 'key' is not declared",
            ]
        );
    }

    #[test]
    fn external_declarations_satisfy_references() {
        let report = lint_yaml(
            "services:\n  a:\n    image: x\n    networks: [proxy]\nnetworks:\n  proxy:\n    external: true\n",
        );
        assert!(report.findings.is_empty());
    }

    #[test]
    fn privileged_and_caps_are_warnings() {
        let report = lint_yaml(
            "services:\n  a:\n    image: x\n    privileged: true\n    cap_add: [NET_ADMIN]\n",
        );
        assert_eq!(
            rules(&report),
            vec![
                ("privileged-capabilities", Severity::Warning),
                ("privileged-capabilities", Severity::Warning),
            ]
        );
        assert!(!report.has_errors());
    }

    #[test]
    fn unresolved_variables_are_errors() {
        let document = ComposeDocument::default();
        let unresolved = vec![UnresolvedVar {
            name: "MISSING_VAR".to_owned(),
            location: "web:services.app.image".to_owned(),
        }];
        let report = Linter::default().lint(&LintContext {
            document: &document,
            unresolved: &unresolved,
            modules: &[],
        });
        assert_eq!(report.findings.len(), 1);
        assert!(report.findings[0].message.contains("${MISSING_VAR}"));
        assert_eq!(report.findings[0].location, "web:services.app.image");
    }

    #[test]
    fn module_dependencies_respect_optional_flag() {
        let document = ComposeDocument::default();
        let modules = vec![MergedModule {
            module: ModuleName::new("web"),
            version: "1.0".to_owned(),
            namespace: Namespace::new("web"),
            services: Vec::new(),
            dependencies: vec![
                ModuleDependency {
                    module: ModuleName::new("db"),
                    optional: false,
                },
                ModuleDependency {
                    module: ModuleName::new("metrics"),
                    optional: true,
                },
            ],
        }];
        let report = Linter::default().lint(&LintContext {
            document: &document,
            unresolved: &[],
            modules: &modules,
        });
        assert_eq!(
            rules(&report),
            vec![
                ("module-dependency", Severity::Error),
                ("module-dependency", Severity::Warning),
            ]
        );
    }

    #[test]
    fn all_rules_run_in_one_pass() {
        let report = lint_yaml(
            "services:\n  a:\n    build: .\n    ports: ['80:80']\n  b:\n    image: y\n    ports: ['80:8080']\n",
        );
        let ids: BTreeSet<&str> = report.errors().map(|f| f.rule.as_str()).collect();
        assert!(ids.contains("forbidden-build"));
        assert!(ids.contains("host-port-collision"));
        assert_eq!(report.error_summary().matches("ERROR").count(), 2);
    }

    #[test]
    fn custom_rules_can_be_registered() {
        struct NoLatest;
        impl LintRule for NoLatest {
            fn id(&self) -> &'static str {
                "no-latest"
            }
            fn check(&self, ctx: &LintContext<'_>, findings: &mut Vec<Finding>) {
                for (name, s) in &ctx.document.services {
                    if s.image.as_deref().is_some_and(|i| i.ends_with(":latest")) {
                        findings.push(Finding::warning(self.id(), name.clone(), "pin a tag"));
                    }
                }
            }
        }

        let mut linter = Linter::default();
        linter.register(NoLatest);
        assert!(linter.rule_ids().contains(&"no-latest"));
        let document = ComposeDocument::from_yaml_str("services:\n  a:\n    image: x:latest\n").unwrap();
        let report = linter.lint(&LintContext {
            document: &document,
            unresolved: &[],
            modules: &[],
        });
        assert_eq!(rules(&report), vec![("no-latest", Severity::Warning)]);
    }
}
