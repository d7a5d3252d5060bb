//! Typed container-orchestration document.
//!
//! Only the fields the pipeline interprets are modelled explicitly: entity
//! collections, the reference-carrying service fields, and the fields the
//! policy rules inspect. Everything else lands in a passthrough `extra` map
//! and is emitted unchanged, so rename and rewrite passes are exhaustive over
//! the typed fields without losing unknown content.

use crate::interpolate::{interpolate_value, UnresolvedVar};
use crate::vars::VarMap;
use crate::SchemaError;
use serde::{Deserialize, Deserializer, Serialize};
use indexmap::IndexMap;
use serde_yaml::Value;
use std::collections::BTreeMap;

/// Fields the document does not interpret, emitted verbatim.
pub type Extra = BTreeMap<String, Value>;

/// Extension field marking a service's image as optional for offline packaging.
pub const OPTIONAL_IMAGE_FIELD: &str = "x-ferry-optional";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ComposeDocument {
    #[serde(
        default,
        deserialize_with = "scalar_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub services: IndexMap<String, Service>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub networks: IndexMap<String, Option<ResourceDef>>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub volumes: IndexMap<String, Option<ResourceDef>>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub configs: IndexMap<String, Option<ResourceDef>>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub secrets: IndexMap<String, Option<ResourceDef>>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// Top-level network, volume, config, or secret declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<External>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl ResourceDef {
    pub fn is_external(&self) -> bool {
        match &self.external {
            Some(External::Flag(flag)) => flag.is_set(),
            Some(External::Named(_)) => true,
            None => false,
        }
    }
}

/// True when an optional top-level declaration is marked externally managed.
pub fn is_external(def: Option<&ResourceDef>) -> bool {
    def.is_some_and(ResourceDef::is_external)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum External {
    Flag(Flag),
    Named(ExternalName),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalName {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// Boolean that may arrive as text after interpolation (`"true"`, `"yes"`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Flag {
    Bool(bool),
    Text(String),
}

impl Flag {
    pub fn is_set(&self) -> bool {
        match self {
            Flag::Bool(b) => *b,
            Flag::Text(s) => matches!(
                s.trim().to_ascii_lowercase().as_str(),
                "true" | "yes" | "on" | "1"
            ),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Service {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<DependsOn>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes_from: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networks: Option<ServiceNetworks>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeMount>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortMapping>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configs: Vec<FileRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<FileRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privileged: Option<Flag>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cap_add: Vec<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DependsOn {
    List(Vec<String>),
    Map(BTreeMap<String, Value>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ServiceNetworks {
    List(Vec<String>),
    Map(BTreeMap<String, Option<Value>>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum VolumeMount {
    Short(String),
    Long(LongVolume),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LongVolume {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PortMapping {
    Number(u64),
    Short(String),
    Long(LongPort),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LongPort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FileRef {
    Short(String),
    Long(LongFileRef),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LongFileRef {
    pub source: String,
    #[serde(flatten)]
    pub extra: Extra,
}

/// A host-side port a service publishes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostBinding {
    /// Bind address; `None` means all interfaces.
    pub address: Option<String>,
    pub port: u16,
    pub protocol: String,
}

/// Old-name to new-name maps for every renameable entity kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityRenames {
    pub services: BTreeMap<String, String>,
    pub networks: BTreeMap<String, String>,
    pub volumes: BTreeMap<String, String>,
    pub configs: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, String>,
}

fn renamed(map: &BTreeMap<String, String>, name: &str) -> Option<String> {
    map.get(name).cloned()
}

impl ComposeDocument {
    pub fn from_yaml_str(input: &str) -> Result<Self, SchemaError> {
        let value: Value = serde_yaml::from_str(input)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, SchemaError> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Mapping(_) => Ok(serde_yaml::from_value(value)?),
            _ => Err(SchemaError::InvalidManifest(
                "document root must be a mapping".to_owned(),
            )),
        }
    }

    /// Parse manifest text, substituting placeholders before typing the tree.
    ///
    /// Unresolved placeholders are returned alongside the document rather than
    /// treated as errors.
    pub fn parse_interpolated(
        input: &str,
        vars: &VarMap,
    ) -> Result<(Self, Vec<UnresolvedVar>), SchemaError> {
        let mut value: Value = serde_yaml::from_str(input)?;
        let mut unresolved = Vec::new();
        interpolate_value(&mut value, vars, "", &mut unresolved);
        let doc = Self::from_value(value)?;
        Ok((doc, unresolved))
    }

    pub fn to_yaml_string(&self) -> Result<String, SchemaError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Every distinct image reference, sorted.
    pub fn image_refs(&self) -> Vec<String> {
        let mut refs: Vec<String> = self
            .services
            .values()
            .filter_map(|s| s.image.clone())
            .collect();
        refs.sort();
        refs.dedup();
        refs
    }
}

impl Service {
    /// True when the extension field `x-ferry-optional` is set.
    pub fn is_image_optional(&self) -> bool {
        match self.extra.get(OPTIONAL_IMAGE_FIELD) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => Flag::Text(s.clone()).is_set(),
            _ => false,
        }
    }

    /// Names of other services this service refers to.
    pub fn service_refs(&self) -> Vec<&str> {
        self.service_refs_by_field()
            .into_iter()
            .map(|(_, target)| target)
            .collect()
    }

    /// Service references paired with the field that carries them.
    pub fn service_refs_by_field(&self) -> Vec<(&'static str, &str)> {
        let mut refs = Vec::new();
        if let Some(deps) = &self.depends_on {
            refs.extend(deps.names().into_iter().map(|n| ("depends_on", n)));
        }
        for link in &self.links {
            refs.push(("links", link.split(':').next().unwrap_or(link)));
        }
        if let Some(target) = self
            .network_mode
            .as_deref()
            .and_then(|m| m.strip_prefix("service:"))
        {
            refs.push(("network_mode", target));
        }
        for from in &self.volumes_from {
            if !from.starts_with("container:") {
                refs.push(("volumes_from", from.split(':').next().unwrap_or(from)));
            }
        }
        refs
    }

    pub fn network_refs(&self) -> Vec<&str> {
        match &self.networks {
            Some(ServiceNetworks::List(list)) => list.iter().map(String::as_str).collect(),
            Some(ServiceNetworks::Map(map)) => map.keys().map(String::as_str).collect(),
            None => Vec::new(),
        }
    }

    pub fn volume_refs(&self) -> Vec<&str> {
        self.volumes
            .iter()
            .filter_map(VolumeMount::named_volume)
            .collect()
    }

    pub fn config_refs(&self) -> Vec<&str> {
        self.configs.iter().map(FileRef::source).collect()
    }

    pub fn secret_refs(&self) -> Vec<&str> {
        self.secrets.iter().map(FileRef::source).collect()
    }

    /// Rewrite every reference that appears in `renames`. References absent
    /// from the maps are left untouched.
    pub fn rewrite_references(&mut self, renames: &EntityRenames) {
        if let Some(deps) = &mut self.depends_on {
            deps.rename(&renames.services);
        }
        for link in &mut self.links {
            let (target, alias) = match link.split_once(':') {
                Some((t, a)) => (t.to_owned(), Some(a.to_owned())),
                None => (link.clone(), None),
            };
            if let Some(new) = renamed(&renames.services, &target) {
                // Keep the original name reachable as an alias.
                let alias = alias.unwrap_or(target);
                *link = format!("{new}:{alias}");
            }
        }
        if let Some(mode) = &mut self.network_mode {
            if let Some(new) = mode
                .strip_prefix("service:")
                .and_then(|t| renamed(&renames.services, t))
            {
                *mode = format!("service:{new}");
            }
        }
        for from in &mut self.volumes_from {
            if from.starts_with("container:") {
                continue;
            }
            let (target, suffix) = match from.split_once(':') {
                Some((t, m)) => (t.to_owned(), format!(":{m}")),
                None => (from.clone(), String::new()),
            };
            if let Some(new) = renamed(&renames.services, &target) {
                *from = format!("{new}{suffix}");
            }
        }
        if let Some(networks) = &mut self.networks {
            networks.rename(&renames.networks);
        }
        for mount in &mut self.volumes {
            mount.rename(&renames.volumes);
        }
        for config in &mut self.configs {
            config.rename(&renames.configs);
        }
        for secret in &mut self.secrets {
            secret.rename(&renames.secrets);
        }
    }

    pub fn host_bindings(&self) -> Vec<HostBinding> {
        self.ports.iter().flat_map(PortMapping::host_bindings).collect()
    }
}

impl DependsOn {
    pub fn names(&self) -> Vec<&str> {
        match self {
            DependsOn::List(list) => list.iter().map(String::as_str).collect(),
            DependsOn::Map(map) => map.keys().map(String::as_str).collect(),
        }
    }

    fn rename(&mut self, map: &BTreeMap<String, String>) {
        match self {
            DependsOn::List(list) => {
                for name in list.iter_mut() {
                    if let Some(new) = renamed(map, name) {
                        *name = new;
                    }
                }
            }
            DependsOn::Map(entries) => {
                *entries = std::mem::take(entries)
                    .into_iter()
                    .map(|(k, v)| (renamed(map, &k).unwrap_or(k), v))
                    .collect();
            }
        }
    }
}

impl ServiceNetworks {
    fn rename(&mut self, map: &BTreeMap<String, String>) {
        match self {
            ServiceNetworks::List(list) => {
                for name in list.iter_mut() {
                    if let Some(new) = renamed(map, name) {
                        *name = new;
                    }
                }
            }
            ServiceNetworks::Map(entries) => {
                *entries = std::mem::take(entries)
                    .into_iter()
                    .map(|(k, v)| (renamed(map, &k).unwrap_or(k), v))
                    .collect();
            }
        }
    }
}

/// A short-syntax mount source names a volume unless it looks like a path.
fn is_volume_name(source: &str) -> bool {
    !source.is_empty()
        && !source.starts_with(['/', '.', '~', '$'])
        && !source.contains(['/', '\\'])
}

impl VolumeMount {
    /// The named volume this mount uses, if it is not a bind or tmpfs mount.
    pub fn named_volume(&self) -> Option<&str> {
        match self {
            VolumeMount::Short(spec) => {
                let (source, _) = spec.split_once(':')?;
                is_volume_name(source).then_some(source)
            }
            VolumeMount::Long(long) => {
                let source = long.source.as_deref()?;
                match long.kind.as_deref() {
                    Some("volume") => Some(source),
                    None if is_volume_name(source) => Some(source),
                    _ => None,
                }
            }
        }
    }

    fn rename(&mut self, map: &BTreeMap<String, String>) {
        let Some(new) = self.named_volume().and_then(|v| renamed(map, v)) else {
            return;
        };
        match self {
            VolumeMount::Short(spec) => {
                if let Some((_, rest)) = spec.split_once(':') {
                    *spec = format!("{new}:{rest}");
                }
            }
            VolumeMount::Long(long) => long.source = Some(new),
        }
    }
}

impl FileRef {
    pub fn source(&self) -> &str {
        match self {
            FileRef::Short(s) => s,
            FileRef::Long(long) => &long.source,
        }
    }

    fn rename(&mut self, map: &BTreeMap<String, String>) {
        let Some(new) = renamed(map, self.source()) else {
            return;
        };
        match self {
            // Short syntax mounts at /run/secrets/<source>; keep the original target.
            FileRef::Short(s) => {
                let original = std::mem::replace(s, new.clone());
                *self = FileRef::Long(LongFileRef {
                    source: new,
                    extra: BTreeMap::from([("target".to_owned(), Value::String(original))]),
                });
            }
            FileRef::Long(long) => long.source = new,
        }
    }
}

impl PortMapping {
    pub fn host_bindings(&self) -> Vec<HostBinding> {
        match self {
            PortMapping::Number(_) => Vec::new(),
            PortMapping::Short(spec) => parse_short_port(spec),
            PortMapping::Long(long) => {
                let protocol = long.protocol.clone().unwrap_or_else(|| "tcp".to_owned());
                let published = match &long.published {
                    Some(Value::Number(n)) => n.to_string(),
                    Some(Value::String(s)) => s.clone(),
                    _ => return Vec::new(),
                };
                expand_port_range(&published)
                    .into_iter()
                    .map(|port| HostBinding {
                        address: normalize_address(long.host_ip.as_deref()),
                        port,
                        protocol: protocol.clone(),
                    })
                    .collect()
            }
        }
    }
}

fn normalize_address(address: Option<&str>) -> Option<String> {
    match address.map(str::trim) {
        None | Some("" | "0.0.0.0" | "::" | "[::]") => None,
        Some(a) => Some(a.trim_start_matches('[').trim_end_matches(']').to_owned()),
    }
}

/// Parse `[ip:]host:container[/proto]`, including `[v6]:host:container`.
fn parse_short_port(spec: &str) -> Vec<HostBinding> {
    let (mapping, protocol) = match spec.rsplit_once('/') {
        Some((m, p)) => (m, p.to_owned()),
        None => (spec, "tcp".to_owned()),
    };

    let (address, rest) = if let Some(after) = mapping.strip_prefix('[') {
        match after.split_once("]:") {
            Some((ip, rest)) => (Some(ip), rest),
            None => return Vec::new(),
        }
    } else {
        let parts: Vec<&str> = mapping.split(':').collect();
        match parts.len() {
            3 => (Some(parts[0]), &mapping[parts[0].len() + 1..]),
            _ => (None, mapping),
        }
    };

    let Some((host, _container)) = rest.split_once(':') else {
        return Vec::new();
    };

    expand_port_range(host)
        .into_iter()
        .map(|port| HostBinding {
            address: normalize_address(address),
            port,
            protocol: protocol.clone(),
        })
        .collect()
}

fn expand_port_range(spec: &str) -> Vec<u16> {
    let spec = spec.trim();
    if let Some((start, end)) = spec.split_once('-') {
        match (start.parse::<u16>(), end.parse::<u16>()) {
            (Ok(s), Ok(e)) if s <= e => (s..=e).collect(),
            _ => Vec::new(),
        }
    } else {
        spec.parse::<u16>().map(|p| vec![p]).unwrap_or_default()
    }
}

/// Accept a string, number, or boolean scalar and keep its textual form.
fn scalar_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        Some(other) => Some(serde_yaml::to_string(&other).unwrap_or_default().trim().to_owned()),
    })
}
