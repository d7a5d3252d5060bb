//! Container image references: `[registry/]repository[:tag][@digest]`.

use crate::RegistryError;
use ferry_schema::Digest;
use std::fmt;

pub const DOCKER_HUB: &str = "docker.io";
const DOCKER_HUB_API: &str = "registry-1.docker.io";
const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    /// The reference exactly as written in the manifest.
    original: String,
    /// Name part as written, without tag or digest.
    name: String,
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<Digest>,
}

impl ImageRef {
    pub fn parse(reference: &str) -> Result<Self, RegistryError> {
        let invalid = |reason: &str| RegistryError::InvalidReference {
            reference: reference.to_owned(),
            reason: reason.to_owned(),
        };
        let trimmed = reference.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty reference"));
        }

        let (rest, digest) = match trimmed.rsplit_once('@') {
            Some((rest, d)) => (
                rest,
                Some(Digest::parse(d).ok_or_else(|| invalid("malformed digest"))?),
            ),
            None => (trimmed, None),
        };

        let last_slash = rest.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match rest[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&rest[..split], Some(&rest[split + 1..]))
            }
            None => (rest, None),
        };

        if let Some(tag) = tag {
            let valid = !tag.is_empty()
                && tag.len() <= 128
                && tag
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'));
            if !valid {
                return Err(invalid("malformed tag"));
            }
        }

        let (registry, repository) = match name.split_once('/') {
            Some((first, remainder))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_owned(), remainder.to_owned())
            }
            _ => (DOCKER_HUB.to_owned(), name.to_owned()),
        };
        let repository = if registry == DOCKER_HUB && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };

        let repo_ok = !repository.is_empty()
            && repository.split('/').all(|part| {
                !part.is_empty()
                    && part.bytes().all(|b| {
                        b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-')
                    })
            });
        if !repo_ok {
            return Err(invalid("repository must be lowercase [a-z0-9._-] path components"));
        }

        Ok(Self {
            original: trimmed.to_owned(),
            name: name.to_owned(),
            registry,
            repository,
            tag: tag.map(str::to_owned),
            digest,
        })
    }

    pub fn original(&self) -> &str {
        &self.original
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Host the distribution API is served from.
    pub fn api_host(&self) -> &str {
        if self.registry == DOCKER_HUB {
            DOCKER_HUB_API
        } else {
            &self.registry
        }
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    /// Tag or digest to request from the registry.
    pub fn manifest_reference(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(d), _) => d.to_string(),
            (None, Some(t)) => t.clone(),
            (None, None) => DEFAULT_TAG.to_owned(),
        }
    }

    /// `name@digest`, the reproducible form written back into the manifest.
    pub fn pinned(&self, digest: &Digest) -> String {
        format!("{}@{digest}", self.name)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    #[test]
    fn docker_hub_short_name() {
        let r = ImageRef::parse("nginx").unwrap();
        assert_eq!(r.registry(), "docker.io");
        assert_eq!(r.api_host(), "registry-1.docker.io");
        assert_eq!(r.repository(), "library/nginx");
        assert_eq!(r.manifest_reference(), "latest");
    }

    #[test]
    fn docker_hub_user_repo_with_tag() {
        let r = ImageRef::parse("bitnami/redis:7.2").unwrap();
        assert_eq!(r.repository(), "bitnami/redis");
        assert_eq!(r.tag(), Some("7.2"));
    }

    #[test]
    fn custom_registry_with_port() {
        let r = ImageRef::parse("registry.local:5000/team/app:1.0").unwrap();
        assert_eq!(r.registry(), "registry.local:5000");
        assert_eq!(r.api_host(), "registry.local:5000");
        assert_eq!(r.repository(), "team/app");
        assert_eq!(r.tag(), Some("1.0"));
    }

    #[test]
    fn localhost_is_a_registry() {
        let r = ImageRef::parse("localhost/app").unwrap();
        assert_eq!(r.registry(), "localhost");
        assert_eq!(r.repository(), "app");
    }

    #[test]
    fn digest_pinned_reference() {
        let r = ImageRef::parse(&format!("nginx:1.25@sha256:{HEX}")).unwrap();
        assert_eq!(r.tag(), Some("1.25"));
        assert_eq!(r.digest().unwrap().hex(), HEX);
        assert_eq!(r.manifest_reference(), format!("sha256:{HEX}"));
    }

    #[test]
    fn pinned_form_drops_tag() {
        let r = ImageRef::parse("ghcr.io/org/app:2").unwrap();
        let d = Digest::parse(&format!("sha256:{HEX}")).unwrap();
        assert_eq!(r.pinned(&d), format!("ghcr.io/org/app@sha256:{HEX}"));
    }

    #[test]
    fn rejects_malformed() {
        for bad in ["", "Nginx", "app@sha256:short", "app:bad tag", "a//b"] {
            assert!(ImageRef::parse(bad).is_err(), "{bad}");
        }
    }
}
