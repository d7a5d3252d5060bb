//! In-memory registry for tests: content-addressed blobs, tag table, call
//! counters, injected failures and latency.

use crate::oci::{self, Descriptor, ImageIndex, ImageManifest, PlatformSpec};
use crate::{sha256_digest, FetchedManifest, ImageRef, RegistryClient, RegistryError};
use ferry_schema::Digest;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

#[derive(Default)]
struct MockState {
    tags: HashMap<(String, String), Digest>,
    manifests: HashMap<Digest, FetchedManifest>,
    blobs: HashMap<Digest, Vec<u8>>,
    failures: HashMap<String, String>,
}

#[derive(Default)]
pub struct MockRegistry {
    state: Mutex<MockState>,
    delay: Option<Duration>,
    resolves: AtomicUsize,
    manifest_fetches: AtomicUsize,
    blob_fetches: AtomicUsize,
}

fn repository_key(image: &ImageRef) -> String {
    format!("{}/{}", image.registry(), image.repository())
}

fn tag_key(image: &ImageRef) -> (String, String) {
    (repository_key(image), image.tag().unwrap_or("latest").to_owned())
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn descriptor(media_type: &str, data: &[u8]) -> Descriptor {
        Descriptor {
            media_type: media_type.to_owned(),
            digest: sha256_digest(data).to_string(),
            size: data.len() as u64,
            platform: None,
            annotations: BTreeMap::new(),
        }
    }

    fn store_manifest(state: &mut MockState, layers: &[&[u8]], platform: &PlatformSpec) -> (Digest, Vec<u8>) {
        let config = serde_json::json!({
            "architecture": platform.architecture,
            "os": platform.os,
            "rootfs": {
                "type": "layers",
                "diff_ids": layers.iter().map(|l| sha256_digest(l).to_string()).collect::<Vec<_>>(),
            },
        })
        .to_string()
        .into_bytes();

        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(oci::OCI_MANIFEST.to_owned()),
            config: Self::descriptor(CONFIG_MEDIA_TYPE, &config),
            layers: layers.iter().map(|l| Self::descriptor(LAYER_MEDIA_TYPE, l)).collect(),
        };
        let bytes = serde_json::to_vec(&manifest).unwrap_or_default();
        let digest = sha256_digest(&bytes);

        state.blobs.insert(sha256_digest(&config), config);
        for layer in layers {
            state.blobs.insert(sha256_digest(layer), layer.to_vec());
        }
        state.manifests.insert(
            digest.clone(),
            FetchedManifest {
                media_type: oci::OCI_MANIFEST.to_owned(),
                bytes: bytes.clone(),
            },
        );
        (digest, bytes)
    }

    /// Publish a single-platform (linux/amd64) image under `reference` and
    /// return its manifest digest.
    pub fn add_image(&self, reference: &str, layers: &[&[u8]]) -> Result<Digest, RegistryError> {
        let image = ImageRef::parse(reference)?;
        let platform = PlatformSpec {
            architecture: "amd64".to_owned(),
            os: "linux".to_owned(),
            variant: None,
        };
        let mut state = self.state();
        let (digest, _) = Self::store_manifest(&mut state, layers, &platform);
        if image.digest().is_none() {
            state.tags.insert(tag_key(&image), digest.clone());
        }
        Ok(digest)
    }

    /// Publish a multi-platform index with one single-layer image per
    /// `os/arch[/variant]` entry; returns the index digest.
    pub fn add_index(&self, reference: &str, platforms: &[&str]) -> Result<Digest, RegistryError> {
        let image = ImageRef::parse(reference)?;
        let mut state = self.state();
        let mut manifests = Vec::new();
        for p in platforms {
            let platform = oci::Platform::parse(p)?;
            let spec = PlatformSpec {
                architecture: platform.architecture,
                os: platform.os,
                variant: platform.variant,
            };
            let layer = format!("layer for {p}").into_bytes();
            let (_, bytes) = Self::store_manifest(&mut state, &[layer.as_slice()], &spec);
            let mut entry = Self::descriptor(oci::OCI_MANIFEST, &bytes);
            entry.platform = Some(spec);
            manifests.push(entry);
        }
        let index = ImageIndex {
            schema_version: 2,
            media_type: Some(oci::OCI_INDEX.to_owned()),
            manifests,
        };
        let bytes = serde_json::to_vec(&index).unwrap_or_default();
        let digest = sha256_digest(&bytes);
        state.manifests.insert(
            digest.clone(),
            FetchedManifest {
                media_type: oci::OCI_INDEX.to_owned(),
                bytes,
            },
        );
        state.tags.insert(tag_key(&image), digest.clone());
        Ok(digest)
    }

    /// Point `reference`'s tag at an already published digest.
    pub fn tag(&self, reference: &str, digest: &Digest) -> Result<(), RegistryError> {
        let image = ImageRef::parse(reference)?;
        self.state().tags.insert(tag_key(&image), digest.clone());
        Ok(())
    }

    /// Every call for `reference`'s repository fails with `reason`.
    pub fn fail(&self, reference: &str, reason: &str) -> Result<(), RegistryError> {
        let image = ImageRef::parse(reference)?;
        self.state()
            .failures
            .insert(repository_key(&image), reason.to_owned());
        Ok(())
    }

    /// Serve `data` in place of the blob stored under `digest`.
    pub fn corrupt_blob(&self, digest: &Digest, data: &[u8]) {
        self.state().blobs.insert(digest.clone(), data.to_vec());
    }

    pub fn resolve_count(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }

    pub fn manifest_count(&self) -> usize {
        self.manifest_fetches.load(Ordering::SeqCst)
    }

    pub fn blob_count(&self) -> usize {
        self.blob_fetches.load(Ordering::SeqCst)
    }

    /// Total registry calls of any kind.
    pub fn call_count(&self) -> usize {
        self.resolve_count() + self.manifest_count() + self.blob_count()
    }

    fn enter(&self, image: &ImageRef, counter: &AtomicUsize) -> Result<(), RegistryError> {
        counter.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        match self.state().failures.get(&repository_key(image)) {
            Some(reason) => Err(RegistryError::Http(reason.clone())),
            None => Ok(()),
        }
    }
}

impl RegistryClient for MockRegistry {
    fn resolve(&self, image: &ImageRef) -> Result<Digest, RegistryError> {
        self.enter(image, &self.resolves)?;
        if let Some(digest) = image.digest() {
            return Ok(digest.clone());
        }
        self.state()
            .tags
            .get(&tag_key(image))
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(image.to_string()))
    }

    fn fetch_manifest(&self, image: &ImageRef, digest: &Digest) -> Result<FetchedManifest, RegistryError> {
        self.enter(image, &self.manifest_fetches)?;
        self.state()
            .manifests
            .get(digest)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(format!("{image}: manifest {digest}")))
    }

    fn fetch_blob(
        &self,
        image: &ImageRef,
        digest: &Digest,
        dest: &mut dyn Write,
    ) -> Result<u64, RegistryError> {
        self.enter(image, &self.blob_fetches)?;
        let data = self
            .state()
            .blobs
            .get(digest)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(format!("{image}: blob {digest}")))?;
        dest.write_all(&data)?;
        Ok(data.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_resolve_to_added_digest() {
        let reg = MockRegistry::new();
        let digest = reg.add_image("nginx:1.25", &[b"layer-a"]).unwrap();
        let image = ImageRef::parse("docker.io/library/nginx:1.25").unwrap();
        assert_eq!(reg.resolve(&image).unwrap(), digest);
        assert!(reg
            .resolve(&ImageRef::parse("nginx:1.26").unwrap())
            .is_err());
        assert_eq!(reg.resolve_count(), 2);
    }

    #[test]
    fn retagging_shares_content() {
        let reg = MockRegistry::new();
        let digest = reg.add_image("nginx:1.25", &[b"l"]).unwrap();
        reg.tag("nginx:stable", &digest).unwrap();
        let stable = ImageRef::parse("nginx:stable").unwrap();
        assert_eq!(reg.resolve(&stable).unwrap(), digest);
        let manifest = reg.fetch_manifest(&stable, &digest).unwrap();
        assert_eq!(sha256_digest(&manifest.bytes), digest);
    }

    #[test]
    fn injected_failure_applies_to_repository() {
        let reg = MockRegistry::new();
        reg.add_image("redis:7", &[b"r"]).unwrap();
        reg.fail("redis", "connection reset").unwrap();
        let err = reg.resolve(&ImageRef::parse("redis:7").unwrap()).unwrap_err();
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn index_lists_each_platform() {
        let reg = MockRegistry::new();
        let digest = reg.add_index("app:1", &["linux/amd64", "linux/arm64/v8"]).unwrap();
        let image = ImageRef::parse("app:1").unwrap();
        let fetched = reg.fetch_manifest(&image, &digest).unwrap();
        assert!(oci::is_index(&fetched.media_type));
        let index: ImageIndex = serde_json::from_slice(&fetched.bytes).unwrap();
        assert_eq!(index.manifests.len(), 2);
    }
}
