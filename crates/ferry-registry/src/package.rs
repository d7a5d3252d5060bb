//! Image Resolver/Packager.
//!
//! Resolves every distinct image reference of a merged document to a digest,
//! retrieves each distinct digest once into an OCI-layout tar named after the
//! digest, and pins the document's references to `name@digest`.
//!
//! Resolution and retrieval are fan-out/fan-in over a bounded pool of scoped
//! threads. A failed retrieval never cancels the others; the stage fails only
//! when a non-optional image is missing once every task has finished.

use crate::oci::{self, Descriptor, ImageIndex, ImageManifest, Platform};
use crate::{verify_digest, DigestWriter, ImageRef, PackageError, RegistryClient, RegistryError};
use ferry_schema::{ComposeDocument, Digest};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct PackageOptions {
    /// Size of the retrieval pool.
    pub workers: usize,
    /// Budget for retrieving one image (manifest, config and layers).
    pub timeout: Duration,
    pub platform: Platform,
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for PackageOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            timeout: Duration::from_secs(300),
            platform: Platform::default(),
            cancel: None,
        }
    }
}

impl PackageOptions {
    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }
}

/// One reference's packaged blob.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PackagedImage {
    pub digest: Digest,
    /// `name@digest`, as written back into the document.
    pub pinned: String,
    /// File name inside the images directory: `<algo>-<hex>.tar`.
    pub file: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Image reference (as written before pinning) → resolved digest → blob.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImageDigestMap {
    pub images: BTreeMap<String, PackagedImage>,
    /// Optional images that could not be packaged.
    pub skipped: Vec<ImageFailure>,
}

impl ImageDigestMap {
    /// Look up by the original or the pinned reference.
    pub fn find(&self, reference: &str) -> Option<&PackagedImage> {
        self.images
            .get(reference)
            .or_else(|| self.images.values().find(|p| p.pinned == reference))
    }

    /// Distinct digests, one per blob file.
    pub fn digests(&self) -> BTreeSet<&Digest> {
        self.images.values().map(|p| &p.digest).collect()
    }

    /// Distinct blob files, sorted by name.
    pub fn files(&self) -> BTreeMap<&str, &Path> {
        self.images
            .values()
            .map(|p| (p.file.as_str(), p.path.as_path()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ImageFailure {
    pub reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    pub reason: String,
    pub optional: bool,
}

impl fmt::Display for ImageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.digest {
            Some(d) => write!(f, "{} ({d}): {}", self.reference, self.reason),
            None => write!(f, "{}: {}", self.reference, self.reason),
        }
    }
}

struct Wanted {
    reference: String,
    image: ImageRef,
    optional: bool,
}

struct DigestGroup {
    digest: Digest,
    /// Every wanted reference that resolved to `digest`; the first is fetched.
    members: Vec<usize>,
    optional: bool,
}

struct Deadline {
    started: Instant,
    limit: Duration,
}

impl Deadline {
    fn start(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    fn check(&self, image: &ImageRef, options: &PackageOptions) -> Result<(), RegistryError> {
        if options.is_cancelled() {
            return Err(RegistryError::Cancelled);
        }
        if self.started.elapsed() > self.limit {
            return Err(RegistryError::Timeout {
                reference: image.to_string(),
                secs: self.limit.as_secs(),
            });
        }
        Ok(())
    }
}

/// Run `task` over `items` on at most `workers` scoped threads; results keep
/// the order of `items`.
fn fan_out<T, R, F>(workers: usize, items: &[T], task: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    let next = AtomicUsize::new(0);
    let workers = workers.clamp(1, items.len().max(1));
    let mut results: Vec<(usize, R)> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                s.spawn(|| {
                    let mut done = Vec::new();
                    loop {
                        let i = next.fetch_add(1, Ordering::SeqCst);
                        let Some(item) = items.get(i) else { break };
                        done.push((i, task(item)));
                    }
                    done
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
            .collect()
    });
    results.sort_by_key(|(i, _)| *i);
    results.into_iter().map(|(_, r)| r).collect()
}

/// Distinct references with their optionality. A reference is optional only
/// when every service using it is.
fn collect_references(document: &ComposeDocument) -> BTreeMap<String, bool> {
    let mut wanted: BTreeMap<String, bool> = BTreeMap::new();
    for service in document.services.values() {
        if let Some(image) = &service.image {
            let optional = service.is_image_optional();
            wanted
                .entry(image.clone())
                .and_modify(|o| *o &= optional)
                .or_insert(optional);
        }
    }
    wanted
}

/// Package every image of `document` into `images_dir` and pin its references.
///
/// `progress(done, total)` is called as each distinct digest finishes.
pub fn package_images(
    client: &dyn RegistryClient,
    document: &mut ComposeDocument,
    images_dir: &Path,
    options: &PackageOptions,
    progress: &(dyn Fn(usize, usize) + Sync),
) -> Result<ImageDigestMap, PackageError> {
    fs::create_dir_all(images_dir)?;
    let mut failures = Vec::new();

    let mut wanted = Vec::new();
    for (reference, optional) in collect_references(document) {
        match ImageRef::parse(&reference) {
            Ok(image) => wanted.push(Wanted {
                reference,
                image,
                optional,
            }),
            Err(e) => failures.push(ImageFailure {
                reference,
                digest: None,
                reason: e.to_string(),
                optional,
            }),
        }
    }
    tracing::info!("resolving {} image reference(s)", wanted.len());

    let resolved = fan_out(options.workers, &wanted, |w| {
        if options.is_cancelled() {
            return Err(RegistryError::Cancelled);
        }
        client.resolve(&w.image)
    });

    let mut groups: BTreeMap<Digest, DigestGroup> = BTreeMap::new();
    for (i, result) in resolved.into_iter().enumerate() {
        let w = &wanted[i];
        match result {
            Ok(digest) => {
                tracing::debug!("resolved {} -> {digest}", w.reference);
                let group = groups.entry(digest.clone()).or_insert_with(|| DigestGroup {
                    digest,
                    members: Vec::new(),
                    optional: true,
                });
                group.members.push(i);
                group.optional &= w.optional;
            }
            Err(e) => failures.push(ImageFailure {
                reference: w.reference.clone(),
                digest: None,
                reason: e.to_string(),
                optional: w.optional,
            }),
        }
    }
    if options.is_cancelled() {
        return Err(PackageError::Cancelled);
    }

    let groups: Vec<DigestGroup> = groups.into_values().collect();
    let total = groups.len();
    let done = AtomicUsize::new(0);
    progress(0, total);
    tracing::info!(
        "retrieving {total} distinct image(s) with {} worker(s)",
        options.workers
    );

    let outcomes = fan_out(options.workers, &groups, |group| {
        let image = &wanted[group.members[0]].image;
        let outcome = write_image(client, image, &group.digest, images_dir, options);
        match &outcome {
            Ok((_, size)) => tracing::info!("packaged {image} ({}, {size} bytes)", group.digest),
            Err(e) => tracing::warn!("failed to package {image}: {e}"),
        }
        progress(done.fetch_add(1, Ordering::SeqCst) + 1, total);
        outcome
    });
    if options.is_cancelled() {
        return Err(PackageError::Cancelled);
    }

    let mut map = ImageDigestMap::default();
    for (group, outcome) in groups.iter().zip(outcomes) {
        match outcome {
            Ok((file, size)) => {
                for &i in &group.members {
                    let w = &wanted[i];
                    map.images.insert(
                        w.reference.clone(),
                        PackagedImage {
                            digest: group.digest.clone(),
                            pinned: w.image.pinned(&group.digest),
                            path: images_dir.join(&file),
                            file: file.clone(),
                            size,
                        },
                    );
                }
            }
            Err(e) => {
                for &i in &group.members {
                    failures.push(ImageFailure {
                        reference: wanted[i].reference.clone(),
                        digest: Some(group.digest.clone()),
                        reason: e.to_string(),
                        optional: group.optional,
                    });
                }
            }
        }
    }

    let (skipped, fatal): (Vec<_>, Vec<_>) = failures.into_iter().partition(|f| f.optional);
    if !fatal.is_empty() {
        return Err(PackageError::Images(fatal));
    }
    for failure in &skipped {
        tracing::warn!("skipping optional image {failure}");
    }
    map.skipped = skipped;

    for service in document.services.values_mut() {
        if let Some(packaged) = service.image.as_deref().and_then(|r| map.images.get(r)) {
            service.image = Some(packaged.pinned.clone());
        }
    }
    Ok(map)
}

enum Entry {
    Inline(Vec<u8>),
    Blob(Digest),
}

fn blob_path(digest: &Digest) -> String {
    format!("blobs/{}/{}", digest.algorithm(), digest.hex())
}

/// Retrieve one image and write `<algo>-<hex>.tar`; returns the file name
/// and its size.
fn write_image(
    client: &dyn RegistryClient,
    image: &ImageRef,
    digest: &Digest,
    images_dir: &Path,
    options: &PackageOptions,
) -> Result<(String, u64), RegistryError> {
    let deadline = Deadline::start(options.timeout);
    deadline.check(image, options)?;

    let top = client.fetch_manifest(image, digest)?;
    verify_digest(image.original(), digest, &top.bytes)?;
    deadline.check(image, options)?;

    let (manifest_digest, manifest) = if oci::is_index(&top.media_type) {
        let index: ImageIndex = serde_json::from_slice(&top.bytes)
            .map_err(|e| RegistryError::Malformed(format!("{image}: index: {e}")))?;
        let entry = options
            .platform
            .select(&index)
            .ok_or_else(|| RegistryError::PlatformNotFound {
                platform: options.platform.to_string(),
                reference: image.to_string(),
            })?;
        let child_digest = entry.parsed_digest()?;
        let child = client.fetch_manifest(image, &child_digest)?;
        verify_digest(image.original(), &child_digest, &child.bytes)?;
        deadline.check(image, options)?;
        if !oci::is_manifest(&child.media_type) {
            return Err(RegistryError::UnsupportedMediaType(child.media_type));
        }
        (child_digest, child)
    } else if oci::is_manifest(&top.media_type) {
        (digest.clone(), top)
    } else {
        return Err(RegistryError::UnsupportedMediaType(top.media_type));
    };

    let parsed: ImageManifest = serde_json::from_slice(&manifest.bytes)
        .map_err(|e| RegistryError::Malformed(format!("{image}: manifest: {e}")))?;

    let mut entries: BTreeMap<String, Entry> = BTreeMap::new();
    for descriptor in std::iter::once(&parsed.config).chain(parsed.layers.iter()) {
        let blob = descriptor.parsed_digest()?;
        entries.insert(blob_path(&blob), Entry::Blob(blob));
    }
    let descriptor = Descriptor {
        media_type: manifest.media_type.clone(),
        digest: manifest_digest.to_string(),
        size: manifest.bytes.len() as u64,
        platform: None,
        annotations: BTreeMap::new(),
    };
    entries.insert(blob_path(&manifest_digest), Entry::Inline(manifest.bytes));
    let index = oci::layout_index(descriptor, image.original(), &image.pinned(digest));
    let index_bytes = serde_json::to_vec(&index)
        .map_err(|e| RegistryError::Malformed(format!("index.json: {e}")))?;
    entries.insert("index.json".to_owned(), Entry::Inline(index_bytes));
    entries.insert(
        "oci-layout".to_owned(),
        Entry::Inline(oci::layout_marker().as_bytes().to_vec()),
    );

    let file = format!("{}.tar", digest.file_stem());
    let tmp = tempfile::NamedTempFile::new_in(images_dir)?;
    {
        let mut builder = tar::Builder::new(tmp.as_file());
        for (path, entry) in entries {
            match entry {
                Entry::Inline(data) => {
                    append_entry(&mut builder, &path, data.len() as u64, data.as_slice())?;
                }
                Entry::Blob(blob) => {
                    // Layers are spooled to disk and verified before they reach the tar.
                    let mut spool = DigestWriter::new(tempfile::tempfile_in(images_dir)?);
                    client.fetch_blob(image, &blob, &mut spool)?;
                    let (mut spooled, size) = spool.verify(image.original(), &blob)?;
                    deadline.check(image, options)?;
                    spooled.seek(SeekFrom::Start(0))?;
                    append_entry(&mut builder, &path, size, &mut spooled)?;
                }
            }
        }
        builder.finish()?;
    }
    tmp.as_file().sync_all()?;
    let path = images_dir.join(&file);
    tmp.persist(&path).map_err(|e| e.error)?;
    let size = fs::metadata(&path)?.len();
    Ok((file, size))
}

fn append_entry<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &str,
    size: u64,
    data: impl Read,
) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    builder.append_data(&mut header, path, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockRegistry;
    use std::io::Read;

    fn document(yaml: &str) -> ComposeDocument {
        ComposeDocument::from_yaml_str(yaml).unwrap()
    }

    fn no_progress(_: usize, _: usize) {}

    fn tar_entries(path: &Path) -> Vec<String> {
        let mut archive = tar::Archive::new(fs::File::open(path).unwrap());
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect()
    }

    #[test]
    fn pins_references_and_writes_layout() {
        let reg = MockRegistry::new();
        let digest = reg.add_image("nginx:1.25", &[b"layer-1", b"layer-2"]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut doc = document("services:\n  web:\n    image: nginx:1.25\n");

        let map = package_images(&reg, &mut doc, dir.path(), &PackageOptions::default(), &no_progress)
            .unwrap();

        let pinned = format!("nginx@{digest}");
        assert_eq!(doc.services["web"].image.as_deref(), Some(pinned.as_str()));
        let packaged = &map.images["nginx:1.25"];
        assert_eq!(packaged.file, format!("{}.tar", digest.file_stem()));
        assert!(packaged.path.exists());

        let entries = tar_entries(&packaged.path);
        let mut sorted = entries.clone();
        sorted.sort();
        assert_eq!(entries, sorted, "entries must be sorted");
        assert!(entries.contains(&"oci-layout".to_owned()));
        assert!(entries.contains(&"index.json".to_owned()));
        assert!(entries.contains(&format!("blobs/sha256/{}", digest.hex())));
        assert_eq!(entries.len(), 2 + 1 + 1 + 2);
    }

    #[test]
    fn spooled_layers_reach_the_tar_intact() {
        let layer: Vec<u8> = (0..3_000_000u32).map(|i| (i % 253) as u8).collect();
        let reg = MockRegistry::new();
        reg.add_image("big:1", &[layer.as_slice()]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut doc = document("services:\n  big:\n    image: big:1\n");

        let map = package_images(&reg, &mut doc, dir.path(), &PackageOptions::default(), &no_progress)
            .unwrap();

        let wanted = format!("blobs/sha256/{}", crate::sha256_digest(&layer).hex());
        let mut archive = tar::Archive::new(fs::File::open(&map.images["big:1"].path).unwrap());
        let mut found = None;
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap().display().to_string() == wanted {
                let mut content = Vec::new();
                entry.read_to_end(&mut content).unwrap();
                found = Some(content);
            }
        }
        assert_eq!(found.as_deref(), Some(layer.as_slice()));
        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1, "only the image tar remains");
    }

    #[test]
    fn same_digest_is_fetched_once() {
        let reg = MockRegistry::new();
        let digest = reg.add_image("nginx:1.25", &[b"shared"]).unwrap();
        reg.tag("nginx:stable", &digest).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut doc = document(
            "services:\n  a:\n    image: nginx:1.25\n  b:\n    image: nginx:stable\n  c:\n    image: nginx:1.25\n",
        );

        let map = package_images(&reg, &mut doc, dir.path(), &PackageOptions::default(), &no_progress)
            .unwrap();

        assert_eq!(map.images.len(), 2);
        assert_eq!(map.digests().len(), 1);
        assert_eq!(reg.manifest_count(), 1);
        let files: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn pinned_reference_is_kept() {
        let reg = MockRegistry::new();
        let digest = reg.add_image("redis:7", &[b"r"]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let reference = format!("redis@{digest}");
        let mut doc = document(&format!("services:\n  cache:\n    image: {reference}\n"));

        let map = package_images(&reg, &mut doc, dir.path(), &PackageOptions::default(), &no_progress)
            .unwrap();
        assert_eq!(doc.services["cache"].image.as_deref(), Some(reference.as_str()));
        assert_eq!(map.images[&reference].digest, digest);
    }

    #[test]
    fn failures_are_collected_not_fail_fast() {
        let reg = MockRegistry::new();
        reg.add_image("good:1", &[b"g"]).unwrap();
        reg.add_image("bad:1", &[b"b"]).unwrap();
        reg.fail("bad:1", "registry unavailable").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut doc = document(
            "services:\n  a:\n    image: good:1\n  b:\n    image: bad:1\n  c:\n    image: missing:1\n",
        );

        let err = package_images(&reg, &mut doc, dir.path(), &PackageOptions::default(), &no_progress)
            .unwrap_err();
        let PackageError::Images(failures) = err else {
            panic!("expected image failures");
        };
        let refs: Vec<&str> = failures.iter().map(|f| f.reference.as_str()).collect();
        assert_eq!(refs, vec!["bad:1", "missing:1"]);
        assert!(failures[0].reason.contains("registry unavailable"));
        // good:1 was still retrieved
        assert_eq!(reg.manifest_count(), 1);
    }

    #[test]
    fn optional_image_failure_is_skipped() {
        let reg = MockRegistry::new();
        reg.add_image("app:1", &[b"a"]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut doc = document(
            "services:\n  app:\n    image: app:1\n  extra:\n    image: tools:1\n    x-ferry-optional: true\n",
        );

        let map = package_images(&reg, &mut doc, dir.path(), &PackageOptions::default(), &no_progress)
            .unwrap();
        assert_eq!(map.skipped.len(), 1);
        assert_eq!(map.skipped[0].reference, "tools:1");
        assert_eq!(doc.services["extra"].image.as_deref(), Some("tools:1"));
    }

    #[test]
    fn shared_reference_is_required_if_any_user_requires_it() {
        let reg = MockRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        let mut doc = document(
            "services:\n  a:\n    image: tools:1\n    x-ferry-optional: true\n  b:\n    image: tools:1\n",
        );
        let result = package_images(&reg, &mut doc, dir.path(), &PackageOptions::default(), &no_progress);
        assert!(matches!(result, Err(PackageError::Images(_))));
    }

    #[test]
    fn corrupted_blob_fails_verification() {
        let reg = MockRegistry::new();
        reg.add_image("app:1", &[b"original"]).unwrap();
        reg.corrupt_blob(&crate::sha256_digest(b"original"), b"tampered");
        let dir = tempfile::tempdir().unwrap();
        let mut doc = document("services:\n  app:\n    image: app:1\n");

        let err = package_images(&reg, &mut doc, dir.path(), &PackageOptions::default(), &no_progress)
            .unwrap_err();
        assert!(err.to_string().contains("digest mismatch"));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0, "no partial blob left");
    }

    #[test]
    fn index_reduced_to_platform() {
        let reg = MockRegistry::new();
        reg.add_index("multi:1", &["linux/amd64", "linux/arm64"]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut doc = document("services:\n  m:\n    image: multi:1\n");
        let options = PackageOptions {
            platform: Platform::parse("linux/arm64").unwrap(),
            ..PackageOptions::default()
        };

        let map = package_images(&reg, &mut doc, dir.path(), &options, &no_progress).unwrap();
        let packaged = &map.images["multi:1"];
        let mut archive = tar::Archive::new(fs::File::open(&packaged.path).unwrap());
        let mut index_json = String::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap().to_str() == Some("index.json") {
                entry.read_to_string(&mut index_json).unwrap();
            }
        }
        let index: ImageIndex = serde_json::from_str(&index_json).unwrap();
        assert_eq!(index.manifests.len(), 1);
        assert_eq!(
            index.manifests[0].annotations[oci::IMAGE_NAME_ANNOTATION],
            packaged.pinned
        );

        let s390 = PackageOptions {
            platform: Platform::parse("linux/s390x").unwrap(),
            ..PackageOptions::default()
        };
        let mut doc = document("services:\n  m:\n    image: multi:1\n");
        let err = package_images(&reg, &mut doc, dir.path(), &s390, &no_progress).unwrap_err();
        assert!(err.to_string().contains("linux/s390x"));
    }

    #[test]
    fn timeout_is_per_image() {
        let reg = MockRegistry::new().with_delay(Duration::from_millis(30));
        reg.add_image("slow:1", &[b"s1", b"s2", b"s3"]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut doc = document("services:\n  s:\n    image: slow:1\n");
        let options = PackageOptions {
            timeout: Duration::from_millis(10),
            ..PackageOptions::default()
        };
        let err = package_images(&reg, &mut doc, dir.path(), &options, &no_progress).unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn cancellation_stops_packaging() {
        let reg = MockRegistry::new();
        reg.add_image("app:1", &[b"a"]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut doc = document("services:\n  app:\n    image: app:1\n");
        let options = PackageOptions {
            cancel: Some(Arc::new(AtomicBool::new(true))),
            ..PackageOptions::default()
        };
        let err = package_images(&reg, &mut doc, dir.path(), &options, &no_progress).unwrap_err();
        assert!(matches!(err, PackageError::Cancelled));
        assert_eq!(reg.call_count(), 0);
    }

    #[test]
    fn progress_reports_each_digest() {
        let reg = MockRegistry::new();
        for name in ["a", "b", "c"] {
            reg.add_image(&format!("{name}:1"), &[name.as_bytes()]).unwrap();
        }
        let dir = tempfile::tempdir().unwrap();
        let mut doc = document(
            "services:\n  a:\n    image: a:1\n  b:\n    image: b:1\n  c:\n    image: c:1\n",
        );
        let seen = std::sync::Mutex::new(Vec::new());
        let options = PackageOptions {
            workers: 2,
            ..PackageOptions::default()
        };
        package_images(&reg, &mut doc, dir.path(), &options, &|done: usize, total: usize| {
            seen.lock().unwrap().push((done, total));
        })
        .unwrap();
        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        assert_eq!(seen, vec![(0, 3), (1, 3), (2, 3), (3, 3)]);
    }

    #[test]
    fn fan_out_keeps_input_order() {
        let items: Vec<u32> = (0..50).collect();
        let out = fan_out(7, &items, |n| n * 2);
        assert_eq!(out, items.iter().map(|n| n * 2).collect::<Vec<_>>());
        assert!(fan_out(3, &Vec::<u32>::new(), |n| *n).is_empty());
    }
}
