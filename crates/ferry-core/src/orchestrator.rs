//! Bounded worker pool that runs builds from `queued` to a terminal state.
//!
//! Every status and progress change goes through `BuildStore::update`, so the
//! record on disk is always the source of truth. A build's request is kept at
//! `work/<id>/request.json` until it terminates; an orchestrator that finds
//! the runner lock free on startup requeues those requests and fails builds a
//! previous process left in `building`.
//!
//! A worker holds `work/<id>/.owner.lock` from `queued → building` until the
//! terminal transition is recorded. Recovery only fails a `building` build
//! whose owner lock it can take, so builds still running in another process
//! sharing the store are left alone. The slot ceiling applies per process.

use crate::assembler::{assemble, AssemblyInput};
use crate::concurrency::BuildSlots;
use crate::config::FerryConfig;
use crate::lifecycle::validate_transition;
use crate::pipeline::{resolve_inputs, BuildRequest, BuildSource};
use crate::scripts::{ScriptRenderer, TemplateScripts};
use crate::CoreError;
use ferry_compose::{merge, LintContext, Linter};
use ferry_registry::{package_images, PackageError, RegistryClient};
use ferry_schema::{Build, BuildFailure, BuildId, BuildStage, BuildStatus};
use ferry_store::{Store, StoreLayout, StoreLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const REQUEST_FILE: &str = "request.json";
/// Written by `cancel` so a runner in another process sees the request.
const CANCEL_MARKER: &str = "cancel";

const PROGRESS_MERGED: u8 = 10;
const PROGRESS_LINTED: u8 = 20;
const PROGRESS_IMAGES: u8 = 70;
const PROGRESS_ASSEMBLED: u8 = 95;

/// Where a completed build's installer lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildResult {
    pub id: BuildId,
    /// Relative to the store root.
    pub download: String,
    pub path: PathBuf,
    pub warnings: Vec<String>,
}

#[derive(Default)]
struct Queue {
    pending: VecDeque<BuildId>,
    shutdown: bool,
}

struct Shared {
    store: Store,
    registry: Arc<dyn RegistryClient>,
    config: FerryConfig,
    linter: Linter,
    renderer: Box<dyn ScriptRenderer>,
    slots: BuildSlots,
    queue: Mutex<Queue>,
    job_ready: Condvar,
    cancels: Mutex<HashMap<String, Arc<AtomicBool>>>,
    /// Bumped on every terminal transition; waiters re-read the store.
    settled: Mutex<u64>,
    settled_cv: Condvar,
}

pub struct Orchestrator {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    _runner: Option<StoreLock>,
}

struct Completion {
    merged_manifest: String,
    installer_manifest: String,
    download: String,
    warnings: Vec<String>,
}

fn fail(stage: BuildStage, message: impl ToString) -> BuildFailure {
    BuildFailure {
        stage,
        message: message.to_string(),
    }
}

fn cancelled() -> BuildFailure {
    fail(BuildStage::Cancelled, "cancelled by request")
}

impl Orchestrator {
    /// Start with the default lint rules and script templates.
    pub fn start(
        store: Store,
        registry: Arc<dyn RegistryClient>,
        config: FerryConfig,
    ) -> Result<Self, CoreError> {
        Self::start_with(
            store,
            registry,
            config,
            Linter::default(),
            Box::new(TemplateScripts),
        )
    }

    pub fn start_with(
        store: Store,
        registry: Arc<dyn RegistryClient>,
        config: FerryConfig,
        linter: Linter,
        renderer: Box<dyn ScriptRenderer>,
    ) -> Result<Self, CoreError> {
        config.target_platform()?;
        let ceiling = config.max_concurrent_builds.max(1);
        let runner = StoreLock::try_acquire(&store.layout().runner_lock_file())?;

        let shared = Arc::new(Shared {
            store,
            registry,
            config,
            linter,
            renderer,
            slots: BuildSlots::new(ceiling),
            queue: Mutex::new(Queue::default()),
            job_ready: Condvar::new(),
            cancels: Mutex::new(HashMap::new()),
            settled: Mutex::new(0),
            settled_cv: Condvar::new(),
        });

        if runner.is_some() {
            shared.recover()?;
        } else {
            debug!("another process holds the runner lock; skipping recovery");
        }

        let workers = (0..ceiling)
            .map(|n| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("ferry-build-{n}"))
                    .spawn(move || shared.worker_loop())
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!("orchestrator started with {ceiling} build slot(s)");
        Ok(Self {
            shared,
            workers,
            _runner: runner,
        })
    }

    pub fn store(&self) -> &Store {
        &self.shared.store
    }

    pub fn config(&self) -> &FerryConfig {
        &self.shared.config
    }

    /// Record a queued build and hand it to the pool.
    pub fn submit(&self, request: BuildRequest) -> Result<BuildId, CoreError> {
        if self.shared.lock_queue().shutdown {
            return Err(CoreError::ShuttingDown);
        }
        let name = request.name.clone().unwrap_or_else(|| match &request.source {
            BuildSource::Project(id) => id.to_string(),
            BuildSource::AdHoc { name, .. } => name.clone(),
        });
        let build = self.shared.store.builds.create(
            None,
            &name,
            request.project_id().cloned(),
            request.owner.clone(),
        )?;
        self.shared.write_request(&build.id, &request)?;
        self.shared.enqueue(build.id.clone());
        info!("submitted build {} ({name})", build.id);
        Ok(build.id)
    }

    pub fn status(&self, id: &str) -> Result<Build, CoreError> {
        Ok(self.shared.store.builds.get(id)?)
    }

    pub fn list(&self) -> Result<Vec<Build>, CoreError> {
        Ok(self.shared.store.builds.list()?)
    }

    /// Cancel a queued or building build; see [`cancel_build`].
    pub fn cancel(&self, id: &str) -> Result<Build, CoreError> {
        let build = cancel_build(&self.shared.store, id)?;
        let flag = self.shared.lock_cancels().get(id).cloned();
        if let Some(flag) = flag {
            flag.store(true, Ordering::SeqCst);
        }
        if build.status.is_terminal() {
            self.shared.lock_cancels().remove(id);
            self.shared.settle(id);
        }
        Ok(build)
    }

    pub fn result(&self, id: &str) -> Result<BuildResult, CoreError> {
        build_result(&self.shared.store, id)
    }

    /// Block until the build is terminal or `timeout` elapses, returning the
    /// latest record either way.
    pub fn wait(&self, id: &str, timeout: Duration) -> Result<Build, CoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            let seen = *self.shared.lock_settled();
            let build = self.shared.store.builds.get(id)?;
            let now = Instant::now();
            if build.status.is_terminal() || now >= deadline {
                return Ok(build);
            }
            let slice = (deadline - now).min(Duration::from_millis(100));
            let guard = self.shared.lock_settled();
            if *guard == seen {
                let _ = self
                    .shared
                    .settled_cv
                    .wait_timeout(guard, slice)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
    }

    /// Builds currently holding a slot.
    pub fn active_builds(&self) -> usize {
        self.shared.slots.in_use()
    }

    /// Stop taking jobs and wait for running builds to finish. Queued builds
    /// stay queued and are picked up by the next orchestrator.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        {
            let mut queue = self.shared.lock_queue();
            if queue.shutdown && self.workers.is_empty() {
                return;
            }
            queue.shutdown = true;
        }
        self.shared.job_ready.notify_all();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("build worker panicked");
            }
        }
        debug!("orchestrator stopped");
    }
}

/// Cancel a queued or building build through the store alone.
///
/// A queued build fails at once. A building one gets a marker in its work
/// directory and fails at its runner's next checkpoint, after in-flight
/// retrievals finish or time out.
pub fn cancel_build(store: &Store, id: &str) -> Result<Build, CoreError> {
    let build = store.builds.update(id, |build| {
        if build.status.is_terminal() {
            return Err(CoreError::InvalidState {
                id: id.to_owned(),
                status: build.status.to_string(),
            });
        }
        if build.status == BuildStatus::Queued {
            validate_transition(build.status, BuildStatus::Failed)?;
            build.status = BuildStatus::Failed;
            build.error = Some(cancelled());
        }
        Ok(())
    })?;
    let work = store.layout().work_dir(id);
    if build.status.is_terminal() {
        info!("cancelled queued build {id}");
        if work.exists() {
            fs::remove_dir_all(&work)?;
        }
    } else {
        info!("cancellation requested for build {id}");
        if work.exists() {
            fs::write(work.join(CANCEL_MARKER), b"")?;
        }
    }
    Ok(build)
}

/// The installer of a completed build.
pub fn build_result(store: &Store, id: &str) -> Result<BuildResult, CoreError> {
    let build = store.builds.get(id)?;
    let not_ready = || CoreError::NotReady {
        id: id.to_owned(),
        status: build.status.to_string(),
    };
    if build.status != BuildStatus::Completed || build.deleted {
        return Err(not_ready());
    }
    let download = build.download.clone().ok_or_else(not_ready)?;
    Ok(BuildResult {
        path: store.layout().root().join(&download),
        download,
        id: build.id.clone(),
        warnings: build.warnings.clone(),
    })
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn lock_queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_cancels(&self) -> MutexGuard<'_, HashMap<String, Arc<AtomicBool>>> {
        self.cancels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_settled(&self) -> MutexGuard<'_, u64> {
        self.settled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn layout(&self) -> &StoreLayout {
        self.store.layout()
    }

    fn enqueue(&self, id: BuildId) {
        self.lock_cancels()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)));
        self.lock_queue().pending.push_back(id);
        self.job_ready.notify_one();
    }

    fn write_request(&self, id: &str, request: &BuildRequest) -> Result<(), CoreError> {
        let dir = self.layout().work_dir(id);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(REQUEST_FILE), serde_json::to_vec_pretty(request)?)?;
        Ok(())
    }

    fn read_request(&self, id: &str) -> Result<BuildRequest, CoreError> {
        let content = fs::read(self.layout().work_dir(id).join(REQUEST_FILE))?;
        Ok(serde_json::from_slice(&content)?)
    }

    fn recover(&self) -> Result<(), CoreError> {
        for build in self.store.builds.list()? {
            match build.status {
                BuildStatus::Building => {
                    let owner = self.layout().build_owner_lock_file(&build.id);
                    match StoreLock::try_acquire(&owner)? {
                        Some(_owner) => {
                            warn!("build {} was interrupted while building", build.id);
                            self.finish(
                                &build.id,
                                Err(fail(BuildStage::Cancelled, "interrupted by orchestrator restart")),
                            );
                        }
                        None => debug!("build {} is still running in another process", build.id),
                    }
                }
                BuildStatus::Queued if self.read_request(&build.id).is_ok() => {
                    debug!("requeueing build {}", build.id);
                    self.enqueue(build.id);
                }
                BuildStatus::Queued => {
                    warn!("build {} has no stored request", build.id);
                    self.finish(
                        &build.id,
                        Err(fail(BuildStage::Resolve, "build request missing after restart")),
                    );
                }
                BuildStatus::Completed | BuildStatus::Failed => {}
            }
        }
        Ok(())
    }

    fn next_job(&self) -> Option<BuildId> {
        let mut queue = self.lock_queue();
        loop {
            if queue.shutdown {
                return None;
            }
            if let Some(id) = queue.pending.pop_front() {
                return Some(id);
            }
            queue = self
                .job_ready
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn worker_loop(&self) {
        while let Some(id) = self.next_job() {
            let _slot = self.slots.acquire();
            match self.begin(&id) {
                Ok(Some(_owner)) => {
                    let outcome = self.execute(&id);
                    self.finish(&id, outcome);
                }
                Ok(None) => {
                    debug!("build {id} left the queue before it started");
                    self.lock_cancels().remove(id.as_str());
                }
                Err(e) => {
                    error!("failed to start build {id}: {e}");
                    self.lock_cancels().remove(id.as_str());
                }
            }
        }
    }

    /// `queued → building`, returning the owner lock to hold while the build
    /// runs. `None` when the build is no longer queued or another process
    /// owns it.
    fn begin(&self, id: &str) -> Result<Option<StoreLock>, CoreError> {
        if self.store.builds.get(id)?.status != BuildStatus::Queued {
            return Ok(None);
        }
        let Some(owner) = StoreLock::try_acquire(&self.layout().build_owner_lock_file(id))? else {
            debug!("build {id} is owned by another process");
            return Ok(None);
        };
        let mut started = false;
        self.store.builds.update(id, |build| {
            if build.status != BuildStatus::Queued {
                return Ok::<(), CoreError>(());
            }
            validate_transition(build.status, BuildStatus::Building)?;
            build.status = BuildStatus::Building;
            started = true;
            Ok(())
        })?;
        if !started {
            return Ok(None);
        }
        info!("build {id} started ({} of {} slot(s) in use)", self.slots.in_use(), self.slots.capacity());
        Ok(Some(owner))
    }

    fn cancel_flag(&self, id: &str) -> Arc<AtomicBool> {
        self.lock_cancels()
            .entry(id.to_owned())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    /// Raise progress; never lowers it and never touches a non-building build.
    fn advance(&self, id: &str, progress: u8) {
        let result = self.store.builds.update(id, |build| {
            if build.status == BuildStatus::Building {
                build.progress = build.progress.max(progress.min(99));
            }
            Ok::<(), CoreError>(())
        });
        if let Err(e) = result {
            warn!("failed to record progress for build {id}: {e}");
        }
    }

    fn record(&self, id: &str, mutate: impl FnOnce(&mut Build)) -> Result<(), BuildFailure> {
        self.store
            .builds
            .update(id, |build| {
                mutate(build);
                Ok::<(), CoreError>(())
            })
            .map(|_| ())
            .map_err(|e| fail(BuildStage::Persist, e))
    }

    fn execute(&self, id: &str) -> Result<Completion, BuildFailure> {
        let cancel = self.cancel_flag(id);
        let marker = self.layout().work_dir(id).join(CANCEL_MARKER);
        let check = || {
            if marker.exists() {
                cancel.store(true, Ordering::SeqCst);
            }
            if cancel.load(Ordering::SeqCst) {
                Err(cancelled())
            } else {
                Ok(())
            }
        };

        let request = self
            .read_request(id)
            .map_err(|e| fail(BuildStage::Resolve, e))?;
        let inputs = resolve_inputs(&self.store, &request).map_err(|e| fail(BuildStage::Resolve, e))?;
        check()?;

        let merged = merge(&inputs.modules, Some(&inputs.name)).map_err(|e| fail(BuildStage::Merge, e))?;
        let unpinned = merged
            .document
            .to_yaml_string()
            .map_err(|e| fail(BuildStage::Merge, e))?;
        self.record(id, |build| {
            build.merged_manifest = Some(unpinned);
            build.progress = build.progress.max(PROGRESS_MERGED);
        })?;
        debug!("build {id}: merged {} module(s)", merged.modules.len());

        let report = self.linter.lint(&LintContext::from_merge(&merged));
        if report.has_errors() {
            return Err(fail(BuildStage::Lint, report.error_summary()));
        }
        let mut warnings: Vec<String> = report.warnings().map(ToString::to_string).collect();
        let lint_warnings = warnings.clone();
        self.record(id, |build| {
            build.warnings = lint_warnings;
            build.progress = build.progress.max(PROGRESS_LINTED);
        })?;
        check()?;

        let options = self
            .config
            .package_options(Arc::clone(&cancel))
            .map_err(|e| fail(BuildStage::Images, e))?;
        let mut document = merged.document.clone();
        let images_dir = self.layout().work_dir(id).join("images");
        let span = PROGRESS_IMAGES - PROGRESS_LINTED;
        let on_progress = |done: usize, total: usize| {
            if total > 0 {
                let step = u8::try_from(usize::from(span) * done / total).unwrap_or(span);
                self.advance(id, PROGRESS_LINTED + step);
            }
        };
        let images = package_images(
            &*self.registry,
            &mut document,
            &images_dir,
            &options,
            &on_progress,
        )
        .map_err(|e| match e {
            PackageError::Cancelled => cancelled(),
            other => fail(BuildStage::Images, other),
        })?;
        warnings.extend(images.skipped.iter().map(|f| format!("skipped optional image: {f}")));
        self.advance(id, PROGRESS_IMAGES);
        check()?;

        let build = self.store.builds.get(id).map_err(|e| fail(BuildStage::Assemble, e))?;
        let dest = self.layout().installer_path(id);
        let artifacts = self.layout().artifacts_dir(id);
        fs::create_dir_all(&artifacts).map_err(|e| fail(BuildStage::Assemble, e))?;
        let input = AssemblyInput {
            build_id: &build.id,
            name: &inputs.name,
            project: build.project.as_ref(),
            document: &document,
            modules: &merged.modules,
            images: &images,
            resources: &inputs.resources,
            environment: &inputs.environment,
        };
        let installer = assemble(&input, self.renderer.as_ref(), &self.layout().staging_dir(), &dest)
            .map_err(|e| fail(BuildStage::Assemble, e))?;
        self.advance(id, PROGRESS_ASSEMBLED);
        info!(
            "build {id}: installer assembled ({} image(s), {} bytes)",
            installer.manifest.images.len(),
            installer.size
        );

        if let Err(failure) = check() {
            let _ = fs::remove_dir_all(&artifacts);
            return Err(failure);
        }

        Ok(Completion {
            merged_manifest: installer.compose,
            installer_manifest: installer.manifest_json,
            download: StoreLayout::installer_download(id),
            warnings,
        })
    }

    /// Move the build to its terminal state and drop per-build scratch.
    fn finish(&self, id: &str, outcome: Result<Completion, BuildFailure>) {
        let target = if outcome.is_ok() {
            BuildStatus::Completed
        } else {
            BuildStatus::Failed
        };
        let result = self.store.builds.update(id, |build| {
            validate_transition(build.status, target)?;
            build.status = target;
            match &outcome {
                Ok(done) => {
                    build.progress = 100;
                    build.merged_manifest = Some(done.merged_manifest.clone());
                    build.installer_manifest = Some(done.installer_manifest.clone());
                    build.download = Some(done.download.clone());
                    build.warnings = done.warnings.clone();
                }
                Err(failure) => build.error = Some(failure.clone()),
            }
            Ok::<(), CoreError>(())
        });

        match (&result, &outcome) {
            (Ok(_), Ok(_)) => info!("build {id} completed"),
            (Ok(_), Err(failure)) => warn!("build {id} failed: {failure}"),
            (Err(e), _) => {
                error!("failed to record outcome of build {id}: {e}");
                if outcome.is_ok() {
                    let _ = fs::remove_dir_all(self.layout().artifacts_dir(id));
                    let _ = self.store.builds.update(id, |build| {
                        validate_transition(build.status, BuildStatus::Failed)?;
                        build.status = BuildStatus::Failed;
                        build.error = Some(fail(BuildStage::Persist, e));
                        Ok::<(), CoreError>(())
                    });
                }
            }
        }
        if outcome.is_err() {
            let _ = fs::remove_dir_all(self.layout().artifacts_dir(id));
        }

        let work = self.layout().work_dir(id);
        if work.exists() {
            if let Err(e) = fs::remove_dir_all(&work) {
                warn!("failed to clean work directory {}: {e}", work.display());
            }
        }
        self.lock_cancels().remove(id);
        self.settle(id);
    }

    fn settle(&self, id: &str) {
        *self.lock_settled() += 1;
        self.settled_cv.notify_all();
        debug!("build {id} settled");
    }
}
