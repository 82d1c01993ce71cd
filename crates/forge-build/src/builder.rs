//! The [`Builder`]: owns the step tree and databases, runs builds.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use forge_index::AssetIndexMap;
use forge_store::{DatabaseOptions, ObjectDatabase};
use forge_types::{ObjectId, ResultStatus};
use tracing::{info, warn};
use uuid::Uuid;

use crate::command::CommandRegistry;
use crate::config::BuilderConfig;
use crate::context::CancelFlag;
use crate::error::{BuildError, BuildResult};
use crate::file_tracker::{FileVersionTracker, FILE_VERSIONS_NAME};
use crate::logger::StepLogger;
use crate::remote::{ProcessLauncher, SlaveLauncher};
use crate::session::{BuildSession, SessionParts};
use crate::step::BuildStep;

/// Database layout version. Loose objects of any other version are wiped.
pub const EXPECTED_VERSION: u32 = 4;
/// Name of the version file inside the database directory.
pub const VERSION_FILE: &str = "version";
/// Subdirectory of the database directory holding cached command results.
pub const RESULTS_DIRECTORY: &str = "results";
/// Outputs with this tag are left out of bundles.
pub const DO_NOT_PACK_TAG: &str = "DoNotPack";
/// Outputs with this tag are stored uncompressed in bundles.
pub const DO_NOT_COMPRESS_TAG: &str = "DoNotCompress";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BuildMode {
    Build,
    /// Forget cached results.
    Clean,
    /// Forget cached results and delete what they produced.
    CleanAndDelete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BuildResultCode {
    Successful,
    BuildError,
    Cancelled,
}

impl BuildResultCode {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Successful => 0,
            Self::BuildError => 1,
            Self::Cancelled => 2,
        }
    }
}

#[derive(Default)]
struct Counts {
    total: usize,
    steps: HashMap<ResultStatus, usize>,
    commands: HashMap<ResultStatus, usize>,
}

/// Terminal statuses of the steps processed in one run.
#[derive(Default)]
pub struct StepCounter {
    counts: Mutex<Counts>,
}

impl StepCounter {
    pub fn add(&self, step: &BuildStep, status: ResultStatus) {
        let mut counts = self.counts.lock().expect("step counter lock poisoned");
        counts.total += 1;
        *counts.steps.entry(status).or_default() += 1;
        if step.as_command().is_some() {
            *counts.commands.entry(status).or_default() += 1;
        }
    }

    pub fn total(&self) -> usize {
        self.counts.lock().expect("step counter lock poisoned").total
    }

    /// Steps of any kind that ended with `status`.
    pub fn get(&self, status: ResultStatus) -> usize {
        let counts = self.counts.lock().expect("step counter lock poisoned");
        counts.steps.get(&status).copied().unwrap_or(0)
    }

    /// Command steps that ended with `status`.
    pub fn commands(&self, status: ResultStatus) -> usize {
        let counts = self.counts.lock().expect("step counter lock poisoned");
        counts.commands.get(&status).copied().unwrap_or(0)
    }

    fn clear(&self) {
        *self.counts.lock().expect("step counter lock poisoned") = Counts::default();
    }
}

/// Open the object database described by `config` at `path`.
pub(crate) fn open_database(path: &Path, config: &BuilderConfig) -> BuildResult<ObjectDatabase> {
    Ok(ObjectDatabase::open(
        path,
        DatabaseOptions {
            index_name: config.index_name.clone(),
            read_only: false,
            additional_root: None,
            load_default_bundle: config.load_default_bundle,
        },
    )?)
}

pub struct Builder {
    build_path: PathBuf,
    profile: Option<String>,
    config: BuilderConfig,
    builder_id: Uuid,
    root: Mutex<Arc<BuildStep>>,
    database: Arc<ObjectDatabase>,
    results: Arc<ObjectDatabase>,
    tracker: Arc<FileVersionTracker>,
    registry: CommandRegistry,
    launcher: Arc<dyn SlaveLauncher>,
    cancel: CancelFlag,
    running: AtomicBool,
    counter: Arc<StepCounter>,
    disable_compression_ids: Mutex<HashSet<ObjectId>>,
    logger: StepLogger,
}

impl Builder {
    /// Open the databases under `build_path` and start with an empty root.
    ///
    /// Commands handed to slaves or re-run from cached results must be
    /// registered in `registry`.
    pub fn open(
        build_path: impl Into<PathBuf>,
        profile: Option<String>,
        config: BuilderConfig,
        registry: CommandRegistry,
    ) -> BuildResult<Self> {
        let build_path = build_path.into();
        let database_path = config.database_path(&build_path);
        fs::create_dir_all(&database_path)?;

        let database = Arc::new(open_database(&database_path, &config)?);
        let results = Arc::new(ObjectDatabase::open(
            &database_path.join(RESULTS_DIRECTORY),
            DatabaseOptions {
                load_default_bundle: false,
                ..DatabaseOptions::default()
            },
        )?);
        let tracker = Arc::new(FileVersionTracker::open(
            &database_path.join(FILE_VERSIONS_NAME),
        )?);
        let launcher: Arc<dyn SlaveLauncher> =
            Arc::new(ProcessLauncher::new(config.slave_executable()?));

        let builder_id = Uuid::now_v7();
        info!(
            %builder_id,
            build_path = %build_path.display(),
            profile = ?profile,
            threads = config.thread_count,
            processes = config.max_parallel_processes,
            "builder opened"
        );
        for pipe in &config.monitor_pipe_names {
            info!(pipe = %pipe, "monitor pipe registered");
        }

        Ok(Self {
            build_path,
            profile,
            config,
            builder_id,
            root: Mutex::new(BuildStep::list("Root")),
            database,
            results,
            tracker,
            registry,
            launcher,
            cancel: CancelFlag::new(),
            running: AtomicBool::new(false),
            counter: Arc::new(StepCounter::default()),
            disable_compression_ids: Mutex::new(HashSet::new()),
            logger: StepLogger::new("Builder"),
        })
    }

    /// Replace the slave launcher.
    pub fn with_launcher(mut self, launcher: Arc<dyn SlaveLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn root(&self) -> Arc<BuildStep> {
        Arc::clone(&self.root.lock().expect("root lock poisoned"))
    }

    /// Start over with an empty root. Steps run at most once, so every run
    /// after the first needs a fresh tree.
    pub fn reset(&self) {
        *self.root.lock().expect("root lock poisoned") = BuildStep::list("Root");
        self.disable_compression_ids
            .lock()
            .expect("disable compression lock poisoned")
            .clear();
    }

    pub fn database(&self) -> &Arc<ObjectDatabase> {
        &self.database
    }

    pub fn builder_id(&self) -> Uuid {
        self.builder_id
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    pub fn build_path(&self) -> &Path {
        &self.build_path
    }

    pub fn logger(&self) -> &StepLogger {
        &self.logger
    }

    /// Statuses of the last run.
    pub fn counter(&self) -> &StepCounter {
        &self.counter
    }

    /// Ask the running build to stop. Steps already running finish; steps
    /// that become ready afterwards are `Cancelled`.
    pub fn cancel(&self) {
        info!(builder_id = %self.builder_id, "build cancellation requested");
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn run(&self, mode: BuildMode) -> BuildResult<BuildResultCode> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(BuildError::invalid("a build is already running"));
        }
        let _running = RunningGuard(&self.running);
        let _cancel = CancelReset(&self.cancel);

        let root = self.root();
        if root.execution_id() != 0 {
            return Err(BuildError::invalid(
                "the root has already been built, reset the builder first",
            ));
        }

        self.check_database_version()?;
        self.counter.clear();
        info!(builder_id = %self.builder_id, ?mode, "build started");

        let session = BuildSession::new(SessionParts {
            mode,
            database: Arc::clone(&self.database),
            results: Arc::clone(&self.results),
            parameters: self.config.parameters.clone(),
            cancel: self.cancel.clone(),
            tracker: Arc::clone(&self.tracker),
            registry: self.registry.clone(),
            launcher: Arc::clone(&self.launcher),
            max_parallel_processes: self.config.max_parallel_processes,
            counter: Arc::clone(&self.counter),
            logger: self.logger.clone(),
            build_path: self.build_path.clone(),
            profile: self.profile.clone(),
            send_timeout: self.config.send_timeout(),
        });
        session.schedule(None, &root)?;

        let faults = session.scheduler.run_until_end().await;
        if let Some(fault) = faults.into_iter().next() {
            self.logger.log(
                forge_types::LogMessageType::Fatal,
                format!("Unexpected error in {}: {}", fault.name, fault.message),
            );
            return Err(fault.into());
        }

        let code = match mode {
            BuildMode::Build => self.finish_build(),
            BuildMode::Clean | BuildMode::CleanAndDelete => {
                if mode == BuildMode::CleanAndDelete {
                    self.database.asset_index().clear()?;
                }
                self.logger.info("Clean has been successfully completed");
                BuildResultCode::Successful
            }
        };
        Ok(code)
    }

    fn finish_build(&self) -> BuildResultCode {
        let counter = &self.counter;
        let failed = counter.get(ResultStatus::Failed)
            + counter.get(ResultStatus::NotTriggeredPrerequisiteFailed);

        if self.cancel.is_cancelled() {
            self.logger.warning("Build has been cancelled.");
            return BuildResultCode::Cancelled;
        }

        let summary = format!(
            "Build finished in {} steps. Command results: {} succeeded, {} up-to-date, {} failed, {} not triggered due to previous failure.",
            counter.total(),
            counter.commands(ResultStatus::Successful),
            counter.commands(ResultStatus::NotTriggeredWasSuccessful),
            counter.commands(ResultStatus::Failed),
            counter.commands(ResultStatus::NotTriggeredPrerequisiteFailed),
        );
        if failed > 0 {
            self.logger.error(summary);
            self.logger.error("Build failed.");
            BuildResultCode::BuildError
        } else {
            self.logger.info(summary);
            self.logger.info("Build is successful.");
            BuildResultCode::Successful
        }
    }

    /// Write the content produced by the root into the asset index.
    ///
    /// Without `merge` the index is emptied first. Outputs tagged
    /// [`DO_NOT_COMPRESS_TAG`] are remembered in
    /// [`disable_compression_ids`](Self::disable_compression_ids).
    pub fn write_index_file(&self, merge: bool) -> BuildResult<()> {
        let index = self.database.asset_index();
        if !merge {
            index.clear()?;
        }

        let mut values = Vec::new();
        let mut uncompressed = self
            .disable_compression_ids
            .lock()
            .expect("disable compression lock poisoned");
        for (url, output) in self.root().output_objects() {
            if !url.url_type.is_content() {
                continue;
            }
            if output.tags.contains(DO_NOT_COMPRESS_TAG) {
                uncompressed.insert(output.id);
            }
            values.push((url.path, output.id));
        }
        let written = values.len();
        index.set_many(values)?;
        index.save()?;
        info!(entries = written, merge, "index file written");
        Ok(())
    }

    pub fn disable_compression_ids(&self) -> HashSet<ObjectId> {
        self.disable_compression_ids
            .lock()
            .expect("disable compression lock poisoned")
            .clone()
    }

    /// Content urls of the root tagged `tag`.
    pub fn tagged_outputs(&self, tag: &str) -> Vec<String> {
        self.root()
            .output_objects()
            .into_iter()
            .filter(|(url, output)| url.url_type.is_content() && output.tags.contains(tag))
            .map(|(url, _)| url.path)
            .collect()
    }

    /// Wipe the loose objects and cached results of a database written by
    /// another layout version, then record the current one.
    pub fn check_database_version(&self) -> BuildResult<()> {
        let path = self
            .config
            .database_path(&self.build_path)
            .join(VERSION_FILE);
        let version = fs::read_to_string(&path)
            .ok()
            .and_then(|text| text.trim().parse::<u32>().ok());
        if version == Some(EXPECTED_VERSION) {
            return Ok(());
        }

        warn!(found = ?version, expected = EXPECTED_VERSION, "database version mismatch, wiping loose objects");
        for database in [&self.database, &self.results] {
            for id in database.enumerate_loose_objects()? {
                let _ = database.delete(&id);
            }
        }
        fs::write(&path, EXPECTED_VERSION.to_string())?;
        Ok(())
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Clears a cancel request when the run ends, however it ends.
struct CancelReset<'a>(&'a CancelFlag);

impl Drop for CancelReset<'_> {
    fn drop(&mut self) {
        self.0.reset();
    }
}
