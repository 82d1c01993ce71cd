//! State shared by every step of one build run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use forge_index::AssetIndexMap;
use forge_store::ObjectDatabase;
use forge_types::{BuildParameters, ObjectId, ObjectUrl, ResultStatus, UrlType};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::builder::{BuildMode, StepCounter};
use crate::command::{Command, CommandRegistry};
use crate::command_step;
use crate::context::{CancelFlag, ContextHost};
use crate::error::{BuildError, BuildResult};
use crate::file_tracker::FileVersionTracker;
use crate::list;
use crate::logger::StepLogger;
use crate::remote::SlaveLauncher;
use crate::scheduler::Scheduler;
use crate::step::{BuildStep, StepKind};

pub(crate) struct BuildSession {
    pub(crate) mode: BuildMode,
    pub(crate) database: Arc<ObjectDatabase>,
    pub(crate) results: Arc<ObjectDatabase>,
    pub(crate) parameters: BuildParameters,
    pub(crate) scheduler: Scheduler,
    pub(crate) cancel: CancelFlag,
    pub(crate) tracker: Arc<FileVersionTracker>,
    pub(crate) registry: CommandRegistry,
    pub(crate) launcher: Arc<dyn SlaveLauncher>,
    pub(crate) process_slots: Semaphore,
    pub(crate) max_parallel_processes: usize,
    pub(crate) counter: Arc<StepCounter>,
    pub(crate) logger: StepLogger,
    pub(crate) build_path: PathBuf,
    pub(crate) profile: Option<String>,
    pub(crate) send_timeout: Duration,
    pub(crate) in_progress: Mutex<HashMap<ObjectId, Arc<BuildStep>>>,
    producers: Mutex<HashMap<String, Arc<BuildStep>>>,
}

/// Everything a session needs from its builder.
pub(crate) struct SessionParts {
    pub mode: BuildMode,
    pub database: Arc<ObjectDatabase>,
    pub results: Arc<ObjectDatabase>,
    pub parameters: BuildParameters,
    pub cancel: CancelFlag,
    pub tracker: Arc<FileVersionTracker>,
    pub registry: CommandRegistry,
    pub launcher: Arc<dyn SlaveLauncher>,
    pub max_parallel_processes: usize,
    pub counter: Arc<StepCounter>,
    pub logger: StepLogger,
    pub build_path: PathBuf,
    pub profile: Option<String>,
    pub send_timeout: Duration,
}

impl BuildSession {
    pub(crate) fn new(parts: SessionParts) -> Arc<Self> {
        Arc::new(Self {
            mode: parts.mode,
            database: parts.database,
            results: parts.results,
            parameters: parts.parameters,
            scheduler: Scheduler::new(),
            cancel: parts.cancel,
            tracker: parts.tracker,
            registry: parts.registry,
            launcher: parts.launcher,
            process_slots: Semaphore::new(parts.max_parallel_processes.max(1)),
            max_parallel_processes: parts.max_parallel_processes,
            counter: parts.counter,
            logger: parts.logger,
            build_path: parts.build_path,
            profile: parts.profile,
            send_timeout: parts.send_timeout,
            in_progress: Mutex::new(HashMap::new()),
            producers: Mutex::new(HashMap::new()),
        })
    }

    /// Start `step` in its own micro-thread, at most once per build.
    ///
    /// `instigator` becomes the step's parent. A step that already has a
    /// different parent is an error.
    pub(crate) fn schedule(
        self: &Arc<Self>,
        instigator: Option<&Arc<BuildStep>>,
        step: &Arc<BuildStep>,
    ) -> BuildResult<()> {
        if let Some(instigator) = instigator {
            match step.parent() {
                Some(parent) if !Arc::ptr_eq(&parent, instigator) => {
                    return Err(BuildError::invalid(format!(
                        "BuildStep {step} already has parent {parent}, cannot be scheduled by {instigator}"
                    )));
                }
                Some(_) => {}
                None => step.set_parent(instigator),
            }
        }

        let id = self.scheduler.reserve_id();
        if !step.try_mark_scheduled(id) {
            return Ok(());
        }
        self.generate_dependencies(step);

        let session = Arc::clone(self);
        let body_step = Arc::clone(step);
        self.scheduler.start(id, step.title(), async move {
            session.run_step(body_step).await
        });
        Ok(())
    }

    async fn run_step(self: Arc<Self>, step: Arc<BuildStep>) -> BuildResult<()> {
        let _guard = CompletionGuard(&step);

        let status = match self.mode {
            BuildMode::Build => self.build_step(&step).await?,
            BuildMode::Clean | BuildMode::CleanAndDelete => {
                let delete = self.mode == BuildMode::CleanAndDelete;
                match command_step::clean(&self, &step, delete).await {
                    Ok(()) => ResultStatus::Successful,
                    Err(e) => {
                        step.logger()
                            .error(format!("Exception while cleaning {step}: {e}"));
                        ResultStatus::Failed
                    }
                }
            }
        };

        self.counter.add(&step, status);
        step.finish(status);
        Ok(())
    }

    async fn build_step(self: &Arc<Self>, step: &Arc<BuildStep>) -> BuildResult<ResultStatus> {
        let prerequisites = step.prerequisites();
        for prerequisite in &prerequisites {
            if prerequisite.execution_id() == 0 {
                self.schedule(None, prerequisite)?;
            }
        }
        for prerequisite in &prerequisites {
            prerequisite.executed().await;
        }

        let status = if !step.are_prerequisites_successful() {
            ResultStatus::NotTriggeredPrerequisiteFailed
        } else if self.cancel.is_cancelled() {
            ResultStatus::Cancelled
        } else {
            match self.execute(step).await {
                Ok(ResultStatus::NotProcessed) => {
                    return Err(BuildError::InvalidData(format!(
                        "BuildStep {step} returned NotProcessed"
                    )));
                }
                Ok(status) => status,
                Err(e) => {
                    step.logger()
                        .error(format!("Exception in command {step}: {e}"));
                    ResultStatus::Failed
                }
            }
        };

        if !matches!(
            status,
            ResultStatus::Successful | ResultStatus::NotTriggeredWasSuccessful
        ) {
            skip_unscheduled(self, step, status);
        }
        self.log_status(step, status);
        Ok(status)
    }

    async fn execute(self: &Arc<Self>, step: &Arc<BuildStep>) -> BuildResult<ResultStatus> {
        match step.kind() {
            StepKind::Command(_) => command_step::execute(self, step).await,
            StepKind::List(_) => list::execute(step, self).await,
            StepKind::Wait => Ok(ResultStatus::Successful),
        }
    }

    fn log_status(&self, step: &BuildStep, status: ResultStatus) {
        match status {
            ResultStatus::Successful => self
                .logger
                .verbose(format!("BuildStep {step} was successful.")),
            ResultStatus::Failed => self.logger.error(format!("BuildStep {step} failed.")),
            ResultStatus::NotTriggeredPrerequisiteFailed => self.logger.error(format!(
                "BuildStep {step} failed of previous failed prerequisites."
            )),
            ResultStatus::Cancelled => self.logger.warning(format!("BuildStep {step} cancelled.")),
            ResultStatus::NotTriggeredWasSuccessful => self.logger.verbose(format!(
                "BuildStep {step} is up-to-date and has been skipped"
            )),
            ResultStatus::NotProcessed => {}
        }
    }

    // ---------------------------------------------------------------
    // Dependency generation
    // ---------------------------------------------------------------

    /// Link every step with an output location to the producers of the
    /// content its subtree reads. Runs once per step.
    fn generate_dependencies(&self, step: &Arc<BuildStep>) {
        let mut pending = Vec::new();
        self.prepare_dependency_graph(step, &mut pending);

        let producers = self.producers.lock().expect("producers lock poisoned");
        for (consumer, locations) in pending {
            for location in locations {
                match producers.get(&location) {
                    Some(producer) => {
                        if !Arc::ptr_eq(producer, &consumer) {
                            BuildStep::link(producer, &consumer);
                        }
                    }
                    None => self.logger.error(format!(
                        "BuildStep [{consumer}] depends on [{location}] but nothing that generates it could be found"
                    )),
                }
            }
        }
    }

    fn prepare_dependency_graph(
        &self,
        step: &Arc<BuildStep>,
        pending: &mut Vec<(Arc<BuildStep>, Vec<String>)>,
    ) {
        if step.mark_dependencies_processed() {
            return;
        }
        if let Some(location) = step.output_location() {
            let mut producers = self.producers.lock().expect("producers lock poisoned");
            if !producers.contains_key(location) {
                producers.insert(location.to_string(), Arc::clone(step));
                drop(producers);
                pending.push((Arc::clone(step), content_dependencies(step)));
                return;
            }
        }
        for child in step.children() {
            self.prepare_dependency_graph(&child, pending);
        }
    }

    // ---------------------------------------------------------------
    // Input hashes
    // ---------------------------------------------------------------

    pub(crate) fn compute_file_hash(&self, path: &str) -> BuildResult<ObjectId> {
        self.tracker.compute_file_hash(&self.resolve_path(path))
    }

    /// `path` relative to the build path, unless absolute.
    pub(crate) fn resolve_path(&self, path: &str) -> PathBuf {
        self.build_path.join(Path::new(path))
    }
}

/// Content locations read by every command under `step`.
fn content_dependencies(step: &Arc<BuildStep>) -> Vec<String> {
    let mut locations = Vec::new();
    let mut stack = vec![Arc::clone(step)];
    while let Some(s) = stack.pop() {
        match s.kind() {
            StepKind::Command(command) => {
                for url in command.command().input_files() {
                    if url.url_type == UrlType::Content && !locations.contains(&url.path) {
                        locations.push(url.path);
                    }
                }
            }
            StepKind::List(list) => stack.extend(list.children()),
            StepKind::Wait => {}
        }
    }
    locations
}

/// Give children of a list that never ran the list's status, so steps
/// depending on them do not start them.
fn skip_unscheduled(session: &BuildSession, step: &Arc<BuildStep>, status: ResultStatus) {
    let status = if status == ResultStatus::Cancelled {
        ResultStatus::Cancelled
    } else {
        ResultStatus::NotTriggeredPrerequisiteFailed
    };
    for child in step.children() {
        if child.execution_id() == 0 && child.try_mark_scheduled(session.scheduler.reserve_id()) {
            child.set_parent(step);
            skip_unscheduled(session, &child, status);
            child.finish(status);
        }
    }
}

/// Fails the step if its micro-thread ends without a status, so
/// dependents never wait forever.
struct CompletionGuard<'a>(&'a Arc<BuildStep>);

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        if self.0.finish(ResultStatus::Failed) {
            debug!(step = %self.0, "step ended without a status");
        }
    }
}

/// Context host for commands running in this process.
pub(crate) struct LocalHost {
    session: Arc<BuildSession>,
    step: Arc<BuildStep>,
}

impl LocalHost {
    pub(crate) fn new(session: &Arc<BuildSession>, step: &Arc<BuildStep>) -> Self {
        Self {
            session: Arc::clone(session),
            step: Arc::clone(step),
        }
    }
}

#[async_trait]
impl ContextHost for LocalHost {
    async fn compute_input_hash(&self, url_type: UrlType, path: &str) -> BuildResult<ObjectId> {
        match url_type {
            UrlType::File => self.session.compute_file_hash(path),
            UrlType::Content | UrlType::ContentLink => {
                let url = ObjectUrl::new(url_type, path);
                if let Some(id) = self.step.resolve_output(&url) {
                    return Ok(id);
                }
                // Nothing runs while cleaning, so fall back to the last index.
                if self.session.mode != BuildMode::Build {
                    if let Some(id) = self.session.database.asset_index().try_get(path) {
                        return Ok(id);
                    }
                }
                self.step.logger().warning(format!(
                    "Unable to find {url} in the output of the prerequisites of {}",
                    self.step
                ));
                Ok(ObjectId::EMPTY)
            }
            UrlType::Virtual => Ok(self
                .session
                .database
                .asset_index()
                .try_get(path)
                .unwrap_or(ObjectId::EMPTY)),
        }
    }

    async fn spawn_command(&self, command: Arc<dyn Command>) -> BuildResult<ResultStatus> {
        let child = BuildStep::command(command);
        if let Some(parent) = self.step.as_command() {
            parent.add_spawned(Arc::clone(&child));
        }
        self.session.schedule(Some(&self.step), &child)?;
        Ok(child.executed().await)
    }

    fn output_objects(&self) -> Vec<(ObjectUrl, ObjectId)> {
        self.step.visible_outputs()
    }
}
