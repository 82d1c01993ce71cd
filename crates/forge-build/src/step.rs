//! Build steps: the nodes of the build dependency graph.
//!
//! A [`BuildStep`] is either a command leaf, a list of child steps, or a
//! wait barrier inside a list. Steps are shared as `Arc<BuildStep>`: the
//! graph owns them, the scheduler runs them, and dependents hold their
//! prerequisites. Parents are held weakly.
//!
//! # Invariants
//!
//! - Status moves from `NotProcessed` to exactly one terminal status.
//! - `StepProcessed` listeners run exactly once, after the status is set.
//! - A step is scheduled at most once per build.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use forge_types::{CommandResultEntry, LogMessage, ObjectId, ObjectUrl, ResultStatus};
use tokio::sync::watch;

use crate::command::Command;
use crate::error::{BuildError, BuildResult};
use crate::list::ListStep;
use crate::logger::StepLogger;

/// An object a step or one of its children produced.
#[derive(Clone)]
pub struct OutputObject {
    pub id: ObjectId,
    pub tags: BTreeSet<String>,
    /// Step that last wrote it.
    pub producer: Arc<BuildStep>,
    /// Merge window in which it was last written.
    pub(crate) counter: usize,
}

impl fmt::Debug for OutputObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputObject")
            .field("id", &self.id)
            .field("tags", &self.tags)
            .field("producer", &self.producer.title())
            .finish()
    }
}

/// Payload handed to `StepProcessed` listeners.
#[derive(Clone, Debug)]
pub struct StepProcessed {
    pub title: String,
    pub status: ResultStatus,
    pub messages: Vec<LogMessage>,
}

pub type StepProcessedHandler = Box<dyn FnOnce(&StepProcessed) + Send>;

pub enum StepKind {
    Command(CommandStep),
    List(ListStep),
    /// Barrier: children after it start once every earlier sibling is done.
    Wait,
}

/// A step running one [`Command`].
pub struct CommandStep {
    command: Arc<dyn Command>,
    result: Mutex<Option<CommandResultEntry>>,
    spawned: Mutex<Vec<Arc<BuildStep>>>,
}

impl CommandStep {
    pub fn command(&self) -> &Arc<dyn Command> {
        &self.command
    }

    /// The result of the last execution, or the cached result that made it
    /// up to date.
    pub fn result(&self) -> Option<CommandResultEntry> {
        self.result.lock().expect("step result lock poisoned").clone()
    }

    /// Steps this command spawned while running.
    pub fn spawned_steps(&self) -> Vec<Arc<BuildStep>> {
        self.spawned.lock().expect("spawned steps lock poisoned").clone()
    }

    pub(crate) fn add_spawned(&self, step: Arc<BuildStep>) {
        self.spawned
            .lock()
            .expect("spawned steps lock poisoned")
            .push(step);
    }
}

pub struct BuildStep {
    title: String,
    kind: StepKind,
    output_location: Option<String>,
    logger: StepLogger,
    parent: Mutex<Weak<BuildStep>>,
    prerequisites: Mutex<Vec<Arc<BuildStep>>>,
    status: watch::Sender<ResultStatus>,
    execution_id: AtomicU64,
    processed_dependencies: AtomicBool,
    outputs: Mutex<BTreeMap<ObjectUrl, OutputObject>>,
    tag: Mutex<Option<String>>,
    listeners: Mutex<Vec<StepProcessedHandler>>,
}

impl BuildStep {
    fn new(title: String, kind: StepKind, output_location: Option<String>) -> Arc<Self> {
        let (status, _) = watch::channel(ResultStatus::NotProcessed);
        Arc::new(Self {
            logger: StepLogger::new(title.clone()),
            title,
            kind,
            output_location,
            parent: Mutex::new(Weak::new()),
            prerequisites: Mutex::new(Vec::new()),
            status,
            execution_id: AtomicU64::new(0),
            processed_dependencies: AtomicBool::new(false),
            outputs: Mutex::new(BTreeMap::new()),
            tag: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn command(command: Arc<dyn Command>) -> Arc<Self> {
        let title = command.title();
        let output_location = command.output_location();
        Self::new(
            title,
            StepKind::Command(CommandStep {
                command,
                result: Mutex::new(None),
                spawned: Mutex::new(Vec::new()),
            }),
            output_location,
        )
    }

    pub fn list(title: impl Into<String>) -> Arc<Self> {
        Self::new(title.into(), StepKind::List(ListStep::default()), None)
    }

    /// A list whose subtree produces the content at `location`.
    pub fn list_producing(title: impl Into<String>, location: impl Into<String>) -> Arc<Self> {
        Self::new(
            title.into(),
            StepKind::List(ListStep::default()),
            Some(location.into()),
        )
    }

    pub fn wait() -> Arc<Self> {
        Self::new("Wait".to_string(), StepKind::Wait, None)
    }

    /// Append a child to a list step.
    pub fn add(&self, child: Arc<BuildStep>) -> BuildResult<()> {
        match &self.kind {
            StepKind::List(list) => {
                list.push(child);
                Ok(())
            }
            _ => Err(BuildError::invalid(format!(
                "cannot add a child to non-list step {}",
                self.title
            ))),
        }
    }

    /// Make `dependent` wait for `prerequisite`.
    pub fn link(prerequisite: &Arc<BuildStep>, dependent: &Arc<BuildStep>) {
        if Arc::ptr_eq(prerequisite, dependent) {
            return;
        }
        let mut prerequisites = dependent
            .prerequisites
            .lock()
            .expect("prerequisites lock poisoned");
        if !prerequisites.iter().any(|p| Arc::ptr_eq(p, prerequisite)) {
            prerequisites.push(Arc::clone(prerequisite));
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn kind(&self) -> &StepKind {
        &self.kind
    }

    pub fn as_command(&self) -> Option<&CommandStep> {
        match &self.kind {
            StepKind::Command(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&ListStep> {
        match &self.kind {
            StepKind::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn is_wait(&self) -> bool {
        matches!(self.kind, StepKind::Wait)
    }

    /// Children of a list step, empty for other kinds.
    pub fn children(&self) -> Vec<Arc<BuildStep>> {
        self.as_list().map(ListStep::children).unwrap_or_default()
    }

    pub fn output_location(&self) -> Option<&str> {
        self.output_location.as_deref()
    }

    pub fn logger(&self) -> &StepLogger {
        &self.logger
    }

    pub fn status(&self) -> ResultStatus {
        *self.status.borrow()
    }

    /// Failed itself, or never ran because a prerequisite failed.
    pub fn is_failed(&self) -> bool {
        matches!(
            self.status(),
            ResultStatus::Failed | ResultStatus::NotTriggeredPrerequisiteFailed
        )
    }

    pub fn prerequisites(&self) -> Vec<Arc<BuildStep>> {
        self.prerequisites
            .lock()
            .expect("prerequisites lock poisoned")
            .clone()
    }

    pub fn are_prerequisites_successful(&self) -> bool {
        self.prerequisites()
            .iter()
            .all(|p| !p.status().blocks_dependents())
    }

    pub fn parent(&self) -> Option<Arc<BuildStep>> {
        self.parent.lock().expect("parent lock poisoned").upgrade()
    }

    pub(crate) fn set_parent(&self, parent: &Arc<BuildStep>) {
        *self.parent.lock().expect("parent lock poisoned") = Arc::downgrade(parent);
    }

    /// Micro-thread id of this step's execution, 0 before scheduling.
    pub fn execution_id(&self) -> u64 {
        self.execution_id.load(Ordering::Acquire)
    }

    /// Claim the step for execution `id`. False if it was already claimed.
    pub(crate) fn try_mark_scheduled(&self, id: u64) -> bool {
        self.execution_id
            .compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns the previous value.
    pub(crate) fn mark_dependencies_processed(&self) -> bool {
        self.processed_dependencies.swap(true, Ordering::AcqRel)
    }

    pub fn tag(&self) -> Option<String> {
        self.tag.lock().expect("tag lock poisoned").clone()
    }

    /// Attach caller bookkeeping. The engine never reads it.
    pub fn set_tag(&self, tag: impl Into<String>) {
        *self.tag.lock().expect("tag lock poisoned") = Some(tag.into());
    }

    /// Run `handler` once when the step reaches a terminal status.
    pub fn on_processed(&self, handler: impl FnOnce(&StepProcessed) + Send + 'static) {
        self.listeners
            .lock()
            .expect("listeners lock poisoned")
            .push(Box::new(handler));
    }

    /// Set the terminal status and notify listeners.
    ///
    /// Returns false, changing nothing, if the step already finished or
    /// `status` is `NotProcessed`.
    pub(crate) fn finish(&self, status: ResultStatus) -> bool {
        if !status.is_terminal() {
            return false;
        }
        let changed = self.status.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            let listeners =
                std::mem::take(&mut *self.listeners.lock().expect("listeners lock poisoned"));
            if !listeners.is_empty() {
                let event = StepProcessed {
                    title: self.title.clone(),
                    status,
                    messages: self.logger.messages(),
                };
                for listener in listeners {
                    listener(&event);
                }
            }
        }
        changed
    }

    /// Wait until the step has a terminal status.
    pub async fn executed(&self) -> ResultStatus {
        let mut rx = self.status.subscribe();
        let status = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        };
        status
    }

    // ---------------------------------------------------------------
    // Outputs
    // ---------------------------------------------------------------

    /// Outputs of this step: a command's result plus whatever its spawned
    /// steps produced, or everything merged into a list.
    pub fn output_objects(self: &Arc<Self>) -> BTreeMap<ObjectUrl, OutputObject> {
        let mut objects = self.outputs().clone();
        if let Some(result) = self.as_command().and_then(CommandStep::result) {
            for (url, id) in result.output_objects {
                let tags = result
                    .tags
                    .get(&url)
                    .map(|t| t.iter().cloned().collect())
                    .unwrap_or_default();
                objects.insert(
                    url,
                    OutputObject {
                        id,
                        tags,
                        producer: Arc::clone(self),
                        counter: 0,
                    },
                );
            }
        }
        objects
    }

    pub fn output_ids(self: &Arc<Self>) -> Vec<(ObjectUrl, ObjectId)> {
        self.output_objects()
            .into_iter()
            .map(|(url, o)| (url, o.id))
            .collect()
    }

    pub(crate) fn outputs(&self) -> std::sync::MutexGuard<'_, BTreeMap<ObjectUrl, OutputObject>> {
        self.outputs.lock().expect("outputs lock poisoned")
    }

    /// Store the result of this command step. Outputs of its spawned steps
    /// become outputs of this step too.
    pub(crate) fn set_command_result(&self, entry: CommandResultEntry) {
        let Some(command) = self.as_command() else {
            return;
        };
        {
            let mut outputs = self.outputs();
            for spawned in command.spawned_steps() {
                for (url, object) in spawned.output_objects() {
                    outputs.insert(url, object);
                }
            }
        }
        *command.result.lock().expect("step result lock poisoned") = Some(entry);
    }

    /// Steps whose outputs this step can see: enclosing lists, and every
    /// prerequisite (transitively), nearest first.
    fn output_groups(self: &Arc<Self>) -> Vec<Arc<BuildStep>> {
        let mut groups = Vec::new();
        let mut seen = HashSet::new();
        let mut visited = HashSet::new();
        gather_groups(self, false, &mut groups, &mut seen, &mut visited);
        groups
    }

    /// The id currently visible at `url`, if any group produced it.
    pub fn resolve_output(self: &Arc<Self>, url: &ObjectUrl) -> Option<ObjectId> {
        self.output_groups()
            .iter()
            .find_map(|g| g.output_objects().get(url).map(|o| o.id))
    }

    /// Every visible output, nearest group winning.
    pub fn visible_outputs(self: &Arc<Self>) -> Vec<(ObjectUrl, ObjectId)> {
        let mut merged = BTreeMap::new();
        for group in self.output_groups() {
            for (url, object) in group.output_objects() {
                merged.entry(url).or_insert(object.id);
            }
        }
        merged.into_iter().collect()
    }

    /// True if `other`, or a list enclosing it, is a transitive prerequisite
    /// of this step or of a list enclosing this step.
    pub fn is_ordered_after(self: &Arc<Self>, other: &Arc<BuildStep>) -> bool {
        let mut reached = HashSet::new();
        let mut stack = Vec::new();
        let mut current = Some(Arc::clone(self));
        while let Some(step) = current {
            stack.extend(step.prerequisites());
            current = step.parent();
        }
        while let Some(step) = stack.pop() {
            if !reached.insert(key(&step)) {
                continue;
            }
            stack.extend(step.prerequisites());
        }

        let mut current = Some(Arc::clone(other));
        while let Some(step) = current {
            if reached.contains(&key(&step)) {
                return true;
            }
            current = step.parent();
        }
        false
    }
}

fn key(step: &Arc<BuildStep>) -> usize {
    Arc::as_ptr(step) as usize
}

fn gather_groups(
    step: &Arc<BuildStep>,
    include_self: bool,
    groups: &mut Vec<Arc<BuildStep>>,
    seen: &mut HashSet<usize>,
    visited: &mut HashSet<usize>,
) {
    if !visited.insert(key(step)) {
        return;
    }
    let mut current = Some(Arc::clone(step));
    let mut first = true;
    while let Some(s) = current {
        let contributes = s.as_list().is_some() || (first && include_self);
        if contributes && seen.insert(key(&s)) {
            groups.push(Arc::clone(&s));
        }
        for prerequisite in s.prerequisites() {
            gather_groups(&prerequisite, true, groups, seen, visited);
        }
        first = false;
        current = s.parent();
    }
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.title)
    }
}

impl fmt::Debug for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildStep")
            .field("title", &self.title)
            .field("status", &self.status())
            .field("execution_id", &self.execution_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Produce;
    use std::sync::atomic::AtomicUsize;

    fn produce(url: &str) -> Arc<BuildStep> {
        BuildStep::command(Arc::new(Produce::new(url, "x")))
    }

    #[test]
    fn status_is_monotonic_and_listeners_fire_once() {
        let step = produce("a.bin");
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        step.on_processed(move |event| {
            assert_eq!(event.status, ResultStatus::Failed);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!step.finish(ResultStatus::NotProcessed));
        assert!(step.finish(ResultStatus::Failed));
        assert!(!step.finish(ResultStatus::Successful));
        assert_eq!(step.status(), ResultStatus::Failed);
        assert!(step.is_failed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn executed_resolves_after_finish() {
        let step = produce("a.bin");
        let waiter = {
            let step = Arc::clone(&step);
            tokio::spawn(async move { step.executed().await })
        };
        tokio::task::yield_now().await;
        step.finish(ResultStatus::Successful);
        assert_eq!(waiter.await.unwrap(), ResultStatus::Successful);
        assert_eq!(step.executed().await, ResultStatus::Successful);
    }

    #[test]
    fn only_lists_accept_children() {
        let list = BuildStep::list("root");
        list.add(produce("a.bin")).unwrap();
        list.add(BuildStep::wait()).unwrap();
        assert_eq!(list.children().len(), 2);
        assert!(produce("b.bin").add(BuildStep::wait()).is_err());
    }

    #[test]
    fn link_is_idempotent_and_ignores_self() {
        let a = produce("a.bin");
        let b = produce("b.bin");
        BuildStep::link(&a, &b);
        BuildStep::link(&a, &b);
        BuildStep::link(&b, &b);
        assert_eq!(b.prerequisites().len(), 1);
        assert!(a.prerequisites().is_empty());
    }

    #[test]
    fn scheduling_claim_is_exclusive() {
        let a = produce("a.bin");
        assert!(a.try_mark_scheduled(7));
        assert!(!a.try_mark_scheduled(8));
        assert_eq!(a.execution_id(), 7);
    }

    #[test]
    fn prerequisite_outputs_are_visible() {
        let root = BuildStep::list("root");
        let a = produce("a.bin");
        let b = produce("b.bin");
        a.set_parent(&root);
        b.set_parent(&root);
        BuildStep::link(&a, &b);

        let url = ObjectUrl::content("a.bin");
        let id = ObjectId::from_bytes(b"x");
        let mut entry = CommandResultEntry::new();
        entry.output_objects.insert(url.clone(), id);
        a.set_command_result(entry);

        assert_eq!(b.resolve_output(&url), Some(id));
        assert_eq!(b.visible_outputs(), vec![(url.clone(), id)]);
        assert_eq!(a.resolve_output(&url), None);
        assert!(b.is_ordered_after(&a));
        assert!(!a.is_ordered_after(&b));
    }

    #[test]
    fn ordering_through_enclosing_lists() {
        let first = BuildStep::list("first");
        let second = BuildStep::list("second");
        let a = produce("a.bin");
        let b = produce("b.bin");
        a.set_parent(&first);
        b.set_parent(&second);
        BuildStep::link(&first, &second);

        assert!(b.is_ordered_after(&a));
        assert!(!a.is_ordered_after(&b));
    }
}
