//! List steps: ordered children, wait barriers and output merging.
//!
//! Children of a list run concurrently until a wait barrier. When a batch
//! completes, its inputs and outputs are merged into the list. Merging
//! happens in windows counted by `merge_counter`: a read and a write of the
//! same url inside one window by two steps not ordered by the graph is a
//! conflict, as are two different writes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use forge_types::{ObjectId, ObjectUrl, ResultStatus};

use crate::error::{BuildError, BuildResult};
use crate::session::BuildSession;
use crate::step::{BuildStep, OutputObject, StepKind};

#[derive(Clone)]
struct InputObject {
    reader: Arc<BuildStep>,
    counter: usize,
}

#[derive(Default)]
struct Tracking {
    merge_counter: usize,
    executed: Vec<Arc<BuildStep>>,
    inputs: HashMap<ObjectUrl, InputObject>,
}

#[derive(Default)]
pub struct ListStep {
    children: Mutex<Vec<Arc<BuildStep>>>,
    tracking: Mutex<Tracking>,
}

impl ListStep {
    pub(crate) fn push(&self, child: Arc<BuildStep>) {
        self.children
            .lock()
            .expect("list children lock poisoned")
            .push(child);
    }

    pub fn children(&self) -> Vec<Arc<BuildStep>> {
        self.children
            .lock()
            .expect("list children lock poisoned")
            .clone()
    }

    /// Children started so far in this build, in order.
    pub fn executed_steps(&self) -> Vec<Arc<BuildStep>> {
        self.tracking
            .lock()
            .expect("list tracking lock poisoned")
            .executed
            .clone()
    }

    /// Combined status of the executed children, waits excluded.
    ///
    /// Cancelled wins over failed, failed over Successful. Otherwise the
    /// first child's status, or Successful for an empty list.
    pub fn aggregate_status(&self) -> ResultStatus {
        let statuses: Vec<ResultStatus> = self
            .executed_steps()
            .iter()
            .filter(|s| !s.is_wait())
            .map(|s| s.status())
            .collect();
        if statuses.contains(&ResultStatus::Cancelled) {
            ResultStatus::Cancelled
        } else if statuses.iter().any(|s| {
            matches!(
                s,
                ResultStatus::Failed | ResultStatus::NotTriggeredPrerequisiteFailed
            )
        }) {
            ResultStatus::Failed
        } else if statuses.contains(&ResultStatus::Successful) {
            ResultStatus::Successful
        } else {
            statuses.first().copied().unwrap_or(ResultStatus::Successful)
        }
    }
}

/// Run the children of `step`, honoring wait barriers.
pub(crate) async fn execute(
    step: &Arc<BuildStep>,
    session: &Arc<BuildSession>,
) -> BuildResult<ResultStatus> {
    let Some(list) = step.as_list() else {
        return Err(BuildError::invalid(format!("{} is not a list", step.title())));
    };

    let prerequisites = step.prerequisites();
    if !prerequisites.is_empty() {
        complete_batch(step, list, &prerequisites).await?;
    }

    let mut pending = Vec::new();
    for child in list.children() {
        if child.is_wait() {
            complete_batch(step, list, &pending).await?;
            pending.clear();
            child.set_parent(step);
            child.finish(ResultStatus::Successful);
        } else {
            session.schedule(Some(step), &child)?;
            pending.push(Arc::clone(&child));
        }
        list.tracking
            .lock()
            .expect("list tracking lock poisoned")
            .executed
            .push(child);
    }
    complete_batch(step, list, &pending).await?;

    Ok(list.aggregate_status())
}

/// Wait for `batch` and everything it spawned, then merge its inputs and
/// outputs into `step`.
async fn complete_batch(
    step: &Arc<BuildStep>,
    list: &ListStep,
    batch: &[Arc<BuildStep>],
) -> BuildResult<()> {
    let mut stack: Vec<Arc<BuildStep>> = batch.to_vec();
    while let Some(s) = stack.pop() {
        s.executed().await;
        if let Some(command) = s.as_command() {
            stack.extend(command.spawned_steps());
        }
    }

    let result = {
        let mut tracking = list.tracking.lock().expect("list tracking lock poisoned");
        let mut outputs = step.outputs();
        let mut merge = Merge {
            tracking: &mut tracking,
            outputs: &mut outputs,
        };
        batch.iter().try_for_each(|s| merge.step(step, s))
    };
    if let Err(e) = &result {
        step.logger().error(e.to_string());
    }
    list.tracking
        .lock()
        .expect("list tracking lock poisoned")
        .merge_counter += 1;
    result
}

struct Merge<'a> {
    tracking: &'a mut Tracking,
    outputs: &'a mut std::collections::BTreeMap<ObjectUrl, OutputObject>,
}

impl Merge<'_> {
    fn step(&mut self, list_step: &Arc<BuildStep>, s: &Arc<BuildStep>) -> BuildResult<()> {
        match s.kind() {
            StepKind::List(sub) => {
                let sub_inputs: Vec<(ObjectUrl, InputObject)> = sub
                    .tracking
                    .lock()
                    .expect("list tracking lock poisoned")
                    .inputs
                    .iter()
                    .map(|(url, input)| (url.clone(), input.clone()))
                    .collect();
                let sub_outputs = s.output_objects();

                for (url, input) in &sub_inputs {
                    self.check_input(url, &input.reader)?;
                }
                for (url, output) in &sub_outputs {
                    self.check_output(url, &output.producer)?;
                }
                for (url, input) in sub_inputs {
                    self.add_input(url, &input.reader);
                }
                for (url, output) in sub_outputs {
                    let tags = output.tags.clone();
                    self.add_output(url, output.id, &output.producer)?
                        .tags
                        .extend(tags);
                }
                Ok(())
            }
            StepKind::Command(_) => self.command(list_step, s),
            StepKind::Wait => Ok(()),
        }
    }

    fn command(&mut self, list_step: &Arc<BuildStep>, s: &Arc<BuildStep>) -> BuildResult<()> {
        let mut stack = vec![Arc::clone(s)];
        while let Some(current) = stack.pop() {
            let Some(command) = current.as_command() else {
                continue;
            };
            for url in command.command().input_files() {
                self.add_input(url, &current);
            }
            if let Some(result) = command.result() {
                for url in result.input_dependency_versions.keys() {
                    self.check_input(url, &current)?;
                }
                for url in result.output_objects.keys() {
                    self.check_output(url, &current)?;
                }
                for url in result.input_dependency_versions.keys() {
                    self.add_input(url.clone(), &current);
                }
                for (url, id) in &result.output_objects {
                    let output = self.add_output(url.clone(), *id, &current)?;
                    if let Some(tags) = result.tags.get(url) {
                        output.tags.extend(tags.iter().cloned());
                    }
                }
            }
            current.logger().copy_to(list_step.logger());
            stack.extend(command.spawned_steps());
        }
        Ok(())
    }

    fn check_input(&self, url: &ObjectUrl, reader: &Arc<BuildStep>) -> BuildResult<()> {
        if let Some(output) = self.outputs.get(url) {
            if self.races(&output.producer, reader, output.counter) {
                return Err(BuildError::invalid(format!(
                    "Command {} is writing {url} while command {} is reading it",
                    output.producer.title(),
                    reader.title()
                )));
            }
        }
        Ok(())
    }

    fn check_output(&self, url: &ObjectUrl, writer: &Arc<BuildStep>) -> BuildResult<()> {
        if let Some(input) = self.tracking.inputs.get(url) {
            if self.races(&input.reader, writer, input.counter) {
                return Err(BuildError::invalid(format!(
                    "Command {} is writing {url} while command {} is reading it",
                    writer.title(),
                    input.reader.title()
                )));
            }
        }
        Ok(())
    }

    /// Two different steps touching a url in the current window, with no
    /// graph edge ordering them.
    fn races(&self, a: &Arc<BuildStep>, b: &Arc<BuildStep>, counter: usize) -> bool {
        counter == self.tracking.merge_counter
            && !Arc::ptr_eq(a, b)
            && !a.is_ordered_after(b)
            && !b.is_ordered_after(a)
    }

    fn add_input(&mut self, url: ObjectUrl, reader: &Arc<BuildStep>) {
        if let Some(output) = self.outputs.get(&url) {
            // Produced by an earlier window of this list.
            if self.tracking.merge_counter > output.counter {
                return;
            }
        }
        self.tracking.inputs.insert(
            url,
            InputObject {
                reader: Arc::clone(reader),
                counter: self.tracking.merge_counter,
            },
        );
    }

    fn add_output(
        &mut self,
        url: ObjectUrl,
        id: ObjectId,
        producer: &Arc<BuildStep>,
    ) -> BuildResult<&mut OutputObject> {
        let counter = self.tracking.merge_counter;
        if let Some(existing) = self.outputs.get(&url) {
            if existing.id != id
                && existing.counter == counter
                && !existing.producer.is_ordered_after(producer)
                && !producer.is_ordered_after(&existing.producer)
            {
                return Err(BuildError::invalid(format!(
                    "Commands {} and {} are both writing {url} at the same time",
                    existing.producer.title(),
                    producer.title()
                )));
            }
        }
        let output = self.outputs.entry(url).or_insert_with(|| OutputObject {
            id,
            tags: Default::default(),
            producer: Arc::clone(producer),
            counter,
        });
        output.id = id;
        output.counter = counter;
        output.producer = Arc::clone(producer);
        Ok(output)
    }
}
