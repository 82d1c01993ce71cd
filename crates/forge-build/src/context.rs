//! What a running command sees of the build.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use forge_types::{
    BuildParameters, CommandResultEntry, ObjectId, ObjectUrl, ResultStatus, UrlType,
};
use forge_store::ObjectDatabase;

use crate::command::Command;
use crate::error::{BuildError, BuildResult};
use crate::logger::StepLogger;

/// Shared cancellation request for one build.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The side of the build a context talks to: the local session when the
/// command runs in the master, or the master itself when it runs in a
/// slave.
#[async_trait]
pub trait ContextHost: Send + Sync {
    async fn compute_input_hash(&self, url_type: UrlType, path: &str) -> BuildResult<ObjectId>;

    /// Run `command` as a child of the current one and wait for it.
    async fn spawn_command(&self, command: Arc<dyn Command>) -> BuildResult<ResultStatus>;

    /// Outputs of the steps the current command may read.
    fn output_objects(&self) -> Vec<(ObjectUrl, ObjectId)>;
}

pub struct CommandContext {
    logger: StepLogger,
    database: Arc<ObjectDatabase>,
    parameters: BuildParameters,
    cancel: CancelFlag,
    result: Mutex<CommandResultEntry>,
    host: Arc<dyn ContextHost>,
}

impl CommandContext {
    pub fn new(
        logger: StepLogger,
        database: Arc<ObjectDatabase>,
        parameters: BuildParameters,
        cancel: CancelFlag,
        host: Arc<dyn ContextHost>,
    ) -> Self {
        Self {
            logger,
            database,
            parameters,
            cancel,
            result: Mutex::new(CommandResultEntry::new()),
            host,
        }
    }

    pub fn logger(&self) -> &StepLogger {
        &self.logger
    }

    pub fn database(&self) -> &Arc<ObjectDatabase> {
        &self.database
    }

    pub fn parameters(&self) -> &BuildParameters {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Commands should poll this and return `Cancelled` early.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn register_output(&self, url: ObjectUrl, id: ObjectId) {
        self.result
            .lock()
            .expect("command result lock poisoned")
            .output_objects
            .insert(url, id);
    }

    pub fn add_tag(&self, url: ObjectUrl, tag: impl Into<String>) {
        let tag = tag.into();
        let mut result = self.result.lock().expect("command result lock poisoned");
        let tags = result.tags.entry(url).or_default();
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    }

    /// Record an input discovered while running. The command is
    /// re-executed once its id changes.
    pub async fn register_input_dependency(&self, url: ObjectUrl) -> BuildResult<ObjectId> {
        let id = self
            .host
            .compute_input_hash(url.url_type, &url.path)
            .await?;
        self.result
            .lock()
            .expect("command result lock poisoned")
            .input_dependency_versions
            .insert(url, id);
        Ok(id)
    }

    pub async fn compute_input_hash(&self, url_type: UrlType, path: &str) -> BuildResult<ObjectId> {
        self.host.compute_input_hash(url_type, path).await
    }

    /// Run `command` as a child of this one and wait for its status.
    pub async fn spawn_command(&self, command: Arc<dyn Command>) -> BuildResult<ResultStatus> {
        let serialized = command.serialize()?;
        self.result
            .lock()
            .expect("command result lock poisoned")
            .spawned_commands
            .push(serialized);
        self.host.spawn_command(command).await
    }

    pub fn output_objects(&self) -> Vec<(ObjectUrl, ObjectId)> {
        self.host.output_objects()
    }

    /// Read the object currently visible at content `path`.
    pub async fn read_content(&self, path: &str) -> BuildResult<Vec<u8>> {
        let id = self.compute_input_hash(UrlType::Content, path).await?;
        if id.is_empty() {
            return Err(BuildError::Command(format!("content {path} not found")));
        }
        Ok(self.database.read(&id)?)
    }

    /// Store `data` and register it as the output at content `path`.
    pub fn write_content(&self, path: &str, data: &[u8]) -> BuildResult<ObjectId> {
        let id = self.database.write(data, false)?;
        self.register_output(ObjectUrl::content(path), id);
        Ok(id)
    }

    /// Expose `objects` through the database's asset index for the rest of
    /// this command.
    pub(crate) fn merge_into_index(&self, objects: &[(ObjectUrl, ObjectId)]) {
        let content: Vec<(String, ObjectId)> = objects
            .iter()
            .filter(|(url, _)| url.url_type.is_content())
            .map(|(url, id)| (url.path.clone(), *id))
            .collect();
        if !content.is_empty() {
            self.database.asset_index().merge_values(content);
        }
    }

    pub(crate) fn take_result(&self) -> CommandResultEntry {
        let mut entry = std::mem::take(&mut *self.result.lock().expect("command result lock poisoned"));
        entry.log_messages = self.logger.messages();
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_store::DatabaseOptions;

    struct FixedHost;

    #[async_trait]
    impl ContextHost for FixedHost {
        async fn compute_input_hash(&self, _: UrlType, path: &str) -> BuildResult<ObjectId> {
            Ok(ObjectId::from_bytes(path.as_bytes()))
        }

        async fn spawn_command(&self, _: Arc<dyn Command>) -> BuildResult<ResultStatus> {
            Ok(ResultStatus::Successful)
        }

        fn output_objects(&self) -> Vec<(ObjectUrl, ObjectId)> {
            Vec::new()
        }
    }

    fn context(dir: &std::path::Path) -> CommandContext {
        let db = ObjectDatabase::open(dir, DatabaseOptions::default()).unwrap();
        CommandContext::new(
            StepLogger::new("test"),
            Arc::new(db),
            BuildParameters::new(),
            CancelFlag::new(),
            Arc::new(FixedHost),
        )
    }

    #[tokio::test]
    async fn result_collects_outputs_inputs_tags_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());

        let id = ctx.write_content("out.bin", b"data").unwrap();
        ctx.add_tag(ObjectUrl::content("out.bin"), "DoNotCompress");
        ctx.add_tag(ObjectUrl::content("out.bin"), "DoNotCompress");
        let input = ctx
            .register_input_dependency(ObjectUrl::file("in.txt"))
            .await
            .unwrap();
        ctx.logger().info("done");

        let entry = ctx.take_result();
        assert_eq!(entry.output_objects[&ObjectUrl::content("out.bin")], id);
        assert_eq!(entry.tags[&ObjectUrl::content("out.bin")].len(), 1);
        assert_eq!(entry.input_dependency_versions[&ObjectUrl::file("in.txt")], input);
        assert_eq!(entry.log_messages.len(), 1);
        assert_eq!(ctx.database().read(&id).unwrap(), b"data");
    }

    #[tokio::test]
    async fn missing_content_is_a_command_error() {
        struct EmptyHost;

        #[async_trait]
        impl ContextHost for EmptyHost {
            async fn compute_input_hash(&self, _: UrlType, _: &str) -> BuildResult<ObjectId> {
                Ok(ObjectId::EMPTY)
            }
            async fn spawn_command(&self, _: Arc<dyn Command>) -> BuildResult<ResultStatus> {
                Ok(ResultStatus::Failed)
            }
            fn output_objects(&self) -> Vec<(ObjectUrl, ObjectId)> {
                Vec::new()
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let db = ObjectDatabase::open(dir.path(), DatabaseOptions::default()).unwrap();
        let ctx = CommandContext::new(
            StepLogger::new("test"),
            Arc::new(db),
            BuildParameters::new(),
            CancelFlag::new(),
            Arc::new(EmptyHost),
        );
        assert!(matches!(
            ctx.read_content("nope").await,
            Err(BuildError::Command(_))
        ));
    }

    #[test]
    fn cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        other.cancel();
        assert!(flag.is_cancelled());
        flag.reset();
        assert!(!other.is_cancelled());
    }
}
