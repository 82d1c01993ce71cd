//! Commands a manifest can declare.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use forge_build::{
    decode_command, encode_command, BuildResult, Command, CommandContext, CommandRegistry,
};
use forge_types::{ObjectIdBuilder, ObjectUrl, ResultStatus, SerializedCommand};
use serde::{Deserialize, Serialize};

/// Copies a file into the database as content `url`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImportCommand {
    pub url: String,
    /// Absolute path of the source file.
    pub source: PathBuf,
    pub tags: Vec<String>,
    pub spawn_process: bool,
}

/// Writes the concatenation of its content inputs to `url`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConcatCommand {
    pub url: String,
    pub inputs: Vec<String>,
    pub tags: Vec<String>,
    pub spawn_process: bool,
}

fn tag_output(context: &CommandContext, url: &str, tags: &[String]) {
    for tag in tags {
        context.add_tag(ObjectUrl::content(url), tag.clone());
    }
}

#[async_trait]
impl Command for ImportCommand {
    fn type_name(&self) -> &'static str {
        "import"
    }

    fn title(&self) -> String {
        format!("Import {}", self.url)
    }

    fn compute_parameters_hash(&self, hasher: &mut ObjectIdBuilder) -> BuildResult<()> {
        hasher.write_str(&self.url);
        hasher.write_str(&self.source.to_string_lossy());
        for tag in &self.tags {
            hasher.write_str(tag);
        }
        Ok(())
    }

    fn input_files(&self) -> Vec<ObjectUrl> {
        vec![ObjectUrl::file(self.source.to_string_lossy())]
    }

    fn output_location(&self) -> Option<String> {
        Some(self.url.clone())
    }

    fn should_spawn_new_process(&self) -> bool {
        self.spawn_process
    }

    async fn do_command(&self, context: &CommandContext) -> BuildResult<ResultStatus> {
        if context.is_cancelled() {
            return Ok(ResultStatus::Cancelled);
        }
        let data = tokio::fs::read(&self.source).await?;
        context.write_content(&self.url, &data)?;
        tag_output(context, &self.url, &self.tags);
        context.logger().verbose(format!(
            "Imported {} ({} bytes)",
            self.source.display(),
            data.len()
        ));
        Ok(ResultStatus::Successful)
    }

    fn serialize(&self) -> BuildResult<SerializedCommand> {
        encode_command(self.type_name(), self)
    }
}

#[async_trait]
impl Command for ConcatCommand {
    fn type_name(&self) -> &'static str {
        "concat"
    }

    fn title(&self) -> String {
        format!("Concat {}", self.url)
    }

    fn compute_parameters_hash(&self, hasher: &mut ObjectIdBuilder) -> BuildResult<()> {
        hasher.write_str(&self.url);
        for tag in &self.tags {
            hasher.write_str(tag);
        }
        Ok(())
    }

    fn input_files(&self) -> Vec<ObjectUrl> {
        self.inputs
            .iter()
            .map(|input| ObjectUrl::content(input.as_str()))
            .collect()
    }

    fn output_location(&self) -> Option<String> {
        Some(self.url.clone())
    }

    fn should_spawn_new_process(&self) -> bool {
        self.spawn_process
    }

    async fn do_command(&self, context: &CommandContext) -> BuildResult<ResultStatus> {
        let mut data = Vec::new();
        for input in &self.inputs {
            if context.is_cancelled() {
                return Ok(ResultStatus::Cancelled);
            }
            data.extend(context.read_content(input).await?);
        }
        context.write_content(&self.url, &data)?;
        tag_output(context, &self.url, &self.tags);
        Ok(ResultStatus::Successful)
    }

    fn serialize(&self) -> BuildResult<SerializedCommand> {
        encode_command(self.type_name(), self)
    }
}

fn revive_import(command: &SerializedCommand) -> BuildResult<Arc<dyn Command>> {
    Ok(Arc::new(decode_command::<ImportCommand>(command)?))
}

fn revive_concat(command: &SerializedCommand) -> BuildResult<Arc<dyn Command>> {
    Ok(Arc::new(decode_command::<ConcatCommand>(command)?))
}

/// Every command the CLI knows. Master and slave use the same registry.
pub fn registry() -> CommandRegistry {
    let mut registry = CommandRegistry::new();
    registry.register("import", revive_import);
    registry.register("concat", revive_concat);
    registry
}
