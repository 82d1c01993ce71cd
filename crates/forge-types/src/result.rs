use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::object::ObjectId;
use crate::url::ObjectUrl;

/// Terminal (or not yet terminal) status of a build step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultStatus {
    #[default]
    NotProcessed,
    Successful,
    Failed,
    Cancelled,
    /// Skipped because a previous successful run is still valid.
    NotTriggeredWasSuccessful,
    /// Skipped because a prerequisite failed or was cancelled.
    NotTriggeredPrerequisiteFailed,
}

impl ResultStatus {
    pub fn is_terminal(self) -> bool {
        self != Self::NotProcessed
    }

    /// Statuses downstream steps treat as success.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Successful | Self::NotTriggeredWasSuccessful)
    }

    /// Statuses that prevent dependents from running.
    pub fn blocks_dependents(self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Cancelled | Self::NotTriggeredPrerequisiteFailed
        )
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotProcessed => write!(f, "NotProcessed"),
            Self::Successful => write!(f, "Successful"),
            Self::Failed => write!(f, "Failed"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::NotTriggeredWasSuccessful => write!(f, "NotTriggeredWasSuccessful"),
            Self::NotTriggeredPrerequisiteFailed => write!(f, "NotTriggeredPrerequisiteFailed"),
        }
    }
}

/// Severity of a [`LogMessage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogMessageType {
    Debug,
    Verbose,
    Info,
    Warning,
    Error,
    Fatal,
}

impl LogMessageType {
    pub fn is_at_least_error(self) -> bool {
        self >= Self::Error
    }
}

impl fmt::Display for LogMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "debug",
            Self::Verbose => "verbose",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// A message emitted by a command while it runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub module: String,
    pub kind: LogMessageType,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl LogMessage {
    pub fn new(module: impl Into<String>, kind: LogMessageType, text: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            kind,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

impl fmt::Display for LogMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.module, self.kind, self.text)
    }
}

/// A command in transportable form: a registered type name plus its payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedCommand {
    pub type_name: String,
    pub payload: Vec<u8>,
}

impl SerializedCommand {
    pub fn new(type_name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            type_name: type_name.into(),
            payload,
        }
    }
}

/// The recorded outcome of one successful command run.
///
/// Stored in the result cache under the command hash and compared against
/// current input hashes to decide whether a re-run can be skipped.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResultEntry {
    /// Hash of every input as it was when the command ran.
    pub input_dependency_versions: BTreeMap<ObjectUrl, ObjectId>,
    /// Everything the command produced.
    pub output_objects: BTreeMap<ObjectUrl, ObjectId>,
    /// Tags attached to produced outputs (e.g. `DoNotCompress`).
    pub tags: BTreeMap<ObjectUrl, Vec<String>>,
    pub log_messages: Vec<LogMessage>,
    pub spawned_commands: Vec<SerializedCommand>,
}

impl CommandResultEntry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_tag(&self, url: &ObjectUrl, tag: &str) -> bool {
        self.tags
            .get(url)
            .is_some_and(|tags| tags.iter().any(|t| t == tag))
    }
}

/// Parameters handed from the master to every command, keyed by name.
pub type BuildParameters = BTreeMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(!ResultStatus::NotProcessed.is_terminal());
        assert!(ResultStatus::Failed.is_terminal());
        assert!(ResultStatus::NotTriggeredWasSuccessful.is_success());
        assert!(!ResultStatus::Cancelled.is_success());
        assert!(ResultStatus::NotTriggeredPrerequisiteFailed.blocks_dependents());
        assert!(!ResultStatus::Successful.blocks_dependents());
    }

    #[test]
    fn log_severity_ordering() {
        assert!(LogMessageType::Fatal.is_at_least_error());
        assert!(LogMessageType::Error.is_at_least_error());
        assert!(!LogMessageType::Warning.is_at_least_error());
    }

    #[test]
    fn entry_tags() {
        let url = ObjectUrl::content("a.bin");
        let mut entry = CommandResultEntry::new();
        entry.tags.insert(url.clone(), vec!["DoNotCompress".into()]);
        assert!(entry.has_tag(&url, "DoNotCompress"));
        assert!(!entry.has_tag(&url, "DoNotPack"));
        assert!(!entry.has_tag(&ObjectUrl::content("b.bin"), "DoNotCompress"));
    }

    #[test]
    fn entry_bincode_roundtrip() {
        let mut entry = CommandResultEntry::new();
        entry
            .output_objects
            .insert(ObjectUrl::content("a.bin"), ObjectId::from_bytes(b"a"));
        entry
            .log_messages
            .push(LogMessage::new("import", LogMessageType::Info, "done"));
        let bytes = bincode::serialize(&entry).unwrap();
        let decoded: CommandResultEntry = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, entry);
    }
}
