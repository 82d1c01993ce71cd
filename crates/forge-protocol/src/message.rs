use serde::{Deserialize, Serialize};

use forge_types::{
    BuildParameters, CommandResultEntry, LogMessage, ObjectId, ObjectUrl, ResultStatus,
    SerializedCommand, UrlType,
};

/// Bumped whenever a message layout changes. Master and slave must agree.
pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Error codes carried by [`BuildMessage::Error`].
pub mod codes {
    pub const VERSION_MISMATCH: u32 = 1;
    pub const UNEXPECTED_MESSAGE: u32 = 2;
    pub const NO_COMMAND: u32 = 3;
    pub const REMOTE_FAILURE: u32 = 500;
}

/// All messages exchanged between a build master and its slaves.
///
/// Requests flow slave → master, each answered by exactly one reply, except
/// `ForwardLog` which gets none.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum BuildMessage {
    Hello { version: u32 },
    HelloAck { version: u32 },
    GetCommandToExecute,
    Command(SerializedCommand),
    GetBuildParameters,
    BuildParameters(BuildParameters),
    GetOutputObjects,
    OutputObjects(Vec<(ObjectUrl, ObjectId)>),
    SpawnCommand(SerializedCommand),
    SpawnResult(ResultStatus),
    ComputeInputHash { url_type: UrlType, path: String },
    InputHash(ObjectId),
    RegisterResult(CommandResultEntry),
    ResultRegistered,
    ForwardLog(LogMessage),
    Error { code: u32, message: String },
}

impl BuildMessage {
    pub fn type_tag(&self) -> u8 {
        match self {
            Self::Hello { .. } => 1,
            Self::HelloAck { .. } => 2,
            Self::GetCommandToExecute => 3,
            Self::Command(_) => 4,
            Self::GetBuildParameters => 5,
            Self::BuildParameters(_) => 6,
            Self::GetOutputObjects => 7,
            Self::OutputObjects(_) => 8,
            Self::SpawnCommand(_) => 9,
            Self::SpawnResult(_) => 10,
            Self::ComputeInputHash { .. } => 11,
            Self::InputHash(_) => 12,
            Self::RegisterResult(_) => 13,
            Self::ResultRegistered => 14,
            Self::ForwardLog(_) => 15,
            Self::Error { .. } => 255,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "Hello",
            Self::HelloAck { .. } => "HelloAck",
            Self::GetCommandToExecute => "GetCommandToExecute",
            Self::Command(_) => "Command",
            Self::GetBuildParameters => "GetBuildParameters",
            Self::BuildParameters(_) => "BuildParameters",
            Self::GetOutputObjects => "GetOutputObjects",
            Self::OutputObjects(_) => "OutputObjects",
            Self::SpawnCommand(_) => "SpawnCommand",
            Self::SpawnResult(_) => "SpawnResult",
            Self::ComputeInputHash { .. } => "ComputeInputHash",
            Self::InputHash(_) => "InputHash",
            Self::RegisterResult(_) => "RegisterResult",
            Self::ResultRegistered => "ResultRegistered",
            Self::ForwardLog(_) => "ForwardLog",
            Self::Error { .. } => "Error",
        }
    }

    /// Messages that are never answered.
    pub fn is_one_way(&self) -> bool {
        matches!(self, Self::ForwardLog(_))
    }
}
