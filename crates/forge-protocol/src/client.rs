//! Slave side of the protocol: [`ProcessBuilderRemote`] over a channel.

use std::time::Duration;

use async_trait::async_trait;
use forge_types::{
    BuildParameters, CommandResultEntry, LogMessage, ObjectId, ObjectUrl, ResultStatus,
    SerializedCommand, UrlType,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::channel::FramedChannel;
use crate::error::{ForwardError, ProtocolError, ProtocolResult};
use crate::message::{codes, BuildMessage, PROTOCOL_VERSION};
use crate::remote::ProcessBuilderRemote;

pub struct RemoteClient<S = TcpStream> {
    channel: Mutex<FramedChannel<S>>,
}

impl RemoteClient<TcpStream> {
    /// Connect to the master at `addr` and perform the version handshake.
    pub async fn connect(addr: &str, send_timeout: Duration) -> ProtocolResult<Self> {
        let channel = FramedChannel::connect(addr, send_timeout).await?;
        Self::handshake(channel).await
    }
}

impl<S> RemoteClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Send `Hello` and require a matching `HelloAck`.
    pub async fn handshake(mut channel: FramedChannel<S>) -> ProtocolResult<Self> {
        channel
            .send(&BuildMessage::Hello {
                version: PROTOCOL_VERSION,
            })
            .await?;
        match channel.recv_required().await? {
            BuildMessage::HelloAck { version } if version == PROTOCOL_VERSION => {
                debug!(version, "connected to build master");
                Ok(Self {
                    channel: Mutex::new(channel),
                })
            }
            BuildMessage::HelloAck { version } => Err(ProtocolError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: version,
            }),
            BuildMessage::Error { code, message } if code == codes::VERSION_MISMATCH => {
                Err(ProtocolError::VersionMismatch {
                    local: PROTOCOL_VERSION,
                    remote: trailing_number(&message).unwrap_or(0),
                })
            }
            BuildMessage::Error { code, message } => Err(ProtocolError::RemoteError { code, message }),
            other => Err(ProtocolError::UnexpectedMessage {
                expected: "HelloAck",
                actual: other.type_name(),
            }),
        }
    }

    async fn request(&self, msg: BuildMessage) -> ProtocolResult<BuildMessage> {
        self.channel.lock().await.request(&msg).await
    }
}

fn trailing_number(message: &str) -> Option<u32> {
    message.rsplit(' ').next()?.parse().ok()
}

fn unexpected(expected: &'static str, actual: &BuildMessage) -> ProtocolError {
    ProtocolError::UnexpectedMessage {
        expected,
        actual: actual.type_name(),
    }
}

#[async_trait]
impl<S> ProcessBuilderRemote for RemoteClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn get_command_to_execute(&self) -> ProtocolResult<SerializedCommand> {
        match self.request(BuildMessage::GetCommandToExecute).await? {
            BuildMessage::Command(command) => Ok(command),
            other => Err(unexpected("Command", &other)),
        }
    }

    async fn get_build_parameters(&self) -> ProtocolResult<BuildParameters> {
        match self.request(BuildMessage::GetBuildParameters).await? {
            BuildMessage::BuildParameters(parameters) => Ok(parameters),
            other => Err(unexpected("BuildParameters", &other)),
        }
    }

    async fn get_output_objects(&self) -> ProtocolResult<Vec<(ObjectUrl, ObjectId)>> {
        match self.request(BuildMessage::GetOutputObjects).await? {
            BuildMessage::OutputObjects(objects) => Ok(objects),
            other => Err(unexpected("OutputObjects", &other)),
        }
    }

    async fn spawn_command(&self, command: SerializedCommand) -> ProtocolResult<ResultStatus> {
        match self.request(BuildMessage::SpawnCommand(command)).await? {
            BuildMessage::SpawnResult(status) => Ok(status),
            other => Err(unexpected("SpawnResult", &other)),
        }
    }

    async fn compute_input_hash(&self, url_type: UrlType, path: &str) -> ProtocolResult<ObjectId> {
        let msg = BuildMessage::ComputeInputHash {
            url_type,
            path: path.to_string(),
        };
        match self.request(msg).await? {
            BuildMessage::InputHash(id) => Ok(id),
            other => Err(unexpected("InputHash", &other)),
        }
    }

    async fn register_result(&self, entry: CommandResultEntry) -> ProtocolResult<()> {
        match self.request(BuildMessage::RegisterResult(entry)).await? {
            BuildMessage::ResultRegistered => Ok(()),
            other => Err(unexpected("ResultRegistered", &other)),
        }
    }

    async fn forward_log(&self, message: LogMessage) -> Result<(), ForwardError> {
        let mut channel = self.channel.lock().await;
        match channel.send(&BuildMessage::ForwardLog(message)).await {
            Ok(()) => Ok(()),
            Err(ProtocolError::ConnectionClosed) => Err(ForwardError::ChannelClosed),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_read_from_error_text() {
        assert_eq!(trailing_number("master speaks protocol version 3"), Some(3));
        assert_eq!(trailing_number("no version here"), None);
    }
}
