//! Master side of the protocol: dispatch slave requests to a
//! [`ProcessBuilderRemote`] implementation.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::channel::FramedChannel;
use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{codes, BuildMessage, PROTOCOL_VERSION};
use crate::remote::ProcessBuilderRemote;

/// Listen on an ephemeral loopback port.
pub async fn bind_loopback() -> ProtocolResult<TcpListener> {
    Ok(TcpListener::bind(("127.0.0.1", 0)).await?)
}

/// Answer the slave's `Hello`. A version mismatch is reported to the slave
/// before failing here too.
pub async fn accept_handshake<S>(channel: &mut FramedChannel<S>) -> ProtocolResult<u32>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match channel.recv_required().await? {
        BuildMessage::Hello { version } if version == PROTOCOL_VERSION => {
            channel
                .send(&BuildMessage::HelloAck {
                    version: PROTOCOL_VERSION,
                })
                .await?;
            Ok(version)
        }
        BuildMessage::Hello { version } => {
            let message = format!("master speaks protocol version {PROTOCOL_VERSION}");
            channel
                .send(&BuildMessage::Error {
                    code: codes::VERSION_MISMATCH,
                    message,
                })
                .await?;
            Err(ProtocolError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: version,
            })
        }
        other => Err(ProtocolError::UnexpectedMessage {
            expected: "Hello",
            actual: other.type_name(),
        }),
    }
}

/// Run the handshake, then answer requests until the slave disconnects.
///
/// Failures of `remote` are sent back as `Error` replies and do not end the
/// session. Transport failures do.
pub async fn serve_connection<S, R>(channel: &mut FramedChannel<S>, remote: &R) -> ProtocolResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    R: ProcessBuilderRemote + ?Sized,
{
    accept_handshake(channel).await?;

    while let Some(request) = channel.recv().await? {
        let name = request.type_name();
        let reply = match request {
            BuildMessage::ForwardLog(message) => {
                if let Err(e) = remote.forward_log(message).await {
                    debug!(error = %e, "dropped forwarded log");
                }
                continue;
            }
            BuildMessage::GetCommandToExecute => remote
                .get_command_to_execute()
                .await
                .map(BuildMessage::Command),
            BuildMessage::GetBuildParameters => remote
                .get_build_parameters()
                .await
                .map(BuildMessage::BuildParameters),
            BuildMessage::GetOutputObjects => remote
                .get_output_objects()
                .await
                .map(BuildMessage::OutputObjects),
            BuildMessage::SpawnCommand(command) => remote
                .spawn_command(command)
                .await
                .map(BuildMessage::SpawnResult),
            BuildMessage::ComputeInputHash { url_type, path } => remote
                .compute_input_hash(url_type, &path)
                .await
                .map(BuildMessage::InputHash),
            BuildMessage::RegisterResult(entry) => remote
                .register_result(entry)
                .await
                .map(|()| BuildMessage::ResultRegistered),
            other => Err(ProtocolError::UnexpectedMessage {
                expected: "request",
                actual: other.type_name(),
            }),
        };

        let reply = reply.unwrap_or_else(|e| {
            warn!(request = name, error = %e, "slave request failed");
            let code = match e {
                ProtocolError::UnexpectedMessage { .. } => codes::UNEXPECTED_MESSAGE,
                ProtocolError::RemoteError { code, .. } => code,
                _ => codes::REMOTE_FAILURE,
            };
            BuildMessage::Error {
                code,
                message: e.to_string(),
            }
        });
        channel.send(&reply).await?;
    }
    debug!("slave disconnected");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RemoteClient;
    use crate::error::ForwardError;
    use async_trait::async_trait;
    use forge_types::{
        BuildParameters, CommandResultEntry, LogMessage, LogMessageType, ObjectId, ObjectUrl,
        ResultStatus, SerializedCommand, UrlType,
    };
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeMaster {
        logs: Mutex<Vec<LogMessage>>,
        results: Mutex<Vec<CommandResultEntry>>,
        spawned: Mutex<Vec<SerializedCommand>>,
    }

    #[async_trait]
    impl ProcessBuilderRemote for FakeMaster {
        async fn get_command_to_execute(&self) -> ProtocolResult<SerializedCommand> {
            Ok(SerializedCommand::new("concat", vec![9]))
        }

        async fn get_build_parameters(&self) -> ProtocolResult<BuildParameters> {
            Ok([("profile".to_string(), "linux".to_string())].into_iter().collect())
        }

        async fn get_output_objects(&self) -> ProtocolResult<Vec<(ObjectUrl, ObjectId)>> {
            Ok(vec![(ObjectUrl::content("a"), ObjectId::from_bytes(b"a"))])
        }

        async fn spawn_command(&self, command: SerializedCommand) -> ProtocolResult<ResultStatus> {
            self.spawned.lock().unwrap().push(command);
            Ok(ResultStatus::Successful)
        }

        async fn compute_input_hash(&self, url_type: UrlType, path: &str) -> ProtocolResult<ObjectId> {
            match url_type {
                UrlType::File => Ok(ObjectId::from_bytes(path.as_bytes())),
                _ => Err(ProtocolError::RemoteError {
                    code: 404,
                    message: format!("no such input {path}"),
                }),
            }
        }

        async fn register_result(&self, entry: CommandResultEntry) -> ProtocolResult<()> {
            self.results.lock().unwrap().push(entry);
            Ok(())
        }

        async fn forward_log(&self, message: LogMessage) -> Result<(), ForwardError> {
            self.logs.lock().unwrap().push(message);
            Ok(())
        }
    }

    fn channels() -> (
        FramedChannel<tokio::io::DuplexStream>,
        FramedChannel<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            FramedChannel::new(a, Duration::from_secs(5)),
            FramedChannel::new(b, Duration::from_secs(5)),
        )
    }

    #[tokio::test]
    async fn full_slave_session() {
        let (mut master_side, slave_side) = channels();
        let master = std::sync::Arc::new(FakeMaster::default());
        let served = {
            let master = std::sync::Arc::clone(&master);
            tokio::spawn(async move { serve_connection(&mut master_side, master.as_ref()).await })
        };

        let client = RemoteClient::handshake(slave_side).await.unwrap();
        let command = client.get_command_to_execute().await.unwrap();
        assert_eq!(command.type_name, "concat");
        assert_eq!(client.get_build_parameters().await.unwrap()["profile"], "linux");
        assert_eq!(client.get_output_objects().await.unwrap().len(), 1);
        assert_eq!(
            client.compute_input_hash(UrlType::File, "x").await.unwrap(),
            ObjectId::from_bytes(b"x")
        );
        let status = client
            .spawn_command(SerializedCommand::new("import", vec![]))
            .await
            .unwrap();
        assert_eq!(status, ResultStatus::Successful);
        client
            .forward_log(LogMessage::new("slave", LogMessageType::Info, "working"))
            .await
            .unwrap();
        client.register_result(CommandResultEntry::default()).await.unwrap();
        drop(client);

        served.await.unwrap().unwrap();
        assert_eq!(master.logs.lock().unwrap().len(), 1);
        assert_eq!(master.results.lock().unwrap().len(), 1);
        assert_eq!(master.spawned.lock().unwrap()[0].type_name, "import");
    }

    #[tokio::test]
    async fn remote_failure_is_an_error_reply() {
        let (mut master_side, slave_side) = channels();
        let served = tokio::spawn(async move {
            serve_connection(&mut master_side, &FakeMaster::default()).await
        });

        let client = RemoteClient::handshake(slave_side).await.unwrap();
        let err = client
            .compute_input_hash(UrlType::Virtual, "missing")
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::RemoteError { code: 404, .. }));
        // The session survives the failed request.
        assert!(client.get_command_to_execute().await.is_ok());
        drop(client);
        served.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn version_mismatch_fails_both_sides() {
        let (mut master_side, mut slave_side) = channels();
        let served = tokio::spawn(async move {
            serve_connection(&mut master_side, &FakeMaster::default()).await
        });

        slave_side
            .send(&BuildMessage::Hello {
                version: PROTOCOL_VERSION + 1,
            })
            .await
            .unwrap();
        match slave_side.recv_required().await.unwrap() {
            BuildMessage::Error { code, .. } => assert_eq!(code, codes::VERSION_MISMATCH),
            other => panic!("unexpected reply {other:?}"),
        }

        let err = served.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::VersionMismatch { remote, .. } if remote == PROTOCOL_VERSION + 1
        ));
    }

    #[tokio::test]
    async fn client_reports_master_version_on_mismatch() {
        let (mut master_side, slave_side) = channels();
        let fake = tokio::spawn(async move {
            let _ = master_side.recv_required().await.unwrap();
            master_side
                .send(&BuildMessage::HelloAck {
                    version: PROTOCOL_VERSION + 5,
                })
                .await
                .unwrap();
        });
        let err = RemoteClient::handshake(slave_side).await.err().unwrap();
        assert!(matches!(err, ProtocolError::VersionMismatch { .. }));
        fake.await.unwrap();
    }

    #[tokio::test]
    async fn slave_over_tcp_loopback() {
        let listener = bind_loopback().await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let served = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut channel = FramedChannel::new(stream, Duration::from_secs(5));
            serve_connection(&mut channel, &FakeMaster::default()).await
        });

        let client = RemoteClient::connect(&addr, Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            client.get_command_to_execute().await.unwrap().payload,
            vec![9]
        );
        drop(client);
        served.await.unwrap().unwrap();
    }
}
