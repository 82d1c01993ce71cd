//! Master side of remote execution.
//!
//! A command that asks for its own process is handed to a slave: the master
//! listens on a loopback port, launches the slave with the address, and
//! answers its requests over the wire protocol until it disconnects.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use forge_protocol::{
    bind_loopback, codes, serve_connection, ForwardError, FramedChannel, ProcessBuilderRemote,
    ProtocolError, ProtocolResult,
};
use forge_types::{
    BuildParameters, CommandResultEntry, LogMessage, ObjectId, ObjectUrl, ResultStatus,
    SerializedCommand, UrlType,
};
use tracing::{debug, info};

use crate::context::ContextHost;
use crate::error::{BuildError, BuildResult};
use crate::logger::mirror;
use crate::session::{BuildSession, LocalHost};
use crate::step::BuildStep;

/// Where a slave finds its master and its build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlaveArgs {
    pub address: String,
    pub build_path: PathBuf,
    pub profile: Option<String>,
}

/// Starts a slave and reports its exit code once it is gone.
#[async_trait]
pub trait SlaveLauncher: Send + Sync {
    async fn run_slave(&self, args: SlaveArgs) -> BuildResult<i32>;
}

/// Runs `<executable> slave --address A --build-path P [--profile N]`.
#[derive(Clone, Debug)]
pub struct ProcessLauncher {
    executable: PathBuf,
}

impl ProcessLauncher {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

#[async_trait]
impl SlaveLauncher for ProcessLauncher {
    async fn run_slave(&self, args: SlaveArgs) -> BuildResult<i32> {
        let mut process = tokio::process::Command::new(&self.executable);
        process
            .arg("slave")
            .arg("--address")
            .arg(&args.address)
            .arg("--build-path")
            .arg(&args.build_path)
            .kill_on_drop(true);
        if let Some(profile) = &args.profile {
            process.arg("--profile").arg(profile);
        }
        debug!(executable = %self.executable.display(), address = %args.address, "starting slave");
        let status = process.status().await?;
        Ok(status.code().unwrap_or(-1))
    }
}

/// Answers one slave on behalf of the step it runs.
struct MasterRemote {
    session: Arc<BuildSession>,
    step: Arc<BuildStep>,
    command: SerializedCommand,
    host: Arc<LocalHost>,
    result: Mutex<Option<CommandResultEntry>>,
}

fn remote_failure(e: BuildError) -> ProtocolError {
    ProtocolError::RemoteError {
        code: codes::REMOTE_FAILURE,
        message: e.to_string(),
    }
}

#[async_trait]
impl ProcessBuilderRemote for MasterRemote {
    async fn get_command_to_execute(&self) -> ProtocolResult<SerializedCommand> {
        Ok(self.command.clone())
    }

    async fn get_build_parameters(&self) -> ProtocolResult<BuildParameters> {
        Ok(self.session.parameters.clone())
    }

    async fn get_output_objects(&self) -> ProtocolResult<Vec<(ObjectUrl, ObjectId)>> {
        Ok(self.step.visible_outputs())
    }

    async fn spawn_command(&self, command: SerializedCommand) -> ProtocolResult<ResultStatus> {
        let command = self
            .session
            .registry
            .deserialize(&command)
            .map_err(remote_failure)?;
        self.host
            .spawn_command(command)
            .await
            .map_err(remote_failure)
    }

    async fn compute_input_hash(&self, url_type: UrlType, path: &str) -> ProtocolResult<ObjectId> {
        self.host
            .compute_input_hash(url_type, path)
            .await
            .map_err(remote_failure)
    }

    async fn register_result(&self, entry: CommandResultEntry) -> ProtocolResult<()> {
        *self.result.lock().expect("remote result lock poisoned") = Some(entry);
        Ok(())
    }

    async fn forward_log(&self, message: LogMessage) -> Result<(), ForwardError> {
        mirror(&message);
        Ok(())
    }
}

/// Run the command of `step` in a slave and collect its result.
///
/// Waits for a free process slot first. The status is `Successful` when the
/// slave exits with code 0, `Cancelled` when the build was cancelled
/// meanwhile, `Failed` otherwise.
pub(crate) async fn execute_remote(
    session: &Arc<BuildSession>,
    step: &Arc<BuildStep>,
    host: &Arc<LocalHost>,
) -> BuildResult<(ResultStatus, CommandResultEntry)> {
    let command = step
        .as_command()
        .ok_or_else(|| BuildError::invalid(format!("{step} is not a command step")))?
        .command()
        .serialize()?;
    let _slot = session
        .process_slots
        .acquire()
        .await
        .map_err(|_| BuildError::invalid("process slots closed"))?;

    let listener = bind_loopback().await?;
    let address = listener.local_addr()?.to_string();
    info!(step = %step, %address, "executing command in a slave");

    let remote = MasterRemote {
        session: Arc::clone(session),
        step: Arc::clone(step),
        command,
        host: Arc::clone(host),
        result: Mutex::new(None),
    };
    let connected = AtomicBool::new(false);
    let serve = async {
        let (stream, _) = listener.accept().await?;
        connected.store(true, Ordering::Release);
        let mut channel = FramedChannel::new(stream, session.send_timeout);
        serve_connection(&mut channel, &remote).await?;
        Ok::<(), BuildError>(())
    };
    let launch = session.launcher.run_slave(SlaveArgs {
        address,
        build_path: session.build_path.clone(),
        profile: session.profile.clone(),
    });
    tokio::pin!(serve);
    tokio::pin!(launch);

    enum First {
        Served(BuildResult<()>),
        Exited(BuildResult<i32>),
    }
    let first = tokio::select! {
        served = &mut serve => First::Served(served),
        exit = &mut launch => First::Exited(exit),
    };
    let (served, exit) = match first {
        First::Served(served) => (Some(served), launch.await),
        First::Exited(exit) => {
            // A slave that connected has closed its end by now.
            let served = if connected.load(Ordering::Acquire) {
                Some(serve.await)
            } else {
                None
            };
            (served, exit)
        }
    };

    if let Some(Err(e)) = served {
        step.logger()
            .warning(format!("Channel to the slave running {step} failed: {e}"));
    }
    let exit_code = exit?;
    let entry = remote
        .result
        .lock()
        .expect("remote result lock poisoned")
        .take();

    let status = if session.cancel.is_cancelled() {
        ResultStatus::Cancelled
    } else if exit_code == 0 && entry.is_some() {
        ResultStatus::Successful
    } else {
        step.logger()
            .error(format!("Slave running {step} exited with code {exit_code}"));
        ResultStatus::Failed
    };

    let entry = entry.unwrap_or_default();
    for message in &entry.log_messages {
        step.logger().record(message.clone());
    }
    Ok((status, entry))
}
