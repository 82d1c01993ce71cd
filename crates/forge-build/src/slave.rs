//! Slave side of remote execution: run one command for a master.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use forge_protocol::{ProcessBuilderRemote, RemoteClient};
use forge_types::{ObjectId, ObjectUrl, ResultStatus, UrlType};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::builder::open_database;
use crate::command::{Command, CommandRegistry};
use crate::config::BuilderConfig;
use crate::context::{CancelFlag, CommandContext, ContextHost};
use crate::error::{BuildError, BuildResult};
use crate::logger::StepLogger;
use crate::scheduler::Scheduler;

#[derive(Clone, Debug)]
pub struct SlaveOptions {
    /// Address of the master, `host:port`.
    pub address: String,
    pub build_path: PathBuf,
    pub profile: Option<String>,
    pub config: BuilderConfig,
}

/// Process exit code reporting `status` to the master.
pub fn slave_exit_code(status: ResultStatus) -> i32 {
    match status {
        ResultStatus::Successful | ResultStatus::NotTriggeredWasSuccessful => 0,
        ResultStatus::Cancelled => 2,
        _ => 1,
    }
}

/// Proxies context requests to the master.
struct RemoteHost {
    master: Arc<dyn ProcessBuilderRemote>,
    outputs: Vec<(ObjectUrl, ObjectId)>,
}

#[async_trait]
impl ContextHost for RemoteHost {
    async fn compute_input_hash(&self, url_type: UrlType, path: &str) -> BuildResult<ObjectId> {
        Ok(self.master.compute_input_hash(url_type, path).await?)
    }

    async fn spawn_command(&self, command: Arc<dyn Command>) -> BuildResult<ResultStatus> {
        Ok(self.master.spawn_command(command.serialize()?).await?)
    }

    fn output_objects(&self) -> Vec<(ObjectUrl, ObjectId)> {
        self.outputs.clone()
    }
}

/// Connect to the master, run the command it hands out and send back the
/// result.
///
/// An error or panic escaping the command body is fatal: no result is
/// registered and the error is returned.
pub async fn run_slave(
    options: &SlaveOptions,
    registry: &CommandRegistry,
) -> BuildResult<ResultStatus> {
    let client = RemoteClient::connect(&options.address, options.config.send_timeout()).await?;
    let master: Arc<dyn ProcessBuilderRemote> = Arc::new(client);
    run_with_master(master, options, registry).await
}

pub(crate) async fn run_with_master(
    master: Arc<dyn ProcessBuilderRemote>,
    options: &SlaveOptions,
    registry: &CommandRegistry,
) -> BuildResult<ResultStatus> {
    let command = registry.deserialize(&master.get_command_to_execute().await?)?;
    let parameters = master.get_build_parameters().await?;
    let outputs = master.get_output_objects().await?;
    let database = Arc::new(open_database(
        &options.config.database_path(&options.build_path),
        &options.config,
    )?);
    info!(command = %command.title(), profile = ?options.profile, "slave executing command");

    let (sink, mut forwarded) = mpsc::unbounded_channel();
    let forwarder = {
        let master = Arc::clone(&master);
        tokio::spawn(async move {
            while let Some(message) = forwarded.recv().await {
                if let Err(e) = master.forward_log(message).await {
                    debug!(error = %e, "log forwarding failed");
                }
            }
        })
    };

    let context = Arc::new(CommandContext::new(
        StepLogger::new(command.title()).with_forwarder(sink),
        database,
        parameters,
        CancelFlag::new(),
        Arc::new(RemoteHost {
            master: Arc::clone(&master),
            outputs,
        }),
    ));
    context.merge_into_index(&context.output_objects());

    let outcome = Arc::new(Mutex::new(ResultStatus::NotProcessed));
    let scheduler = Scheduler::new();
    {
        let context = Arc::clone(&context);
        let outcome = Arc::clone(&outcome);
        scheduler.spawn(command.title(), async move {
            command.pre_command(&context).await?;
            let status = match command.do_command(&context).await {
                Ok(status) => status,
                Err(e) => {
                    context
                        .logger()
                        .error(format!("Exception in command {}: {e}", command.title()));
                    ResultStatus::Failed
                }
            };
            if status == ResultStatus::NotProcessed {
                return Err(BuildError::InvalidData(format!(
                    "Command {} returned NotProcessed",
                    command.title()
                )));
            }
            command.post_command(&context, status).await?;
            for url in command.input_files() {
                context.register_input_dependency(url).await?;
            }
            *outcome.lock().expect("slave outcome lock poisoned") = status;
            Ok(())
        });
    }

    if let Some(fault) = scheduler.run_until_end().await.into_iter().next() {
        error!(name = %fault.name, message = %fault.message, "fatal error in slave");
        return Err(fault.into());
    }

    let entry = context.take_result();
    // Closes the log sink so the forwarder drains and ends.
    drop(context);
    if let Err(e) = forwarder.await {
        debug!(error = %e, "log forwarder ended abnormally");
    }

    master.register_result(entry).await?;
    let status = *outcome.lock().expect("slave outcome lock poisoned");
    Ok(status)
}
