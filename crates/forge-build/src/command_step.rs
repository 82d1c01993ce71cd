//! Running, skipping and cleaning command steps.
//!
//! Successful results are cached per command hash in the results database:
//! the file at the loose path of the hash is a `ListStore` of
//! [`CommandResultEntry`]. A later run with the same hash reuses the newest
//! entry whose recorded inputs still hash the same and whose outputs all
//! still exist.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use forge_index::ListStore;
use forge_types::{CommandResultEntry, ObjectId, ResultStatus, UrlType};
use tracing::debug;

use crate::command::{compute_command_hash, Command};
use crate::context::{CommandContext, ContextHost};
use crate::error::{BuildError, BuildResult};
use crate::remote;
use crate::scheduler::panic_message;
use crate::session::{BuildSession, LocalHost};
use crate::step::{BuildStep, CommandStep, StepKind};

type ResultStore = ListStore<CommandResultEntry>;

fn open_results(session: &BuildSession, hash: &ObjectId) -> BuildResult<ResultStore> {
    let path = session.results.get_file_path(hash)?;
    Ok(ListStore::open(&path)?)
}

async fn command_hash(command: &dyn Command, host: &Arc<LocalHost>) -> BuildResult<ObjectId> {
    compute_command_hash(command, |url_type, path| {
        let host = Arc::clone(host);
        async move { host.compute_input_hash(url_type, &path).await }
    })
    .await
}

pub(crate) async fn execute(
    session: &Arc<BuildSession>,
    step: &Arc<BuildStep>,
) -> BuildResult<ResultStatus> {
    let Some(command_step) = step.as_command() else {
        return Err(BuildError::invalid(format!("{step} is not a command step")));
    };
    let command = Arc::clone(command_step.command());
    let host = Arc::new(LocalHost::new(session, step));

    let hash = match command_hash(command.as_ref(), &host).await {
        Ok(hash) if !hash.is_empty() => hash,
        Ok(_) => {
            step.logger()
                .error(format!("Unable to compute the hash of command {step}"));
            return Ok(ResultStatus::Failed);
        }
        Err(e) => {
            step.logger()
                .error(format!("Unable to compute the hash of command {step}: {e}"));
            return Ok(ResultStatus::Failed);
        }
    };
    let results = open_results(session, &hash)?;

    if !command.should_force_execution() {
        if let Some(entry) = find_matching_result(session, &host, &results).await {
            debug!(step = %step, hash = %hash.short_hex(), "cached result matches");
            return replay(session, step, command_step, entry).await;
        }
    }

    let running = {
        let mut in_progress = session
            .in_progress
            .lock()
            .expect("in-progress lock poisoned");
        match in_progress.get(&hash) {
            Some(other) => Some(Arc::clone(other)),
            None => {
                in_progress.insert(hash, Arc::clone(step));
                None
            }
        }
    };
    if let Some(other) = running {
        step.logger().verbose(format!(
            "Command {step} has the same hash as {other}, waiting for it"
        ));
        let status = other.executed().await;
        if let Some(entry) = other.as_command().and_then(CommandStep::result) {
            step.set_command_result(entry);
        }
        return Ok(status);
    }

    let outcome = start_command(session, step, &command, &host).await;
    session
        .in_progress
        .lock()
        .expect("in-progress lock poisoned")
        .remove(&hash);
    let (status, entry) = outcome?;

    if status == ResultStatus::Successful {
        results.add_value(entry.clone())?;
    }
    step.set_command_result(entry);
    Ok(status)
}

/// Newest cached result still valid for the current inputs.
async fn find_matching_result(
    session: &BuildSession,
    host: &Arc<LocalHost>,
    results: &ResultStore,
) -> Option<CommandResultEntry> {
    'entries: for entry in results.values().into_iter().rev() {
        for (url, recorded) in &entry.input_dependency_versions {
            match host.compute_input_hash(url.url_type, &url.path).await {
                Ok(current) if current == *recorded => {}
                _ => continue 'entries,
            }
        }
        let outputs_present = entry.output_objects.iter().all(|(url, id)| match url.url_type {
            UrlType::File => session.resolve_path(&url.path).exists(),
            UrlType::Content | UrlType::ContentLink => session.database.exists(id),
            UrlType::Virtual => true,
        });
        if outputs_present {
            return Some(entry);
        }
    }
    None
}

/// Reuse a cached result: replay its logs and re-run what it spawned.
async fn replay(
    session: &Arc<BuildSession>,
    step: &Arc<BuildStep>,
    command_step: &CommandStep,
    entry: CommandResultEntry,
) -> BuildResult<ResultStatus> {
    for message in &entry.log_messages {
        step.logger().log_message(message.clone());
    }
    for serialized in &entry.spawned_commands {
        let child = BuildStep::command(session.registry.deserialize(serialized)?);
        command_step.add_spawned(Arc::clone(&child));
        session.schedule(Some(step), &child)?;
    }

    let mut status = ResultStatus::NotTriggeredWasSuccessful;
    for child in command_step.spawned_steps() {
        if child.executed().await.blocks_dependents() {
            status = ResultStatus::Failed;
        }
    }
    step.set_command_result(entry);
    Ok(status)
}

async fn start_command(
    session: &Arc<BuildSession>,
    step: &Arc<BuildStep>,
    command: &Arc<dyn Command>,
    host: &Arc<LocalHost>,
) -> BuildResult<(ResultStatus, CommandResultEntry)> {
    if command.should_spawn_new_process() && session.max_parallel_processes > 0 {
        return remote::execute_remote(session, step, host).await;
    }

    let context = Arc::new(CommandContext::new(
        step.logger().clone(),
        Arc::clone(&session.database),
        session.parameters.clone(),
        session.cancel.clone(),
        Arc::clone(host) as Arc<dyn ContextHost>,
    ));
    context.merge_into_index(&host.output_objects());

    command.pre_command(&context).await?;

    let running = {
        let command = Arc::clone(command);
        let context = Arc::clone(&context);
        tokio::spawn(async move { command.do_command(&context).await })
    };
    let status = match running.await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            step.logger()
                .error(format!("Exception in command {step}: {e}"));
            ResultStatus::Failed
        }
        Err(e) => {
            let message = if e.is_panic() {
                panic_message(e.into_panic())
            } else {
                e.to_string()
            };
            step.logger()
                .error(format!("Exception in command {step}: {message}"));
            ResultStatus::Failed
        }
    };
    if status == ResultStatus::NotProcessed {
        return Err(BuildError::InvalidData(format!(
            "Command {step} returned NotProcessed"
        )));
    }

    command.post_command(&context, status).await?;
    for url in command.input_files() {
        context.register_input_dependency(url).await?;
    }
    Ok((status, context.take_result()))
}

// -------------------------------------------------------------------
// Clean
// -------------------------------------------------------------------

pub(crate) async fn clean(
    session: &Arc<BuildSession>,
    step: &Arc<BuildStep>,
    delete_outputs: bool,
) -> BuildResult<()> {
    match step.kind() {
        StepKind::List(list) => {
            let children: Vec<_> = list.children().into_iter().filter(|c| !c.is_wait()).collect();
            for child in &children {
                session.schedule(Some(step), child)?;
            }
            for child in &children {
                child.executed().await;
            }
            Ok(())
        }
        StepKind::Command(command_step) => {
            clean_command(session, step, Arc::clone(command_step.command()), delete_outputs).await
        }
        StepKind::Wait => Ok(()),
    }
}

fn clean_command<'a>(
    session: &'a Arc<BuildSession>,
    step: &'a Arc<BuildStep>,
    command: Arc<dyn Command>,
    delete_outputs: bool,
) -> Pin<Box<dyn Future<Output = BuildResult<()>> + Send + 'a>> {
    Box::pin(async move {
        let host = Arc::new(LocalHost::new(session, step));
        let hash = command_hash(command.as_ref(), &host).await?;
        if !session.results.exists(&hash) {
            return Ok(());
        }

        let entry = {
            let results = open_results(session, &hash)?;
            find_matching_result(session, &host, &results).await
        };
        if let Some(entry) = entry {
            if delete_outputs {
                delete_outputs_of(session, &entry)?;
            }
            for serialized in &entry.spawned_commands {
                let spawned = session.registry.deserialize(serialized)?;
                clean_command(session, step, spawned, delete_outputs).await?;
            }
        }

        match session.results.delete(&hash) {
            Err(e) if !e.is_not_found() => Err(e.into()),
            _ => {
                debug!(step = %step, hash = %hash.short_hex(), "cached result removed");
                Ok(())
            }
        }
    })
}

fn delete_outputs_of(session: &BuildSession, entry: &CommandResultEntry) -> BuildResult<()> {
    for (url, id) in &entry.output_objects {
        match url.url_type {
            UrlType::File => match std::fs::remove_file(session.resolve_path(&url.path)) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            },
            UrlType::Content | UrlType::ContentLink => match session.database.delete(id) {
                Err(e) if !e.is_not_found() => return Err(e.into()),
                _ => {}
            },
            UrlType::Virtual => {}
        }
    }
    Ok(())
}
