use std::path::{Path, PathBuf};
use std::time::Duration;

use forge_types::BuildParameters;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BuildError, BuildResult};

/// Configuration of a [`Builder`](crate::Builder).
///
/// Read from a TOML file; every missing field takes its default.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Worker threads driving micro-threads.
    pub thread_count: usize,
    /// Slave processes allowed at once. Zero runs every command locally.
    pub max_parallel_processes: usize,
    /// File name of the asset index inside the database directory.
    pub index_name: String,
    /// Database directory, relative to the build path.
    pub database_dir: PathBuf,
    /// Bound on a single message send to or from a slave, in seconds.
    pub slave_send_timeout: u64,
    /// Executable started for slaves. Defaults to the current executable.
    pub slave_builder_path: Option<PathBuf>,
    pub monitor_pipe_names: Vec<String>,
    pub load_default_bundle: bool,
    /// Parameters handed to every command.
    pub parameters: BuildParameters,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            thread_count: threads,
            max_parallel_processes: threads,
            index_name: "index".to_string(),
            database_dir: PathBuf::from("db"),
            slave_send_timeout: 300,
            slave_builder_path: None,
            monitor_pipe_names: Vec::new(),
            load_default_bundle: true,
            parameters: BuildParameters::new(),
        }
    }
}

impl BuilderConfig {
    /// Parse a TOML file. `max_parallel_processes` is clamped to
    /// `thread_count`.
    pub fn load(path: &Path) -> BuildResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| BuildError::Config(format!("{}: {e}", path.display())))?;
        Ok(config.normalized())
    }

    /// Like [`load`](Self::load), but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> BuildResult<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no builder config, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    fn normalized(mut self) -> Self {
        self.thread_count = self.thread_count.max(1);
        self.max_parallel_processes = self.max_parallel_processes.min(self.thread_count);
        self
    }

    /// Lowering the thread count also lowers the process limit.
    pub fn set_thread_count(&mut self, count: usize) {
        self.thread_count = count.max(1);
        if self.max_parallel_processes > self.thread_count {
            self.max_parallel_processes = self.thread_count;
        }
    }

    pub fn set_max_parallel_processes(&mut self, count: usize) -> BuildResult<()> {
        if count > self.thread_count {
            return Err(BuildError::invalid(
                "max_parallel_processes can't be greater than thread_count",
            ));
        }
        self.max_parallel_processes = count;
        Ok(())
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.slave_send_timeout)
    }

    pub fn database_path(&self, build_path: &Path) -> PathBuf {
        build_path.join(&self.database_dir)
    }

    pub fn slave_executable(&self) -> BuildResult<PathBuf> {
        match &self.slave_builder_path {
            Some(path) => Ok(path.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }
}
