//! TOML manifest describing the steps of a build.
//!
//! ```toml
//! [[steps]]
//! kind = "import"
//! url = "textures/wood"
//! source = "assets/wood.png"
//!
//! [[steps]]
//! kind = "wait"
//!
//! [[steps]]
//! kind = "concat"
//! url = "packs/all"
//! inputs = ["textures/wood"]
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use forge_build::BuildStep;
use serde::Deserialize;

use crate::tasks::{ConcatCommand, ImportCommand};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKindSpec {
    Import,
    Concat,
    Wait,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StepSpec {
    pub kind: StepKindSpec,
    #[serde(default)]
    pub url: Option<String>,
    /// Source file of an import, relative to the manifest.
    #[serde(default)]
    pub source: Option<PathBuf>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub spawn_process: bool,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

impl Manifest {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading manifest {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing manifest {}", path.display()))
    }

    /// Add one step per entry to `root`. Relative import sources are
    /// resolved against `base_dir`.
    pub fn populate(&self, root: &Arc<BuildStep>, base_dir: &Path) -> anyhow::Result<usize> {
        for (position, spec) in self.steps.iter().enumerate() {
            let step = spec
                .to_step(base_dir)
                .with_context(|| format!("step #{}", position + 1))?;
            root.add(step)?;
        }
        Ok(self.steps.len())
    }
}

impl StepSpec {
    fn url(&self) -> anyhow::Result<String> {
        match &self.url {
            Some(url) if !url.is_empty() => Ok(url.clone()),
            _ => bail!("{:?} step needs a url", self.kind),
        }
    }

    fn to_step(&self, base_dir: &Path) -> anyhow::Result<Arc<BuildStep>> {
        Ok(match self.kind {
            StepKindSpec::Wait => BuildStep::wait(),
            StepKindSpec::Import => {
                let Some(source) = &self.source else {
                    bail!("import step needs a source");
                };
                BuildStep::command(Arc::new(ImportCommand {
                    url: self.url()?,
                    source: base_dir.join(source),
                    tags: self.tags.clone(),
                    spawn_process: self.spawn_process,
                }))
            }
            StepKindSpec::Concat => {
                if self.inputs.is_empty() {
                    bail!("concat step needs inputs");
                }
                BuildStep::command(Arc::new(ConcatCommand {
                    url: self.url()?,
                    inputs: self.inputs.clone(),
                    tags: self.tags.clone(),
                    spawn_process: self.spawn_process,
                }))
            }
        })
    }
}
