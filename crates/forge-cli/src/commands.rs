use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use colored::Colorize;
use forge_build::{
    run_slave, slave_exit_code, BuildMode, BuildResultCode, Builder, BuilderConfig,
    SlaveOptions, DO_NOT_COMPRESS_TAG, DO_NOT_PACK_TAG,
};
use forge_index::AssetIndexMap;
use forge_pack::PackRequest;
use forge_store::{DatabaseOptions, ObjectDatabase};
use forge_types::{ObjectId, ResultStatus};
use serde_json::json;
use tracing::{error, info};

use crate::cli::*;
use crate::manifest::Manifest;
use crate::tasks::registry;

/// Builder configuration file inside the build path.
pub const CONFIG_FILE: &str = "forge.toml";
/// Manifest used when `--manifest` is not given, inside the build path.
pub const DEFAULT_MANIFEST: &str = "manifest.toml";

/// Run `cli` and return the process exit code.
pub fn run_command(cli: Cli) -> anyhow::Result<i32> {
    let format = cli.format;
    match cli.command {
        Command::Build(args) => cmd_build(args, format),
        Command::Clean(args) => cmd_clean(args, format),
        Command::Bundle(args) => cmd_bundle(args, format),
        Command::Slave(args) => cmd_slave(args),
    }
}

fn load_config(build_path: &Path) -> anyhow::Result<BuilderConfig> {
    Ok(BuilderConfig::load_or_default(&build_path.join(CONFIG_FILE))?)
}

fn runtime(threads: usize) -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads.max(1))
        .enable_all()
        .build()
        .context("starting the async runtime")
}

fn open_builder(
    build_path: &Path,
    profile: Option<String>,
    config: BuilderConfig,
    manifest: Option<&PathBuf>,
) -> anyhow::Result<Builder> {
    let builder = Builder::open(build_path, profile, config, registry())?;
    let manifest_path = build_path.join(manifest.map_or(Path::new(DEFAULT_MANIFEST), |m| m.as_path()));
    let base_dir = manifest_path.parent().unwrap_or(build_path).to_path_buf();
    let steps = Manifest::load(&manifest_path)?.populate(&builder.root(), &base_dir)?;
    info!(steps, manifest = %manifest_path.display(), "manifest loaded");
    Ok(builder)
}

fn cmd_build(args: BuildArgs, format: OutputFormat) -> anyhow::Result<i32> {
    let mut config = load_config(&args.build_path)?;
    if let Some(threads) = args.threads {
        config.set_thread_count(threads);
    }
    config.monitor_pipe_names.extend(args.monitor_pipes.iter().cloned());
    let threads = config.thread_count;

    let builder = open_builder(&args.build_path, args.profile.clone(), config, args.manifest.as_ref())?;
    let code = runtime(threads)?.block_on(builder.run(BuildMode::Build))?;

    if code == BuildResultCode::Successful {
        if !args.no_index {
            builder.write_index_file(false)?;
        }
        if let Some(name) = &args.bundle {
            pack_outputs(&builder, name)?;
        }
    }
    report_build(&builder, code, format);
    Ok(code.exit_code())
}

/// Pack the content produced by the root, leaving out `DoNotPack` outputs
/// and storing `DoNotCompress` ones raw.
fn pack_outputs(builder: &Builder, name: &str) -> anyhow::Result<()> {
    let excluded: BTreeSet<String> = builder.tagged_outputs(DO_NOT_PACK_TAG).into_iter().collect();
    let raw: BTreeSet<String> = builder.tagged_outputs(DO_NOT_COMPRESS_TAG).into_iter().collect();
    let mut disable_compression = builder.disable_compression_ids();
    let mut assets = Vec::new();
    for (url, output) in builder.root().output_objects() {
        if !url.url_type.is_content() || excluded.contains(&url.path) {
            continue;
        }
        if raw.contains(&url.path) {
            disable_compression.insert(output.id);
        }
        assets.push((url.path, output.id));
    }
    let request = PackRequest {
        name: name.to_string(),
        object_ids: unique_ids(&assets),
        disable_compression,
        assets,
        dependencies: Vec::new(),
        incremental: false,
    };
    match builder.database().create_bundle(&request)? {
        Some(outcome) => info!(bundle = name, objects = outcome.objects_written, "bundle written"),
        None => info!(bundle = name, "nothing to pack"),
    }
    Ok(())
}

fn unique_ids(assets: &[(String, ObjectId)]) -> Vec<ObjectId> {
    assets
        .iter()
        .map(|(_, id)| *id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn report_build(builder: &Builder, code: BuildResultCode, format: OutputFormat) {
    let counter = builder.counter();
    match format {
        OutputFormat::Json => {
            let report = json!({
                "builder_id": builder.builder_id().to_string(),
                "result": format!("{code:?}"),
                "exit_code": code.exit_code(),
                "steps": counter.total(),
                "succeeded": counter.commands(ResultStatus::Successful),
                "up_to_date": counter.commands(ResultStatus::NotTriggeredWasSuccessful),
                "failed": counter.commands(ResultStatus::Failed),
                "not_triggered": counter.commands(ResultStatus::NotTriggeredPrerequisiteFailed),
                "cancelled": counter.get(ResultStatus::Cancelled),
            });
            println!("{report}");
        }
        OutputFormat::Text => {
            let verdict = match code {
                BuildResultCode::Successful => "✓ Build is successful".green().bold(),
                BuildResultCode::BuildError => "✗ Build failed".red().bold(),
                BuildResultCode::Cancelled => "! Build cancelled".yellow().bold(),
            };
            println!("{verdict}");
            println!(
                "  {} succeeded, {} up-to-date, {} failed, {} not triggered",
                counter.commands(ResultStatus::Successful).to_string().green(),
                counter.commands(ResultStatus::NotTriggeredWasSuccessful).to_string().cyan(),
                counter.commands(ResultStatus::Failed).to_string().red(),
                counter.commands(ResultStatus::NotTriggeredPrerequisiteFailed).to_string().yellow(),
            );
        }
    }
}

fn cmd_clean(args: CleanArgs, format: OutputFormat) -> anyhow::Result<i32> {
    let config = load_config(&args.build_path)?;
    let threads = config.thread_count;
    let builder = open_builder(&args.build_path, None, config, args.manifest.as_ref())?;
    let mode = if args.delete {
        BuildMode::CleanAndDelete
    } else {
        BuildMode::Clean
    };
    let code = runtime(threads)?.block_on(builder.run(mode))?;
    match format {
        OutputFormat::Json => println!(
            "{}",
            json!({ "result": format!("{code:?}"), "deleted_outputs": args.delete })
        ),
        OutputFormat::Text => println!("{} Clean complete.", "✓".green().bold()),
    }
    Ok(code.exit_code())
}

fn cmd_bundle(args: BundleArgs, format: OutputFormat) -> anyhow::Result<i32> {
    let config = load_config(&args.build_path)?;
    let database = ObjectDatabase::open(
        &config.database_path(&args.build_path),
        DatabaseOptions {
            index_name: config.index_name.clone(),
            read_only: false,
            additional_root: None,
            load_default_bundle: config.load_default_bundle,
        },
    )?;

    let mut assets = database.asset_index().values();
    assets.sort();
    let request = PackRequest {
        name: args.name.clone(),
        object_ids: unique_ids(&assets),
        assets,
        incremental: args.incremental,
        ..PackRequest::default()
    };
    let outcome = database.create_bundle(&request)?;

    match format {
        OutputFormat::Json => println!(
            "{}",
            json!({
                "bundle": args.name,
                "objects_written": outcome.as_ref().map_or(0, |o| o.objects_written),
                "path": outcome.as_ref().map(|o| o.path.display().to_string()),
                "incremental": outcome.as_ref().is_some_and(|o| o.incremental),
            })
        ),
        OutputFormat::Text => match &outcome {
            Some(outcome) => println!(
                "{} Packed {} objects into {}",
                "✓".green().bold(),
                outcome.objects_written,
                outcome.path.display().to_string().bold()
            ),
            None => println!("Nothing to pack."),
        },
    }
    Ok(0)
}

fn cmd_slave(args: SlaveArgs) -> anyhow::Result<i32> {
    let config = load_config(&args.build_path)?;
    let threads = config.thread_count;
    let options = SlaveOptions {
        address: args.address,
        build_path: args.build_path,
        profile: args.profile,
        config,
    };
    let status = runtime(threads)?
        .block_on(run_slave(&options, &registry()))
        .inspect_err(|e| error!(error = %e, "slave failed"))?;
    Ok(slave_exit_code(status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_index::AssetIndexMap;
    use std::fs;

    fn build_args(build_path: &Path) -> BuildArgs {
        BuildArgs {
            build_path: build_path.to_path_buf(),
            profile: None,
            threads: Some(2),
            manifest: None,
            monitor_pipes: vec!["monitor".into()],
            no_index: false,
            bundle: None,
        }
    }

    fn write_project(dir: &Path) {
        fs::write(dir.join("a.txt"), "alpha ").unwrap();
        fs::write(dir.join("b.txt"), "beta").unwrap();
        fs::write(
            dir.join(DEFAULT_MANIFEST),
            r#"
[[steps]]
kind = "import"
url = "a"
source = "a.txt"
tags = ["DoNotCompress"]

[[steps]]
kind = "import"
url = "b"
source = "b.txt"
tags = ["DoNotPack"]

[[steps]]
kind = "wait"

[[steps]]
kind = "concat"
url = "ab"
inputs = ["a", "b"]
"#,
        )
        .unwrap();
    }

    fn main_bundle(dir: &Path) -> forge_pack::BundleReader {
        let bundles = dir.join("db").join(forge_store::BUNDLE_DIRECTORY);
        forge_pack::BundleReader::open(&forge_pack::bundle_path(&bundles, "main")).unwrap()
    }

    fn asset_id(reader: &forge_pack::BundleReader, url: &str) -> Option<ObjectId> {
        reader
            .description()
            .assets
            .iter()
            .find(|(asset, _)| asset == url)
            .map(|(_, id)| *id)
    }

    fn index_value(dir: &Path, url: &str) -> Option<Vec<u8>> {
        let config = load_config(dir).unwrap();
        let database =
            ObjectDatabase::open(&config.database_path(dir), DatabaseOptions::default()).unwrap();
        let id = database.asset_index().try_get(url)?;
        database.read(&id).ok()
    }

    #[test]
    fn build_imports_concatenates_and_indexes() {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path());

        assert_eq!(cmd_build(build_args(dir.path()), OutputFormat::Json).unwrap(), 0);
        assert_eq!(index_value(dir.path(), "ab").unwrap(), b"alpha beta");

        // Nothing changed: everything is up to date.
        assert_eq!(cmd_build(build_args(dir.path()), OutputFormat::Text).unwrap(), 0);
    }

    #[test]
    fn missing_source_fails_the_build() {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path());
        fs::remove_file(dir.path().join("b.txt")).unwrap();

        assert_eq!(cmd_build(build_args(dir.path()), OutputFormat::Text).unwrap(), 1);
        assert!(index_value(dir.path(), "ab").is_none());
    }

    #[test]
    fn build_bundle_skips_do_not_pack_outputs() {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path());
        let mut args = build_args(dir.path());
        args.bundle = Some("main".into());

        assert_eq!(cmd_build(args, OutputFormat::Text).unwrap(), 0);
        let reader = main_bundle(dir.path());

        let a = asset_id(&reader, "a").unwrap();
        let ab = asset_id(&reader, "ab").unwrap();
        assert!(reader.contains(&a));
        assert_eq!(reader.read_object(&ab).unwrap().unwrap(), b"alpha beta");

        assert!(asset_id(&reader, "b").is_none());
        let config = load_config(dir.path()).unwrap();
        let database =
            ObjectDatabase::open(&config.database_path(dir.path()), DatabaseOptions::default()).unwrap();
        let b = database.asset_index().try_get("b").unwrap();
        assert!(!reader.contains(&b));
    }

    #[test]
    fn build_bundle_stores_do_not_compress_outputs_raw_without_index() {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path());
        let mut args = build_args(dir.path());
        args.no_index = true;
        args.bundle = Some("main".into());

        assert_eq!(cmd_build(args, OutputFormat::Text).unwrap(), 0);
        assert!(index_value(dir.path(), "a").is_none());

        let reader = main_bundle(dir.path());
        let a = asset_id(&reader, "a").unwrap();
        let ab = asset_id(&reader, "ab").unwrap();
        assert!(!reader.record(&a).unwrap().is_compressed());
        assert!(reader.record(&ab).unwrap().is_compressed());
        assert_eq!(reader.read_object(&a).unwrap().unwrap(), b"alpha ");
    }

    #[test]
    fn clean_with_delete_removes_outputs() {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path());
        cmd_build(build_args(dir.path()), OutputFormat::Text).unwrap();
        let ab = index_value(dir.path(), "ab");
        assert!(ab.is_some());

        let clean = CleanArgs {
            build_path: dir.path().to_path_buf(),
            manifest: None,
            delete: true,
        };
        assert_eq!(cmd_clean(clean, OutputFormat::Json).unwrap(), 0);
        assert!(index_value(dir.path(), "ab").is_none());
    }

    #[test]
    fn bundle_packs_the_index() {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path());
        cmd_build(build_args(dir.path()), OutputFormat::Text).unwrap();

        let args = BundleArgs {
            build_path: dir.path().to_path_buf(),
            name: "all".into(),
            incremental: false,
        };
        assert_eq!(cmd_bundle(args, OutputFormat::Json).unwrap(), 0);
        let bundle = forge_pack::bundle_path(&dir.path().join("db").join(forge_store::BUNDLE_DIRECTORY), "all");
        assert!(bundle.exists());
    }
}
