use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "forge",
    about = "forge: content-addressed asset build engine",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Build the steps of a manifest
    Build(BuildArgs),
    /// Forget cached results, optionally deleting their outputs
    Clean(CleanArgs),
    /// Pack every indexed object into a bundle
    Bundle(BundleArgs),
    /// Run one command for a master (started by the master itself)
    Slave(SlaveArgs),
}

#[derive(Args)]
pub struct BuildArgs {
    #[arg(long, default_value = ".")]
    pub build_path: PathBuf,
    #[arg(long)]
    pub profile: Option<String>,
    #[arg(long)]
    pub threads: Option<usize>,
    /// Manifest of steps, relative to the build path
    #[arg(long)]
    pub manifest: Option<PathBuf>,
    #[arg(long = "monitor-pipe")]
    pub monitor_pipes: Vec<String>,
    /// Leave the asset index untouched
    #[arg(long)]
    pub no_index: bool,
    /// Also pack the build outputs into this bundle
    #[arg(long)]
    pub bundle: Option<String>,
}

#[derive(Args)]
pub struct CleanArgs {
    #[arg(long, default_value = ".")]
    pub build_path: PathBuf,
    #[arg(long)]
    pub manifest: Option<PathBuf>,
    /// Also delete what the cached results produced
    #[arg(long)]
    pub delete: bool,
}

#[derive(Args)]
pub struct BundleArgs {
    #[arg(long, default_value = ".")]
    pub build_path: PathBuf,
    #[arg(long)]
    pub name: String,
    #[arg(long)]
    pub incremental: bool,
}

#[derive(Args)]
pub struct SlaveArgs {
    #[arg(long)]
    pub address: String,
    #[arg(long)]
    pub build_path: PathBuf,
    #[arg(long)]
    pub profile: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_build_defaults() {
        let cli = Cli::try_parse_from(["forge", "build"]).unwrap();
        if let Command::Build(args) = cli.command {
            assert_eq!(args.build_path, PathBuf::from("."));
            assert!(args.manifest.is_none());
            assert!(!args.no_index);
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_build_with_options() {
        let cli = Cli::try_parse_from([
            "forge", "build", "--build-path", "/tmp/b", "--threads", "3",
            "--monitor-pipe", "a", "--monitor-pipe", "b", "--no-index", "--profile", "win",
        ])
        .unwrap();
        if let Command::Build(args) = cli.command {
            assert_eq!(args.threads, Some(3));
            assert_eq!(args.monitor_pipes, vec!["a", "b"]);
            assert_eq!(args.profile, Some("win".into()));
            assert!(args.no_index);
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_clean_delete() {
        let cli = Cli::try_parse_from(["forge", "clean", "--delete"]).unwrap();
        if let Command::Clean(args) = cli.command {
            assert!(args.delete);
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_bundle_requires_name() {
        assert!(Cli::try_parse_from(["forge", "bundle"]).is_err());
        let cli = Cli::try_parse_from(["forge", "bundle", "--name", "main", "--incremental"]).unwrap();
        if let Command::Bundle(args) = cli.command {
            assert_eq!(args.name, "main");
            assert!(args.incremental);
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_slave() {
        let cli = Cli::try_parse_from([
            "forge", "slave", "--address", "127.0.0.1:4000", "--build-path", "/b",
        ])
        .unwrap();
        if let Command::Slave(args) = cli.command {
            assert_eq!(args.address, "127.0.0.1:4000");
            assert_eq!(args.build_path, PathBuf::from("/b"));
            assert!(args.profile.is_none());
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_verbose() {
        let cli = Cli::try_parse_from(["forge", "--verbose", "build"]).unwrap();
        assert!(cli.verbose);
    }

    #[test]
    fn parse_json_format() {
        let cli = Cli::try_parse_from(["forge", "--format", "json", "build"]).unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
    }
}
