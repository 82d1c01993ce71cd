use clap::Parser;
use colored::Colorize;
use tracing::Level;

mod cli;
mod commands;
mod manifest;
mod tasks;

fn main() {
    let cli = cli::Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let code = match commands::run_command(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            1
        }
    };
    std::process::exit(code);
}
