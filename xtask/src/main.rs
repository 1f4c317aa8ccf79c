use anyhow::{
    Context,
    Result,
    ensure,
};
use clap::{
    Parser,
    Subcommand,
};
use std::{
    path::Path,
    process::Command,
};

#[derive(Parser)]
#[command(
    name = "xtask",
    about = "Raffle sync helper tasks (fmt, clippy, tests)",
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check formatting without rewriting files (nightly rustfmt, for the
    /// import layout options in rustfmt.toml)
    Fmt,
    /// Run clippy for the entire workspace with warnings-as-errors
    Clippy,
    /// Run the workspace tests
    Test {
        /// Only run the fake-server wire tests of raffle-sync
        #[arg(long)]
        wire_only: bool,
    },
    /// fmt, clippy and tests, in that order
    Ci,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let root = repo_root()?;

    match cli.command {
        Commands::Fmt => check_fmt(&root)?,
        Commands::Clippy => run_clippy(&root)?,
        Commands::Test { wire_only } => run_tests(&root, wire_only)?,
        Commands::Ci => {
            check_fmt(&root)?;
            run_clippy(&root)?;
            run_tests(&root, false)?;
        }
    }

    Ok(())
}

fn repo_root() -> Result<std::path::PathBuf> {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
        .context("xtask has no parent directory")
}

fn check_fmt(root: &Path) -> Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.arg("+nightly")
        .arg("fmt")
        .arg("--all")
        .arg("--check")
        .current_dir(root);
    run_command(cmd, "cargo +nightly fmt --check")
}

fn run_clippy(root: &Path) -> Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.arg("clippy")
        .arg("--workspace")
        .arg("--all-targets")
        .arg("--all-features")
        .arg("--")
        .arg("-D")
        .arg("warnings")
        .current_dir(root);
    run_command(cmd, "cargo clippy")
}

fn run_tests(root: &Path, wire_only: bool) -> Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.arg("test").current_dir(root);
    let label = if wire_only {
        cmd.arg("-p").arg("raffle-sync").arg("--test").arg("wire");
        "cargo test -p raffle-sync --test wire"
    } else {
        cmd.arg("--workspace");
        "cargo test --workspace"
    };
    run_command(cmd, label)
}

fn run_command(mut cmd: Command, label: &str) -> Result<()> {
    println!("Running: {}", label);
    let status = cmd
        .status()
        .with_context(|| format!("failed to run {label}"))?;
    ensure!(status.success(), "{label} failed with status {status}");
    Ok(())
}
