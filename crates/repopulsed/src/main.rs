use std::io::Write;

use anyhow::{Context, Result};
use repopulsed::cli::{Cli, Commands, LogFormat, parse_cli};
use repopulsed::commands::{self, Workspace};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn main() -> Result<()> {
    let cli = parse_cli();
    init_tracing(cli.log_format);
    run(cli)
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Human => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

fn run(cli: Cli) -> Result<()> {
    std::fs::create_dir_all(&cli.workspace).with_context(|| {
        format!(
            "failed to create workspace directory {}",
            cli.workspace.display()
        )
    })?;
    let root = cli.workspace.canonicalize().with_context(|| {
        format!(
            "failed to resolve workspace path {}",
            cli.workspace.display()
        )
    })?;
    let workspace = Workspace::open(root)?;

    let output = match &cli.command {
        Commands::Init => commands::init(&workspace)?,
        Commands::DeriveEvents => commands::derive_events(&workspace)?,
        Commands::AddUser(args) => commands::add_user(&workspace, args)?,
        Commands::RepoStats(args) => commands::repo_stats(&workspace, args)?,
        Commands::ContributorStats(args) => commands::contributor_stats(&workspace, args)?,
        Commands::Top(args) => commands::top(&workspace, args)?,
        Commands::Timeline(args) => commands::timeline(&workspace, args)?,
        Commands::Feed(args) => commands::feed(&workspace, args)?,
        Commands::Sync => {
            let source = commands::metrics_source(&workspace.config, cli.fixture.as_deref())?;
            runtime()?.block_on(commands::sync(&workspace, source.as_ref()))?
        }
        Commands::AddRepo(args) => {
            let source = commands::metrics_source(&workspace.config, cli.fixture.as_deref())?;
            runtime()?.block_on(commands::add_repo(&workspace, source.as_ref(), args))?
        }
        Commands::Serve(args) => {
            let source = commands::metrics_source(&workspace.config, cli.fixture.as_deref())?;
            return runtime()?.block_on(commands::serve(&workspace, source, args));
        }
    };

    write_json_to_stdout(&output)
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build async runtime")
}

fn write_json_to_stdout(value: &serde_json::Value) -> Result<()> {
    let mut out = std::io::stdout();
    serde_json::to_writer_pretty(&mut out, value).context("failed to serialize JSON output")?;
    writeln!(&mut out).context("failed to write trailing newline")?;
    Ok(())
}
