use std::ffi::OsStr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use repopulse_analysis::{DEFAULT_TIMELINE_WINDOW, GroupBy};
use repopulse_core::{SubjectId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Json => "json",
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "human" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "invalid log format '{other}', expected one of: human, json"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct ServeArgs {
    #[arg(long, help = "Address to bind, overriding [server] bind")]
    pub bind: Option<String>,

    #[arg(long, help = "Do not run the background sync loop even if enabled")]
    pub no_sync: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct AddUserArgs {
    #[arg(help = "Dashboard username")]
    pub username: String,

    #[arg(
        long,
        value_delimiter = ',',
        value_name = "OWNER",
        help = "Comma-separated GitHub owners this user controls"
    )]
    pub owners: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct AddRepoArgs {
    #[arg(long, help = "User registering the repository")]
    pub user_id: UserId,

    #[arg(help = "GitHub repository URL, e.g. https://github.com/owner/name")]
    pub repo_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct RepoStatsArgs {
    #[arg(help = "GitHub repository URL")]
    pub repo_url: String,

    #[arg(long, help = "Window like 7d, 2w or 3m; totals when omitted")]
    pub time_window: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct ContributorStatsArgs {
    #[arg(help = "GitHub login")]
    pub github_username: String,

    #[arg(long, help = "Window like 7d, 2w or 3m; totals when omitted")]
    pub time_window: Option<String>,

    #[arg(long, help = "Restrict to snapshots taken within this repository")]
    pub repo_id: Option<SubjectId>,

    #[arg(
        long,
        requires = "repo_id",
        help = "Require this user to control --repo-id"
    )]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct TopArgs {
    #[arg(help = "Tracked repository id")]
    pub repo_id: SubjectId,

    #[arg(long, help = "Window like 7d, 2w or 3m; raw totals when omitted")]
    pub time_window: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct TimelineArgs {
    #[arg(help = "Tracked repository id")]
    pub repo_id: SubjectId,

    #[arg(long, default_value = DEFAULT_TIMELINE_WINDOW)]
    pub time_window: String,

    #[arg(
        long,
        default_value = "month",
        value_parser = parse_group_by,
        help = "Bucket size: week, month, or quarter"
    )]
    pub group_by: GroupBy,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct FeedArgs {
    #[arg(help = "Tracked repository id")]
    pub repo_id: SubjectId,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// Write the default config and create the database
    Init,
    /// Serve the HTTP API
    Serve(ServeArgs),
    /// Run one sync cycle against the metrics source
    Sync,
    /// Derive activity events from the newest snapshots
    DeriveEvents,
    /// Create a dashboard user
    AddUser(AddUserArgs),
    /// Start tracking a repository
    AddRepo(AddRepoArgs),
    /// Repository totals or windowed deltas
    RepoStats(RepoStatsArgs),
    /// Contributor totals or windowed deltas
    ContributorStats(ContributorStatsArgs),
    /// Top contributors of a repository
    Top(TopArgs),
    /// Bucketed repository growth
    Timeline(TimelineArgs),
    /// Today's largest activity events of a repository
    Feed(FeedArgs),
}

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "RepoPulse snapshot analytics daemon")]
pub struct Cli {
    #[arg(
        long,
        global = true,
        default_value = ".",
        help = "Workspace root holding .repopulse/"
    )]
    pub workspace: PathBuf,

    #[arg(
        long,
        global = true,
        default_value = "human",
        value_parser = parse_log_format,
        help = "Log format: human or json"
    )]
    pub log_format: LogFormat,

    #[arg(
        long,
        global = true,
        help = "Read metrics from a JSON fixture instead of the GitHub API"
    )]
    pub fixture: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

pub fn parse_cli() -> Cli {
    let mut args: Vec<_> = std::env::args_os().collect();
    if args.get(1).is_some_and(|arg| arg == OsStr::new("--")) {
        args.remove(1);
    }

    Cli::parse_from(args)
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    value.parse()
}

fn parse_group_by(value: &str) -> Result<GroupBy, String> {
    value.parse().map_err(|err| format!("{err}"))
}
