use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use repopulse_analysis::{
    ActivityDeriver, ActivityFeed, AnalysisError, DeltaCalculator, RankingEngine,
    TimelineAggregator,
};
use repopulse_config::{
    RepoPulseConfig, config_path, database_path, ensure_workspace_config, validate_config,
};
use repopulse_core::{SubjectId, SubjectKind};
use repopulse_ingest::{
    GithubMetricsSource, MetricsSource, StaticMetricsSource, register_repository, run_sync_cycle,
};
use repopulse_server::AppState;
use repopulse_store::{SnapshotStore, SqliteStore};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cli::{
    AddRepoArgs, AddUserArgs, ContributorStatsArgs, FeedArgs, RepoStatsArgs, ServeArgs,
    TimelineArgs, TopArgs,
};

/// An initialized workspace: its config and the store behind it.
pub struct Workspace {
    pub root: PathBuf,
    pub config: RepoPulseConfig,
    pub store: Arc<SqliteStore>,
}

impl Workspace {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let config = ensure_workspace_config(&root).with_context(|| {
            format!(
                "failed to load or create workspace config at {}",
                config_path(&root).display()
            )
        })?;
        for warning in validate_config(&config) {
            tracing::warn!(code = warning.code, "{}", warning.message);
        }

        let sqlite_path = database_path(&root, &config);
        let store = SqliteStore::open(&sqlite_path)
            .with_context(|| format!("failed to open database {}", sqlite_path.display()))?;

        Ok(Self {
            root,
            config,
            store: Arc::new(store),
        })
    }
}

/// The GitHub API, or canned metrics when a fixture file is given.
pub fn metrics_source(
    config: &RepoPulseConfig,
    fixture: Option<&Path>,
) -> Result<Arc<dyn MetricsSource>> {
    if let Some(path) = fixture {
        let source = StaticMetricsSource::from_json_file(path)
            .with_context(|| format!("failed to read metrics fixture {}", path.display()))?;
        tracing::info!(fixture = %path.display(), "using fixture metrics source");
        return Ok(Arc::new(source));
    }

    let source = GithubMetricsSource::from_config(&config.github)
        .context("failed to build GitHub client")?;
    Ok(Arc::new(source))
}

pub fn init(workspace: &Workspace) -> Result<Value> {
    Ok(json!({
        "workspace": workspace.root,
        "config": config_path(&workspace.root),
        "database": workspace.store.path(),
    }))
}

pub async fn sync(workspace: &Workspace, source: &dyn MetricsSource) -> Result<Value> {
    let report = run_sync_cycle(&workspace.store, source, Utc::now())
        .await
        .context("sync cycle failed")?;
    to_json(&report)
}

pub fn derive_events(workspace: &Workspace) -> Result<Value> {
    let report = ActivityDeriver::new(workspace.store.as_ref())
        .derive_events(Utc::now())
        .context("event derivation failed")?;
    to_json(&report)
}

pub fn add_user(workspace: &Workspace, args: &AddUserArgs) -> Result<Value> {
    let user = workspace
        .store
        .create_user(&args.username, &args.owners, Utc::now())
        .with_context(|| format!("failed to create user '{}'", args.username))?;
    to_json(&user)
}

pub async fn add_repo(
    workspace: &Workspace,
    source: &dyn MetricsSource,
    args: &AddRepoArgs,
) -> Result<Value> {
    let registered = register_repository(
        &workspace.store,
        source,
        args.user_id,
        &args.repo_url,
        Utc::now(),
    )
    .await
    .with_context(|| format!("failed to add repository {}", args.repo_url))?;
    to_json(&registered)
}

pub fn repo_stats(workspace: &Workspace, args: &RepoStatsArgs) -> Result<Value> {
    let result = DeltaCalculator::new(workspace.store.as_ref()).repository_stats(
        &args.repo_url,
        args.time_window.as_deref(),
        Utc::now().date_naive(),
    );
    analysis_json(result)
}

pub fn contributor_stats(workspace: &Workspace, args: &ContributorStatsArgs) -> Result<Value> {
    let result = DeltaCalculator::new(workspace.store.as_ref()).contributor_stats(
        &args.github_username,
        args.time_window.as_deref(),
        args.repo_id,
        args.user_id,
        Utc::now().date_naive(),
    );
    analysis_json(result)
}

pub fn top(workspace: &Workspace, args: &TopArgs) -> Result<Value> {
    require_repository(workspace, args.repo_id)?;
    let result = RankingEngine::new(workspace.store.as_ref())
        .top_performers(args.repo_id, args.time_window.as_deref());
    analysis_json(result)
}

pub fn timeline(workspace: &Workspace, args: &TimelineArgs) -> Result<Value> {
    require_repository(workspace, args.repo_id)?;
    let result = TimelineAggregator::new(workspace.store.as_ref()).build_timeline(
        args.repo_id,
        &args.time_window,
        args.group_by,
    );
    analysis_json(result)
}

pub fn feed(workspace: &Workspace, args: &FeedArgs) -> Result<Value> {
    require_repository(workspace, args.repo_id)?;
    let result = ActivityFeed::new(workspace.store.as_ref()).recent_events(args.repo_id, Utc::now());
    analysis_json(result)
}

pub async fn serve(
    workspace: &Workspace,
    source: Arc<dyn MetricsSource>,
    args: &ServeArgs,
) -> Result<()> {
    let bind = args
        .bind
        .as_deref()
        .unwrap_or(workspace.config.server.bind.as_str());
    let addr = bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid bind address '{bind}'"))?;

    let sync_loop = (workspace.config.sync.enabled && !args.no_sync).then(|| {
        let period = Duration::from_secs(workspace.config.sync.effective_interval_secs());
        spawn_sync_loop(Arc::clone(&workspace.store), Arc::clone(&source), period)
    });

    let state = AppState::new(Arc::clone(&workspace.store), source);
    let served = repopulse_server::serve(addr, state, workspace.config.server.cors)
        .await
        .with_context(|| format!("failed to serve on {addr}"));

    if let Some(handle) = sync_loop {
        handle.abort();
    }
    served
}

fn spawn_sync_loop(
    store: Arc<SqliteStore>,
    source: Arc<dyn MetricsSource>,
    period: Duration,
) -> JoinHandle<()> {
    tracing::info!(interval_secs = period.as_secs(), "background sync enabled");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(err) = run_sync_cycle(&store, source.as_ref(), Utc::now()).await {
                tracing::warn!(error = %err, "background sync cycle failed");
            }
        }
    })
}

fn require_repository(workspace: &Workspace, repository_id: SubjectId) -> Result<()> {
    match workspace.store.get_subject(repository_id)? {
        Some(subject) if subject.kind == SubjectKind::Repository => Ok(()),
        _ => Err(anyhow!("repository {repository_id} not found")),
    }
}

/// Pending results are reported, not failed, matching the HTTP API.
fn analysis_json<T: Serialize>(result: Result<T, AnalysisError>) -> Result<Value> {
    match result {
        Ok(value) => to_json(&value),
        Err(err) if err.is_pending() => Ok(json!({"status": "pending", "reason": err.to_string()})),
        Err(err) => Err(err.into()),
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).context("failed to serialize JSON output")
}
