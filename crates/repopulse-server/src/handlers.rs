use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use chrono::Utc;
use repopulse_analysis::{
    ActivityFeed, DEFAULT_GROUP_BY, DEFAULT_TIMELINE_WINDOW, DeltaCalculator, DeltaResult,
    FeedEntry, GroupBy, PeriodChange, PeriodChangeAnalyzer, RankingEngine, TimelineAggregator,
    TimelineBucket, TopPerformers,
};
use repopulse_core::{SubjectId, SubjectKind, UserId};
use repopulse_ingest::register_repository;
use repopulse_store::{RegisteredRepository, SnapshotStore, SubjectRecord, UserRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub(crate) struct CreateUserRequest {
    username: String,
    /// Comma-separated GitHub owners.
    #[serde(default)]
    github_ownership: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AddRepositoryRequest {
    repo_url: String,
    user_id: UserId,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UserQuery {
    user_id: Option<UserId>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RepositoryStatsQuery {
    repo_url: Option<String>,
    time_window: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WindowQuery {
    time_window: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TimelineQuery {
    time_window: Option<String>,
    group_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ContributorStatsQuery {
    github_username: Option<String>,
    time_window: Option<String>,
    repo_id: Option<SubjectId>,
    user_id: Option<UserId>,
}

#[derive(Debug, Serialize)]
pub(crate) struct RepositoryList {
    repositories: Vec<SubjectRecord>,
}

pub(crate) async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub(crate) async fn create_user(
    State(state): State<AppState>,
    Json(request): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<UserRecord>), ApiError> {
    let username = request.username.trim();
    if username.is_empty() {
        return Err(ApiError::BadRequest("username is required".to_owned()));
    }

    let owners = request
        .github_ownership
        .split(',')
        .map(str::trim)
        .filter(|owner| !owner.is_empty())
        .map(str::to_owned)
        .collect::<Vec<_>>();

    let user = state.store.create_user(username, &owners, Utc::now())?;
    Ok((StatusCode::CREATED, Json(user)))
}

pub(crate) async fn list_repositories(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<RepositoryList>, ApiError> {
    let user_id = required(query.user_id, "user_id")?;
    if state.store.get_user(user_id)?.is_none() {
        return Err(ApiError::NotFound(format!("user {user_id}")));
    }

    let repositories = state.store.repositories_for_user(user_id)?;
    Ok(Json(RepositoryList { repositories }))
}

pub(crate) async fn add_repository(
    State(state): State<AppState>,
    Json(request): Json<AddRepositoryRequest>,
) -> Result<(StatusCode, Json<RegisteredRepository>), ApiError> {
    let registered = register_repository(
        &state.store,
        state.source.as_ref(),
        request.user_id,
        &request.repo_url,
        Utc::now(),
    )
    .await?;

    Ok((StatusCode::CREATED, Json(registered)))
}

pub(crate) async fn repository_stats(
    State(state): State<AppState>,
    Query(query): Query<RepositoryStatsQuery>,
) -> Result<Json<DeltaResult>, ApiError> {
    let repo_url = required(query.repo_url, "repo_url")?;
    let result = DeltaCalculator::new(state.store.as_ref()).repository_stats(
        &repo_url,
        non_empty(query.time_window.as_deref()),
        Utc::now().date_naive(),
    )?;
    Ok(Json(result))
}

pub(crate) async fn period_change(
    State(state): State<AppState>,
    Path(repository_id): Path<SubjectId>,
) -> Result<Json<PeriodChange>, ApiError> {
    require_repository(&state, repository_id)?;
    let change = PeriodChangeAnalyzer::new(state.store.as_ref())
        .period_change(repository_id, Utc::now())?;
    Ok(Json(change))
}

pub(crate) async fn top_performers(
    State(state): State<AppState>,
    Path(repository_id): Path<SubjectId>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<TopPerformers>, ApiError> {
    require_repository(&state, repository_id)?;
    let top = RankingEngine::new(state.store.as_ref())
        .top_performers(repository_id, non_empty(query.time_window.as_deref()))?;
    Ok(Json(top))
}

pub(crate) async fn timeline(
    State(state): State<AppState>,
    Path(repository_id): Path<SubjectId>,
    Query(query): Query<TimelineQuery>,
) -> Result<Json<Vec<TimelineBucket>>, ApiError> {
    let group_by = match non_empty(query.group_by.as_deref()) {
        Some(raw) => raw.parse::<GroupBy>()?,
        None => DEFAULT_GROUP_BY,
    };
    let window = non_empty(query.time_window.as_deref()).unwrap_or(DEFAULT_TIMELINE_WINDOW);

    require_repository(&state, repository_id)?;
    let buckets = TimelineAggregator::new(state.store.as_ref())
        .build_timeline(repository_id, window, group_by)?;
    Ok(Json(buckets))
}

pub(crate) async fn recent_activity(
    State(state): State<AppState>,
    Path(repository_id): Path<SubjectId>,
) -> Result<Json<Vec<FeedEntry>>, ApiError> {
    require_repository(&state, repository_id)?;
    let feed = ActivityFeed::new(state.store.as_ref()).recent_events(repository_id, Utc::now())?;
    Ok(Json(feed))
}

pub(crate) async fn contributor_stats(
    State(state): State<AppState>,
    Query(query): Query<ContributorStatsQuery>,
) -> Result<Json<DeltaResult>, ApiError> {
    let username = required(query.github_username, "github_username")?;
    let result = DeltaCalculator::new(state.store.as_ref()).contributor_stats(
        &username,
        non_empty(query.time_window.as_deref()),
        query.repo_id,
        query.user_id,
        Utc::now().date_naive(),
    )?;
    Ok(Json(result))
}

fn required<T>(value: Option<T>, name: &str) -> Result<T, ApiError> {
    value.ok_or_else(|| ApiError::BadRequest(format!("missing required parameter '{name}'")))
}

/// Treats `?time_window=` like an absent parameter.
fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|raw| !raw.is_empty())
}

fn require_repository(state: &AppState, repository_id: SubjectId) -> Result<(), ApiError> {
    match state.store.get_subject(repository_id)? {
        Some(subject) if subject.kind == SubjectKind::Repository => Ok(()),
        _ => Err(ApiError::NotFound(format!("repository {repository_id}"))),
    }
}
