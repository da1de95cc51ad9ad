use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use super::super::AppState;
use super::connect::PersonaQuery;
use super::error_reply;
use crate::core::error::{CoreResult, OrchestratorError};
use crate::core::scheduler::PostScheduler;

#[derive(Deserialize)]
pub struct SchedulePostItem {
    pub image_url: String,
    pub caption: String,
    pub publish_at: String,
}

#[derive(Deserialize)]
pub struct ScheduleBody {
    pub persona_id: String,
    #[serde(default)]
    #[allow(dead_code)] // accepted for wire compatibility; the stored connection wins
    pub account_id: Option<String>,
    pub posts: Vec<SchedulePostItem>,
}

/// Accept an ISO-8601 instant, with or without an offset. A naive
/// timestamp is taken as UTC.
fn parse_publish_at(s: &str) -> CoreResult<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Ok(naive.and_utc());
    }
    Err(OrchestratorError::Validation(format!(
        "invalid publish_at '{s}': expected an ISO-8601 timestamp"
    )))
}

pub async fn create_schedule(
    State(state): State<AppState>,
    Json(body): Json<ScheduleBody>,
) -> Response {
    if state.store.get(&body.persona_id).await.is_none() {
        return error_reply(&OrchestratorError::Credential(format!(
            "no connected account for persona '{}'; connect it before scheduling",
            body.persona_id
        )))
        .into_response();
    }
    if body.posts.is_empty() {
        return error_reply(&OrchestratorError::Validation(
            "posts must not be empty".into(),
        ))
        .into_response();
    }

    // Validate the whole batch before touching the job store, so one bad
    // timestamp never leaves a half-accepted request behind.
    let mut run_ats = Vec::with_capacity(body.posts.len());
    for post in &body.posts {
        let run_at = match parse_publish_at(&post.publish_at) {
            Ok(t) => t,
            Err(e) => return error_reply(&e).into_response(),
        };
        if let Err(e) = PostScheduler::validate_run_at(run_at) {
            return error_reply(&e).into_response();
        }
        run_ats.push(run_at);
    }

    let mut scheduled = Vec::with_capacity(body.posts.len());
    for (post, run_at) in body.posts.iter().zip(run_ats) {
        match state
            .scheduler
            .schedule(&body.persona_id, &post.image_url, &post.caption, run_at)
            .await
        {
            Ok(job_id) => scheduled.push(json!({
                "job_id": job_id,
                "publish_at": run_at.to_rfc3339(),
            })),
            Err(e) => return error_reply(&e).into_response(),
        }
    }

    (
        StatusCode::CREATED,
        Json(json!({ "scheduled": scheduled, "count": scheduled.len() })),
    )
        .into_response()
}

pub async fn list_schedule(
    State(state): State<AppState>,
    Query(q): Query<PersonaQuery>,
) -> Response {
    match state.scheduler.list(&q.persona_id).await {
        Ok(jobs) => Json(json!({
            "persona_id": q.persona_id,
            "scheduled_posts": jobs,
            "count": jobs.len(),
        }))
        .into_response(),
        Err(e) => error_reply(&OrchestratorError::Other(e)).into_response(),
    }
}

pub async fn cancel_schedule(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Response {
    if state.scheduler.cancel(&job_id).await {
        Json(json!({ "cancelled": true, "job_id": job_id })).into_response()
    } else {
        error_reply(&OrchestratorError::NotFound(format!(
            "job {job_id} not found or already executed"
        )))
        .into_response()
    }
}

#[derive(Deserialize)]
pub struct PublishNowBody {
    pub persona_id: String,
    pub image_url: String,
    pub caption: String,
}

pub async fn publish_now(
    State(state): State<AppState>,
    Json(body): Json<PublishNowBody>,
) -> Response {
    match state
        .pipeline
        .publish(&body.persona_id, &body.image_url, &body.caption)
        .await
    {
        Ok(media_id) => Json(json!({
            "success": true,
            "media_id": media_id,
            "persona_id": body.persona_id,
        }))
        .into_response(),
        Err(e) => error_reply(&e).into_response(),
    }
}
