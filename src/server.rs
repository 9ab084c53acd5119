//! HTTP API for the browser UI
//!
//! | Route | Effect |
//! |-------|--------|
//! | `POST /run` | Start a run, return `{run_id}` with 202 |
//! | `GET /run/:run_id/events` | SSE stream of `{type, ts, payload}` frames |
//! | `GET /run/:run_id/status` | Polling fallback |
//! | `GET /files` | List stored result files |
//! | `GET /results/:filename` | Return one stored report JSON |
//!
//! The dataset is loaded once at startup; each POST spawns an independent
//! pipeline task whose events flow through the run registry.

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures_util::Stream;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::config::ProbeConfig;
use crate::dataset::{Dataset, Metadata};
use crate::event::{RunRegistry, RunStatus};
use crate::llm::LlmClient;
use crate::runtime::{DifficultyFilter, Orchestrator, RunOptions};

/// Shared server state
pub struct ServerContext {
    pub registry: RunRegistry,
    pub llm: Arc<dyn LlmClient>,
    pub config: ProbeConfig,
    pub dataset: Arc<Dataset>,
    pub metadata: Option<Arc<Metadata>>,
    pub dataset_name: String,
    pub results_dir: PathBuf,
}

pub fn router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/run", post(start_run))
        .route("/run/:run_id/events", get(stream_events))
        .route("/run/:run_id/status", get(run_status))
        .route("/files", get(list_files))
        .route("/results/:filename", get(get_result_file))
        .with_state(ctx)
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({"error": message.into()})))
}

// ═══════════════════════════════════════════════════════════════
// POST /run
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct RunRequest {
    #[serde(default = "default_difficulty")]
    difficulty: String,
    #[serde(default = "default_num_questions")]
    num_questions: usize,
}

fn default_difficulty() -> String {
    "all".to_string()
}

fn default_num_questions() -> usize {
    5
}

async fn start_run(
    State(ctx): State<Arc<ServerContext>>,
    Json(body): Json<RunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let difficulty: DifficultyFilter = body
        .difficulty
        .parse()
        .map_err(|_| api_error(StatusCode::BAD_REQUEST, "difficulty must be one of: easy, medium, hard, all"))?;

    if body.num_questions == 0 || body.num_questions > ctx.config.question_count {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("num_questions must be 1..={}", ctx.config.question_count),
        ));
    }

    let handle = ctx.registry.create();
    let run_id = handle.run_id.clone();
    let opts = RunOptions {
        num_questions: body.num_questions,
        difficulty,
    };

    let output_file = format!(
        "eval_results_{}_{}.json",
        Utc::now().format("%Y%m%d_%H%M%S"),
        &run_id[..8.min(run_id.len())]
    );
    let output_path = ctx.results_dir.join(&output_file);

    info!(run_id, ?opts, "run accepted");

    let ctx_task = Arc::clone(&ctx);
    let handle_task = Arc::clone(&handle);
    tokio::spawn(async move {
        handle_task.set_status(RunStatus::Running);
        let orchestrator = Orchestrator::new(Arc::clone(&ctx_task.llm), ctx_task.config.clone());
        let stream = handle_task.stream();
        let cancelled = handle_task.cancel_flag();

        let outcome = orchestrator
            .run_to_file(
                &handle_task.run_id,
                Arc::clone(&ctx_task.dataset),
                ctx_task.metadata.clone(),
                &opts,
                &stream,
                &cancelled,
                &ctx_task.dataset_name,
                &output_path,
            )
            .await;

        match outcome {
            Ok(_) => {
                handle_task.set_output_file(&output_file);
                handle_task.set_status(RunStatus::Done);
            }
            Err(e) => {
                error!(run_id = %handle_task.run_id, error = %e, "run failed");
                handle_task.set_status(RunStatus::Error);
            }
        }
        ctx_task.registry.schedule_cleanup(&handle_task.run_id);
    });

    Ok((StatusCode::ACCEPTED, Json(json!({"run_id": run_id}))))
}

// ═══════════════════════════════════════════════════════════════
// GET /run/:run_id/events
// ═══════════════════════════════════════════════════════════════

async fn stream_events(
    State(ctx): State<Arc<ServerContext>>,
    Path(run_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let handle = ctx
        .registry
        .get(&run_id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("run not found: {run_id}")))?;

    let subscriber = handle
        .subscribe()
        .map_err(|e| api_error(StatusCode::CONFLICT, e.to_string()))?;

    let stream = futures_util::stream::unfold(subscriber, |mut subscriber| async move {
        let event = subscriber.next().await?;
        let sse = SseEvent::default().json_data(&event).ok()?;
        Some((Ok::<_, Infallible>(sse), subscriber))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ═══════════════════════════════════════════════════════════════
// GET /run/:run_id/status
// ═══════════════════════════════════════════════════════════════

async fn run_status(
    State(ctx): State<Arc<ServerContext>>,
    Path(run_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let handle = ctx
        .registry
        .get(&run_id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("run not found: {run_id}")))?;

    Ok(Json(json!({
        "run_id": run_id,
        "status": handle.status(),
        "output_file": handle.output_file(),
    })))
}

// ═══════════════════════════════════════════════════════════════
// GET /files and GET /results/:filename
// ═══════════════════════════════════════════════════════════════

async fn list_files(
    State(ctx): State<Arc<ServerContext>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut files: Vec<String> = std::fs::read_dir(&ctx.results_dir)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with("eval_results") && name.ends_with(".json"))
        .collect();
    files.sort();
    Ok(Json(json!({"files": files})))
}

async fn get_result_file(
    State(ctx): State<Arc<ServerContext>>,
    Path(filename): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    // Plain filenames only — no traversal
    if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
        return Err(api_error(StatusCode::BAD_REQUEST, "invalid filename"));
    }

    let path = ctx.results_dir.join(&filename);
    if !path.exists() {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("file not found: {filename}"),
        ));
    }

    let raw = std::fs::read_to_string(&path)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| api_error(StatusCode::UNPROCESSABLE_ENTITY, format!("invalid JSON: {e}")))?;
    Ok(Json(parsed))
}

/// Bind and serve until shutdown
pub async fn serve(ctx: Arc<ServerContext>, addr: &str) -> crate::error::Result<()> {
    let app = router(ctx);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "serving run API");
    axum::serve(listener, app)
        .await
        .map_err(|e| crate::error::ProbeError::Internal {
            reason: format!("server error: {e}"),
        })
}

#[cfg(test)]
mod tests {
    #[test]
    fn filename_guard_catches_traversal() {
        for bad in ["../secrets", "a/b.json", "a\\b.json", "..\\x"] {
            assert!(
                bad.contains('/') || bad.contains('\\') || bad.contains(".."),
                "{bad} should be rejected"
            );
        }
        let good = "eval_results_20260101_000000_abcd1234.json";
        assert!(!good.contains('/') && !good.contains('\\') && !good.contains(".."));
    }
}
