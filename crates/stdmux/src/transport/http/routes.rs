//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::{Path, Query, Request, State},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{CONNECTION, CONTENT_TYPE, UPGRADE},
    },
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Deserializer, Serialize};

use crate::container::{ContainerIo, RunState};
use crate::mux::encode_all;
use crate::registry::{ContainerRegistry, StartError, StartOutcome};
use crate::session::AttachOptions;

/// Query flags accept `1`/`0` and `true`/`false`, like the Docker API.
#[derive(Debug, Default, Deserialize)]
pub struct AttachParams {
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub stdin: bool,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub stdout: bool,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub stderr: bool,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub stream: bool,
}

impl From<AttachParams> for AttachOptions {
    fn from(params: AttachParams) -> Self {
        Self {
            stdin: params.stdin,
            stdout: params.stdout,
            stderr: params.stderr,
            stream: params.stream,
        }
    }
}

fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" => Ok(true),
        "" | "0" | "false" => Ok(false),
        other => Err(serde::de::Error::custom(format!(
            "invalid boolean flag: {other}"
        ))),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitResponse {
    pub status_code: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WaitError>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitError {
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerJson {
    pub id: String,
    pub created: DateTime<Utc>,
    pub config: ContainerConfigJson,
    pub state: ContainerStateJson,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfigJson {
    pub tty: bool,
    pub open_stdin: bool,
    pub cmd: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerStateJson {
    pub status: &'static str,
    pub running: bool,
    pub exit_code: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ContainerJson {
    pub fn from_container(container: &ContainerIo) -> Self {
        let run_state = container.run_state();
        let mut state = ContainerStateJson {
            status: run_state.as_str(),
            running: false,
            exit_code: 0,
            error: None,
            started_at: None,
            finished_at: None,
        };
        match run_state {
            RunState::Running { started_at } => {
                state.running = true;
                state.started_at = Some(started_at);
            }
            RunState::Exited(reason) => {
                state.exit_code = reason.status_code();
                state.finished_at = Some(reason.finished_at);
                state.error = reason.error;
            }
            RunState::Created | RunState::Removed => {}
        }

        let config = container.config();
        Self {
            id: container.id().to_string(),
            created: container.created_at(),
            config: ContainerConfigJson {
                tty: config.tty,
                open_stdin: config.open_stdin,
                cmd: config.command.clone(),
            },
            state,
        }
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "message": message.into() })),
    )
        .into_response()
}

fn wants_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false)
}

async fn attach_container(
    State(registry): State<Arc<ContainerRegistry>>,
    Path(id): Path<String>,
    Query(params): Query<AttachParams>,
    mut req: Request,
) -> Response {
    let options = AttachOptions::from(params);
    let session = match registry.attach(&id, options) {
        Ok(session) => session,
        Err(e) => return error_response(StatusCode::NOT_FOUND, e.to_string()),
    };
    let mode = session.container().stream_mode();

    if !options.stream {
        // One buffered response with whatever output exists now.
        let frames = session.container().output().snapshot(options.selection());
        return match encode_all(mode, frames) {
            Ok(body) => ([(CONTENT_TYPE, mode.media_type())], body).into_response(),
            Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
    }

    if !wants_upgrade(req.headers()) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "streaming attach requires Connection: Upgrade",
        );
    }

    let session_id = session.id();
    tracing::debug!(container_id = %id, %session_id, ?mode, "Upgrading attach connection");

    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                if let Err(e) = session.run(TokioIo::new(upgraded)).await {
                    tracing::debug!(container_id = %id, %session_id, error = %e, "Attach session ended with error");
                }
            }
            Err(e) => {
                tracing::error!(container_id = %id, %session_id, error = %e, "Attach upgrade failed");
            }
        }
    });

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("tcp"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(mode.media_type()));
    response
}

async fn start_container(
    State(registry): State<Arc<ContainerRegistry>>,
    Path(id): Path<String>,
) -> Response {
    match registry.start(&id).await {
        Ok(StartOutcome::Started) => StatusCode::NO_CONTENT.into_response(),
        Ok(StartOutcome::AlreadyStarted) => StatusCode::NOT_MODIFIED.into_response(),
        Err(e @ StartError::NotFound(_)) => error_response(StatusCode::NOT_FOUND, e.to_string()),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn wait_container(
    State(registry): State<Arc<ContainerRegistry>>,
    Path(id): Path<String>,
) -> Response {
    let Some(container) = registry.get(&id) else {
        return error_response(StatusCode::NOT_FOUND, format!("no such container: {id}"));
    };

    match container.wait_exit().await {
        Some(reason) => Json(WaitResponse {
            status_code: reason.status_code(),
            error: reason.error.map(|message| WaitError { message }),
        })
        .into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            format!("container {id} was removed"),
        ),
    }
}

async fn inspect_container(
    State(registry): State<Arc<ContainerRegistry>>,
    Path(id): Path<String>,
) -> Response {
    match registry.get(&id) {
        Some(container) => Json(ContainerJson::from_container(&container)).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("no such container: {id}")),
    }
}

pub fn routes(registry: Arc<ContainerRegistry>) -> Router {
    Router::new()
        .route("/containers/{id}/attach", post(attach_container))
        .route("/containers/{id}/start", post(start_container))
        .route("/containers/{id}/wait", post(wait_container))
        .route("/containers/{id}/json", get(inspect_container))
        .with_state(registry)
}
