use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shipwright_common::{Command, CommandKind, NoticeContent, ZipType};

use crate::coordinator::Coordinator;
use crate::errors::CoordinatorError;

pub const CODE_SUCCESS: u32 = 10000;
pub const CODE_UNKNOWN_ERROR: u32 = 10001;

const DEFAULT_LOG_COUNT: usize = 10;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ReleaseTagRequest {
    pub tag: String,
}

#[derive(Deserialize)]
pub struct SvnCommitRequest {
    pub branch: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Deserialize)]
pub struct CompressRequest {
    pub branch: String,
    #[serde(default)]
    pub zip_type: ZipType,
    #[serde(default)]
    pub zip_flags: String,
}

#[derive(Deserialize)]
pub struct WriteFileRequest {
    pub content: String,
}

#[derive(Deserialize)]
pub struct LogQuery {
    pub count: Option<usize>,
}

#[derive(Deserialize)]
pub struct FilterQuery {
    pub filter: Option<String>,
}

// ── Envelope ──────────────────────────────────────────────────────────

/// Every response body: `{code, message, data}`.
#[derive(Serialize)]
pub struct Envelope<T: Serialize> {
    pub code: u32,
    pub message: &'static str,
    pub data: T,
}

fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        code: CODE_SUCCESS,
        message: "success",
        data,
    })
}

fn submitted(task_id: u64) -> Json<Envelope<serde_json::Value>> {
    ok(json!({ "task_id": task_id }))
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    Coordinator(CoordinatorError),
    BadRequest(String),
}

impl From<CoordinatorError> for ApiError {
    fn from(e: CoordinatorError) -> Self {
        ApiError::Coordinator(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

/// Failures never leak detail to clients; the log gets the full error.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            ApiError::Coordinator(e) => {
                tracing::warn!(error = %e, kind = ?e.kind(), "request failed");
            }
            ApiError::BadRequest(msg) => {
                tracing::warn!(error = %msg, "rejected request");
            }
        }
        let body = Envelope {
            code: CODE_UNKNOWN_ERROR,
            message: "unknown error",
            data: json!({}),
        };
        (StatusCode::OK, Json(body)).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/git/all", get(all_git_info))
        .route("/git/{project}", get(git_info))
        .route("/git/{project}/refresh", post(refresh))
        .route("/git/{project}/branches/{branch}/generate", post(generate))
        .route("/git/{project}/branches/{branch}/release-tag", put(set_release_tag))
        .route("/svn/{project}/commit", post(svn_commit))
        .route("/svn/{project}/log", get(svn_log))
        .route("/ftp/{project}/entries", get(ftp_entries))
        .route("/ftp/{project}/files/{name}", get(ftp_read).put(ftp_write))
        .route("/ftp/{project}/compress", post(ftp_compress))
        .route("/notice/{project}/envs", get(notice_envs))
        .route(
            "/notice/{project}/envs/{env}",
            get(notice_content).put(put_notice_content),
        )
        .route("/tasks", post(submit_task))
        .route("/tasks/{project}", get(list_tasks))
        .route("/tasks/{project}/{id}", get(get_task))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn all_git_info(State(state): State<SharedState>) -> impl IntoResponse {
    ok(state.coordinator.all_git_info().await)
}

async fn git_info(
    State(state): State<SharedState>,
    Path(project): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(ok(state.coordinator.git_info(&project).await?))
}

async fn refresh(
    State(state): State<SharedState>,
    Path(project): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.coordinator.refresh(&project).await?;
    Ok(ok(json!({})))
}

async fn generate(
    State(state): State<SharedState>,
    Path((project, branch)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    state.coordinator.git_generate(&project, &branch).await?;
    Ok(ok(json!({})))
}

async fn set_release_tag(
    State(state): State<SharedState>,
    Path((project, branch)): Path<(String, String)>,
    payload: Result<Json<ReleaseTagRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;
    state
        .coordinator
        .set_release_tag(&project, &branch, &req.tag)
        .await?;
    Ok(ok(json!({})))
}

async fn svn_commit(
    State(state): State<SharedState>,
    Path(project): Path<String>,
    payload: Result<Json<SvnCommitRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;
    let command = Command::new(project, req.branch, CommandKind::SvnCommit).with_message(req.message);
    Ok(submitted(state.coordinator.submit(command).await?))
}

async fn svn_log(
    State(state): State<SharedState>,
    Path(project): Path<String>,
    query: Result<Query<LogQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query?;
    let count = query.count.unwrap_or(DEFAULT_LOG_COUNT);
    Ok(ok(state.coordinator.svn_log(&project, count).await?))
}

async fn ftp_entries(
    State(state): State<SharedState>,
    Path(project): Path<String>,
    query: Result<Query<FilterQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query?;
    Ok(ok(state
        .coordinator
        .ftp_list(&project, query.filter.as_deref())
        .await?))
}

async fn ftp_read(
    State(state): State<SharedState>,
    Path((project, name)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let bytes = state.coordinator.ftp_read(&project, &name).await?;
    Ok(ok(json!({
        "name": name,
        "content": String::from_utf8_lossy(&bytes),
    })))
}

async fn ftp_write(
    State(state): State<SharedState>,
    Path((project, name)): Path<(String, String)>,
    payload: Result<Json<WriteFileRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;
    state
        .coordinator
        .ftp_write(&project, &name, req.content.as_bytes())
        .await?;
    Ok(ok(json!({})))
}

async fn ftp_compress(
    State(state): State<SharedState>,
    Path(project): Path<String>,
    payload: Result<Json<CompressRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;
    let command = Command::new(project, req.branch, CommandKind::FtpUpload)
        .with_zip(req.zip_type, req.zip_flags);
    Ok(submitted(state.coordinator.submit(command).await?))
}

async fn notice_envs(
    State(state): State<SharedState>,
    Path(project): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(ok(state.coordinator.notice_envs(&project)?))
}

async fn notice_content(
    State(state): State<SharedState>,
    Path((project, env)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(ok(state.coordinator.notice_content(&project, &env).await?))
}

async fn put_notice_content(
    State(state): State<SharedState>,
    Path((project, env)): Path<(String, String)>,
    payload: Result<Json<NoticeContent>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(content) = payload?;
    state
        .coordinator
        .put_notice_content(&project, &env, &content)
        .await?;
    Ok(ok(json!({})))
}

async fn submit_task(
    State(state): State<SharedState>,
    payload: Result<Json<Command>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(command) = payload?;
    Ok(submitted(state.coordinator.submit(command).await?))
}

async fn list_tasks(
    State(state): State<SharedState>,
    Path(project): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(ok(state.coordinator.tasks(&project).await?))
}

async fn get_task(
    State(state): State<SharedState>,
    Path((project, id)): Path<(String, u64)>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(ok(state.coordinator.task(&project, id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OssConfig, OssEnv};
    use crate::coordinator::Project;
    use crate::errors::{FtpError, NoticeError};
    use crate::operator::git::tests::{LISTING, RecordingRunner};
    use crate::operator::svn::tests::FakeSvn;
    use crate::operator::{
        FtpClient, FtpOperator, GitOperator, GitOptions, NoticeOperator, NoticeStore, SvnOperator,
    };
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use shipwright_common::FtpEntry;
    use std::time::Duration;
    use tower::ServiceExt;

    struct StaticFtp;

    #[async_trait]
    impl FtpClient for StaticFtp {
        async fn list(&self) -> Result<Vec<FtpEntry>, FtpError> {
            Ok(["introduce_2020031300.txt", "HelixServer_2020031300.zip"]
                .iter()
                .map(|n| FtpEntry {
                    name: n.to_string(),
                    size: 1,
                    modified: None,
                })
                .collect())
        }
        async fn read(&self, name: &str) -> Result<Vec<u8>, FtpError> {
            Ok(format!("contents of {}", name).into_bytes())
        }
        async fn write(&self, _name: &str, _data: &[u8]) -> Result<(), FtpError> {
            Ok(())
        }
        async fn upload(&self, _local: &std::path::Path, _remote: &str) -> Result<(), FtpError> {
            Ok(())
        }
    }

    struct EmptyStore;

    #[async_trait]
    impl NoticeStore for EmptyStore {
        async fn get_object(&self, key: &str) -> Result<Vec<u8>, NoticeError> {
            Err(NoticeError::Status {
                key: key.to_string(),
                status: 404,
            })
        }
        async fn put_object(&self, _key: &str, _body: Vec<u8>, _ct: &str) -> Result<(), NoticeError> {
            Ok(())
        }
    }

    async fn test_app() -> Router {
        let git = GitOperator::new(
            "helix",
            "/opt/scripts/git.sh",
            "/srv/helix/git",
            Arc::new(RecordingRunner::with_listing(LISTING)),
            GitOptions {
                refresh_interval: Duration::from_secs(3600),
                send_timeout: Duration::from_millis(50),
                capacity: 4,
            },
        );
        git.refresh().await.unwrap();

        let oss = OssConfig {
            proxy_url: "https://notice.example.com".into(),
            envs: vec![OssEnv {
                name: "dev".into(),
                value: "helix-dev".into(),
            }],
            ..Default::default()
        };
        let project = Project::new(
            git,
            SvnOperator::new("helix", Arc::new(FakeSvn::default()), Duration::from_secs(3600)),
            FtpOperator::new("helix", Arc::new(StaticFtp)),
            NoticeOperator::new("helix", oss, Arc::new(EmptyStore)),
            "HelixServer",
            8,
        );
        let state = Arc::new(AppState {
            coordinator: Arc::new(Coordinator::new(vec![project])),
        });
        api_router().with_state(state)
    }

    async fn body_json(body: Body) -> serde_json::Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn send(app: Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> serde_json::Value {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        body_json(response.into_body()).await
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = test_app().await;
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"ok");
    }

    #[tokio::test]
    async fn test_git_all_lists_projects() {
        let json = send(test_app().await, "GET", "/git/all", None).await;
        assert_eq!(json["code"], 10000);
        assert_eq!(json["message"], "success");
        assert_eq!(json["data"][0]["name"], "helix");
        assert_eq!(json["data"][0]["current_task"], "N/A");
        assert_eq!(json["data"][0]["branches"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_project_is_generic_error() {
        let json = send(test_app().await, "GET", "/git/nope", None).await;
        assert_eq!(json["code"], 10001);
        assert_eq!(json["message"], "unknown error");
        assert_eq!(json["data"], json!({}));
    }

    #[tokio::test]
    async fn test_release_tag_shows_in_git_info() {
        let app = test_app().await;
        let json = send(
            app.clone(),
            "PUT",
            "/git/helix/branches/feature-x/release-tag",
            Some(json!({"tag": "v1.2"})),
        )
        .await;
        assert_eq!(json["code"], 10000);

        let info = send(app, "GET", "/git/helix", None).await;
        let branches = info["data"]["branches"].as_array().unwrap();
        let tagged = branches.iter().find(|b| b["name"] == "feature-x").unwrap();
        assert_eq!(tagged["release_tag"], "v1.2");
    }

    #[tokio::test]
    async fn test_malformed_body_is_generic_error() {
        let app = test_app().await;
        let request = Request::builder()
            .method("PUT")
            .uri("/git/helix/branches/dev/release-tag")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response.into_body()).await["code"], 10001);
    }

    #[tokio::test]
    async fn test_submit_then_query_task() {
        let app = test_app().await;
        let json = send(
            app.clone(),
            "POST",
            "/svn/helix/commit",
            Some(json!({"branch": "feature-x", "message": "release 1.2"})),
        )
        .await;
        assert_eq!(json["data"]["task_id"], 1);

        let task = send(app.clone(), "GET", "/tasks/helix/1", None).await;
        assert_eq!(task["data"]["status"], "waiting");
        assert_eq!(task["data"]["command"]["command"], "svnCommit");
        assert_eq!(task["data"]["command"]["message"], "release 1.2");

        let all = send(app.clone(), "GET", "/tasks/helix", None).await;
        assert!(all["data"]["1"].is_object());

        let missing = send(app, "GET", "/tasks/helix/99", None).await;
        assert_eq!(missing["code"], 10001);
    }

    #[tokio::test]
    async fn test_generic_task_submission() {
        let json = send(
            test_app().await,
            "POST",
            "/tasks",
            Some(json!({
                "project_name": "helix",
                "branch_name": "dev",
                "command": "ftpUpload",
                "zip_type": "pat"
            })),
        )
        .await;
        assert_eq!(json["code"], 10000);
        assert_eq!(json["data"]["task_id"], 1);
    }

    #[tokio::test]
    async fn test_ftp_entries_filter_and_read() {
        let app = test_app().await;
        let json = send(app.clone(), "GET", "/ftp/helix/entries?filter=%5C.zip%24", None).await;
        let entries = json["data"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["name"], "HelixServer_2020031300.zip");

        let file = send(app.clone(), "GET", "/ftp/helix/files/readme.txt", None).await;
        assert_eq!(file["data"]["content"], "contents of readme.txt");

        let bad = send(app, "GET", "/ftp/helix/entries?filter=(", None).await;
        assert_eq!(bad["code"], 10001);
    }

    #[tokio::test]
    async fn test_notice_routes() {
        let app = test_app().await;
        let envs = send(app.clone(), "GET", "/notice/helix/envs", None).await;
        assert_eq!(envs["data"]["dev"], "https://notice.example.com/dev/helix-dev.html");

        let content = send(app.clone(), "GET", "/notice/helix/envs/dev", None).await;
        assert_eq!(content["data"]["title"], "");

        let unknown = send(app, "GET", "/notice/helix/envs/prod", None).await;
        assert_eq!(unknown["code"], 10001);
    }

    #[tokio::test]
    async fn test_svn_log_defaults_count() {
        let json = send(test_app().await, "GET", "/svn/helix/log", None).await;
        assert_eq!(json["code"], 10000);
        assert_eq!(json["data"], json!([]));
    }
}
