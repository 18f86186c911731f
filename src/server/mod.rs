//! HTTP surface over the coordinator.

pub mod api;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::HttpConfig;
use crate::coordinator::Coordinator;

pub use api::{AppState, SharedState};

pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `cancel` fires, then stop accepting and finish open requests.
pub async fn start_server(
    config: &HttpConfig,
    coordinator: Arc<Coordinator>,
    cancel: CancellationToken,
) -> Result<()> {
    let app = build_router(Arc::new(AppState { coordinator }));

    let addr = format!("{}:{}", config.ip, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "http server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("Server error")?;

    tracing::info!("http server shut down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    const CONFIG: &str = r#"
projects:
  - project_name: helix
    scripts_path: /opt/scripts/
    git: { work_dir: /srv/helix/git }
    svn: { work_dir: /srv/helix/svn, url: svn.internal }
    ftp: { host: ftp.internal }
"#;

    fn test_router() -> Router {
        let config = Config::from_yaml(CONFIG).unwrap();
        let coordinator = Arc::new(Coordinator::from_config(&config));
        build_router(Arc::new(AppState { coordinator }))
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unrouted_path_is_404() {
        let req = Request::builder().uri("/nope").body(Body::empty()).unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_server_stops_on_cancel() {
        let config = Config::from_yaml(CONFIG).unwrap();
        let coordinator = Arc::new(Coordinator::from_config(&config));
        let http = HttpConfig {
            ip: "127.0.0.1".into(),
            port: 0,
        };
        let cancel = CancellationToken::new();
        let server = tokio::spawn({
            let cancel = cancel.clone();
            async move { start_server(&http, coordinator, cancel).await }
        });

        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
