//! Read-only status HTTP server.
//!
//! Serves version and FSM snapshot endpoints. Handlers parse the on-disk
//! configuration and state fresh on every request; staleness is bounded by
//! the reconcile tick interval, so no cache is kept. Routing scans the full
//! table and unknown paths get a plain 404.

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use pgautoctl_core::config::{FileRole, KeeperConfig};
use pgautoctl_core::state::StateStore;
use pgautoctl_core::{EXTENSION_VERSION, HTTP_API_VERSION, KEEPER_VERSION};
use serde_json::json;
use tracing::{debug, info};

/// Context shared by every handler: where the keeper files live.
#[derive(Debug, Clone)]
pub struct HttpdContext {
    /// Data directory the keeper manages.
    pub pgdata: PathBuf,
}

/// Build the status router for a data directory.
#[must_use]
pub fn router(pgdata: PathBuf) -> Router {
    let context = Arc::new(HttpdContext { pgdata });

    Router::new()
        .route("/", get(home))
        .route("/versions", get(versions))
        .route("/1.0/state", get(liveness))
        .route("/1.0/fsm/state", get(fsm_state))
        .with_state(context)
}

/// Bind and serve until the task is aborted.
///
/// # Errors
///
/// Returns the bind or accept error verbatim; the supervisor decides
/// whether to restart.
pub async fn serve(
    listen_address: &str,
    port: u16,
    pgdata: PathBuf,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind((listen_address, port)).await?;
    info!("HTTP server started at http://{listen_address}:{port}/");

    axum::serve(listener, router(pgdata)).await
}

async fn home() -> &'static str {
    "Hello, world!\n"
}

async fn liveness() -> &'static str {
    "Ok\n"
}

async fn versions() -> String {
    format!(
        "pg_autoctl {KEEPER_VERSION}\n\
         pgautofailover extension {EXTENSION_VERSION}\n\
         pg_autoctl web API {HTTP_API_VERSION}\n"
    )
}

/// The FSM snapshot, parsed from disk per request.
async fn fsm_state(State(context): State<Arc<HttpdContext>>) -> Response {
    debug!(pgdata = ?context.pgdata, "serving fsm state");

    let pathnames =
        pgautoctl_core::config::Pathnames::from_pgdata(&context.pgdata);

    let config = match KeeperConfig::load(&pathnames.config) {
        Ok(config) => config,
        Err(e) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("unreadable configuration file {:?}: {e}\n", pathnames.config),
            )
                .into_response();
        }
    };

    if config.pg_autoctl.role == FileRole::Monitor {
        return (StatusCode::SERVICE_UNAVAILABLE, "Not yet implemented\n").into_response();
    }

    match StateStore::new(&pathnames.state).read() {
        Ok(state) => {
            let body = json!({
                "postgres": {
                    "version": state.pg_version,
                    "pg_control_version": state.pg_control_version,
                    "system_identifier": state.system_identifier,
                },
                "fsm": {
                    "current_role": state.current_role,
                    "assigned_role": state.assigned_role,
                },
                "monitor": {
                    "current_node_id": state.current_node_id,
                    "current_group": state.current_group,
                },
            });
            axum::Json(body).into_response()
        }
        Err(e) => {
            // A snapshot we cannot read is reported as a structured error,
            // never as uninitialized output.
            let body = json!({
                "error": {
                    "kind": e.kind(),
                    "message": e.to_string(),
                },
            });
            (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(body)).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use pgautoctl_core::NodeState;
    use pgautoctl_core::config::{
        ControlSection, HttpdSection, PostgresSection, ReplicationSection, TimeoutSection,
    };
    use pgautoctl_core::state::KeeperState;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, role: FileRole) {
        let config = KeeperConfig {
            pg_autoctl: ControlSection {
                role,
                formation: "default".into(),
                nodename: "node-a".into(),
                monitor: "postgres://autoctl_node@monitor/pg_auto_failover".into(),
            },
            postgresql: PostgresSection {
                pgdata: dir.path().to_path_buf(),
                pgport: 5432,
                auth_method: "trust".into(),
            },
            replication: ReplicationSection::default(),
            timeout: TimeoutSection::default(),
            httpd: HttpdSection::default(),
        };
        config
            .save(&dir.path().join("pg_autoctl.cfg"))
            .unwrap();
    }

    fn write_state(dir: &TempDir) {
        let mut state = KeeperState::new();
        state.current_node_id = 4;
        state.current_group = 0;
        state.current_role = NodeState::Primary;
        state.assigned_role = NodeState::Primary;
        state.pg_version = 160_004;

        StateStore::new(dir.path().join("pg_autoctl.state"))
            .write(&state)
            .unwrap();
    }

    async fn body_of(response: Response) -> (StatusCode, String) {
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_home_and_liveness_bodies() {
        assert_eq!(home().await, "Hello, world!\n");
        assert_eq!(liveness().await, "Ok\n");
    }

    #[tokio::test]
    async fn test_versions_has_three_lines() {
        let body = versions().await;
        assert_eq!(body.lines().count(), 3);
        assert!(body.starts_with("pg_autoctl "));
        assert!(body.contains("pgautofailover extension"));
        assert!(body.contains("web API"));
    }

    #[tokio::test]
    async fn test_fsm_state_snapshot() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, FileRole::Keeper);
        write_state(&dir);

        let context = Arc::new(HttpdContext {
            pgdata: dir.path().to_path_buf(),
        });
        let (status, body) = body_of(fsm_state(State(context)).await).await;

        assert_eq!(status, StatusCode::OK);
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["fsm"]["current_role"], "primary");
        assert_eq!(parsed["fsm"]["assigned_role"], "primary");
        assert_eq!(parsed["monitor"]["current_node_id"], 4);
        assert_eq!(parsed["monitor"]["current_group"], 0);
        assert_eq!(parsed["postgres"]["version"], 160_004);
    }

    #[tokio::test]
    async fn test_fsm_state_monitor_role_is_503() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, FileRole::Monitor);

        let context = Arc::new(HttpdContext {
            pgdata: dir.path().to_path_buf(),
        });
        let (status, body) = body_of(fsm_state(State(context)).await).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "Not yet implemented\n");
    }

    #[tokio::test]
    async fn test_fsm_state_unreadable_state_is_error_json() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, FileRole::Keeper);
        std::fs::write(dir.path().join("pg_autoctl.state"), b"garbage").unwrap();

        let context = Arc::new(HttpdContext {
            pgdata: dir.path().to_path_buf(),
        });
        let (status, body) = body_of(fsm_state(State(context)).await).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["error"]["kind"], "StateCorrupt");
        assert!(!parsed["error"]["message"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_config_is_503() {
        let dir = TempDir::new().unwrap();

        let context = Arc::new(HttpdContext {
            pgdata: dir.path().to_path_buf(),
        });
        let (status, _) = body_of(fsm_state(State(context)).await).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        use tower::util::ServiceExt;

        let dir = TempDir::new().unwrap();
        let app = router(dir.path().to_path_buf());

        let request = axum::http::Request::builder()
            .uri("/no/such/route")
            .body(axum::body::Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
