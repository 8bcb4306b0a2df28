use axum::{Json, extract::State, response::IntoResponse};

use crate::AppState;
use crate::metrics;

/// Health check endpoint - returns server status
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.registry.session_count().await as u64;
    let metrics = state.metrics.snapshot();

    let status = if metrics.errors.pty == 0 {
        "healthy"
    } else {
        "degraded"
    };

    Json(metrics::HealthStatus {
        status: status.to_string(),
        sessions,
        connections: metrics.connections.active,
        uptime_secs: metrics.uptime_secs,
    })
}

/// Metrics endpoint - returns detailed server metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

/// Liveness check - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request, http::StatusCode};
    use tower::ServiceExt;

    use crate::metrics::{HealthStatus, MetricsSnapshot};
    use crate::test_helpers::test_app_state;

    async fn get(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let (state, _spawner, tmp) = test_app_state();
        state.registry.create("alice", tmp.path(), None).await.unwrap();
        let (status, body) = get(crate::app_router(state), "/health").await;
        assert_eq!(status, StatusCode::OK);
        let health: HealthStatus = serde_json::from_value(body).unwrap();
        assert_eq!(health.status, "healthy");
        assert_eq!(health.sessions, 1);
        assert_eq!(health.connections, 0);
    }

    #[tokio::test]
    async fn test_live_endpoint() {
        let (state, _spawner, _tmp) = test_app_state();
        let (status, body) = get(crate::app_router(state), "/health/live").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "alive");
    }

    #[tokio::test]
    async fn test_metrics_counts_sessions() {
        let (state, _spawner, tmp) = test_app_state();
        let id = state
            .registry
            .create("alice", tmp.path(), None)
            .await
            .unwrap()
            .session_id;
        state.registry.destroy(&id, None).await.unwrap();

        let (status, body) = get(crate::app_router(state), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        let snapshot: MetricsSnapshot = serde_json::from_value(body).unwrap();
        assert_eq!(snapshot.sessions.total_created, 1);
        assert_eq!(snapshot.sessions.destroyed, 1);
        assert_eq!(snapshot.sessions.active, 0);
    }
}
