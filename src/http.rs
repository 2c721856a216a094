use crate::metrics::Metrics;
use crate::poller::PollState;
use crate::snapshot::{DashboardSnapshot, SystemStatus};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone, Default)]
pub struct ViewReceivers {
    pub dashboard: Option<watch::Receiver<PollState<DashboardSnapshot>>>,
    pub system: Option<watch::Receiver<PollState<SystemStatus>>>,
}

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub views: ViewReceivers,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiView {
    pub dashboard: Option<PollState<DashboardSnapshot>>,
    pub system: Option<PollState<SystemStatus>>,
}

impl From<&ViewReceivers> for ApiView {
    fn from(value: &ViewReceivers) -> Self {
        Self {
            dashboard: value.dashboard.as_ref().map(|rx| rx.borrow().clone()),
            system: value.system.as_ref().map(|rx| rx.borrow().clone()),
        }
    }
}

pub fn build_router(metrics: Arc<Metrics>, views: ViewReceivers) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/view", get(view_handler))
        .with_state(HttpAppState { metrics, views })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    if let Some(rx) = state.views.dashboard.as_ref() {
        state.metrics.update_dashboard(&rx.borrow());
    }
    if let Some(rx) = state.views.system.as_ref() {
        state.metrics.update_system(&rx.borrow());
    }

    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка кодирования метрик: {err}"),
        )
            .into_response(),
    }
}

async fn view_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    Json(ApiView::from(&state.views))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::fixtures;
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    fn views_with_dashboard() -> (
        ViewReceivers,
        watch::Sender<PollState<DashboardSnapshot>>,
    ) {
        let (tx, rx) = watch::channel(PollState::default());
        (
            ViewReceivers {
                dashboard: Some(rx),
                system: None,
            },
            tx,
        )
    }

    async fn get_text(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let metrics = Metrics::new().expect("инициализация метрик");
        let app = build_router(metrics, ViewReceivers::default());

        let (status, body) = get_text(app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn metrics_reflect_current_view() {
        let metrics = Metrics::new().expect("инициализация метрик");
        let (views, tx) = views_with_dashboard();
        tx.send_modify(|s| s.apply_success(fixtures::dashboard(23.4, 67.0, 45.0), 10));
        let app = build_router(metrics, views);

        let (status, text) = get_text(app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("panel_memory_usage_percent 67"));
        assert!(text.contains("panelwatch_scrape_count_total 1"));
    }

    #[tokio::test]
    async fn api_view_returns_json() {
        let metrics = Metrics::new().expect("инициализация метрик");
        let (views, tx) = views_with_dashboard();
        tx.send_modify(|s| s.apply_success(fixtures::dashboard(23.4, 67.0, 45.0), 10));
        let app = build_router(metrics, views);

        let (status, text) = get_text(app, "/api/view").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["dashboard"]["snapshot"]["system"]["cpu_usage"], 23.4);
        assert_eq!(json["dashboard"]["successes"], 1);
        assert!(json["system"].is_null());
    }
}
