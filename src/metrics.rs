//! Prometheus metrics.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides the request-metrics middleware,
//! and exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::warn;

use crate::api::ApiVersion;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "apiserver_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "apiserver_http_request_duration_seconds";

/// Watch events written to clients (counter). Labels: resource, type.
pub const WATCH_EVENTS_TOTAL: &str = "apiserver_watch_events_total";

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder.  Idempotent, so tests building
/// several routers share one recorder.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        if let Err(e) = metrics::set_global_recorder(recorder) {
            warn!("metrics recorder already installed: {}", e);
        }
        describe_metrics();
        handle
    })
}

fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(WATCH_EVENTS_TOTAL, "Watch events sent to clients");
}

// -- Metrics middleware -------------------------------------------------------

/// Records request count and latency for every request except `/metrics`.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

/// Count one watch event sent for `resource`.
pub fn record_watch_event(resource: &'static str, kind: &'static str) {
    counter!(WATCH_EVENTS_TOTAL, "resource" => resource, "type" => kind).increment(1);
}

// -- Path normalization -------------------------------------------------------

/// Collapse object names in a request path so labels stay low-cardinality.
///
/// Examples:
/// - `/healthz` -> `/healthz`
/// - `/api/v1beta1/services` -> `/api/v1beta1/services`
/// - `/api/v1beta1/services/web` -> `/api/v1beta1/services/{name}`
/// - `/api/v1beta2/watch/endpoints/web` -> `/api/v1beta2/watch/endpoints/{name}`
/// - `/anything/else` -> `/{other}`
fn normalize_path(path: &str) -> String {
    match path {
        "/" | "/healthz" | "/version" | "/metrics" => return path.to_string(),
        _ => {}
    }
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let Some(version) = segments
        .iter()
        .position(|s| s.parse::<ApiVersion>().is_ok())
    else {
        return "/{other}".to_string();
    };
    let resource_len = match segments.get(version + 1) {
        Some(&"watch") => 2,
        Some(_) => 1,
        None => 0,
    };
    let end = (version + 1 + resource_len).min(segments.len());
    let mut out = format!("/{}", segments[..end].join("/"));
    if segments.len() > end {
        out.push_str("/{name}");
    }
    out
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> impl IntoResponse {
    let body = init_metrics().render();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_support() {
        assert_eq!(normalize_path("/healthz"), "/healthz");
        assert_eq!(normalize_path("/version"), "/version");
    }

    #[test]
    fn test_normalize_path_collection() {
        assert_eq!(normalize_path("/api/v1beta1/services"), "/api/v1beta1/services");
        assert_eq!(normalize_path("/api/v1beta1"), "/api/v1beta1");
    }

    #[test]
    fn test_normalize_path_named() {
        assert_eq!(
            normalize_path("/api/v1beta1/services/web"),
            "/api/v1beta1/services/{name}"
        );
        assert_eq!(
            normalize_path("/api/v1beta2/watch/endpoints/web"),
            "/api/v1beta2/watch/endpoints/{name}"
        );
    }

    #[test]
    fn test_normalize_path_unknown() {
        assert_eq!(normalize_path("/favicon.ico"), "/{other}");
    }

    #[test]
    fn test_init_is_idempotent() {
        let a = init_metrics() as *const PrometheusHandle;
        let b = init_metrics() as *const PrometheusHandle;
        assert_eq!(a, b);
    }
}
