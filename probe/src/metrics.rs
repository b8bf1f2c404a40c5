use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub fn setup_metrics_recorder() -> PrometheusHandle {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)
        .unwrap()
        .install_recorder()
        .unwrap()
}

/// Add a `/metrics` route rendering the Prometheus recorder.
pub fn setup_metrics_routes(router: Router) -> Router {
    let handle = setup_metrics_recorder();
    router.route(
        "/metrics",
        get(move || std::future::ready(handle.render())),
    )
}

/// Record request count and latency per matched route.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };
    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!("probe_http_requests_total", &labels).increment(1);
    metrics::histogram!("probe_http_requests_duration_seconds", &labels).record(latency);

    response
}

pub fn report_skipped_record(topic: &str, cause: &'static str) {
    metrics::counter!(
        "probe_consumer_records_skipped_total",
        "topic" => topic.to_string(),
        "cause" => cause,
    )
    .increment(1);
}
