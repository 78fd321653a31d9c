use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};

/// Routed commands are a single local RTT to a backend plus queue time, so
/// the latency buckets start well under a millisecond; the top end covers a
/// distributed get stalled on a slow peer.
const DURATION_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

pub fn build_router() -> axum::Router<()> {
    use axum::routing::get;

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .expect("bucket list is non-empty")
        .install_recorder()
        .expect("failed to install prometheus recorder");

    axum::Router::new()
        .route(
            "/metrics",
            get(move || std::future::ready((axum::http::StatusCode::OK, handle.render()))),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
