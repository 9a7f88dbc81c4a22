use std::time::Instant;

use async_trait::async_trait;
use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics::Label;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use thiserror::Error;

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Add the metrics endpoint and the request-tracking middleware to a `Router`.
pub fn setup_metrics_routes(router: Router, recorder_handle: PrometheusHandle) -> Router {
    router
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .install_recorder()
}

/// Middleware to record some common HTTP metrics
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    // Run the rest of the request handling first, so we can measure it and get response
    // codes.
    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetricsError {
    #[error("metrics sink rejected the measurements: {0}")]
    Rejected(String),
    #[error("metrics sink is unavailable: {0}")]
    Unavailable(String),
}

/// A named dimension attached to a measurement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dimension {
    pub name: String,
    pub value: String,
}

impl Dimension {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A single duration data point, in milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct DurationMeasurement {
    pub name: String,
    pub dimensions: Vec<Dimension>,
    pub milliseconds: f64,
}

/// Destination for custom duration metrics.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn put_durations(
        &self,
        namespace: &str,
        measurements: &[DurationMeasurement],
    ) -> Result<(), MetricsError>;
}

/// Dimensions that identify a single invocation. Each distinct value would create a new
/// series that the recorder keeps forever, so they are left to spans and logs.
const PER_INVOCATION_DIMENSIONS: &[&str] = &["CorrelationId"];

/// Records measurements as histograms in the globally installed `metrics` recorder.
#[derive(Clone, Default)]
pub struct PrometheusSink {}

impl PrometheusSink {
    fn record(
        &self,
        namespace: &str,
        measurements: &[DurationMeasurement],
    ) -> Result<(), MetricsError> {
        for measurement in measurements {
            if !measurement.milliseconds.is_finite() {
                return Err(MetricsError::Rejected(format!(
                    "{} is not a finite duration",
                    measurement.name
                )));
            }

            let mut labels = vec![Label::new("namespace", namespace.to_owned())];
            labels.extend(
                measurement
                    .dimensions
                    .iter()
                    .filter(|dimension| !PER_INVOCATION_DIMENSIONS.contains(&dimension.name.as_str()))
                    .map(|dimension| {
                        Label::new(dimension.name.to_lowercase(), dimension.value.clone())
                    }),
            );

            metrics::histogram!(measurement.name.clone(), labels).record(measurement.milliseconds);
        }

        Ok(())
    }
}

#[async_trait]
impl MetricsSink for PrometheusSink {
    async fn put_durations(
        &self,
        namespace: &str,
        measurements: &[DurationMeasurement],
    ) -> Result<(), MetricsError> {
        self.record(namespace, measurements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prometheus_sink_accepts_measurements() {
        let sink = PrometheusSink::default();
        let measurements = [DurationMeasurement {
            name: "ingest_duration".to_owned(),
            dimensions: vec![Dimension::new("Service", "reports")],
            milliseconds: 1500.0,
        }];

        // Without an installed recorder the macros are no-ops.
        sink.put_durations("persist-batch", &measurements)
            .await
            .expect("failed to record");
    }

    #[test]
    fn test_prometheus_sink_keeps_one_series_per_outcome() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let sink = PrometheusSink::default();

        metrics::with_local_recorder(&recorder, || {
            for i in 0..20 {
                let measurements = [DurationMeasurement {
                    name: "ingest_duration_by_outcome".to_owned(),
                    dimensions: vec![
                        Dimension::new("Outcome", "success"),
                        Dimension::new("CorrelationId", format!("corr-{i}")),
                    ],
                    milliseconds: 100.0 + f64::from(i),
                }];
                sink.record("persist-batch", &measurements)
                    .expect("failed to record");
            }
        });

        let rendered = handle.render();
        let series: Vec<&str> = rendered
            .lines()
            .filter(|line| line.starts_with("ingest_duration_by_outcome_count"))
            .collect();
        assert_eq!(series.len(), 1, "{rendered}");
        assert!(series[0].contains("outcome=\"success\""));
        assert!(series[0].ends_with(" 20"));
        assert!(!rendered.contains("corr-"));
    }

    #[tokio::test]
    async fn test_prometheus_sink_rejects_non_finite_values() {
        let sink = PrometheusSink::default();
        let measurements = [DurationMeasurement {
            name: "ingest_duration".to_owned(),
            dimensions: vec![],
            milliseconds: f64::NAN,
        }];

        let error = sink
            .put_durations("persist-batch", &measurements)
            .await
            .unwrap_err();
        assert!(matches!(error, MetricsError::Rejected(_)));
    }
}
