use std::sync::Arc;

use report_common::metrics::{Dimension, DurationMeasurement, MetricsSink};
use tracing::warn;

use crate::config::MetricsConfig;

pub const INGEST_DURATION: &str = "ingest_duration";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Partial,
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Partial => "partial",
            Outcome::Error => "error",
        }
    }
}

/// Best-effort emission of ingest duration measurements.
#[derive(Clone)]
pub struct MetricsPublisher {
    sink: Arc<dyn MetricsSink>,
    config: MetricsConfig,
}

impl MetricsPublisher {
    pub fn new(sink: Arc<dyn MetricsSink>, config: MetricsConfig) -> Self {
        Self { sink, config }
    }

    /// Publish the duration of an ingestion. Never fails: sink errors are logged and dropped.
    pub async fn publish(
        &self,
        duration_ms: Option<u64>,
        outcome: Outcome,
        correlation_id: Option<&str>,
    ) {
        let Some(duration_ms) = duration_ms else {
            return;
        };

        let measurements = self.measurements(duration_ms, outcome, correlation_id);
        if let Err(error) = self
            .sink
            .put_durations(&self.config.namespace, &measurements)
            .await
        {
            warn!("failed to publish {} metric: {}", INGEST_DURATION, error);
        }
    }

    pub fn measurements(
        &self,
        duration_ms: u64,
        outcome: Outcome,
        correlation_id: Option<&str>,
    ) -> Vec<DurationMeasurement> {
        let mut base = Vec::new();
        if let Some(service) = &self.config.service_name {
            base.push(Dimension::new("Service", service));
        }
        if let Some(stage) = &self.config.stage {
            base.push(Dimension::new("Stage", stage));
        }

        let mut detailed = base.clone();
        detailed.push(Dimension::new("Outcome", outcome.as_str()));
        if let Some(correlation_id) = correlation_id
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            detailed.push(Dimension::new("CorrelationId", correlation_id));
        }

        let milliseconds = duration_ms as f64;
        vec![
            DurationMeasurement {
                name: INGEST_DURATION.to_owned(),
                dimensions: base,
                milliseconds,
            },
            DurationMeasurement {
                name: format!("{INGEST_DURATION}_by_outcome"),
                dimensions: detailed,
                milliseconds,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use report_common::metrics::MetricsError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<(String, Vec<DurationMeasurement>)>>,
        fail: bool,
    }

    #[async_trait]
    impl MetricsSink for RecordingSink {
        async fn put_durations(
            &self,
            namespace: &str,
            measurements: &[DurationMeasurement],
        ) -> Result<(), MetricsError> {
            self.calls
                .lock()
                .unwrap()
                .push((namespace.to_owned(), measurements.to_vec()));
            if self.fail {
                Err(MetricsError::Unavailable("offline".to_owned()))
            } else {
                Ok(())
            }
        }
    }

    fn config() -> MetricsConfig {
        MetricsConfig {
            namespace: "reports".to_owned(),
            service_name: Some("ingest".to_owned()),
            stage: None,
        }
    }

    #[tokio::test]
    async fn test_publishes_primary_and_outcome_measurements() {
        let sink = Arc::new(RecordingSink::default());
        let publisher = MetricsPublisher::new(sink.clone(), config());

        publisher
            .publish(Some(1200), Outcome::Partial, Some(" corr-9 "))
            .await;

        let calls = sink.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (namespace, measurements) = &calls[0];
        assert_eq!(namespace, "reports");
        assert_eq!(
            measurements[0],
            DurationMeasurement {
                name: "ingest_duration".to_owned(),
                dimensions: vec![Dimension::new("Service", "ingest")],
                milliseconds: 1200.0,
            }
        );
        assert_eq!(measurements[1].name, "ingest_duration_by_outcome");
        assert_eq!(
            measurements[1].dimensions,
            vec![
                Dimension::new("Service", "ingest"),
                Dimension::new("Outcome", "partial"),
                Dimension::new("CorrelationId", "corr-9"),
            ]
        );
    }

    #[tokio::test]
    async fn test_nothing_is_published_without_a_duration() {
        let sink = Arc::new(RecordingSink::default());
        let publisher = MetricsPublisher::new(sink.clone(), config());

        publisher.publish(None, Outcome::Success, None).await;

        assert!(sink.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sink_failures_are_absorbed() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let publisher = MetricsPublisher::new(sink.clone(), config());

        publisher.publish(Some(5), Outcome::Error, None).await;

        assert_eq!(sink.calls.lock().unwrap().len(), 1);
    }
}
