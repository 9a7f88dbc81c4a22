#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use persist_batch::config::PersistConfig;
use persist_batch::persister::BatchPersister;
use persist_batch::time::TimeSource;
use report_common::metrics::{DurationMeasurement, MetricsError, MetricsSink};
use report_common::report::PersistBatchEvent;
use report_common::store::{MemoryStore, ReportStore, StoreError, TransactWrite};
use serde_json::{json, Value};

pub const TABLE: &str = "player-reports";

#[derive(Clone)]
pub struct FixedTime {
    pub time: DateTime<Utc>,
}

impl TimeSource for FixedTime {
    fn now(&self) -> DateTime<Utc> {
        self.time
    }
}

pub fn fixed_time(iso: &str) -> FixedTime {
    FixedTime {
        time: iso.parse().expect("invalid fixed time"),
    }
}

/// Wraps a `MemoryStore`, recording every request and failing the ones it was told to.
#[derive(Clone)]
pub struct FaultyStore {
    pub inner: MemoryStore,
    requests: Arc<Mutex<Vec<TransactWrite>>>,
    faults: Arc<Mutex<HashMap<usize, StoreError>>>,
}

impl FaultyStore {
    pub fn new(max_operations: usize) -> Self {
        Self {
            inner: MemoryStore::new(max_operations),
            requests: Arc::new(Mutex::new(Vec::new())),
            faults: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Fail the nth request (zero based) with the given error, without applying it.
    pub fn fail_request(&self, nth: usize, error: StoreError) {
        self.faults.lock().unwrap().insert(nth, error);
    }

    pub fn requests(&self) -> Vec<TransactWrite> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ReportStore for FaultyStore {
    async fn transact_write(&self, request: TransactWrite) -> Result<(), StoreError> {
        let nth = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len() - 1
        };

        let fault = self.faults.lock().unwrap().remove(&nth);
        match fault {
            Some(error) => Err(error),
            None => self.inner.transact_write(request).await,
        }
    }
}

#[derive(Clone, Default)]
pub struct RecordingSink {
    calls: Arc<Mutex<Vec<(String, Vec<DurationMeasurement>)>>>,
    pub fail: bool,
}

impl RecordingSink {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<(String, Vec<DurationMeasurement>)> {
        self.calls.lock().unwrap().clone()
    }

    /// The `Outcome` dimension of every published outcome measurement.
    pub fn outcomes(&self) -> Vec<String> {
        self.calls()
            .iter()
            .flat_map(|(_, measurements)| measurements.iter())
            .flat_map(|measurement| measurement.dimensions.iter())
            .filter(|dimension| dimension.name == "Outcome")
            .map(|dimension| dimension.value.clone())
            .collect()
    }
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
            Err(MetricsError::Unavailable("metrics endpoint is down".to_owned()))
        } else {
            Ok(())
        }
    }
}

pub struct Harness {
    pub store: FaultyStore,
    pub sink: RecordingSink,
    pub persister: BatchPersister,
}

impl Harness {
    pub fn new(config: PersistConfig) -> Self {
        Self::with_sink(config, RecordingSink::default())
    }

    pub fn with_sink(config: PersistConfig, sink: RecordingSink) -> Self {
        let store = FaultyStore::new(config.max_transaction_operations);
        let persister = BatchPersister::new(
            config,
            Arc::new(store.clone()),
            Arc::new(sink.clone()),
            Arc::new(fixed_time("2024-05-21T10:00:02.500Z")),
        );

        Self {
            store,
            sink,
            persister,
        }
    }
}

pub fn report(report_id: &str, player_id: &str) -> Value {
    json!({
        "reportId": report_id,
        "playerId": player_id,
        "coachId": "coach-1",
        "reportTimestamp": "2024-05-19T10:00:00Z",
        "categories": {"serving": "Consistent toss", "footwork": " quick "}
    })
}

pub fn event(reports: Vec<Value>) -> PersistBatchEvent {
    PersistBatchEvent {
        ingestion_id: Some(json!("ingest-42")),
        source_bucket: Some(json!("uploads")),
        source_key: Some(json!("reports/2024-05-21.csv")),
        correlation_id: Some(json!("corr-42")),
        ingest_started_at: Some(json!("2024-05-21T10:00:00Z")),
        trace_header: None,
        reports: Value::Array(reports),
    }
}

pub fn distinct_players(count: usize) -> PersistBatchEvent {
    event(
        (0..count)
            .map(|i| report(&format!("report-{i}"), &format!("player-{i}")))
            .collect(),
    )
}
