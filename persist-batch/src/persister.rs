use std::collections::HashSet;
use std::sync::Arc;

use metrics::counter;
use report_common::metrics::MetricsSink;
use report_common::report::{normalize, PersistBatchEvent, Provenance, ReportRecord};
use report_common::store::{ReportStore, StoreError};
use tracing::{error, info, instrument};

use crate::audit::AuditTrail;
use crate::config::PersistConfig;
use crate::error::{FailureDetail, PersistError, PersistSummary};
use crate::planner::{plan_groups, TransactionGroup};
use crate::publisher::{MetricsPublisher, Outcome};
use crate::resolver::{ConflictResolver, Resolution};
use crate::time::{elapsed_ms, TimeSource};
use crate::writer::TransactionalWriter;

/// Persists normalized report batches exactly once, group by group.
#[derive(Clone)]
pub struct BatchPersister {
    config: PersistConfig,
    writer: TransactionalWriter,
    resolver: ConflictResolver,
    publisher: MetricsPublisher,
    audit: Option<AuditTrail>,
    timesource: Arc<dyn TimeSource>,
}

/// Work accumulated while walking the groups of a batch.
struct Progress<'a> {
    summary: PersistSummary,
    failures: Vec<FailureDetail>,
    persisted: Vec<&'a ReportRecord>,
}

impl BatchPersister {
    pub fn new(
        config: PersistConfig,
        store: Arc<dyn ReportStore>,
        metrics_sink: Arc<dyn MetricsSink>,
        timesource: Arc<dyn TimeSource>,
    ) -> Self {
        let writer = TransactionalWriter::new(store.clone(), &config.table_name);
        let audit = config.audit_table_name.as_deref().map(|table_name| {
            AuditTrail::new(store, table_name, config.max_transaction_operations)
        });

        Self {
            resolver: ConflictResolver::new(writer.clone()),
            publisher: MetricsPublisher::new(metrics_sink, config.metrics.clone()),
            writer,
            audit,
            timesource,
            config,
        }
    }

    #[instrument(
        skip_all,
        fields(correlation_id, ingestion_id, trace_header, batch_size)
    )]
    pub async fn persist(&self, event: &PersistBatchEvent) -> Result<PersistSummary, PersistError> {
        let batch = normalize(event)?;
        let provenance = &batch.provenance;

        let span = tracing::Span::current();
        span.record("correlation_id", provenance.correlation_id.as_deref());
        span.record("ingestion_id", provenance.ingestion_id.as_deref());
        span.record("trace_header", provenance.trace_header.as_deref());
        span.record("batch_size", batch.records.len());

        let total = batch.records.len();
        let groups = plan_groups(batch.records, self.config.records_per_group());
        let mut progress = Progress {
            summary: PersistSummary::new(
                &self.config.table_name,
                total,
                provenance.correlation_id.clone(),
            ),
            failures: Vec::new(),
            persisted: Vec::new(),
        };

        for (index, group) in groups.iter().enumerate() {
            if let Err(error) = self.persist_group(group, provenance, &mut progress).await {
                error!(group = index, groups = groups.len(), "aborting batch: {}", error);
                let mut failures = progress.failures;
                failures.extend(group.records().iter().map(|record| FailureDetail {
                    report_id: record.report_id.clone(),
                    message: error.to_string(),
                }));
                counter!("persist_batch_reports_total", "outcome" => "failed")
                    .increment(failures.len() as u64);

                self.record_audit(&progress.persisted, provenance).await;
                let summary = self
                    .finish(progress.summary, provenance, Outcome::Error)
                    .await;
                return Err(PersistError::Storage {
                    message: error.to_string(),
                    failures,
                    summary,
                });
            }
        }

        self.record_audit(&progress.persisted, provenance).await;

        let Progress {
            summary, failures, ..
        } = progress;

        if !failures.is_empty() {
            counter!("persist_batch_reports_total", "outcome" => "failed")
                .increment(failures.len() as u64);
            error!(failed = failures.len(), "failed to persist one or more reports");
            let summary = self.finish(summary, provenance, Outcome::Error).await;
            return Err(PersistError::Storage {
                message: "Failed to persist one or more reports".to_owned(),
                failures,
                summary,
            });
        }

        let outcome = if summary.skipped > 0 {
            Outcome::Partial
        } else {
            Outcome::Success
        };
        let summary = self.finish(summary, provenance, outcome).await;
        info!(
            total = summary.total,
            processed = summary.processed,
            skipped = summary.skipped,
            "persisted batch"
        );

        Ok(summary)
    }

    /// Write one group, falling back to per-record retries on duplicates.
    /// Returns an error only when the rest of the batch must be abandoned.
    async fn persist_group<'a>(
        &self,
        group: &'a TransactionGroup,
        provenance: &Provenance,
        progress: &mut Progress<'a>,
    ) -> Result<(), StoreError> {
        let error = match self.writer.write(group.records(), provenance).await {
            Ok(()) => {
                counter!("persist_batch_reports_total", "outcome" => "processed")
                    .increment(group.len() as u64);
                progress.summary.processed += group.len();
                progress.persisted.extend(group.records());
                return Ok(());
            }
            Err(error) => error,
        };

        match self.resolver.resolve(group.records(), provenance, error).await {
            Resolution::Fatal(error) => Err(error),
            Resolution::Retried(outcome) => {
                counter!("persist_batch_reports_total", "outcome" => "processed")
                    .increment(outcome.processed() as u64);
                counter!("persist_batch_reports_total", "outcome" => "skipped")
                    .increment(outcome.skipped as u64);

                let persisted: HashSet<&str> =
                    outcome.persisted.iter().map(String::as_str).collect();
                progress.persisted.extend(
                    group
                        .records()
                        .iter()
                        .filter(|record| persisted.contains(record.report_id.as_str())),
                );
                progress.summary.processed += outcome.processed();
                progress.summary.skipped += outcome.skipped;
                progress.failures.extend(outcome.failures);
                Ok(())
            }
        }
    }

    /// Stamp the ingest duration on a finalized summary and publish it.
    async fn finish(
        &self,
        mut summary: PersistSummary,
        provenance: &Provenance,
        outcome: Outcome,
    ) -> PersistSummary {
        summary.ingest_duration_ms = provenance
            .ingest_started_at
            .as_ref()
            .map(|started_at| elapsed_ms(started_at, &self.timesource.now()));

        self.publisher
            .publish(
                summary.ingest_duration_ms,
                outcome,
                summary.correlation_id.as_deref(),
            )
            .await;

        summary
    }

    async fn record_audit(&self, persisted: &[&ReportRecord], provenance: &Provenance) {
        let Some(audit) = &self.audit else {
            return;
        };
        if persisted.is_empty() {
            return;
        }

        audit
            .record(persisted, provenance, &self.timesource.now())
            .await;
    }
}
