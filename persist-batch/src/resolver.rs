use report_common::report::{Provenance, ReportRecord};
use report_common::store::StoreError;
use tracing::{debug, warn};

use crate::error::{FailureDetail, WriteError};
use crate::writer::TransactionalWriter;

/// Tally of a group whose records were retried one at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryOutcome {
    /// Ids of the reports created by the retries.
    pub persisted: Vec<String>,
    pub skipped: usize,
    pub failures: Vec<FailureDetail>,
}

impl RetryOutcome {
    pub fn processed(&self) -> usize {
        self.persisted.len()
    }
}

/// What to do after a group write failed.
#[derive(Debug)]
pub enum Resolution {
    /// The group hit a duplicate and every record was retried on its own.
    Retried(RetryOutcome),
    /// The failure was not a duplicate. The rest of the batch must be abandoned.
    Fatal(StoreError),
}

/// Turns a failed group write into either per-record retries or a fatal error.
#[derive(Clone)]
pub struct ConflictResolver {
    writer: TransactionalWriter,
}

impl ConflictResolver {
    pub fn new(writer: TransactionalWriter) -> Self {
        Self { writer }
    }

    pub async fn resolve(
        &self,
        records: &[ReportRecord],
        provenance: &Provenance,
        error: WriteError,
    ) -> Resolution {
        match error {
            WriteError::Storage(error) => Resolution::Fatal(error),
            WriteError::DuplicateConflict(_) => {
                warn!(
                    group_size = records.len(),
                    "group hit an existing report, retrying records individually"
                );
                Resolution::Retried(self.retry_individually(records, provenance).await)
            }
        }
    }

    async fn retry_individually(
        &self,
        records: &[ReportRecord],
        provenance: &Provenance,
    ) -> RetryOutcome {
        let mut outcome = RetryOutcome::default();

        for record in records {
            match self
                .writer
                .write(std::slice::from_ref(record), provenance)
                .await
            {
                Ok(()) => outcome.persisted.push(record.report_id.clone()),
                Err(WriteError::DuplicateConflict(_)) => {
                    debug!(report_id = %record.report_id, "skipping already persisted report");
                    outcome.skipped += 1;
                }
                Err(WriteError::Storage(error)) => {
                    warn!(report_id = %record.report_id, "failed to persist report: {}", error);
                    outcome.failures.push(FailureDetail {
                        report_id: record.report_id.clone(),
                        message: error.to_string(),
                    });
                }
            }
        }

        outcome
    }
}
