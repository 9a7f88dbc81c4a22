use std::sync::Arc;

use chrono::{DateTime, Utc};
use report_common::report::{Provenance, ReportRecord};
use report_common::store::{AuditEntry, ItemKey, ReportStore, TransactWrite, WriteOperation};
use report_common::timestamp::canonical;
use tracing::warn;

pub const ACTOR_ROLE: &str = "COACH";

/// Best-effort audit entries for newly persisted reports, written to a separate table.
#[derive(Clone)]
pub struct AuditTrail {
    store: Arc<dyn ReportStore>,
    table_name: String,
    max_operations: usize,
}

impl AuditTrail {
    pub fn new(store: Arc<dyn ReportStore>, table_name: &str, max_operations: usize) -> Self {
        Self {
            store,
            table_name: table_name.to_owned(),
            max_operations: max_operations.max(1),
        }
    }

    /// Write one entry per record. Failures are logged and never returned.
    pub async fn record(
        &self,
        records: &[&ReportRecord],
        provenance: &Provenance,
        persisted_at: &DateTime<Utc>,
    ) {
        let persisted_at = canonical(persisted_at);

        for chunk in records.chunks(self.max_operations) {
            let request = TransactWrite {
                table_name: self.table_name.clone(),
                operations: chunk
                    .iter()
                    .map(|record| {
                        WriteOperation::PutAudit(audit_entry(record, provenance, &persisted_at))
                    })
                    .collect(),
                return_cancellation_reasons: false,
            };

            if let Err(error) = self.store.transact_write(request).await {
                warn!(
                    table_name = %self.table_name,
                    entries = chunk.len(),
                    "failed to write audit entries: {}",
                    error
                );
            }
        }
    }
}

pub fn audit_entry(
    record: &ReportRecord,
    provenance: &Provenance,
    persisted_at: &str,
) -> AuditEntry {
    let mut attributes = vec![
        ("reportId".to_owned(), record.report_id.clone()),
        ("actorId".to_owned(), record.coach_id.clone()),
        ("actorRole".to_owned(), ACTOR_ROLE.to_owned()),
        ("createdAt".to_owned(), persisted_at.to_owned()),
    ];
    if let Some(ingestion_id) = &provenance.ingestion_id {
        attributes.push(("ingestionId".to_owned(), ingestion_id.clone()));
    }
    if let Some(correlation_id) = &provenance.correlation_id {
        attributes.push(("correlationId".to_owned(), correlation_id.clone()));
    }

    AuditEntry {
        key: ItemKey::new(
            format!("REPORT#{}", record.report_id),
            format!("AUDIT#{persisted_at}#PERSISTED"),
        ),
        attributes,
    }
}
