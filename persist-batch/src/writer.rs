use std::sync::Arc;

use report_common::report::{Provenance, ReportRecord};
use report_common::store::{
    AggregateUpdate, ItemKey, ReportItem, ReportStore, TransactWrite, WriteOperation,
};

use crate::error::WriteError;

pub const REPORT_ENTITY: &str = "REPORT";
pub const PROFILE_ENTITY: &str = "PLAYER_PROFILE";

/// Issues one atomic write per group of records.
#[derive(Clone)]
pub struct TransactionalWriter {
    store: Arc<dyn ReportStore>,
    table_name: String,
}

impl TransactionalWriter {
    pub fn new(store: Arc<dyn ReportStore>, table_name: &str) -> Self {
        Self {
            store,
            table_name: table_name.to_owned(),
        }
    }

    /// Create each record's report item and upsert its player aggregate, all or nothing.
    pub async fn write(
        &self,
        records: &[ReportRecord],
        provenance: &Provenance,
    ) -> Result<(), WriteError> {
        let request = TransactWrite {
            table_name: self.table_name.clone(),
            operations: operations(records, provenance),
            return_cancellation_reasons: true,
        };

        let result = self.store.transact_write(request).await.map_err(WriteError::from);

        let label = match &result {
            Ok(()) => "committed",
            Err(WriteError::DuplicateConflict(_)) => "duplicate",
            Err(WriteError::Storage(_)) => "failed",
        };
        metrics::counter!("persist_batch_transactions_total", "result" => label).increment(1);

        result
    }
}

pub fn operations(records: &[ReportRecord], provenance: &Provenance) -> Vec<WriteOperation> {
    records
        .iter()
        .flat_map(|record| {
            [
                WriteOperation::CreateReport(report_item(record, provenance)),
                WriteOperation::UpsertAggregate(aggregate_update(record, provenance)),
            ]
        })
        .collect()
}

pub fn player_partition_key(player_id: &str) -> String {
    format!("PLAYER#{player_id}")
}

pub fn profile_key(player_id: &str) -> ItemKey {
    ItemKey::new(
        player_partition_key(player_id),
        format!("PROFILE#{player_id}"),
    )
}

pub fn report_item(record: &ReportRecord, provenance: &Provenance) -> ReportItem {
    let report_key = format!("REPORT#{}", record.report_id);
    let team_key = record.team_id.as_ref().map(|team_id| format!("TEAM#{team_id}"));

    ReportItem {
        pk: player_partition_key(&record.player_id),
        sk: record.sort_key.clone(),
        report_id: record.report_id.clone(),
        player_id: record.player_id.clone(),
        coach_id: record.coach_id.clone(),
        report_timestamp: record.report_timestamp.clone(),
        report_timestamp_key: record.report_timestamp_key.clone(),
        created_at: record.created_at.clone(),
        categories: record.categories.clone(),
        entity_type: REPORT_ENTITY.to_owned(),
        ingestion_id: provenance.ingestion_id.clone(),
        source_bucket: provenance.source_bucket.clone(),
        source_key: provenance.source_key.clone(),
        correlation_id: provenance.correlation_id.clone(),
        ingest_started_at: provenance.ingest_started_at_canonical(),
        gsi1_pk: report_key.clone(),
        gsi1_sk: report_key,
        team_id: record.team_id.clone(),
        gsi2_pk: team_key.clone(),
        gsi2_sk: team_key.and(record.team_sort_key.clone()),
        player_email: record.player_email.clone(),
        player_name: record.player_name.clone(),
    }
}

/// Count the report and move the "last report" pointers. Pointers are last-write-wins,
/// identity fields are first-write-wins.
pub fn aggregate_update(record: &ReportRecord, provenance: &Provenance) -> AggregateUpdate {
    let mut set = vec![
        ("lastReportId".to_owned(), record.report_id.clone()),
        ("lastReportSk".to_owned(), record.sort_key.clone()),
        ("lastCoachId".to_owned(), record.coach_id.clone()),
        ("lastReportAt".to_owned(), record.report_timestamp.clone()),
        ("lastReportKey".to_owned(), record.report_timestamp_key.clone()),
        ("updatedAt".to_owned(), record.created_at.clone()),
    ];
    let latest = [
        ("lastIngestionId", provenance.ingestion_id.clone()),
        ("lastCorrelationId", provenance.correlation_id.clone()),
        ("lastSourceBucket", provenance.source_bucket.clone()),
        ("lastSourceKey", provenance.source_key.clone()),
        ("lastIngestStartedAt", provenance.ingest_started_at_canonical()),
    ];
    set.extend(
        latest
            .into_iter()
            .filter_map(|(name, value)| value.map(|value| (name.to_owned(), value))),
    );

    let mut set_if_absent = vec![
        ("entityType".to_owned(), PROFILE_ENTITY.to_owned()),
        ("playerId".to_owned(), record.player_id.clone()),
    ];
    let identity = [
        ("playerEmail", &record.player_email),
        ("playerName", &record.player_name),
        ("teamId", &record.team_id),
    ];
    set_if_absent.extend(
        identity
            .into_iter()
            .filter_map(|(name, value)| value.clone().map(|value| (name.to_owned(), value))),
    );

    AggregateUpdate {
        key: profile_key(&record.player_id),
        increments: vec![("reportCount".to_owned(), 1)],
        set,
        set_if_absent,
    }
}
