use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::config::Region;
use aws_sdk_dynamodb::error::DisplayErrorContext;
use aws_sdk_dynamodb::operation::transact_write_items::TransactWriteItemsError;
use aws_sdk_dynamodb::types::{
    AttributeValue, Put, ReturnValuesOnConditionCheckFailure, TransactWriteItem, Update,
};
use aws_sdk_dynamodb::Client;
use serde_json::Value;
use tracing::debug;

use crate::store::{
    report_attributes, AggregateUpdate, AuditEntry, CancellationReason, ItemKey, ReportItem,
    ReportStore, StoreError, TransactWrite, WriteOperation,
};

/// Create-only condition placed on every report item.
const CREATE_ONLY: &str = "attribute_not_exists(PK) AND attribute_not_exists(SK)";

/// Connection settings for a DynamoDB-backed store.
#[derive(Debug, Clone)]
pub struct DynamoConfig {
    pub region: String,
    pub endpoint_url: Option<String>,
    pub max_attempts: u32,
    pub operation_timeout: Duration,
}

/// A `ReportStore` that issues `TransactWriteItems` requests.
#[derive(Clone)]
pub struct DynamoStore {
    client: Client,
}

impl DynamoStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn from_config(config: &DynamoConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .retry_config(RetryConfig::standard().with_max_attempts(config.max_attempts))
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(config.operation_timeout)
                    .build(),
            );
        if let Some(endpoint_url) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint_url);
        }

        let sdk_config = loader.load().await;
        Self::new(Client::new(&sdk_config))
    }
}

#[async_trait]
impl ReportStore for DynamoStore {
    async fn transact_write(&self, request: TransactWrite) -> Result<(), StoreError> {
        let operation_count = request.operations.len();
        let items = request
            .operations
            .iter()
            .map(|operation| {
                transact_item(
                    &request.table_name,
                    operation,
                    request.return_cancellation_reasons,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            table_name = %request.table_name,
            operation_count, "sending TransactWriteItems"
        );

        self.client
            .transact_write_items()
            .set_transact_items(Some(items))
            .send()
            .await
            .map(|_| ())
            .map_err(|error| map_service_error(error.into_service_error()))
    }
}

fn map_service_error(error: TransactWriteItemsError) -> StoreError {
    match error {
        TransactWriteItemsError::TransactionCanceledException(canceled) => {
            StoreError::TransactionCanceled {
                message: canceled.message().unwrap_or_default().to_owned(),
                reasons: canceled
                    .cancellation_reasons()
                    .iter()
                    .map(|reason| CancellationReason {
                        code: reason.code().map(str::to_owned),
                        message: reason.message().map(str::to_owned),
                    })
                    .collect(),
            }
        }
        TransactWriteItemsError::ProvisionedThroughputExceededException(e) => {
            StoreError::ThroughputExceeded(e.to_string())
        }
        TransactWriteItemsError::RequestLimitExceeded(e) => {
            StoreError::ThroughputExceeded(e.to_string())
        }
        TransactWriteItemsError::ResourceNotFoundException(e) => {
            StoreError::ResourceNotFound(e.to_string())
        }
        other => StoreError::Request(DisplayErrorContext(&other).to_string()),
    }
}

fn transact_item(
    table_name: &str,
    operation: &WriteOperation,
    return_reasons: bool,
) -> Result<TransactWriteItem, StoreError> {
    let item = match operation {
        WriteOperation::CreateReport(report) => {
            TransactWriteItem::builder().put(create_put(table_name, report, return_reasons)?)
        }
        WriteOperation::UpsertAggregate(update) => {
            TransactWriteItem::builder().update(aggregate_update(table_name, update)?)
        }
        WriteOperation::PutAudit(entry) => {
            TransactWriteItem::builder().put(audit_put(table_name, entry)?)
        }
    };
    Ok(item.build())
}

fn create_put(
    table_name: &str,
    report: &ReportItem,
    return_reasons: bool,
) -> Result<Put, StoreError> {
    let item = report_attributes(report)?
        .into_iter()
        .filter_map(|(name, value)| to_attribute_value(value).map(|value| (name, value)))
        .collect::<HashMap<_, _>>();

    let mut put = Put::builder()
        .table_name(table_name)
        .set_item(Some(item))
        .condition_expression(CREATE_ONLY);
    if return_reasons {
        put = put.return_values_on_condition_check_failure(
            ReturnValuesOnConditionCheckFailure::AllOld,
        );
    }

    put.build()
        .map_err(|e| StoreError::Validation(e.to_string()))
}

fn audit_put(table_name: &str, entry: &AuditEntry) -> Result<Put, StoreError> {
    let mut item = key_map(&entry.key);
    for (name, value) in &entry.attributes {
        item.insert(name.clone(), av_s(value));
    }

    Put::builder()
        .table_name(table_name)
        .set_item(Some(item))
        .build()
        .map_err(|e| StoreError::Validation(e.to_string()))
}

/// Render an aggregate upsert as `ADD` and `SET` clauses with placeholder names and values.
fn aggregate_update(table_name: &str, update: &AggregateUpdate) -> Result<Update, StoreError> {
    let mut names = HashMap::new();
    let mut values = HashMap::new();
    let mut add = Vec::new();
    let mut set = Vec::new();

    for (i, (name, delta)) in update.increments.iter().enumerate() {
        names.insert(format!("#add{i}"), name.clone());
        values.insert(format!(":add{i}"), av_n(delta));
        add.push(format!("#add{i} :add{i}"));
    }
    for (i, (name, value)) in update.set.iter().enumerate() {
        names.insert(format!("#set{i}"), name.clone());
        values.insert(format!(":set{i}"), av_s(value));
        set.push(format!("#set{i} = :set{i}"));
    }
    for (i, (name, value)) in update.set_if_absent.iter().enumerate() {
        names.insert(format!("#init{i}"), name.clone());
        values.insert(format!(":init{i}"), av_s(value));
        set.push(format!("#init{i} = if_not_exists(#init{i}, :init{i})"));
    }

    let mut clauses = Vec::new();
    if !set.is_empty() {
        clauses.push(format!("SET {}", set.join(", ")));
    }
    if !add.is_empty() {
        clauses.push(format!("ADD {}", add.join(", ")));
    }
    if clauses.is_empty() {
        return Err(StoreError::Validation(
            "aggregate update must change at least one attribute".to_owned(),
        ));
    }

    Update::builder()
        .table_name(table_name)
        .set_key(Some(key_map(&update.key)))
        .update_expression(clauses.join(" "))
        .set_expression_attribute_names(Some(names))
        .set_expression_attribute_values(Some(values))
        .build()
        .map_err(|e| StoreError::Validation(e.to_string()))
}

fn key_map(key: &ItemKey) -> HashMap<String, AttributeValue> {
    HashMap::from([
        ("PK".to_owned(), av_s(&key.pk)),
        ("SK".to_owned(), av_s(&key.sk)),
    ])
}

fn to_attribute_value(value: Value) -> Option<AttributeValue> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(AttributeValue::Bool(b)),
        Value::Number(n) => Some(av_n(n)),
        Value::String(s) => Some(AttributeValue::S(s)),
        Value::Array(values) => Some(AttributeValue::L(
            values.into_iter().filter_map(to_attribute_value).collect(),
        )),
        Value::Object(map) => Some(AttributeValue::M(
            map.into_iter()
                .filter_map(|(name, value)| to_attribute_value(value).map(|value| (name, value)))
                .collect(),
        )),
    }
}

fn av_s(s: impl Into<String>) -> AttributeValue {
    AttributeValue::S(s.into())
}

fn av_n(n: impl ToString) -> AttributeValue {
    AttributeValue::N(n.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn report() -> ReportItem {
        ReportItem {
            pk: "PLAYER#p1".to_owned(),
            sk: "REPORT#20240519T100000#r1".to_owned(),
            report_id: "r1".to_owned(),
            player_id: "p1".to_owned(),
            coach_id: "c1".to_owned(),
            report_timestamp: "2024-05-19T10:00:00.000Z".to_owned(),
            report_timestamp_key: "20240519T100000".to_owned(),
            created_at: "2024-05-19T10:00:00.000Z".to_owned(),
            categories: BTreeMap::from([("serve".to_owned(), "strong".to_owned())]),
            entity_type: "REPORT".to_owned(),
            ingestion_id: Some("ing-1".to_owned()),
            source_bucket: None,
            source_key: None,
            correlation_id: None,
            ingest_started_at: None,
            gsi1_pk: "REPORT#r1".to_owned(),
            gsi1_sk: "REPORT#r1".to_owned(),
            team_id: None,
            gsi2_pk: None,
            gsi2_sk: None,
            player_email: None,
            player_name: None,
        }
    }

    #[test]
    fn test_create_put_is_conditional() {
        let put = create_put("reports", &report(), true).unwrap();

        assert_eq!(put.table_name(), "reports");
        assert_eq!(put.condition_expression(), Some(CREATE_ONLY));
        assert_eq!(
            put.return_values_on_condition_check_failure(),
            Some(&ReturnValuesOnConditionCheckFailure::AllOld)
        );

        let item = put.item();
        assert_eq!(item.get("PK"), Some(&av_s("PLAYER#p1")));
        assert_eq!(item.get("ingestionId"), Some(&av_s("ing-1")));
        assert!(!item.contains_key("teamId"));
        assert_eq!(
            item.get("categories"),
            Some(&AttributeValue::M(HashMap::from([(
                "serve".to_owned(),
                av_s("strong")
            )])))
        );

        let put = create_put("reports", &report(), false).unwrap();
        assert_eq!(put.return_values_on_condition_check_failure(), None);
    }

    #[test]
    fn test_aggregate_update_expression() {
        let update = AggregateUpdate {
            key: ItemKey::new("PLAYER#p1", "PROFILE#p1"),
            increments: vec![("reportCount".to_owned(), 1)],
            set: vec![("lastReportId".to_owned(), "r1".to_owned())],
            set_if_absent: vec![("createdAt".to_owned(), "now".to_owned())],
        };

        let rendered = aggregate_update("reports", &update).unwrap();

        assert_eq!(
            rendered.update_expression(),
            "SET #set0 = :set0, #init0 = if_not_exists(#init0, :init0) ADD #add0 :add0"
        );
        let names = rendered.expression_attribute_names().unwrap();
        assert_eq!(names["#add0"], "reportCount");
        assert_eq!(names["#init0"], "createdAt");
        let values = rendered.expression_attribute_values().unwrap();
        assert_eq!(values[":add0"], av_n(1));
        assert_eq!(rendered.key()["SK"], av_s("PROFILE#p1"));
    }

    #[test]
    fn test_empty_aggregate_update_is_rejected() {
        let update = AggregateUpdate {
            key: ItemKey::new("PLAYER#p1", "PROFILE#p1"),
            ..Default::default()
        };

        assert!(matches!(
            aggregate_update("reports", &update),
            Err(StoreError::Validation(_))
        ));
    }
}
