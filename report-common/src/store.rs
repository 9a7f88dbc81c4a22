//! # Store
//!
//! The storage collaborator contract: atomic, conditional, multi-item writes against a
//! wide-column table, and errors that tell "a condition failed on operation N" apart from
//! every other failure class.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Cancellation code reported for an operation whose condition did not hold.
pub const CONDITIONAL_CHECK_FAILED: &str = "ConditionalCheckFailed";

/// Enumeration of errors returned by a `ReportStore`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("transaction cancelled: {message}")]
    TransactionCanceled {
        message: String,
        /// One entry per operation, in request order. Empty if reasons were not requested.
        reasons: Vec<CancellationReason>,
    },
    #[error("throughput exceeded: {0}")]
    ThroughputExceeded(String),
    #[error("request rejected by the store: {0}")]
    Validation(String),
    #[error("table not found: {0}")]
    ResourceNotFound(String),
    #[error("store request failed: {0}")]
    Request(String),
}

impl StoreError {
    /// Whether this error was caused by at least one operation's condition not holding.
    pub fn has_conditional_check_failure(&self) -> bool {
        match self {
            StoreError::TransactionCanceled { reasons, .. } => reasons
                .iter()
                .any(|reason| reason.code.as_deref() == Some(CONDITIONAL_CHECK_FAILED)),
            _ => false,
        }
    }
}

/// Why a single operation in a cancelled transaction did not apply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CancellationReason {
    pub code: Option<String>,
    pub message: Option<String>,
}

impl CancellationReason {
    pub fn none() -> Self {
        Self {
            code: Some("None".to_owned()),
            message: None,
        }
    }

    pub fn conditional_check_failed() -> Self {
        Self {
            code: Some(CONDITIONAL_CHECK_FAILED.to_owned()),
            message: Some("The conditional request failed".to_owned()),
        }
    }
}

/// Primary key of an item: partition key plus sort key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    pub pk: String,
    pub sk: String,
}

impl ItemKey {
    pub fn new(pk: impl Into<String>, sk: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            sk: sk.into(),
        }
    }
}

/// An immutable report item. Created once, conditioned on its key being absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportItem {
    #[serde(rename = "PK")]
    pub pk: String,
    #[serde(rename = "SK")]
    pub sk: String,
    pub report_id: String,
    pub player_id: String,
    pub coach_id: String,
    pub report_timestamp: String,
    pub report_timestamp_key: String,
    pub created_at: String,
    pub categories: BTreeMap<String, String>,
    pub entity_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingestion_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingest_started_at: Option<String>,
    /// Direct lookup by report id.
    #[serde(rename = "GSI1PK")]
    pub gsi1_pk: String,
    #[serde(rename = "GSI1SK")]
    pub gsi1_sk: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    /// Team-scoped chronological listing, only when a team is known.
    #[serde(rename = "GSI2PK", skip_serializing_if = "Option::is_none")]
    pub gsi2_pk: Option<String>,
    #[serde(rename = "GSI2SK", skip_serializing_if = "Option::is_none")]
    pub gsi2_sk: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_name: Option<String>,
}

impl ReportItem {
    pub fn key(&self) -> ItemKey {
        ItemKey::new(&self.pk, &self.sk)
    }
}

/// An upsert of a mutable aggregate item.
///
/// Applied in order: `increments` add to a number that defaults to zero, `set` overwrites
/// unconditionally, `set_if_absent` only writes attributes that do not exist yet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AggregateUpdate {
    pub key: ItemKey,
    pub increments: Vec<(String, i64)>,
    pub set: Vec<(String, String)>,
    pub set_if_absent: Vec<(String, String)>,
}

/// A plain, unconditional put of string attributes. Used for the audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub key: ItemKey,
    pub attributes: Vec<(String, String)>,
}

/// A single operation of an atomic multi-item write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOperation {
    /// Create an item, failing the whole transaction if its key already exists.
    CreateReport(ReportItem),
    UpsertAggregate(AggregateUpdate),
    PutAudit(AuditEntry),
}

impl WriteOperation {
    pub fn key(&self) -> ItemKey {
        match self {
            WriteOperation::CreateReport(item) => item.key(),
            WriteOperation::UpsertAggregate(update) => update.key.clone(),
            WriteOperation::PutAudit(entry) => entry.key.clone(),
        }
    }
}

/// An atomic multi-item write: every operation applies, or none does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactWrite {
    pub table_name: String,
    pub operations: Vec<WriteOperation>,
    /// Ask the store to report which operation(s) caused a cancellation.
    pub return_cancellation_reasons: bool,
}

#[async_trait]
pub trait ReportStore: Send + Sync {
    async fn transact_write(&self, request: TransactWrite) -> Result<(), StoreError>;
}

pub type Item = Map<String, Value>;

type Table = BTreeMap<ItemKey, Item>;

/// An in-process `ReportStore`.
///
/// Honours the same contract as the real engine: all-or-nothing application, a ceiling on
/// operations per transaction, no two operations on the same key, and create-only conditions.
#[derive(Clone)]
pub struct MemoryStore {
    tables: Arc<Mutex<HashMap<String, Table>>>,
    max_operations: usize,
}

impl MemoryStore {
    pub fn new(max_operations: usize) -> Self {
        Self {
            tables: Arc::new(Mutex::new(HashMap::new())),
            max_operations,
        }
    }

    fn tables(&self) -> MutexGuard<'_, HashMap<String, Table>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetch a copy of a stored item.
    pub fn get(&self, table_name: &str, key: &ItemKey) -> Option<Item> {
        self.tables()
            .get(table_name)
            .and_then(|table| table.get(key))
            .cloned()
    }

    /// Number of items in a table.
    pub fn len(&self, table_name: &str) -> usize {
        self.tables().get(table_name).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, table_name: &str) -> bool {
        self.len(table_name) == 0
    }

    fn validate(&self, request: &TransactWrite) -> Result<(), StoreError> {
        if request.table_name.trim().is_empty() {
            return Err(StoreError::Validation("table name must not be empty".to_owned()));
        }
        if request.operations.is_empty() {
            return Err(StoreError::Validation(
                "a transaction must contain at least one operation".to_owned(),
            ));
        }
        if request.operations.len() > self.max_operations {
            return Err(StoreError::Validation(format!(
                "a transaction may contain at most {} operations, got {}",
                self.max_operations,
                request.operations.len()
            )));
        }

        let mut seen = HashSet::new();
        for operation in &request.operations {
            if !seen.insert(operation.key()) {
                return Err(StoreError::Validation(
                    "transaction request cannot include multiple operations on one item"
                        .to_owned(),
                ));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ReportStore for MemoryStore {
    async fn transact_write(&self, request: TransactWrite) -> Result<(), StoreError> {
        self.validate(&request)?;

        // Serialize up front so that nothing is applied if any item is malformed.
        let mut prepared = Vec::with_capacity(request.operations.len());
        for operation in request.operations {
            let create = match &operation {
                WriteOperation::CreateReport(item) => Some(report_attributes(item)?),
                _ => None,
            };
            prepared.push((operation, create));
        }

        let mut tables = self.tables();
        let table = tables.entry(request.table_name).or_default();

        let reasons: Vec<CancellationReason> = prepared
            .iter()
            .map(|(operation, _)| match operation {
                WriteOperation::CreateReport(item) if table.contains_key(&item.key()) => {
                    CancellationReason::conditional_check_failed()
                }
                _ => CancellationReason::none(),
            })
            .collect();

        if reasons
            .iter()
            .any(|reason| reason.code.as_deref() == Some(CONDITIONAL_CHECK_FAILED))
        {
            let codes: Vec<&str> = reasons
                .iter()
                .map(|reason| reason.code.as_deref().unwrap_or("None"))
                .collect();
            return Err(StoreError::TransactionCanceled {
                message: format!(
                    "Transaction cancelled, please refer cancellation reasons for specific reasons [{}]",
                    codes.join(", ")
                ),
                reasons: if request.return_cancellation_reasons {
                    reasons
                } else {
                    Vec::new()
                },
            });
        }

        for (operation, create) in prepared {
            match (operation, create) {
                (WriteOperation::CreateReport(item), Some(attributes)) => {
                    table.insert(item.key(), attributes);
                }
                (WriteOperation::UpsertAggregate(update), _) => {
                    let item = table
                        .entry(update.key.clone())
                        .or_insert_with(|| key_attributes(&update.key));
                    apply_update(item, &update);
                }
                (WriteOperation::PutAudit(entry), _) => {
                    let mut item = key_attributes(&entry.key);
                    for (name, value) in entry.attributes {
                        item.insert(name, Value::String(value));
                    }
                    table.insert(entry.key, item);
                }
                (WriteOperation::CreateReport(_), None) => {}
            }
        }

        Ok(())
    }
}

fn key_attributes(key: &ItemKey) -> Item {
    let mut item = Map::new();
    item.insert("PK".to_owned(), Value::String(key.pk.clone()));
    item.insert("SK".to_owned(), Value::String(key.sk.clone()));
    item
}

pub(crate) fn report_attributes(item: &ReportItem) -> Result<Item, StoreError> {
    match serde_json::to_value(item) {
        Ok(Value::Object(attributes)) => Ok(attributes),
        Ok(_) => Err(StoreError::Validation("report item is not a map".to_owned())),
        Err(error) => Err(StoreError::Validation(error.to_string())),
    }
}

fn apply_update(item: &mut Item, update: &AggregateUpdate) {
    for (name, delta) in &update.increments {
        let current = item.get(name).and_then(Value::as_i64).unwrap_or(0);
        item.insert(name.clone(), Value::from(current + delta));
    }
    for (name, value) in &update.set {
        item.insert(name.clone(), Value::String(value.clone()));
    }
    for (name, value) in &update.set_if_absent {
        item.entry(name.clone())
            .or_insert_with(|| Value::String(value.clone()));
    }
}
