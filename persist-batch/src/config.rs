use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use report_common::dynamo::DynamoConfig;
use thiserror::Error;

/// Operations each record contributes to a transaction: the report item and the aggregate.
pub const OPERATIONS_PER_RECORD: usize = 2;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    pub reports_table_name: NonEmptyString,

    #[envconfig(default = "25")]
    pub max_transaction_operations: usize,

    #[envconfig(default = "persist-batch")]
    pub custom_metrics_namespace: NonEmptyString,

    pub custom_metrics_service_name: Option<String>,

    pub custom_metrics_stage: Option<String>,

    pub audit_table_name: Option<NonEmptyString>,

    #[envconfig(default = "dynamodb")]
    pub store_backend: StoreBackend,

    pub aws_region: Option<String>,

    pub aws_default_region: Option<String>,

    pub dynamodb_endpoint_url: Option<String>,

    pub aws_endpoint_url: Option<String>,

    #[envconfig(default = "3")]
    pub storage_max_attempts: u32,

    #[envconfig(default = "5000")]
    pub storage_timeout_ms: EnvMsDuration,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate the settings the persister depends on.
    pub fn persist_config(&self) -> Result<PersistConfig, ConfigError> {
        if self.max_transaction_operations < OPERATIONS_PER_RECORD {
            return Err(ConfigError::OperationCeilingTooLow(
                self.max_transaction_operations,
            ));
        }

        Ok(PersistConfig {
            table_name: self.reports_table_name.as_str().to_owned(),
            max_transaction_operations: self.max_transaction_operations,
            audit_table_name: self
                .audit_table_name
                .as_ref()
                .map(|name| name.as_str().to_owned()),
            metrics: MetricsConfig {
                namespace: self.custom_metrics_namespace.as_str().to_owned(),
                service_name: non_blank(self.custom_metrics_service_name.as_deref()),
                stage: non_blank(self.custom_metrics_stage.as_deref()),
            },
        })
    }

    pub fn dynamo_config(&self) -> DynamoConfig {
        DynamoConfig {
            region: non_blank(self.aws_region.as_deref())
                .or_else(|| non_blank(self.aws_default_region.as_deref()))
                .unwrap_or_else(|| "us-east-1".to_owned()),
            endpoint_url: non_blank(self.dynamodb_endpoint_url.as_deref())
                .or_else(|| non_blank(self.aws_endpoint_url.as_deref())),
            max_attempts: self.storage_max_attempts,
            operation_timeout: self.storage_timeout_ms.0,
        }
    }
}

/// Validated settings for a `BatchPersister`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistConfig {
    pub table_name: String,
    pub max_transaction_operations: usize,
    pub audit_table_name: Option<String>,
    pub metrics: MetricsConfig,
}

impl PersistConfig {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            max_transaction_operations: 25,
            audit_table_name: None,
            metrics: MetricsConfig::default(),
        }
    }

    pub fn records_per_group(&self) -> usize {
        self.max_transaction_operations / OPERATIONS_PER_RECORD
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsConfig {
    pub namespace: String,
    pub service_name: Option<String>,
    pub stage: Option<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            namespace: "persist-batch".to_owned(),
            service_name: None,
            stage: None,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("MAX_TRANSACTION_OPERATIONS must be at least {OPERATIONS_PER_RECORD}, got {0}")]
    OperationCeilingTooLow(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    DynamoDb,
    Memory,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseStoreBackendError(pub String);

impl FromStr for StoreBackend {
    type Err = ParseStoreBackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dynamodb" => Ok(StoreBackend::DynamoDb),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(ParseStoreBackendError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}
