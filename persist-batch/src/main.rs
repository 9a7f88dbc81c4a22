use std::sync::Arc;

use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use tracing_subscriber::EnvFilter;

use persist_batch::config::{Config, StoreBackend};
use persist_batch::handlers;
use persist_batch::persister::BatchPersister;
use persist_batch::time::SystemTime;
use report_common::dynamo::DynamoStore;
use report_common::metrics::{serve, setup_metrics_recorder, setup_metrics_routes, PrometheusSink};
use report_common::store::{MemoryStore, ReportStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().expect("failed to load configuration from env");
    let persist_config = config.persist_config()?;

    let store: Arc<dyn ReportStore> = match config.store_backend {
        StoreBackend::DynamoDb => Arc::new(DynamoStore::from_config(&config.dynamo_config()).await),
        StoreBackend::Memory => {
            tracing::warn!("using the in-memory store, nothing will be durably persisted");
            Arc::new(MemoryStore::new(persist_config.max_transaction_operations))
        }
    };

    let persister = BatchPersister::new(
        persist_config,
        store,
        Arc::new(PrometheusSink::default()),
        Arc::new(SystemTime {}),
    );

    let app = handlers::add_routes(Router::new(), persister);
    let app = if config.export_prometheus {
        setup_metrics_routes(app, setup_metrics_recorder()?)
    } else {
        app
    };

    tracing::info!("listening on {}", config.bind());
    match serve(app, &config.bind()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start persist-batch http server, {}", e),
    }

    Ok(())
}
