use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use report_common::report::PersistBatchEvent;
use tower_http::trace::TraceLayer;

use crate::error::{PersistError, PersistSummary};
use crate::persister::BatchPersister;

async fn index() -> &'static str {
    "persist-batch"
}

pub async fn persist(
    State(persister): State<BatchPersister>,
    Json(event): Json<PersistBatchEvent>,
) -> Result<Json<PersistSummary>, PersistError> {
    persister.persist(&event).await.map(Json)
}

pub fn add_routes(router: Router, persister: BatchPersister) -> Router {
    router.merge(
        Router::new()
            .route("/", get(index))
            .route("/persist", post(persist))
            .layer(TraceLayer::new_for_http())
            .with_state(persister),
    )
}
