//! Canned responses for GUI development: same routes, no models, no state.

use crate::metric::MetricData;

use super::{AskPayload, IngestPayload, Result, SearchPayload, SynthesizePayload, ThemesPayload};
use axum::Json;
use bookd_rag::component::database::SearchResult;
use bookd_rag::component::operation::{Chapter, Theme};
use bookd_rag::component::reader::{IngestReport, IngestStatus};
use serde_json::json;

async fn open_api() -> &'static str {
    "session open"
}

async fn ingest_api(Json(payload): Json<IngestPayload>) -> Result<Json<super::IngestResponse>> {
    println!("mock ingest: {:?}", payload);
    Ok(Json(super::IngestResponse {
        report: IngestReport {
            succeeded: vec![],
            failed: vec![],
            status: IngestStatus::Completed,
        },
        chunk_counts: vec![],
    }))
}

async fn search_api(Json(payload): Json<SearchPayload>) -> Result<Json<Vec<SearchResult>>> {
    println!("mock search: {:?}", payload.query);
    Ok(Json(vec![]))
}

async fn ask_api(Json(payload): Json<AskPayload>) -> Result<String> {
    println!("mock ask: {:?}", payload.question);
    Ok(payload.question)
}

async fn themes_api(Json(payload): Json<ThemesPayload>) -> Result<Json<Vec<Theme>>> {
    println!("mock themes: {:?}", payload.n_themes);
    Ok(Json(vec![]))
}

async fn synthesize_api(Json(payload): Json<SynthesizePayload>) -> Result<Json<Vec<Chapter>>> {
    println!("mock synthesize: {:?}", payload.book_title);
    Ok(Json(vec![]))
}

async fn stats_api() -> Json<serde_json::Value> {
    Json(json!({"chunks": 0, "themes": 0, "store_memory": 0}))
}

async fn close_api() -> Json<MetricData> {
    Json(MetricData {
        request_metrics: vec![],
    })
}

pub fn make_router() -> axum::Router {
    axum::Router::new()
        .route("/open", axum::routing::post(open_api))
        .route("/ingest", axum::routing::post(ingest_api))
        .route("/search", axum::routing::post(search_api))
        .route("/ask", axum::routing::post(ask_api))
        .route("/themes", axum::routing::post(themes_api))
        .route("/synthesize", axum::routing::post(synthesize_api))
        .route("/stats", axum::routing::get(stats_api))
        .route("/close", axum::routing::post(close_api))
}
