use crate::metric::{RequestType, Timer};

use super::{
    AppState, AskPayload, IngestPayload, IngestResponse, Result, SearchPayload,
    SynthesizePayload, ThemesPayload,
};
use axum::{debug_handler, extract::State, Json};
use bookd_rag::component::database::SearchResult;
use bookd_rag::component::operation::{Chapter, Theme};
use bookd_rag::component::reader::{self, IngestFailure, IngestReport};
use bookd_rag::method::{rag, synthesis, themes};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

async fn open_api(State(bs_state): State<AppState>) -> Result<&'static str> {
    bs_state.lock().await.metrics.reset();
    Ok("session open")
}

/// Read every requested path and URL, then chunk/embed/store the readable
/// ones. Items that fail to read or insert land in the failure list; the
/// batch itself always completes.
#[debug_handler]
async fn ingest_api(
    State(bs_state): State<AppState>,
    Json(payload): Json<IngestPayload>,
) -> Result<Json<IngestResponse>> {
    let timer = Timer::new();
    let paths: Vec<std::path::PathBuf> =
        payload.paths.iter().map(std::path::PathBuf::from).collect();
    let mut report = reader::ingest_paths(&paths);
    let url_report = reader::ingest_urls(&payload.urls);
    report.succeeded.extend(url_report.succeeded);
    report.failed.extend(url_report.failed);

    let mut app = bs_state.lock().await;
    let chunking = app.local_comps.config.chunking.clone();
    let mut stored = Vec::new();
    let mut chunk_counts = Vec::new();
    let mut failed = report.failed;
    for document in report.succeeded {
        let source = document
            .file_path
            .clone()
            .unwrap_or_else(|| document.title.clone());
        match rag::insert(&document, &mut app.local_comps, &chunking).await {
            Ok(chunks) => {
                chunk_counts.push(chunks.len());
                stored.push(document);
            }
            Err(err) => failed.push(IngestFailure {
                source,
                reason: format!("{err:#}"),
            }),
        }
    }
    app.local_comps.store.flush()?;

    let status = match (stored.is_empty(), failed.is_empty()) {
        (_, true) => bookd_rag::component::reader::IngestStatus::Completed,
        (false, false) => bookd_rag::component::reader::IngestStatus::CompletedWithFailures,
        (true, false) => bookd_rag::component::reader::IngestStatus::Failed,
    };
    let store_memory = app.local_comps.store.memory_usage();
    app.metrics
        .add_metric(RequestType::Ingest, store_memory, timer.read()?);

    Ok(Json(IngestResponse {
        report: IngestReport {
            succeeded: stored,
            failed,
            status,
        },
        chunk_counts,
    }))
}

async fn search_api(
    State(bs_state): State<AppState>,
    Json(payload): Json<SearchPayload>,
) -> Result<Json<Vec<SearchResult>>> {
    let timer = Timer::new();
    let mut app = bs_state.lock().await;
    let hits = rag::retrieve(&payload.query, &mut app.local_comps, payload.top_k, None)?;
    let store_memory = app.local_comps.store.memory_usage();
    app.metrics
        .add_metric(RequestType::Search, store_memory, timer.read()?);
    Ok(Json(hits))
}

async fn ask_api(
    State(bs_state): State<AppState>,
    Json(payload): Json<AskPayload>,
) -> Result<String> {
    let timer = Timer::new();
    let mut app = bs_state.lock().await;
    let answer = rag::generate(
        &payload.question,
        &mut app.local_comps,
        &rag::RagOptions::default(),
    )
    .await?;
    let store_memory = app.local_comps.store.memory_usage();
    app.metrics
        .add_metric(RequestType::Ask, store_memory, timer.read()?);
    Ok(answer)
}

async fn themes_api(
    State(bs_state): State<AppState>,
    Json(payload): Json<ThemesPayload>,
) -> Result<Json<Vec<Theme>>> {
    let timer = Timer::new();
    let mut app = bs_state.lock().await;
    let opt = themes::ThemeOptions {
        n_themes: payload.n_themes,
        ..Default::default()
    };
    let discovered = themes::discover_themes(&mut app.local_comps, &opt).await?;
    app.themes = discovered.clone();
    let store_memory = app.local_comps.store.memory_usage();
    app.metrics
        .add_metric(RequestType::Themes, store_memory, timer.read()?);
    Ok(Json(discovered))
}

fn synthesis_options(payload: &SynthesizePayload) -> synthesis::SynthesisOptions {
    let mut opt = synthesis::SynthesisOptions {
        book_title: payload.book_title.clone(),
        book_objective: payload.book_objective.clone(),
        max_chapters: payload.max_chapters,
        ..Default::default()
    };
    if let Some(detail_level) = payload.detail_level {
        opt.detail_level = detail_level;
    }
    opt
}

async fn outline_api(
    State(bs_state): State<AppState>,
    Json(payload): Json<SynthesizePayload>,
) -> Result<String> {
    let mut app = bs_state.lock().await;
    let themes = app.themes.clone();
    let opt = synthesis_options(&payload);
    Ok(synthesis::outline_book(&themes, &mut app.local_comps, &opt).await?)
}

/// Synthesize a book from the latest discovered themes. `/cancel` stops it
/// at the next chapter boundary.
async fn synthesize_api(
    State(bs_state): State<AppState>,
    Json(payload): Json<SynthesizePayload>,
) -> Result<Json<Vec<Chapter>>> {
    let timer = Timer::new();
    let mut app = bs_state.lock().await;
    let themes = app.themes.clone();
    let cancel = CancellationToken::new();
    app.cancel = cancel.clone();
    let opt = synthesis_options(&payload);

    let chapters = synthesis::synthesize_book(
        &themes,
        &mut app.local_comps,
        &opt,
        &mut |current, total, message| info!("synthesis {current}/{total}: {message}"),
        &cancel,
    )
    .await?;
    let store_memory = app.local_comps.store.memory_usage();
    app.metrics
        .add_metric(RequestType::Synthesize, store_memory, timer.read()?);
    Ok(Json(chapters))
}

async fn cancel_api(State(bs_state): State<AppState>) -> &'static str {
    bs_state.lock().await.cancel.cancel();
    "cancelling at the next chapter boundary"
}

async fn stats_api(State(bs_state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let app = bs_state.lock().await;
    Ok(Json(json!({
        "chunks": app.local_comps.store.count()?,
        "themes": app.themes.len(),
        "store_memory": app.local_comps.store.memory_usage(),
    })))
}

async fn close_api(State(bs_state): State<AppState>) -> Json<crate::metric::MetricData> {
    let mut app = bs_state.lock().await;
    let report = app.metrics.get_metrics().clone();
    app.metrics.reset();
    Json(report)
}

pub fn make_router(app_state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/open", axum::routing::post(open_api))
        .route("/ingest", axum::routing::post(ingest_api))
        .route("/search", axum::routing::post(search_api))
        .route("/ask", axum::routing::post(ask_api))
        .route("/themes", axum::routing::post(themes_api))
        .route("/outline", axum::routing::post(outline_api))
        .route("/synthesize", axum::routing::post(synthesize_api))
        .route("/cancel", axum::routing::post(cancel_api))
        .route("/stats", axum::routing::get(stats_api))
        .route("/close", axum::routing::post(close_api))
        .with_state(app_state)
}
