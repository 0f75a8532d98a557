use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
};

use axum::{http::StatusCode, response::IntoResponse};
use bookd_rag::component::operation::{DetailLevel, Theme};
use bookd_rag::LocalComponent;
use serde::{Deserialize, Serialize};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;

use crate::metric::Metrics;

pub struct App {
    pub local_comps: LocalComponent,
    pub metrics: Metrics,
    /// Themes from the latest discovery run; synthesis consumes these.
    pub themes: Vec<Theme>,
    /// Token for the currently running synthesis, if any.
    pub cancel: CancellationToken,
}

impl App {
    pub fn new(local_comps: LocalComponent) -> Self {
        Self {
            local_comps,
            metrics: Metrics::new(),
            themes: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn reset(&mut self) -> anyhow::Result<()> {
        self.themes.clear();
        self.local_comps.reset()
    }
}

#[derive(Clone)]
pub struct AppState(pub Arc<Mutex<App>>);

impl Deref for AppState {
    type Target = Arc<Mutex<App>>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for AppState {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Wrapper for error handling
/// Taken from https://github.com/tokio-rs/axum/blob/main/examples/anyhow-error-response/src/main.rs
pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

pub async fn shutdown_signal() {
    let interrupt = async {
        signal(SignalKind::interrupt())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    let terminate = async {
        signal(SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = interrupt => {},
        _ = terminate => {},
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct IngestPayload {
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub urls: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SearchPayload {
    pub query: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_top_k() -> usize {
    5
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AskPayload {
    pub question: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ThemesPayload {
    pub n_themes: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SynthesizePayload {
    pub book_title: String,
    #[serde(default)]
    pub book_objective: String,
    #[serde(default)]
    pub max_chapters: Option<usize>,
    #[serde(default)]
    pub detail_level: Option<DetailLevel>,
}

/// Ingest response: the per-item report plus how many chunks each accepted
/// document contributed.
#[derive(Serialize, Debug)]
pub struct IngestResponse {
    pub report: bookd_rag::component::reader::IngestReport,
    pub chunk_counts: Vec<usize>,
}

#[test]
fn test_synthesize_payload_deserialize() {
    let payload: SynthesizePayload = serde_json::from_str(
        r#"{"book_title": "Field Notes", "detail_level": "comprehensive"}"#,
    )
    .unwrap();
    assert_eq!(payload.book_title, "Field Notes");
    assert_eq!(payload.detail_level, Some(DetailLevel::Comprehensive));
    assert!(payload.max_chapters.is_none());
}

#[test]
fn test_ingest_payload_defaults() {
    let payload: IngestPayload = serde_json::from_str(r#"{"paths": ["a.pdf"]}"#).unwrap();
    assert_eq!(payload.paths.len(), 1);
    assert!(payload.urls.is_empty());
}

pub mod mock_router;

pub mod router;
