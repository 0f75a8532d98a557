use std::sync::Arc;

use bookd_server::controller::{App, AppState};
use bookd_rag::{LocalComponent, PipelineConfig};
use tokio::sync::Mutex;
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let storage_root = std::env::var("BOOKD_DATA_DIR")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from("./bookd_data"));
    let config = PipelineConfig {
        storage_root: Some(storage_root),
        ..Default::default()
    };

    let local_comps = LocalComponent::new(config).expect("failed to build pipeline components");
    let app_state = AppState(Arc::new(Mutex::new(App::new(local_comps))));

    let router = bookd_server::controller::router::make_router(app_state);

    let listener = tokio::net::TcpListener::bind("localhost:8762")
        .await
        .unwrap();

    info!("listening on {}", listener.local_addr().unwrap());

    axum::serve(listener, router)
        .with_graceful_shutdown(bookd_server::controller::shutdown_signal())
        .await
        .unwrap();
}
