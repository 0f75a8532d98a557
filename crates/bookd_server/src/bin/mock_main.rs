use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let router = bookd_server::controller::mock_router::make_router();

    let listener = tokio::net::TcpListener::bind("localhost:8762")
        .await
        .unwrap();

    info!("mock listening on {}", listener.local_addr().unwrap());

    axum::serve(listener, router)
        .with_graceful_shutdown(bookd_server::controller::shutdown_signal())
        .await
        .unwrap();
}
