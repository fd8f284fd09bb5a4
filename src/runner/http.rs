use std::{net::SocketAddr, thread};

use axum::Router;
use camino::Utf8PathBuf;
use console::style;
use tower_http::services::ServeDir;
use tracing::info;

/// Serve `dir` on `port` from a background thread.
pub fn start(dir: Utf8PathBuf, port: u16) -> thread::JoinHandle<Result<(), anyhow::Error>> {
    info!(url = %style(format!("http://localhost:{port}/")).yellow(), "starting a HTTP server");

    thread::spawn(move || {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(serve(dir, port))
            .inspect_err(|e| tracing::error!("HTTP server stopped: {e:#}"))
    })
}

async fn serve(dir: Utf8PathBuf, port: u16) -> Result<(), anyhow::Error> {
    let address = SocketAddr::from(([127, 0, 0, 1], port));
    let address = tokio::net::TcpListener::bind(address).await?;

    let router = Router::new().fallback_service(ServeDir::new(dir));

    axum::serve(address, router).await?;

    Ok(())
}
