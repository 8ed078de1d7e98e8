use std::net::SocketAddr;
use std::thread;

use axum::Router;
use camino::Utf8PathBuf;
use console::style;
use tower_http::services::ServeDir;
use tracing::info;

/// Serves the harness pages at `/` and the artifacts at `/dist`.
#[derive(Debug, Clone)]
pub struct DevServer {
    pub port: u16,
    pub serve_dir: Utf8PathBuf,
    pub out_dir: Utf8PathBuf,
}

impl DevServer {
    /// Runs the server on its own thread until the process exits.
    pub fn start(self) -> thread::JoinHandle<Result<(), anyhow::Error>> {
        info!(
            url = %style(format!("http://localhost:{}/", self.port)).yellow(),
            "starting a HTTP server"
        );

        thread::spawn(move || {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?
                .block_on(self.serve())
        })
    }

    fn router(&self) -> Router {
        Router::new()
            .nest_service("/dist", ServeDir::new(&self.out_dir))
            .fallback_service(ServeDir::new(&self.serve_dir))
    }

    async fn serve(self) -> Result<(), anyhow::Error> {
        let address = SocketAddr::from(([127, 0, 0, 1], self.port));
        let listener = tokio::net::TcpListener::bind(address).await?;

        axum::serve(listener, self.router()).await?;

        Ok(())
    }
}
