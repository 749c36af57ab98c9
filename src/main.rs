use exam_rooms::{build_state, config::Config, routes::build_router};
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = Config::from_env();
    let addr: SocketAddr = config.bind_addr().parse()?;
    match config.local_state_path.as_ref() {
        Some(path) => tracing::info!("document store mirrored to {}", path.display()),
        None => tracing::info!("document store is memory only"),
    }

    let state = build_state(config);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("exam rooms sidecar listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
