use color_eyre::eyre;
use resticd_orchestrator::Orchestrator;
use resticd_server::{config::ServerConfig, create_app, AppState};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,resticd=debug")),
        )
        .init();

    let config = ServerConfig::from_env();
    info!(
        restic_root = %config.engine.restic_root.display(),
        volumes_root = %config.engine.volumes_root.display(),
        binary = %config.engine.restic_binary.display(),
        "Starting resticd..."
    );
    info!(
        "API token: {}",
        if config.api_token.is_some() { "required" } else { "disabled" }
    );

    let addr = config.bind_addr()?;
    let state = AppState::new(Orchestrator::with_restic(config.engine), config.api_token);
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("resticd listening on http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
