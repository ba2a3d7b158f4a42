use modhost::config::AppConfig;
use modhost::http::{self, AppState};
use modhost::installer::Installer;
use modhost::registry::Registry;
use modhost::store::ModuleStore;
use modhost::task::TaskStore;

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::load()?;
    config.ensure_dirs()?;
    tracing::info!("module host starting, data dir {}", config.data_dir.display());

    let store = ModuleStore::open(config.data_dir())?;
    let registry = Registry::new(config.data_dir.clone(), store);
    if let Err(e) = registry.autostart().await {
        tracing::warn!("autostart failed: {}", e);
    }

    let tasks = TaskStore::new();
    let installer = Installer::new(registry.clone(), tasks.clone(), config.unsafe_entry_policy());

    let app = http::router(AppState {
        registry,
        installer,
        tasks,
        http_client: reqwest::Client::new(),
    });

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!("listening on {}", config.listen_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}
