use solar_api::config::BackendConfig;
use solar_api::{BackendDocumentStore, Config, ServiceSettings, SolarService};
use solar_store_backends::{gcs::GcsBackend, local::LocalBackend, s3::S3Backend, Backend};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "solar_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;

    if config.mode.is_development() {
        info!("mode: development");
    }
    info!("Starting solar records service with config: {:?}", config);

    let backend: Arc<dyn Backend> = match config.backend.clone() {
        BackendConfig::Local {
            root_path,
            physical_bucket,
            public_base_url,
        } => {
            info!("Using local backend at {:?}", root_path);
            Arc::new(LocalBackend::new(root_path, physical_bucket, public_base_url))
        }
        BackendConfig::S3 {
            region,
            physical_bucket,
            endpoint,
            public_base_url,
        } => Arc::new(S3Backend::new(physical_bucket, region, endpoint, public_base_url).await?),
        BackendConfig::Gcs {
            physical_bucket,
            public_base_url,
        } => Arc::new(GcsBackend::new(physical_bucket, public_base_url).await?),
    };

    backend.init().await?;

    let documents = Arc::new(BackendDocumentStore::new(backend.clone()));
    let service = Arc::new(SolarService::new(
        backend,
        documents,
        ServiceSettings {
            collection: config.documents.collection.clone(),
            empty_list_not_found: config.api.empty_list_not_found,
        },
    ));

    let app = solar_api::router::create_router(service, &config);

    let addr = config.server_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Application running on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutdown....");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
}
