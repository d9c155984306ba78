//! Cyclone API Server

use clap::Parser;
use cyclone_api::{AppState, routes};
use cyclone_cloud::{CloudController, ProviderRegistry};
use cyclone_config::{SystemConfig, load_system_config};
use cyclone_db::{
    CloudRepo, EventRepo, MemoryCloudRepo, MemoryEventRepo, PgCloudRepo, PgEventRepo,
    create_pool, run_migrations,
};
use cyclone_scheduler::{
    DefaultPostHook, EventManager, HandlerRegistry, ManagerSettings, SchedulerContext,
};
use sqlx::PgPool;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cyclone-server")]
#[command(about = "Cyclone worker orchestration server", long_about = None)]
struct Args {
    /// System configuration file
    #[arg(short, long, env = "CYCLONE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides the configuration file
    #[arg(short, long, env = "CYCLONE_LISTEN")]
    listen: Option<String>,

    /// PostgreSQL connection string; in-memory stores are used without one
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

struct Stores {
    events: Arc<dyn EventRepo>,
    clouds: Arc<dyn CloudRepo>,
    pool: Option<PgPool>,
}

async fn open_stores(database_url: Option<&str>) -> anyhow::Result<Stores> {
    match database_url {
        Some(url) => {
            info!("Connecting to database...");
            let pool = create_pool(url).await?;
            run_migrations(&pool).await?;
            info!("Database connected");
            Ok(Stores {
                events: Arc::new(PgEventRepo::new(pool.clone())),
                clouds: Arc::new(PgCloudRepo::new(pool.clone())),
                pool: Some(pool),
            })
        }
        None => {
            warn!("No database configured, events will not survive a restart");
            Ok(Stores {
                events: Arc::new(MemoryEventRepo::new()),
                clouds: Arc::new(MemoryCloudRepo::new()),
                pool: None,
            })
        }
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = match &args.config {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            load_system_config(path)?
        }
        None => SystemConfig::default(),
    };
    let listen = args.listen.unwrap_or_else(|| config.server.listen.clone());
    let database_url = args.database_url.or_else(|| config.server.database_url.clone());
    let stores = open_stores(database_url.as_deref()).await?;

    // Clouds from the configuration file take priority over stored ones
    let controller = Arc::new(CloudController::new(
        ProviderRegistry::new(),
        config.worker.clone(),
    ));
    controller.add_clouds(&config.clouds).await?;
    for cloud in stores.clouds.list().await? {
        if let Err(e) = controller.add_cloud(&cloud).await {
            warn!(cloud = %cloud.name, error = %e, "Skipping stored cloud");
        }
    }
    info!(clouds = ?controller.cloud_names().await, "Clouds registered");

    let settings = ManagerSettings {
        poll_interval: config.manager.poll_interval,
        max_retry: config.manager.max_retry,
        retry_interval: config.manager.retry_interval,
        notification_url: config.notification.url.clone(),
    };
    let ctx = Arc::new(SchedulerContext::new(controller.clone(), settings));
    let hook = Arc::new(DefaultPostHook::new(
        controller,
        ctx.settings.notification_url.clone(),
    ));
    let manager = Arc::new(EventManager::new(
        ctx.clone(),
        stores.events,
        HandlerRegistry::new(),
        hook,
    ));
    manager.recover().await?;
    let manager_task = tokio::spawn(manager.clone().run());

    let state = AppState::new(ctx, manager, stores.clouds, stores.pool.clone());
    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    info!("Starting server on {}", listen);
    let listener = TcpListener::bind(&listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager_task.abort();
    if let Some(pool) = stores.pool {
        pool.close().await;
        info!("Database pool closed");
    }
    info!("Server stopped");
    Ok(())
}
