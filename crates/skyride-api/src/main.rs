// Skyride API server

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use skyride_api::{router, AppConfig, AppState, RideService, StorageBackend};
use skyride_core::User;
use skyride_engine::{StripeGateway, WorkflowExecutor};
use skyride_storage::{InMemoryUnitOfWork, PgUnitOfWork};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before the subscriber so RUST_LOG can come from it
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "skyride_api=debug,skyride_engine=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("skyride-api starting...");
    if let Ok(path) = dotenv {
        tracing::info!("Loaded .env from {:?}", path);
    }

    let config = AppConfig::from_env()?;

    let stripe = config
        .stripe
        .clone()
        .context("STRIPE_KEY environment variable required")?;
    let gateway = Arc::new(StripeGateway::new(stripe).context("Failed to build Stripe client")?);

    let rides: Arc<dyn RideService> = match config.storage_backend {
        StorageBackend::Postgres => {
            let database_url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL environment variable required")?;
            let uow = PgUnitOfWork::connect(database_url)
                .await
                .context("Failed to connect to database")?;
            uow.migrate().await.context("Failed to run migrations")?;
            tracing::info!("Connected to database");
            Arc::new(WorkflowExecutor::new(uow, gateway, config.engine.clone()))
        }
        StorageBackend::Memory => {
            let uow = InMemoryUnitOfWork::new();
            if let Some(user) = dev_user() {
                tracing::info!(email = %user.email, "Seeded development user");
                uow.insert_user(user);
            }
            tracing::warn!("DEV_MODE: using in-memory storage; records are lost on restart");
            Arc::new(WorkflowExecutor::new(uow, gateway, config.engine.clone()))
        }
    };

    tracing::info!(
        lock_timeout_secs = config.engine.lock_timeout.as_secs(),
        request_timeout_secs = config.request_timeout.as_secs(),
        "Engine configured"
    );

    let app = router(AppState::new(rides, config.request_timeout));

    let listener = tokio::net::TcpListener::bind(&config.server_address)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("HTTP server listening on {}", config.server_address);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("Server error")?;

    Ok(())
}

/// User for the in-memory backend, from DEV_USER_EMAIL and DEV_STRIPE_CUSTOMER_ID
fn dev_user() -> Option<User> {
    let email = std::env::var("DEV_USER_EMAIL").ok()?;
    let stripe_customer_id = std::env::var("DEV_STRIPE_CUSTOMER_ID").ok()?;
    Some(User {
        id: 1,
        email,
        stripe_customer_id,
    })
}
