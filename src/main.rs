use std::sync::Arc;

use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tracing_subscriber::EnvFilter;

use loandocs::{config::AppConfig, db, routes, state::AppState, storage::S3Storage};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        database_url = %config.redacted_database_url(),
        s3_bucket = %config.s3_bucket,
        gpu_ocr_enabled = config.gpu_ocr_url.is_some(),
        dispatcher_enabled = config.task_queue_url.is_some(),
        "loaded configuration"
    );

    let pool = db::connect(&config)?;
    run_migrations(&pool).await?;

    let storage = Arc::new(S3Storage::from_config(&config).await?);

    let bind_addr = format!("{}:{}", config.server_host, config.server_port);
    let state = AppState::build(pool, config, storage);
    let router = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(%bind_addr, "server listening");
    axum::serve(listener, router).await?;

    Ok(())
}

async fn run_migrations(pool: &db::PgPool) -> anyhow::Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow::anyhow!("failed to acquire connection: {err}"))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow::anyhow!("failed to run migrations: {err}"))?;
        Ok(())
    })
    .await?
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
