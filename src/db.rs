use std::time::Duration;

use diesel::pg::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool};

use crate::config::AppConfig;

pub type PgPool = Pool<ConnectionManager<PgConnection>>;

/// Callers wait at most this long for a connection; the task pipeline
/// treats a pool timeout as transient and requests redelivery.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the process-wide pool, sized from `DATABASE_MAX_POOL_SIZE`. Task
/// invocations check a connection out per statement batch and never hold
/// one across blob or LLM calls, so a small pool is enough.
pub fn connect(config: &AppConfig) -> anyhow::Result<PgPool> {
    let manager = ConnectionManager::<PgConnection>::new(&config.database_url);
    let pool = Pool::builder()
        .max_size(config.database_max_pool_size.max(1))
        .connection_timeout(CONNECTION_TIMEOUT)
        .build(manager)?;
    Ok(pool)
}
