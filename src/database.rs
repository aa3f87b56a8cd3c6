//! PostgreSQL connection pool.

use sqlx::PgPool;
use sqlx::migrate::MigrateError;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

use crate::config::Postgres;

pub const DEFAULT_CREDENTIALS: &str = "postgres";
pub const DEFAULT_DATABASE_NAME: &str = "accounts";
pub const DEFAULT_POOL_SIZE: u32 = 10;
const DEFAULT_PORT: u16 = 5432;

/// Database handle shared by repositories.
#[derive(Clone)]
pub struct Database {
    pub postgres: PgPool,
}

impl Database {
    /// Init database connections.
    pub async fn new(config: &Postgres) -> Result<Self, sqlx::Error> {
        let (host, port) = match config.address.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().unwrap_or(DEFAULT_PORT)),
            None => (config.address.as_str(), DEFAULT_PORT),
        };
        let database = config.database.as_deref().unwrap_or(DEFAULT_DATABASE_NAME);

        let options = PgConnectOptions::new()
            .host(host)
            .port(port)
            .username(config.username.as_deref().unwrap_or(DEFAULT_CREDENTIALS))
            .password(config.password.as_deref().unwrap_or(DEFAULT_CREDENTIALS))
            .database(database);

        let postgres = PgPoolOptions::new()
            .max_connections(config.pool_size.unwrap_or(DEFAULT_POOL_SIZE))
            .connect_with(options)
            .await?;

        tracing::info!(%host, %database, "postgres connected");

        Ok(Self { postgres })
    }

    /// Execute migrations scripts.
    pub async fn migrate(&self) -> Result<(), MigrateError> {
        sqlx::migrate!().run(&self.postgres).await
    }
}
