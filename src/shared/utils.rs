use anyhow::{Context, Result};
use diesel::r2d2::{ConnectionManager, Pool, PoolError};
use diesel::{Connection, PgConnection};

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

pub fn establish_pg_connection() -> Result<PgConnection> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;
    PgConnection::establish(&database_url)
        .with_context(|| format!("Failed to connect to database at {}", database_url))
}

pub fn create_conn() -> Result<DbPool, PoolError> {
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://leaduser:@localhost:5432/leadserver".to_string());
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    Pool::builder().build(manager)
}
