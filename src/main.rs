use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use diesel_migrations::MigrationHarness;
use dotenvy::dotenv;
use log::info;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use leadserver::allocation::configure_allocation_routes;
use leadserver::config::AppConfig;
use leadserver::shared::state::AppState;
use leadserver::shared::utils::{create_conn, DbPool};
use leadserver::showings::configure_showings_routes;
use leadserver::MIGRATIONS;

fn run_migrations(pool: &DbPool) -> anyhow::Result<()> {
    let mut conn = pool.get().context("Failed to get database connection")?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {e}"))?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .write_style(env_logger::WriteStyle::Always)
        .init();

    let config = AppConfig::from_env().context("Failed to load config")?;
    if std::env::var("DATABASE_URL").is_err() {
        std::env::set_var("DATABASE_URL", config.database_url());
    }
    let pool = create_conn().context("Failed to create database pool")?;
    run_migrations(&pool)?;

    let app_state = Arc::new(AppState { conn: pool });

    let app = Router::new()
        .merge(configure_allocation_routes())
        .merge(configure_showings_routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    info!(
        "Starting HTTP server on {}:{}",
        config.server.host, config.server.port
    );
    let listener =
        tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port))
            .await
            .context("Failed to bind server address")?;
    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
