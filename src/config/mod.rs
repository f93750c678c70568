use anyhow::{Context, Result};

#[derive(Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub username: String,
    pub password: String,
    pub server: String,
    pub port: u32,
    pub database: String,
}

impl AppConfig {
    pub fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.database.username,
            self.database.password,
            self.database.server,
            self.database.port,
            self.database.database
        )
    }

    pub fn from_env() -> Result<Self> {
        let server = ServerConfig {
            host: std::env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("SERVER_PORT is not a valid port number")?,
        };
        let database = DatabaseConfig {
            username: std::env::var("TABLES_USERNAME").unwrap_or_else(|_| "leaduser".to_string()),
            password: std::env::var("TABLES_PASSWORD").unwrap_or_default(),
            server: std::env::var("TABLES_SERVER").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("TABLES_PORT")
                .unwrap_or_else(|_| "5432".to_string())
                .parse()
                .context("TABLES_PORT is not a valid port number")?,
            database: std::env::var("TABLES_DATABASE")
                .unwrap_or_else(|_| "leadserver".to_string()),
        };
        Ok(Self { server, database })
    }
}
