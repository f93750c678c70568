pub mod allocation;
pub mod audit;
pub mod config;
pub mod shared;
pub mod showings;

use diesel_migrations::{embed_migrations, EmbeddedMigrations};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();
