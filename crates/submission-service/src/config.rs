//! Binary-level configuration: the Store connection plus the scheduler timing table (§6, §10.3).

use std::env;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use scheduler_core::SchedulerConfig;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub port: u16,
    pub scheduler: SchedulerConfig,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("DATABASE_MAX_CONNECTIONS must be a valid number")?,
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            scheduler: SchedulerConfig::from_env().context("failed to load scheduler configuration")?,
        })
    }
}
