//! Application state for the Tidemark API

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::sqlite::SqlitePoolOptions;

use tidemark_core::ledger::{self, TenantStore, UsageLedger};
use tidemark_core::{AssetResolver, Pipeline, PipelineConfig, QpdfDecryptor, StorageConfig};

pub struct AppState {
    pub tenants: TenantStore,
    pub pipeline: Pipeline,
    /// Shared secret every request must present as a bearer token.
    pub api_key: String,
}

impl AppState {
    pub async fn new() -> Result<Self> {
        let api_key =
            std::env::var("TIDEMARK_API_KEY").context("TIDEMARK_API_KEY must be set")?;

        let db_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite:tidemark.db?mode=rwc".to_string());
        tracing::info!("Connecting to database: {}", db_url);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;
        ledger::migrate(&pool).await?;

        let storage = StorageConfig::from_env()?;
        tracing::info!("Brand-asset store: {:?} ({})", storage.provider, storage.bucket);
        let store = storage.build_object_store()?;

        let config = PipelineConfig::from_env();
        let decryptor = Arc::new(QpdfDecryptor::new(config.decrypt.clone()));

        let pipeline = Pipeline::new(
            decryptor,
            AssetResolver::new(store),
            UsageLedger::new(pool.clone()),
            config,
        );

        Ok(Self {
            tenants: TenantStore::new(pool),
            pipeline,
            api_key,
        })
    }
}
