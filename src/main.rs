//! Mediarel - bring a media store up to date
//!
//! Loads the configuration, applies pending migrations, checks that the
//! payload storage root is usable and reports what the store holds.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mediarel::{
    config::Config,
    db,
    models::{File, Image, Video},
    services::{FileLifecycle, MediaService},
    storage::FilesystemStorage,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mediarel=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::var("MEDIAREL_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.yml"));
    let config = Config::load_with_env(&config_path)?;
    tracing::info!("Configuration loaded from {}", config_path.display());

    // Initialize database
    let pool = db::create_pool(&config.database).await?;
    tracing::info!("Database connected: {:?}", config.database.driver);

    let applied = db::migrations::run_migrations(&pool).await?;
    tracing::info!("Database migrations completed ({} applied)", applied);

    // Check payload storage
    tokio::fs::create_dir_all(&config.storage.root)
        .await
        .with_context(|| format!("Failed to create storage root {:?}", config.storage.root))?;
    let storage = Arc::new(FilesystemStorage::new(&config.storage.root));
    storage
        .validate()
        .await
        .with_context(|| format!("Storage root {:?} is not usable", config.storage.root))?;
    tracing::info!("Storage ready at {}", config.storage.root.display());

    let files = Arc::new(FileLifecycle::new(storage, config.storage.clone()));
    let images = MediaService::<Image>::from_pool(pool.clone(), files.clone());
    let documents = MediaService::<File>::from_pool(pool.clone(), files.clone());
    let videos = MediaService::<Video>::from_pool(pool.clone(), files);

    tracing::info!(
        images = images.list().await?.len(),
        files = documents.list().await?.len(),
        videos = videos.list().await?.len(),
        "Media store is up to date"
    );

    pool.close().await;
    Ok(())
}
