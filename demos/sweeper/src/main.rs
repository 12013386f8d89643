//! Session sweeper demo.
//!
//! Run with: cargo run -p sweeper-demo -- demos/sweeper/sweeper.toml
//!
//! Creates a handful of sessions, touches some of them, and lets the
//! background task swap out, back up and expire the rest. Stop with Ctrl-C.
//! Build with `--features mongodb` to run against a real server.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use sessionvault_core::{AttributeValue, ManagerConfig};
use sessionvault_session::SessionManager;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sessionvault_session=debug".into()),
        )
        .init();

    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => ManagerConfig::load(&path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ManagerConfig::new("demo")
            .with_background_interval(Duration::from_secs(2))
            .with_process_expires_frequency(1)
            .with_max_idle_swap(4)
            .with_default_max_inactive_interval(20),
    };

    let manager = Arc::new(build_manager(config).await?);
    manager.start().await?;

    let mut ids = Vec::new();
    for n in 0..12_i64 {
        let session = manager.create_session().await;
        manager
            .with_session(session.id(), |s| {
                s.set_attribute("visits", n);
            })
            .await?;
        ids.push(session.id().to_string());
    }
    tracing::info!(created = ids.len(), "Created demo sessions");

    let mut ticker = tokio::time::interval(Duration::from_secs(3));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                // Keep the first few sessions busy so only the rest go idle.
                for id in ids.iter().take(3) {
                    manager
                        .with_session(id, |s| {
                            let visits = s
                                .attribute("visits")
                                .and_then(AttributeValue::as_i64)
                                .unwrap_or(0);
                            s.set_attribute("visits", visits + 1);
                        })
                        .await?;
                }
                tracing::info!(
                    active = manager.active_count().await,
                    stored = manager.store().size().await?,
                    expired = manager.expired_count(),
                    "Session status"
                );
            }
        }
    }

    manager.stop().await?;
    Ok(())
}

#[cfg(not(feature = "mongodb"))]
async fn build_manager(config: ManagerConfig) -> anyhow::Result<SessionManager> {
    use sessionvault_session::storage::MemoryServer;

    let server = MemoryServer::new();
    let collection = server.collection(&config.database_name, &config.collection_name);
    Ok(SessionManager::builder(config)
        .collection(collection)
        .build()
        .await?)
}

#[cfg(feature = "mongodb")]
async fn build_manager(config: ManagerConfig) -> anyhow::Result<SessionManager> {
    use sessionvault_session::storage::MongoDriver;

    Ok(SessionManager::builder(config)
        .driver(Arc::new(MongoDriver))
        .build()
        .await?)
}
