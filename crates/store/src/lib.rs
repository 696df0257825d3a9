//! Persistent state shared by the weather service and the subscription API:
//! watched relays, subscribers and their per-kind notification subscriptions.

pub mod migrations;
pub mod models;
pub mod pool;
pub mod repository;

pub use pool::{LibsqlManager, LibsqlPool};
pub use repository::{LibsqlStore, SubscriptionStore};

use anyhow::Result;

/// Open the database at `path`, run migrations and hand back a pooled store.
pub async fn open(path: &str) -> Result<LibsqlStore> {
    let database = libsql::Builder::new_local(path).build().await?;

    let conn = database.connect()?;
    migrations::run_migrations(&conn).await?;

    let pool = LibsqlPool::builder(LibsqlManager::new(database)).build()?;
    Ok(LibsqlStore::new_from_pool(pool))
}
