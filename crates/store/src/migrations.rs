use anyhow::Result;
use libsql::Connection;

/// Schema version - increment when making schema changes
const SCHEMA_VERSION: i32 = 1;

/// Run database migrations.
///
/// The weather service owns the schema; the subscription API opens the same
/// database and only expects the tables to exist.
pub async fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL,
            description TEXT
        )",
        (),
    )
    .await?;

    let current_version = get_current_version(conn).await?;

    if current_version >= SCHEMA_VERSION {
        tracing::debug!("Database schema is up to date (version {})", current_version);
        return Ok(());
    }

    tracing::info!("Running migrations from version {} to {}", current_version, SCHEMA_VERSION);

    if current_version < 1 {
        run_migration_v1(conn).await?;
        record_migration(conn, 1, "Initial schema").await?;
    }

    Ok(())
}

/// Get current schema version from database
async fn get_current_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn.query("SELECT MAX(version) FROM schema_migrations", ()).await?;

    if let Some(row) = rows.next().await? {
        let version: Option<i32> = row.get(0)?;
        Ok(version.unwrap_or(0))
    } else {
        Ok(0)
    }
}

/// Record that a migration was applied
async fn record_migration(conn: &Connection, version: i32, description: &str) -> Result<()> {
    let now = chrono::Utc::now().timestamp();

    conn.execute(
        "INSERT INTO schema_migrations (version, applied_at, description) VALUES (?, ?, ?)",
        libsql::params![version, now, description],
    )
    .await?;

    tracing::info!("Applied migration v{}: {}", version, description);
    Ok(())
}

async fn run_migration_v1(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS relays (
            fingerprint TEXT PRIMARY KEY,
            nickname TEXT NOT NULL DEFAULT 'Unnamed',
            welcomed INTEGER NOT NULL DEFAULT 0,
            last_seen INTEGER NOT NULL,
            up INTEGER NOT NULL DEFAULT 1,
            exit INTEGER NOT NULL DEFAULT 0
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subscribers (
            email TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            confirmed INTEGER NOT NULL DEFAULT 0,
            confirm_token TEXT NOT NULL,
            unsubscribe_token TEXT NOT NULL,
            preferences_token TEXT NOT NULL,
            subscribed_at INTEGER NOT NULL,
            PRIMARY KEY (email, fingerprint)
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS node_down_subs (
            email TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            triggered INTEGER NOT NULL DEFAULT 0,
            grace_hours INTEGER NOT NULL,
            last_changed INTEGER NOT NULL,
            notified INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (email, fingerprint)
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS version_subs (
            email TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            notify_type TEXT NOT NULL DEFAULT 'obsolete',
            notified INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (email, fingerprint)
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS bandwidth_subs (
            email TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            threshold_kbps INTEGER NOT NULL,
            notified INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (email, fingerprint)
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS dns_fail_subs (
            email TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            triggered INTEGER NOT NULL DEFAULT 0,
            grace_hours INTEGER NOT NULL,
            last_changed INTEGER NOT NULL,
            notified INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (email, fingerprint)
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        (),
    )
    .await?;

    Ok(())
}
