use sqlx::SqlitePool;
use tracing::debug;

use refinery_common::Result;

/// Idempotent schema setup. Every statement is safe to re-run: tables
/// and indexes are `IF NOT EXISTS`, later column additions go through
/// [`try_add_column`].
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS content_items (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            source_name TEXT NOT NULL,
            raw_text TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            processed_json TEXT,
            is_signal INTEGER NOT NULL DEFAULT 0,
            last_analyzed_at INTEGER,
            retry_count INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_content_items_hash ON content_items(content_hash)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_content_items_created ON content_items(created_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS signals (
            id TEXT PRIMARY KEY,
            source_item_ids TEXT NOT NULL,
            summary TEXT NOT NULL,
            analysis TEXT NOT NULL DEFAULT '',
            fact_check TEXT,
            sentiment TEXT NOT NULL DEFAULT 'neutral',
            relevance_score INTEGER NOT NULL DEFAULT 0,
            urgent INTEGER NOT NULL DEFAULT 0,
            tickers TEXT NOT NULL DEFAULT '[]',
            tags TEXT NOT NULL DEFAULT '[]',
            source_name TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_signals_created ON signals(created_at)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS channels (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            channel_type TEXT NOT NULL,
            feed_url TEXT,
            last_polled_at INTEGER,
            success_count INTEGER NOT NULL DEFAULT 0,
            failure_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'active',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS idx_channels_name ON channels(name)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS internal_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            module TEXT NOT NULL,
            message TEXT NOT NULL,
            context TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_internal_logs_created ON internal_logs(created_at)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Columns added after the initial schema shipped.
    try_add_column(pool, "content_items", "last_error TEXT").await;

    Ok(())
}

/// `ALTER TABLE ... ADD COLUMN`, ignoring the duplicate-column error so
/// the migration stays re-runnable.
async fn try_add_column(pool: &SqlitePool, table: &str, column_def: &str) {
    let sql = format!("ALTER TABLE {table} ADD COLUMN {column_def}");
    if let Err(e) = sqlx::query(&sql).execute(pool).await {
        debug!(table, column_def, error = %e, "Column already present, skipping");
    }
}
