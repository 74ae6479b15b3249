use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::config::DbConnectionConfig;
use crate::error::DbConnectionError;
use crate::utils::sanitize_database_url;

pub type DbPool = SqlitePool;

// SQLite memory database patterns for efficient checking
pub const SQLITE_MEMORY_PATTERNS: &[&[u8]] = &[b":memory:", b"mode=memory"];

/// Creates a new connection pool using the provided configuration.
///
/// In-memory databases live and die with their connection, so for those the
/// pool is pinned to a single connection that never idles out.
pub async fn create_pool(config: &DbConnectionConfig) -> Result<DbPool, DbConnectionError> {
    let url = config.url.trim();
    if url.is_empty() {
        return Err(DbConnectionError::EmptyDatabaseUrl);
    }

    let in_memory = is_memory_url(url);
    if !in_memory {
        ensure_sqlite_db_file_exists(url)?;
    }

    let mut connect = SqliteConnectOptions::from_str(url)?
        .busy_timeout(config.busy_timeout())
        .foreign_keys(true);
    if !in_memory {
        connect = connect.journal_mode(SqliteJournalMode::Wal);
    }

    let mut opts = SqlitePoolOptions::new().acquire_timeout(config.connect_timeout());
    if in_memory {
        opts = opts
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    } else {
        opts = opts
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .idle_timeout(config.idle_timeout());
    }

    tracing::debug!(
        db_url = %sanitize_database_url(url),
        in_memory,
        max_connections = config.max_connections,
        "creating database pool"
    );

    opts.connect_with(connect).await.map_err(Into::into)
}

/// Returns true for DSNs that address a private in-memory database.
pub fn is_memory_url(url: &str) -> bool {
    let url_bytes = url.as_bytes();
    SQLITE_MEMORY_PATTERNS.iter().any(|&pattern| {
        url_bytes
            .windows(pattern.len())
            .any(|w| w.eq_ignore_ascii_case(pattern))
    })
}

fn ensure_sqlite_db_file_exists(database_url: &str) -> Result<(), DbConnectionError> {
    use std::fs::{create_dir_all, File};
    use std::io;
    use std::path::Path;

    /// Extract the file path from a SQLite connection URL.
    fn extract_path(url: &str) -> Option<&str> {
        let mut path = url;
        path = path
            .strip_prefix("sqlite://")
            .or_else(|| path.strip_prefix("sqlite:"))
            .unwrap_or(path);
        path = path.strip_prefix("file:").unwrap_or(path);

        if let Some(idx) = path.find('?') {
            path = &path[..idx];
        }

        let path = path.trim();
        if path.is_empty() {
            return None;
        }

        // On Windows: strip leading slash before drive letter ("/C:/...")
        if path.len() > 2 && path.starts_with('/') && path.as_bytes().get(2) == Some(&b':') {
            Some(&path[1..])
        } else {
            Some(path)
        }
    }

    let Some(clean_path) = extract_path(database_url) else {
        return Ok(());
    };

    let db_path = Path::new(clean_path);
    if let Some(parent) = db_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty() && !p.exists())
    {
        create_dir_all(parent).map_err(|e| {
            DbConnectionError::FileCreation(format!(
                "failed to create parent directory '{}': {e}",
                parent.display()
            ))
        })?;
    }

    if !db_path.exists() {
        File::create(db_path).map_err(|e| {
            let msg = if e.kind() == io::ErrorKind::PermissionDenied {
                format!("permission denied creating '{}': {e}", db_path.display())
            } else {
                format!("failed to create DB file '{}': {e}", db_path.display())
            };
            DbConnectionError::FileCreation(msg)
        })?;
    }

    Ok(())
}
