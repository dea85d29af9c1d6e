//! SQLite connection pools for the task store.
//!
//! All writes go through one connection, which serializes join get-or-create
//! and guarded status updates inside this process. Queries use a separate
//! read-only pool so list and graph requests never wait on the writer. Both
//! pools run in WAL mode with foreign keys enforced.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// Reader connections opened by [`DatabasePool::new`].
pub const DEFAULT_READERS: u32 = 8;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Reader and writer pools over one SQLite database.
#[derive(Clone)]
pub struct DatabasePool {
    /// Read-only, up to the configured number of connections.
    pub reader: SqlitePool,
    /// Exactly one connection.
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open the database at `database_url` with [`DEFAULT_READERS`] readers.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        Self::with_readers(database_url, DEFAULT_READERS).await
    }

    /// Open the database, apply pending migrations, then open `readers`
    /// read-only connections.
    pub async fn with_readers(database_url: &str, readers: u32) -> Result<Self, sqlx::Error> {
        let options = connect_options(database_url)?;

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await?;
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(readers.max(1))
            .connect_with(options.read_only(true))
            .await?;

        tracing::debug!(url = database_url, readers, "task store opened");
        Ok(Self { reader, writer })
    }

    /// Close both pools, waiting for checked-out connections.
    pub async fn close(&self) {
        self.reader.close().await;
        self.writer.close().await;
    }
}

fn connect_options(database_url: &str) -> Result<SqliteConnectOptions, sqlx::Error> {
    Ok(SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT))
}

/// `sqlite://{data_dir}/stepwise.db`.
pub fn database_url_in(data_dir: &Path) -> String {
    format!("sqlite://{}/stepwise.db", data_dir.display())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_in(dir: &tempfile::TempDir) -> DatabasePool {
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("store.db").display());
        DatabasePool::with_readers(&url, 2).await.unwrap()
    }

    #[tokio::test]
    async fn test_migrations_create_process_schema() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_in(&dir).await;

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name IN ('processes', 'tasks', 'task_links') \
             ORDER BY name",
        )
        .fetch_all(&pool.reader)
        .await
        .unwrap();
        let names: Vec<String> = tables.into_iter().map(|(name,)| name).collect();
        assert_eq!(names, ["processes", "task_links", "tasks"]);

        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_in(&dir).await;
        sqlx::query(
            "INSERT INTO processes (id, definition, created_at, modified_at) \
             VALUES ('p1', 'simple', '2025-06-01T00:00:00.000000Z', '2025-06-01T00:00:00.000000Z')",
        )
        .execute(&pool.writer)
        .await
        .unwrap();
        pool.close().await;

        let reopened = open_in(&dir).await;
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM processes")
            .fetch_one(&reopened.reader)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_task_requires_known_process() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_in(&dir).await;

        let orphan = sqlx::query(
            "INSERT INTO tasks (id, process_id, node_name, status, created_at, modified_at, completed) \
             VALUES ('t1', 'missing', 'start', 'scheduled', \
                     '2025-06-01T00:00:00.000000Z', '2025-06-01T00:00:00.000000Z', 0)",
        )
        .execute(&pool.writer)
        .await;
        assert!(orphan.is_err());
    }

    #[tokio::test]
    async fn test_reader_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_in(&dir).await;

        let write = sqlx::query(
            "INSERT INTO processes (id, definition, created_at, modified_at) \
             VALUES ('p1', 'simple', '2025-06-01T00:00:00.000000Z', '2025-06-01T00:00:00.000000Z')",
        )
        .execute(&pool.reader)
        .await;
        assert!(write.is_err());
    }

    #[test]
    fn test_database_url_in() {
        let url = database_url_in(Path::new("/var/lib/stepwise"));
        assert_eq!(url, "sqlite:///var/lib/stepwise/stepwise.db");
    }
}
