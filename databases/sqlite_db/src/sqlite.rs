// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # SQLite registry backend.
//!
//! Stores registry records in a single SQLite table. Several processes on the
//! same host can share one database file and see each other's node records,
//! which makes this backend a convenient directory for local clusters.
//!

use registry::{Error, RegistryAdapter};

use async_trait::async_trait;
use rusqlite::{params, Connection, OpenFlags};
use tracing::{debug, info};

use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::{fs, path::Path};

const DEFAULT_TABLE: &str = "registry";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite registry backend.
///
/// # Schema
///
/// `(key TEXT PRIMARY KEY, value BLOB NOT NULL)`
///
/// The connection is shared behind a mutex, so clones of the registry are
/// cheap and serialize their statements. Statements run on tokio's blocking
/// pool; a database locked by another process never holds up async tasks.
#[derive(Clone)]
pub struct SqliteRegistry {
    /// Thread-safe shared SQLite connection.
    conn: Arc<Mutex<Connection>>,
    /// Table holding the records.
    table: String,
}

impl SqliteRegistry {
    /// Opens or creates the registry database `registry.db` inside `path`.
    ///
    /// # Errors
    ///
    /// Returns `Error::CreateRegistry` if the directory cannot be created,
    /// the database cannot be opened or the table cannot be created.
    pub fn new(path: &str) -> Result<Self, Error> {
        Self::with_table(path, DEFAULT_TABLE)
    }

    /// Same as [`SqliteRegistry::new`] but stores records in `table`.
    ///
    /// # Errors
    ///
    /// Returns `Error::CreateRegistry` if `table` is not a plain identifier
    /// or the database cannot be prepared.
    pub fn with_table(path: &str, table: &str) -> Result<Self, Error> {
        if !is_identifier(table) {
            return Err(Error::CreateRegistry(format!(
                "invalid SQLite table name: {}",
                table
            )));
        }

        info!("Creating SQLite registry");
        if !Path::new(&path).exists() {
            info!("Path does not exist, creating it");
            fs::create_dir_all(path).map_err(|e| {
                Error::CreateRegistry(format!(
                    "fail SQLite create directory: {}",
                    e
                ))
            })?;
        }

        let conn = open(format!("{}/registry.db", path))?;
        let stmt = format!(
            "CREATE TABLE IF NOT EXISTS {} (key TEXT NOT NULL, value \
            BLOB NOT NULL, PRIMARY KEY (key))",
            table
        );
        conn.execute(stmt.as_str(), ()).map_err(|e| {
            Error::CreateRegistry(format!("fail SQLite create table: {}", e))
        })?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            table: table.to_owned(),
        })
    }

    /// Runs `statement` against the shared connection on the blocking pool.
    async fn run<T, F>(&self, statement: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, &str) -> Result<T, Error> + Send + 'static,
    {
        let conn = self.conn.clone();
        let table = self.table.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|e| {
                Error::Unavailable(format!("sqlite open connection: {}", e))
            })?;
            statement(&conn, &table)
        })
        .await
        .map_err(|e| Error::Unavailable(format!("sqlite task failed: {}", e)))?
    }
}

#[async_trait]
impl RegistryAdapter for SqliteRegistry {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        let (key, value) = (key.to_owned(), value.to_vec());
        self.run(move |conn, table| {
            let stmt = format!(
                "INSERT OR REPLACE INTO {} (key, value) VALUES (?1, ?2)",
                table
            );
            conn.execute(&stmt, params![key, value]).map_err(|e| {
                Error::Unavailable(format!("sqlite insert error: {}", e))
            })?;
            Ok(())
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let key = key.to_owned();
        self.run(move |conn, table| {
            let query = format!("SELECT value FROM {} WHERE key = ?1", table);
            match conn.query_row(&query, params![key], |row| row.get(0)) {
                Ok(value) => Ok(Some(value)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => {
                    Err(Error::Unavailable(format!("sqlite query error: {}", e)))
                }
            }
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        let key = key.to_owned();
        self.run(move |conn, table| {
            let stmt = format!("DELETE FROM {} WHERE key = ?1", table);
            let deleted = conn.execute(&stmt, params![key]).map_err(|e| {
                Error::Unavailable(format!("sqlite delete error: {}", e))
            })?;
            debug!("Deleted {} SQLite registry rows for '{}'.", deleted, key);
            Ok(())
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, Error> {
        let prefix = prefix.to_owned();
        self.run(move |conn, table| {
            // substr keeps '%' and '_' in the prefix literal, unlike LIKE.
            let query = format!(
                "SELECT key, value FROM {} WHERE substr(key, 1, length(?1)) = ?1 \
                ORDER BY key ASC",
                table
            );
            let mut stmt = conn.prepare(&query).map_err(|e| {
                Error::Unavailable(format!("sqlite prepare error: {}", e))
            })?;
            let rows = stmt
                .query_map(params![prefix], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(|e| {
                    Error::Unavailable(format!("sqlite query error: {}", e))
                })?;
            rows.collect::<Result<Vec<(String, Vec<u8>)>, _>>().map_err(|e| {
                Error::Unavailable(format!("sqlite row error: {}", e))
            })
        })
        .await
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

/// Open a SQLite database connection.
fn open<P: AsRef<Path>>(path: P) -> Result<Connection, Error> {
    let path = path.as_ref();
    let flags =
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let conn = Connection::open_with_flags(path, flags).map_err(|e| {
        Error::CreateRegistry(format!("SQLite failed to open connection: {}", e))
    })?;

    conn.busy_timeout(BUSY_TIMEOUT).map_err(|e| {
        Error::CreateRegistry(format!("SQLite failed to set busy timeout: {}", e))
    })?;

    conn.execute_batch(
        "
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        ",
    )
    .map_err(|e| {
        Error::CreateRegistry(format!("SQLite failed to execute batch: {}", e))
    })?;

    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> String {
        let dir =
            tempfile::tempdir().expect("Can not create temporal directory.");
        dir.path().to_str().unwrap().to_owned()
    }

    impl Default for SqliteRegistry {
        fn default() -> Self {
            SqliteRegistry::new(&temp_dir()).expect("Cannot open the registry")
        }
    }

    registry::test_registry_adapter! {
        unit_test_sqlite_registry: SqliteRegistry
    }

    #[test]
    fn test_rejects_bad_table_names() {
        let path = temp_dir();
        for table in ["", "1nodes", "nodes; DROP TABLE x", "a-b"] {
            assert!(matches!(
                SqliteRegistry::with_table(&path, table),
                Err(Error::CreateRegistry(_))
            ));
        }
        assert!(SqliteRegistry::with_table(&path, "cluster_nodes").is_ok());
    }

    #[tokio::test]
    async fn test_locked_database_does_not_block_the_runtime() {
        let path = temp_dir();
        let registry = SqliteRegistry::new(&path).unwrap();
        let holder = open(format!("{}/registry.db", path)).unwrap();
        holder.execute_batch("BEGIN IMMEDIATE").unwrap();

        let put = tokio::spawn({
            let registry = registry.clone();
            async move { registry.put("nodes/a", b"v").await }
        });
        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!put.is_finished());

        holder.execute_batch("COMMIT").unwrap();
        put.await.unwrap().unwrap();
        assert_eq!(registry.get("nodes/a").await.unwrap(), Some(b"v".to_vec()));
    }
}
