//! SQLite-backed document store.
//!
//! Blobs and JSON documents live in two key-value tables. Every merge runs
//! as a single transaction on the connection thread, so a write is either
//! fully applied or not at all even if the awaiting caller goes away.

use crate::store::{apply_update, DocumentStore, Fields, StoreError, Update};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS blobs (
        key  TEXT PRIMARY KEY NOT NULL,
        data BLOB NOT NULL
    );
    CREATE TABLE IF NOT EXISTS documents (
        key        TEXT PRIMARY KEY NOT NULL,
        fields     TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
";

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Backend(format!("creating {}: {e}", parent.display()))
                })?;
            }
        }
        let conn = Connection::open(path).await?;
        tracing::info!(path = %path.display(), "opened sqlite store");
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

fn parse_fields(key: &str, raw: &str) -> Result<Fields, StoreError> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(other) => Err(StoreError::Corrupt {
            key: key.to_string(),
            reason: format!("expected object, found {other}"),
        }),
        Err(e) => Err(StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        }),
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let key = key.to_string();
        let blob = self
            .conn
            .call(move |conn| {
                let data = conn
                    .query_row("SELECT data FROM blobs WHERE key = ?1", params![key], |row| {
                        row.get::<_, Vec<u8>>(0)
                    })
                    .optional()?;
                Ok(data)
            })
            .await?;
        Ok(blob)
    }

    async fn put_blob(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let key = key.to_string();
        let bytes = bytes.to_vec();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO blobs (key, data) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET data = excluded.data",
                    params![key, bytes],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get_document(&self, key: &str) -> Result<Option<Fields>, StoreError> {
        let owned = key.to_string();
        let raw = self
            .conn
            .call(move |conn| {
                let raw = conn
                    .query_row(
                        "SELECT fields FROM documents WHERE key = ?1",
                        params![owned],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                Ok(raw)
            })
            .await?;
        raw.map(|r| parse_fields(key, &r)).transpose()
    }

    async fn merge_document(&self, key: &str, update: Update) -> Result<(), StoreError> {
        let key = key.to_string();
        self.conn
            .call(move |conn| {
                let now = Utc::now();
                let tx = conn.transaction()?;
                let existing = tx
                    .query_row(
                        "SELECT fields FROM documents WHERE key = ?1",
                        params![key],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;

                let mut fields = match existing {
                    Some(raw) => parse_fields(&key, &raw)
                        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(e.to_string().into()))?,
                    None => Fields::new(),
                };
                apply_update(&mut fields, update, now);

                let encoded = serde_json::Value::Object(fields).to_string();
                tx.execute(
                    "INSERT INTO documents (key, fields, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET fields = excluded.fields,
                                                    updated_at = excluded.updated_at",
                    params![key, encoded, now.to_rfc3339()],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn list_documents(&self, prefix: &str) -> Result<Vec<(String, Fields)>, StoreError> {
        let prefix = prefix.to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT key, fields FROM documents
                     WHERE substr(key, 1, length(?1)) = ?1
                     ORDER BY key",
                )?;
                let rows = stmt
                    .query_map(params![prefix], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(key, raw)| parse_fields(&key, &raw).map(|fields| (key, fields)))
            .collect()
    }
}
