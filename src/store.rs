// src/store.rs
use crate::error::{RuntimeError, RuntimeResult};
use crate::types::DisplayRegistrationRecord;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS display_keys (
        key_alias      TEXT PRIMARY KEY,
        secret_key_b64 TEXT NOT NULL,
        public_key_pem TEXT NOT NULL,
        created_at     TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS display_registrations (
        display_slug        TEXT PRIMARY KEY,
        display_id          TEXT NOT NULL,
        key_id              TEXT NOT NULL,
        key_alias           TEXT NOT NULL,
        display_fingerprint TEXT NOT NULL,
        display_output      TEXT NOT NULL,
        registered_at       TEXT NOT NULL
    )
    "#,
];

#[derive(Debug, Clone)]
pub struct StoredKey {
    pub key_alias: String,
    pub secret_key_b64: String,
    pub public_key_pem: String,
    pub created_at: DateTime<Utc>,
}

/// Durable device-local state: keypairs by alias, registration records by slug.
#[derive(Clone)]
pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    pub async fn open(path: impl AsRef<Path>) -> RuntimeResult<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        Self::connect(opts).await
    }

    pub async fn in_memory() -> RuntimeResult<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| RuntimeError::Identity(format!("local store options: {e}")))?;
        Self::connect(opts).await
    }

    async fn connect(opts: SqliteConnectOptions) -> RuntimeResult<Self> {
        // One long-lived connection; an in-memory database dies with its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await
            .map_err(|e| RuntimeError::Identity(format!("local store unavailable: {e}")))?;

        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    // ---------- KEYS ---------- //

    /// Inserts unless a key already exists under `alias`; the first writer wins.
    pub async fn insert_key_if_absent(&self, key: &StoredKey) -> RuntimeResult<()> {
        sqlx::query(
            "INSERT INTO display_keys (key_alias, secret_key_b64, public_key_pem, created_at)
             VALUES ($1,$2,$3,$4)
             ON CONFLICT(key_alias) DO NOTHING",
        )
        .bind(&key.key_alias)
        .bind(&key.secret_key_b64)
        .bind(&key.public_key_pem)
        .bind(key.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn key(&self, alias: &str) -> RuntimeResult<Option<StoredKey>> {
        let row = sqlx::query(
            "SELECT key_alias, secret_key_b64, public_key_pem, created_at
             FROM display_keys WHERE key_alias=$1",
        )
        .bind(alias)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| StoredKey {
            key_alias: r.get("key_alias"),
            secret_key_b64: r.get("secret_key_b64"),
            public_key_pem: r.get("public_key_pem"),
            created_at: r.get("created_at"),
        }))
    }

    // ---------- REGISTRATIONS ---------- //

    /// Stores `record`, replacing any earlier registration of the same slug.
    pub async fn save_registration(&self, record: &DisplayRegistrationRecord) -> RuntimeResult<()> {
        sqlx::query(
            r#"
            INSERT INTO display_registrations
                (display_slug, display_id, key_id, key_alias, display_fingerprint, display_output, registered_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7)
            ON CONFLICT(display_slug) DO UPDATE
              SET display_id=excluded.display_id,
                  key_id=excluded.key_id,
                  key_alias=excluded.key_alias,
                  display_fingerprint=excluded.display_fingerprint,
                  display_output=excluded.display_output,
                  registered_at=excluded.registered_at
            "#,
        )
        .bind(&record.display_slug)
        .bind(&record.display_id)
        .bind(&record.key_id)
        .bind(&record.key_alias)
        .bind(&record.display_fingerprint)
        .bind(&record.display_output)
        .bind(record.registered_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn registration(&self, slug: &str) -> RuntimeResult<Option<DisplayRegistrationRecord>> {
        let row = sqlx::query(
            "SELECT display_slug, display_id, key_id, key_alias, display_fingerprint, display_output, registered_at
             FROM display_registrations WHERE display_slug=$1",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| record_from_row(&r)))
    }

    pub async fn registrations(&self) -> RuntimeResult<Vec<DisplayRegistrationRecord>> {
        let rows = sqlx::query(
            "SELECT display_slug, display_id, key_id, key_alias, display_fingerprint, display_output, registered_at
             FROM display_registrations ORDER BY display_slug ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(record_from_row).collect())
    }
}

fn record_from_row(r: &sqlx::sqlite::SqliteRow) -> DisplayRegistrationRecord {
    DisplayRegistrationRecord {
        display_id: r.get("display_id"),
        display_slug: r.get("display_slug"),
        key_id: r.get("key_id"),
        key_alias: r.get("key_alias"),
        display_fingerprint: r.get("display_fingerprint"),
        display_output: r.get("display_output"),
        registered_at: r.get("registered_at"),
    }
}
