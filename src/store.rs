//! SQLite persistence for parcels and the scan checkpoint.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Row, Sqlite, SqlitePool, Transaction,
};

use crate::parse::Parcel;
use crate::{Error, Result};

const CREATE_PARCELS: &str = r#"
    CREATE TABLE IF NOT EXISTS parcels (
        id INTEGER PRIMARY KEY,
        municipality_name TEXT,
        parcel_number TEXT,
        address TEXT,
        area REAL,
        owner_name TEXT,
        owner_ownership_type TEXT,
        owner_address TEXT,
        recorded_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
"#;

const CREATE_CHECKPOINT: &str = r#"
    CREATE TABLE IF NOT EXISTS scan_checkpoint (
        slot INTEGER PRIMARY KEY CHECK (slot = 1),
        last_id INTEGER NOT NULL,
        updated_at TEXT NOT NULL
    )
"#;

/// A stored parcel together with the time its row was written.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredParcel {
    pub parcel: Parcel,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub count: i64,
    pub min_id: Option<i64>,
    pub max_id: Option<i64>,
}

#[derive(Clone)]
pub struct ParcelStore {
    pool: SqlitePool,
}

impl ParcelStore {
    /// Opens (creating if needed) the database at `path` and makes sure the schema exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| Error::Config(format!("couldn't open {}: {e}", path.display())))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(CREATE_PARCELS).execute(&self.pool).await?;
        sqlx::query(CREATE_CHECKPOINT).execute(&self.pool).await?;
        Ok(())
    }

    /// Writes a batch and, optionally, a new checkpoint as one transaction.
    ///
    /// Rows are replaced on `id` so replaying a batch never duplicates anything.
    /// The checkpoint only ever moves forward.
    pub async fn insert_batch(
        &self,
        parcels: &[Parcel],
        checkpoint: Option<i64>,
    ) -> core::result::Result<(), sqlx::Error> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        write_parcels(&mut tx, parcels, now).await?;
        if let Some(last_id) = checkpoint {
            sqlx::query(
                r#"
                INSERT INTO scan_checkpoint (slot, last_id, updated_at) VALUES (1, $1, $2)
                ON CONFLICT(slot) DO UPDATE SET
                    last_id = MAX(last_id, excluded.last_id),
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(last_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    /// Last id known to be fully processed, if a scan ever committed one.
    pub async fn checkpoint(&self) -> Result<Option<i64>> {
        let last = sqlx::query_scalar::<_, i64>("SELECT last_id FROM scan_checkpoint WHERE slot = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(last)
    }

    pub async fn max_id(&self) -> Result<Option<i64>> {
        let max = sqlx::query_scalar::<_, Option<i64>>("SELECT MAX(id) FROM parcels")
            .fetch_one(&self.pool)
            .await?;
        Ok(max)
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let row = sqlx::query("SELECT COUNT(*) AS count, MIN(id) AS min_id, MAX(id) AS max_id FROM parcels")
            .fetch_one(&self.pool)
            .await?;
        Ok(StoreStats {
            count: row.try_get("count")?,
            min_id: row.try_get("min_id")?,
            max_id: row.try_get("max_id")?,
        })
    }

    pub async fn get(&self, id: i64) -> Result<Option<StoredParcel>> {
        let row = sqlx::query(
            r#"
            SELECT id, municipality_name, parcel_number, address, area,
                   owner_name, owner_ownership_type, owner_address, recorded_at
            FROM parcels WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(StoredParcel {
            parcel: Parcel {
                id: row.try_get("id")?,
                municipality_name: row.try_get("municipality_name")?,
                parcel_number: row.try_get("parcel_number")?,
                address: row.try_get("address")?,
                area: row.try_get("area")?,
                owner_name: row.try_get("owner_name")?,
                owner_ownership_type: row.try_get("owner_ownership_type")?,
                owner_address: row.try_get("owner_address")?,
            },
            recorded_at: row.try_get("recorded_at")?,
        }))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn write_parcels(
    tx: &mut Transaction<'_, Sqlite>,
    parcels: &[Parcel],
    recorded_at: DateTime<Utc>,
) -> core::result::Result<(), sqlx::Error> {
    for parcel in parcels {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO parcels (
                id, municipality_name, parcel_number, address, area,
                owner_name, owner_ownership_type, owner_address, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(parcel.id)
        .bind(&parcel.municipality_name)
        .bind(&parcel.parcel_number)
        .bind(&parcel.address)
        .bind(parcel.area)
        .bind(&parcel.owner_name)
        .bind(&parcel.owner_ownership_type)
        .bind(&parcel.owner_address)
        .bind(recorded_at)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}
