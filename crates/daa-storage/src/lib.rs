//! Embedded SQLite store that receives the brand-partitioned extracts.

use std::path::{Path, PathBuf};

use daa_core::{is_identifier, LocalTable, Table, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

pub mod sqlite;

use sqlite::{bind_value, table_from_rows};

pub const CRATE_NAME: &str = "daa-storage";

/// Kept well below SQLite's bound-parameter limit.
const MAX_PARAMS_PER_INSERT: usize = 900;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("invalid identifier `{0}`")]
    InvalidIdentifier(String),
    #[error("table `{0}` has no columns")]
    EmptyColumns(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: &'static str,
    pub table: LocalTable,
    pub columns: &'static [&'static str],
}

/// Lookup indexes for the downstream analysis joins.
pub const ANALYSIS_INDEXES: [IndexSpec; 7] = [
    IndexSpec {
        name: "idx_orders_brand",
        table: LocalTable::Orders,
        columns: &["brand"],
    },
    IndexSpec {
        name: "idx_orders_uid",
        table: LocalTable::Orders,
        columns: &["uid"],
    },
    IndexSpec {
        name: "idx_orders_pay_time",
        table: LocalTable::Orders,
        columns: &["pay_time"],
    },
    IndexSpec {
        name: "idx_orders_subscribe_id",
        table: LocalTable::Orders,
        columns: &["subscribe_id"],
    },
    IndexSpec {
        name: "idx_subscribe_id",
        table: LocalTable::Subscribe,
        columns: &["subscribe_id"],
    },
    IndexSpec {
        name: "idx_cloud_order_id",
        table: LocalTable::CloudInfo,
        columns: &["order_id"],
    },
    IndexSpec {
        name: "idx_amount_order_id",
        table: LocalTable::OrderAmountInfo,
        columns: &["order_int_id"],
    },
];

pub const FIRST_PAY_INDEX: IndexSpec = IndexSpec {
    name: "idx_first_pay_subscribe_id",
    table: LocalTable::SubscribeFirstPay,
    columns: &["subscribe_id", "brand"],
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrandCount {
    pub brand: String,
    pub rows: i64,
}

#[derive(Debug, Clone)]
pub struct LocalStore {
    path: PathBuf,
    pool: SqlitePool,
}

impl LocalStore {
    /// Deletes any existing store file and opens a fresh one.
    pub async fn recreate(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        match fs::remove_file(&path).await {
            Ok(()) => info!(path = %path.display(), "removed previous store"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(StoreError::Io {
                    action: "removing",
                    path: path.display().to_string(),
                    source,
                })
            }
        }
        Self::open(path).await
    }

    /// Opens the store file, creating it (and its directory) when missing.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    action: "creating",
                    path: parent.display().to_string(),
                    source,
                })?;
        }
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { path, pool })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inserts rows after any existing content, creating the table on first use.
    pub async fn append(&self, table: &str, rows: &Table) -> Result<u64> {
        let table = store_identifier(table)?;
        if rows.columns.is_empty() {
            return Err(StoreError::EmptyColumns(table.to_string()));
        }
        let columns = rows
            .columns
            .iter()
            .map(|c| store_identifier(c))
            .collect::<Result<Vec<_>>>()?;

        let mut tx = self.pool.begin().await?;
        if table_exists_in(&mut *tx, table).await? {
            let existing = column_names_in(&mut *tx, table).await?;
            for (idx, column) in columns.iter().enumerate() {
                if !existing.iter().any(|e| e.as_str() == *column) {
                    let ddl = format!(
                        "ALTER TABLE \"{table}\" ADD COLUMN \"{column}\" {}",
                        declared_type(rows, idx)
                    );
                    sqlx::query(&ddl).execute(&mut *tx).await?;
                }
            }
        } else {
            let definitions = columns
                .iter()
                .enumerate()
                .map(|(idx, column)| format!("\"{column}\" {}", declared_type(rows, idx)))
                .collect::<Vec<_>>()
                .join(", ");
            let ddl = format!("CREATE TABLE \"{table}\" ({definitions})");
            sqlx::query(&ddl).execute(&mut *tx).await?;
        }

        let column_list = columns
            .iter()
            .map(|c| format!("\"{c}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));
        let rows_per_insert = (MAX_PARAMS_PER_INSERT / columns.len()).max(1);

        let mut inserted = 0u64;
        for chunk in rows.rows.chunks(rows_per_insert) {
            let sql = format!(
                "INSERT INTO \"{table}\" ({column_list}) VALUES {}",
                vec![placeholders.as_str(); chunk.len()].join(", ")
            );
            let mut query = sqlx::query(&sql);
            for cell in chunk.iter().flatten() {
                query = bind_value(query, cell);
            }
            inserted += query.execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        debug!(table, rows = inserted, "appended");
        Ok(inserted)
    }

    /// Drops the table (if present) and writes `rows` as its only content.
    pub async fn replace(&self, table: &str, rows: &Table) -> Result<u64> {
        self.drop_table(table).await?;
        self.append(table, rows).await
    }

    pub async fn drop_table(&self, table: &str) -> Result<()> {
        let table = store_identifier(table)?;
        sqlx::query(&format!("DROP TABLE IF EXISTS \"{table}\""))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn create_index(&self, spec: &IndexSpec) -> Result<bool> {
        let table = spec.table.as_str();
        if !self.table_exists(table).await? {
            warn!(index = spec.name, table, "skipping index on missing table");
            return Ok(false);
        }
        let columns = spec
            .columns
            .iter()
            .map(|c| format!("\"{c}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let ddl = format!(
            "CREATE INDEX IF NOT EXISTS \"{}\" ON \"{table}\" ({columns})",
            spec.name
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(true)
    }

    /// Creates [`ANALYSIS_INDEXES`]; returns the names that were created.
    pub async fn build_indexes(&self) -> Result<Vec<&'static str>> {
        let mut created = Vec::new();
        for spec in &ANALYSIS_INDEXES {
            if self.create_index(spec).await? {
                created.push(spec.name);
            }
        }
        info!(count = created.len(), "indexes built");
        Ok(created)
    }

    pub async fn index_names(&self, table: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = ? ORDER BY name",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>(0).map_err(StoreError::from))
            .collect()
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        table_exists_in(&mut *conn, table).await
    }

    /// Row count per brand, ordered by brand. Empty when the table does not exist.
    pub async fn brand_counts(&self, table: &str) -> Result<Vec<BrandCount>> {
        let table = store_identifier(table)?;
        if !self.table_exists(table).await? {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT brand, COUNT(*) AS cnt FROM \"{table}\" GROUP BY brand ORDER BY brand"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<BrandCount> {
                Ok(BrandCount {
                    brand: row.try_get::<Option<String>, _>(0)?.unwrap_or_default(),
                    rows: row.try_get(1)?,
                })
            })
            .collect()
    }

    /// Reads a whole table back, optionally restricted to one brand.
    pub async fn read_table(&self, table: &str, brand: Option<&str>) -> Result<Table> {
        let table = store_identifier(table)?;
        let (sql, params) = match brand {
            Some(brand) => (
                format!("SELECT * FROM \"{table}\" WHERE brand = ?"),
                vec![Value::from(brand)],
            ),
            None => (format!("SELECT * FROM \"{table}\""), Vec::new()),
        };
        let mut query = sqlx::query(&sql);
        for param in &params {
            query = bind_value(query, param);
        }
        let rows = query.fetch_all(&self.pool).await?;
        if rows.is_empty() {
            let mut conn = self.pool.acquire().await?;
            return Ok(Table::new(column_names_in(&mut *conn, table).await?));
        }
        Ok(table_from_rows(&rows)?)
    }

    pub async fn file_size(&self) -> Result<u64> {
        let metadata = fs::metadata(&self.path)
            .await
            .map_err(|source| StoreError::Io {
                action: "reading metadata of",
                path: self.path.display().to_string(),
                source,
            })?;
        Ok(metadata.len())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

fn store_identifier(name: &str) -> Result<&str> {
    if is_identifier(name) {
        Ok(name)
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

/// SQLite column type from the first non-null cell; untyped when every cell is null.
fn declared_type(table: &Table, idx: usize) -> &'static str {
    table
        .rows
        .iter()
        .map(|row| &row[idx])
        .find(|cell| !cell.is_null())
        .map(|cell| match cell {
            Value::Int(_) => "INTEGER",
            Value::Float(_) => "REAL",
            Value::Text(_) | Value::Null => "TEXT",
        })
        .unwrap_or("")
}

async fn table_exists_in(conn: &mut sqlx::SqliteConnection, table: &str) -> Result<bool> {
    let found: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(found.is_some())
}

async fn column_names_in(conn: &mut sqlx::SqliteConnection, table: &str) -> Result<Vec<String>> {
    let rows = sqlx::query(&format!("PRAGMA table_info(\"{table}\")"))
        .fetch_all(&mut *conn)
        .await?;
    rows.iter()
        .map(|row| row.try_get::<String, _>("name").map_err(StoreError::from))
        .collect()
}
