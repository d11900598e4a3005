//! SQLite-backed [`RemoteSource`] seeded from per-schema SQL scripts.
//!
//! Each schema lives in its own in-memory database, so the extraction SQL runs
//! unchanged against fixtures: backtick identifiers, `?` placeholders and
//! `IN (subquery)` all behave the same way they do on MySQL.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use daa_core::{Table, Value};
use daa_storage::sqlite::{bind_value, table_from_rows};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{Column, Executor};
use tracing::info;

use crate::{validate_identifier, RemoteSource, SourceError};

pub struct SqliteFixtureSource {
    schemas: BTreeMap<String, SqlitePool>,
    initial_schema: String,
    current: Option<String>,
}

impl SqliteFixtureSource {
    /// Builds one in-memory schema per `(name, sql script)` pair.
    pub async fn from_scripts<I, N, S>(
        initial_schema: impl Into<String>,
        scripts: I,
    ) -> Result<Self, SourceError>
    where
        I: IntoIterator<Item = (N, S)>,
        N: Into<String>,
        S: AsRef<str>,
    {
        let mut schemas = BTreeMap::new();
        for (name, script) in scripts {
            let name = name.into();
            validate_identifier(&name)?;
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect("sqlite::memory:")
                .await?;
            sqlx::raw_sql(script.as_ref()).execute(&pool).await?;
            schemas.insert(name, pool);
        }
        Ok(Self {
            schemas,
            initial_schema: initial_schema.into(),
            current: None,
        })
    }

    /// Loads every `<schema>.sql` file in `dir`.
    pub async fn from_dir(
        dir: impl AsRef<Path>,
        initial_schema: impl Into<String>,
    ) -> Result<Self, SourceError> {
        let dir = dir.as_ref();
        let fixture_error = |source: std::io::Error| SourceError::Fixture {
            path: dir.display().to_string(),
            source,
        };
        let mut scripts = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await.map_err(fixture_error)?;
        while let Some(entry) = entries.next_entry().await.map_err(fixture_error)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("sql") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let script = tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| SourceError::Fixture {
                    path: path.display().to_string(),
                    source,
                })?;
            scripts.push((stem.to_string(), script));
        }
        Self::from_scripts(initial_schema, scripts).await
    }

    /// Runs a statement directly against a schema, bypassing the connected state.
    pub async fn execute(&self, schema: &str, sql: &str) -> Result<(), SourceError> {
        let pool = self
            .schemas
            .get(schema)
            .ok_or_else(|| SourceError::UnknownSchema(schema.to_string()))?;
        sqlx::raw_sql(sql).execute(pool).await?;
        Ok(())
    }

    fn active_pool(&self) -> Result<&SqlitePool, SourceError> {
        let current = self.current.as_deref().ok_or(SourceError::NotConnected)?;
        self.schemas
            .get(current)
            .ok_or_else(|| SourceError::UnknownSchema(current.to_string()))
    }
}

#[async_trait]
impl RemoteSource for SqliteFixtureSource {
    async fn connect(&mut self) -> Result<(), SourceError> {
        if !self.schemas.contains_key(&self.initial_schema) {
            return Err(SourceError::UnknownSchema(self.initial_schema.clone()));
        }
        if self.current.is_none() {
            self.current = Some(self.initial_schema.clone());
            info!(schema = %self.initial_schema, "fixture source connected");
        }
        Ok(())
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Table, SourceError> {
        let pool = self.active_pool()?;
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_value(query, param);
        }
        let rows = query.fetch_all(pool).await?;
        if rows.is_empty() {
            let describe = pool.describe(sql).await?;
            return Ok(Table::new(
                describe.columns().iter().map(|c| c.name().to_string()).collect(),
            ));
        }
        Ok(table_from_rows(&rows)?)
    }

    async fn switch_schema(&mut self, schema: &str) -> Result<(), SourceError> {
        validate_identifier(schema)?;
        if !self.schemas.contains_key(schema) {
            return Err(SourceError::UnknownSchema(schema.to_string()));
        }
        if self.current.is_some() {
            self.current = Some(schema.to_string());
        } else {
            self.initial_schema = schema.to_string();
        }
        Ok(())
    }

    fn current_schema(&self) -> Option<&str> {
        Some(self.current.as_deref().unwrap_or(&self.initial_schema))
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        self.current = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALPHA: &str = "CREATE TABLE t (id INTEGER, label TEXT, price REAL, note TEXT);
        INSERT INTO t VALUES (1, 'a', 9.5, NULL), (2, 'b', 12.0, 'x');";
    const BETA: &str = "CREATE TABLE t (id INTEGER, label TEXT, price REAL, note TEXT);
        INSERT INTO t VALUES (7, 'z', 1.25, 'y');";

    async fn source() -> SqliteFixtureSource {
        SqliteFixtureSource::from_scripts("alpha", [("alpha", ALPHA), ("beta", BETA)])
            .await
            .expect("fixture")
    }

    #[tokio::test]
    async fn query_before_connect_is_rejected() {
        let mut source = source().await;
        let err = source.query("SELECT * FROM t", &[]).await.unwrap_err();
        assert!(matches!(err, SourceError::NotConnected));
    }

    #[tokio::test]
    async fn materializes_typed_cells_with_bound_params() {
        let mut source = source().await;
        source.connect().await.expect("connect");
        let table = source
            .query("SELECT id, label, price, note FROM t WHERE id >= ?", &[Value::Int(1)])
            .await
            .expect("query");
        assert_eq!(table.columns, vec!["id", "label", "price", "note"]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows[0], vec![
            Value::Int(1),
            Value::from("a"),
            Value::Float(9.5),
            Value::Null
        ]);
    }

    #[tokio::test]
    async fn empty_results_keep_their_column_names() {
        let mut source = source().await;
        source.connect().await.expect("connect");
        let table = source
            .query("SELECT id, label FROM t WHERE id > ?", &[Value::Int(100)])
            .await
            .expect("query");
        assert!(table.is_empty());
        assert_eq!(table.columns, vec!["id", "label"]);
    }

    #[tokio::test]
    async fn switching_schema_keeps_the_connection() {
        let mut source = source().await;
        source.connect().await.expect("connect");
        source.switch_schema("beta").await.expect("switch");
        assert_eq!(source.current_schema(), Some("beta"));
        let table = source.query("SELECT id FROM t", &[]).await.expect("query");
        assert_eq!(table.rows, vec![vec![Value::Int(7)]]);

        let err = source.switch_schema("gamma").await.unwrap_err();
        assert!(matches!(err, SourceError::UnknownSchema(_)));

        source.close().await.expect("close");
        source.close().await.expect("close twice");
        assert!(matches!(
            source.query("SELECT id FROM t", &[]).await.unwrap_err(),
            SourceError::NotConnected
        ));
    }
}
