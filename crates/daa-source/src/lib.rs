//! Remote data source contracts plus the tunnelled MySQL and SQLite fixture implementations.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use daa_core::{is_identifier, Table, Value};
use sqlx::database::HasStatementCache;
use sqlx::mysql::{MySql, MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::{Column, ConnectOptions, Connection, Database, Executor, Row, TypeInfo, ValueRef};
use thiserror::Error;
use tracing::{debug, info};

mod fixture;
mod tunnel;

pub use fixture::SqliteFixtureSource;
pub use tunnel::SshTunnel;

pub const CRATE_NAME: &str = "daa-source";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("remote source is not connected; call connect() first")]
    NotConnected,
    #[error("ssh tunnel via {host}:{port} failed: {message}")]
    Tunnel {
        host: String,
        port: u16,
        message: String,
    },
    #[error("ssh authentication rejected for user `{user}`")]
    Auth { user: String },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("unknown schema `{0}`")]
    UnknownSchema(String),
    #[error("invalid identifier `{0}`")]
    InvalidIdentifier(String),
    #[error("cannot decode column `{column}` of type {type_name}")]
    Decode { column: String, type_name: String },
    #[error("reading fixture {path}: {source}")]
    Fixture {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A read-only tabular source that can hop between schemas on one server.
#[async_trait]
pub trait RemoteSource: Send {
    async fn connect(&mut self) -> Result<(), SourceError>;

    /// Runs a read query with positional `?` parameters and materializes every row.
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Table, SourceError>;

    async fn switch_schema(&mut self, schema: &str) -> Result<(), SourceError>;

    fn current_schema(&self) -> Option<&str>;

    /// Releases the connection and then the tunnel. Safe to call when already closed.
    async fn close(&mut self) -> Result<(), SourceError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

pub fn validate_identifier(name: &str) -> Result<&str, SourceError> {
    if is_identifier(name) {
        Ok(name)
    } else {
        Err(SourceError::InvalidIdentifier(name.to_string()))
    }
}

/// MySQL reached through an SSH bastion.
pub struct TunneledMySqlSource {
    tunnel_config: TunnelConfig,
    database: DatabaseConfig,
    schema: String,
    tunnel: Option<SshTunnel>,
    conn: Option<MySqlConnection>,
}

impl TunneledMySqlSource {
    pub fn new(
        tunnel_config: TunnelConfig,
        database: DatabaseConfig,
        initial_schema: impl Into<String>,
    ) -> Self {
        Self {
            tunnel_config,
            database,
            schema: initial_schema.into(),
            tunnel: None,
            conn: None,
        }
    }

    fn connect_options(&self, local_port: u16) -> Result<MySqlConnectOptions, SourceError> {
        Ok(MySqlConnectOptions::new()
            .host("127.0.0.1")
            .port(local_port)
            .username(&self.database.user)
            .password(&self.database.password)
            .database(validate_identifier(&self.schema)?)
            .charset("utf8mb4")
            .disable_statement_logging())
    }

    async fn open_connection(&self, local_port: u16) -> Result<MySqlConnection, SourceError> {
        let options = self.connect_options(local_port)?;
        Ok(MySqlConnection::connect_with(&options).await?)
    }
}

#[async_trait]
impl RemoteSource for TunneledMySqlSource {
    async fn connect(&mut self) -> Result<(), SourceError> {
        if self.conn.is_some() {
            return Ok(());
        }
        info!(
            bastion = %self.tunnel_config.host,
            schema = %self.schema,
            "opening ssh tunnel"
        );
        let tunnel =
            SshTunnel::open(&self.tunnel_config, &self.database.host, self.database.port).await?;
        info!(local_port = tunnel.local_port(), "ssh tunnel established");

        match self.open_connection(tunnel.local_port()).await {
            Ok(conn) => {
                info!(schema = %self.schema, "mysql connection established");
                self.conn = Some(conn);
                self.tunnel = Some(tunnel);
                Ok(())
            }
            Err(err) => {
                tunnel.close().await;
                Err(err)
            }
        }
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Table, SourceError> {
        let conn = self.conn.as_mut().ok_or(SourceError::NotConnected)?;
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_mysql(query, param);
        }
        let rows = query.fetch_all(&mut *conn).await?;
        if rows.is_empty() {
            let describe = (&mut *conn).describe(sql).await?;
            return Ok(Table::new(
                describe.columns().iter().map(|c| c.name().to_string()).collect(),
            ));
        }
        table_from_mysql_rows(&rows)
    }

    async fn switch_schema(&mut self, schema: &str) -> Result<(), SourceError> {
        let schema = validate_identifier(schema)?;
        if let Some(conn) = self.conn.as_mut() {
            let dropped = rebind_schema(conn, &format!("USE `{schema}`")).await?;
            info!(schema, dropped, "switched schema");
        }
        self.schema = schema.to_string();
        Ok(())
    }

    fn current_schema(&self) -> Option<&str> {
        Some(self.schema.as_str())
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        let conn_result = match self.conn.take() {
            Some(conn) => conn.close().await,
            None => Ok(()),
        };
        if let Some(tunnel) = self.tunnel.take() {
            tunnel.close().await;
            info!("remote connection closed");
        }
        conn_result.map_err(SourceError::from)
    }
}

/// Runs a schema-changing statement and empties the prepared-statement cache.
///
/// MySQL executes a prepared statement in the schema that was current when it
/// was prepared, so cached statements keyed by SQL text would keep reading the
/// previous tenant. Returns how many cached statements were dropped.
async fn rebind_schema<C>(conn: &mut C, statement: &str) -> Result<usize, SourceError>
where
    C: Connection,
    C::Database: HasStatementCache,
    for<'c> &'c mut C: Executor<'c, Database = C::Database>,
{
    conn.execute(statement).await?;
    let dropped = conn.cached_statements_size();
    conn.clear_cached_statements().await?;
    Ok(dropped)
}

fn bind_mysql<'q>(
    query: sqlx::query::Query<'q, MySql, <MySql as Database>::Arguments<'q>>,
    value: &Value,
) -> sqlx::query::Query<'q, MySql, <MySql as Database>::Arguments<'q>> {
    match value {
        Value::Null => query.bind(Option::<i64>::None),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Text(s) => query.bind(s.clone()),
    }
}

fn table_from_mysql_rows(rows: &[MySqlRow]) -> Result<Table, SourceError> {
    let columns = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();
    let mut table = Table::new(columns);
    for row in rows {
        let cells = (0..row.len())
            .map(|idx| decode_mysql_value(row, idx))
            .collect::<Result<Vec<_>, _>>()?;
        table.push_row(cells);
    }
    Ok(table)
}

fn decode_mysql_value(row: &MySqlRow, idx: usize) -> Result<Value, SourceError> {
    if row.try_get_raw(idx)?.is_null() {
        return Ok(Value::Null);
    }
    let column = &row.columns()[idx];
    let type_name = column.type_info().name().to_ascii_uppercase();
    let decode_error = || SourceError::Decode {
        column: column.name().to_string(),
        type_name: type_name.clone(),
    };

    let value = match type_name.as_str() {
        "BOOLEAN" => Value::Int(i64::from(row.try_get::<bool, _>(idx)?)),
        name if name.ends_with("UNSIGNED") => {
            let raw: u64 = row.try_get_unchecked(idx)?;
            i64::try_from(raw)
                .map(Value::Int)
                .unwrap_or(Value::Float(raw as f64))
        }
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
            Value::Int(row.try_get_unchecked::<i64, _>(idx)?)
        }
        "FLOAT" => Value::Float(f64::from(row.try_get_unchecked::<f32, _>(idx)?)),
        "DOUBLE" => Value::Float(row.try_get_unchecked::<f64, _>(idx)?),
        "DECIMAL" => {
            let text: String = row.try_get_unchecked(idx)?;
            Value::Float(text.trim().parse().map_err(|_| decode_error())?)
        }
        "DATETIME" | "TIMESTAMP" => Value::Text(
            row.try_get_unchecked::<NaiveDateTime, _>(idx)?
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
        ),
        "DATE" => Value::Text(row.try_get_unchecked::<NaiveDate, _>(idx)?.to_string()),
        "TIME" => Value::Text(row.try_get_unchecked::<NaiveTime, _>(idx)?.to_string()),
        _ => match row.try_get_unchecked::<String, _>(idx) {
            Ok(text) => Value::Text(text),
            Err(_) => {
                let bytes: Vec<u8> = row.try_get_unchecked(idx).map_err(|_| decode_error())?;
                Value::Text(String::from_utf8_lossy(&bytes).into_owned())
            }
        },
    };
    debug!(column = column.name(), %type_name, "decoded");
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqliteConnection;

    fn offline_source() -> TunneledMySqlSource {
        TunneledMySqlSource::new(
            TunnelConfig {
                host: "bastion.invalid".into(),
                port: 22,
                user: "ops".into(),
                password: "secret".into(),
            },
            DatabaseConfig {
                host: "rds.invalid".into(),
                port: 3306,
                user: "reader".into(),
                password: "secret".into(),
            },
            "bi_center",
        )
    }

    #[test]
    fn identifiers_reject_quoting_tricks() {
        assert!(validate_identifier("nooie_bi_center").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("bi`; DROP TABLE x").is_err());
        assert!(validate_identifier("bi.center").is_err());
    }

    #[tokio::test]
    async fn schema_rebind_drops_prepared_statements() {
        let mut conn = SqliteConnection::connect("sqlite::memory:")
            .await
            .expect("connect");
        sqlx::raw_sql("CREATE TABLE \"order\" (id INTEGER)")
            .execute(&mut conn)
            .await
            .expect("create");
        for sql in ["SELECT id FROM \"order\"", "SELECT COUNT(*) FROM \"order\""] {
            sqlx::query(sql).fetch_all(&mut conn).await.expect("select");
        }
        assert_eq!(conn.cached_statements_size(), 2);

        let dropped = rebind_schema(&mut conn, "PRAGMA user_version = 2")
            .await
            .expect("rebind");
        assert_eq!(dropped, 2);
        assert_eq!(conn.cached_statements_size(), 0);

        sqlx::query("SELECT id FROM \"order\"")
            .fetch_all(&mut conn)
            .await
            .expect("select after rebind");
        assert_eq!(conn.cached_statements_size(), 1);
    }

    #[test]
    fn connect_options_target_the_current_schema() {
        let mut source = offline_source();
        let options = source.connect_options(40022).expect("options");
        assert_eq!(options.get_database(), Some("bi_center"));
        assert_eq!(options.get_port(), 40022);

        source.schema = "bi`center".into();
        assert!(matches!(
            source.connect_options(40022),
            Err(SourceError::InvalidIdentifier(_))
        ));
    }

    #[tokio::test]
    async fn mysql_source_requires_connect_before_query() {
        let mut source = offline_source();
        let err = source.query("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, SourceError::NotConnected));

        source.switch_schema("nooie_bi_center").await.expect("offline switch");
        assert_eq!(source.current_schema(), Some("nooie_bi_center"));

        source.close().await.expect("close when never opened");
        source.close().await.expect("close twice");
    }
}
