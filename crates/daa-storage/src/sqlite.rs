//! Cell codec between [`Value`] and SQLite rows, shared with the fixture source.

use daa_core::{Table, Value};
use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::{Column, Database, Row, TypeInfo, ValueRef};

pub type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, <Sqlite as Database>::Arguments<'q>>;

/// Binds one cell as a positional parameter.
pub fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(Option::<i64>::None),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Text(s) => query.bind(s.clone()),
    }
}

/// Materializes rows using each cell's storage class.
pub fn table_from_rows(rows: &[SqliteRow]) -> Result<Table, sqlx::Error> {
    let columns = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();
    let mut table = Table::new(columns);
    for row in rows {
        let cells = (0..row.len())
            .map(|idx| decode_value(row, idx))
            .collect::<Result<Vec<_>, _>>()?;
        table.push_row(cells);
    }
    Ok(table)
}

fn decode_value(row: &SqliteRow, idx: usize) -> Result<Value, sqlx::Error> {
    let storage_class = {
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            return Ok(Value::Null);
        }
        raw.type_info().name().to_ascii_uppercase()
    };
    let value = match storage_class.as_str() {
        "INTEGER" | "BOOLEAN" => Value::Int(row.try_get_unchecked::<i64, _>(idx)?),
        "REAL" | "NUMERIC" => Value::Float(row.try_get_unchecked::<f64, _>(idx)?),
        "BLOB" => {
            let bytes: Vec<u8> = row.try_get_unchecked(idx)?;
            Value::Text(String::from_utf8_lossy(&bytes).into_owned())
        }
        _ => Value::Text(row.try_get_unchecked::<String, _>(idx)?),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn cells_keep_their_storage_class() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("pool");
        let mut query =
            sqlx::query("SELECT ? AS id, ? AS amount, ? AS code, ? AS gone, x'6869' AS raw");
        for value in [
            Value::Int(7),
            Value::Float(4.99),
            Value::from("USD"),
            Value::Null,
        ] {
            query = bind_value(query, &value);
        }
        let rows = query.fetch_all(&pool).await.expect("select");
        let table = table_from_rows(&rows).expect("decode");

        assert_eq!(table.columns, vec!["id", "amount", "code", "gone", "raw"]);
        assert_eq!(
            table.rows,
            vec![vec![
                Value::Int(7),
                Value::Float(4.99),
                Value::from("USD"),
                Value::Null,
                Value::from("hi"),
            ]]
        );
        assert!(table_from_rows(&[]).expect("empty").columns.is_empty());
    }
}
