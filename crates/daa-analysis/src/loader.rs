//! Reads `.csv` and `.json` exports into a [`Table`] for offline analysis.

use std::path::Path;

use daa_core::{Table, Value};
use thiserror::Error;
use tokio::fs;
use tracing::info;

/// Cells read as null in CSV input.
const CSV_NULLS: [&str; 5] = ["", "NA", "NaN", "null", "NULL"];

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("parsing json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("json input must be an array of objects, found {0}")]
    JsonShape(&'static str),
    #[error("unsupported file format `{0}`; expected .csv or .json")]
    UnsupportedFormat(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    Json,
}

impl FileFormat {
    pub fn from_path(path: &Path) -> Result<Self, LoadError> {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("csv") => Ok(FileFormat::Csv),
            Some("json") => Ok(FileFormat::Json),
            _ => Err(LoadError::UnsupportedFormat(path.display().to_string())),
        }
    }
}

/// Picks the parser from the file extension.
pub async fn load_table(path: &Path) -> Result<Table, LoadError> {
    let format = FileFormat::from_path(path)?;
    load_as(path, format).await
}

pub async fn load_as(path: &Path, format: FileFormat) -> Result<Table, LoadError> {
    let bytes = fs::read(path).await.map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let table = match format {
        FileFormat::Csv => parse_csv(&bytes)?,
        FileFormat::Json => parse_json(&bytes)?,
    };
    info!(path = %path.display(), rows = table.len(), columns = table.width(), "file loaded");
    Ok(table)
}

/// Header row names the columns; each cell becomes an int, a float or text.
pub fn parse_csv(bytes: &[u8]) -> Result<Table, LoadError> {
    let mut reader = csv::ReaderBuilder::new().from_reader(bytes);
    let columns = reader.headers()?.iter().map(String::from).collect();
    let mut table = Table::new(columns);
    for record in reader.records() {
        table.push_row(record?.iter().map(csv_cell).collect());
    }
    Ok(table)
}

fn csv_cell(raw: &str) -> Value {
    if CSV_NULLS.contains(&raw) {
        return Value::Null;
    }
    if let Ok(v) = raw.parse::<i64>() {
        return Value::Int(v);
    }
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => Value::Float(v),
        _ => Value::Text(raw.to_string()),
    }
}

/// Array of records; columns are the union of keys in first-seen order and
/// keys missing from a record read as null.
pub fn parse_json(bytes: &[u8]) -> Result<Table, LoadError> {
    let parsed: serde_json::Value = serde_json::from_slice(bytes)?;
    let serde_json::Value::Array(items) = parsed else {
        return Err(LoadError::JsonShape(json_kind(&parsed)));
    };
    let mut records = Vec::with_capacity(items.len());
    for item in items {
        match item {
            serde_json::Value::Object(map) => records.push(map),
            other => return Err(LoadError::JsonShape(json_kind(&other))),
        }
    }

    let mut columns: Vec<String> = Vec::new();
    for record in &records {
        for key in record.keys() {
            if !columns.contains(key) {
                columns.push(key.clone());
            }
        }
    }
    let mut table = Table::new(columns);
    for record in &records {
        let row = table
            .columns
            .iter()
            .map(|column| record.get(column).map(json_cell).unwrap_or(Value::Null))
            .collect();
        table.push_row(row);
    }
    Ok(table)
}

fn json_cell(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Int(i64::from(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(v) => Value::Int(v),
            None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
        },
        serde_json::Value::String(s) => Value::Text(s.clone()),
        nested => Value::Text(nested.to_string()),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[test]
    fn csv_cells_are_typed_per_value() {
        let csv = b"order_id,amount,pay_time,currency\n\
                    A-1,4.99,1736000000,USD\n\
                    A-2,,1736100000,NA\n";
        let table = parse_csv(csv).expect("csv");
        assert_eq!(table.columns, vec!["order_id", "amount", "pay_time", "currency"]);
        assert_eq!(
            table.rows[0],
            vec![
                Value::from("A-1"),
                Value::Float(4.99),
                Value::Int(1_736_000_000),
                Value::from("USD"),
            ]
        );
        assert_eq!(table.get(1, "amount"), Some(&Value::Null));
        assert_eq!(table.get(1, "currency"), Some(&Value::Null));
    }

    #[test]
    fn ragged_csv_is_rejected() {
        let err = parse_csv(b"a,b\n1,2\n3\n").unwrap_err();
        assert!(matches!(err, LoadError::Csv(_)));
    }

    #[test]
    fn json_records_union_their_keys_in_order() {
        let table = parse_json(
            br#"[{"uid": "u1", "amount": 4.99, "paid": true},
                {"uid": "u2", "amount": 10, "extra": {"k": 1}}]"#,
        )
        .expect("json");
        assert_eq!(table.columns, vec!["uid", "amount", "paid", "extra"]);
        assert_eq!(table.get(0, "paid"), Some(&Value::Int(1)));
        assert_eq!(table.get(0, "extra"), Some(&Value::Null));
        assert_eq!(table.get(1, "amount"), Some(&Value::Int(10)));
        assert_eq!(table.get(1, "extra"), Some(&Value::from(r#"{"k":1}"#)));
    }

    #[test]
    fn json_must_be_an_array_of_objects() {
        assert!(matches!(
            parse_json(br#"{"uid": "u1"}"#),
            Err(LoadError::JsonShape("an object"))
        ));
        assert!(matches!(parse_json(b"[1, 2]"), Err(LoadError::JsonShape("a number"))));
        assert!(matches!(parse_json(b"[oops"), Err(LoadError::Json(_))));
    }

    #[test]
    fn format_follows_the_extension() {
        assert_eq!(FileFormat::from_path(Path::new("orders.CSV")).expect("csv"), FileFormat::Csv);
        assert_eq!(FileFormat::from_path(Path::new("a/b.json")).expect("json"), FileFormat::Json);
        for path in ["orders.xlsx", "orders", "orders.csv.bak"] {
            assert!(matches!(
                FileFormat::from_path(&PathBuf::from(path)),
                Err(LoadError::UnsupportedFormat(_))
            ));
        }
    }

    #[tokio::test]
    async fn load_table_reads_both_formats_from_disk() {
        let dir = tempdir().expect("tempdir");
        let csv_path = dir.path().join("orders.csv");
        tokio::fs::write(&csv_path, "uid,amount\nu1,4.99\nu2,49.99\n")
            .await
            .expect("write csv");
        let json_path = dir.path().join("orders.json");
        tokio::fs::write(&json_path, r#"[{"uid":"u1","amount":4.99}]"#)
            .await
            .expect("write json");

        let csv = load_table(&csv_path).await.expect("load csv");
        assert_eq!((csv.len(), csv.width()), (2, 2));
        let json = load_table(&json_path).await.expect("load json");
        assert_eq!(json.get(0, "amount"), Some(&Value::Float(4.99)));

        let missing = load_table(&dir.path().join("absent.csv")).await.unwrap_err();
        assert!(matches!(missing, LoadError::Io { .. }));
    }
}
