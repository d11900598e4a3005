//! Core domain model for DAA: constants, the brand schema mapper and the tabular result model.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "daa-core";

/// Windowed extraction cutoff: 2025-01-01T00:00:00Z as epoch seconds.
pub const CUTOFF_TS: i64 = 1_735_689_600;

/// `order.status` value for a paid order.
pub const PAID_STATUS: i64 = 1;

/// Trailing window for the device liveness signal.
pub const ACTIVE_WINDOW_DAYS: i64 = 30;

/// True for names safe to splice into SQL as a quoted schema, table or column.
pub fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn cutoff() -> DateTime<Utc> {
    Utc.timestamp_opt(CUTOFF_TS, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Tables owned by the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalTable {
    Orders,
    Subscribe,
    SetMeal,
    OrderAmountInfo,
    CloudInfo,
    DeviceStats,
    SubscribeFirstPay,
}

impl LocalTable {
    /// Tables rebuilt by the windowed sync, in extraction order.
    pub const WINDOWED: [LocalTable; 6] = [
        LocalTable::Orders,
        LocalTable::Subscribe,
        LocalTable::SetMeal,
        LocalTable::OrderAmountInfo,
        LocalTable::CloudInfo,
        LocalTable::DeviceStats,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LocalTable::Orders => "orders",
            LocalTable::Subscribe => "subscribe",
            LocalTable::SetMeal => "set_meal",
            LocalTable::OrderAmountInfo => "order_amount_info",
            LocalTable::CloudInfo => "cloud_info",
            LocalTable::DeviceStats => "device_stats",
            LocalTable::SubscribeFirstPay => "subscribe_first_pay",
        }
    }
}

impl fmt::Display for LocalTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which tenant-specific columns a brand's `subscribe` table carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ColumnPresence {
    #[serde(default)]
    pub subscription_owner: bool,
    #[serde(default)]
    pub device_support: bool,
    #[serde(default)]
    pub cloud_tier: bool,
}

impl ColumnPresence {
    pub const ALL: ColumnPresence = ColumnPresence {
        subscription_owner: true,
        device_support: true,
        cloud_tier: true,
    };

    pub const NONE: ColumnPresence = ColumnPresence {
        subscription_owner: false,
        device_support: false,
        cloud_tier: false,
    };
}

/// Flat per-tenant configuration record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrandProfile {
    /// Discriminator written into every local row, e.g. `OSAIO`.
    pub brand: String,
    /// Lowercase lookup id, e.g. `osaio`.
    pub key: String,
    pub schema: String,
    #[serde(default)]
    pub columns: ColumnPresence,
}

impl BrandProfile {
    pub fn new(
        brand: impl Into<String>,
        key: impl Into<String>,
        schema: impl Into<String>,
        columns: ColumnPresence,
    ) -> Self {
        Self {
            brand: brand.into(),
            key: key.into(),
            schema: schema.into(),
            columns,
        }
    }

    fn matches(&self, id: &str) -> bool {
        self.brand.eq_ignore_ascii_case(id) || self.key.eq_ignore_ascii_case(id)
    }
}

#[derive(Debug, Error)]
pub enum BrandError {
    #[error("unknown brand `{brand}`, known brands: {known}")]
    UnknownBrand { brand: String, known: String },
    #[error("invalid brand registry {path}: {message}")]
    Registry { path: String, message: String },
}

/// Static brand → schema mapping plus the analysis target table list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrandRegistry {
    pub brands: Vec<BrandProfile>,
    #[serde(default)]
    pub target_tables: Vec<String>,
}

impl BrandRegistry {
    pub fn builtin() -> Self {
        Self {
            brands: vec![
                BrandProfile::new("OSAIO", "osaio", "bi_center", ColumnPresence::ALL),
                BrandProfile::new("Nooie", "nooie", "nooie_bi_center", ColumnPresence::NONE),
            ],
            target_tables: ["user", "user_device", "order", "subscribe"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }

    pub fn from_yaml_str(text: &str, origin: &str) -> Result<Self, BrandError> {
        let registry: BrandRegistry =
            serde_yaml::from_str(text).map_err(|err| BrandError::Registry {
                path: origin.to_string(),
                message: err.to_string(),
            })?;
        if registry.brands.is_empty() {
            return Err(BrandError::Registry {
                path: origin.to_string(),
                message: "no brands configured".to_string(),
            });
        }
        Ok(registry)
    }

    /// Loads the registry file, falling back to [`BrandRegistry::builtin`] when it does not exist.
    pub fn load_or_builtin(path: impl AsRef<Path>) -> Result<Self, BrandError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::builtin());
        }
        let text = std::fs::read_to_string(path).map_err(|err| BrandError::Registry {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        Self::from_yaml_str(&text, &path.display().to_string())
    }

    pub fn resolve(&self, brand: &str) -> Result<&BrandProfile, BrandError> {
        self.brands
            .iter()
            .find(|profile| profile.matches(brand))
            .ok_or_else(|| BrandError::UnknownBrand {
                brand: brand.to_string(),
                known: self
                    .brands
                    .iter()
                    .map(|p| p.key.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }

    pub fn schema_for(&self, brand: &str) -> Result<&str, BrandError> {
        self.resolve(brand).map(|profile| profile.schema.as_str())
    }

    pub fn brands(&self) -> impl Iterator<Item = &BrandProfile> {
        self.brands.iter()
    }
}

/// A single materialized cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            Value::Text(s) => s.trim().parse().ok(),
            Value::Null | Value::Float(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Text(s) => s.trim().parse().ok(),
            Value::Null => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// Row-major in-memory result set. Every row has `columns.len()` cells.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn with_columns<S: AsRef<str>>(columns: &[S]) -> Self {
        Self::new(columns.iter().map(|c| c.as_ref().to_string()).collect())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn push_row(&mut self, row: Vec<Value>) {
        debug_assert_eq!(row.len(), self.columns.len());
        self.rows.push(row);
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// Iterates one column top to bottom. Empty when the column is absent.
    pub fn column<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a Value> + 'a {
        let idx = self.column_index(name);
        self.rows
            .iter()
            .filter_map(move |row| idx.and_then(|i| row.get(i)))
    }

    /// Appends (or overwrites) a column holding the same value in every row.
    pub fn tag(&mut self, name: &str, value: Value) {
        match self.column_index(name) {
            Some(idx) => {
                for row in &mut self.rows {
                    row[idx] = value.clone();
                }
            }
            None => {
                self.columns.push(name.to_string());
                for row in &mut self.rows {
                    row.push(value.clone());
                }
            }
        }
    }
}
