//! Brand-partitioned windowed sync and first-payment reconciliation.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use daa_core::{
    cutoff, BrandProfile, BrandRegistry, LocalTable, Table, Value, ACTIVE_WINDOW_DAYS, CUTOFF_TS,
    PAID_STATUS,
};
use daa_source::{DatabaseConfig, RemoteSource, TunnelConfig, TunneledMySqlSource};
use daa_storage::{LocalStore, FIRST_PAY_INDEX};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub mod queries;

pub const CRATE_NAME: &str = "daa-sync";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required configuration value {var}")]
    Missing { var: &'static str },
    #[error("invalid value `{value}` for {var}")]
    Invalid { var: &'static str, value: String },
}

/// Local file locations; needed by every command, including offline analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPaths {
    pub sqlite_path: PathBuf,
    pub brands_file: PathBuf,
    pub reports_dir: PathBuf,
}

impl LocalPaths {
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let path = |var: &str, default: &str| {
            lookup(var)
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(default))
        };
        Self {
            sqlite_path: path("DAA_SQLITE_PATH", "./data/order_data.db"),
            brands_file: path("DAA_BRANDS_FILE", "./brands.yaml"),
            reports_dir: path("DAA_REPORTS_DIR", "./reports"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub tunnel: TunnelConfig,
    pub database: DatabaseConfig,
    pub paths: LocalPaths,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |var: &'static str| {
            lookup(var)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing { var })
        };
        let port = |var: &'static str, default: u16| match lookup(var) {
            Some(raw) if !raw.trim().is_empty() => raw
                .trim()
                .parse::<u16>()
                .map_err(|_| ConfigError::Invalid { var, value: raw }),
            _ => Ok(default),
        };

        Ok(Self {
            tunnel: TunnelConfig {
                host: required("SSH_HOST")?,
                port: port("SSH_PORT", 22)?,
                user: required("SSH_USER")?,
                password: required("SSH_PASS")?,
            },
            database: DatabaseConfig {
                host: required("RDS_HOST")?,
                port: port("RDS_PORT", 3306)?,
                user: required("RDS_USER")?,
                password: required("RDS_PASS")?,
            },
            paths: LocalPaths::from_lookup(&lookup),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceAggregate {
    pub total_devices: i64,
    pub active_devices_30d: i64,
    pub devices_with_subscription: i64,
}

impl DeviceAggregate {
    pub fn to_table(&self, brand: &str) -> Table {
        let mut table = Table::with_columns(&[
            "total_devices",
            "active_devices_30d",
            "devices_with_subscription",
        ]);
        table.push_row(vec![
            Value::Int(self.total_devices),
            Value::Int(self.active_devices_30d),
            Value::Int(self.devices_with_subscription),
        ]);
        table.tag("brand", Value::from(brand));
        table
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrandSyncReport {
    pub brand: String,
    pub schema: String,
    pub orders: usize,
    pub subscriptions: usize,
    pub catalog_entries: usize,
    pub amount_details: usize,
    pub cloud_records: usize,
    pub devices: DeviceAggregate,
}

/// Row counts per brand for one local table, as re-read from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableValidation {
    pub table: String,
    pub brands: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cutoff: DateTime<Utc>,
    pub brands: Vec<BrandSyncReport>,
    pub indexes: Vec<String>,
    pub validation: Vec<TableValidation>,
    pub store_path: String,
    pub store_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirstPayBrandReport {
    pub brand: String,
    pub subscriptions: usize,
    pub first_paid_before_cutoff: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FirstPayRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub brands: Vec<FirstPayBrandReport>,
    pub validation: TableValidation,
}

/// Owns the remote source and local store for the duration of one run.
pub struct SyncPipeline<S: RemoteSource> {
    source: S,
    store: LocalStore,
    registry: BrandRegistry,
}

impl<S: RemoteSource> SyncPipeline<S> {
    pub fn new(source: S, store: LocalStore, registry: BrandRegistry) -> Self {
        Self {
            source,
            store,
            registry,
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn into_parts(self) -> (S, LocalStore) {
        (self.source, self.store)
    }

    /// Extracts every brand into the (already emptied) store, then indexes and validates it.
    ///
    /// `now` anchors the 30-day liveness window and the cloud-record expiry check for all brands.
    pub async fn run_windowed_sync(&mut self, now: DateTime<Utc>) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let brands: Vec<BrandProfile> = self.registry.brands().cloned().collect();

        let outcome = self.sync_brands(&brands, now).await;
        let closed = self.source.close().await;
        let reports = outcome?;
        closed.context("closing remote source")?;

        let indexes = self
            .store
            .build_indexes()
            .await
            .context("building local indexes")?
            .into_iter()
            .map(String::from)
            .collect();

        let mut validation = Vec::new();
        for table in LocalTable::WINDOWED {
            validation.push(self.validate(table).await?);
        }

        let store_bytes = store_size(&self.store).await;
        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            cutoff: cutoff(),
            brands: reports,
            indexes,
            validation,
            store_path: self.store.path().display().to_string(),
            store_bytes,
        })
    }

    /// Rebuilds `subscribe_first_pay` from each brand's full order history.
    pub async fn run_first_pay(&mut self) -> Result<FirstPayRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let table = LocalTable::SubscribeFirstPay.as_str();
        self.store
            .drop_table(table)
            .await
            .with_context(|| format!("dropping {table}"))?;

        let brands: Vec<BrandProfile> = self.registry.brands().cloned().collect();
        let outcome = self.collect_first_payments(&brands).await;
        let closed = self.source.close().await;
        let per_brand = outcome?;
        closed.context("closing remote source")?;

        let mut reports = Vec::with_capacity(per_brand.len());
        let mut combined: Option<Table> = None;
        for (report, rows) in per_brand {
            reports.push(report);
            combined = Some(match combined {
                None => rows,
                Some(acc) => concat_tables(acc, rows)?,
            });
        }
        let combined = combined.context("no brands configured")?;

        let written = self
            .store
            .replace(table, &combined)
            .await
            .with_context(|| format!("writing {table}"))?;
        self.store
            .create_index(&FIRST_PAY_INDEX)
            .await
            .context("indexing first-payment table")?;
        info!(rows = written, "first-payment index replaced");

        Ok(FirstPayRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            brands: reports,
            validation: self.validate(LocalTable::SubscribeFirstPay).await?,
        })
    }

    async fn sync_brands(
        &mut self,
        brands: &[BrandProfile],
        now: DateTime<Utc>,
    ) -> Result<Vec<BrandSyncReport>> {
        self.source
            .connect()
            .await
            .context("connecting to remote source")?;
        let mut reports = Vec::with_capacity(brands.len());
        for profile in brands {
            reports.push(
                self.sync_brand(profile, now)
                    .await
                    .with_context(|| format!("syncing brand {}", profile.brand))?,
            );
        }
        Ok(reports)
    }

    #[instrument(skip_all, fields(brand = %profile.brand, schema = %profile.schema))]
    async fn sync_brand(
        &mut self,
        profile: &BrandProfile,
        now: DateTime<Utc>,
    ) -> Result<BrandSyncReport> {
        self.source
            .switch_schema(&profile.schema)
            .await
            .context("switching schema")?;
        let window = [Value::Int(PAID_STATUS), Value::Int(CUTOFF_TS)];

        let orders = self
            .extract(profile, LocalTable::Orders, queries::ORDERS, &window)
            .await?;
        self.write(LocalTable::Orders, &orders).await?;

        let subscriptions_sql = queries::subscriptions(profile.columns);
        let subscriptions = self
            .extract(
                profile,
                LocalTable::Subscribe,
                &subscriptions_sql,
                &[
                    Value::Int(CUTOFF_TS),
                    Value::Int(PAID_STATUS),
                    Value::Int(CUTOFF_TS),
                ],
            )
            .await?;
        if subscriptions.is_empty() {
            info!("no subscriptions in window; skipping subscribe write");
        } else {
            self.write(LocalTable::Subscribe, &subscriptions).await?;
        }

        let catalog = self
            .extract(profile, LocalTable::SetMeal, queries::SET_MEAL, &[])
            .await?;
        self.write(LocalTable::SetMeal, &catalog).await?;

        let amounts = self
            .extract(
                profile,
                LocalTable::OrderAmountInfo,
                queries::AMOUNT_DETAIL,
                &window,
            )
            .await?;
        self.write(LocalTable::OrderAmountInfo, &amounts).await?;

        let clouds = self
            .extract(profile, LocalTable::CloudInfo, queries::CLOUD_RECORDS, &window)
            .await?;
        self.write(LocalTable::CloudInfo, &clouds).await?;

        let devices = self.device_aggregate(now).await?;
        info!(
            total = devices.total_devices,
            active = devices.active_devices_30d,
            covered = devices.devices_with_subscription,
            "device stats"
        );
        self.write(LocalTable::DeviceStats, &devices.to_table(&profile.brand))
            .await?;

        Ok(BrandSyncReport {
            brand: profile.brand.clone(),
            schema: profile.schema.clone(),
            orders: orders.len(),
            subscriptions: subscriptions.len(),
            catalog_entries: catalog.len(),
            amount_details: amounts.len(),
            cloud_records: clouds.len(),
            devices,
        })
    }

    async fn extract(
        &mut self,
        profile: &BrandProfile,
        table: LocalTable,
        sql: &str,
        params: &[Value],
    ) -> Result<Table> {
        let mut rows = self
            .source
            .query(sql, params)
            .await
            .with_context(|| format!("fetching {table}"))?;
        rows.tag("brand", Value::from(profile.brand.as_str()));
        info!(%table, rows = rows.len(), "fetched");
        Ok(rows)
    }

    async fn write(&self, table: LocalTable, rows: &Table) -> Result<()> {
        self.store
            .append(table.as_str(), rows)
            .await
            .with_context(|| format!("writing {table}"))?;
        Ok(())
    }

    async fn device_aggregate(&mut self, now: DateTime<Utc>) -> Result<DeviceAggregate> {
        let window_start_ms = (now - Duration::days(ACTIVE_WINDOW_DAYS)).timestamp_millis();
        let counts = self
            .source
            .query(
                queries::DEVICE_COUNTS,
                &[Value::Int(window_start_ms), Value::Int(CUTOFF_TS)],
            )
            .await
            .context("fetching device counts")?;
        let covered = self
            .source
            .query(queries::COVERED_DEVICES, &[Value::Int(now.timestamp())])
            .await
            .context("fetching subscription-covered devices")?;

        Ok(DeviceAggregate {
            total_devices: first_count(&counts, "total_devices"),
            active_devices_30d: first_count(&counts, "active_devices_30d"),
            devices_with_subscription: first_count(&covered, "devices_with_subscription"),
        })
    }

    async fn collect_first_payments(
        &mut self,
        brands: &[BrandProfile],
    ) -> Result<Vec<(FirstPayBrandReport, Table)>> {
        self.source
            .connect()
            .await
            .context("connecting to remote source")?;
        let mut out = Vec::with_capacity(brands.len());
        for profile in brands {
            self.source
                .switch_schema(&profile.schema)
                .await
                .with_context(|| format!("switching to schema {}", profile.schema))?;
            let rows = self
                .extract(
                    profile,
                    LocalTable::SubscribeFirstPay,
                    queries::FIRST_PAYMENT,
                    &[Value::Int(PAID_STATUS)],
                )
                .await
                .with_context(|| format!("first payments for brand {}", profile.brand))?;
            let before_cutoff = rows
                .column("first_pay_time")
                .filter_map(Value::as_i64)
                .filter(|ts| *ts < CUTOFF_TS)
                .count();
            if !rows.is_empty() {
                info!(
                    brand = %profile.brand,
                    subscriptions = rows.len(),
                    before_cutoff,
                    share = %format!("{:.1}%", before_cutoff as f64 * 100.0 / rows.len() as f64),
                    "first payments collected"
                );
            }
            out.push((
                FirstPayBrandReport {
                    brand: profile.brand.clone(),
                    subscriptions: rows.len(),
                    first_paid_before_cutoff: before_cutoff,
                },
                rows,
            ));
        }
        Ok(out)
    }

    async fn validate(&self, table: LocalTable) -> Result<TableValidation> {
        let counts = self
            .store
            .brand_counts(table.as_str())
            .await
            .with_context(|| format!("counting {table}"))?;
        Ok(TableValidation {
            table: table.as_str().to_string(),
            brands: counts.into_iter().map(|c| (c.brand, c.rows)).collect(),
        })
    }
}

/// Store file size for the run summary; zero when the file cannot be inspected.
async fn store_size(store: &LocalStore) -> u64 {
    match store.file_size().await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, path = %store.path().display(), "reading store size failed");
            0
        }
    }
}

fn first_count(table: &Table, column: &str) -> i64 {
    match table.get(0, column).and_then(Value::as_i64) {
        Some(count) => count,
        None => {
            warn!(column, "aggregate returned no value; recording 0");
            0
        }
    }
}

fn concat_tables(mut head: Table, tail: Table) -> Result<Table> {
    if head.columns != tail.columns {
        bail!(
            "column mismatch while concatenating: {:?} vs {:?}",
            head.columns,
            tail.columns
        );
    }
    head.rows.extend(tail.rows);
    Ok(head)
}

fn tunneled_source(config: &SyncConfig, registry: &BrandRegistry) -> Result<TunneledMySqlSource> {
    let initial = registry
        .brands()
        .next()
        .context("brand registry is empty")?;
    Ok(TunneledMySqlSource::new(
        config.tunnel.clone(),
        config.database.clone(),
        initial.schema.clone(),
    ))
}

pub async fn run_windowed_sync_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    let registry = BrandRegistry::load_or_builtin(&config.paths.brands_file)?;
    let source = tunneled_source(&config, &registry)?;
    let store = LocalStore::recreate(&config.paths.sqlite_path)
        .await
        .with_context(|| format!("recreating {}", config.paths.sqlite_path.display()))?;
    let mut pipeline = SyncPipeline::new(source, store, registry);
    let summary = pipeline.run_windowed_sync(Utc::now()).await;
    let (_, store) = pipeline.into_parts();
    store.close().await;
    summary
}

pub async fn run_first_pay_from_env() -> Result<FirstPayRunSummary> {
    let config = SyncConfig::from_env()?;
    let registry = BrandRegistry::load_or_builtin(&config.paths.brands_file)?;
    let source = tunneled_source(&config, &registry)?;
    let store = LocalStore::open(&config.paths.sqlite_path)
        .await
        .with_context(|| format!("opening {}", config.paths.sqlite_path.display()))?;
    let mut pipeline = SyncPipeline::new(source, store, registry);
    let summary = pipeline.run_first_pay().await;
    let (_, store) = pipeline.into_parts();
    store.close().await;
    summary
}

/// Operator-facing per-table, per-brand count listing.
pub fn render_validation(validation: &[TableValidation]) -> String {
    let mut lines = vec!["=== row count validation ===".to_string()];
    for entry in validation {
        lines.push(format!("  {}:", entry.table));
        if entry.brands.is_empty() {
            lines.push("    (no rows)".to_string());
        }
        for (brand, rows) in &entry.brands {
            lines.push(format!("    {brand}: {rows}"));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const COMPLETE: &[(&str, &str)] = &[
        ("SSH_HOST", "bastion.example.com"),
        ("SSH_USER", "ops"),
        ("SSH_PASS", "s3cret"),
        ("RDS_HOST", "rds.internal"),
        ("RDS_USER", "reader"),
        ("RDS_PASS", "hunter2"),
    ];

    #[tokio::test]
    async fn unreadable_store_size_reports_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("order_data.db");
        let store = LocalStore::recreate(&path).await.expect("store");
        let on_disk = std::fs::metadata(&path).expect("metadata").len();
        assert_eq!(store_size(&store).await, on_disk);

        std::fs::remove_file(&path).expect("remove store file");
        assert_eq!(store_size(&store).await, 0);
        store.close().await;
    }

    #[test]
    fn config_applies_port_and_path_defaults() {
        let config = SyncConfig::from_lookup(env(COMPLETE)).expect("config");
        assert_eq!(config.tunnel.port, 22);
        assert_eq!(config.database.port, 3306);
        assert_eq!(config.paths.sqlite_path, PathBuf::from("./data/order_data.db"));
        assert_eq!(config.paths.brands_file, PathBuf::from("./brands.yaml"));
    }

    #[test]
    fn local_paths_need_no_credentials() {
        let paths = LocalPaths::from_lookup(env(&[("DAA_REPORTS_DIR", "/tmp/daa-reports")]));
        assert_eq!(paths.reports_dir, PathBuf::from("/tmp/daa-reports"));
        assert_eq!(paths.sqlite_path, PathBuf::from("./data/order_data.db"));
    }

    #[test]
    fn missing_credentials_are_reported_by_name() {
        let partial: Vec<_> = COMPLETE
            .iter()
            .copied()
            .filter(|(k, _)| *k != "RDS_PASS")
            .collect();
        let err = SyncConfig::from_lookup(env(&partial)).unwrap_err();
        assert_eq!(err, ConfigError::Missing { var: "RDS_PASS" });

        let blank: Vec<_> = COMPLETE
            .iter()
            .map(|(k, v)| if *k == "SSH_HOST" { (*k, "  ") } else { (*k, *v) })
            .collect();
        let err = SyncConfig::from_lookup(env(&blank)).unwrap_err();
        assert_eq!(err, ConfigError::Missing { var: "SSH_HOST" });
    }

    #[test]
    fn non_numeric_port_is_invalid() {
        let mut pairs = COMPLETE.to_vec();
        pairs.push(("RDS_PORT", "mysql"));
        let err = SyncConfig::from_lookup(env(&pairs)).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                var: "RDS_PORT",
                value: "mysql".into()
            }
        );
    }

    #[test]
    fn device_aggregate_row_is_brand_tagged() {
        let table = DeviceAggregate {
            total_devices: 10,
            active_devices_30d: 4,
            devices_with_subscription: 2,
        }
        .to_table("OSAIO");
        assert_eq!(table.columns, vec![
            "total_devices",
            "active_devices_30d",
            "devices_with_subscription",
            "brand"
        ]);
        assert_eq!(table.get(0, "brand"), Some(&Value::from("OSAIO")));
    }

    #[test]
    fn concat_rejects_mismatched_columns() {
        let a = Table::with_columns(&["subscribe_id", "brand"]);
        let b = Table::with_columns(&["subscribe_id"]);
        assert!(concat_tables(a, b).is_err());
    }

    #[test]
    fn validation_listing_names_every_table() {
        let rendered = render_validation(&[
            TableValidation {
                table: "orders".into(),
                brands: BTreeMap::from([("Nooie".to_string(), 2), ("OSAIO".to_string(), 5)]),
            },
            TableValidation {
                table: "subscribe".into(),
                brands: BTreeMap::new(),
            },
        ]);
        assert!(rendered.contains("  orders:\n    Nooie: 2\n    OSAIO: 5"));
        assert!(rendered.contains("  subscribe:\n    (no rows)"));
    }
}
