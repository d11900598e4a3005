//! Column-wise descriptive statistics over a [`Table`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use daa_core::{Table, Value};
use serde::Serialize;
use tracing::info;

use crate::loader::{self, FileFormat, LoadError};

/// Column type inferred from the non-null cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Int64,
    Float64,
    Object,
    /// Every cell is null.
    Empty,
}

impl DType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DType::Int64 => "int64",
            DType::Float64 => "float64",
            DType::Object => "object",
            DType::Empty => "empty",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, DType::Int64 | DType::Float64)
    }

    fn infer<'a>(cells: impl Iterator<Item = &'a Value>) -> DType {
        let mut dtype = DType::Empty;
        for cell in cells {
            dtype = match (dtype, cell) {
                (_, Value::Null) => dtype,
                (_, Value::Text(_)) | (DType::Object, _) => return DType::Object,
                (DType::Float64, _) | (_, Value::Float(_)) => DType::Float64,
                (_, Value::Int(_)) => DType::Int64,
            };
        }
        dtype
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metadata {
    /// `(rows, columns)`.
    pub shape: (usize, usize),
    pub columns: Vec<String>,
    pub dtypes: BTreeMap<String, DType>,
    pub missing_values: BTreeMap<String, usize>,
}

impl Metadata {
    fn collect(table: &Table) -> Self {
        let mut dtypes = BTreeMap::new();
        let mut missing_values = BTreeMap::new();
        for column in &table.columns {
            dtypes.insert(column.clone(), DType::infer(table.column(column)));
            missing_values.insert(
                column.clone(),
                table.column(column).filter(|v| v.is_null()).count(),
            );
        }
        Self {
            shape: (table.len(), table.width()),
            columns: table.columns.clone(),
            dtypes,
            missing_values,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NumericSummary {
    pub count: usize,
    pub mean: f64,
    /// Sample standard deviation; absent with fewer than two values.
    pub std: Option<f64>,
    pub min: f64,
    #[serde(rename = "25%")]
    pub p25: f64,
    #[serde(rename = "50%")]
    pub p50: f64,
    #[serde(rename = "75%")]
    pub p75: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValueCount {
    pub value: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoricalSummary {
    pub unique_count: usize,
    /// At most five entries, most frequent first.
    pub top_values: Vec<ValueCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statistics {
    pub numeric_summary: BTreeMap<String, NumericSummary>,
    pub categorical_summary: BTreeMap<String, CategoricalSummary>,
    pub missing_values: BTreeMap<String, usize>,
    pub data_types: BTreeMap<String, DType>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResults {
    pub metadata: Metadata,
    pub statistics: Statistics,
    /// Pearson coefficient per numeric column pair; `None` when undefined.
    pub correlations: BTreeMap<String, BTreeMap<String, Option<f64>>>,
    /// IQR-rule outlier count per numeric column.
    pub outliers: BTreeMap<String, usize>,
}

/// Missing-value handling for [`DataAnalyzer::clean`].
#[derive(Debug, Clone, PartialEq)]
pub enum CleanStrategy {
    /// Remove every row holding at least one null.
    Drop,
    Fill(Value),
    ForwardFill,
    BackwardFill,
}

const TOP_VALUES: usize = 5;
const IQR_FENCE: f64 = 1.5;

pub struct DataAnalyzer {
    table: Table,
    metadata: Metadata,
}

impl DataAnalyzer {
    pub fn from_table(table: Table) -> Self {
        let metadata = Metadata::collect(&table);
        info!(rows = metadata.shape.0, columns = metadata.shape.1, "table loaded");
        Self { table, metadata }
    }

    /// Loads a `.csv` or `.json` export, rejecting any other extension.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        Ok(Self::from_table(loader::load_table(path.as_ref()).await?))
    }

    pub async fn from_csv(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        Ok(Self::from_table(loader::load_as(path.as_ref(), FileFormat::Csv).await?))
    }

    pub async fn from_json(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        Ok(Self::from_table(loader::load_as(path.as_ref(), FileFormat::Json).await?))
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Numeric columns in table order.
    pub fn numeric_columns(&self) -> Vec<&str> {
        self.columns_where(DType::is_numeric)
    }

    fn columns_where(&self, keep: impl Fn(&DType) -> bool) -> Vec<&str> {
        self.table
            .columns
            .iter()
            .filter(|c| self.metadata.dtypes.get(c.as_str()).is_some_and(&keep))
            .map(String::as_str)
            .collect()
    }

    fn numeric_values(&self, column: &str) -> Vec<f64> {
        self.table.column(column).filter_map(Value::as_f64).collect()
    }

    pub fn basic_statistics(&self) -> Statistics {
        let mut numeric_summary = BTreeMap::new();
        for column in self.numeric_columns() {
            if let Some(summary) = describe(self.numeric_values(column)) {
                numeric_summary.insert(column.to_string(), summary);
            }
        }

        let mut categorical_summary = BTreeMap::new();
        for column in self.columns_where(|d| *d == DType::Object) {
            let mut counts: BTreeMap<String, usize> = BTreeMap::new();
            for value in self.table.column(column).filter(|v| !v.is_null()) {
                *counts.entry(value.to_string()).or_default() += 1;
            }
            let unique_count = counts.len();
            let mut top_values: Vec<ValueCount> = counts
                .into_iter()
                .map(|(value, count)| ValueCount { value, count })
                .collect();
            top_values.sort_by(|a, b| b.count.cmp(&a.count));
            top_values.truncate(TOP_VALUES);
            categorical_summary.insert(column.to_string(), CategoricalSummary {
                unique_count,
                top_values,
            });
        }

        Statistics {
            numeric_summary,
            categorical_summary,
            missing_values: self.metadata.missing_values.clone(),
            data_types: self.metadata.dtypes.clone(),
        }
    }

    /// Applies `strategy` in place and refreshes the metadata.
    pub fn clean(&mut self, strategy: &CleanStrategy) -> &Table {
        let before = self.metadata.shape;
        let width = self.table.width();
        match strategy {
            CleanStrategy::Drop => self
                .table
                .rows
                .retain(|row| row.iter().all(|cell| !cell.is_null())),
            CleanStrategy::Fill(value) => {
                for cell in self.table.rows.iter_mut().flatten() {
                    if cell.is_null() {
                        *cell = value.clone();
                    }
                }
            }
            CleanStrategy::ForwardFill => carry_last_seen(self.table.rows.iter_mut(), width),
            CleanStrategy::BackwardFill => {
                carry_last_seen(self.table.rows.iter_mut().rev(), width)
            }
        }
        self.metadata = Metadata::collect(&self.table);
        info!(?before, after = ?self.metadata.shape, "table cleaned");
        &self.table
    }

    pub fn correlations(&self) -> BTreeMap<String, BTreeMap<String, Option<f64>>> {
        let numeric = self.numeric_columns();
        let mut matrix = BTreeMap::new();
        for left in &numeric {
            let mut row = BTreeMap::new();
            for right in &numeric {
                row.insert(right.to_string(), pearson(&self.paired_values(left, right)));
            }
            matrix.insert(left.to_string(), row);
        }
        matrix
    }

    fn paired_values(&self, left: &str, right: &str) -> Vec<(f64, f64)> {
        let (Some(l), Some(r)) = (self.table.column_index(left), self.table.column_index(right))
        else {
            return Vec::new();
        };
        self.table
            .rows
            .iter()
            .filter_map(|row| Some((row[l].as_f64()?, row[r].as_f64()?)))
            .collect()
    }

    pub fn outliers(&self) -> BTreeMap<String, usize> {
        self.numeric_columns()
            .into_iter()
            .map(|column| {
                let mut values = self.numeric_values(column);
                values.sort_by(f64::total_cmp);
                let count = match (quantile(&values, 0.25), quantile(&values, 0.75)) {
                    (Some(q1), Some(q3)) => {
                        let fence = IQR_FENCE * (q3 - q1);
                        values
                            .iter()
                            .filter(|v| **v < q1 - fence || **v > q3 + fence)
                            .count()
                    }
                    _ => 0,
                };
                (column.to_string(), count)
            })
            .collect()
    }

    pub fn analyze(&self) -> AnalysisResults {
        AnalysisResults {
            metadata: self.metadata.clone(),
            statistics: self.basic_statistics(),
            correlations: self.correlations(),
            outliers: self.outliers(),
        }
    }
}

fn carry_last_seen<'a>(rows: impl Iterator<Item = &'a mut Vec<Value>>, width: usize) {
    let mut last: Vec<Option<Value>> = vec![None; width];
    for row in rows {
        for (idx, cell) in row.iter_mut().enumerate() {
            if !cell.is_null() {
                last[idx] = Some(cell.clone());
            } else if let Some(previous) = &last[idx] {
                *cell = previous.clone();
            }
        }
    }
}

fn describe(mut values: Vec<f64>) -> Option<NumericSummary> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let count = values.len();
    let n = count as f64;
    let mean = values.iter().sum::<f64>() / n;
    let std = (count > 1).then(|| {
        let squares: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
        (squares / (n - 1.0)).sqrt()
    });
    Some(NumericSummary {
        count,
        mean,
        std,
        min: values[0],
        p25: quantile(&values, 0.25)?,
        p50: quantile(&values, 0.5)?,
        p75: quantile(&values, 0.75)?,
        max: values[count - 1],
    })
}

/// Linear-interpolated quantile of an ascending slice.
fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
    let last = sorted.len().checked_sub(1)?;
    let position = q * last as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

fn pearson(pairs: &[(f64, f64)]) -> Option<f64> {
    if pairs.len() < 2 {
        return None;
    }
    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (x, y) in pairs {
        let (dx, dy) = (x - mean_x, y - mean_y);
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx == 0.0 || syy == 0.0 {
        return None;
    }
    Some(sxy / (sxx.sqrt() * syy.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Table {
        let mut table = Table::with_columns(&["A", "B", "C"]);
        for (a, b, c) in [(1, 10, "a"), (2, 20, "b"), (3, 30, "c"), (4, 40, "d"), (5, 50, "e")] {
            table.push_row(vec![Value::Int(a), Value::Int(b), Value::from(c)]);
        }
        table
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn metadata_reports_shape_types_and_gaps() {
        let mut table = Table::with_columns(&["amount", "label", "note"]);
        table.push_row(vec![Value::Int(3), Value::from("x"), Value::Null]);
        table.push_row(vec![Value::Float(4.5), Value::Null, Value::Null]);

        let analyzer = DataAnalyzer::from_table(table);
        let metadata = analyzer.metadata();
        assert_eq!(metadata.shape, (2, 3));
        assert_eq!(metadata.dtypes["amount"], DType::Float64);
        assert_eq!(metadata.dtypes["label"], DType::Object);
        assert_eq!(metadata.dtypes["note"], DType::Empty);
        assert_eq!(metadata.missing_values["label"], 1);
        assert_eq!(metadata.missing_values["note"], 2);
        assert_eq!(DataAnalyzer::from_table(sample()).metadata().dtypes["A"], DType::Int64);
    }

    #[test]
    fn numeric_summary_matches_describe() {
        let stats = DataAnalyzer::from_table(sample()).basic_statistics();
        let a = &stats.numeric_summary["A"];
        assert_eq!(a.count, 5);
        assert!(close(a.mean, 3.0));
        assert!(close(a.std.expect("std"), 2.5_f64.sqrt()));
        assert_eq!((a.min, a.p25, a.p50, a.p75, a.max), (1.0, 2.0, 3.0, 4.0, 5.0));
        assert!(!stats.numeric_summary.contains_key("C"));

        let c = &stats.categorical_summary["C"];
        assert_eq!(c.unique_count, 5);
        assert_eq!(c.top_values.len(), 5);
    }

    #[test]
    fn quantiles_interpolate_between_ranks() {
        let values = [1.0, 2.0, 4.0, 8.0];
        assert_eq!(quantile(&values, 0.25), Some(1.75));
        assert_eq!(quantile(&values, 0.5), Some(3.0));
        assert_eq!(quantile(&[], 0.5), None);
    }

    #[test]
    fn top_values_rank_by_frequency() {
        let mut table = Table::with_columns(&["currency"]);
        for code in ["USD", "EUR", "USD", "CNY", "USD", "EUR", "GBP", "JPY", "AUD"] {
            table.push_row(vec![Value::from(code)]);
        }
        table.push_row(vec![Value::Null]);
        let stats = DataAnalyzer::from_table(table).basic_statistics();
        let summary = &stats.categorical_summary["currency"];
        assert_eq!(summary.unique_count, 6);
        assert_eq!(summary.top_values.len(), 5);
        assert_eq!(summary.top_values[0], ValueCount { value: "USD".into(), count: 3 });
        assert_eq!(summary.top_values[1], ValueCount { value: "EUR".into(), count: 2 });
    }

    #[test]
    fn perfectly_linear_columns_correlate() {
        let correlations = DataAnalyzer::from_table(sample()).correlations();
        assert!(close(correlations["A"]["B"].expect("defined"), 1.0));
        assert!(!correlations.contains_key("C"));

        let mut constant = Table::with_columns(&["x", "y"]);
        for x in 0..4 {
            constant.push_row(vec![Value::Int(x), Value::Int(7)]);
        }
        let correlations = DataAnalyzer::from_table(constant).correlations();
        assert_eq!(correlations["x"]["y"], None);
    }

    #[test]
    fn iqr_rule_flags_extreme_values() {
        let mut table = Table::with_columns(&["amount"]);
        for v in [1.0, 2.0, 3.0, 4.0, 100.0] {
            table.push_row(vec![Value::Float(v)]);
        }
        let analyzer = DataAnalyzer::from_table(table);
        assert_eq!(analyzer.outliers()["amount"], 1);
        assert_eq!(DataAnalyzer::from_table(sample()).outliers()["A"], 0);
    }

    fn gappy() -> Table {
        let mut table = Table::with_columns(&["x", "y"]);
        table.push_row(vec![Value::Null, Value::from("a")]);
        table.push_row(vec![Value::Int(2), Value::Null]);
        table.push_row(vec![Value::Null, Value::from("c")]);
        table.push_row(vec![Value::Int(4), Value::from("d")]);
        table
    }

    #[test]
    fn cleaning_strategies() {
        let mut analyzer = DataAnalyzer::from_table(gappy());
        assert_eq!(analyzer.clean(&CleanStrategy::Drop).len(), 1);
        assert_eq!(analyzer.metadata().shape, (1, 2));

        let mut analyzer = DataAnalyzer::from_table(gappy());
        let filled = analyzer.clean(&CleanStrategy::Fill(Value::Int(0)));
        assert_eq!(filled.get(0, "x"), Some(&Value::Int(0)));
        assert_eq!(filled.get(1, "y"), Some(&Value::Int(0)));

        let mut analyzer = DataAnalyzer::from_table(gappy());
        let forward = analyzer.clean(&CleanStrategy::ForwardFill);
        assert_eq!(forward.get(0, "x"), Some(&Value::Null));
        assert_eq!(forward.get(2, "x"), Some(&Value::Int(2)));
        assert_eq!(forward.get(1, "y"), Some(&Value::from("a")));

        let mut analyzer = DataAnalyzer::from_table(gappy());
        let backward = analyzer.clean(&CleanStrategy::BackwardFill);
        assert_eq!(backward.get(0, "x"), Some(&Value::Int(2)));
        assert_eq!(backward.get(1, "y"), Some(&Value::from("c")));
        assert_eq!(analyzer.metadata().missing_values["x"], 0);
    }

    #[test]
    fn analysis_bundle_serializes_with_describe_keys() {
        let results = DataAnalyzer::from_table(sample()).analyze();
        let json = serde_json::to_value(&results).expect("json");
        assert_eq!(json["metadata"]["shape"], serde_json::json!([5, 3]));
        assert_eq!(json["statistics"]["numeric_summary"]["B"]["50%"], 30.0);
        assert_eq!(json["statistics"]["data_types"]["C"], "object");
        assert_eq!(json["outliers"]["B"], 0);
    }

    #[tokio::test]
    async fn file_loaders_feed_the_same_analysis() {
        let dir = tempfile::tempdir().expect("tempdir");
        let csv = dir.path().join("sample.csv");
        tokio::fs::write(&csv, "A,B,C\n1,10,a\n2,20,b\n3,30,c\n4,40,d\n5,50,e\n")
            .await
            .expect("write csv");
        let json = dir.path().join("sample.json");
        let records: Vec<_> = sample()
            .rows
            .iter()
            .map(|row| {
                serde_json::json!({"A": row[0].as_i64(), "B": row[1].as_i64(), "C": row[2].as_str()})
            })
            .collect();
        tokio::fs::write(&json, serde_json::to_vec(&records).expect("encode"))
            .await
            .expect("write json");

        let expected =
            serde_json::to_value(DataAnalyzer::from_table(sample()).analyze()).expect("json");
        for analyzer in [
            DataAnalyzer::from_file(&csv).await.expect("csv"),
            DataAnalyzer::from_json(&json).await.expect("json"),
        ] {
            assert_eq!(serde_json::to_value(analyzer.analyze()).expect("json"), expected);
        }

        let txt = dir.path().join("sample.txt");
        tokio::fs::write(&txt, "A\n1\n").await.expect("write txt");
        assert!(matches!(
            DataAnalyzer::from_file(&txt).await,
            Err(LoadError::UnsupportedFormat(_))
        ));
        let forced = DataAnalyzer::from_csv(&txt).await.expect("forced csv");
        assert_eq!(forced.metadata().shape, (1, 1));
    }
}
