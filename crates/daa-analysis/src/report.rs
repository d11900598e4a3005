use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Serialize;
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::analyzer::AnalysisResults;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing report: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct JsonReport<'a> {
    generated_at: String,
    results: &'a AnalysisResults,
}

/// Writes timestamped report files into one output directory.
#[derive(Debug, Clone)]
pub struct ReportGenerator {
    dir: PathBuf,
}

impl ReportGenerator {
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self, ReportError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| io_error("creating", &dir, source))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn write_markdown(
        &self,
        results: &AnalysisResults,
        insights: Option<&str>,
        title: &str,
    ) -> Result<PathBuf, ReportError> {
        let now = Local::now();
        let path = self
            .write_new(now, "md", render_markdown(results, insights, title, now))
            .await?;
        info!(path = %path.display(), "markdown report written");
        Ok(path)
    }

    pub async fn write_json(&self, results: &AnalysisResults) -> Result<PathBuf, ReportError> {
        let now = Local::now();
        let bytes = serde_json::to_vec_pretty(&JsonReport {
            generated_at: now.to_rfc3339(),
            results,
        })?;
        let path = self.write_new(now, "json", bytes).await?;
        info!(path = %path.display(), "json report written");
        Ok(path)
    }

    /// `report_<timestamp>.<ext>`, with `_<n>` appended when taken.
    fn file_for(&self, at: DateTime<Local>, ext: &str, attempt: u32) -> PathBuf {
        let stamp = at.format("%Y%m%d_%H%M%S");
        let name = match attempt {
            0 => format!("report_{stamp}.{ext}"),
            n => format!("report_{stamp}_{n}.{ext}"),
        };
        self.dir.join(name)
    }

    /// Writes into a file that did not exist before; never replaces an earlier report.
    async fn write_new(
        &self,
        at: DateTime<Local>,
        ext: &str,
        contents: impl AsRef<[u8]>,
    ) -> Result<PathBuf, ReportError> {
        let mut attempt = 0;
        let (path, mut file) = loop {
            let path = self.file_for(at, ext, attempt);
            match OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(file) => break (path, file),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    debug!(path = %path.display(), "report name taken");
                    attempt += 1;
                }
                Err(source) => return Err(io_error("creating", &path, source)),
            }
        };
        file.write_all(contents.as_ref())
            .await
            .map_err(|source| io_error("writing", &path, source))?;
        file.flush()
            .await
            .map_err(|source| io_error("writing", &path, source))?;
        Ok(path)
    }
}

fn io_error(action: &'static str, path: &Path, source: std::io::Error) -> ReportError {
    ReportError::Io {
        action,
        path: path.display().to_string(),
        source,
    }
}

pub fn render_markdown(
    results: &AnalysisResults,
    insights: Option<&str>,
    title: &str,
    generated_at: DateTime<Local>,
) -> String {
    let metadata = &results.metadata;
    let mut out = format!(
        "# {title}\n\nGenerated: {}\n\n---\n\n## 1. Overview\n\n",
        generated_at.format("%Y-%m-%d %H:%M:%S")
    );
    out.push_str(&format!(
        "### Basic information\n\n- **Shape**: ({}, {})\n- **Columns**: {}\n\n### Columns\n\n",
        metadata.shape.0,
        metadata.shape.1,
        metadata.columns.len()
    ));
    for column in &metadata.columns {
        let dtype = metadata
            .dtypes
            .get(column)
            .map(|d| d.as_str())
            .unwrap_or("unknown");
        let missing = metadata.missing_values.get(column).copied().unwrap_or(0);
        out.push_str(&format!("- **{column}**: {dtype} (missing: {missing})\n"));
    }

    out.push_str("\n## 2. Statistics\n\n");
    let missing: Vec<_> = results
        .statistics
        .missing_values
        .iter()
        .filter(|(_, count)| **count > 0)
        .collect();
    if !missing.is_empty() {
        out.push_str("### Missing values\n\n");
        for (column, count) in missing {
            out.push_str(&format!("- {column}: {count}\n"));
        }
    }

    let outliers: Vec<_> = results.outliers.iter().filter(|(_, n)| **n > 0).collect();
    if !outliers.is_empty() {
        out.push_str("\n### Outliers\n\n");
        for (column, count) in outliers {
            out.push_str(&format!("- {column}: {count} outliers\n"));
        }
    }

    if let Some(insights) = insights {
        out.push_str(&format!("\n## 3. AI insights\n\n{insights}\n"));
    }

    out.push_str("\n---\n\n## Summary\n\nGenerated automatically by Data Analysis Agent.\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::DataAnalyzer;
    use daa_core::{Table, Value};
    use tempfile::tempdir;

    fn results() -> AnalysisResults {
        let mut table = Table::with_columns(&["amount", "currency"]);
        for amount in [1.0, 2.0, 3.0, 4.0, 100.0] {
            table.push_row(vec![Value::Float(amount), Value::from("USD")]);
        }
        table.push_row(vec![Value::Null, Value::from("EUR")]);
        DataAnalyzer::from_table(table).analyze()
    }

    #[test]
    fn markdown_lists_columns_gaps_and_outliers() {
        let text = render_markdown(&results(), Some("looks fine"), "Orders", Local::now());
        assert!(text.starts_with("# Orders\n"));
        assert!(text.contains("- **Shape**: (6, 2)"));
        assert!(text.contains("- **amount**: float64 (missing: 1)"));
        assert!(text.contains("### Missing values\n\n- amount: 1\n"));
        assert!(text.contains("- amount: 1 outliers"));
        assert!(text.contains("## 3. AI insights\n\nlooks fine"));
        assert!(text.ends_with("Generated automatically by Data Analysis Agent.\n"));

        let without = render_markdown(&results(), None, "Orders", Local::now());
        assert!(!without.contains("AI insights"));
    }

    #[tokio::test]
    async fn writes_timestamped_files_into_a_fresh_dir() {
        let dir = tempdir().expect("tempdir");
        let reports = ReportGenerator::new(dir.path().join("reports"))
            .await
            .expect("generator");
        let results = results();

        let md = reports
            .write_markdown(&results, None, "Orders")
            .await
            .expect("markdown");
        let name = md.file_name().and_then(|n| n.to_str()).expect("name");
        assert!(name.starts_with("report_") && name.ends_with(".md"));
        assert!(name.len() >= "report_20250101_000000.md".len());

        let json = reports.write_json(&results).await.expect("json");
        let parsed: serde_json::Value =
            serde_json::from_slice(&tokio::fs::read(&json).await.expect("read")).expect("parse");
        assert!(parsed["generated_at"].is_string());
        assert_eq!(parsed["results"]["metadata"]["shape"], serde_json::json!([6, 2]));
        assert_eq!(parsed["results"]["outliers"]["amount"], 1);
    }

    #[tokio::test]
    async fn same_second_reports_get_distinct_names() {
        let dir = tempdir().expect("tempdir");
        let reports = ReportGenerator::new(dir.path()).await.expect("generator");
        let results = results();
        let at = Local::now();

        let first = reports.write_new(at, "md", "first").await.expect("first");
        let second = reports.write_new(at, "md", "second").await.expect("second");
        assert_ne!(first, second);
        assert_eq!(second, reports.file_for(at, "md", 1));
        assert_eq!(tokio::fs::read_to_string(&first).await.expect("read"), "first");
        assert_eq!(tokio::fs::read_to_string(&second).await.expect("read"), "second");

        let quick = reports.write_markdown(&results, None, "Orders").await.expect("md");
        let again = reports.write_markdown(&results, None, "Orders").await.expect("md");
        assert_ne!(quick, again);
    }
}
