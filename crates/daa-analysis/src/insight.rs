//! Natural-language commentary on analysis results via the Anthropic Messages API.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::analyzer::{AnalysisResults, DType};

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";
pub const DEFAULT_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 2000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub const UNAVAILABLE: &str = "AI analysis unavailable: set ANTHROPIC_API_KEY to enable it";

#[derive(Debug, Clone)]
pub struct InsightConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub endpoint: String,
}

impl InsightConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_blank = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        Self {
            api_key: non_blank("ANTHROPIC_API_KEY"),
            model: non_blank("ANTHROPIC_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            endpoint: DEFAULT_ENDPOINT.to_string(),
        }
    }
}

#[derive(Debug, Error)]
enum InsightError {
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("response carried no text content")]
    EmptyResponse,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: [Message<'a>; 1],
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VisualizationSuggestion {
    pub kind: &'static str,
    pub description: &'static str,
    pub numeric: Vec<String>,
    pub categorical: Vec<String>,
}

/// Degrades to fixed text when no key is configured; request failures are
/// returned inline rather than as errors.
pub struct InsightClient {
    config: InsightConfig,
    http: Option<reqwest::Client>,
}

impl InsightClient {
    pub fn new(config: InsightConfig) -> Self {
        let http = match &config.api_key {
            None => {
                warn!("ANTHROPIC_API_KEY not set; AI insight disabled");
                None
            }
            Some(_) => match reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build() {
                Ok(client) => Some(client),
                Err(err) => {
                    warn!(error = %err, "building http client failed; AI insight disabled");
                    None
                }
            },
        };
        Self { config, http }
    }

    pub fn from_env() -> Self {
        Self::new(InsightConfig::from_env())
    }

    pub fn is_enabled(&self) -> bool {
        self.http.is_some()
    }

    pub async fn analyze(&self, results: &AnalysisResults) -> String {
        let (Some(http), Some(key)) = (&self.http, &self.config.api_key) else {
            return UNAVAILABLE.to_string();
        };
        let prompt = build_prompt(results);
        match self.request(http, key, &prompt).await {
            Ok(text) => {
                info!(model = %self.config.model, chars = text.len(), "insight received");
                text
            }
            Err(err) => {
                warn!(error = %err, "insight request failed");
                format!("AI analysis failed: {err}")
            }
        }
    }

    async fn request(
        &self,
        http: &reqwest::Client,
        key: &str,
        prompt: &str,
    ) -> Result<String, InsightError> {
        let body = MessagesRequest {
            model: &self.config.model,
            max_tokens: MAX_TOKENS,
            messages: [Message {
                role: "user",
                content: prompt,
            }],
        };
        let response = http
            .post(&self.config.endpoint)
            .header("x-api-key", key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InsightError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: MessagesResponse = response.json().await?;
        parsed
            .content
            .into_iter()
            .find(|block| block.kind == "text")
            .map(|block| block.text)
            .ok_or(InsightError::EmptyResponse)
    }
}

pub fn build_prompt(results: &AnalysisResults) -> String {
    let metadata = &results.metadata;
    let stats = &results.statistics;
    let mut lines = vec![
        "As a professional data analyst, review the following data summary and provide insight.".to_string(),
        String::new(),
        "Overview:".to_string(),
        format!("- Shape: {} rows x {} columns", metadata.shape.0, metadata.shape.1),
        format!("- Columns: {}", metadata.columns.join(", ")),
        String::new(),
        "Statistics:".to_string(),
    ];
    let missing: Vec<String> = stats
        .missing_values
        .iter()
        .filter(|(_, count)| **count > 0)
        .map(|(column, count)| format!("{column}={count}"))
        .collect();
    if missing.is_empty() {
        lines.push("- Missing values: none".to_string());
    } else {
        lines.push(format!("- Missing values: {}", missing.join(", ")));
    }
    lines.push(format!(
        "- Data types: {}",
        stats
            .data_types
            .iter()
            .map(|(column, dtype)| format!("{column}={dtype}"))
            .collect::<Vec<_>>()
            .join(", ")
    ));
    lines.push(String::new());
    lines.push("Outliers (IQR rule):".to_string());
    if results.outliers.is_empty() {
        lines.push("- no numeric columns".to_string());
    }
    for (column, count) in &results.outliers {
        lines.push(format!("- {column}: {count}"));
    }
    lines.extend(
        [
            "",
            "Please provide:",
            "1. Data quality assessment",
            "2. Key findings and trends",
            "3. Potential data issues",
            "4. Suggested next-step analyses",
            "5. Visualization suggestions",
            "",
            "Keep the answer professional and concise.",
        ]
        .map(String::from),
    );
    lines.join("\n")
}

pub fn suggest_visualizations(dtypes: &BTreeMap<String, DType>) -> Vec<VisualizationSuggestion> {
    let numeric: Vec<String> = dtypes
        .iter()
        .filter(|(_, d)| d.is_numeric())
        .map(|(c, _)| c.clone())
        .collect();
    let categorical: Vec<String> = dtypes
        .iter()
        .filter(|(_, d)| **d == DType::Object)
        .map(|(c, _)| c.clone())
        .collect();

    let mut out = Vec::new();
    if numeric.len() >= 2 {
        out.push(suggestion(
            "correlation_heatmap",
            "correlation heatmap of numeric columns",
            &numeric,
            &[],
        ));
    }
    if !numeric.is_empty() {
        out.push(suggestion(
            "distribution",
            "histogram of numeric distributions",
            &numeric,
            &[],
        ));
    }
    if !categorical.is_empty() {
        out.push(suggestion(
            "bar_chart",
            "bar chart of categorical values",
            &[],
            &categorical,
        ));
    }
    if !numeric.is_empty() && !categorical.is_empty() {
        out.push(suggestion(
            "box_plot",
            "box plot of numeric values by category",
            &numeric,
            &categorical,
        ));
    }
    out
}

fn suggestion(
    kind: &'static str,
    description: &'static str,
    numeric: &[String],
    categorical: &[String],
) -> VisualizationSuggestion {
    VisualizationSuggestion {
        kind,
        description,
        numeric: numeric.to_vec(),
        categorical: categorical.to_vec(),
    }
}
