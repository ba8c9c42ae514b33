use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SNAPSHOT_URL: &str =
    "https://github.com/meganii/sandbox-github-actions-scheduler/releases/latest/download/pages.parquet";
pub const DEFAULT_USER_AGENT: &str = "pagestats/0.1";
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_PROJECT_NAME: &str = "villagepump";
pub const DEFAULT_PAGE_BASE_URL: &str = "https://scrapbox.io";
pub const DEFAULT_PREVIEW_TITLE: &str = "井戸端";
pub const DEFAULT_REPORT_LIMIT: usize = 100;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct StatsConfig {
    #[serde(default)]
    pub snapshot: SnapshotSection,
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub report: ReportSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SnapshotSection {
    pub url: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ProjectSection {
    pub name: Option<String>,
    pub page_base_url: Option<String>,
    pub preview_title: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ReportSection {
    pub limit: Option<usize>,
}

impl StatsConfig {
    /// Snapshot source: env PAGESTATS_SNAPSHOT_URL > config > DEFAULT_SNAPSHOT_URL.
    pub fn snapshot_url(&self) -> String {
        self.snapshot_url_with_lookup(env_lookup)
    }

    pub fn user_agent(&self) -> String {
        self.user_agent_with_lookup(env_lookup)
    }

    /// Fails when PAGESTATS_HTTP_TIMEOUT_MS is set but is not a whole number of milliseconds.
    pub fn timeout_ms(&self) -> Result<u64> {
        self.timeout_ms_with_lookup(env_lookup)
    }

    pub fn project_name(&self) -> String {
        self.project_name_with_lookup(env_lookup)
    }

    /// Prefix every page URL starts with, e.g. `https://scrapbox.io/villagepump/`.
    pub fn page_url_prefix(&self) -> String {
        self.page_url_prefix_with_lookup(env_lookup)
    }

    fn snapshot_url_with_lookup<F>(&self, lookup_env: F) -> String
    where
        F: Fn(&str) -> Option<String>,
    {
        non_empty(lookup_env("PAGESTATS_SNAPSHOT_URL"))
            .or_else(|| self.snapshot.url.clone())
            .unwrap_or_else(|| DEFAULT_SNAPSHOT_URL.to_string())
    }

    fn user_agent_with_lookup<F>(&self, lookup_env: F) -> String
    where
        F: Fn(&str) -> Option<String>,
    {
        non_empty(lookup_env("PAGESTATS_USER_AGENT"))
            .or_else(|| self.snapshot.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    fn timeout_ms_with_lookup<F>(&self, lookup_env: F) -> Result<u64>
    where
        F: Fn(&str) -> Option<String>,
    {
        match non_empty(lookup_env("PAGESTATS_HTTP_TIMEOUT_MS")) {
            Some(value) => value.parse::<u64>().with_context(|| {
                format!("PAGESTATS_HTTP_TIMEOUT_MS is not a number of milliseconds: {value:?}")
            }),
            None => Ok(self.snapshot.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)),
        }
    }

    fn project_name_with_lookup<F>(&self, lookup_env: F) -> String
    where
        F: Fn(&str) -> Option<String>,
    {
        non_empty(lookup_env("PAGESTATS_PROJECT"))
            .or_else(|| self.project.name.clone())
            .unwrap_or_else(|| DEFAULT_PROJECT_NAME.to_string())
    }

    fn page_url_prefix_with_lookup<F>(&self, lookup_env: F) -> String
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = self
            .project
            .page_base_url
            .as_deref()
            .unwrap_or(DEFAULT_PAGE_BASE_URL)
            .trim_end_matches('/');
        format!("{base}/{}/", self.project_name_with_lookup(lookup_env))
    }

    pub fn preview_title(&self) -> &str {
        self.project
            .preview_title
            .as_deref()
            .unwrap_or(DEFAULT_PREVIEW_TITLE)
    }

    pub fn report_limit(&self) -> usize {
        self.report.limit.unwrap_or(DEFAULT_REPORT_LIMIT)
    }
}

/// Load and parse a StatsConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<StatsConfig> {
    if !config_path.exists() {
        return Ok(StatsConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: StatsConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

pub fn render_default_config() -> String {
    format!(
        "# pagestats configuration (materialized by `pagestats init`)\n\n[snapshot]\nurl = \"{DEFAULT_SNAPSHOT_URL}\"\n# user_agent = \"{DEFAULT_USER_AGENT}\"\n# timeout_ms = {DEFAULT_TIMEOUT_MS}\n\n[project]\nname = \"{DEFAULT_PROJECT_NAME}\"\npage_base_url = \"{DEFAULT_PAGE_BASE_URL}\"\npreview_title = \"{DEFAULT_PREVIEW_TITLE}\"\n\n[report]\nlimit = {DEFAULT_REPORT_LIMIT}\n"
    )
}

fn env_lookup(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
