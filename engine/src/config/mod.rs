//! Configuration management
//!
//! This module resolves the docflow configuration by deep-merging four layers
//! in increasing precedence:
//!
//! 1. built-in defaults ([`ResolvedConfig::default`])
//! 2. the system layer, `<system_root>/config.toml`
//! 3. the project layer, `<project_root>/.docflow/config.toml`
//! 4. runtime overrides (`--set key=value`, or supplied by tests)
//!
//! # Merge Policy
//!
//! - Scalars are replaced by the higher layer
//! - Tables are merged key by key; missing keys inherit from below
//! - Arrays are replaced wholesale, never concatenated
//!
//! The result is immutable. Callers that need different settings resolve
//! again rather than mutating a shared config.
//!
//! # Configuration Sections
//!
//! - **user**: identity fields substituted into templates
//! - **system**: scraper, downloads, git, collection ids, testing, execution
//! - **workflows**: per-workflow overrides

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use sdk::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::time::Duration;
use tracing::debug;

use crate::environment::Environment;

pub mod discovery;

pub use discovery::{find_project_root, find_system_root, find_upwards, Marker};

/// Fully merged configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedConfig {
    #[serde(default)]
    pub user: UserConfig,

    #[serde(default)]
    pub system: SystemConfig,

    /// Per-workflow overrides keyed by workflow name
    #[serde(default)]
    pub workflows: BTreeMap<String, WorkflowOverrides>,
}

/// Identity of the person the documents are written for
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub name: String,
    pub preferred_name: String,
    pub email: String,
    pub phone: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    pub linkedin: String,
    pub github: String,
    pub website: String,
}

impl UserConfig {
    /// Template variables exposed as `{{user.<field>}}`
    pub fn template_vars(&self) -> BTreeMap<String, String> {
        let preferred = if self.preferred_name.is_empty() {
            &self.name
        } else {
            &self.preferred_name
        };
        [
            ("name", &self.name),
            ("preferred_name", preferred),
            ("email", &self.email),
            ("phone", &self.phone),
            ("address", &self.address),
            ("city", &self.city),
            ("state", &self.state),
            ("zip", &self.zip),
            ("linkedin", &self.linkedin),
            ("github", &self.github),
            ("website", &self.website),
        ]
        .into_iter()
        .map(|(k, v)| (format!("user.{}", k), v.clone()))
        .collect()
    }
}

/// Which downloader fetches job posting URLs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScraperKind {
    #[default]
    Builtin,
    Wget,
    Curl,
}

/// System behaviour settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Log level (error, warn, info, debug, trace)
    pub log_level: String,
    pub scraper: ScraperKind,
    pub web_download: WebDownloadConfig,
    /// Formats produced by `format` when none is requested
    pub output_formats: Vec<String>,
    pub git: GitConfig,
    pub collection_id: CollectionIdConfig,
    pub testing: TestingConfig,
    pub execution: ExecutionConfig,
    pub converter: ConverterConfig,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            scraper: ScraperKind::default(),
            web_download: WebDownloadConfig::default(),
            output_formats: vec!["docx".to_string()],
            git: GitConfig::default(),
            collection_id: CollectionIdConfig::default(),
            testing: TestingConfig::default(),
            execution: ExecutionConfig::default(),
            converter: ConverterConfig::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebDownloadConfig {
    pub timeout_secs: u64,
    /// Prefix downloaded pages with a UTF-8 byte order mark
    pub add_utf8_bom: bool,
}

impl Default for WebDownloadConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            add_utf8_bom: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub auto_commit: bool,
    /// Supports `{{action}}`, `{{workflow}}` and `{{collection_id}}`
    pub commit_message_template: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            auto_commit: false,
            commit_message_template: "docflow: {{action}} {{workflow}}/{{collection_id}}"
                .to_string(),
        }
    }
}

/// Collection id formatting rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionIdConfig {
    /// chrono format string of the date suffix
    pub date_format: String,
    /// Replacement for runs of non-alphanumeric characters
    pub sanitize_spaces: String,
    pub max_length: usize,
}

impl Default for CollectionIdConfig {
    fn default() -> Self {
        Self {
            date_format: "%Y%m%d".to_string(),
            sanitize_spaces: "_".to_string(),
            max_length: 50,
        }
    }
}

/// Characters that cannot appear in a collection id
fn unsafe_in_id(c: char) -> bool {
    c == '/' || c == '\\' || c.is_control()
}

impl CollectionIdConfig {
    /// Render the date suffix for `instant`
    ///
    /// Fails on unknown strftime directives and on output that could not
    /// be used as a single directory name.
    pub fn render_date(&self, instant: DateTime<Utc>) -> Result<String> {
        let items: Vec<Item<'_>> = StrftimeItems::new(&self.date_format).collect();
        if items.iter().any(|item| matches!(item, Item::Error)) {
            return Err(EngineError::Config(format!(
                "collection_id.date_format '{}' is not a valid date format",
                self.date_format
            )));
        }
        let mut rendered = String::new();
        write!(rendered, "{}", instant.format_with_items(items.into_iter())).map_err(|_| {
            EngineError::Config(format!(
                "collection_id.date_format '{}' cannot be rendered",
                self.date_format
            ))
        })?;
        if rendered.chars().any(unsafe_in_id) {
            return Err(EngineError::Config(format!(
                "collection_id.date_format '{}' produces path separators or control characters",
                self.date_format
            )));
        }
        Ok(rendered)
    }

    fn validate(&self) -> Result<()> {
        if self.date_format.is_empty() {
            return Err(EngineError::Config(
                "collection_id.date_format must not be empty".to_string(),
            ));
        }
        if self.sanitize_spaces.chars().any(unsafe_in_id) {
            return Err(EngineError::Config(
                "collection_id.sanitize_spaces must not contain path separators or control characters"
                    .to_string(),
            ));
        }
        // Rendered date plus separator must leave room for at least one character
        let widest = Utc
            .with_ymd_and_hms(2000, 12, 31, 23, 59, 59)
            .single()
            .ok_or_else(|| EngineError::Config("invalid sample date".to_string()))?;
        let sample = self.render_date(widest)?;
        let minimum = sample.chars().count() + self.sanitize_spaces.chars().count() + 1;
        if self.max_length < minimum {
            return Err(EngineError::Config(format!(
                "collection_id.max_length must be at least {} for date format '{}'",
                minimum, self.date_format
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestingConfig {
    /// Freeze the clock at this date (YYYY-MM-DD) or instant (RFC 3339)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub override_current_date: Option<String>,
}

impl TestingConfig {
    /// Parse the frozen instant, if one is configured
    pub fn frozen_now(&self) -> Result<Option<DateTime<Utc>>> {
        let Some(raw) = self.override_current_date.as_deref() else {
            return Ok(None);
        };
        if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
            return Ok(Some(instant.with_timezone(&Utc)));
        }
        let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
            EngineError::Config(format!(
                "override_current_date '{}' is neither YYYY-MM-DD nor RFC 3339",
                raw
            ))
        })?;
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| EngineError::Config(format!("invalid date '{}'", raw)))?;
        Ok(Some(Utc.from_utc_datetime(&midnight)))
    }
}

/// Limits of the bounded execution wrapper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub max_concurrent: usize,
    pub max_per_caller: usize,
    pub default_timeout_secs: u64,
    pub kill_grace_millis: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            max_per_caller: 4,
            default_timeout_secs: 120,
            kill_grace_millis: 2000,
        }
    }
}

impl ExecutionConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_millis)
    }
}

/// External conversion tool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    pub pandoc_path: String,
    pub mermaid_path: String,
    pub timeout_secs: u64,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            pandoc_path: "pandoc".to_string(),
            mermaid_path: "mmdc".to_string(),
            timeout_secs: 60,
        }
    }
}

/// Per-workflow overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowOverrides {
    /// Replaces the workflow's declared default processors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processors: Option<Vec<String>>,
    /// Reference document path, relative to the workflow directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_doc: Option<String>,
    /// Extension fields written into every new collection
    pub custom_fields: BTreeMap<String, toml::Value>,
}

/// Runtime overrides, the highest-precedence layer
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    value: Option<toml::Value>,
}

impl ConfigOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides from an arbitrary TOML table
    pub fn from_value(value: toml::Value) -> Self {
        Self { value: Some(value) }
    }

    /// Set a dotted key, e.g. `system.git.auto_commit=true`
    ///
    /// The value is parsed as a TOML literal when possible and kept as a
    /// string otherwise.
    pub fn set(mut self, dotted_key: &str, raw_value: &str) -> Result<Self> {
        let parts: Vec<&str> = dotted_key.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(EngineError::Validation(format!(
                "invalid config key '{}'",
                dotted_key
            )));
        }
        let value = parse_literal(raw_value);

        let mut nested = value;
        for part in parts.iter().rev() {
            let mut table = toml::map::Map::new();
            table.insert((*part).to_string(), nested);
            nested = toml::Value::Table(table);
        }

        self.value = Some(match self.value.take() {
            Some(existing) => merge_values(existing, nested),
            None => nested,
        });
        Ok(self)
    }

    /// Parse a `key=value` pair as given on the command line
    pub fn set_pair(self, pair: &str) -> Result<Self> {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            EngineError::Validation(format!("expected key=value, got '{}'", pair))
        })?;
        self.set(key.trim(), value.trim())
    }

    pub fn as_value(&self) -> Option<&toml::Value> {
        self.value.as_ref()
    }
}

fn parse_literal(raw: &str) -> toml::Value {
    let wrapped = format!("v = {}", raw);
    match toml::from_str::<toml::Table>(&wrapped)
        .ok()
        .and_then(|mut t| t.remove("v"))
    {
        // Dates are configured as strings throughout
        Some(toml::Value::Datetime(_)) | None => toml::Value::String(raw.to_string()),
        Some(value) => value,
    }
}

/// Deep-merge `upper` over `lower`
///
/// Tables merge recursively; every other value, arrays included, is
/// replaced by the upper layer.
pub fn merge_values(lower: toml::Value, upper: toml::Value) -> toml::Value {
    match (lower, upper) {
        (toml::Value::Table(mut base), toml::Value::Table(over)) => {
            for (key, value) in over {
                let merged = match base.remove(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            toml::Value::Table(base)
        }
        (_, upper) => upper,
    }
}

impl ResolvedConfig {
    /// Merge already-loaded layers on top of the built-in defaults
    pub fn from_layers<I>(layers: I) -> Result<Self>
    where
        I: IntoIterator<Item = toml::Value>,
    {
        let defaults = toml::Value::try_from(ResolvedConfig::default())
            .map_err(|e| EngineError::Config(format!("Failed to serialize defaults: {}", e)))?;

        let merged = layers.into_iter().fold(defaults, merge_values);
        let config: ResolvedConfig = merged
            .try_into()
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the configuration from the system and project environments
    pub async fn resolve(
        system: &dyn Environment,
        project: Option<&dyn Environment>,
        overrides: &ConfigOverrides,
    ) -> Result<Self> {
        let mut layers = Vec::new();
        if let Some(value) = system.get_config().await? {
            debug!("Loaded system config layer from {}", system.describe());
            layers.push(value);
        }
        if let Some(project) = project {
            if let Some(value) = project.get_config().await? {
                debug!("Loaded project config layer from {}", project.describe());
                layers.push(value);
            }
        }
        if let Some(value) = overrides.as_value() {
            debug!("Applying runtime config overrides");
            layers.push(value.clone());
        }
        Self::from_layers(layers)
    }

    /// Overrides for one workflow, or the empty default
    pub fn workflow(&self, name: &str) -> WorkflowOverrides {
        self.workflows.get(name).cloned().unwrap_or_default()
    }

    fn validate(&self) -> Result<()> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.system.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.system.log_level,
                valid_log_levels.join(", ")
            )));
        }

        self.system.collection_id.validate()?;

        let exec = &self.system.execution;
        if exec.max_concurrent == 0 || exec.max_per_caller == 0 {
            return Err(EngineError::Config(
                "execution limits must be greater than zero".to_string(),
            ));
        }
        if exec.default_timeout_secs == 0
            || self.system.converter.timeout_secs == 0
            || self.system.web_download.timeout_secs == 0
        {
            return Err(EngineError::Config(
                "timeouts must be greater than zero".to_string(),
            ));
        }

        self.system.testing.frozen_now()?;
        Ok(())
    }
}
