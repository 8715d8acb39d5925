//! Reconciliation settings.
//!
//! Resolution order:
//! 1. The file named by `ERS_RECONCILE_CONFIG`
//! 2. `<config_dir>/wmshub/ers-reconcile.json` if it exists
//! 3. Built-in defaults
//!
//! Secrets and endpoints can then be overridden from the environment so
//! they never need to live in the file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config;
use crate::ers::RetryPolicy;
use crate::pipeline::extraction::{FilterRule, LayoutTolerances, DEFAULT_BUFFER_SIZE, MIN_BUFFER_SIZE};
use crate::pipeline::reconcile::ReconcileOptions;

pub const CONFIG_PATH_ENV: &str = "ERS_RECONCILE_CONFIG";
pub const ERS_API_KEY_ENV: &str = "ERS_API_KEY";
pub const ERS_USER_ID_ENV: &str = "ERS_USER_ID";
pub const ERS_BASE_URL_ENV: &str = "ERS_BASE_URL";
pub const REFERRAL_API_KEY_ENV: &str = "REFERRAL_API_KEY";
pub const REFERRAL_API_URL_ENV: &str = "REFERRAL_API_URL";

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read settings file {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("Invalid settings file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ═══════════════════════════════════════════
// Types
// ═══════════════════════════════════════════

/// Registry endpoint and smartcard-less credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistrySettings {
    pub base_url: String,
    pub api_key: String,
    pub user_id: String,
    pub timeout_secs: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8081/ers".into(),
            api_key: String::new(),
            user_id: String::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

/// Local referral API endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalApiSettings {
    pub base_url: String,
    pub api_key: String,
    pub timeout_secs: u64,
}

impl Default for LocalApiSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".into(),
            api_key: String::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconcileSettings {
    pub registry: RegistrySettings,
    pub local_api: LocalApiSettings,
    /// Pipe-delimited, e.g. `"pdf|rtf"`.
    pub supported_extensions: String,
    /// Wildcard patterns (`*`, `?`) for attachment titles to ignore.
    pub exclusions: Vec<String>,
    pub tolerances: LayoutTolerances,
    pub filters: Vec<FilterRule>,
    pub buffer_size: usize,
    pub retry: RetryPolicy,
    pub max_consecutive_failures: Option<u32>,
    pub mismatch_comment: Option<String>,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            registry: RegistrySettings::default(),
            local_api: LocalApiSettings::default(),
            supported_extensions: "pdf|rtf".into(),
            exclusions: Vec::new(),
            tolerances: LayoutTolerances::default(),
            filters: Vec::new(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            retry: RetryPolicy::default(),
            max_consecutive_failures: None,
            mismatch_comment: None,
        }
    }
}

// ═══════════════════════════════════════════
// Loading
// ═══════════════════════════════════════════

impl ReconcileSettings {
    /// Resolve, override from the environment and validate.
    pub fn load() -> Result<Self, ConfigError> {
        let env = |key: &str| std::env::var(key).ok();
        let mut settings = match resolve_path(env(CONFIG_PATH_ENV)) {
            Some(path) => Self::load_from(&path)?,
            None => {
                tracing::info!("No settings file found, using defaults");
                Self::default()
            }
        };
        settings.apply_overrides(env);
        settings.validate()?;
        Ok(settings)
    }

    /// Read a JSON settings file. Missing fields take their defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let settings = serde_json::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        tracing::info!(path = %path.display(), "Settings loaded");
        Ok(settings)
    }

    /// Apply environment overrides. Blank values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(ERS_API_KEY_ENV) {
            self.registry.api_key = v;
        }
        if let Some(v) = get(ERS_USER_ID_ENV) {
            self.registry.user_id = v;
        }
        if let Some(v) = get(ERS_BASE_URL_ENV) {
            self.registry.base_url = v;
        }
        if let Some(v) = get(REFERRAL_API_KEY_ENV) {
            self.local_api.api_key = v;
        }
        if let Some(v) = get(REFERRAL_API_URL_ENV) {
            self.local_api.base_url = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        };

        if self
            .supported_extensions
            .split('|')
            .all(|e| e.trim().trim_start_matches('.').is_empty())
        {
            return invalid("supportedExtensions", "at least one extension is required");
        }
        if self.buffer_size < MIN_BUFFER_SIZE {
            return invalid(
                "bufferSize",
                &format!("must be at least {MIN_BUFFER_SIZE}, got {}", self.buffer_size),
            );
        }

        let t = &self.tolerances;
        if t.column_x_tolerance <= 0.0 {
            return invalid("tolerances.columnXTolerance", "must be positive");
        }
        if t.margin_size <= 0.0 {
            return invalid("tolerances.marginSize", "must be positive");
        }
        if t.minimum_colon_count == 0 {
            return invalid("tolerances.minimumColonCount", "must be positive");
        }
        if t.minimum_question_rows == 0 {
            return invalid("tolerances.minimumQuestionRows", "must be positive");
        }

        if self.registry.base_url.trim().is_empty() {
            return invalid("registry.baseUrl", "must not be empty");
        }
        if self.local_api.base_url.trim().is_empty() {
            return invalid("localApi.baseUrl", "must not be empty");
        }
        if self.registry.timeout_secs == 0 || self.local_api.timeout_secs == 0 {
            return invalid("timeoutSecs", "must be positive");
        }
        Ok(())
    }

    pub fn reconcile_options(&self) -> ReconcileOptions {
        ReconcileOptions {
            max_consecutive_failures: self.max_consecutive_failures,
            mismatch_comment: self.mismatch_comment.clone(),
        }
    }
}

/// Explicit path first, then the per-user default if it exists.
fn resolve_path(explicit: Option<String>) -> Option<PathBuf> {
    if let Some(path) = explicit.filter(|p| !p.trim().is_empty()) {
        return Some(PathBuf::from(path));
    }
    config::default_settings_path().filter(|p| p.exists())
}
