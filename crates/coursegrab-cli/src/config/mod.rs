//! Configuration loading and resolution.
//!
//! The config file is JSON. Every section and field is optional; missing
//! values fall back to defaults. Command-line flags are applied on top via
//! [`Overrides`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use coursegrab::{
    redact, Credentials, EngineConfig, PortalEndpoints, ResponsePatterns, SecretStrategy,
    WaitPolicy, DEFAULT_CATEGORY, DEFAULT_MAX_CONSECUTIVE_FAULTS,
};

pub const CONFIG_ENV: &str = "COURSEGRAB_CONFIG";
const CWD_CONFIG: &str = "coursegrab.json";
pub const DEFAULT_SSO_URL: &str = "https://sso.buaa.edu.cn";
pub const DEFAULT_SECRETS_FILE: &str = "extracted_secrets.json";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("missing {0}; set it in the config file (user.{1}) or pass --{2}")]
    Missing(&'static str, &'static str, &'static str),
}

/// Whether a run makes one attempt or keeps retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Once,
    Loop,
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub student_id: String,
    pub password: String,
    pub target_course_name: String,
}

impl fmt::Debug for UserConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserConfig")
            .field("student_id", &self.student_id)
            .field("password", &redact(&self.password))
            .field("target_course_name", &self.target_course_name)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CourseConfig {
    pub course_id: String,
    pub category: String,
    /// When set, the batch lookup after login is skipped.
    pub batch_id: String,
}

impl Default for CourseConfig {
    fn default() -> Self {
        Self {
            course_id: String::new(),
            category: DEFAULT_CATEGORY.to_string(),
            batch_id: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub log_level: String,
    pub retry_interval_ms: u64,
    /// Wait multiplier per consecutive fault.
    pub backoff_factor: f64,
    /// Ceiling for the backed-off wait.
    pub max_retry_interval_ms: u64,
    pub mode: Mode,
    pub max_attempts: Option<u32>,
    pub fault_warn_after: u32,
    pub max_consecutive_faults: Option<u32>,
    pub secret_max_age_secs: Option<u64>,
    pub request_timeout_ms: u64,
    pub secret_order: Vec<SecretStrategy>,
    /// Secrets remembered from earlier runs. `None` disables the file.
    pub secrets_file: Option<PathBuf>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            retry_interval_ms: 1_000,
            backoff_factor: 2.0,
            max_retry_interval_ms: 60_000,
            mode: Mode::Once,
            max_attempts: None,
            fault_warn_after: 5,
            max_consecutive_faults: Some(DEFAULT_MAX_CONSECUTIVE_FAULTS),
            secret_max_age_secs: None,
            request_timeout_ms: coursegrab::transport::http_client::DEFAULT_TIMEOUT_MS,
            secret_order: SecretStrategy::DEFAULT_ORDER.to_vec(),
            secrets_file: Some(PathBuf::from(DEFAULT_SECRETS_FILE)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    pub base_url: String,
    pub sso_url: String,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: coursegrab::portal::DEFAULT_BASE_URL.to_string(),
            sso_url: DEFAULT_SSO_URL.to_string(),
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub user: UserConfig,
    pub course: CourseConfig,
    pub system: SystemConfig,
    pub patterns: ResponsePatterns,
    pub portal: PortalConfig,
}

/// Values given on the command line; `None` keeps the file's value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub student_id: Option<String>,
    pub password: Option<String>,
    pub course_name: Option<String>,
    pub course_id: Option<String>,
    pub category: Option<String>,
    pub batch_id: Option<String>,
    pub interval_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub once: bool,
    pub looping: bool,
}

impl AppConfig {
    /// Read and parse a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from the resolved location, or defaults if no file exists.
    ///
    /// An explicitly named file that cannot be read is an error.
    pub fn load_resolved(explicit: Option<&str>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        if let Some(path) = explicit {
            let path = PathBuf::from(path);
            return Ok((Self::load(&path)?, Some(path)));
        }
        match resolve_config_path(None) {
            Some(path) => Ok((Self::load(&path)?, Some(path))),
            None => Ok((Self::default(), None)),
        }
    }

    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(v) = &overrides.student_id {
            self.user.student_id = v.clone();
        }
        if let Some(v) = &overrides.password {
            self.user.password = v.clone();
        }
        if let Some(v) = &overrides.course_name {
            self.user.target_course_name = v.clone();
        }
        if let Some(v) = &overrides.course_id {
            self.course.course_id = v.clone();
        }
        if let Some(v) = &overrides.category {
            self.course.category = v.clone();
        }
        if let Some(v) = &overrides.batch_id {
            self.course.batch_id = v.clone();
        }
        if let Some(v) = overrides.interval_ms {
            self.system.retry_interval_ms = v;
        }
        if let Some(v) = overrides.max_attempts {
            self.system.max_attempts = Some(v);
        }
        if overrides.once {
            self.system.mode = Mode::Once;
        } else if overrides.looping {
            self.system.mode = Mode::Loop;
        }
    }

    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        if self.user.student_id.trim().is_empty() {
            return Err(ConfigError::Missing("student id", "student_id", "user"));
        }
        if self.user.password.is_empty() {
            return Err(ConfigError::Missing("password", "password", "password"));
        }
        Ok(Credentials::new(
            self.user.student_id.trim(),
            self.user.password.clone(),
        ))
    }

    pub fn endpoints(&self) -> PortalEndpoints {
        PortalEndpoints::new(&self.portal.base_url)
    }

    /// Engine settings. `once` mode is a budget of one attempt.
    pub fn engine_config(&self) -> EngineConfig {
        let max_attempts = match self.system.mode {
            Mode::Once => Some(1),
            Mode::Loop => self.system.max_attempts,
        };
        EngineConfig {
            endpoints: self.endpoints(),
            wait: WaitPolicy {
                interval: Duration::from_millis(self.system.retry_interval_ms),
                backoff_factor: self.system.backoff_factor,
                max_interval: Duration::from_millis(self.system.max_retry_interval_ms),
                ..WaitPolicy::default()
            },
            max_attempts,
            fault_warn_after: self.system.fault_warn_after,
            max_consecutive_faults: self.system.max_consecutive_faults,
            secret_max_age: self.system.secret_max_age_secs.map(Duration::from_secs),
            patterns: self.patterns.clone(),
            secret_order: self.system.secret_order.clone(),
        }
    }
}

/// Resolve the config file path.
///
/// Order: explicit path, `COURSEGRAB_CONFIG`, `./coursegrab.json`,
/// `~/.coursegrab/config.json`. Only the explicit path is returned without
/// checking that it exists.
pub fn resolve_config_path(explicit: Option<&str>) -> Option<PathBuf> {
    resolve_from(
        explicit,
        std::env::var(CONFIG_ENV).ok(),
        Path::new("."),
        dirs::home_dir(),
    )
}

fn resolve_from(
    explicit: Option<&str>,
    env_path: Option<String>,
    cwd: &Path,
    home: Option<PathBuf>,
) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(PathBuf::from(path));
    }

    if let Some(env_path) = env_path.filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(env_path));
    }

    let cwd_config = cwd.join(CWD_CONFIG);
    if cwd_config.exists() {
        return Some(cwd_config);
    }

    home.map(|h| h.join(".coursegrab").join("config.json"))
        .filter(|p| p.exists())
}
