//! Configuration loading.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. `--config <path>` (CLI flag; must exist)
//! 2. `~/.loopcal/config.toml` (user)
//! 3. `/etc/loopcal/config.toml` (system)
//!
//! When no file is found the built-in defaults apply. Calendar access tokens
//! are per-request and never read from configuration.

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::calendar::client::{DEFAULT_BASE_URL, DEFAULT_MONTHS_BACK, DEFAULT_TOKEN_BUDGET};
use crate::prompt::PromptStore;
use crate::throttle::{ApiClass, RateBudget, ThrottleConfig};
use crate::{LoopError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub throttle: ThrottleSection,
    #[serde(default)]
    pub calendar: CalendarSection,
    #[serde(default)]
    pub prompts: PromptsSection,
}

/// `[throttle]`: cache and rate-limit settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ThrottleSection {
    /// TTL for `throttle_default_ttl` calls (default: 300).
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    /// Upper bound on a single operation; unset means unbounded.
    #[serde(default)]
    pub operation_timeout_secs: Option<u64>,
    /// Budgets by API class name. Classes not listed keep their built-in
    /// budget; new names add classes.
    #[serde(default)]
    pub budgets: HashMap<String, BudgetSection>,
}

impl Default for ThrottleSection {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl_secs(),
            operation_timeout_secs: None,
            budgets: HashMap::new(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct BudgetSection {
    pub requests: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_window_secs() -> u64 {
    60
}

/// `[calendar]`: calendar API settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CalendarSection {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_months_back")]
    pub months_back: u32,
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
}

impl Default for CalendarSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            months_back: default_months_back(),
            token_budget: default_token_budget(),
        }
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_months_back() -> u32 {
    DEFAULT_MONTHS_BACK
}

fn default_token_budget() -> usize {
    DEFAULT_TOKEN_BUDGET
}

/// `[prompts]`: where system prompts live.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptsSection {
    #[serde(default = "default_prompts_dir")]
    pub dir: PathBuf,
}

impl Default for PromptsSection {
    fn default() -> Self {
        Self {
            dir: default_prompts_dir(),
        }
    }
}

fn default_prompts_dir() -> PathBuf {
    PathBuf::from("prompts")
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// An explicit path that does not exist is an error; otherwise a
    /// missing file means defaults.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        match Self::resolve_config_path(explicit_path)? {
            Some(path) => Self::load_from_file(&path),
            None => {
                debug!("no config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            LoopError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            LoopError::Configuration(format!("Failed to parse config file {path:?}: {e}"))
        })
    }

    fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(Some(path.to_path_buf()));
            }
            return Err(LoopError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".loopcal").join("config.toml");
            if user_config.exists() {
                return Ok(Some(user_config));
            }
        }

        let system_config = PathBuf::from("/etc/loopcal/config.toml");
        if system_config.exists() {
            return Ok(Some(system_config));
        }

        Ok(None)
    }

    /// The validated throttler configuration: built-in budgets overlaid with
    /// the configured ones.
    pub fn throttle_config(&self) -> Result<ThrottleConfig> {
        let section = &self.throttle;
        let mut config =
            ThrottleConfig::new().default_ttl(Duration::from_secs(section.default_ttl_secs));
        for (name, budget) in &section.budgets {
            config = config.budget(
                ApiClass::new(name.as_str()),
                RateBudget::new(budget.requests, Duration::from_secs(budget.window_secs)),
            );
        }
        if let Some(secs) = section.operation_timeout_secs {
            config = config.operation_timeout(Duration::from_secs(secs));
        }
        config.validate()?;
        Ok(config)
    }

    /// A prompt store over `[prompts].dir`.
    pub fn prompt_store(&self) -> PromptStore {
        PromptStore::new(&self.prompts.dir)
    }
}
