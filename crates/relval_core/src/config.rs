use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "relval-rust/0.1";
pub const DEFAULT_API_URL: &str = "https://fedoraproject.org/w/api.php";

/// Runtime configuration: the wiki endpoint plus the page-template
/// conventions (dist streams, test types, section markers) that tie this
/// tool to a particular wiki community. All of it can be overridden from a
/// TOML file so the tool can target a differently-templated wiki.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TcmsConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub tcms: TcmsSection,
}

impl Default for TcmsConfig {
    fn default() -> Self {
        Self {
            wiki: WikiSection::default(),
            tcms: TcmsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
    /// Backoff before the single edit-conflict retry.
    pub edit_retry_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TcmsSection {
    /// Known compose streams. The first entry is the default dist.
    #[serde(default = "default_dists")]
    pub dists: Vec<String>,
    /// Test types with one result page per validation event.
    #[serde(default = "default_testtypes")]
    pub testtypes: Vec<String>,
    /// Heading substrings that mark the first results section of a page.
    #[serde(default = "default_results_markers")]
    pub results_markers: Vec<String>,
    /// Heading substrings for the legend section preceding the results.
    #[serde(default = "default_key_markers")]
    pub key_markers: Vec<String>,
}

impl Default for TcmsSection {
    fn default() -> Self {
        Self {
            dists: default_dists(),
            testtypes: default_testtypes(),
            results_markers: default_results_markers(),
            key_markers: default_key_markers(),
        }
    }
}

fn default_dists() -> Vec<String> {
    vec![
        "Fedora".to_string(),
        "Fedora-Modular".to_string(),
        "Fedora-IoT".to_string(),
    ]
}

fn default_testtypes() -> Vec<String> {
    vec![
        "Installation".to_string(),
        "Base".to_string(),
        "Server".to_string(),
        "Cloud".to_string(),
        "Desktop".to_string(),
    ]
}

fn default_results_markers() -> Vec<String> {
    vec![
        "Test Matri".to_string(),
        "Test Areas".to_string(),
        "An unsupported test or configuration.  No testing is required.".to_string(),
    ]
}

fn default_key_markers() -> Vec<String> {
    vec!["Key".to_string()]
}

impl TcmsConfig {
    /// Resolve the wiki API URL: env WIKI_API_URL > config > default.
    pub fn api_url(&self) -> String {
        if let Some(value) = env_nonempty("WIKI_API_URL") {
            return value;
        }
        self.wiki
            .api_url
            .clone()
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
    }

    /// Resolve the user agent: env WIKI_USER_AGENT > config > default.
    pub fn user_agent(&self) -> String {
        if let Some(value) = env_nonempty("WIKI_USER_AGENT") {
            return value;
        }
        self.wiki
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    /// Backoff before the single edit-conflict retry:
    /// env WIKI_EDIT_RETRY_DELAY_MS > config > 15s.
    pub fn edit_retry_delay_ms(&self) -> u64 {
        if let Some(value) = env_nonempty("WIKI_EDIT_RETRY_DELAY_MS")
            && let Ok(parsed) = value.parse::<u64>()
        {
            return parsed;
        }
        self.wiki.edit_retry_delay_ms.unwrap_or(15_000)
    }

    /// The default dist stream (first configured entry).
    pub fn default_dist(&self) -> &str {
        self.tcms
            .dists
            .first()
            .map(String::as_str)
            .unwrap_or("Fedora")
    }
}

/// Load a TcmsConfig from a TOML file. Returns defaults if the file does
/// not exist; a file that exists but does not parse is a hard error.
pub fn load_config(config_path: &Path) -> Result<TcmsConfig> {
    if !config_path.exists() {
        return Ok(TcmsConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: TcmsConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn env_nonempty(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}

pub(crate) fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

pub(crate) fn env_value_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}
