use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PLATFORM_URL: &str = "https://platform.cloud.coveo.com/";
pub const DEFAULT_ANALYTICS_URL: &str = "https://analytics.cloud.coveo.com/";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct OrgConfig {
    #[serde(default)]
    pub platform: PlatformSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct PlatformSection {
    pub platform_url: Option<String>,
    pub analytics_url: Option<String>,
    pub org_id: Option<String>,
    pub token: Option<String>,
}

/// Read-only authentication context threaded through every API call.
/// Constructed once at startup; never mutated afterwards.
#[derive(Debug, Clone)]
pub struct ApiContext {
    pub platform_url: String,
    pub analytics_url: String,
    pub org_id: String,
    pub token: String,
}

/// Load and parse an OrgConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<OrgConfig> {
    if !config_path.exists() {
        return Ok(OrgConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: OrgConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// Resolve the full ApiContext. Precedence per value: flag > env > config file > default.
/// The organization id and token have no defaults and are required.
pub fn resolve_context(
    file: &OrgConfig,
    platform_url: Option<&str>,
    analytics_url: Option<&str>,
    org_id: Option<&str>,
    token: Option<&str>,
) -> Result<ApiContext> {
    let platform_url = first_value(
        platform_url,
        "ORGCHECK_PLATFORM_URL",
        file.platform.platform_url.as_deref(),
    )
    .unwrap_or_else(|| DEFAULT_PLATFORM_URL.to_string());
    let analytics_url = first_value(
        analytics_url,
        "ORGCHECK_ANALYTICS_URL",
        file.platform.analytics_url.as_deref(),
    )
    .unwrap_or_else(|| DEFAULT_ANALYTICS_URL.to_string());
    let org_id = first_value(org_id, "ORGCHECK_ORG_ID", file.platform.org_id.as_deref()).context(
        "organization id is required (pass --org, set ORGCHECK_ORG_ID, or add it to orgcheck.toml)",
    )?;
    let token = first_value(token, "ORGCHECK_TOKEN", file.platform.token.as_deref()).context(
        "bearer token is required (pass --token, set ORGCHECK_TOKEN, or add it to orgcheck.toml)",
    )?;
    Ok(ApiContext {
        platform_url,
        analytics_url,
        org_id,
        token,
    })
}

fn first_value(flag: Option<&str>, env_key: &str, file_value: Option<&str>) -> Option<String> {
    if let Some(value) = flag {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }
    if let Ok(value) = env::var(env_key) {
        let trimmed = value.trim().to_string();
        if !trimmed.is_empty() {
            return Some(trimmed);
        }
    }
    file_value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
