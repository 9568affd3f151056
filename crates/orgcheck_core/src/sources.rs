use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::api::{ApiCall, Paging, PlatformApi, dedupe_by_key, fetch_paged};
use crate::check::ResourceCheck;
use crate::report::Message;

const UNHEALTHY_STATUSES: [&str; 5] = ["DISABLED", "ERROR", "PAUSED_ON_ERROR", "PAUSED", "PAUSING"];

/// Connectors that index item permissions when the source is secured.
const SECURED_CONNECTORS: [&str; 23] = [
    "BOX",
    "BOX_ENTERPRISE",
    "BOX_ENTERPRISE2",
    "DATABASE",
    "DROPBOX",
    "DROPBOX_FOR_BUSINESS",
    "FILE",
    "GENERIC_REST",
    "GMAIL",
    "GMAIL_DOMAIN_WIDE",
    "GOOGLE_DRIVE_DOMAIN_WIDE",
    "KHOROS",
    "LITHIUM",
    "MICROSOFT_DYNAMICS",
    "SALESFORCE",
    "SERVICENOW",
    "SHAREPOINT",
    "SHAREPOINT_ONLINE",
    "SHAREPOINT_ONLINE2",
    "SITECORE",
    "SLACK",
    "TEMPLATED_GENERIC_REST",
    "ZENDESK",
];

/// Connectors that index permissions only when the source system cooperates
/// (plugin installed, catalog configured, and so on).
const PARTLY_SECURED_CONNECTORS: [&str; 8] = [
    "CATALOG",
    "CONFLUENCE",
    "CONFLUENCE2",
    "CONFLUENCE2_HOSTED",
    "JIRA2",
    "JIRA2_HOSTED",
    "JIVE_HOSTED",
    "PUSH",
];

const SCRAPED_SOURCE_TYPES: [&str; 2] = ["SITEMAP", "WEB2"];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub push_enabled: bool,
    #[serde(default)]
    pub source_visibility: String,
    #[serde(default)]
    pub source_type: String,
    #[serde(default)]
    pub configuration_error: Option<ConfigurationError>,
    pub information: SourceInformation,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigurationError {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInformation {
    #[serde(default)]
    pub last_operation: Option<LastOperation>,
    pub source_status: SourceStatus,
    #[serde(default)]
    pub number_of_documents: i64,
    #[serde(default)]
    pub rebuild_required: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatus {
    #[serde(default)]
    pub extended_current_status: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    #[serde(default)]
    pub refresh_type: String,
    #[serde(default)]
    pub enabled: bool,
}

pub struct SourceCheck;

impl ResourceCheck for SourceCheck {
    type Resource = Source;
    type Context = ();

    fn key(&self) -> &'static str {
        "source"
    }

    fn initialize(&self, api: &mut dyn PlatformApi) -> Result<(Vec<Source>, ())> {
        let call = ApiCall::get("organizations/{orgId}/sources?perPage=100");
        let items = dedupe_by_key(fetch_paged(api, &call, &Paging::default())?, "id");
        let sources = items
            .into_iter()
            .map(|item| serde_json::from_value(item).context("malformed source record"))
            .collect::<Result<_>>()?;
        Ok((sources, ()))
    }

    fn check_one(
        &self,
        api: &mut dyn PlatformApi,
        _context: &(),
        source: &Source,
    ) -> Result<Vec<Message>> {
        let msg = |reason: String| Message::new(source.name.as_str(), source.id.as_str(), reason);
        let mut messages = Vec::new();

        if let Some(error) = &source.configuration_error {
            messages.push(msg(format!("CONFIGURATION ERROR: {}", error.message)));
        }
        match &source.information.last_operation {
            None => messages.push(msg("OPERATION ERROR: NO LAST OPERATION".to_string())),
            Some(operation) => {
                // A missing result counts as a failure.
                if operation.result.as_deref().unwrap_or("ERROR") == "ERROR" {
                    messages.push(msg(format!(
                        "OPERATION ERROR: {}",
                        operation.error_code.as_deref().unwrap_or("UNKNOWN")
                    )));
                }
            }
        }
        let status = source.information.source_status.extended_current_status.as_str();
        if UNHEALTHY_STATUSES.contains(&status) {
            messages.push(msg(format!("STATUS ERROR: {status}")));
        }
        if source.information.number_of_documents <= 0 {
            messages.push(msg("NO DOCUMENTS".to_string()));
        }
        if source.information.rebuild_required {
            messages.push(msg("REBUILD REQUIRED".to_string()));
        }

        // Push sources have no schedules.
        if !source.push_enabled {
            match fetch_schedules(api, &source.id) {
                Err(_) => messages.push(msg("CANNOT RETRIEVE SOURCE SCHEDULES".to_string())),
                Ok(schedules) => {
                    let rescan_enabled = schedules
                        .iter()
                        .any(|schedule| schedule.refresh_type == "FULL_REFRESH" && schedule.enabled);
                    if !rescan_enabled {
                        messages.push(msg("SCHEDULED RESCAN DISABLED".to_string()));
                    }
                    if schedules
                        .iter()
                        .any(|schedule| schedule.refresh_type == "REBUILD" && schedule.enabled)
                    {
                        messages.push(msg("SCHEDULED REBUILD ENABLED".to_string()));
                    }
                    // Refresh is not checked: it only applies to certain
                    // source types, such as Confluence with the plugin.
                }
            }
        }

        if source.source_visibility == "SHARED"
            && (SECURED_CONNECTORS.contains(&source.source_type.as_str())
                || PARTLY_SECURED_CONNECTORS.contains(&source.source_type.as_str()))
        {
            messages.push(msg("CONTENT PERMISSIONS NOT INDEXED".to_string()));
        }

        if SCRAPED_SOURCE_TYPES.contains(&source.source_type.as_str()) {
            let call = ApiCall::get(format!("organizations/{{orgId}}/sources/{}/raw", source.id));
            match api.call_json(&call) {
                Err(_) => messages.push(msg("CANNOT RETRIEVE SOURCE CONFIGURATION".to_string())),
                Ok(raw) => {
                    if !scraping_configured(&raw) {
                        messages.push(msg("WEB SCRAPING DISABLED".to_string()));
                    }
                }
            }
        }

        Ok(messages)
    }
}

fn fetch_schedules(api: &mut dyn PlatformApi, source_id: &str) -> Result<Vec<Schedule>> {
    let call = ApiCall::get(format!(
        "organizations/{{orgId}}/sources/{source_id}/schedules"
    ));
    let payload = api.call_json(&call)?;
    let items = payload
        .as_array()
        .cloned()
        .unwrap_or_default();
    items
        .into_iter()
        .map(|item| serde_json::from_value(item).context("malformed source schedule record"))
        .collect()
}

/// Whitespace-stripped empty or `[]` scraping configurations count as absent.
fn scraping_configured(raw: &Value) -> bool {
    let compact = raw
        .pointer("/configuration/parameters/ScrapingConfiguration")
        .and_then(|parameter| parameter.get("value"))
        .and_then(Value::as_str)
        .map(|value| value.split_whitespace().collect::<String>());
    matches!(compact.as_deref(), Some(text) if !text.is_empty() && text != "[]")
}
