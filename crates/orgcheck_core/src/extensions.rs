use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_json::Value;

use crate::api::{ApiCall, PlatformApi, dedupe_by_key};
use crate::check::ResourceCheck;
use crate::report::Message;

/// Document-object functions that rewrite item permissions; a script calling
/// any of these needs a manual review.
const PERMISSION_FUNCTIONS: [&str; 4] = [
    "clear_permissions",
    "add_allowed",
    "add_denied",
    "set_permissions",
];

const AVERAGE_DURATION_CEILING_SECONDS: f64 = 0.2;

#[derive(Debug, Clone, Deserialize)]
pub struct Extension {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionDetail {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub used_by: Vec<Value>,
    pub status: ExtensionStatus,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionStatus {
    pub duration_health: HealthIndicator,
    pub timeout_health: HealthIndicator,
    #[serde(default)]
    pub timeout_likeliness: String,
    #[serde(default)]
    pub daily_statistics: DailyStatistics,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthIndicator {
    #[serde(default)]
    pub health_indicator: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStatistics {
    #[serde(default)]
    pub average_duration_in_seconds: Option<f64>,
}

pub struct ExtensionCheck;

impl ResourceCheck for ExtensionCheck {
    type Resource = Extension;
    type Context = ();

    fn key(&self) -> &'static str {
        "extension"
    }

    fn initialize(&self, api: &mut dyn PlatformApi) -> Result<(Vec<Extension>, ())> {
        let payload = api.call_json(&ApiCall::get("organizations/{orgId}/extensions"))?;
        let items = payload
            .as_array()
            .cloned()
            .ok_or_else(|| anyhow!("extension list response is not an array"))?;
        let extensions = dedupe_by_key(items, "id")
            .into_iter()
            .map(|item| serde_json::from_value(item).context("malformed extension record"))
            .collect::<Result<_>>()?;
        Ok((extensions, ()))
    }

    fn check_one(
        &self,
        api: &mut dyn PlatformApi,
        _context: &(),
        extension: &Extension,
    ) -> Result<Vec<Message>> {
        // A failed detail fetch stays confined to this one extension.
        let call = ApiCall::get(format!("organizations/{{orgId}}/extensions/{}", extension.id));
        let detail: ExtensionDetail = match api.call_json(&call) {
            Ok(payload) => {
                serde_json::from_value(payload).context("malformed extension detail record")?
            }
            Err(_) => {
                return Ok(vec![Message::new(
                    extension.name.as_str(),
                    extension.id.as_str(),
                    "CANNOT RETRIEVE EXTENSION DETAILS",
                )]);
            }
        };

        let msg = |reason: String| Message::new(detail.name.as_str(), detail.id.as_str(), reason);
        let mut messages = Vec::new();

        if !detail.enabled {
            messages.push(msg("DISABLED".to_string()));
        }
        if detail.used_by.is_empty() {
            messages.push(msg("NOT USED BY ANY SOURCE".to_string()));
        }
        if detail.status.duration_health.health_indicator != "GOOD" {
            messages.push(msg(format!(
                "HEALTH INDICATOR: {}",
                detail.status.duration_health.health_indicator
            )));
        }
        if detail.status.timeout_health.health_indicator != "GOOD" {
            messages.push(msg(format!(
                "TIMEOUT INDICATOR: {}",
                detail.status.timeout_health.health_indicator
            )));
        }
        if detail.status.timeout_likeliness != "NONE" {
            messages.push(msg(format!(
                "TIMEOUT LIKELINESS: {}",
                detail.status.timeout_likeliness
            )));
        }
        if let Some(duration) = detail.status.daily_statistics.average_duration_in_seconds
            && duration > AVERAGE_DURATION_CEILING_SECONDS
        {
            messages.push(msg(format!("AVERAGE TIMEOUT HIGH: {duration}")));
        }

        if PERMISSION_FUNCTIONS
            .iter()
            .any(|function| detail.content.contains(function))
        {
            messages.push(msg(
                "EXTENSION MODIFIES PERMISSIONS. VALIDATE IT COVERS EVERY USE CASE, AND REJECTS DOCUMENTS ON ERROR."
                    .to_string(),
            ));
        }

        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Extension, ExtensionCheck};
    use crate::api::testing::ScriptedApi;
    use crate::check::ResourceCheck;

    fn extension(id: &str) -> Extension {
        Extension {
            id: id.to_string(),
            name: format!("ext-{id}"),
        }
    }

    fn healthy_detail(id: &str) -> serde_json::Value {
        json!({
            "id": id,
            "name": format!("ext-{id}"),
            "enabled": true,
            "usedBy": [{"sourceId": "s1"}],
            "status": {
                "durationHealth": {"healthIndicator": "GOOD"},
                "timeoutHealth": {"healthIndicator": "GOOD"},
                "timeoutLikeliness": "NONE",
                "dailyStatistics": {"averageDurationInSeconds": 0.05},
            },
            "content": "document.add_meta_data({'lang': 'en'})",
        })
    }

    #[test]
    fn healthy_extension_is_silent() {
        let mut api = ScriptedApi::new();
        api.stub("organizations/{orgId}/extensions/e1", healthy_detail("e1"));
        let messages = ExtensionCheck
            .check_one(&mut api, &(), &extension("e1"))
            .expect("check");
        assert!(messages.is_empty());
    }

    #[test]
    fn degraded_indicators_each_produce_a_message() {
        let mut detail = healthy_detail("e1");
        detail["enabled"] = json!(false);
        detail["usedBy"] = json!([]);
        detail["status"]["durationHealth"]["healthIndicator"] = json!("WARNING");
        detail["status"]["timeoutLikeliness"] = json!("LIKELY");
        detail["status"]["dailyStatistics"]["averageDurationInSeconds"] = json!(0.9);
        let mut api = ScriptedApi::new();
        api.stub("organizations/{orgId}/extensions/e1", detail);
        let reasons: Vec<String> = ExtensionCheck
            .check_one(&mut api, &(), &extension("e1"))
            .expect("check")
            .into_iter()
            .map(|message| message.reason)
            .collect();
        assert_eq!(
            reasons,
            vec![
                "DISABLED",
                "NOT USED BY ANY SOURCE",
                "HEALTH INDICATOR: WARNING",
                "TIMEOUT LIKELINESS: LIKELY",
                "AVERAGE TIMEOUT HIGH: 0.9",
            ]
        );
    }

    #[test]
    fn permission_mutating_scripts_are_flagged_for_review() {
        let mut detail = healthy_detail("e1");
        detail["content"] = json!("document.clear_permissions()\ndocument.add_allowed('g')");
        let mut api = ScriptedApi::new();
        api.stub("organizations/{orgId}/extensions/e1", detail);
        let messages = ExtensionCheck
            .check_one(&mut api, &(), &extension("e1"))
            .expect("check");
        assert_eq!(messages.len(), 1);
        assert!(messages[0].reason.starts_with("EXTENSION MODIFIES PERMISSIONS"));
    }

    #[test]
    fn failed_detail_fetch_confines_to_one_message() {
        let mut api = ScriptedApi::new();
        let messages = ExtensionCheck
            .check_one(&mut api, &(), &extension("gone"))
            .expect("check");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].reason, "CANNOT RETRIEVE EXTENSION DETAILS");
        assert_eq!(messages[0].id, "gone");
    }

    #[test]
    fn initialize_lists_and_dedupes_extensions() {
        let mut api = ScriptedApi::new();
        api.stub(
            "organizations/{orgId}/extensions",
            json!([
                {"id": "e1", "name": "clean title"},
                {"id": "e1", "name": "clean title copy"},
                {"id": "e2", "name": "reject drafts"},
            ]),
        );
        let (extensions, ()) = ExtensionCheck.initialize(&mut api).expect("initialize");
        assert_eq!(extensions.len(), 2);
        assert_eq!(extensions[0].name, "clean title");
    }
}
