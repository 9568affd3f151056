use std::collections::BTreeSet;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_json::Value;

use crate::analytics::{self, normalize_facet_field};
use crate::api::{ApiCall, PlatformApi, dedupe_by_key, run_search};
use crate::check::ResourceCheck;
use crate::report::Message;

/// Usage-analytics dimension whose values are the facet fields users touched.
pub const FACET_USAGE_DIMENSION: &str = "FACETID";

/// Types that are always facet and sortable at no extra cost.
const ALWAYS_SORTABLE_TYPES: [&str; 4] = ["Integer 32", "Integer 64", "Decimal", "Date"];

const SETTING_COST: &str =
    ": Impacts caching and can reduce query performance. If this setting is not needed, remove it.";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub name: String,
    #[serde(default)]
    pub field_type: String,
    #[serde(default)]
    pub include_in_query: bool,
    #[serde(default)]
    pub include_in_results: bool,
    #[serde(default)]
    pub sort_by_field: bool,
    #[serde(default)]
    pub group_by_field: bool,
    #[serde(default)]
    pub split_group_by_field: bool,
}

/// The search API reports storage types; the admin console shows friendlier
/// names, which is what operators expect in the report.
pub fn console_type(field_type: &str) -> &str {
    match field_type {
        "Double" => "Decimal",
        "LargeString" => "String",
        "Long" => "Integer 32",
        "Long64" => "Integer 64",
        other => other,
    }
}

pub struct FieldCheck {
    pub lookback_days: i64,
}

#[derive(Debug)]
pub struct FieldContext {
    pub facet_usage: BTreeSet<String>,
    pub lookback_days: i64,
}

impl ResourceCheck for FieldCheck {
    type Resource = Field;
    type Context = FieldContext;

    fn key(&self) -> &'static str {
        "field"
    }

    fn initialize(&self, api: &mut dyn PlatformApi) -> Result<(Vec<Field>, FieldContext)> {
        let records =
            analytics::fetch_usage(api, FACET_USAGE_DIMENSION, self.lookback_days, None)?;
        let facet_usage = analytics::facet_usage_set(&records);

        let call = ApiCall::get("search/v2/fields?organizationId={orgId}&viewAllContent=true");
        let payload = api.call_json(&call)?;
        let items = payload
            .get("fields")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| anyhow!("field list response has no fields array"))?;
        let fields = dedupe_by_key(items, "name")
            .into_iter()
            .map(|item| serde_json::from_value(item).context("malformed field record"))
            .collect::<Result<_>>()?;
        Ok((
            fields,
            FieldContext {
                facet_usage,
                lookback_days: self.lookback_days,
            },
        ))
    }

    fn check_one(
        &self,
        api: &mut dyn PlatformApi,
        context: &FieldContext,
        field: &Field,
    ) -> Result<Vec<Message>> {
        let field_type = console_type(&field.field_type);
        let msg = |reason: String| Message::new(field.name.as_str(), field_type, reason);
        let mut messages = Vec::new();

        // Querying the field name (with its @ sigil) tells whether any
        // document carries a value; the facet endpoint would require the
        // field to already be a facet.
        match run_search(api, "", &field.name) {
            Err(_) => {
                messages.push(msg("CANNOT GET SEARCH RESULTS FOR FIELD".to_string()));
                return Ok(messages);
            }
            Ok(results) if results.total_count < 1 => {
                messages.push(msg("FIELD HAS NO VALUE IN THE INDEX".to_string()));
                return Ok(messages);
            }
            Ok(_) => {}
        }

        if field.include_in_query {
            messages.push(msg(
                "Free-Text Searchable: Impacts relevance and query performance. If users expect typed keywords to match this field and it has many values (more than 50), keep it Free-Text Searchable. If it has fewer values, it may work better as a Facet. Otherwise it should be neither."
                    .to_string(),
            ));
        }
        if field.include_in_results {
            messages.push(msg(
                "Displayable in Results: Security risk. Ensure that this field does not contain sensitive data."
                    .to_string(),
            ));
        }

        let always_sortable = ALWAYS_SORTABLE_TYPES.contains(&field_type);
        if field.sort_by_field && !always_sortable {
            messages.push(msg(format!("Sortable{SETTING_COST}")));
        }
        if (field.group_by_field || field.split_group_by_field)
            && !always_sortable
            && !context
                .facet_usage
                .contains(&normalize_facet_field(&field.name))
        {
            let label = if field.split_group_by_field {
                "Multi-value Facet"
            } else {
                "Facet"
            };
            messages.push(msg(format!(
                "{label} UNUSED IN THE LAST {} DAYS{SETTING_COST}",
                context.lookback_days
            )));
        }

        Ok(messages)
    }
}
