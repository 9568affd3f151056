use std::collections::BTreeSet;

use anyhow::{Result, anyhow, bail};
use chrono::{Duration, Utc};
use serde_json::Value;

use crate::api::{ApiBase, ApiCall, PlatformApi};

/// One occurrence-count row from the usage-analytics statistics service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub value: String,
    pub count: u64,
}

/// Fetch occurrence counts for one dimension over a lookback window ending now.
///
/// A non-positive occurrence count is an invariant violation on the analytics
/// side and fails the fetch rather than being dropped.
pub fn fetch_usage(
    api: &mut dyn PlatformApi,
    dimension: &str,
    lookback_days: i64,
    filter: Option<&str>,
) -> Result<Vec<UsageRecord>> {
    let to = Utc::now();
    let from = to - Duration::days(lookback_days);
    let mut endpoint = format!(
        "ua/v15/stats/combinedData?org={{orgId}}&m=OccurrenceCount&d={dimension}&from={}&to={}",
        from.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        to.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
    );
    if let Some(filter) = filter {
        endpoint.push_str("&f=");
        endpoint.push_str(filter);
    }
    let payload = api.call_json(&ApiCall::get(endpoint).on(ApiBase::Analytics))?;
    parse_combinations(&payload, dimension)
}

pub fn parse_combinations(payload: &Value, dimension: &str) -> Result<Vec<UsageRecord>> {
    let rows = payload
        .get("combinations")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("usage response has no combinations array"))?;
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let value = row
            .get(dimension)
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("usage row is missing the {dimension} dimension"))?;
        let count = row
            .get("OccurrenceCount")
            .and_then(Value::as_i64)
            .ok_or_else(|| anyhow!("usage row for {value} has no OccurrenceCount"))?;
        if count <= 0 {
            bail!("usage row for {value} reports non-positive occurrence count {count}");
        }
        records.push(UsageRecord {
            value: value.to_string(),
            count: count as u64,
        });
    }
    Ok(records)
}

/// Collapse facet usage records into a lookup set of canonical field names.
pub fn facet_usage_set(records: &[UsageRecord]) -> BTreeSet<String> {
    records
        .iter()
        .map(|record| normalize_facet_field(&record.value))
        .collect()
}

/// Canonical leading-sigil form of a field name as reported by analytics.
/// Multi-valued facet dimensions report positional variants with a trailing
/// number (`@tags2`); those collapse onto the base field.
pub fn normalize_facet_field(raw: &str) -> String {
    let trimmed = raw.trim().trim_start_matches('@');
    let base = trimmed.trim_end_matches(|ch: char| ch.is_ascii_digit());
    let name = if base.is_empty() { trimmed } else { base };
    format!("@{name}")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{UsageRecord, facet_usage_set, normalize_facet_field, parse_combinations};

    #[test]
    fn parse_combinations_reads_value_and_count() {
        let payload = json!({
            "combinations": [
                {"QUERYPIPELINE": "main", "OccurrenceCount": 120},
                {"QUERYPIPELINE": "support", "OccurrenceCount": 3},
            ],
            "totalNumberOfResults": 2,
        });
        let records = parse_combinations(&payload, "QUERYPIPELINE").expect("parse");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].value, "main");
        assert_eq!(records[0].count, 120);
    }

    #[test]
    fn parse_combinations_fails_on_non_positive_count() {
        let payload = json!({
            "combinations": [{"QUERYPIPELINE": "main", "OccurrenceCount": 0}],
        });
        let error = parse_combinations(&payload, "QUERYPIPELINE").expect_err("must fail");
        assert!(error.to_string().contains("non-positive"));
    }

    #[test]
    fn parse_combinations_fails_on_missing_dimension() {
        let payload = json!({"combinations": [{"OTHER": "x", "OccurrenceCount": 1}]});
        assert!(parse_combinations(&payload, "QUERYPIPELINE").is_err());
    }

    #[test]
    fn normalize_facet_field_adds_sigil_and_strips_positional_suffix() {
        assert_eq!(normalize_facet_field("author"), "@author");
        assert_eq!(normalize_facet_field("@author"), "@author");
        assert_eq!(normalize_facet_field("@tags2"), "@tags");
        assert_eq!(normalize_facet_field(" tags3 "), "@tags");
        // an all-digit name has nothing to strip down to
        assert_eq!(normalize_facet_field("42"), "@42");
    }

    #[test]
    fn facet_usage_set_dedupes_variants() {
        let records = vec![
            UsageRecord {
                value: "@tags".to_string(),
                count: 5,
            },
            UsageRecord {
                value: "@tags2".to_string(),
                count: 2,
            },
            UsageRecord {
                value: "author".to_string(),
                count: 9,
            },
        ];
        let set = facet_usage_set(&records);
        assert_eq!(set.len(), 2);
        assert!(set.contains("@tags"));
        assert!(set.contains("@author"));
    }
}
