use std::collections::BTreeSet;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::analytics;
use crate::api::{ApiCall, Paging, PlatformApi, dedupe_by_key, fetch_paged, run_search};
use crate::check::ResourceCheck;
use crate::report::Message;

/// Usage-analytics dimension whose values are query pipeline names.
pub const PIPELINE_USAGE_DIMENSION: &str = "QUERYPIPELINE";

/// Statement features whose query expressions get probed with live searches.
const PROBED_FEATURES: [&str; 3] = ["filter", "ranking", "top"];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub condition: Option<ConditionRef>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConditionRef {
    pub id: String,
    #[serde(default)]
    pub definition: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statement {
    pub id: String,
    #[serde(default)]
    pub definition: String,
    #[serde(default)]
    pub feature: String,
    #[serde(default)]
    pub condition: Option<ConditionRef>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MlAssociation {
    pub id: String,
    #[serde(default)]
    pub model_id: String,
    #[serde(default)]
    pub model_display_name: String,
    #[serde(default)]
    pub model_engine: String,
    #[serde(default)]
    pub ranking_modifier: Option<i64>,
    #[serde(default)]
    pub max_recommendations: Option<i64>,
    #[serde(default)]
    pub condition: Option<Value>,
}

pub fn fetch_pipelines(api: &mut dyn PlatformApi) -> Result<Vec<Pipeline>> {
    let call = ApiCall::get("search/v1/admin/pipelines?organizationId={orgId}&perPage=200");
    let items = dedupe_by_key(fetch_paged(api, &call, &Paging::default())?, "id");
    items
        .into_iter()
        .map(|item| serde_json::from_value(item).context("malformed query pipeline record"))
        .collect()
}

pub fn fetch_statements(api: &mut dyn PlatformApi, pipeline_id: &str) -> Result<Vec<Statement>> {
    let call = ApiCall::get(format!(
        "search/v2/admin/pipelines/{pipeline_id}/statements?organizationId={{orgId}}&perPage=200"
    ));
    let paging = Paging {
        array_key: Some("statements"),
        page_count_key: Some("totalPages"),
        ..Paging::default()
    };
    let items = dedupe_by_key(fetch_paged(api, &call, &paging)?, "id");
    items
        .into_iter()
        .map(|item| serde_json::from_value(item).context("malformed pipeline statement record"))
        .collect()
}

pub fn fetch_ml_associations(
    api: &mut dyn PlatformApi,
    pipeline_id: &str,
) -> Result<Vec<MlAssociation>> {
    let call = ApiCall::get(format!(
        "search/v2/admin/pipelines/{pipeline_id}/ml/model/associations?organizationId={{orgId}}&perPage=200"
    ));
    let paging = Paging {
        array_key: Some("rules"),
        page_count_key: Some("totalPages"),
        ..Paging::default()
    };
    let items = dedupe_by_key(fetch_paged(api, &call, &paging)?, "id");
    items
        .into_iter()
        .map(|item| serde_json::from_value(item).context("malformed ML association record"))
        .collect()
}

/// Query expressions are the backtick-wrapped substrings of a statement
/// definition: every odd-indexed segment after splitting on the backtick.
pub fn backtick_expressions(definition: &str) -> Vec<String> {
    definition
        .split('`')
        .enumerate()
        .filter(|(index, _)| index % 2 == 1)
        .map(|(_, segment)| segment.to_string())
        .collect()
}

pub struct PipelineCheck {
    pub lookback_days: i64,
}

#[derive(Debug)]
pub struct PipelineContext {
    pub recent_usage: BTreeSet<String>,
    pub lookback_days: i64,
}

impl ResourceCheck for PipelineCheck {
    type Resource = Pipeline;
    type Context = PipelineContext;

    fn key(&self) -> &'static str {
        "pipeline"
    }

    fn initialize(
        &self,
        api: &mut dyn PlatformApi,
    ) -> Result<(Vec<Pipeline>, PipelineContext)> {
        let pipelines = fetch_pipelines(api)?;
        let usage =
            analytics::fetch_usage(api, PIPELINE_USAGE_DIMENSION, self.lookback_days, None)?;
        let recent_usage = usage.into_iter().map(|record| record.value).collect();
        Ok((
            pipelines,
            PipelineContext {
                recent_usage,
                lookback_days: self.lookback_days,
            },
        ))
    }

    fn check_one(
        &self,
        api: &mut dyn PlatformApi,
        context: &PipelineContext,
        pipeline: &Pipeline,
    ) -> Result<Vec<Message>> {
        let msg = |reason: String| Message::new(pipeline.name.as_str(), pipeline.id.as_str(), reason);
        let mut messages = Vec::new();

        if !context.recent_usage.contains(&pipeline.name) {
            messages.push(msg(format!(
                "NOT USED IN THE LAST {} DAYS",
                context.lookback_days
            )));
        }

        let statements = fetch_statements(api, &pipeline.id)?;
        for statement in &statements {
            // Definitions sometimes carry newlines; flatten for readable rows.
            let definition = statement.definition.replace('\n', " ");

            for warning in &statement.warnings {
                messages.push(msg(format!("{definition}: {warning}")));
            }

            if !PROBED_FEATURES.contains(&statement.feature.as_str()) {
                continue;
            }
            // Filters are probed against the default pipeline: what matters is
            // whether the expression matches anything in the index at all.
            let target = if statement.feature == "filter" {
                ""
            } else {
                pipeline.name.as_str()
            };
            for expression in backtick_expressions(&definition) {
                let results = match run_search(api, target, &expression) {
                    Ok(results) => results,
                    Err(_) => {
                        messages.push(msg(format!(
                            "{definition}: CANNOT GET SEARCH RESULTS FOR QUERY EXPRESSION"
                        )));
                        continue;
                    }
                };
                if !results.pipeline_matches(target) {
                    eprintln!(
                        "pipeline: search used pipeline \"{}\" instead of target \"{target}\"",
                        results.pipeline
                    );
                    break;
                }
                if results.total_count < 1 {
                    let scope = if target.is_empty() {
                        "THE INDEX"
                    } else {
                        "THIS QUERY PIPELINE"
                    };
                    messages.push(msg(format!(
                        "{definition}: QUERY EXPRESSION DOES NOT MATCH ANY CONTENT IN {scope}"
                    )));
                }
            }
        }

        let associations = fetch_ml_associations(api, &pipeline.id)?;
        if associations.is_empty() {
            messages.push(msg("NO ML MODELS".to_string()));
        }
        for (index, association) in associations.iter().enumerate() {
            let ml_msg = |text: String| {
                msg(format!("MODEL {} {text}", association.model_display_name))
            };
            match association.model_engine.as_str() {
                "topclicks" => {
                    if let Some(modifier) = association.ranking_modifier
                        && modifier > 250
                    {
                        messages.push(ml_msg(format!(
                            "RANKING MODIFIER {modifier} ABOVE RECOMMENDED VALUE"
                        )));
                    }
                    if let Some(max) = association.max_recommendations
                        && max > 5
                    {
                        messages.push(ml_msg(format!(
                            "MAX RECOMMENDATIONS {max} ABOVE RECOMMENDED VALUE"
                        )));
                    }
                }
                "querysuggest" => {
                    if let Some(max) = association.max_recommendations
                        && max > 10
                    {
                        messages.push(ml_msg(format!(
                            "MAX RECOMMENDATIONS {max} ABOVE RECOMMENDED VALUE"
                        )));
                    }
                }
                "eventrecommendation" => {
                    if let Some(modifier) = association.ranking_modifier
                        && modifier > 1000
                    {
                        messages.push(ml_msg(format!(
                            "RANKING MODIFIER {modifier} ABOVE RECOMMENDED VALUE"
                        )));
                    }
                }
                "facetsense" => {
                    if let Some(modifier) = association.ranking_modifier
                        && modifier > 50
                    {
                        messages.push(ml_msg(format!(
                            "RANKING MODIFIER {modifier} ABOVE RECOMMENDED VALUE"
                        )));
                    }
                }
                "mlquestionanswering" => {}
                other => {
                    messages.push(ml_msg(format!("HAS UNRECOGNIZED ML TYPE {other}")));
                }
            }

            // Two models of the same engine on the same condition (or both
            // without one) race each other; i < j visits each pair once.
            for other in &associations[index + 1..] {
                if association.model_engine == other.model_engine
                    && association.condition == other.condition
                {
                    messages.push(ml_msg(format!(
                        "RUNS ON SAME CONDITION AS OTHER mlmodel {}",
                        other.model_display_name
                    )));
                }
            }
        }

        Ok(messages)
    }
}
