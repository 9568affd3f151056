use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_json::Value;

use crate::api::{ApiCall, PlatformApi, dedupe_by_key};
use crate::check::ResourceCheck;
use crate::pipelines::{fetch_ml_associations, fetch_pipelines};
use crate::report::Message;

const DEGRADED_MARKERS: [&str; 4] = ["DEGRADED", "FAILED", "ERROR", "OFFLINE"];

/// Minimum training population below which a model is considered starved.
const MIN_POPULATION: f64 = 100.0;
const MIN_SNIPPET_COUNT: i64 = 100;
const MIN_TOP1_HIT_RATE: f64 = 0.5;
const MIN_TOP3_HIT_RATE: f64 = 0.75;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MlModel {
    pub id: String,
    #[serde(default)]
    pub model_display_name: String,
    #[serde(default)]
    pub engine_id: String,
    #[serde(default)]
    pub model_activeness_state: Option<String>,
    #[serde(default)]
    pub next_model_update_time: Option<Value>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub model_error_description: ModelErrorDescription,
    #[serde(default)]
    pub model_size_statistic: f64,
    #[serde(default)]
    pub info: ModelInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelErrorDescription {
    #[serde(default)]
    pub customer_errors: Vec<CustomerError>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerError {
    #[serde(default)]
    pub error_code: String,
    #[serde(default)]
    pub error_type: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    #[serde(default)]
    pub preparation_stats: Option<PreparationStats>,
    #[serde(default)]
    pub training_details: Option<TrainingDetails>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparationStats {
    #[serde(default)]
    pub snippet_count: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingDetails {
    #[serde(default)]
    pub performance_details: BTreeMap<String, FieldPerformance>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldPerformance {
    #[serde(default)]
    pub hit1: f64,
    #[serde(default)]
    pub hit3: f64,
}

pub struct ModelCheck;

pub struct ModelContext {
    /// Model ids referenced by at least one pipeline association.
    pub associated_model_ids: BTreeSet<String>,
}

impl ResourceCheck for ModelCheck {
    type Resource = MlModel;
    type Context = ModelContext;

    fn key(&self) -> &'static str {
        "model"
    }

    fn initialize(&self, api: &mut dyn PlatformApi) -> Result<(Vec<MlModel>, ModelContext)> {
        let pipelines = fetch_pipelines(api)?;
        let mut associated_model_ids = BTreeSet::new();
        for pipeline in &pipelines {
            for association in fetch_ml_associations(api, &pipeline.id)? {
                associated_model_ids.insert(association.model_id);
            }
        }

        let payload =
            api.call_json(&ApiCall::get("organizations/{orgId}/machinelearning/models/details"))?;
        let items = payload
            .as_array()
            .cloned()
            .ok_or_else(|| anyhow!("model details response is not an array"))?;
        let models = dedupe_by_key(items, "id")
            .into_iter()
            .map(|item| serde_json::from_value(item).context("malformed ML model record"))
            .collect::<Result<_>>()?;
        Ok((models, ModelContext {
            associated_model_ids,
        }))
    }

    fn check_one(
        &self,
        _api: &mut dyn PlatformApi,
        context: &ModelContext,
        model: &MlModel,
    ) -> Result<Vec<Message>> {
        let msg =
            |reason: String| Message::new(model.model_display_name.as_str(), model.id.as_str(), reason);
        let mut messages = Vec::new();

        if model.model_activeness_state.as_deref() == Some("INACTIVE") {
            messages.push(msg("INACTIVE".to_string()));
        }

        let update_time_valid = model
            .next_model_update_time
            .as_ref()
            .and_then(Value::as_i64)
            .is_some_and(|timestamp| timestamp >= 0);
        if !update_time_valid {
            messages.push(msg("INVALID NEXT UPDATE TIME".to_string()));
        }

        if DEGRADED_MARKERS
            .iter()
            .any(|marker| model.status.contains(marker))
        {
            messages.push(msg(format!("STATUS: {}", model.status)));
        }

        for error in &model.model_error_description.customer_errors {
            messages.push(msg(format!(
                "ERROR: code: \"{}\", type \"{}\", description \"{}\"",
                error.error_code, error.error_type, error.description
            )));
        }

        if !context.associated_model_ids.contains(&model.id) {
            messages.push(msg("NOT ASSOCIATED WITH ANY QUERY PIPELINE".to_string()));
        }

        let size = model.model_size_statistic;
        match model.engine_id.as_str() {
            "facetsense" | "topclicks" if size < MIN_POPULATION => {
                messages.push(msg(format!("POOR QUERY COUNT {size}")));
            }
            "eventrecommendation" if size < MIN_POPULATION => {
                messages.push(msg(format!("POOR RECOMMENDATION COUNT {size}")));
            }
            "querysuggest" if size < MIN_POPULATION => {
                messages.push(msg(format!("POOR CANDIDATE COUNT {size}")));
            }
            "mlquestionanswering" => {
                let count = model
                    .info
                    .preparation_stats
                    .as_ref()
                    .and_then(|stats| stats.snippet_count)
                    .unwrap_or(-1);
                if count < MIN_SNIPPET_COUNT {
                    messages.push(msg(format!("POOR SNIPPET COUNT {count}")));
                }
            }
            "caseclassification" => {
                if let Some(details) = &model.info.training_details {
                    for (field, stats) in &details.performance_details {
                        if stats.hit1 < MIN_TOP1_HIT_RATE {
                            messages.push(msg(format!(
                                "FOR FIELD {field}, POOR TOP 1 PREDICTION {}%",
                                100.0 * stats.hit1
                            )));
                        }
                        if stats.hit3 < MIN_TOP3_HIT_RATE {
                            messages.push(msg(format!(
                                "FOR FIELD {field}, POOR TOP 3 PREDICTION {}%",
                                100.0 * stats.hit3
                            )));
                        }
                    }
                }
            }
            _ => {}
        }

        Ok(messages)
    }
}
