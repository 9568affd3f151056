use anyhow::{Context, Result};
use serde::Deserialize;

use crate::api::{ApiCall, Paging, PlatformApi, dedupe_by_key, fetch_paged};
use crate::check::ResourceCheck;
use crate::pipelines::{ConditionRef, Pipeline, Statement, fetch_pipelines, fetch_statements};
use crate::report::Message;

/// Sentinel standing in for "no condition set"; it can legitimately be shared.
pub const NO_CONDITION: &str = "NO CONDITION";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub id: String,
    #[serde(default)]
    pub definition: String,
}

fn sentinel_ref() -> ConditionRef {
    ConditionRef {
        id: NO_CONDITION.to_string(),
        definition: NO_CONDITION.to_string(),
    }
}

/// One pipeline with its statements, conditions defaulted to the sentinel.
/// Statements stay owned by their pipeline; the checker only looks them up.
pub struct PipelineStatements {
    pub pipeline: Pipeline,
    pub statements: Vec<Statement>,
}

pub struct ConditionContext {
    pub pipelines: Vec<PipelineStatements>,
}

pub struct ConditionCheck;

impl ResourceCheck for ConditionCheck {
    type Resource = Condition;
    type Context = ConditionContext;

    fn key(&self) -> &'static str {
        "condition"
    }

    fn initialize(
        &self,
        api: &mut dyn PlatformApi,
    ) -> Result<(Vec<Condition>, ConditionContext)> {
        // A/B tests clone pipelines under "<name>-mirror-<n>"; ignore those.
        let pipelines: Vec<Pipeline> = fetch_pipelines(api)?
            .into_iter()
            .filter(|pipeline| !pipeline.name.contains("-mirror-"))
            .collect();

        let mut entries = Vec::with_capacity(pipelines.len());
        for mut pipeline in pipelines {
            let statements = fetch_statements(api, &pipeline.id)?
                .into_iter()
                .map(|mut statement| {
                    statement.condition.get_or_insert_with(sentinel_ref);
                    statement
                })
                .collect();
            pipeline.condition.get_or_insert_with(sentinel_ref);
            entries.push(PipelineStatements {
                pipeline,
                statements,
            });
        }

        let call =
            ApiCall::get("search/v1/admin/pipelines/statements?organizationId={orgId}&perPage=200");
        let paging = Paging {
            array_key: Some("statements"),
            page_count_key: Some("totalPages"),
            ..Paging::default()
        };
        let items = dedupe_by_key(fetch_paged(api, &call, &paging)?, "id");
        let mut conditions: Vec<Condition> = items
            .into_iter()
            .map(|item| serde_json::from_value(item).context("malformed condition record"))
            .collect::<Result<_>>()?;
        // Appended so pipelines without a condition match against something.
        conditions.push(Condition {
            id: NO_CONDITION.to_string(),
            definition: NO_CONDITION.to_string(),
        });

        Ok((conditions, ConditionContext { pipelines: entries }))
    }

    fn check_one(
        &self,
        _api: &mut dyn PlatformApi,
        context: &ConditionContext,
        condition: &Condition,
    ) -> Result<Vec<Message>> {
        let msg =
            |reason: String| Message::new(condition.definition.as_str(), condition.id.as_str(), reason);
        let mut messages = Vec::new();

        let pipeline_matches: Vec<&PipelineStatements> = context
            .pipelines
            .iter()
            .filter(|entry| {
                entry
                    .pipeline
                    .condition
                    .as_ref()
                    .is_some_and(|reference| reference.id == condition.id)
            })
            .collect();

        let mut statement_matches: Vec<(&PipelineStatements, &Statement)> = Vec::new();
        for entry in &context.pipelines {
            for statement in &entry.statements {
                if statement
                    .condition
                    .as_ref()
                    .is_some_and(|reference| reference.id == condition.id)
                {
                    statement_matches.push((entry, statement));
                }
            }
        }

        if pipeline_matches.is_empty() && statement_matches.is_empty() {
            messages.push(msg(
                "NOT ASSOCIATED WITH ANY QUERY PIPELINE OR STATEMENT".to_string(),
            ));
        }

        if pipeline_matches.len() > 1 && condition.id != NO_CONDITION {
            let names = pipeline_matches
                .iter()
                .map(|entry| entry.pipeline.name.as_str())
                .collect::<Vec<_>>()
                .join(",");
            messages.push(msg(format!(
                "CONFLICT: SHARED BY {} QUERY PIPELINES {names}",
                pipeline_matches.len()
            )));
        }

        // i < j walks each unordered pair exactly once and never compares a
        // statement to itself.
        for i in 0..statement_matches.len() {
            for j in i + 1..statement_matches.len() {
                let (entry, statement) = statement_matches[i];
                let (entry2, statement2) = statement_matches[j];
                if entry.pipeline.id != entry2.pipeline.id
                    || statement.feature != statement2.feature
                {
                    continue;
                }
                let pair_msg = |text: &str| {
                    msg(format!(
                        "{text} IN QUERY PIPELINE {}: {}, {}",
                        entry.pipeline.name, statement.definition, statement2.definition
                    ))
                };

                match statement.feature.as_str() {
                    "trigger" => {
                        if statement.definition.starts_with("redirect")
                            || statement2.definition.starts_with("redirect")
                        {
                            messages.push(pair_msg(
                                "redirect trigger RUNS ON SAME CONDITION AS OTHER trigger",
                            ));
                        } else if statement.definition.starts_with("query")
                            && statement2.definition.starts_with("query")
                        {
                            messages.push(pair_msg("MULTIPLE query triggers"));
                        }
                    }
                    "rankingweight" => {
                        if ranking_weights_conflict(&statement.definition, &statement2.definition)
                        {
                            messages.push(pair_msg("MULTIPLE rankingweights ON SAME FACTOR"));
                        }
                    }
                    "queryParamOverride" => {
                        if let (Some(first), Some(second)) = (
                            parse_param_override(&statement.definition),
                            parse_param_override(&statement2.definition),
                        ) && first.0 == second.0
                            && first.1 != second.1
                        {
                            messages.push(pair_msg(&format!(
                                "MULTIPLE OVERRIDE PARAMETER {}",
                                first.0
                            )));
                        }
                    }
                    // Multiples of filter, thesaurus, stop word, boosting, and
                    // featured-result statements can safely coexist.
                    _ => {}
                }
            }
        }

        Ok(messages)
    }
}

/// Ranking-weight definitions look like
/// `rank adjacency: 5, docDate: 5, TFIDF: 7, title: 7`; the weights are the
/// numeric tokens in order. Two statements conflict when any factor position
/// carries two different weights and neither side is the neutral default 5.
pub fn ranking_weights_conflict(first: &str, second: &str) -> bool {
    numeric_tokens(first)
        .iter()
        .zip(numeric_tokens(second).iter())
        .any(|(a, b)| a != "5" && b != "5" && a != b)
}

fn numeric_tokens(definition: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in definition.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Override definitions look like `override query lq:"ghi"`. The parameter
/// name is everything up to the first colon; the value is everything after
/// it, so values containing colons stay intact. Returns None when the
/// definition doesn't follow that shape.
pub fn parse_param_override(definition: &str) -> Option<(String, String)> {
    let rest = definition.split("override query ").nth(1)?;
    let (name, value) = rest.split_once(':')?;
    Some((name.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        Condition, ConditionCheck, ConditionContext, NO_CONDITION, PipelineStatements,
        parse_param_override, ranking_weights_conflict, sentinel_ref,
    };
    use crate::api::testing::ScriptedApi;
    use crate::check::ResourceCheck;
    use crate::pipelines::{ConditionRef, Pipeline, Statement};

    fn condition(id: &str) -> Condition {
        Condition {
            id: id.to_string(),
            definition: format!("def-{id}"),
        }
    }

    fn condition_ref(id: &str) -> Option<ConditionRef> {
        Some(ConditionRef {
            id: id.to_string(),
            definition: format!("def-{id}"),
        })
    }

    fn pipeline(id: &str, name: &str, condition: Option<ConditionRef>) -> Pipeline {
        Pipeline {
            id: id.to_string(),
            name: name.to_string(),
            condition,
        }
    }

    fn statement(id: &str, feature: &str, definition: &str, cond: &str) -> Statement {
        Statement {
            id: id.to_string(),
            definition: definition.to_string(),
            feature: feature.to_string(),
            condition: condition_ref(cond),
            warnings: Vec::new(),
        }
    }

    fn check_messages(
        context: &ConditionContext,
        subject: &Condition,
    ) -> Vec<crate::report::Message> {
        let mut api = ScriptedApi::new();
        ConditionCheck
            .check_one(&mut api, context, subject)
            .expect("check")
    }

    #[test]
    fn orphaned_condition_yields_exactly_one_message() {
        let context = ConditionContext {
            pipelines: vec![PipelineStatements {
                pipeline: pipeline("p1", "main", condition_ref("other")),
                statements: vec![],
            }],
        };
        let messages = check_messages(&context, &condition("lonely"));
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].reason,
            "NOT ASSOCIATED WITH ANY QUERY PIPELINE OR STATEMENT"
        );
    }

    #[test]
    fn condition_referenced_by_one_pipeline_is_silent() {
        let context = ConditionContext {
            pipelines: vec![PipelineStatements {
                pipeline: pipeline("p1", "main", condition_ref("c1")),
                statements: vec![],
            }],
        };
        assert!(check_messages(&context, &condition("c1")).is_empty());
    }

    #[test]
    fn condition_shared_by_two_pipelines_conflicts_once_naming_both() {
        let context = ConditionContext {
            pipelines: vec![
                PipelineStatements {
                    pipeline: pipeline("p1", "main", condition_ref("c1")),
                    statements: vec![],
                },
                PipelineStatements {
                    pipeline: pipeline("p2", "support", condition_ref("c1")),
                    statements: vec![],
                },
            ],
        };
        let messages = check_messages(&context, &condition("c1"));
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].reason,
            "CONFLICT: SHARED BY 2 QUERY PIPELINES main,support"
        );
    }

    #[test]
    fn sentinel_condition_may_be_shared() {
        let context = ConditionContext {
            pipelines: vec![
                PipelineStatements {
                    pipeline: pipeline("p1", "main", Some(sentinel_ref())),
                    statements: vec![],
                },
                PipelineStatements {
                    pipeline: pipeline("p2", "support", Some(sentinel_ref())),
                    statements: vec![],
                },
            ],
        };
        let sentinel = Condition {
            id: NO_CONDITION.to_string(),
            definition: NO_CONDITION.to_string(),
        };
        assert!(check_messages(&context, &sentinel).is_empty());
    }

    #[test]
    fn ranking_weight_conflict_matches_the_neutral_default_rule() {
        assert!(ranking_weights_conflict(
            "rank title: 7, docDate: 5",
            "rank title: 9, docDate: 5"
        ));
        // One side on the neutral default is allowed.
        assert!(!ranking_weights_conflict(
            "rank title: 5, docDate: 5",
            "rank title: 9, docDate: 5"
        ));
        assert!(!ranking_weights_conflict(
            "rank title: 7, docDate: 5",
            "rank title: 7, docDate: 5"
        ));
    }

    #[test]
    fn pairwise_pass_visits_each_unordered_pair_once() {
        // Four always-conflicting rankingweight statements: expect 4*3/2 pairs.
        let statements = (0..4)
            .map(|index| {
                statement(
                    &format!("s{index}"),
                    "rankingweight",
                    &format!("rank title: {}", index + 6),
                    "c1",
                )
            })
            .collect();
        let context = ConditionContext {
            pipelines: vec![PipelineStatements {
                pipeline: pipeline("p1", "main", condition_ref("other")),
                statements,
            }],
        };
        let messages = check_messages(&context, &condition("c1"));
        assert_eq!(messages.len(), 6);
    }

    #[test]
    fn redirect_trigger_conflicts_with_any_other_trigger() {
        let context = ConditionContext {
            pipelines: vec![PipelineStatements {
                pipeline: pipeline("p1", "main", condition_ref("other")),
                statements: vec![
                    statement("s1", "trigger", "redirect `http://a`", "c1"),
                    statement("s2", "trigger", "notify `hello`", "c1"),
                ],
            }],
        };
        let messages = check_messages(&context, &condition("c1"));
        assert_eq!(messages.len(), 1);
        assert!(
            messages[0]
                .reason
                .starts_with("redirect trigger RUNS ON SAME CONDITION AS OTHER trigger")
        );
    }

    #[test]
    fn multiple_query_triggers_conflict() {
        let context = ConditionContext {
            pipelines: vec![PipelineStatements {
                pipeline: pipeline("p1", "main", condition_ref("other")),
                statements: vec![
                    statement("s1", "trigger", "query `a`", "c1"),
                    statement("s2", "trigger", "query `b`", "c1"),
                ],
            }],
        };
        let messages = check_messages(&context, &condition("c1"));
        assert_eq!(messages.len(), 1);
        assert!(messages[0].reason.starts_with("MULTIPLE query triggers"));
    }

    #[test]
    fn triggers_in_different_pipelines_do_not_conflict() {
        let context = ConditionContext {
            pipelines: vec![
                PipelineStatements {
                    pipeline: pipeline("p1", "main", condition_ref("other")),
                    statements: vec![statement("s1", "trigger", "query `a`", "c1")],
                },
                PipelineStatements {
                    pipeline: pipeline("p2", "support", condition_ref("other")),
                    statements: vec![statement("s2", "trigger", "query `b`", "c1")],
                },
            ],
        };
        assert!(check_messages(&context, &condition("c1")).is_empty());
    }

    #[test]
    fn param_override_parsing_splits_on_the_first_colon() {
        assert_eq!(
            parse_param_override("override query lq:\"ghi\""),
            Some(("lq".to_string(), "\"ghi\"".to_string()))
        );
        assert_eq!(
            parse_param_override("override query cq:\"@uri==\\\"a:b\\\"\""),
            Some(("cq".to_string(), "\"@uri==\\\"a:b\\\"\"".to_string()))
        );
        assert_eq!(parse_param_override("boost `x` by 2"), None);
        assert_eq!(parse_param_override("override query nocolon"), None);
    }

    #[test]
    fn same_parameter_with_different_values_conflicts() {
        let context = ConditionContext {
            pipelines: vec![PipelineStatements {
                pipeline: pipeline("p1", "main", condition_ref("other")),
                statements: vec![
                    statement("s1", "queryParamOverride", "override query lq:\"a\"", "c1"),
                    statement("s2", "queryParamOverride", "override query lq:\"b\"", "c1"),
                    statement("s3", "queryParamOverride", "override query cq:\"a\"", "c1"),
                ],
            }],
        };
        let messages = check_messages(&context, &condition("c1"));
        assert_eq!(messages.len(), 1);
        assert!(
            messages[0]
                .reason
                .starts_with("MULTIPLE OVERRIDE PARAMETER lq")
        );
    }

    #[test]
    fn evaluation_is_idempotent_over_unchanged_data() {
        let context = ConditionContext {
            pipelines: vec![PipelineStatements {
                pipeline: pipeline("p1", "main", condition_ref("c1")),
                statements: vec![
                    statement("s1", "rankingweight", "rank title: 7", "c1"),
                    statement("s2", "rankingweight", "rank title: 9", "c1"),
                ],
            }],
        };
        let subject = condition("c1");
        let first = check_messages(&context, &subject);
        let second = check_messages(&context, &subject);
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[test]
    fn initialize_defaults_missing_conditions_to_the_sentinel() {
        let mut api = ScriptedApi::new();
        api.stub(
            "search/v1/admin/pipelines?organizationId={orgId}&perPage=200&page=0",
            json!([
                {"id": "p1", "name": "main"},
                {"id": "p2", "name": "main-mirror-1"},
            ]),
        );
        api.stub(
            "search/v1/admin/pipelines?organizationId={orgId}&perPage=200&page=1",
            json!([]),
        );
        api.stub(
            "search/v2/admin/pipelines/p1/statements?organizationId={orgId}&perPage=200&page=0",
            json!({"statements": [{"id": "s1", "feature": "filter", "definition": "filter aq `@a`"}], "totalPages": 1}),
        );
        api.stub(
            "search/v1/admin/pipelines/statements?organizationId={orgId}&perPage=200&page=0",
            json!({"statements": [{"id": "c1", "definition": "when $query contains x"}], "totalPages": 1}),
        );

        let (conditions, context) = ConditionCheck.initialize(&mut api).expect("initialize");
        // Mirror pipelines are dropped before statements are fetched.
        assert_eq!(context.pipelines.len(), 1);
        let entry = &context.pipelines[0];
        assert_eq!(
            entry.pipeline.condition.as_ref().map(|c| c.id.as_str()),
            Some(NO_CONDITION)
        );
        assert_eq!(
            entry.statements[0].condition.as_ref().map(|c| c.id.as_str()),
            Some(NO_CONDITION)
        );
        // The sentinel is appended after the fetched conditions.
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions.last().map(|c| c.id.as_str()), Some(NO_CONDITION));
    }
}
