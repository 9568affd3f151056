use std::collections::BTreeSet;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Result, bail};

use crate::api::PlatformApi;
use crate::conditions::ConditionCheck;
use crate::extensions::ExtensionCheck;
use crate::fields::FieldCheck;
use crate::models::ModelCheck;
use crate::pipelines::PipelineCheck;
use crate::report::{Message, Report, write_report};
use crate::sources::SourceCheck;

pub const DEFAULT_LOOKBACK_DAYS: i64 = 60;

/// One resource type's checker.
///
/// `initialize` loads the primary collection plus whatever auxiliary data the
/// rules need; that context is handed back into every `check_one` call
/// explicitly, so nothing is shared between resource types.
pub trait ResourceCheck {
    type Resource;
    type Context;

    fn key(&self) -> &'static str;
    fn initialize(
        &self,
        api: &mut dyn PlatformApi,
    ) -> Result<(Vec<Self::Resource>, Self::Context)>;
    fn check_one(
        &self,
        api: &mut dyn PlatformApi,
        context: &Self::Context,
        resource: &Self::Resource,
    ) -> Result<Vec<Message>>;
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub out_dir: PathBuf,
    pub org_id: String,
    pub stamp: String,
    pub lookback_days: i64,
}

#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub total: usize,
    pub flagged: usize,
    pub requests: usize,
    pub report_path: PathBuf,
}

/// Run one checker end to end: load, evaluate every resource, persist the
/// report. Prints incremental progress for the operator.
pub fn run_check<C: ResourceCheck>(
    check: &C,
    api: &mut dyn PlatformApi,
    options: &RunOptions,
) -> Result<CheckOutcome> {
    let key = check.key();
    println!("{key}: Starting");
    let requests_before = api.request_count();
    let (resources, context) = check.initialize(api)?;

    let mut report = Report::new(key);
    print!("{key}: Processing {} resources", resources.len());
    let _ = io::stdout().flush();
    let mut flagged = 0usize;
    for resource in &resources {
        print!(".");
        let _ = io::stdout().flush();
        let messages = check.check_one(api, &context, resource)?;
        if !messages.is_empty() {
            flagged += 1;
            for message in &messages {
                report.push(message);
            }
        }
    }
    println!();
    println!(
        "{key}: {flagged} out of {} resources have messages",
        resources.len()
    );
    let report_path = write_report(&report, &options.out_dir, &options.org_id, &options.stamp)?;
    println!("{key}: Messages have been saved in {}", report_path.display());
    let requests = api.request_count() - requests_before;
    println!("{key}: Issued {requests} API requests");
    Ok(CheckOutcome {
        total: resources.len(),
        flagged,
        requests,
        report_path,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResourceKind {
    Condition,
    Extension,
    Field,
    Model,
    Pipeline,
    Source,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::Condition,
        ResourceKind::Extension,
        ResourceKind::Field,
        ResourceKind::Model,
        ResourceKind::Pipeline,
        ResourceKind::Source,
    ];

    pub fn key(self) -> &'static str {
        match self {
            ResourceKind::Condition => "condition",
            ResourceKind::Extension => "extension",
            ResourceKind::Field => "field",
            ResourceKind::Model => "model",
            ResourceKind::Pipeline => "pipeline",
            ResourceKind::Source => "source",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        for kind in Self::ALL {
            if kind.key() == value {
                return Ok(kind);
            }
        }
        bail!("unknown resource kind: {value} (expected all or one of: condition, extension, field, model, pipeline, source)")
    }

    /// Checks that run live searches and so consume query units.
    pub fn runs_queries(self) -> bool {
        matches!(self, ResourceKind::Field | ResourceKind::Pipeline)
    }

    /// Checks that need the view-all-content search privilege.
    pub fn needs_view_all_content(self) -> bool {
        matches!(self, ResourceKind::Field | ResourceKind::Pipeline)
    }
}

/// Expand requested keys (`all` is a wildcard) into a deduplicated, sorted
/// list so the run order is deterministic.
pub fn expand_requested(requested: &[String]) -> Result<Vec<ResourceKind>> {
    let mut kinds = BTreeSet::new();
    for raw in requested {
        if raw == "all" {
            kinds.extend(ResourceKind::ALL);
        } else {
            kinds.insert(ResourceKind::parse(raw)?);
        }
    }
    Ok(kinds.into_iter().collect())
}

pub fn run_kind(
    kind: ResourceKind,
    api: &mut dyn PlatformApi,
    options: &RunOptions,
) -> Result<CheckOutcome> {
    match kind {
        ResourceKind::Condition => run_check(&ConditionCheck, api, options),
        ResourceKind::Extension => run_check(&ExtensionCheck, api, options),
        ResourceKind::Field => run_check(
            &FieldCheck {
                lookback_days: options.lookback_days,
            },
            api,
            options,
        ),
        ResourceKind::Model => run_check(&ModelCheck, api, options),
        ResourceKind::Pipeline => run_check(
            &PipelineCheck {
                lookback_days: options.lookback_days,
            },
            api,
            options,
        ),
        ResourceKind::Source => run_check(&SourceCheck, api, options),
    }
}

#[cfg(test)]
mod tests {
    use super::{ResourceKind, expand_requested};

    #[test]
    fn expand_requested_dedupes_and_sorts() {
        let requested = vec![
            "source".to_string(),
            "extension".to_string(),
            "source".to_string(),
        ];
        let kinds = expand_requested(&requested).expect("expand");
        assert_eq!(kinds, vec![ResourceKind::Extension, ResourceKind::Source]);
    }

    #[test]
    fn expand_requested_all_covers_every_kind() {
        let kinds = expand_requested(&["all".to_string()]).expect("expand");
        assert_eq!(kinds.len(), ResourceKind::ALL.len());
        assert_eq!(kinds, ResourceKind::ALL.to_vec());
    }

    #[test]
    fn expand_requested_rejects_unknown_kinds() {
        let error = expand_requested(&["sauce".to_string()]).expect_err("must fail");
        assert!(error.to_string().contains("unknown resource kind"));
    }

    #[test]
    fn query_privileges_cover_the_search_driven_checks() {
        assert!(ResourceKind::Pipeline.runs_queries());
        assert!(ResourceKind::Field.needs_view_all_content());
        assert!(!ResourceKind::Source.runs_queries());
    }
}
