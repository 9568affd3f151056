use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use orgcheck_core::api::PlatformClient;
use orgcheck_core::check::{self, DEFAULT_LOOKBACK_DAYS, ResourceKind, RunOptions};
use orgcheck_core::config;
use orgcheck_core::report;

#[derive(Debug, Parser)]
#[command(
    name = "orgcheck",
    version,
    about = "Audit the configuration health of a search organization and write per-resource CSV reports"
)]
struct Cli {
    #[arg(
        short = 'r',
        long = "resource",
        required = true,
        num_args = 1..,
        value_name = "KIND",
        help = "Resource kinds to check, or 'all'. Some checks consume search queries or require extra privileges."
    )]
    resource: Vec<String>,
    #[arg(long, value_name = "URL", help = "Platform API root")]
    platform_url: Option<String>,
    #[arg(long, value_name = "URL", help = "Usage-analytics API root")]
    analytics_url: Option<String>,
    #[arg(long, value_name = "ID", help = "Organization id")]
    org: Option<String>,
    #[arg(long, value_name = "TOKEN", help = "Bearer token")]
    token: Option<String>,
    #[arg(
        long,
        value_name = "PATH",
        default_value = "orgcheck.toml",
        help = "Optional TOML config file"
    )]
    config: PathBuf,
    #[arg(
        long,
        value_name = "DAYS",
        default_value_t = DEFAULT_LOOKBACK_DAYS,
        help = "Usage-analytics lookback window"
    )]
    days: i64,
    #[arg(long, value_name = "DIR", default_value = ".", help = "Report directory")]
    out_dir: PathBuf,
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<bool> {
    let kinds = check::expand_requested(&cli.resource)?;
    warn_about_privileges(&kinds);

    let file = config::load_config(&cli.config)?;
    let context = config::resolve_context(
        &file,
        cli.platform_url.as_deref(),
        cli.analytics_url.as_deref(),
        cli.org.as_deref(),
        cli.token.as_deref(),
    )?;
    let options = RunOptions {
        out_dir: cli.out_dir.clone(),
        org_id: context.org_id.clone(),
        stamp: report::timestamp_slug(),
        lookback_days: cli.days,
    };

    let mut api = PlatformClient::new(context)?;
    let mut all_ok = true;
    for kind in kinds {
        // A failed check aborts that resource type only; the run moves on.
        if let Err(error) = check::run_kind(kind, &mut api, &options) {
            eprintln!("{}: check failed: {error:#}", kind.key());
            all_ok = false;
        }
        println!();
    }
    Ok(all_ok)
}

fn warn_about_privileges(kinds: &[ResourceKind]) {
    let queries: Vec<&str> = kinds
        .iter()
        .filter(|kind| kind.runs_queries())
        .map(|kind| kind.key())
        .collect();
    if !queries.is_empty() {
        println!(
            "WARNING: these checks consume a small number of search queries: {}",
            queries.join(", ")
        );
    }
    let view_all: Vec<&str> = kinds
        .iter()
        .filter(|kind| kind.needs_view_all_content())
        .map(|kind| kind.key())
        .collect();
    if !view_all.is_empty() {
        println!(
            "WARNING: these checks require that your bearer token has the Search - View All Content privilege: {}",
            view_all.join(", ")
        );
    }
    println!();
}
