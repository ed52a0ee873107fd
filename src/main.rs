use std::{process, sync::Arc};

use clap::Parser;
use tracing::{error, info};

use tsclim::{
    cli::Cli,
    config::ConfigScope,
    error::Result,
    execution::{RunOptions, TaskRunner, default_workers},
    logging,
    registry::{self, RunSettings},
    task::{Services, TaskState},
};

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    logging::init(args.verbose);

    match run_tsclim(args).await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    }
}

/// Command-line overrides win over the configuration file.
fn load_scope(args: &Cli) -> Result<ConfigScope> {
    let scope = ConfigScope::load(&args.file)?;
    let mut overrides = scope.with_overrides();

    if let Some(timeout) = &args.timeout {
        overrides = overrides.set("execution", "toolTimeout", timeout.as_str());
    }
    if let Some(mode) = args.output {
        overrides = overrides.set("execution", "toolOutput", mode.as_str());
    }

    Ok(overrides.build())
}

async fn run_tsclim(args: Cli) -> Result<bool> {
    let scope = load_scope(&args)?;
    let settings = RunSettings::from_scope(&scope)?;

    let scope = Arc::new(scope);
    let services = Arc::new(Services::from_scope(&scope)?);
    let graph = registry::build_graph(Arc::clone(&scope), services)?;

    if args.verbose {
        for line in graph.describe_relationships() {
            info!("{}", line);
        }
    }

    let generate = if args.generate.is_empty() {
        settings.generate
    } else {
        args.generate.clone()
    };
    let selected = graph.select(&generate)?;

    let order: Vec<String> = selected.iter().map(|id| graph.full_name(*id)).collect();
    info!(order = %order.join(" -> "), "task order");

    let options = RunOptions {
        workers: args
            .workers
            .or(settings.workers)
            .unwrap_or_else(default_workers),
        fail_fast: args.fail_fast,
        dry_run: args.dry_run,
    };

    let report = TaskRunner::new(&graph, options).run(&selected).await;

    info!(
        done = report.count(TaskState::Done),
        failed = report.count(TaskState::Failed),
        skipped = report.count(TaskState::Skipped),
        "run finished"
    );
    for outcome in report
        .outcomes
        .iter()
        .filter(|outcome| outcome.state != TaskState::Done)
    {
        info!(
            task = %outcome.name,
            state = %outcome.state,
            reason = outcome.reason.as_deref().unwrap_or(""),
            "not completed"
        );
    }
    for err in &report.errors {
        error!("{}", err);
    }

    Ok(report.errors.is_empty())
}
