//! Climatologies over a window of complete years.
//!
//! How the window is chosen is a [`WindowPolicy`] supplied when the task is
//! built: either the section's configured span, narrowed to the complete
//! years on disk, or a single reference year.

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    AnalysisTask, Services, TaskContext, TaskInfo, VariableProducer, default_task_name,
    discard_stale, output_directory, request::VariableSet, run_tool,
};
use crate::{
    cache::{self, CacheDecision, OutputProduct},
    catalog::InputFileSet,
    config::ConfigScope,
    coverage::{CoverageRequest, CoverageWindow},
    error::{Error, Result},
    tool::DiagnosticSink,
    util::file_name,
};

/// A window together with the scope and stream files that agree with it.
#[derive(Debug, Clone)]
pub struct ResolvedWindow {
    pub scope: ConfigScope,
    pub window: CoverageWindow,
    pub files: InputFileSet,
}

pub trait WindowPolicy: Send + Sync {
    fn resolve(
        &self,
        scope: &ConfigScope,
        section: &str,
        stream: &str,
        services: &Services,
        sink: &dyn DiagnosticSink,
    ) -> Result<ResolvedWindow>;
}

/// The section's `startDate`/`endDate`, narrowed to complete years.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfiguredWindow;

impl WindowPolicy for ConfiguredWindow {
    fn resolve(
        &self,
        scope: &ConfigScope,
        section: &str,
        stream: &str,
        services: &Services,
        sink: &dyn DiagnosticSink,
    ) -> Result<ResolvedWindow> {
        let request = CoverageRequest::from_scope(scope, section)?;
        let candidates = services
            .index
            .resolve(stream, &request.start_date, &request.end_date)?;

        let resolution = services
            .resolver
            .resolve(&request, &candidates.year_months())?;

        if let Some(narrowing) = &resolution.narrowing {
            sink.warn(&narrowing.to_string());
        }

        let window = resolution.window;
        let files = candidates.filter(|file| window.contains(file.year_month()));

        Ok(ResolvedWindow {
            scope: window.apply_to(scope, section),
            window,
            files,
        })
    }
}

/// One year: `anomalyRefYear` from the section, or the first year on disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceYear;

impl WindowPolicy for ReferenceYear {
    fn resolve(
        &self,
        scope: &ConfigScope,
        section: &str,
        stream: &str,
        services: &Services,
        sink: &dyn DiagnosticSink,
    ) -> Result<ResolvedWindow> {
        let year = match scope.get_int_opt(section, "anomalyRefYear")? {
            Some(year) => year,
            None => first_year(services, stream)?,
        };

        let clone = CoverageWindow::for_years(year, year).apply_to(scope, section);
        ConfiguredWindow.resolve(&clone, section, stream, services, sink)
    }
}

/// Year of the earliest file in `stream`.
pub(crate) fn first_year(services: &Services, stream: &str) -> Result<i32> {
    services
        .index
        .available(stream)?
        .first()
        .map(|file| file.year())
        .ok_or_else(|| Error::NoInputFiles {
            stream: stream.to_string(),
            start: "the beginning".to_string(),
            end: "the end of the run".to_string(),
        })
}

#[derive(Default)]
struct Prepared {
    resolved: Option<ResolvedWindow>,
    output: Option<PathBuf>,
    variables: VariableSet,
}

pub struct ClimatologyTask {
    info: TaskInfo,
    section: String,
    stream: String,
    scope: Arc<ConfigScope>,
    services: Arc<Services>,
    policy: Box<dyn WindowPolicy>,
    state: Mutex<Prepared>,
}

impl ClimatologyTask {
    /// Named `taskName` from the section, or `mpasClimatology<Component>`.
    pub fn new(
        scope: Arc<ConfigScope>,
        services: Arc<Services>,
        section: &str,
        component: &str,
        policy: Box<dyn WindowPolicy>,
    ) -> Result<Self> {
        let name = scope.get_or(
            section,
            "taskName",
            &default_task_name("mpas", section, component),
        )?;
        Self::named(&name, scope, services, section, component, policy)
    }

    /// A climatology of the reference year, named `refYearMpasClimatology<Component>`.
    pub fn reference_year(
        scope: Arc<ConfigScope>,
        services: Arc<Services>,
        section: &str,
        component: &str,
    ) -> Result<Self> {
        let name = default_task_name("refYearMpas", section, component);
        Self::named(
            &name,
            scope,
            services,
            section,
            component,
            Box::new(ReferenceYear),
        )
    }

    fn named(
        name: &str,
        scope: Arc<ConfigScope>,
        services: Arc<Services>,
        section: &str,
        component: &str,
        policy: Box<dyn WindowPolicy>,
    ) -> Result<Self> {
        let stream = scope.get_or(section, "stream", super::DEFAULT_STREAM)?;

        Ok(Self {
            info: TaskInfo::new(name, component).with_tags([section]),
            section: section.to_string(),
            stream,
            scope,
            services,
            policy,
            state: Mutex::new(Prepared::default()),
        })
    }

    pub async fn window(&self) -> Option<CoverageWindow> {
        let state = self.state.lock().await;
        state.resolved.as_ref().map(|resolved| resolved.window.clone())
    }

    /// The scope this task's window was applied to, once prepared.
    pub async fn scope(&self) -> Option<ConfigScope> {
        let state = self.state.lock().await;
        state.resolved.as_ref().map(|resolved| resolved.scope.clone())
    }

    pub async fn output_file(&self) -> Option<PathBuf> {
        self.state.lock().await.output.clone()
    }

    pub async fn variables(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.variables.requested().iter().cloned().collect()
    }
}

#[async_trait]
impl AnalysisTask for ClimatologyTask {
    fn info(&self) -> &TaskInfo {
        &self.info
    }

    async fn prepare(&self, ctx: &TaskContext) -> Result<()> {
        let resolved = self.policy.resolve(
            &self.scope,
            &self.section,
            &self.stream,
            &self.services,
            ctx.sink(),
        )?;

        let directory =
            output_directory(&resolved.scope, "climatologySubdirectory", !ctx.is_dry_run())?;
        let output = directory.join(format!(
            "{}_{:04}-{:04}.nc",
            self.info.file_stem(),
            resolved.window.start_year,
            resolved.window.end_year
        ));

        let first = resolved.files.first().ok_or_else(|| Error::NoInputFiles {
            stream: self.stream.clone(),
            start: resolved.window.start_date.clone(),
            end: resolved.window.end_date.clone(),
        })?;
        let available = self.services.inspector.variables(&first.path).await?;

        debug!(
            task = %self.info.full_name(),
            window = %resolved.window,
            files = resolved.files.len(),
            "prepared climatology"
        );

        let mut state = self.state.lock().await;
        state.variables.set_available(available);
        state.output = Some(output);
        state.resolved = Some(resolved);
        Ok(())
    }

    async fn has_work(&self) -> bool {
        !self.state.lock().await.variables.is_empty()
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        let (variables, files, output) = {
            let state = self.state.lock().await;
            match (&state.resolved, &state.output) {
                (Some(resolved), Some(output)) => (
                    state.variables.requested().clone(),
                    resolved.files.clone(),
                    output.clone(),
                ),
                _ => return Err(Error::NotPrepared(self.info.full_name())),
            }
        };

        if variables.is_empty() {
            return Ok(());
        }

        let tool = &self.services.average;
        if !ctx.is_dry_run() {
            tool.locate()?;
        }

        let existing =
            OutputProduct::inspect(&output, self.services.inspector.as_ref(), None).await?;
        let decision = cache::decide_fixed(existing.as_ref(), &variables);
        ctx.sink()
            .info(&format!("{}: {}", file_name(&output), decision.describe()));

        match decision {
            CacheDecision::NoOp | CacheDecision::Extend(_) => Ok(()),
            CacheDecision::Rebuild(reason) => {
                discard_stale(ctx, existing.as_ref(), &reason)?;
                let variables: Vec<String> = variables.into_iter().collect();
                run_tool(ctx, tool, &variables, &files, &output).await
            }
        }
    }
}

#[async_trait]
impl VariableProducer for ClimatologyTask {
    async fn add_variables(&self, variables: &[String]) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .variables
            .add(&self.info.full_name(), &self.stream, variables)
    }
}
