use std::{collections::BTreeSet, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    AnalysisTask, DEFAULT_STREAM, Services, TIME_END_VARIABLE, TIME_START_VARIABLE, TaskContext,
    TaskInfo, VariableProducer,
    climatology::{ConfiguredWindow, WindowPolicy, first_year},
    default_task_name, discard_stale, output_directory,
    request::VariableSet,
    run_tool,
};
use crate::{
    cache::{self, CacheDecision, OutputProduct},
    catalog::InputFileSet,
    config::ConfigScope,
    coverage::CoverageWindow,
    error::{Error, Result},
    util::file_name,
};

#[derive(Default)]
struct Prepared {
    scope: Option<ConfigScope>,
    window: Option<CoverageWindow>,
    input_files: InputFileSet,
    output: Option<PathBuf>,
    variables: VariableSet,
}

/// Extracts registered variables from monthly stream files into a single
/// appendable time series.
pub struct TimeSeriesTask {
    info: TaskInfo,
    section: String,
    stream: String,
    scope: Arc<ConfigScope>,
    services: Arc<Services>,
    state: Mutex<Prepared>,
}

impl TimeSeriesTask {
    pub fn new(
        scope: Arc<ConfigScope>,
        services: Arc<Services>,
        section: &str,
        component: &str,
    ) -> Result<Self> {
        let name = scope.get_or(
            section,
            "taskName",
            &default_task_name("mpas", section, component),
        )?;
        let stream = scope.get_or(section, "stream", DEFAULT_STREAM)?;

        Ok(Self {
            info: TaskInfo::new(name, component).with_tags([section]),
            section: section.to_string(),
            stream,
            scope,
            services,
            state: Mutex::new(Prepared::default()),
        })
    }

    /// The corrected window, published for downstream tasks once prepared.
    pub async fn window(&self) -> Option<CoverageWindow> {
        self.state.lock().await.window.clone()
    }

    pub async fn scope(&self) -> Option<ConfigScope> {
        self.state.lock().await.scope.clone()
    }

    pub async fn output_file(&self) -> Option<PathBuf> {
        self.state.lock().await.output.clone()
    }

    pub async fn input_files(&self) -> InputFileSet {
        self.state.lock().await.input_files.clone()
    }

    pub async fn variables(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.variables.requested().iter().cloned().collect()
    }

    /// Files of the anomaly reference year, which are always part of the series.
    fn reference_year_files(&self) -> Result<InputFileSet> {
        let year = match self.scope.get_int_opt(&self.section, "anomalyRefYear")? {
            Some(year) => year,
            None => first_year(&self.services, &self.stream)?,
        };

        Ok(self
            .services
            .index
            .available(&self.stream)?
            .filter(|file| file.year() == year))
    }
}

#[async_trait]
impl AnalysisTask for TimeSeriesTask {
    fn info(&self) -> &TaskInfo {
        &self.info
    }

    async fn prepare(&self, ctx: &TaskContext) -> Result<()> {
        let directory =
            output_directory(&self.scope, "timeSeriesSubdirectory", !ctx.is_dry_run())?;
        let output = directory.join(format!("{}.nc", self.info.file_stem()));

        let resolved = ConfiguredWindow.resolve(
            &self.scope,
            &self.section,
            &self.stream,
            &self.services,
            ctx.sink(),
        )?;

        let input_files = resolved.files.merge(&self.reference_year_files()?);

        let (first, last) = match (input_files.first(), input_files.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => {
                return Err(Error::NoInputFiles {
                    stream: self.stream.clone(),
                    start: resolved.window.start_date.clone(),
                    end: resolved.window.end_date.clone(),
                });
            }
        };

        let available = self.services.inspector.variables(&first.path).await?;

        ctx.sink().info(&format!(
            "time series from {} through {}",
            file_name(&first.path),
            file_name(&last.path)
        ));

        let mut state = self.state.lock().await;
        state.variables.set_available(available);
        state.output = Some(output);
        state.window = Some(resolved.window);
        state.scope = Some(resolved.scope);
        state.input_files = input_files;
        Ok(())
    }

    async fn has_work(&self) -> bool {
        !self.state.lock().await.variables.is_empty()
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        let (variables, input_files, output) = {
            let state = self.state.lock().await;
            let output = state
                .output
                .clone()
                .ok_or_else(|| Error::NotPrepared(self.info.full_name()))?;
            (
                state.variables.requested().clone(),
                state.input_files.clone(),
                output,
            )
        };

        if variables.is_empty() {
            return Ok(());
        }

        let tool = &self.services.concatenate;
        if !ctx.is_dry_run() {
            tool.locate()?;
        }

        let mut required: BTreeSet<String> = variables.clone();
        required.insert(TIME_START_VARIABLE.to_string());
        required.insert(TIME_END_VARIABLE.to_string());

        let existing = OutputProduct::inspect(
            &output,
            self.services.inspector.as_ref(),
            Some(TIME_START_VARIABLE),
        )
        .await?;
        let decision = cache::decide(existing.as_ref(), &required, &input_files);
        ctx.sink()
            .info(&format!("{}: {}", file_name(&output), decision.describe()));

        let files = match decision {
            CacheDecision::NoOp => return Ok(()),
            CacheDecision::Extend(delta) => delta,
            CacheDecision::Rebuild(reason) => {
                discard_stale(ctx, existing.as_ref(), &reason)?;
                input_files
            }
        };

        let mut selection: Vec<String> = variables
            .into_iter()
            .filter(|name| name != TIME_START_VARIABLE && name != TIME_END_VARIABLE)
            .collect();
        selection.push(TIME_START_VARIABLE.to_string());
        selection.push(TIME_END_VARIABLE.to_string());

        run_tool(ctx, tool, &selection, &files, &output).await
    }
}

#[async_trait]
impl VariableProducer for TimeSeriesTask {
    async fn add_variables(&self, variables: &[String]) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .variables
            .add(&self.info.full_name(), &self.stream, variables)
    }
}
