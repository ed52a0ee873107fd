pub mod climatology;
pub mod graph;
pub mod request;
pub mod time_series;

pub use climatology::{ClimatologyTask, ConfiguredWindow, ReferenceYear, WindowPolicy};
pub use graph::{TaskGraph, TaskId};
pub use request::{VariableProducer, VariableRequest};
pub use time_series::TimeSeriesTask;

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;

use crate::{
    cache::{OutputProduct, RebuildReason},
    catalog::{InputFileIndex, InputFileSet},
    config::ConfigScope,
    coverage::CoverageResolver,
    error::{Error, Result},
    inspect::{FileInspector, NcksInspector},
    tool::{DiagnosticSink, ExternalTool, ToolCommand},
    util::{make_directories, remove_product},
};

/// Monthly time coordinates carried along with every extracted series.
pub const TIME_START_VARIABLE: &str = "xtime_startMonthly";
pub const TIME_END_VARIABLE: &str = "xtime_endMonthly";

pub const DEFAULT_STREAM: &str = "timeSeriesStatsMonthlyOutput";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub name: String,
    pub subtask: Option<String>,
    pub component: String,
    pub tags: Vec<String>,
}

impl TaskInfo {
    pub fn new(name: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subtask: None,
            component: component.into(),
            tags: Vec::new(),
        }
    }

    pub fn with_subtask(mut self, subtask: impl Into<String>) -> Self {
        self.subtask = Some(subtask.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for tag in tags {
            let tag = tag.into();
            if !self.tags.contains(&tag) {
                self.tags.push(tag);
            }
        }
        self
    }

    /// `name`, or `name: subtask` for a subtask.
    pub fn full_name(&self) -> String {
        match &self.subtask {
            Some(subtask) => format!("{}: {}", self.name, subtask),
            None => self.name.clone(),
        }
    }

    /// The full name in a form usable inside file names.
    pub fn file_stem(&self) -> String {
        match &self.subtask {
            Some(subtask) => format!("{}_{}", self.name, subtask),
            None => self.name.clone(),
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Unprepared,
    Ready,
    Running,
    Done,
    Failed,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed | TaskState::Skipped)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Unprepared => "unprepared",
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
            TaskState::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

/// Handed to every prepare and execute call.
#[derive(Clone)]
pub struct TaskContext {
    sink: Arc<dyn DiagnosticSink>,
    dry_run: bool,
}

impl TaskContext {
    pub fn new(sink: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            sink,
            dry_run: false,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn sink(&self) -> &dyn DiagnosticSink {
        self.sink.as_ref()
    }

    /// When set, tasks describe the commands they would run instead of running them.
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }
}

/// A unit of work with a two-phase lifecycle.
///
/// `prepare` runs for every selected task, in dependency order, before any
/// task executes. A task whose `has_work` is false after preparation is
/// finished without calling `execute`.
#[async_trait]
pub trait AnalysisTask: Send + Sync {
    fn info(&self) -> &TaskInfo;

    async fn prepare(&self, ctx: &TaskContext) -> Result<()>;

    async fn has_work(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<()>;
}

/// Collaborators shared by every task in a run.
pub struct Services {
    pub index: InputFileIndex,
    pub inspector: Arc<dyn FileInspector>,
    pub concatenate: ExternalTool,
    pub average: ExternalTool,
    pub resolver: CoverageResolver,
}

impl Services {
    pub fn from_scope(scope: &ConfigScope) -> Result<Self> {
        let inspector = NcksInspector::new(scope.get_or("execution", "ncksCommand", "ncks")?);

        Ok(Self {
            index: InputFileIndex::from_scope(scope)?,
            inspector: Arc::new(inspector),
            concatenate: ExternalTool::from_scope(
                scope,
                "concatenate",
                ToolCommand::concatenate,
                "ncrcat",
            )?,
            average: ExternalTool::from_scope(scope, "average", ToolCommand::average, "ncra")?,
            resolver: CoverageResolver::default(),
        })
    }
}

/// `output.<key>` joined onto `output.baseDirectory` unless it is absolute.
pub(crate) fn output_directory(scope: &ConfigScope, key: &str, create: bool) -> Result<PathBuf> {
    let subdirectory = PathBuf::from(scope.get("output", key)?);
    let directory = if subdirectory.is_absolute() {
        subdirectory
    } else {
        Path::new(&scope.get("output", "baseDirectory")?).join(subdirectory)
    };

    if create {
        make_directories(&directory)
    } else {
        Ok(directory)
    }
}

/// Deletes whatever is left of a product that is about to be rebuilt.
pub(crate) fn discard_stale(
    ctx: &TaskContext,
    existing: Option<&OutputProduct>,
    reason: &RebuildReason,
) -> Result<()> {
    let Some(product) = existing else {
        return Ok(());
    };

    match reason {
        RebuildReason::MissingVariables(missing) => ctx.sink().warn(
            &Error::StaleProductVariableMismatch {
                path: product.path.clone(),
                missing: missing.clone(),
            }
            .to_string(),
        ),
        other => ctx.sink().warn(&format!(
            "{} will be rebuilt: {}",
            product.path.display(),
            other
        )),
    }

    if !ctx.is_dry_run() {
        remove_product(&product.path)?;
    }
    Ok(())
}

/// Runs `tool`, or only reports the command line on a dry run.
pub(crate) async fn run_tool(
    ctx: &TaskContext,
    tool: &ExternalTool,
    variables: &[String],
    files: &InputFileSet,
    output: &Path,
) -> Result<()> {
    let inputs = files.paths();
    if ctx.is_dry_run() {
        ctx.sink().info(&format!(
            "would run: {}",
            tool.command().summary(variables, &inputs, output)
        ));
        return Ok(());
    }

    tool.invoke(variables, &inputs, output, ctx.sink()).await
}

/// `mpas` + `timeSeries` + `ocean` -> `mpasTimeSeriesOcean`
pub(crate) fn default_task_name(prefix: &str, section: &str, component: &str) -> String {
    format!("{}{}{}", prefix, capitalize(section), capitalize(component))
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
