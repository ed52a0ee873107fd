//! Builds the task graph described by a configuration scope.
//!
//! ```toml
//! [timeSeries]
//! startYear = 1
//! endYear = 5
//!
//! [climatology]
//! startYear = 3
//! endYear = 5
//!
//! [requests]
//! sshAnomaly = ["timeSeries:timeMonthly_avg_ssh", "refYearClimatology:timeMonthly_avg_ssh"]
//! ```
//!
//! Each `[requests]` entry becomes a task with one subtask per producer it
//! draws from; each subtask runs after its producer. The reference-year
//! climatology only exists when some request draws from it.

use std::{collections::BTreeMap, sync::Arc};

use tracing::debug;

use crate::{
    config::ConfigScope,
    error::{Error, Result},
    task::{
        ClimatologyTask, ConfiguredWindow, Services, TaskGraph, TaskId, TaskInfo,
        TimeSeriesTask, VariableProducer, VariableRequest,
    },
};

pub const TIME_SERIES: &str = "timeSeries";
pub const CLIMATOLOGY: &str = "climatology";
pub const REF_YEAR_CLIMATOLOGY: &str = "refYearClimatology";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    pub generate: Vec<String>,
    pub workers: Option<usize>,
}

impl RunSettings {
    /// `[output] generate` (default `["all"]`) and `[execution] parallelTaskCount`.
    pub fn from_scope(scope: &ConfigScope) -> Result<Self> {
        let generate = if scope.has_option("output", "generate") {
            scope.get_list("output", "generate")?
        } else {
            vec!["all".to_string()]
        };

        let workers = match scope.get_int_opt("execution", "parallelTaskCount")? {
            Some(count) if count < 1 => {
                return Err(Error::Config(format!(
                    "parallelTaskCount must be at least 1, got {}",
                    count
                )));
            }
            Some(count) => Some(count as usize),
            None => None,
        };

        Ok(Self { generate, workers })
    }
}

struct Producer {
    id: TaskId,
    task: Arc<dyn VariableProducer>,
}

pub fn build_graph(scope: Arc<ConfigScope>, services: Arc<Services>) -> Result<TaskGraph> {
    let mut graph = TaskGraph::new();
    let component = scope.get_or("input", "component", "ocean")?;
    let mut producers: BTreeMap<&str, Producer> = BTreeMap::new();

    let mut requests = Vec::new();
    for name in scope.keys("requests") {
        let wanted = parse_request(&name, &scope.get_list("requests", &name)?)?;
        requests.push((name, wanted));
    }

    if scope.has_section(TIME_SERIES) {
        let task = Arc::new(TimeSeriesTask::new(
            Arc::clone(&scope),
            Arc::clone(&services),
            TIME_SERIES,
            &component,
        )?);
        let id = graph.add(task.clone());
        producers.insert(TIME_SERIES, Producer { id, task });
    }

    if scope.has_section(CLIMATOLOGY) {
        let task = Arc::new(ClimatologyTask::new(
            Arc::clone(&scope),
            Arc::clone(&services),
            CLIMATOLOGY,
            &component,
            Box::new(ConfiguredWindow),
        )?);
        let id = graph.add(task.clone());
        producers.insert(CLIMATOLOGY, Producer { id, task });
    }

    let wants_ref_year = requests
        .iter()
        .any(|(_, wanted)| wanted.contains_key(REF_YEAR_CLIMATOLOGY));
    if scope.has_section(CLIMATOLOGY) && wants_ref_year {
        let task = Arc::new(ClimatologyTask::reference_year(
            Arc::clone(&scope),
            Arc::clone(&services),
            CLIMATOLOGY,
            &component,
        )?);
        let id = graph.add(task.clone());
        producers.insert(REF_YEAR_CLIMATOLOGY, Producer { id, task });
    }

    for (name, wanted) in requests {
        let tags: Vec<&str> = wanted.keys().map(|producer| tag_for(producer)).collect();
        let info = TaskInfo::new(name.as_str(), component.as_str()).with_tags(tags);
        let parent = graph.add(Arc::new(VariableRequest::group(info.clone())));

        for (producer_key, variables) in wanted {
            let producer = producers.get(producer_key.as_str()).ok_or_else(|| {
                Error::Config(format!(
                    "Request '{}' draws from '{}', which is not configured (known: {})",
                    name,
                    producer_key,
                    producers.keys().copied().collect::<Vec<_>>().join(", ")
                ))
            })?;

            let child = graph.add_subtask(
                parent,
                Arc::new(VariableRequest::new(
                    info.clone().with_subtask(producer_key.as_str()),
                    Arc::clone(&producer.task),
                    variables,
                )),
            );
            graph.run_after(child, producer.id);
        }
    }

    graph.validate()?;
    debug!(tasks = graph.len(), "built task graph");
    Ok(graph)
}

fn tag_for(producer: &str) -> &str {
    match producer {
        REF_YEAR_CLIMATOLOGY => CLIMATOLOGY,
        other => other,
    }
}

/// `["timeSeries:ssh", "timeSeries:sst"]` -> `{timeSeries: [ssh, sst]}`
fn parse_request(name: &str, entries: &[String]) -> Result<BTreeMap<String, Vec<String>>> {
    let mut wanted: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for entry in entries {
        let (producer, variable) = entry
            .split_once(':')
            .map(|(p, v)| (p.trim(), v.trim()))
            .filter(|(p, v)| !p.is_empty() && !v.is_empty())
            .ok_or_else(|| {
                Error::Config(format!(
                    "Request '{}' has entry '{}'; expected '<producer>:<variable>'",
                    name, entry
                ))
            })?;

        let variables = wanted.entry(producer.to_string()).or_default();
        if !variables.iter().any(|v| v == variable) {
            variables.push(variable.to_string());
        }
    }

    if wanted.is_empty() {
        return Err(Error::Config(format!("Request '{}' names no variables", name)));
    }

    Ok(wanted)
}
