use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    thread,
};

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::{
    error::Error,
    task::{TaskContext, TaskGraph, TaskId, TaskState},
    tool::{DiagnosticSink, TracingSink},
};

pub fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug)]
pub struct ExecutionLevel {
    pub level: usize,
    pub task_ids: Vec<TaskId>,
}

/// Groups `ids` so that every task sits one level above its deepest
/// predecessor. Predecessors outside `ids` do not count.
pub fn calculate_dependency_levels(graph: &TaskGraph, ids: &[TaskId]) -> Vec<ExecutionLevel> {
    let mut levels: HashMap<TaskId, usize> = HashMap::new();

    for &id in ids {
        calculate_task_level(graph, id, ids, &mut levels);
    }

    let mut level_groups: BTreeMap<usize, Vec<TaskId>> = BTreeMap::new();
    for &id in ids {
        if let Some(&level) = levels.get(&id) {
            level_groups.entry(level).or_default().push(id);
        }
    }

    level_groups
        .into_iter()
        .map(|(level, task_ids)| ExecutionLevel { level, task_ids })
        .collect()
}

fn calculate_task_level(
    graph: &TaskGraph,
    id: TaskId,
    members: &[TaskId],
    levels: &mut HashMap<TaskId, usize>,
) -> usize {
    if let Some(&level) = levels.get(&id) {
        return level;
    }

    let level = graph
        .predecessors(id)
        .into_iter()
        .filter(|predecessor| members.contains(predecessor))
        .map(|predecessor| calculate_task_level(graph, predecessor, members, levels) + 1)
        .max()
        .unwrap_or(0);

    levels.insert(id, level);
    level
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub workers: usize,
    pub fail_fast: bool,
    pub dry_run: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            fail_fast: false,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    /// Why a skipped task did not run.
    pub reason: Option<String>,
}

/// Terminal state of every task in a run and the fatal errors behind them.
#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: Vec<TaskOutcome>,
    pub errors: Vec<Error>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
            && self
                .outcomes
                .iter()
                .all(|outcome| outcome.state == TaskState::Done)
    }

    pub fn state_of(&self, name: &str) -> Option<TaskState> {
        self.outcomes
            .iter()
            .find(|outcome| outcome.name == name)
            .map(|outcome| outcome.state)
    }

    pub fn count(&self, state: TaskState) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.state == state)
            .count()
    }
}

/// Prepares every selected task in dependency order, then executes them
/// level by level on a bounded worker pool.
pub struct TaskRunner<'a> {
    graph: &'a TaskGraph,
    options: RunOptions,
    sink: Option<Arc<dyn DiagnosticSink>>,
}

struct Progress {
    states: BTreeMap<TaskId, TaskState>,
    reasons: HashMap<TaskId, String>,
    errors: Vec<Error>,
}

impl Progress {
    fn state(&self, id: TaskId) -> Option<TaskState> {
        self.states.get(&id).copied()
    }

    fn set(&mut self, id: TaskId, state: TaskState) {
        self.states.insert(id, state);
    }

    fn skip(&mut self, id: TaskId, reason: String) {
        self.states.insert(id, TaskState::Skipped);
        self.reasons.insert(id, reason);
    }
}

impl<'a> TaskRunner<'a> {
    pub fn new(graph: &'a TaskGraph, options: RunOptions) -> Self {
        Self {
            graph,
            options,
            sink: None,
        }
    }

    /// Sends every task's diagnostics to `sink` instead of `tracing`.
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn context(&self, id: TaskId) -> TaskContext {
        let sink = self
            .sink
            .clone()
            .unwrap_or_else(|| Arc::new(TracingSink::new(self.graph.full_name(id))));
        TaskContext::new(sink).with_dry_run(self.options.dry_run)
    }

    /// Runs `targets` and everything they require.
    pub async fn run(&self, targets: &[TaskId]) -> RunReport {
        let order = self.graph.required_for(targets);

        let mut progress = Progress {
            states: order.iter().map(|id| (*id, TaskState::Unprepared)).collect(),
            reasons: HashMap::new(),
            errors: Vec::new(),
        };

        self.prepare_all(&order, &mut progress).await;

        let execution_levels = calculate_dependency_levels(self.graph, &order);
        info!(
            tasks = order.len(),
            levels = execution_levels.len(),
            workers = self.options.workers,
            dry_run = self.options.dry_run,
            "executing task graph"
        );

        for level in &execution_levels {
            let names: Vec<String> = level
                .task_ids
                .iter()
                .map(|id| self.graph.full_name(*id))
                .collect();
            if self.options.dry_run {
                info!(level = level.level, tasks = %names.join(", "), "would start level");
            } else {
                debug!(level = level.level, tasks = %names.join(", "), "starting level");
            }

            self.execute_level_parallel(&level.task_ids, &mut progress)
                .await;
        }

        let outcomes = order
            .iter()
            .map(|&id| TaskOutcome {
                id,
                name: self.graph.full_name(id),
                state: progress.state(id).unwrap_or(TaskState::Unprepared),
                reason: progress.reasons.get(&id).cloned(),
            })
            .collect();

        RunReport {
            outcomes,
            errors: progress.errors,
        }
    }

    async fn prepare_all(&self, order: &[TaskId], progress: &mut Progress) {
        for &id in order {
            if let Some(reason) = self.blocker(id, progress, TaskState::Ready) {
                self.skip(id, reason, progress);
                continue;
            }

            let Some(task) = self.graph.task(id) else {
                continue;
            };

            let ctx = self.context(id);
            match task.prepare(&ctx).await {
                Ok(()) => {
                    debug!(task = %self.graph.full_name(id), "prepared");
                    progress.set(id, TaskState::Ready);
                }
                Err(err) => self.fail(id, err, progress),
            }
        }
    }

    async fn execute_level_parallel(&self, task_ids: &[TaskId], progress: &mut Progress) {
        let semaphore = Arc::new(Semaphore::new(self.options.workers.max(1)));
        let mut handles = Vec::new();

        for &id in task_ids {
            if progress.state(id) != Some(TaskState::Ready) {
                continue;
            }

            if let Some(reason) = self.blocker(id, progress, TaskState::Done) {
                self.skip(id, reason, progress);
                continue;
            }

            let Some(task) = self.graph.task(id) else {
                continue;
            };
            let name = self.graph.full_name(id);

            if !task.has_work().await {
                debug!(task = %name, "nothing to compute");
                progress.set(id, TaskState::Done);
                continue;
            }

            progress.set(id, TaskState::Running);

            let task = Arc::clone(task);
            let semaphore = Arc::clone(&semaphore);
            let ctx = self.context(id);

            let handle = tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::Panicked(e.to_string()))?;

                info!(task = %task.info().full_name(), "running");
                task.execute(&ctx).await
            });

            handles.push((id, handle));
        }

        for (id, handle) in handles {
            match handle.await {
                Ok(Ok(())) => {
                    info!(task = %self.graph.full_name(id), "done");
                    progress.set(id, TaskState::Done);
                }
                Ok(Err(err)) => self.fail(id, err, progress),
                Err(join_error) => {
                    self.fail(id, Error::Panicked(join_error.to_string()), progress)
                }
            }
        }
    }

    /// Why `id` may not proceed: a predecessor short of `required`, or an
    /// earlier failure under fail-fast.
    fn blocker(&self, id: TaskId, progress: &Progress, required: TaskState) -> Option<String> {
        for predecessor in self.graph.predecessors(id) {
            match progress.state(predecessor) {
                Some(state) if state == required || state == TaskState::Done => {}
                None => {}
                Some(_) => {
                    return Some(
                        Error::DependencyFailed {
                            dependency: self.graph.full_name(predecessor),
                        }
                        .to_string(),
                    );
                }
            }
        }

        if self.options.fail_fast && !progress.errors.is_empty() {
            return Some("Skipped because an earlier task failed (--fail-fast)".to_string());
        }

        None
    }

    fn skip(&self, id: TaskId, reason: String, progress: &mut Progress) {
        warn!(task = %self.graph.full_name(id), "{}", reason);
        progress.skip(id, reason);
    }

    fn fail(&self, id: TaskId, err: Error, progress: &mut Progress) {
        let name = self.graph.full_name(id);
        error!(task = %name, "{}", err);
        progress.set(id, TaskState::Failed);
        progress.errors.push(err.in_task(&name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::Result,
        task::{AnalysisTask, TaskInfo},
        tool::MemorySink,
    };
    use async_trait::async_trait;
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    #[derive(Clone, Copy, PartialEq)]
    enum Behaviour {
        Succeed,
        FailPrepare,
        FailExecute,
        Idle,
    }

    struct Probe {
        info: TaskInfo,
        behaviour: Behaviour,
        log: Arc<Mutex<Vec<String>>>,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AnalysisTask for Probe {
        fn info(&self) -> &TaskInfo {
            &self.info
        }

        async fn prepare(&self, _ctx: &TaskContext) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("prepare {}", self.info.full_name()));
            if self.behaviour == Behaviour::FailPrepare {
                return Err(Error::InsufficientCoverage {
                    section: "timeSeries".to_string(),
                    reason: "no complete year".to_string(),
                });
            }
            Ok(())
        }

        async fn has_work(&self) -> bool {
            self.behaviour != Behaviour::Idle
        }

        async fn execute(&self, _ctx: &TaskContext) -> Result<()> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            self.log
                .lock()
                .unwrap()
                .push(format!("execute {}", self.info.full_name()));
            if self.behaviour == Behaviour::FailExecute {
                return Err(Error::ToolExecutionFailed {
                    command: "ncrcat".to_string(),
                    exit_code: Some(1),
                    stderr: "boom".to_string(),
                });
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct Harness {
        graph: TaskGraph,
        log: Arc<Mutex<Vec<String>>>,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Harness {
        fn add(&mut self, name: &str, behaviour: Behaviour) -> TaskId {
            let probe = self.probe(TaskInfo::new(name, "ocean"), behaviour);
            self.graph.add(probe)
        }

        fn probe(&self, info: TaskInfo, behaviour: Behaviour) -> Arc<Probe> {
            Arc::new(Probe {
                info,
                behaviour,
                log: Arc::clone(&self.log),
                running: Arc::clone(&self.running),
                peak: Arc::clone(&self.peak),
            })
        }

        async fn run(&self, options: RunOptions) -> RunReport {
            let all: Vec<TaskId> = self.graph.ids().collect();
            TaskRunner::new(&self.graph, options)
                .with_sink(Arc::new(MemorySink::new()))
                .run(&all)
                .await
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    fn options(workers: usize) -> RunOptions {
        RunOptions {
            workers,
            ..RunOptions::default()
        }
    }

    #[test]
    fn test_dependency_levels() {
        let mut h = Harness::default();
        let a = h.add("a", Behaviour::Succeed);
        let b = h.add("b", Behaviour::Succeed);
        let c = h.add("c", Behaviour::Succeed);
        let d = h.add("d", Behaviour::Succeed);
        h.graph.run_after(b, a);
        h.graph.run_after(c, a);
        h.graph.run_after(d, b);
        h.graph.run_after(d, c);

        let levels = calculate_dependency_levels(&h.graph, &[a, b, c, d]);
        let shape: Vec<Vec<TaskId>> = levels.into_iter().map(|l| l.task_ids).collect();
        assert_eq!(shape, vec![vec![a], vec![b, c], vec![d]]);
    }

    #[tokio::test]
    async fn test_failure_skips_transitive_dependents_only() {
        let mut h = Harness::default();
        let series = h.add("series", Behaviour::FailExecute);
        let anomaly = h.add("anomaly", Behaviour::Succeed);
        let plot = h.add("plot", Behaviour::Succeed);
        h.add("climatology", Behaviour::Succeed);
        h.graph.run_after(anomaly, series);
        h.graph.run_after(plot, anomaly);

        let report = h.run(options(4)).await;

        assert_eq!(report.state_of("series"), Some(TaskState::Failed));
        assert_eq!(report.state_of("anomaly"), Some(TaskState::Skipped));
        assert_eq!(report.state_of("plot"), Some(TaskState::Skipped));
        assert_eq!(report.state_of("climatology"), Some(TaskState::Done));

        assert!(!h.log().contains(&"execute anomaly".to_string()));
        assert!(!h.log().contains(&"execute plot".to_string()));

        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].to_string().starts_with("Task 'series' failed"));
        assert!(!report.succeeded());
    }

    #[tokio::test]
    async fn test_prepare_failure_blocks_chain() {
        let mut h = Harness::default();
        let series = h.add("series", Behaviour::FailPrepare);
        let consumer = h.add("consumer", Behaviour::Succeed);
        h.graph.run_after(consumer, series);

        let report = h.run(options(2)).await;

        assert_eq!(report.state_of("series"), Some(TaskState::Failed));
        assert_eq!(report.state_of("consumer"), Some(TaskState::Skipped));
        assert_eq!(h.log(), vec!["prepare series".to_string()]);

        let skipped = report
            .outcomes
            .iter()
            .find(|outcome| outcome.name == "consumer")
            .unwrap();
        assert!(skipped.reason.as_deref().unwrap().contains("'series'"));
    }

    #[tokio::test]
    async fn test_idle_tasks_finish_without_executing() {
        let mut h = Harness::default();
        h.add("idle", Behaviour::Idle);

        let report = h.run(options(1)).await;

        assert_eq!(report.state_of("idle"), Some(TaskState::Done));
        assert_eq!(h.log(), vec!["prepare idle".to_string()]);
        assert!(report.succeeded());
    }

    #[tokio::test]
    async fn test_children_follow_parent() {
        let mut h = Harness::default();
        let parent = h.add("parent", Behaviour::Succeed);
        let child = h.probe(
            TaskInfo::new("parent", "ocean").with_subtask("child"),
            Behaviour::Succeed,
        );
        h.graph.add_subtask(parent, child);

        let report = h.run(options(4)).await;

        assert!(report.succeeded());
        assert_eq!(
            h.log(),
            vec![
                "prepare parent",
                "prepare parent: child",
                "execute parent",
                "execute parent: child"
            ]
        );
    }

    #[tokio::test]
    async fn test_workers_bound_concurrency() {
        let mut h = Harness::default();
        for name in ["a", "b", "c", "d", "e"] {
            h.add(name, Behaviour::Succeed);
        }

        let report = h.run(options(2)).await;

        assert_eq!(report.count(TaskState::Done), 5);
        assert!(h.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_fail_fast_skips_remaining_levels() {
        let mut h = Harness::default();
        h.add("broken", Behaviour::FailExecute);
        let other = h.add("other", Behaviour::Succeed);
        let later = h.add("later", Behaviour::Succeed);
        h.graph.run_after(later, other);

        let report = h
            .run(RunOptions {
                workers: 4,
                fail_fast: true,
                dry_run: false,
            })
            .await;

        assert_eq!(report.state_of("broken"), Some(TaskState::Failed));
        assert_eq!(report.state_of("other"), Some(TaskState::Done));
        assert_eq!(report.state_of("later"), Some(TaskState::Skipped));
    }
}
