use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque},
    fmt,
    sync::Arc,
};

use tracing::{debug, warn};

use super::{AnalysisTask, TaskInfo};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(usize);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Node {
    task: Arc<dyn AnalysisTask>,
    parent: Option<TaskId>,
    children: Vec<TaskId>,
    run_after: Vec<TaskId>,
}

/// Tasks and their run-after edges. A subtask always runs after its parent.
#[derive(Default)]
pub struct TaskGraph {
    nodes: Vec<Node>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, task: Arc<dyn AnalysisTask>) -> TaskId {
        self.push(task, None)
    }

    pub fn add_subtask(&mut self, parent: TaskId, task: Arc<dyn AnalysisTask>) -> TaskId {
        let id = self.push(task, Some(parent));
        if let Some(node) = self.nodes.get_mut(parent.0) {
            node.children.push(id);
        }
        id
    }

    /// `task` will not start until `prerequisite` is done.
    pub fn run_after(&mut self, task: TaskId, prerequisite: TaskId) {
        if let Some(node) = self.nodes.get_mut(task.0) {
            if !node.run_after.contains(&prerequisite) {
                node.run_after.push(prerequisite);
            }
        }
    }

    fn push(&mut self, task: Arc<dyn AnalysisTask>, parent: Option<TaskId>) -> TaskId {
        let id = TaskId(self.nodes.len());
        self.nodes.push(Node {
            task,
            parent,
            children: Vec::new(),
            run_after: Vec::new(),
        });
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        (0..self.nodes.len()).map(TaskId)
    }

    pub fn task(&self, id: TaskId) -> Option<&Arc<dyn AnalysisTask>> {
        self.nodes.get(id.0).map(|node| &node.task)
    }

    pub fn info(&self, id: TaskId) -> Option<&TaskInfo> {
        self.task(id).map(|task| task.info())
    }

    pub fn full_name(&self, id: TaskId) -> String {
        self.info(id)
            .map(TaskInfo::full_name)
            .unwrap_or_else(|| id.to_string())
    }

    pub fn parent(&self, id: TaskId) -> Option<TaskId> {
        self.nodes.get(id.0).and_then(|node| node.parent)
    }

    pub fn children(&self, id: TaskId) -> &[TaskId] {
        self.nodes
            .get(id.0)
            .map(|node| node.children.as_slice())
            .unwrap_or_default()
    }

    /// Tasks that must be done before `id` may start.
    pub fn predecessors(&self, id: TaskId) -> Vec<TaskId> {
        let Some(node) = self.nodes.get(id.0) else {
            return Vec::new();
        };

        let mut predecessors: Vec<TaskId> = node.parent.into_iter().collect();
        for prerequisite in &node.run_after {
            if !predecessors.contains(prerequisite) {
                predecessors.push(*prerequisite);
            }
        }
        predecessors
    }

    /// Rejects self edges, edges to unknown tasks, duplicate names and cycles.
    pub fn validate(&self) -> Result<()> {
        let mut names: HashMap<String, TaskId> = HashMap::new();

        for id in self.ids() {
            let name = self.full_name(id);

            if let Some(existing) = names.insert(name.clone(), id) {
                return Err(Error::Dependency(format!(
                    "Task '{}' is defined twice ({} and {})",
                    name, existing, id
                )));
            }

            for predecessor in self.predecessors(id) {
                if predecessor == id {
                    return Err(Error::Dependency(format!(
                        "Task '{}' runs after itself",
                        name
                    )));
                }
                if predecessor.0 >= self.nodes.len() {
                    return Err(Error::Dependency(format!(
                        "Task '{}' runs after {} which doesn't exist",
                        name, predecessor
                    )));
                }
            }
        }

        self.detect_cycles()
    }

    fn detect_cycles(&self) -> Result<()> {
        let mut visited = HashSet::new();

        for id in self.ids() {
            let mut path = Vec::new();

            if self.has_cycle(id, &mut visited, &mut path) {
                let names: Vec<String> = path.iter().map(|id| self.full_name(*id)).collect();
                return Err(Error::Dependency(format!(
                    "Circular dependency: {}",
                    names.join(" -> ")
                )));
            }
        }

        Ok(())
    }

    fn has_cycle(
        &self,
        id: TaskId,
        visited: &mut HashSet<TaskId>,
        path: &mut Vec<TaskId>,
    ) -> bool {
        if path.contains(&id) {
            path.push(id);
            return true;
        }

        if visited.contains(&id) {
            return false;
        }

        visited.insert(id);
        path.push(id);

        for predecessor in self.predecessors(id) {
            if self.has_cycle(predecessor, visited, path) {
                return true;
            }
        }

        path.pop();

        false
    }

    /// Orders `ids` so every task follows its predecessors. Ties keep
    /// insertion order. Predecessors outside `ids` are ignored.
    pub fn sort_topologically(&self, ids: &[TaskId]) -> Vec<TaskId> {
        let members: BTreeSet<TaskId> = ids.iter().copied().collect();
        let mut in_degrees: BTreeMap<TaskId, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<TaskId, Vec<TaskId>> = BTreeMap::new();

        for &id in &members {
            let predecessors: Vec<TaskId> = self
                .predecessors(id)
                .into_iter()
                .filter(|p| members.contains(p))
                .collect();
            in_degrees.insert(id, predecessors.len());
            for predecessor in predecessors {
                dependents.entry(predecessor).or_default().push(id);
            }
        }

        let mut queue: VecDeque<TaskId> = in_degrees
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut sorted = Vec::with_capacity(members.len());

        while let Some(id) = queue.pop_front() {
            sorted.push(id);

            for dependent in dependents.get(&id).into_iter().flatten() {
                if let Some(degree) = in_degrees.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*dependent);
                    }
                }
            }
        }

        sorted
    }

    /// `targets`, their subtasks, and everything they transitively run
    /// after, in topological order.
    pub fn required_for(&self, targets: &[TaskId]) -> Vec<TaskId> {
        let mut needed = HashSet::new();
        let mut queue: VecDeque<TaskId> = VecDeque::new();

        for &target in targets {
            self.push_with_descendants(target, &mut queue);
        }

        while let Some(id) = queue.pop_front() {
            if id.0 >= self.nodes.len() || !needed.insert(id) {
                continue;
            }

            for predecessor in self.predecessors(id) {
                if !needed.contains(&predecessor) {
                    queue.push_back(predecessor);
                }
            }
        }

        let needed: Vec<TaskId> = self.ids().filter(|id| needed.contains(id)).collect();
        self.sort_topologically(&needed)
    }

    fn push_with_descendants(&self, id: TaskId, queue: &mut VecDeque<TaskId>) {
        queue.push_back(id);
        for &child in self.children(id) {
            self.push_with_descendants(child, queue);
        }
    }

    /// Applies `generate` selectors in order and returns the selected
    /// top-level tasks together with everything they require.
    ///
    /// - `all` selects every task
    /// - `all_<tag>` selects tasks carrying the tag
    /// - `no_<x>` deselects tasks named `x` or tagged `x`
    /// - `<x>` selects tasks named `x` or tagged `x`
    pub fn select(&self, selectors: &[String]) -> Result<Vec<TaskId>> {
        let top_level: Vec<TaskId> = self.ids().filter(|id| self.parent(*id).is_none()).collect();
        let mut selected: BTreeSet<TaskId> = BTreeSet::new();

        let matches = |id: &TaskId, key: &str| {
            self.info(*id)
                .is_some_and(|info| info.name == key || info.has_tag(key))
        };

        for selector in selectors {
            let selector = selector.trim();
            let before = selected.clone();

            if selector == "all" {
                selected.extend(top_level.iter().copied());
            } else if let Some(tag) = selector.strip_prefix("all_") {
                selected.extend(
                    top_level
                        .iter()
                        .filter(|id| self.info(**id).is_some_and(|info| info.has_tag(tag)))
                        .copied(),
                );
            } else if let Some(key) = selector.strip_prefix("no_") {
                selected.retain(|id| !matches(id, key));
            } else {
                selected.extend(top_level.iter().filter(|id| matches(*id, selector)).copied());
            }

            if selected == before {
                warn!(selector, "generate selector did not change the task selection");
            }
        }

        if selected.is_empty() {
            return Err(Error::Config(format!(
                "No tasks selected by generate = [{}]",
                selectors.join(", ")
            )));
        }

        let targets: Vec<TaskId> = selected.into_iter().collect();
        let required = self.required_for(&targets);
        debug!(
            selected = targets.len(),
            required = required.len(),
            "resolved task selection"
        );
        Ok(required)
    }

    /// One line per edge, for verbose runs.
    pub fn describe_relationships(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for id in self.ids() {
            let name = self.full_name(id);
            if let Some(parent) = self.parent(id) {
                lines.push(format!("'{}' is a subtask of '{}'", name, self.full_name(parent)));
            }
            if let Some(node) = self.nodes.get(id.0) {
                for prerequisite in &node.run_after {
                    lines.push(format!(
                        "'{}' runs after '{}'",
                        name,
                        self.full_name(*prerequisite)
                    ));
                }
            }
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskContext;
    use async_trait::async_trait;

    struct Noop(TaskInfo);

    #[async_trait]
    impl AnalysisTask for Noop {
        fn info(&self) -> &TaskInfo {
            &self.0
        }

        async fn prepare(&self, _ctx: &TaskContext) -> Result<()> {
            Ok(())
        }

        async fn execute(&self, _ctx: &TaskContext) -> Result<()> {
            Ok(())
        }
    }

    fn task(name: &str, tags: &[&str]) -> Arc<dyn AnalysisTask> {
        Arc::new(Noop(TaskInfo::new(name, "ocean").with_tags(tags.iter().copied())))
    }

    fn subtask(name: &str, subtask: &str) -> Arc<dyn AnalysisTask> {
        Arc::new(Noop(TaskInfo::new(name, "ocean").with_subtask(subtask)))
    }

    fn names(graph: &TaskGraph, ids: &[TaskId]) -> Vec<String> {
        ids.iter().map(|id| graph.full_name(*id)).collect()
    }

    #[test]
    fn test_sort_respects_run_after_and_parents() {
        let mut graph = TaskGraph::new();
        let plot = graph.add(task("plot", &[]));
        let series = graph.add(task("series", &[]));
        let anomaly = graph.add_subtask(plot, subtask("plot", "anomaly"));
        graph.run_after(plot, series);

        let order = graph.sort_topologically(&[plot, series, anomaly]);
        assert_eq!(names(&graph, &order), vec!["series", "plot", "plot: anomaly"]);
    }

    #[test]
    fn test_validate_rejects_cycles() {
        let mut graph = TaskGraph::new();
        let a = graph.add(task("a", &[]));
        let b = graph.add(task("b", &[]));
        let c = graph.add(task("c", &[]));
        graph.run_after(a, b);
        graph.run_after(b, c);
        graph.run_after(c, a);

        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("Circular dependency"));
    }

    #[test]
    fn test_validate_rejects_self_edges_and_unknown_ids() {
        let mut graph = TaskGraph::new();
        let a = graph.add(task("a", &[]));
        graph.run_after(a, a);
        assert!(graph.validate().unwrap_err().to_string().contains("itself"));

        let mut graph = TaskGraph::new();
        let a = graph.add(task("a", &[]));
        graph.run_after(a, TaskId(7));
        assert!(graph.validate().unwrap_err().to_string().contains("doesn't exist"));

        let mut graph = TaskGraph::new();
        graph.add(task("a", &[]));
        graph.add(task("a", &[]));
        assert!(graph.validate().unwrap_err().to_string().contains("twice"));
    }

    #[test]
    fn test_required_for_pulls_prerequisites_and_children() {
        let mut graph = TaskGraph::new();
        let series = graph.add(task("series", &[]));
        let unrelated = graph.add(task("unrelated", &[]));
        let consumer = graph.add(task("consumer", &[]));
        let child = graph.add_subtask(consumer, subtask("consumer", "series"));
        graph.run_after(child, series);

        let required = graph.required_for(&[consumer]);
        assert_eq!(
            names(&graph, &required),
            vec!["series", "consumer", "consumer: series"]
        );
        assert!(!required.contains(&unrelated));
    }

    #[test]
    fn test_select_applies_selectors_in_order() {
        let mut graph = TaskGraph::new();
        graph.add(task("mpasTimeSeriesOcean", &["timeSeries"]));
        graph.add(task("mpasClimatologyOcean", &["climatology"]));
        graph.add(task("sstTrend", &["timeSeries", "sst"]));

        let selectors = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        let picked = graph.select(&selectors(&["all_timeSeries", "no_sst"])).unwrap();
        assert_eq!(names(&graph, &picked), vec!["mpasTimeSeriesOcean"]);

        let picked = graph.select(&selectors(&["all", "no_climatology"])).unwrap();
        assert_eq!(
            names(&graph, &picked),
            vec!["mpasTimeSeriesOcean", "sstTrend"]
        );

        let picked = graph.select(&selectors(&["mpasClimatologyOcean"])).unwrap();
        assert_eq!(names(&graph, &picked), vec!["mpasClimatologyOcean"]);

        let nothing = selectors(&["all", "no_timeSeries", "no_climatology"]);
        assert!(graph.select(&nothing).is_err());
    }
}
