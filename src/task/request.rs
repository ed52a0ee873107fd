use std::{collections::BTreeSet, sync::Arc};

use async_trait::async_trait;

use super::{AnalysisTask, TaskContext, TaskInfo};
use crate::error::{Error, Result};

/// A task that computes a product for variables registered by consumers.
#[async_trait]
pub trait VariableProducer: Send + Sync {
    /// Only valid once the producer has been prepared, since that is when it
    /// learns which variables its source stream offers.
    async fn add_variables(&self, variables: &[String]) -> Result<()>;
}

/// Variables a producer offers and the ones consumers asked for.
#[derive(Debug, Clone, Default)]
pub(crate) struct VariableSet {
    available: Option<BTreeSet<String>>,
    requested: BTreeSet<String>,
}

impl VariableSet {
    pub(crate) fn set_available(&mut self, available: BTreeSet<String>) {
        self.available = Some(available);
    }

    pub(crate) fn add(&mut self, task: &str, stream: &str, variables: &[String]) -> Result<()> {
        let available = self.available.as_ref().ok_or_else(|| {
            Error::NotPrepared(format!(
                "Variables can only be added to '{}' after it has been prepared; \
                 the consumer presumably does not run after it",
                task
            ))
        })?;

        for variable in variables {
            if !available.contains(variable) {
                return Err(Error::VariableUnavailable {
                    variable: variable.clone(),
                    stream: stream.to_string(),
                    available: available.iter().cloned().collect(),
                });
            }
        }

        self.requested.extend(variables.iter().cloned());
        Ok(())
    }

    pub(crate) fn requested(&self) -> &BTreeSet<String> {
        &self.requested
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.requested.is_empty()
    }
}

/// A consumer that registers its variables with a producer while preparing.
///
/// A request without a producer only groups its subtasks.
pub struct VariableRequest {
    info: TaskInfo,
    producer: Option<Arc<dyn VariableProducer>>,
    variables: Vec<String>,
}

impl VariableRequest {
    pub fn new(
        info: TaskInfo,
        producer: Arc<dyn VariableProducer>,
        variables: Vec<String>,
    ) -> Self {
        Self {
            info,
            producer: Some(producer),
            variables,
        }
    }

    pub fn group(info: TaskInfo) -> Self {
        Self {
            info,
            producer: None,
            variables: Vec::new(),
        }
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }
}

#[async_trait]
impl AnalysisTask for VariableRequest {
    fn info(&self) -> &TaskInfo {
        &self.info
    }

    async fn prepare(&self, ctx: &TaskContext) -> Result<()> {
        if let Some(producer) = &self.producer {
            producer.add_variables(&self.variables).await?;
            ctx.sink()
                .info(&format!("requested {}", self.variables.join(", ")));
        }
        Ok(())
    }

    async fn has_work(&self) -> bool {
        false
    }

    async fn execute(&self, _ctx: &TaskContext) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::MemorySink;
    use tokio::sync::Mutex;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_variable_set_requires_availability() {
        let mut set = VariableSet::default();
        let err = set.add("series", "tssm", &names(&["ssh"])).unwrap_err();
        assert!(matches!(err, Error::NotPrepared(_)));

        set.set_available(names(&["ssh", "sst"]).into_iter().collect());
        set.add("series", "tssm", &names(&["ssh"])).unwrap();
        set.add("series", "tssm", &names(&["ssh", "sst"])).unwrap();
        assert_eq!(set.requested().len(), 2);

        let err = set.add("series", "tssm", &names(&["X"])).unwrap_err();
        match err {
            Error::VariableUnavailable { available, .. } => {
                assert_eq!(available, names(&["ssh", "sst"]))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl VariableProducer for Recorder {
        async fn add_variables(&self, variables: &[String]) -> Result<()> {
            self.0.lock().await.extend(variables.iter().cloned());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_request_registers_during_prepare() {
        let producer = Arc::new(Recorder::default());
        let request = VariableRequest::new(
            TaskInfo::new("sshAnomaly", "ocean"),
            producer.clone(),
            names(&["ssh"]),
        );
        let ctx = TaskContext::new(Arc::new(MemorySink::new()));

        request.prepare(&ctx).await.unwrap();
        assert_eq!(*producer.0.lock().await, names(&["ssh"]));
        assert!(!request.has_work().await);
    }
}
