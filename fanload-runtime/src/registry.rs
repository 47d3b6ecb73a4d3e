use crate::error::RuntimeError;
use fanload::HarnessError;
use fanload_core::RunSummary;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Status of a triggered set of runs, as reported by `GET /runs/{id}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Running {
        subjects: Vec<String>,
    },
    Completed {
        summaries: Vec<RunSummary>,
    },
    /// At least one batch failed. Batches that did complete still report their summary.
    Failed {
        error: String,
        summaries: Vec<RunSummary>,
    },
}

impl RunStatus {
    fn from_results(results: Vec<Result<RunSummary, HarnessError>>) -> Self {
        let mut summaries = vec![];
        let mut errors = vec![];
        for res in results {
            match res {
                Ok(summary) => summaries.push(summary),
                Err(err) => errors.push(err.to_string()),
            }
        }

        if errors.is_empty() {
            RunStatus::Completed { summaries }
        } else {
            RunStatus::Failed {
                error: errors.join("; "),
                summaries,
            }
        }
    }
}

/// Finished runs kept for `GET /runs/{id}`. Older ones are forgotten.
const RETAINED_RUNS: usize = 256;

#[derive(Clone)]
pub(crate) struct RunRegistry {
    runs: Arc<Mutex<Runs>>,
}

struct Runs {
    statuses: HashMap<Uuid, RunStatus>,
    finished: VecDeque<Uuid>,
    retained: usize,
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::with_retained(RETAINED_RUNS)
    }
}

impl RunRegistry {
    pub(crate) fn with_retained(retained: usize) -> Self {
        Self {
            runs: Arc::new(Mutex::new(Runs {
                statuses: HashMap::new(),
                finished: VecDeque::new(),
                retained,
            })),
        }
    }

    pub(crate) fn start(&self, id: Uuid, subjects: Vec<String>) -> Result<(), RuntimeError> {
        self.runs
            .lock()?
            .statuses
            .insert(id, RunStatus::Running { subjects });
        Ok(())
    }

    pub(crate) fn finish(
        &self,
        id: Uuid,
        results: Vec<Result<RunSummary, HarnessError>>,
    ) -> Result<(), RuntimeError> {
        let status = RunStatus::from_results(results);
        match &status {
            RunStatus::Completed { summaries } => {
                for summary in summaries {
                    info!("{summary}");
                }
            }
            RunStatus::Failed { error, .. } => error!("Run {id} failed: {error}"),
            RunStatus::Running { .. } => {}
        }

        let mut runs = self.runs.lock()?;
        runs.statuses.insert(id, status);
        runs.finished.push_back(id);
        while runs.finished.len() > runs.retained {
            if let Some(evicted) = runs.finished.pop_front() {
                runs.statuses.remove(&evicted);
                debug!("Forgot run {evicted}");
            }
        }
        Ok(())
    }

    pub(crate) fn get(&self, id: &Uuid) -> Result<Option<RunStatus>, RuntimeError> {
        Ok(self.runs.lock()?.statuses.get(id).cloned())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> Result<usize, RuntimeError> {
        Ok(self.runs.lock()?.statuses.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn summary(subject: &str) -> RunSummary {
        RunSummary {
            subject: subject.to_string(),
            achieved_rate: 10.,
            max_latency: Duration::from_millis(3),
            total_received: 10,
            total_rejected: 0,
            percentiles: vec![],
            histogram_path: PathBuf::from("/tmp/x"),
        }
    }

    #[test]
    fn tracks_status_transitions() {
        let registry = RunRegistry::default();
        let id = Uuid::new_v4();
        assert_eq!(registry.get(&id).unwrap(), None);

        registry.start(id, vec!["a".to_string()]).unwrap();
        assert!(matches!(
            registry.get(&id).unwrap(),
            Some(RunStatus::Running { .. })
        ));

        registry.finish(id, vec![Ok(summary("a"))]).unwrap();
        assert_eq!(
            registry.get(&id).unwrap(),
            Some(RunStatus::Completed {
                summaries: vec![summary("a")]
            })
        );
    }

    #[test]
    fn only_recent_finished_runs_are_retained() {
        let registry = RunRegistry::with_retained(2);
        let running = Uuid::new_v4();
        registry.start(running, vec!["r".to_string()]).unwrap();

        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            registry.start(*id, vec![]).unwrap();
            registry.finish(*id, vec![Ok(summary("a"))]).unwrap();
        }

        assert_eq!(registry.len().unwrap(), 3);
        for id in &ids[..3] {
            assert_eq!(registry.get(id).unwrap(), None);
        }
        for id in &ids[3..] {
            assert!(matches!(
                registry.get(id).unwrap(),
                Some(RunStatus::Completed { .. })
            ));
        }
        assert!(matches!(
            registry.get(&running).unwrap(),
            Some(RunStatus::Running { .. })
        ));
    }

    #[test]
    fn any_failed_batch_fails_the_run() {
        let status =
            RunStatus::from_results(vec![Ok(summary("a")), Err(HarnessError::NoSamples)]);
        let RunStatus::Failed { error, summaries } = status else {
            panic!("expected a failed status");
        };
        assert!(error.contains("No latency samples"));
        assert_eq!(summaries.len(), 1);
    }

    #[test]
    fn status_is_tagged_json() {
        let status = RunStatus::Running {
            subjects: vec!["loadtest-1".to_string()],
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["subjects"][0], "loadtest-1");
    }
}
