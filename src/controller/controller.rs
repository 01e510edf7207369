//! Rollout scheduling.
//!
//! [`RolloutController`] fans task indices out over a bounded worker pool,
//! runs the configured strategy for each index and optionally saves the
//! resulting experiences. Every index ends up either in the report's
//! experiences or in one of its failure lists.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinError, JoinSet};
use tracing::{debug, info, warn};

use super::task::Task;
use crate::agent::Agent;
use crate::env::EnvClient;
use crate::error::{Error, Result};
use crate::storage::{Metadata, TrajectoryStorage};
use crate::strategy::RolloutStrategy;
use crate::trajectory::ExperienceOutput;

/// Default number of rollouts allowed to run at once.
pub const DEFAULT_MAX_WORKERS: usize = 10;

// ---------------------------------------------------------------------------
// Request / report
// ---------------------------------------------------------------------------

/// One call to [`RolloutController::rollout`].
#[derive(Debug, Clone)]
pub struct RolloutRequest {
    /// Index into the controller's tasks.
    pub task: usize,
    /// Round limit per rollout; `None` runs until the environment is done.
    pub max_rounds: Option<usize>,
    /// Task indices to roll out; `None` means every index of the task.
    pub task_indices: Option<Vec<usize>>,
    /// Persist experiences through the controller's storage, if it has one.
    pub save: bool,
    /// Run on the worker pool; otherwise one index at a time in order.
    pub parallel: bool,
    /// Indices submitted to the worker pool at a time in parallel mode.
    pub batch_size: usize,
    /// Attached to every saved trajectory.
    pub metadata: Metadata,
}

impl Default for RolloutRequest {
    fn default() -> Self {
        Self {
            task: 0,
            max_rounds: Some(10),
            task_indices: None,
            save: true,
            parallel: true,
            batch_size: 10,
            metadata: Metadata::new(),
        }
    }
}

impl RolloutRequest {
    pub fn indices(mut self, indices: impl IntoIterator<Item = usize>) -> Self {
        self.task_indices = Some(indices.into_iter().collect());
        self
    }

    pub fn max_rounds(mut self, max_rounds: Option<usize>) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn without_saving(mut self) -> Self {
        self.save = false;
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A task index that produced no experiences, or whose experiences could not
/// be saved.
#[derive(Debug, Clone, PartialEq)]
pub struct RolloutFailure {
    pub task_index: usize,
    /// Display form of the error that stopped this index.
    pub error: String,
}

/// Outcome of one [`RolloutController::rollout`] call.
#[derive(Debug, Default)]
pub struct RolloutReport {
    /// Experiences of every successful index. Completion order in parallel
    /// mode, submission order in sequential mode.
    pub experiences: Vec<ExperienceOutput>,
    /// Indices that produced no experiences.
    pub failures: Vec<RolloutFailure>,
    /// Storage ids of every saved experience.
    pub saved_ids: Vec<String>,
    /// Indices whose experiences are in `experiences` but were not persisted.
    pub save_failures: Vec<RolloutFailure>,
}

impl RolloutReport {
    /// Mean final reward over `experiences`, 0 when there are none.
    pub fn mean_reward(&self) -> f64 {
        if self.experiences.is_empty() {
            return 0.0;
        }
        self.experiences.iter().map(|e| e.reward).sum::<f64>() / self.experiences.len() as f64
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Schedules rollouts of one agent over a set of tasks.
pub struct RolloutController {
    agent: Arc<Agent>,
    tasks: Vec<Task>,
    strategy: Arc<RolloutStrategy>,
    storage: Option<Arc<dyn TrajectoryStorage>>,
    max_workers: usize,
}

/// Everything one rollout needs, owned so it can move onto a worker.
struct Job {
    index: usize,
    client: Box<dyn EnvClient>,
    agent: Arc<Agent>,
    strategy: Arc<RolloutStrategy>,
    storage: Option<Arc<dyn TrajectoryStorage>>,
    env_name: Arc<str>,
    metadata: Arc<Metadata>,
    max_rounds: Option<usize>,
}

struct JobOutcome {
    index: usize,
    result: Result<Vec<ExperienceOutput>>,
    saved: Option<Result<Vec<String>>>,
}

impl RolloutController {
    pub fn new(agent: Agent, tasks: Vec<Task>) -> Self {
        Self {
            agent: Arc::new(agent),
            tasks,
            strategy: Arc::new(RolloutStrategy::default()),
            storage: None,
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }

    pub fn with_strategy(mut self, strategy: RolloutStrategy) -> Self {
        self.set_strategy(strategy);
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn TrajectoryStorage>) -> Self {
        self.set_storage(storage);
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn set_strategy(&mut self, strategy: RolloutStrategy) {
        self.strategy = Arc::new(strategy);
    }

    pub fn set_storage(&mut self, storage: Arc<dyn TrajectoryStorage>) {
        self.storage = Some(storage);
    }

    pub fn storage(&self) -> Option<&Arc<dyn TrajectoryStorage>> {
        self.storage.as_ref()
    }

    pub fn strategy(&self) -> &RolloutStrategy {
        &self.strategy
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Run one rollout per requested task index.
    ///
    /// Only invalid requests fail as a whole. Per-index problems end up in
    /// [`RolloutReport::failures`] or [`RolloutReport::save_failures`].
    pub async fn rollout(&self, request: RolloutRequest) -> Result<RolloutReport> {
        let task = self.tasks.get(request.task).ok_or_else(|| {
            Error::Config(format!(
                "task {} does not exist ({} configured)",
                request.task,
                self.tasks.len()
            ))
        })?;
        if task.clients.is_empty() {
            return Err(Error::Config(format!("task {} has no clients", task.env_name)));
        }
        if request.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if self.max_workers == 0 {
            return Err(Error::Config("max_workers must be at least 1".into()));
        }

        let indices = request
            .task_indices
            .clone()
            .unwrap_or_else(|| (0..task.size()).collect());
        info!(
            env = %task.env_name,
            strategy = self.strategy.name(),
            rollouts = indices.len(),
            parallel = request.parallel,
            "starting rollouts"
        );

        let env_name: Arc<str> = Arc::from(task.env_name.as_str());
        let metadata = Arc::new(request.metadata.clone());
        let save = request.save;
        let mut jobs = indices.iter().filter_map(|&index| {
            let client = task.client_for(index)?;
            Some(Job {
                index,
                client,
                agent: Arc::clone(&self.agent),
                strategy: Arc::clone(&self.strategy),
                storage: if save { self.storage.clone() } else { None },
                env_name: Arc::clone(&env_name),
                metadata: Arc::clone(&metadata),
                max_rounds: request.max_rounds,
            })
        });

        let mut report = RolloutReport::default();
        if request.parallel {
            let semaphore = Arc::new(Semaphore::new(self.max_workers));
            let mut batch_no = 0usize;
            loop {
                let batch: Vec<Job> = jobs.by_ref().take(request.batch_size).collect();
                if batch.is_empty() {
                    break;
                }
                batch_no += 1;
                debug!(batch = batch_no, size = batch.len(), "submitting batch");

                let mut set = JoinSet::new();
                let mut pending = HashMap::new();
                for job in batch {
                    let index = job.index;
                    let permit = Arc::clone(&semaphore)
                        .acquire_owned()
                        .await
                        .map_err(|e| Error::Config(format!("worker pool closed: {e}")))?;
                    let handle = set.spawn(async move {
                        let _permit = permit;
                        run_guarded(job).await
                    });
                    pending.insert(handle.id(), index);
                }
                while let Some(joined) = set.join_next_with_id().await {
                    absorb_joined(&mut report, &mut pending, joined);
                }
            }
        } else {
            for job in jobs {
                absorb(&mut report, run_guarded(job).await);
            }
        }

        info!(
            env = %task.env_name,
            succeeded = report.experiences.len(),
            failed = report.failures.len(),
            saved = report.saved_ids.len(),
            mean_reward = report.mean_reward(),
            "rollouts finished"
        );
        Ok(report)
    }
}

/// Run a job, turning a panic into a per-index failure.
async fn run_guarded(job: Job) -> JobOutcome {
    let index = job.index;
    match AssertUnwindSafe(run_job(job)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            JobOutcome {
                index,
                result: Err(Error::GenerationFailure(format!("rollout panicked: {message}"))),
                saved: None,
            }
        }
    }
}

async fn run_job(mut job: Job) -> JobOutcome {
    let index = job.index;
    let result = async {
        job.client.reset(index).await?;
        let observation = job.client.observe().to_string();
        job.strategy
            .execute(&job.agent, job.client.as_mut(), &observation, job.max_rounds)
            .await
    }
    .await;

    let saved = match (&result, &job.storage) {
        (Ok(experiences), Some(storage)) if !experiences.is_empty() => {
            let task_id = i64::try_from(index).unwrap_or(i64::MAX);
            let task_ids = vec![task_id; experiences.len()];
            Some(
                storage
                    .save(&job.env_name, &task_ids, experiences, &job.metadata)
                    .await,
            )
        }
        _ => None,
    };

    JobOutcome {
        index,
        result,
        saved,
    }
}

/// Fold a finished worker into the report. A worker that died outside the
/// panic guard, e.g. by cancellation, is still reported under its index.
fn absorb_joined(
    report: &mut RolloutReport,
    pending: &mut HashMap<task::Id, usize>,
    joined: std::result::Result<(task::Id, JobOutcome), JoinError>,
) {
    match joined {
        Ok((id, outcome)) => {
            pending.remove(&id);
            absorb(report, outcome);
        }
        Err(e) => match pending.remove(&e.id()) {
            Some(index) => {
                warn!(task_index = index, error = %e, "rollout worker did not finish");
                report.failures.push(RolloutFailure {
                    task_index: index,
                    error: format!("rollout worker did not finish: {e}"),
                });
            }
            None => warn!(error = %e, "unknown rollout worker did not finish"),
        },
    }
}

fn absorb(report: &mut RolloutReport, outcome: JobOutcome) {
    let JobOutcome {
        index,
        result,
        saved,
    } = outcome;
    match result {
        Ok(experiences) => {
            let rewards: Vec<f64> = experiences.iter().map(|e| e.reward).collect();
            info!(task_index = index, experiences = experiences.len(), ?rewards, "rollout done");
            match saved {
                Some(Ok(ids)) => report.saved_ids.extend(ids),
                Some(Err(e)) => {
                    warn!(task_index = index, error = %e, "failed to save trajectories");
                    report.save_failures.push(RolloutFailure {
                        task_index: index,
                        error: e.to_string(),
                    });
                }
                None => {}
            }
            report.experiences.extend(experiences);
        }
        Err(e) => {
            warn!(task_index = index, error = %e, "rollout failed");
            report.failures.push(RolloutFailure {
                task_index: index,
                error: e.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::config::StrategyConfig;
    use crate::env::{ScriptedEnvClient, ScriptedTask};
    use crate::model::{ByteTokenizer, Generator, SamplingConfig, ScriptedGenerator};
    use crate::storage::{
        FileStorage, PersistedTrajectory, SqliteStorage, StorageBackend, TrajectoryQuery,
    };
    use crate::trajectory::ConversationMessage;

    fn agent(generator: impl Generator + 'static) -> Agent {
        Agent::new(Arc::new(generator), Arc::new(ByteTokenizer))
    }

    fn confirm_tasks(n: usize) -> ScriptedEnvClient {
        ScriptedEnvClient::new(
            (0..n)
                .map(|i| ScriptedTask::new(format!("Order {i}: please confirm."), "confirm", 20))
                .collect(),
        )
    }

    /// Fails or panics depending on the observation it is shown.
    struct Picky;

    #[async_trait]
    impl Generator for Picky {
        async fn generate(&self, transcript: &str, _sampling: &SamplingConfig) -> Result<String> {
            if transcript.contains("poison") {
                return Err(Error::GenerationFailure("model refused".into()));
            }
            if transcript.contains("boom") {
                panic!("generator exploded");
            }
            Ok("confirm".into())
        }
    }

    /// Records the highest number of concurrent `generate` calls.
    #[derive(Default)]
    struct Gauge {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Generator for Arc<Gauge> {
        async fn generate(&self, _transcript: &str, _sampling: &SamplingConfig) -> Result<String> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok("confirm".into())
        }
    }

    struct BrokenStorage;

    #[async_trait]
    impl TrajectoryStorage for BrokenStorage {
        async fn save(
            &self,
            _env_name: &str,
            _task_ids: &[i64],
            _trajectories: &[ExperienceOutput],
            _metadata: &Metadata,
        ) -> Result<Vec<String>> {
            Err(Error::StorageWriteFailure("disk full".into()))
        }

        async fn get(&self, _id: &str) -> Result<Option<PersistedTrajectory>> {
            Ok(None)
        }

        async fn list(&self, _query: &TrajectoryQuery) -> Result<Vec<PersistedTrajectory>> {
            Ok(Vec::new())
        }

        async fn import(&self, _records: Vec<PersistedTrajectory>) -> Result<usize> {
            Err(Error::StorageWriteFailure("disk full".into()))
        }

        fn backend(&self) -> StorageBackend {
            StorageBackend::File
        }
    }

    #[tokio::test]
    async fn confirm_rollout_is_saved() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FileStorage::new(dir.path()).await.unwrap());
        let controller = RolloutController::new(
            agent(ScriptedGenerator::by_turn(["check the cart", "confirm"])),
            vec![Task::new("webshop", confirm_tasks(1))],
        )
        .with_storage(storage.clone());

        let mut metadata = Metadata::new();
        metadata.insert("run".into(), "smoke".into());
        let report = controller
            .rollout(RolloutRequest::default().indices([0]).metadata(metadata))
            .await
            .unwrap();

        assert!(report.failures.is_empty());
        assert_eq!(report.experiences.len(), 1);
        let exp = &report.experiences[0];
        assert_eq!(exp.reward, 1.0);
        assert_eq!(exp.conversation.len(), 5);
        assert_eq!(exp.conversation[0], ConversationMessage::human("Order 0: please confirm."));

        assert_eq!(report.saved_ids.len(), 1);
        let stored = storage.get(&report.saved_ids[0]).await.unwrap().unwrap();
        assert_eq!(stored.env_name, "webshop");
        assert_eq!(stored.task_id, 0);
        assert_eq!(stored.metadata["run"], "smoke");
        assert_eq!(stored.trajectory, exp.to_record());
    }

    #[tokio::test]
    async fn failing_indices_do_not_stop_siblings() {
        let env = ScriptedEnvClient::new(vec![
            ScriptedTask::new("fine", "confirm", 5),
            ScriptedTask::new("poison", "confirm", 5),
            ScriptedTask::new("boom", "confirm", 5),
            ScriptedTask::new("also fine", "confirm", 5),
        ]);
        let controller = RolloutController::new(agent(Picky), vec![Task::new("webshop", env)])
            .with_max_workers(2);

        let report = controller
            .rollout(RolloutRequest::default().indices([0, 1, 2, 3, 9]).without_saving())
            .await
            .unwrap();

        assert_eq!(report.experiences.len(), 2);
        let mut failed: Vec<usize> = report.failures.iter().map(|f| f.task_index).collect();
        failed.sort();
        assert_eq!(failed, vec![1, 2, 9]);
        let panicked = report.failures.iter().find(|f| f.task_index == 2).unwrap();
        assert!(panicked.error.contains("panicked"));
    }

    #[tokio::test]
    async fn save_failures_keep_experiences() {
        let controller = RolloutController::new(
            agent(ScriptedGenerator::by_turn(["confirm"])),
            vec![Task::new("webshop", confirm_tasks(3))],
        )
        .with_storage(Arc::new(BrokenStorage));

        let report = controller.rollout(RolloutRequest::default()).await.unwrap();

        assert_eq!(report.experiences.len(), 3);
        assert!(report.failures.is_empty());
        assert!(report.saved_ids.is_empty());
        assert_eq!(report.save_failures.len(), 3);
        assert!(report.save_failures[0].error.contains("disk full"));
    }

    #[tokio::test]
    async fn sequential_mode_keeps_submission_order() {
        let controller = RolloutController::new(
            agent(ScriptedGenerator::by_turn(["confirm"])),
            vec![Task::new("webshop", confirm_tasks(3))],
        );

        let report = controller
            .rollout(RolloutRequest::default().indices([2, 0, 1]).sequential())
            .await
            .unwrap();

        let firsts: Vec<&str> = report
            .experiences
            .iter()
            .map(|e| e.conversation[0].content.as_str())
            .collect();
        assert_eq!(
            firsts,
            vec!["Order 2: please confirm.", "Order 0: please confirm.", "Order 1: please confirm."]
        );
    }

    #[tokio::test]
    async fn worker_pool_is_bounded() {
        let gauge = Arc::new(Gauge::default());
        let controller = RolloutController::new(
            agent(Arc::clone(&gauge)),
            vec![Task::new("webshop", confirm_tasks(12))],
        )
        .with_max_workers(3);

        let report = controller
            .rollout(RolloutRequest::default().batch_size(6).without_saving())
            .await
            .unwrap();

        assert_eq!(report.experiences.len(), 12);
        assert!(gauge.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn parallel_saves_land_in_storage() {
        let storage = Arc::new(SqliteStorage::in_memory().unwrap());
        let controller = RolloutController::new(
            agent(ScriptedGenerator::by_turn(["look", "confirm"])),
            vec![Task::new("webshop", confirm_tasks(12))],
        )
        .with_storage(storage.clone())
        .with_max_workers(4);

        let report = controller
            .rollout(RolloutRequest::default().batch_size(5))
            .await
            .unwrap();
        assert_eq!(report.saved_ids.len(), 12);

        let stored = storage
            .list(&TrajectoryQuery::default().env("webshop"))
            .await
            .unwrap();
        let mut task_ids: Vec<i64> = stored.iter().map(|r| r.task_id).collect();
        task_ids.sort();
        assert_eq!(task_ids, (0..12).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn tree_strategy_saves_every_leaf() {
        let storage = Arc::new(SqliteStorage::in_memory().unwrap());
        let strategy = RolloutStrategy::from_config(&StrategyConfig {
            name: "ToT".into(),
            branch_factor: 2,
            max_depth: 2,
            ..StrategyConfig::default()
        })
        .unwrap();
        let controller = RolloutController::new(
            agent(ScriptedGenerator::cycling(["wait", "look"])),
            vec![Task::new("webshop", confirm_tasks(2))],
        )
        .with_strategy(strategy)
        .with_storage(storage.clone());

        let report = controller.rollout(RolloutRequest::default()).await.unwrap();

        assert_eq!(report.experiences.len(), 8);
        assert_eq!(report.saved_ids.len(), 8);
        let task0 = storage
            .list(&TrajectoryQuery::default().task(0))
            .await
            .unwrap();
        assert_eq!(task0.len(), 4);
    }

    #[tokio::test]
    async fn clients_are_used_round_robin() {
        let a = ScriptedEnvClient::new(vec![ScriptedTask::new("from a", "confirm", 5); 4]);
        let b = ScriptedEnvClient::new(vec![ScriptedTask::new("from b", "confirm", 5); 4]);
        let controller = RolloutController::new(
            agent(ScriptedGenerator::by_turn(["confirm"])),
            vec![Task::with_clients("webshop", vec![Box::new(a), Box::new(b)])],
        );

        let report = controller
            .rollout(RolloutRequest::default().sequential())
            .await
            .unwrap();
        let firsts: Vec<&str> = report
            .experiences
            .iter()
            .map(|e| e.conversation[0].content.as_str())
            .collect();
        assert_eq!(firsts, vec!["from a", "from b", "from a", "from b"]);
    }

    #[tokio::test]
    async fn invalid_requests_are_config_errors() {
        let controller = RolloutController::new(
            agent(ScriptedGenerator::by_turn(["confirm"])),
            vec![Task::new("webshop", confirm_tasks(1))],
        );

        let bad_task = RolloutRequest {
            task: 3,
            ..RolloutRequest::default()
        };
        assert!(matches!(controller.rollout(bad_task).await, Err(Error::Config(_))));
        assert!(matches!(
            controller.rollout(RolloutRequest::default().batch_size(0)).await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_worker_is_reported_under_its_index() {
        let mut set = JoinSet::new();
        let mut pending = HashMap::new();
        let stuck = set.spawn(std::future::pending::<JobOutcome>());
        pending.insert(stuck.id(), 7);
        let done = set.spawn(async {
            JobOutcome {
                index: 2,
                result: Ok(Vec::new()),
                saved: None,
            }
        });
        pending.insert(done.id(), 2);
        stuck.abort();

        let mut report = RolloutReport::default();
        while let Some(joined) = set.join_next_with_id().await {
            absorb_joined(&mut report, &mut pending, joined);
        }

        assert!(pending.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].task_index, 7);
        assert!(report.experiences.is_empty());
    }
}
