//! 端到端流程测试：内存队列 + 脚本化的外部服务

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use grading_pipeline::clients::{DiscoveryAdapter, StageAdapter};
use grading_pipeline::control::{ControlResponse, StartJobRequest};
use grading_pipeline::error::AdapterError;
use grading_pipeline::models::{
    CurrentStage, JobStatus, OverallStatus, PipelineJob, Stage, StageStatus,
};
use grading_pipeline::store::{
    JobRepository, MemoryStore, PipelineStore, StudentQueueRepository,
};
use grading_pipeline::{App, Config, StudentCtx, StudentQueueEntry};
use tokio_test::assert_ok;

/// tokio-test 不提供 assert_some!：解包 Some 并返回内部值，None 时 panic
macro_rules! assert_some {
    ($e:expr) => {
        match $e {
            Some(v) => v,
            None => panic!("assertion failed: expected Some(_), got None"),
        }
    };
}

#[derive(Clone, Copy)]
enum Step {
    Transient,
    Permanent,
}

/// 按 (阶段, 学号) 预设失败序列，序列用完后一律成功
#[derive(Default)]
struct ScriptedStages {
    script: Mutex<HashMap<(Stage, String), VecDeque<Step>>>,
    calls: Mutex<HashMap<(Stage, String), usize>>,
}

impl ScriptedStages {
    fn fail(&self, stage: Stage, roll: &str, steps: &[Step]) {
        self.script
            .lock()
            .unwrap()
            .insert((stage, roll.to_string()), steps.iter().copied().collect());
    }

    fn calls(&self, stage: Stage, roll: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(&(stage, roll.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl StageAdapter for ScriptedStages {
    async fn run(&self, stage: Stage, ctx: &StudentCtx) -> Result<(), AdapterError> {
        let key = (stage, ctx.roll_number.clone());
        *self.calls.lock().unwrap().entry(key.clone()).or_default() += 1;
        let step = self
            .script
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(|steps| steps.pop_front());
        match step {
            None => Ok(()),
            Some(Step::Transient) => Err(AdapterError::Transient {
                endpoint: stage.name().to_string(),
                message: "503 Service Unavailable".to_string(),
            }),
            Some(Step::Permanent) => Err(AdapterError::Permanent {
                endpoint: stage.name().to_string(),
                message: "question paper has no answer key".to_string(),
            }),
        }
    }
}

/// 前 `failures` 次失败，之后返回固定名单
struct FixedRoster {
    roster: Vec<String>,
    failures: usize,
    calls: AtomicUsize,
}

impl FixedRoster {
    fn new(roster: &[&str]) -> Self {
        Self {
            roster: roster.iter().map(|s| s.to_string()).collect(),
            failures: 0,
            calls: AtomicUsize::new(0),
        }
    }

    fn failing_once(roster: &[&str]) -> Self {
        Self {
            failures: 1,
            ..Self::new(roster)
        }
    }
}

#[async_trait]
impl DiscoveryAdapter for FixedRoster {
    async fn discover(&self, _job: &PipelineJob) -> Result<Vec<String>, AdapterError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(AdapterError::Transient {
                endpoint: "discovery".to_string(),
                message: "connection refused".to_string(),
            });
        }
        Ok(self.roster.clone())
    }
}

fn test_config() -> Config {
    Config {
        poll_interval_ms: 10,
        backoff_base_secs: 0,
        backoff_max_secs: 0,
        max_retries: 3,
        worker_pool_size: 2,
        ..Config::default()
    }
}

fn build_app(
    stages: Arc<ScriptedStages>,
    discovery: Arc<FixedRoster>,
) -> (App, Arc<dyn PipelineStore>) {
    build_app_with(test_config(), stages, discovery)
}

fn build_app_with(
    config: Config,
    stages: Arc<ScriptedStages>,
    discovery: Arc<FixedRoster>,
) -> (App, Arc<dyn PipelineStore>) {
    let store: Arc<dyn PipelineStore> = Arc::new(MemoryStore::new());
    let app = App::with_adapters(config, store.clone(), stages, discovery);
    (app, store)
}

/// 等待某个学生满足条件
async fn wait_entry<F>(store: &Arc<dyn PipelineStore>, job_id: &str, roll: &str, done: F) -> StudentQueueEntry
where
    F: Fn(&StudentQueueEntry) -> bool,
{
    let wait = async {
        loop {
            if let Some(entry) = store.get_entry(job_id, roll).await.unwrap() {
                if done(&entry) {
                    return entry;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .expect("学生没有在限定时间内到达预期状态")
}

async fn start(app: &App, job_id: &str) -> ControlResponse<grading_pipeline::control::StartJobView> {
    app.control()
        .start_job(StartJobRequest {
            job_id: Some(job_id.to_string()),
            question_paper_id: "qp-1".to_string(),
            source_ref: Some("s3://scans/batch-1".to_string()),
        })
        .await
}

/// 等待作业进入终态
async fn wait_terminal(store: &Arc<dyn PipelineStore>, job_id: &str) -> PipelineJob {
    let wait = async {
        loop {
            if let Some(job) = store.get_job(job_id).await.unwrap() {
                if job.status.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .expect("作业没有在限定时间内结束")
}

async fn assert_counts_consistent(store: &Arc<dyn PipelineStore>, job: &PipelineJob) {
    let entries = store.list_entries(Some(&job.job_id)).await.unwrap();
    let completed = entries
        .iter()
        .filter(|e| e.overall_status == OverallStatus::Completed)
        .count() as i32;
    let failed = entries
        .iter()
        .filter(|e| e.overall_status == OverallStatus::Failed)
        .count() as i32;
    assert_eq!(entries.len() as i32, job.total_students);
    assert_eq!(job.students_completed, completed);
    assert_eq!(job.students_failed, failed);
    for entry in &entries {
        entry.check_invariants().unwrap();
    }
}

#[tokio::test]
async fn test_all_students_complete() {
    let stages = Arc::new(ScriptedStages::default());
    let (mut app, store) = build_app(stages.clone(), Arc::new(FixedRoster::new(&["1", "2", "3"])));

    assert!(start(&app, "job_happy").await.is_success());
    let job = wait_terminal(&store, "job_happy").await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.total_students, 3);
    assert_eq!(job.students_completed, 3);
    assert_eq!(job.completion_rate(), 100.0);
    assert_counts_consistent(&store, &job).await;
    for roll in ["1", "2", "3"] {
        for stage in Stage::ALL {
            assert_eq!(stages.calls(stage, roll), 1);
        }
    }

    app.shutdown().await;
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let stages = Arc::new(ScriptedStages::default());
    stages.fail(Stage::Extract, "2", &[Step::Transient, Step::Transient]);
    let (mut app, store) = build_app(stages.clone(), Arc::new(FixedRoster::new(&["1", "2", "3"])));

    assert!(start(&app, "job_flaky").await.is_success());
    let job = wait_terminal(&store, "job_flaky").await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.students_completed, 3);
    assert_counts_consistent(&store, &job).await;

    let entry = assert_some!(store.get_entry("job_flaky", "2").await.unwrap());
    assert_eq!(entry.status(Stage::Extract), StageStatus::Completed);
    assert_eq!(entry.overall_status, OverallStatus::Completed);
    assert_eq!(entry.retry_count, 2);
    assert_eq!(stages.calls(Stage::Extract, "2"), 3);
    assert_eq!(stages.calls(Stage::Chunk, "2"), 1);

    let other = assert_some!(store.get_entry("job_flaky", "1").await.unwrap());
    assert_eq!(other.retry_count, 0);

    app.shutdown().await;
}

#[tokio::test]
async fn test_permanent_failure_then_operator_retry() {
    let stages = Arc::new(ScriptedStages::default());
    stages.fail(Stage::Map, "3", &[Step::Permanent]);
    let (mut app, store) = build_app(stages.clone(), Arc::new(FixedRoster::new(&["1", "2", "3"])));

    assert!(start(&app, "job_partial").await.is_success());
    let job = wait_terminal(&store, "job_partial").await;

    // 部分失败的作业仍然完成
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.students_completed, 2);
    assert_eq!(job.students_failed, 1);
    assert_counts_consistent(&store, &job).await;

    let failed = assert_some!(store.get_entry("job_partial", "3").await.unwrap());
    assert_eq!(failed.overall_status, OverallStatus::Failed);
    assert_eq!(failed.current_stage, CurrentStage::Failed);
    assert_eq!(failed.status(Stage::Extract), StageStatus::Completed);
    assert_eq!(failed.status(Stage::Chunk), StageStatus::Completed);
    assert_eq!(failed.status(Stage::Map), StageStatus::Failed);
    assert_eq!(failed.status(Stage::Grade), StageStatus::Waiting);
    assert_eq!(stages.calls(Stage::Map, "3"), 1);
    let extract_done_at = failed.stage(Stage::Extract).completed_at;

    // 重试只重跑失败的阶段
    let retried = app.control().retry_student("job_partial", "3").await;
    let view = assert_some!(retried.into_data());
    assert_eq!(view.stage, Stage::Map);
    assert_eq!(view.retry_count, 0);

    let job = wait_terminal(&store, "job_partial").await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.students_completed, 3);
    assert_eq!(job.students_failed, 0);
    assert_counts_consistent(&store, &job).await;

    let entry = assert_some!(store.get_entry("job_partial", "3").await.unwrap());
    assert_eq!(entry.stage(Stage::Extract).completed_at, extract_done_at);
    assert_eq!(stages.calls(Stage::Extract, "3"), 1);
    assert_eq!(stages.calls(Stage::Chunk, "3"), 1);
    assert_eq!(stages.calls(Stage::Map, "3"), 2);
    assert_eq!(stages.calls(Stage::Grade, "3"), 1);

    // 再次重试已完成的学生是非法操作
    let again = app.control().retry_student("job_partial", "3").await;
    assert!(matches!(again, ControlResponse::InvalidState { .. }));

    app.shutdown().await;
}

#[tokio::test]
async fn test_discovery_failure_creates_no_entries() {
    let stages = Arc::new(ScriptedStages::default());
    let discovery = Arc::new(FixedRoster::failing_once(&["1", "2"]));
    let (mut app, store) = build_app(stages.clone(), discovery.clone());

    assert!(start(&app, "job_nodisc").await.is_success());
    let job = wait_terminal(&store, "job_nodisc").await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.total_students, 0);
    assert!(job.error_message.is_some());
    assert!(store.list_entries(Some("job_nodisc")).await.unwrap().is_empty());

    // 尚无名单的失败作业可以重新发起
    assert!(start(&app, "job_nodisc").await.is_success());
    let job = wait_terminal(&store, "job_nodisc").await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.total_students, 2);
    assert_eq!(discovery.calls.load(Ordering::SeqCst), 2);

    app.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_job_is_rejected() {
    let stages = Arc::new(ScriptedStages::default());
    let (mut app, store) = build_app(stages, Arc::new(FixedRoster::new(&["1"])));

    assert!(start(&app, "job_dup").await.is_success());
    wait_terminal(&store, "job_dup").await;

    let again = start(&app, "job_dup").await;
    assert!(matches!(again, ControlResponse::InvalidState { .. }));

    app.shutdown().await;
}

#[tokio::test]
async fn test_operator_errors_are_structured() {
    let stages = Arc::new(ScriptedStages::default());
    let (mut app, store) = build_app(stages, Arc::new(FixedRoster::new(&["1"])));

    let missing = app.control().job_status("job_missing").await;
    assert!(matches!(missing, ControlResponse::NotFound { .. }));

    let missing = app.control().student_status("job_missing", "1").await;
    assert!(matches!(missing, ControlResponse::NotFound { .. }));

    assert!(start(&app, "job_ops").await.is_success());
    wait_terminal(&store, "job_ops").await;

    // 已完成的学生不能重试，也不能强制失败
    let retry = app.control().retry_student("job_ops", "1").await;
    assert!(matches!(retry, ControlResponse::InvalidState { .. }));
    let fail = app.control().fail_student("job_ops", "1", "wrong paper").await;
    assert!(matches!(fail, ControlResponse::InvalidState { .. }));

    let status = assert_some!(app.control().student_status("job_ops", "1").await.into_data());
    assert_eq!(status.progress_percentage, 100.0);
    assert!(!status.recent_logs.is_empty());
    assert!(status.recent_logs.len() <= 10);

    let job = assert_some!(app.control().job_status("job_ops").await.into_data());
    assert_eq!(job.snapshot.job.students_completed, 1);

    let dashboard = assert_some!(app.control().dashboard().await.into_data());
    assert_eq!(dashboard.overall.total_jobs, 1);
    assert_eq!(dashboard.recent_completed.len(), 1);

    app.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_claims_have_one_winner() {
    let store: Arc<dyn PipelineStore> = Arc::new(MemoryStore::new());
    let job = PipelineJob::new("job_race", "qp-1", None, chrono::Utc::now());
    assert_ok!(store.create_job(&job).await);
    let entry = StudentQueueEntry::new("job_race", "qp-1", "7", 3, chrono::Utc::now());
    let entry_id = entry.id;
    assert_ok!(store.mark_discovering("job_race", chrono::Utc::now()).await);
    assert_ok!(
        store
            .register_roster("job_race", &[entry], chrono::Utc::now())
            .await
    );

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .claim_for_processing(entry_id, Stage::Extract, chrono::Utc::now())
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let entry = assert_some!(store.get_entry("job_race", "7").await.unwrap());
    assert_eq!(entry.status(Stage::Extract), StageStatus::Processing);
}

#[tokio::test]
async fn test_bulk_reset_requeues_every_failed_student() {
    let stages = Arc::new(ScriptedStages::default());
    stages.fail(Stage::Chunk, "1", &[Step::Permanent]);
    stages.fail(Stage::Grade, "2", &[Step::Permanent]);
    let (mut app, store) = build_app(stages.clone(), Arc::new(FixedRoster::new(&["1", "2"])));

    assert!(start(&app, "job_bulk").await.is_success());
    let job = wait_terminal(&store, "job_bulk").await;
    assert_eq!(job.students_completed, 0);
    assert_eq!(job.students_failed, 2);

    let view = assert_some!(app.control().reset_failed_students(Some("job_bulk")).await.into_data());
    assert_eq!(view.reset, 2);
    assert!(view.skipped.is_empty());
    let mut stages_reset: Vec<(String, Stage)> = view
        .students
        .iter()
        .map(|s| (s.roll_number.clone(), s.stage))
        .collect();
    stages_reset.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        stages_reset,
        vec![("1".to_string(), Stage::Chunk), ("2".to_string(), Stage::Grade)]
    );

    // 重置时已把作业重新打开，这里等到两人都跑完
    let job = wait_terminal(&store, "job_bulk").await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.students_completed, 2);
    assert_eq!(job.students_failed, 0);
    assert_counts_consistent(&store, &job).await;
    assert_eq!(stages.calls(Stage::Extract, "1"), 1);
    assert_eq!(stages.calls(Stage::Chunk, "1"), 2);
    assert_eq!(stages.calls(Stage::Grade, "2"), 2);

    // 没有失败学生时批量重置是空操作
    let empty = assert_some!(app.control().reset_failed_students(Some("job_bulk")).await.into_data());
    assert_eq!(empty.reset, 0);

    app.shutdown().await;
}

#[tokio::test]
async fn test_operator_fails_live_student_and_queue_reflects_it() {
    let stages = Arc::new(ScriptedStages::default());
    stages.fail(Stage::Extract, "2", &[Step::Transient]);
    // 退避足够长，学生 2 停在 extract 的 pending 等待重试
    let config = Config {
        backoff_base_secs: 600,
        backoff_max_secs: 600,
        ..test_config()
    };
    let (mut app, store) = build_app_with(config, stages.clone(), Arc::new(FixedRoster::new(&["1", "2"])));

    assert!(start(&app, "job_live").await.is_success());
    wait_entry(&store, "job_live", "1", |e| e.overall_status == OverallStatus::Completed).await;
    let waiting = wait_entry(&store, "job_live", "2", |e| e.retry_count == 1).await;
    assert_eq!(waiting.status(Stage::Extract), StageStatus::Pending);

    let queue = assert_some!(app.control().queue_status().await.into_data());
    let extract = assert_some!(queue.iter().find(|q| q.stage == Stage::Extract));
    assert_eq!(extract.pending.len(), 1);
    assert_eq!(extract.pending[0].roll_number, "2");
    assert_eq!(extract.pending[0].retry_count, 1);
    assert!(extract.processing.is_empty());
    assert!(queue
        .iter()
        .filter(|q| q.stage != Stage::Extract)
        .all(|q| q.pending.is_empty() && q.processing.is_empty()));

    let job = assert_some!(store.get_job("job_live").await.unwrap());
    assert_eq!(job.status, JobStatus::Active);

    let failed = assert_some!(
        app.control()
            .fail_student("job_live", "2", "scan is unreadable")
            .await
            .into_data()
    );
    assert_eq!(failed.stage, Stage::Extract);
    assert_eq!(failed.overall_status, OverallStatus::Failed);

    let job = wait_terminal(&store, "job_live").await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.students_completed, 1);
    assert_eq!(job.students_failed, 1);
    assert_counts_consistent(&store, &job).await;

    let entry = assert_some!(store.get_entry("job_live", "2").await.unwrap());
    assert_eq!(entry.error_message.as_deref(), Some("scan is unreadable"));
    assert_eq!(stages.calls(Stage::Extract, "2"), 1);

    let queue = assert_some!(app.control().queue_status().await.into_data());
    assert!(queue.iter().all(|q| q.pending.is_empty() && q.processing.is_empty()));

    app.shutdown().await;
}

#[tokio::test]
async fn test_restarted_workers_keep_processing() {
    let stages = Arc::new(ScriptedStages::default());
    let (mut app, store) = build_app(stages, Arc::new(FixedRoster::new(&["1", "2"])));

    let restarted = assert_some!(app.control().restart_workers().await.into_data());
    assert_eq!(restarted.restarted, Stage::ALL.to_vec());

    assert!(start(&app, "job_restart").await.is_success());
    let restarted = assert_some!(app.control().restart_workers().await.into_data());
    assert_eq!(restarted.restarted.len(), 4);

    let job = wait_terminal(&store, "job_restart").await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.students_completed, 2);
    assert_counts_consistent(&store, &job).await;

    app.shutdown().await;
}
