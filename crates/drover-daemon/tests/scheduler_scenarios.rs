#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity
#![cfg(unix)]

//! End-to-end scheduler scenarios: an in-memory queue, real worker
//! processes (small `sh` scripts), and the SQLite notification sink.

use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use drover_daemon::notify::{EmitterConfig, NotificationEmitter};
use drover_daemon::orchestration::{
    AgentRunner, ConcurrencyGate, OrchestratorContext, RunnerConfig, Scheduler, SchedulerConfig,
};
use drover_daemon::queue::{CloseStatus, MemoryQueue, QueueError, Task, TaskQueue, TaskState};
use drover_daemon::storage::Database;

/// Reports the `--model` it was given as its result.
const ECHO_MODEL: &str = r#"model=default
while [ $# -gt 0 ]; do
  if [ "$1" = "--model" ]; then model="$2"; fi
  shift
done
echo '{"type":"system","subtype":"init"}'
echo "{\"type\":\"result\",\"subtype\":\"success\",\"is_error\":false,\"num_turns\":1,\"result\":\"model=$model\"}""#;

const SLOW_SUCCESS: &str = r#"sleep 0.3
echo '{"type":"result","subtype":"success","result":"done"}'"#;

const HANG: &str = "trap '' TERM\nwhile true; do sleep 0.1; done";

/// Queue wrapper that misbehaves on purpose.
struct ScriptedQueue {
    inner: MemoryQueue,
    /// Claims for these IDs go to "another worker".
    stolen: HashSet<String>,
    /// Keep listing tasks after they are claimed.
    sticky: bool,
}

#[async_trait]
impl TaskQueue for ScriptedQueue {
    async fn list_ready(&self) -> Result<Vec<Task>, QueueError> {
        let mut tasks = self.inner.list_ready().await?;
        if self.sticky {
            for id in ["t1", "t2"] {
                if let Some(TaskState::Claimed) = self.inner.state(id).await
                    && let Some(task) = self.inner.show(id).await?
                {
                    tasks.push(task);
                }
            }
        }
        Ok(tasks)
    }

    async fn claim(&self, task_id: &str) -> Result<bool, QueueError> {
        if self.stolen.contains(task_id) {
            self.inner.claim(task_id).await?;
            return Ok(false);
        }
        if self.sticky {
            self.inner.claim(task_id).await?;
            return Ok(true);
        }
        self.inner.claim(task_id).await
    }

    async fn close(&self, task_id: &str, status: CloseStatus, summary: &str) -> Result<(), QueueError> {
        self.inner.close(task_id, status, summary).await
    }

    async fn show(&self, task_id: &str) -> Result<Option<Task>, QueueError> {
        self.inner.show(task_id).await
    }
}

/// Rejects every close, noting how many gate slots were free at the time.
#[derive(Default)]
struct RejectingCloseQueue {
    inner: MemoryQueue,
    gate: std::sync::OnceLock<Arc<ConcurrencyGate>>,
    free_at_close: std::sync::Mutex<Vec<usize>>,
}

#[async_trait]
impl TaskQueue for RejectingCloseQueue {
    async fn list_ready(&self) -> Result<Vec<Task>, QueueError> {
        self.inner.list_ready().await
    }

    async fn claim(&self, task_id: &str) -> Result<bool, QueueError> {
        self.inner.claim(task_id).await
    }

    async fn close(&self, _task_id: &str, _status: CloseStatus, _summary: &str) -> Result<(), QueueError> {
        let free = self.gate.get().map_or(usize::MAX, |g| g.available());
        self.free_at_close.lock().unwrap().push(free);
        Err(QueueError::Unavailable("queue offline".into()))
    }

    async fn show(&self, task_id: &str) -> Result<Option<Task>, QueueError> {
        self.inner.show(task_id).await
    }
}

fn task(id: &str, labels: &[&str]) -> Task {
    Task {
        id: id.into(),
        title: format!("Task {id}"),
        description: "Do the thing".into(),
        labels: labels.iter().map(|l| (*l).to_string()).collect(),
        ..Task::default()
    }
}

fn worker_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("worker.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

struct Setup {
    concurrency: usize,
    timeout: Duration,
    default_model: Option<String>,
    worker: &'static str,
    /// Point the runner at a binary that does not exist.
    missing_binary: bool,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            concurrency: 3,
            timeout: Duration::from_secs(30),
            default_model: None,
            worker: ECHO_MODEL,
            missing_binary: false,
        }
    }
}

struct Harness {
    dir: tempfile::TempDir,
    db: Database,
    emitter: NotificationEmitter,
    gate: Arc<ConcurrencyGate>,
}

impl Harness {
    async fn new() -> Self {
        let db = Database::open_in_memory().await.unwrap();
        let (emitter, _writer) = NotificationEmitter::spawn(Arc::new(db.clone()), EmitterConfig::default());
        Self {
            dir: tempfile::tempdir().unwrap(),
            db,
            emitter,
            gate: Arc::new(ConcurrencyGate::new(1)),
        }
    }

    fn scheduler(&mut self, queue: Arc<dyn TaskQueue>, setup: &Setup) -> Scheduler {
        let dir = self.dir.path();
        let worker_bin = if setup.missing_binary {
            dir.join("no-such-worker")
        } else {
            worker_script(dir, setup.worker)
        };
        self.gate = Arc::new(ConcurrencyGate::new(setup.concurrency));
        let grace_period = Duration::from_millis(300);

        Scheduler::new(OrchestratorContext {
            queue,
            runner: AgentRunner::new(RunnerConfig {
                worker_bin,
                allowed_tools: vec!["Read".into()],
                max_turns: 3,
                system_prompt: None,
                env_passthrough: vec!["PATH".into()],
                grace_period,
                log_dir: dir.join("logs"),
                max_log_lines: 1_000,
            }),
            gate: Arc::clone(&self.gate),
            emitter: self.emitter.clone(),
            config: SchedulerConfig {
                poll_interval: Duration::from_secs(1),
                default_model: setup.default_model.clone(),
                run_timeout: setup.timeout,
                grace_period,
                agent_dir: dir.to_path_buf(),
                notify_channel: Some("ops".into()),
                log_dir: dir.join("logs"),
                max_log_files: 50,
                cancel_file: dir.join("cancel_tasks.json"),
            },
        })
    }

    async fn notifications(&self) -> Vec<Value> {
        self.emitter.flush().await;
        self.db
            .recent_notifications(100)
            .await
            .unwrap()
            .into_iter()
            .rev()
            .map(|n| {
                assert_eq!(n.kind, "task_completion");
                serde_json::from_str(&n.payload).unwrap()
            })
            .collect()
    }
}

async fn reap(scheduler: &mut Scheduler) -> String {
    tokio::time::timeout(Duration::from_secs(10), scheduler.reap_next())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn happy_path_completes_and_notifies() {
    let mut h = Harness::new().await;
    let queue = Arc::new(MemoryQueue::with_tasks([task("t1", &[])]));
    let mut scheduler = h.scheduler(queue.clone(), &Setup::default());

    assert_eq!(scheduler.tick().await, 1);
    assert_eq!(scheduler.active_count(), 1);
    assert_eq!(h.gate.available(), 2);
    assert_eq!(queue.state("t1").await, Some(TaskState::Claimed));

    assert_eq!(reap(&mut scheduler).await, "t1");
    assert_eq!(scheduler.active_count(), 0);
    assert_eq!(h.gate.available(), 3);
    assert_eq!(
        queue.state("t1").await,
        Some(TaskState::Closed(CloseStatus::Completed))
    );
    assert_eq!(queue.closes().await[0].summary, "model=default");

    let notes = h.notifications().await;
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0]["task_id"], "t1");
    assert_eq!(notes[0]["status"], "completed");
    assert_eq!(notes[0]["exit_code"], 0);
    assert_eq!(notes[0]["num_turns"], 1);
    assert!(
        notes[0]["message"]
            .as_str()
            .unwrap()
            .starts_with("Task `t1` completed: **Task t1**")
    );

    let stored = h.db.recent_notifications(1).await.unwrap();
    assert_eq!(stored[0].channel_id.as_deref(), Some("ops"));
    assert!(stored[0].idempotency_key.starts_with("task_completion:"));
}

#[tokio::test]
async fn lost_claim_releases_the_slot() {
    let mut h = Harness::new().await;
    let queue = Arc::new(ScriptedQueue {
        inner: MemoryQueue::with_tasks([task("t1", &[])]),
        stolen: HashSet::from(["t1".to_string()]),
        sticky: false,
    });
    let mut scheduler = h.scheduler(queue.clone(), &Setup::default());

    assert_eq!(scheduler.tick().await, 0);
    assert_eq!(scheduler.active_count(), 0);
    assert_eq!(h.gate.available(), 3);
    assert!(queue.inner.closes().await.is_empty());
    assert!(h.notifications().await.is_empty());
}

#[tokio::test]
async fn concurrency_one_runs_tasks_in_turn() {
    let mut h = Harness::new().await;
    let queue = Arc::new(MemoryQueue::with_tasks([task("t1", &[]), task("t2", &[])]));
    let setup = Setup {
        concurrency: 1,
        worker: SLOW_SUCCESS,
        ..Setup::default()
    };
    let mut scheduler = h.scheduler(queue.clone(), &setup);

    assert_eq!(scheduler.tick().await, 1);
    // Gate is full: the second task is not even listed.
    assert_eq!(scheduler.tick().await, 0);
    assert_eq!(queue.state("t2").await, Some(TaskState::Ready));

    let first = reap(&mut scheduler).await;
    assert_eq!(scheduler.tick().await, 1);
    let second = reap(&mut scheduler).await;
    assert_ne!(first, second);

    for id in ["t1", "t2"] {
        assert_eq!(
            queue.state(id).await,
            Some(TaskState::Closed(CloseStatus::Completed))
        );
    }
}

#[tokio::test]
async fn a_task_never_has_two_active_runs() {
    let mut h = Harness::new().await;
    let queue = Arc::new(ScriptedQueue {
        inner: MemoryQueue::with_tasks([task("t1", &[])]),
        stolen: HashSet::new(),
        sticky: true,
    });
    let setup = Setup {
        worker: SLOW_SUCCESS,
        ..Setup::default()
    };
    let mut scheduler = h.scheduler(queue.clone(), &setup);

    assert_eq!(scheduler.tick().await, 1);
    // The backend keeps offering t1 and would grant the claim again.
    assert_eq!(scheduler.tick().await, 0);
    assert_eq!(scheduler.active_count(), 1);

    reap(&mut scheduler).await;
    assert_eq!(queue.inner.closes().await.len(), 1);
}

#[tokio::test]
async fn two_schedulers_on_one_queue_never_share_a_task() {
    let mut h = Harness::new().await;
    let queue = Arc::new(MemoryQueue::with_tasks([
        task("t1", &[]),
        task("t2", &[]),
        task("t3", &[]),
    ]));
    let setup = Setup {
        concurrency: 2,
        ..Setup::default()
    };
    let mut a = h.scheduler(queue.clone(), &setup);
    let mut b = h.scheduler(queue.clone(), &setup);

    let launched = a.tick().await + b.tick().await;
    assert_eq!(launched, 3);

    let ids_a: HashSet<_> = a.active_runs().into_iter().map(|r| r.task_id).collect();
    let ids_b: HashSet<_> = b.active_runs().into_iter().map(|r| r.task_id).collect();
    assert!(ids_a.is_disjoint(&ids_b));

    for _ in 0..ids_a.len() {
        reap(&mut a).await;
    }
    for _ in 0..ids_b.len() {
        reap(&mut b).await;
    }

    let closed: Vec<_> = queue.closes().await.into_iter().map(|c| c.task_id).collect();
    assert_eq!(closed.len(), 3);
    assert_eq!(closed.iter().collect::<HashSet<_>>().len(), 3);
}

#[tokio::test]
async fn timed_out_run_is_failed_within_grace() {
    let mut h = Harness::new().await;
    let queue = Arc::new(MemoryQueue::with_tasks([task("t1", &[])]));
    let setup = Setup {
        timeout: Duration::from_millis(300),
        worker: HANG,
        ..Setup::default()
    };
    let mut scheduler = h.scheduler(queue.clone(), &setup);

    let started = std::time::Instant::now();
    scheduler.tick().await;
    reap(&mut scheduler).await;
    assert!(started.elapsed() < Duration::from_secs(3));

    assert_eq!(
        queue.state("t1").await,
        Some(TaskState::Closed(CloseStatus::Failed))
    );
    let notes = h.notifications().await;
    assert_eq!(notes[0]["status"], "timed_out");
    assert!(notes[0]["message"].as_str().unwrap().contains("(TIMEOUT)"));
}

#[tokio::test]
async fn model_label_beats_default_model() {
    let mut h = Harness::new().await;
    let queue = Arc::new(MemoryQueue::with_tasks([
        task("t1", &["backend", "model:haiku"]),
        task("t2", &["backend"]),
    ]));
    let setup = Setup {
        default_model: Some("sonnet".into()),
        ..Setup::default()
    };
    let mut scheduler = h.scheduler(queue.clone(), &setup);

    assert_eq!(scheduler.tick().await, 2);
    reap(&mut scheduler).await;
    reap(&mut scheduler).await;

    let mut summaries: Vec<_> = queue
        .closes()
        .await
        .into_iter()
        .map(|c| (c.task_id, c.summary))
        .collect();
    summaries.sort();
    assert_eq!(
        summaries,
        vec![
            ("t1".to_string(), "model=haiku".to_string()),
            ("t2".to_string(), "model=sonnet".to_string()),
        ]
    );
}

#[tokio::test]
async fn cancel_file_stops_the_run() {
    let mut h = Harness::new().await;
    let queue = Arc::new(MemoryQueue::with_tasks([task("t1", &[])]));
    let setup = Setup {
        worker: HANG,
        ..Setup::default()
    };
    let mut scheduler = h.scheduler(queue.clone(), &setup);
    scheduler.tick().await;

    let cancel_file = h.dir.path().join("cancel_tasks.json");
    std::fs::write(&cancel_file, r#"["t1", "unknown"]"#).unwrap();
    scheduler.tick().await;
    assert_eq!(
        serde_json::from_str::<Vec<String>>(&std::fs::read_to_string(&cancel_file).unwrap()).unwrap(),
        vec!["unknown"]
    );

    reap(&mut scheduler).await;
    assert_eq!(
        queue.state("t1").await,
        Some(TaskState::Closed(CloseStatus::Failed))
    );
    assert_eq!(h.notifications().await[0]["status"], "cancelled");
}

#[tokio::test]
async fn shutdown_releases_active_tasks() {
    let mut h = Harness::new().await;
    let queue = Arc::new(MemoryQueue::with_tasks([task("t1", &[])]));
    let setup = Setup {
        worker: HANG,
        ..Setup::default()
    };
    let mut scheduler = h.scheduler(queue.clone(), &setup);
    scheduler.tick().await;

    tokio::time::timeout(Duration::from_secs(10), scheduler.shutdown())
        .await
        .unwrap();

    assert_eq!(scheduler.active_count(), 0);
    assert_eq!(queue.state("t1").await, Some(TaskState::Ready));
    assert_eq!(queue.closes().await[0].status, CloseStatus::Released);
    assert_eq!(h.notifications().await[0]["status"], "cancelled");
}

#[tokio::test]
async fn unavailable_queue_skips_the_tick() {
    let mut h = Harness::new().await;
    let queue = Arc::new(MemoryQueue::with_tasks([task("t1", &[])]));
    let mut scheduler = h.scheduler(queue.clone(), &Setup::default());

    queue.set_unavailable(true);
    assert_eq!(scheduler.tick().await, 0);

    queue.set_unavailable(false);
    assert_eq!(scheduler.tick().await, 1);
    reap(&mut scheduler).await;
}

#[tokio::test]
async fn missing_worker_binary_fails_the_task() {
    let mut h = Harness::new().await;
    let queue = Arc::new(MemoryQueue::with_tasks([task("t1", &[])]));
    let setup = Setup {
        missing_binary: true,
        ..Setup::default()
    };
    let mut scheduler = h.scheduler(queue.clone(), &setup);

    assert_eq!(scheduler.tick().await, 1);
    assert_eq!(reap(&mut scheduler).await, "t1");
    assert_eq!(scheduler.active_count(), 0);
    assert_eq!(h.gate.available(), 3);

    let closes = queue.closes().await;
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].status, CloseStatus::Failed);
    assert!(closes[0].summary.starts_with("failed to spawn worker: "));

    let notes = h.notifications().await;
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0]["status"], "failed");
    assert!(notes[0]["exit_code"].is_null());
}

#[tokio::test]
async fn crashed_worker_fails_the_task() {
    let mut h = Harness::new().await;
    let queue = Arc::new(MemoryQueue::with_tasks([task("t1", &[])]));
    let setup = Setup {
        worker: "echo 'starting' >&2\nexit 4",
        ..Setup::default()
    };
    let mut scheduler = h.scheduler(queue.clone(), &setup);

    assert_eq!(scheduler.tick().await, 1);
    assert_eq!(reap(&mut scheduler).await, "t1");
    assert_eq!(scheduler.active_count(), 0);

    let closes = queue.closes().await;
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].status, CloseStatus::Failed);
    assert_eq!(closes[0].summary, "worker crashed (exit code 4)");
    assert_eq!(
        queue.state("t1").await,
        Some(TaskState::Closed(CloseStatus::Failed))
    );

    let notes = h.notifications().await;
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0]["status"], "failed");
    assert_eq!(notes[0]["exit_code"], 4);
    assert_eq!(notes[0]["summary"], "worker crashed (exit code 4)");
}

#[tokio::test]
async fn slot_is_held_until_the_close_attempt_finishes() {
    let mut h = Harness::new().await;
    let queue = Arc::new(RejectingCloseQueue {
        inner: MemoryQueue::with_tasks([task("t1", &[])]),
        ..RejectingCloseQueue::default()
    });
    let setup = Setup {
        concurrency: 1,
        worker: SLOW_SUCCESS,
        ..Setup::default()
    };
    let mut scheduler = h.scheduler(queue.clone(), &setup);
    queue.gate.set(Arc::clone(&h.gate)).ok();

    assert_eq!(scheduler.tick().await, 1);
    assert_eq!(reap(&mut scheduler).await, "t1");

    assert_eq!(*queue.free_at_close.lock().unwrap(), vec![0]);
    // A failed close still retires the run and frees the slot.
    assert_eq!(scheduler.active_count(), 0);
    assert_eq!(h.gate.available(), 1);
    let notes = h.notifications().await;
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0]["status"], "completed");
}

#[tokio::test]
async fn tick_prunes_old_agent_logs() {
    let mut h = Harness::new().await;
    let queue = Arc::new(MemoryQueue::default());
    let mut scheduler = h.scheduler(queue, &Setup::default());

    // No log directory yet: nothing to do.
    assert_eq!(scheduler.tick().await, 0);

    let logs = h.dir.path().join("logs");
    std::fs::create_dir_all(&logs).unwrap();
    for i in 0..53 {
        std::fs::write(logs.join(format!("agent_t{i:02}_20260101_000000.log")), "x").unwrap();
    }
    assert_eq!(scheduler.tick().await, 0);
    assert_eq!(std::fs::read_dir(&logs).unwrap().count(), 50);
}
