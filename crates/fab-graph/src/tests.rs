use super::*;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Collects events in arrival order.
#[derive(Default)]
struct Recorder(Mutex<Vec<Event>>);

impl EventSink for Recorder {
    fn event(&self, event: &Event) {
        self.0.lock().unwrap().push(event.clone());
    }
}

impl Recorder {
    fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }
}

struct TestJob {
    name: String,
    deps: Vec<String>,
    should_run: ShouldRun,
    fail_with: Option<String>,
    /// Wait for cancellation instead of finishing.
    hang: bool,
    ran: Arc<Mutex<Vec<String>>>,
}

impl TestJob {
    fn new(name: &str, deps: &[&str], ran: Arc<Mutex<Vec<String>>>) -> Self {
        TestJob {
            name: name.to_string(),
            deps: deps.iter().map(|s| s.to_string()).collect(),
            should_run: ShouldRun::Run,
            fail_with: None,
            hang: false,
            ran,
        }
    }
}

#[async_trait]
impl Job for TestJob {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn dependencies(&self) -> Result<Vec<String>, String> {
        Ok(self.deps.clone())
    }

    async fn should_run(&self) -> eyre::Result<ShouldRun> {
        Ok(self.should_run.clone())
    }

    async fn run(&self, cancel: CancellationToken) -> eyre::Result<()> {
        if self.hang {
            cancel.cancelled().await;
            return Err(eyre::eyre!("interrupted"));
        }
        self.ran.lock().unwrap().push(self.name.clone());
        if let Some(message) = &self.fail_with {
            return Err(eyre::eyre!("{message}"));
        }
        Ok(())
    }
}

fn jobs_to_dyn(jobs: Vec<TestJob>) -> Vec<Arc<dyn Job>> {
    jobs.into_iter()
        .map(|j| Arc::new(j) as Arc<dyn Job>)
        .collect()
}

#[tokio::test]
async fn serial_run_respects_dependency_order() {
    let ran = Arc::new(Mutex::new(Vec::new()));
    let jobs = jobs_to_dyn(vec![
        TestJob::new("a", &[], ran.clone()),
        TestJob::new("b", &["a"], ran.clone()),
    ]);
    let recorder = Arc::new(Recorder::default());

    let summary = Executor::new(1)
        .run(
            jobs,
            &["b".to_string()],
            CancellationToken::new(),
            recorder.clone(),
        )
        .await
        .unwrap();

    assert!(summary.success());
    assert_eq!(*ran.lock().unwrap(), vec!["a", "b"]);
    assert_eq!(
        recorder.events(),
        vec![
            Event::Queued { job: "a".into() },
            Event::Queued { job: "b".into() },
            Event::Started { job: "a".into() },
            Event::Finished {
                job: "a".into(),
                cached: false
            },
            Event::Started { job: "b".into() },
            Event::Finished {
                job: "b".into(),
                cached: false
            },
        ]
    );
}

#[tokio::test]
async fn cached_job_skips_without_starting() {
    let ran = Arc::new(Mutex::new(Vec::new()));
    let mut job = TestJob::new("foo", &[], ran.clone());
    job.should_run = ShouldRun::SkipCached;
    let recorder = Arc::new(Recorder::default());

    let summary = Executor::new(2)
        .run(
            jobs_to_dyn(vec![job]),
            &["foo".to_string()],
            CancellationToken::new(),
            recorder.clone(),
        )
        .await
        .unwrap();

    assert!(summary.success());
    assert_eq!(summary.cached, 1);
    assert!(ran.lock().unwrap().is_empty());
    assert!(!recorder
        .events()
        .iter()
        .any(|e| matches!(e, Event::Started { .. })));
}

#[tokio::test]
async fn cached_failure_is_terminal_and_poisons() {
    let ran = Arc::new(Mutex::new(Vec::new()));
    let mut bad = TestJob::new("bad", &[], ran.clone());
    bad.should_run = ShouldRun::FailCached("previous failure".to_string());
    let dependent = TestJob::new("dependent", &["bad"], ran.clone());
    let recorder = Arc::new(Recorder::default());

    let summary = Executor::new(2)
        .run(
            jobs_to_dyn(vec![bad, dependent]),
            &["dependent".to_string()],
            CancellationToken::new(),
            recorder.clone(),
        )
        .await
        .unwrap();

    assert_eq!(summary.errored.len(), 2);
    assert!(ran.lock().unwrap().is_empty());
    let errors: Vec<_> = recorder
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Errored { job, error } => Some((job, error)),
            _ => None,
        })
        .collect();
    assert_eq!(errors[0].0, "bad");
    assert!(matches!(errors[0].1, ExecError::CachedFailure(_)));
    assert_eq!(errors[1].0, "dependent");
    assert!(matches!(errors[1].1, ExecError::DependencyFailed { .. }));
}

#[tokio::test]
async fn failure_poisons_transitive_dependents() {
    let ran = Arc::new(Mutex::new(Vec::new()));
    let mut a = TestJob::new("a", &[], ran.clone());
    a.fail_with = Some("boom".to_string());
    let b = TestJob::new("b", &["a"], ran.clone());
    let c = TestJob::new("c", &["b"], ran.clone());
    let recorder = Arc::new(Recorder::default());

    let summary = Executor::new(4)
        .run(
            jobs_to_dyn(vec![a, b, c]),
            &["c".to_string()],
            CancellationToken::new(),
            recorder.clone(),
        )
        .await
        .unwrap();

    assert_eq!(summary.errored.len(), 3);
    // a ran (and failed); b and c never did
    assert_eq!(*ran.lock().unwrap(), vec!["a"]);
}

#[tokio::test]
async fn sibling_continues_after_unrelated_failure() {
    let ran = Arc::new(Mutex::new(Vec::new()));
    let mut a = TestJob::new("a", &[], ran.clone());
    a.fail_with = Some("boom".to_string());
    let b = TestJob::new("b", &[], ran.clone());
    let recorder = Arc::new(Recorder::default());

    let summary = Executor::new(1)
        .run(
            jobs_to_dyn(vec![a, b]),
            &["a".to_string(), "b".to_string()],
            CancellationToken::new(),
            recorder.clone(),
        )
        .await
        .unwrap();

    assert_eq!(summary.errored.len(), 1);
    assert_eq!(summary.built, 1);
    assert!(ran.lock().unwrap().contains(&"b".to_string()));
}

#[tokio::test]
async fn unknown_target_is_a_startup_error() {
    let result = Executor::new(1)
        .run(
            Vec::new(),
            &["missing".to_string()],
            CancellationToken::new(),
            Arc::new(NullSink),
        )
        .await;
    assert!(matches!(result, Err(ExecError::UnknownJob(_))));
}

#[tokio::test]
async fn unknown_dependency_fails_the_dependent() {
    let ran = Arc::new(Mutex::new(Vec::new()));
    let job = TestJob::new("a", &["ghost"], ran.clone());
    let recorder = Arc::new(Recorder::default());

    let summary = Executor::new(1)
        .run(
            jobs_to_dyn(vec![job]),
            &["a".to_string()],
            CancellationToken::new(),
            recorder.clone(),
        )
        .await
        .unwrap();

    assert_eq!(summary.errored.len(), 1);
    assert!(matches!(summary.errored[0].1, ExecError::UnknownJob(_)));
    assert!(ran.lock().unwrap().is_empty());
}

#[tokio::test]
async fn cycle_is_rejected() {
    let ran = Arc::new(Mutex::new(Vec::new()));
    let a = TestJob::new("a", &["b"], ran.clone());
    let b = TestJob::new("b", &["a"], ran.clone());

    let result = Executor::new(1)
        .run(
            jobs_to_dyn(vec![a, b]),
            &["a".to_string()],
            CancellationToken::new(),
            Arc::new(NullSink),
        )
        .await;
    assert!(matches!(result, Err(ExecError::Cycle(_))));
}

#[tokio::test]
async fn cancellation_reaches_running_and_pending_jobs() {
    let ran = Arc::new(Mutex::new(Vec::new()));
    let mut slow = TestJob::new("slow", &[], ran.clone());
    slow.hang = true;
    let waiting = TestJob::new("waiting", &["slow"], ran.clone());
    let recorder = Arc::new(Recorder::default());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let summary = Executor::new(2)
        .run(
            jobs_to_dyn(vec![slow, waiting]),
            &["waiting".to_string()],
            cancel,
            recorder.clone(),
        )
        .await
        .unwrap();

    assert_eq!(summary.errored.len(), 2);
    assert!(summary
        .errored
        .iter()
        .any(|(job, error)| job == "waiting" && *error == ExecError::Cancelled));
}

#[tokio::test]
async fn captured_dependency_error_surfaces_at_dequeue() {
    struct BrokenJob;

    #[async_trait]
    impl Job for BrokenJob {
        fn name(&self) -> String {
            "broken".to_string()
        }

        fn dependencies(&self) -> Result<Vec<String>, String> {
            Err("template error in script: unknown helper".to_string())
        }

        async fn should_run(&self) -> eyre::Result<ShouldRun> {
            panic!("must not be consulted");
        }

        async fn run(&self, _cancel: CancellationToken) -> eyre::Result<()> {
            panic!("must not run");
        }
    }

    let recorder = Arc::new(Recorder::default());
    let summary = Executor::new(1)
        .run(
            vec![Arc::new(BrokenJob) as Arc<dyn Job>],
            &["broken".to_string()],
            CancellationToken::new(),
            recorder.clone(),
        )
        .await
        .unwrap();

    assert_eq!(summary.errored.len(), 1);
    assert!(matches!(summary.errored[0].1, ExecError::Failed(_)));
}
