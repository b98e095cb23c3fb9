//! Saga orchestration: success with checkpoint restore, retry with
//! backoff, reverse-order compensation and compensation-failure isolation.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use strata_core::saga::{ActionError, SagaContext};
use strata_core::{
    Clock, ManualClock, MemoryKvStore, SagaAction, SagaConfig, SagaOrchestrator, SagaOutcome,
    SagaState, SagaStep, StepStatus,
};

/// Scriptable action: succeeds `fail_times` attempts in, records every
/// execution and compensation in a shared journal.
struct ScriptedAction {
    name: String,
    journal: Arc<Mutex<Vec<String>>>,
    fail_times: u32,
    attempts: AtomicU32,
    compensable: bool,
    fail_compensation: bool,
    result: Value,
}

impl ScriptedAction {
    fn ok(name: &str, journal: Arc<Mutex<Vec<String>>>, result: Value) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            journal,
            fail_times: 0,
            attempts: AtomicU32::new(0),
            compensable: false,
            fail_compensation: false,
            result,
        })
    }

    fn compensable(name: &str, journal: Arc<Mutex<Vec<String>>>, result: Value) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            journal,
            fail_times: 0,
            attempts: AtomicU32::new(0),
            compensable: true,
            fail_compensation: false,
            result,
        })
    }

    fn failing(name: &str, journal: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            journal,
            fail_times: u32::MAX,
            attempts: AtomicU32::new(0),
            compensable: false,
            fail_compensation: false,
            result: Value::Null,
        })
    }
}

#[async_trait]
impl SagaAction for ScriptedAction {
    async fn execute(&self, _ctx: &SagaContext) -> Result<Value, ActionError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        self.journal
            .lock()
            .unwrap()
            .push(format!("exec:{}", self.name));
        if attempt < self.fail_times {
            return Err(format!("{} blew up", self.name).into());
        }
        Ok(self.result.clone())
    }

    async fn compensate(&self, _result: &Value) -> Result<(), ActionError> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("comp:{}", self.name));
        if self.fail_compensation {
            return Err(format!("{} compensation blew up", self.name).into());
        }
        Ok(())
    }

    fn has_compensation(&self) -> bool {
        self.compensable
    }
}

fn harness() -> (Arc<MemoryKvStore>, Arc<ManualClock>, SagaConfig) {
    (
        Arc::new(MemoryKvStore::new()),
        Arc::new(ManualClock::starting_now()),
        SagaConfig::default(),
    )
}

#[tokio::test]
async fn all_steps_succeed_and_checkpoint_restores() {
    let (kv, clock, config) = harness();
    let journal = Arc::new(Mutex::new(Vec::new()));

    let steps = vec![
        SagaStep::new("s1", ScriptedAction::ok("s1", journal.clone(), json!({"a": 1}))),
        SagaStep::new("s2", ScriptedAction::ok("s2", journal.clone(), json!({"b": 2}))),
        SagaStep::new("s3", ScriptedAction::ok("s3", journal.clone(), json!({"c": 3}))),
    ];
    let mut saga = SagaOrchestrator::new(steps, config.clone(), kv.clone(), clock.clone());
    let saga_id = saga.saga_id().to_string();

    let report = saga.execute(None).await;
    assert_eq!(report.status, SagaOutcome::Completed);
    assert_eq!(report.completed_steps, 3);
    assert_eq!(report.results.len(), 3);
    assert_eq!(saga.state(), SagaState::Completed);

    // A fresh orchestrator with the same ordered step list restores the
    // checkpoint and sees the run as already completed.
    let fresh_steps = vec![
        SagaStep::new("s1", ScriptedAction::ok("s1", journal.clone(), json!({}))),
        SagaStep::new("s2", ScriptedAction::ok("s2", journal.clone(), json!({}))),
        SagaStep::new("s3", ScriptedAction::ok("s3", journal.clone(), json!({}))),
    ];
    let mut restored = SagaOrchestrator::new(fresh_steps, config, kv, clock);
    assert!(restored.restore_from_checkpoint(&saga_id).await.unwrap());
    assert_eq!(restored.state(), SagaState::Completed);
    assert_eq!(restored.status().completed_steps, 3);
    // Restored context carries the merged step results.
    assert_eq!(restored.status().saga_id, saga_id);
}

#[tokio::test]
async fn failing_step_compensates_in_reverse_order() {
    let (kv, clock, config) = harness();
    let journal = Arc::new(Mutex::new(Vec::new()));

    let s3 = ScriptedAction::failing("s3", journal.clone());
    let steps = vec![
        SagaStep::new("s1", ScriptedAction::compensable("s1", journal.clone(), json!({"u": 1}))),
        SagaStep::new("s2", ScriptedAction::compensable("s2", journal.clone(), json!({"v": 2}))),
        SagaStep::new("s3", s3.clone()).with_max_retries(3),
    ];
    let mut saga = SagaOrchestrator::new(steps, config, kv, clock);

    let report = saga.execute(None).await;
    assert_eq!(report.status, SagaOutcome::Failed);
    let error = report.error.unwrap();
    assert!(error.contains("s3"), "error should reference s3: {error}");

    // Action retried maxRetries+1 = 4 times.
    assert_eq!(s3.attempts.load(Ordering::SeqCst), 4);

    let entries = journal.lock().unwrap().clone();
    let comps: Vec<&String> = entries.iter().filter(|e| e.starts_with("comp:")).collect();
    assert_eq!(comps, vec!["comp:s2", "comp:s1"]);
    assert_eq!(saga.state(), SagaState::Failed);
    assert_eq!(report.compensated_steps, 2);
}

#[tokio::test]
async fn step_retries_then_succeeds_with_backoff() {
    let (kv, clock, config) = harness();
    let journal = Arc::new(Mutex::new(Vec::new()));

    let flaky = Arc::new(ScriptedAction {
        name: "flaky".to_string(),
        journal: journal.clone(),
        fail_times: 2,
        attempts: AtomicU32::new(0),
        compensable: false,
        fail_compensation: false,
        result: json!({"ok": true}),
    });
    let steps = vec![SagaStep::new("flaky", flaky.clone()).with_max_retries(3)];
    let mut saga = SagaOrchestrator::new(steps, config, kv, clock.clone());

    let before = clock.now();
    let report = saga.execute(None).await;
    assert_eq!(report.status, SagaOutcome::Completed);
    assert_eq!(flaky.attempts.load(Ordering::SeqCst), 3);
    // Two backoffs: 2^0 + 2^1 seconds, observed through the manual clock.
    assert_eq!((clock.now() - before).num_seconds(), 3);
    assert_eq!(saga.status().steps[0].retry_count, 2);
}

#[tokio::test]
async fn compensation_failure_does_not_stop_rollback() {
    let (kv, clock, config) = harness();
    let journal = Arc::new(Mutex::new(Vec::new()));

    let bad_comp = Arc::new(ScriptedAction {
        name: "s2".to_string(),
        journal: journal.clone(),
        fail_times: 0,
        attempts: AtomicU32::new(0),
        compensable: true,
        fail_compensation: true,
        result: json!({}),
    });
    let steps = vec![
        SagaStep::new("s1", ScriptedAction::compensable("s1", journal.clone(), json!({}))),
        SagaStep::new("s2", bad_comp),
        SagaStep::new("s3", ScriptedAction::failing("s3", journal.clone()))
            .with_max_retries(0),
    ];
    let mut saga = SagaOrchestrator::new(steps, config, kv, clock);

    let report = saga.execute(None).await;
    assert_eq!(report.status, SagaOutcome::Failed);

    let entries = journal.lock().unwrap().clone();
    let comps: Vec<&String> = entries.iter().filter(|e| e.starts_with("comp:")).collect();
    // s2's compensation failed but s1's still ran.
    assert_eq!(comps, vec!["comp:s2", "comp:s1"]);

    let status = saga.status();
    assert_eq!(status.steps[1].status, StepStatus::Compensating);
    assert!(status.steps[1]
        .error
        .as_deref()
        .unwrap()
        .contains("compensation failed"));
    assert_eq!(status.steps[0].status, StepStatus::Compensated);
}

#[tokio::test]
async fn step_results_merge_into_context() {
    let (kv, clock, config) = harness();
    let journal = Arc::new(Mutex::new(Vec::new()));

    struct ReadsContext {
        journal: Arc<Mutex<Vec<String>>>,
    }
    #[async_trait]
    impl SagaAction for ReadsContext {
        async fn execute(&self, ctx: &SagaContext) -> Result<Value, ActionError> {
            let user_id = ctx
                .get("user_id")
                .and_then(|v| v.as_u64())
                .ok_or("user_id missing from context")?;
            self.journal
                .lock()
                .unwrap()
                .push(format!("saw:{user_id}"));
            Ok(json!({"emailed": true}))
        }
    }

    let steps = vec![
        SagaStep::new(
            "create_user",
            ScriptedAction::ok("create_user", journal.clone(), json!({"user_id": 12345})),
        ),
        SagaStep::new(
            "send_email",
            Arc::new(ReadsContext {
                journal: journal.clone(),
            }),
        ),
    ];
    let mut saga = SagaOrchestrator::new(steps, config, kv, clock);
    let report = saga.execute(Some(SagaContext::new())).await;
    assert_eq!(report.status, SagaOutcome::Completed);
    assert!(journal.lock().unwrap().contains(&"saw:12345".to_string()));
}

#[tokio::test]
async fn restore_with_wrong_step_list_is_rejected() {
    let (kv, clock, config) = harness();
    let journal = Arc::new(Mutex::new(Vec::new()));

    let steps = vec![SagaStep::new(
        "only",
        ScriptedAction::ok("only", journal.clone(), json!({})),
    )];
    let mut saga = SagaOrchestrator::new(steps, config.clone(), kv.clone(), clock.clone());
    let saga_id = saga.saga_id().to_string();
    saga.execute(None).await;

    let other_steps = vec![SagaStep::new(
        "different",
        ScriptedAction::ok("different", journal, json!({})),
    )];
    let mut wrong = SagaOrchestrator::new(other_steps, config, kv, clock);
    assert!(wrong.restore_from_checkpoint(&saga_id).await.is_err());
}
