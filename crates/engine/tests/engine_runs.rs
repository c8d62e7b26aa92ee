use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use autoflow_engine::{
    CredentialStore, CredentialVault, Credentials, EngineError, EngineSettings, ExecutionEngine, ExecutionRecorder, LogicProvider,
    MemoryCredentialRepository, MemoryRecorder, ProviderHandler, ProviderRegistry, RetryPolicy,
};
use autoflow_types::{
    ExecutionErrorCode, ExecutionLog, ExecutionPlan, ExecutionStatus, LogStatus, ProviderErrorKind, ProviderResult, RunSource,
};
use autoflow_util::{KEY_SIZE, SecretCipher};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tokio::sync::Notify;

/// Provider double that replays a script of results, then a fallback.
struct Scripted {
    script: Mutex<VecDeque<ProviderResult>>,
    fallback: ProviderResult,
    calls: Mutex<Vec<(String, Map<String, Value>)>>,
    required: Vec<String>,
    delay: Option<Duration>,
}

impl Scripted {
    fn new(fallback: ProviderResult) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: Mutex::new(Vec::new()),
            required: Vec::new(),
            delay: None,
        }
    }

    fn ok(output: Value) -> Self {
        Self::new(ProviderResult::ok(output, "ok"))
    }

    fn script(self, results: Vec<ProviderResult>) -> Self {
        *self.script.lock() = results.into();
        self
    }

    fn requiring(mut self, kind: &str) -> Self {
        self.required.push(kind.to_string());
        self
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn calls(&self) -> Vec<(String, Map<String, Value>)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ProviderHandler for Scripted {
    async fn invoke(&self, action: &str, params: &Map<String, Value>, _credentials: &Credentials) -> ProviderResult {
        self.calls.lock().push((action.to_string(), params.clone()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }

    fn required_credentials(&self, _action: &str) -> Vec<String> {
        self.required.clone()
    }
}

struct Harness {
    engine: ExecutionEngine,
    registry: Arc<ProviderRegistry>,
    recorder: Arc<MemoryRecorder>,
    vault: Arc<CredentialVault<MemoryCredentialRepository>>,
}

impl Harness {
    fn new() -> Self {
        let registry = Arc::new(ProviderRegistry::new());
        registry.register("logic", Arc::new(LogicProvider));
        let recorder = Arc::new(MemoryRecorder::new());
        let cipher = SecretCipher::new(&[5u8; KEY_SIZE]).expect("cipher");
        let vault = Arc::new(CredentialVault::new(MemoryCredentialRepository::new(), cipher));
        let settings = EngineSettings {
            retry: RetryPolicy {
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
                ..RetryPolicy::default()
            },
            provider_timeout: Duration::from_secs(5),
            preview_chars: 200,
        };
        let engine = ExecutionEngine::new(registry.clone(), vault.clone(), recorder.clone(), settings);
        Self {
            engine,
            registry,
            recorder,
            vault,
        }
    }

    fn register(&self, key: &str, provider: Scripted) -> Arc<Scripted> {
        let provider = Arc::new(provider);
        self.registry.register(key, provider.clone());
        provider
    }

    async fn logs(&self, execution_id: uuid::Uuid) -> Vec<ExecutionLog> {
        self.recorder.logs(execution_id).await.expect("logs")
    }
}

fn plan(steps: Value) -> ExecutionPlan {
    serde_json::from_value(json!({
        "id": "plan-1",
        "user_id": "u1",
        "status": "approved",
        "steps": steps,
    }))
    .expect("plan")
}

fn transient(error: &str) -> ProviderResult {
    ProviderResult::failure(ProviderErrorKind::Transient, error)
}

fn statuses(logs: &[ExecutionLog]) -> Vec<(u32, LogStatus)> {
    logs.iter().map(|log| (log.step_number, log.status)).collect()
}

#[tokio::test]
async fn all_steps_succeed() {
    let harness = Harness::new();
    let plan = plan(json!([
        {"order": 1, "provider": "logic", "action": "echo", "params": {"value": 1}},
        {"order": 2, "provider": "logic", "action": "echo", "params": {"value": "${steps.1.output}"}},
        {"order": 3, "provider": "logic", "action": "set", "params": {"sum": "${steps.2.output}"}}
    ]));

    let execution = harness.engine.run(&plan, json!({}), RunSource::Manual).await.expect("run");

    assert_eq!(execution.status, ExecutionStatus::Success);
    assert!(execution.started_at.is_some() && execution.finished_at.is_some());
    assert!(execution.error_message.is_none());
    let logs = harness.logs(execution.id).await;
    assert_eq!(
        statuses(&logs),
        vec![(1, LogStatus::Success), (2, LogStatus::Success), (3, LogStatus::Success)]
    );
    let stored = harness.recorder.execution(execution.id).await.expect("lookup").expect("stored");
    assert_eq!(stored, execution);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_until_success() {
    let harness = Harness::new();
    let flaky = harness.register(
        "flaky",
        Scripted::ok(json!({"done": true})).script(vec![transient("502 bad gateway"), transient("503 unavailable")]),
    );
    let plan = plan(json!([{"order": 1, "provider": "flaky", "action": "sync"}]));

    let execution = harness.engine.run(&plan, json!({}), RunSource::Manual).await.expect("run");

    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(flaky.calls().len(), 3);
    let logs = harness.logs(execution.id).await;
    let attempts: Vec<(u32, LogStatus)> = logs.iter().map(|log| (log.attempt, log.status)).collect();
    assert_eq!(
        attempts,
        vec![(1, LogStatus::Retrying), (2, LogStatus::Retrying), (3, LogStatus::Success)]
    );
    assert_eq!(logs[0].error.as_deref(), Some("502 bad gateway"));
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_fail_the_run_and_stop_later_steps() {
    let harness = Harness::new();
    harness.register("flaky", Scripted::new(transient("upstream timeout")));
    let later = harness.register("later", Scripted::ok(json!(null)));
    let plan = plan(json!([
        {"order": 1, "provider": "flaky", "action": "sync"},
        {"order": 2, "provider": "later", "action": "noop"}
    ]));

    let execution = harness.engine.run(&plan, json!({}), RunSource::Manual).await.expect("run");

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error_code, Some(ExecutionErrorCode::Provider));
    assert_eq!(execution.error_message.as_deref(), Some("upstream timeout"));
    assert!(later.calls().is_empty());
    let logs = harness.logs(execution.id).await;
    assert_eq!(
        statuses(&logs),
        vec![(1, LogStatus::Retrying), (1, LogStatus::Retrying), (1, LogStatus::Error)]
    );
    assert_eq!(logs.last().and_then(|log| log.error.as_deref()), Some("upstream timeout"));
    assert_eq!(logs.last().and_then(|log| log.error.clone()), execution.error_message);
}

#[tokio::test]
async fn failure_message_matches_the_redacted_log_row() {
    let harness = Harness::new();
    harness.register(
        "crm",
        Scripted::new(ProviderResult::failure(ProviderErrorKind::Rejected, "HTTP 400: API_KEY=sk-live-123 rejected")),
    );
    let plan = plan(json!([{"order": 1, "provider": "crm", "action": "create"}]));

    let execution = harness.engine.run(&plan, json!({}), RunSource::Manual).await.expect("run");

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let message = execution.error_message.clone().unwrap_or_default();
    assert!(!message.contains("sk-live-123"), "secret leaked: {message}");
    assert!(message.contains("<redacted>"));
    let logs = harness.logs(execution.id).await;
    assert_eq!(logs.last().and_then(|log| log.error.clone()), execution.error_message);
}

#[tokio::test]
async fn forward_reference_is_a_resolution_failure() {
    let harness = Harness::new();
    let target = harness.register("crm", Scripted::ok(json!({})));
    let plan = plan(json!([
        {"order": 1, "provider": "logic", "action": "echo"},
        {"order": 2, "provider": "crm", "action": "update", "params": {"id": "${steps.3.output.id}"}},
        {"order": 3, "provider": "logic", "action": "echo", "params": {"value": {"id": 1}}}
    ]));

    let execution = harness.engine.run(&plan, json!({}), RunSource::Manual).await.expect("run");

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error_code, Some(ExecutionErrorCode::Resolution));
    assert!(execution.error_message.as_deref().unwrap_or_default().contains("steps.3.output.id"));
    assert!(target.calls().is_empty());
    let logs = harness.logs(execution.id).await;
    assert_eq!(statuses(&logs), vec![(1, LogStatus::Success), (2, LogStatus::Error)]);
    assert_eq!(logs[1].attempt, 0);
}

#[tokio::test]
async fn step_output_feeds_the_next_request() {
    let harness = Harness::new();
    let http = harness.register("http", Scripted::ok(json!({"created": true})).script(vec![ProviderResult::ok(json!({"id": 42}), "")]));
    let plan = plan(json!([
        {"order": 1, "provider": "http", "action": "get", "params": {"url": "https://x"}},
        {"order": 2, "provider": "http", "action": "post", "params": {"body": "${steps.1.output.id}"}}
    ]));

    let execution = harness.engine.run(&plan, json!({}), RunSource::Manual).await.expect("run");

    assert_eq!(execution.status, ExecutionStatus::Success);
    let calls = http.calls();
    assert_eq!(calls[0].1.get("url"), Some(&json!("https://x")));
    assert_eq!(calls[1].0, "post");
    assert_eq!(calls[1].1.get("body"), Some(&json!(42)));
}

#[tokio::test]
async fn expired_credential_fails_without_invoking_the_provider() {
    let harness = Harness::new();
    let crm = harness.register("crm", Scripted::ok(json!({})).requiring("api_key"));
    harness
        .vault
        .store("u1", "crm", "api_key", "k-1", Some(Utc::now() - chrono::Duration::hours(1)))
        .expect("store");
    let plan = plan(json!([{"order": 1, "provider": "crm", "action": "list"}]));

    let execution = harness.engine.run(&plan, json!({}), RunSource::Manual).await.expect("run");

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error_code, Some(ExecutionErrorCode::Credential));
    assert!(execution.error_message.as_deref().unwrap_or_default().contains("reconnect crm"));
    assert!(crm.calls().is_empty());
    let logs = harness.logs(execution.id).await;
    assert_eq!(statuses(&logs), vec![(1, LogStatus::Error)]);
}

#[tokio::test]
async fn expired_credential_blocks_providers_that_declare_nothing() {
    let harness = Harness::new();
    let crm = harness.register("crm", Scripted::ok(json!({})));
    harness
        .vault
        .store("u1", "crm", "api_key", "k-1", Some(Utc::now() - chrono::Duration::hours(1)))
        .expect("store");
    let plan = plan(json!([
        {"order": 1, "provider": "crm", "action": "list"},
        {"order": 2, "provider": "logic", "action": "echo"}
    ]));

    let execution = harness.engine.run(&plan, json!({}), RunSource::Manual).await.expect("run");

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error_code, Some(ExecutionErrorCode::Credential));
    assert!(crm.calls().is_empty());
    let logs = harness.logs(execution.id).await;
    assert_eq!(statuses(&logs), vec![(1, LogStatus::Error)]);
    assert_eq!(logs[0].attempt, 0);
}

#[tokio::test]
async fn authentication_failure_invalidates_supplied_credentials() {
    let harness = Harness::new();
    let crm = harness.register(
        "crm",
        Scripted::new(ProviderResult::failure(ProviderErrorKind::Authentication, "HTTP 401: token revoked")).requiring("api_key"),
    );
    harness.vault.store("u1", "crm", "api_key", "k-1", None).expect("store");
    let plan = plan(json!([{"order": 1, "provider": "crm", "action": "list"}]));

    let execution = harness.engine.run(&plan, json!({}), RunSource::Manual).await.expect("run");

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error_code, Some(ExecutionErrorCode::Credential));
    assert_eq!(crm.calls().len(), 1);
    assert!(harness.vault.usable("u1", "crm").expect("usable").is_empty());
}

#[tokio::test]
async fn false_condition_skips_guarded_steps() {
    let harness = Harness::new();
    let guarded = harness.register("notify", Scripted::ok(json!({})));
    let plan = plan(json!([
        {"order": 1, "provider": "logic", "action": "echo", "params": {"value": {"ok": false}}},
        {"order": 2, "type": "condition", "params": {"expression": "steps.1.output.ok == true"}},
        {"order": 3, "provider": "notify", "action": "send"},
        {"order": 4, "provider": "logic", "action": "echo", "params": {"value": "${steps.2.output}"}}
    ]));

    let execution = harness.engine.run(&plan, json!({}), RunSource::Manual).await.expect("run");

    assert_eq!(execution.status, ExecutionStatus::Success);
    assert!(guarded.calls().is_empty());
    let logs = harness.logs(execution.id).await;
    assert_eq!(
        statuses(&logs),
        vec![
            (1, LogStatus::Success),
            (2, LogStatus::Success),
            (3, LogStatus::Skipped),
            (4, LogStatus::Success)
        ]
    );
    assert_eq!(logs[1].output_preview.as_deref(), Some("false"));
    assert_eq!(logs[3].output_preview.as_deref(), Some("false"));
}

#[tokio::test]
async fn loop_runs_its_body_once_per_item() {
    let harness = Harness::new();
    let mailer = harness.register("mailer", Scripted::ok(json!({"sent": true})));
    let report = harness.register("report", Scripted::ok(json!({})));
    let plan = plan(json!([
        {"order": 1, "provider": "logic", "action": "echo", "params": {"value": [{"email": "a@x.io"}, {"email": "b@x.io"}]}},
        {"order": 2, "type": "loop", "params": {"items": "${steps.1.output}"}},
        {"order": 3, "provider": "mailer", "action": "send", "params": {"to": "${loop.item.email}", "position": "${loop.index}"}},
        {"order": 4, "provider": "report", "action": "write", "params": {"second": "${steps.2.output.1}", "count": "${steps.3.output}"}}
    ]));

    let execution = harness.engine.run(&plan, json!({}), RunSource::Manual).await.expect("run");

    assert_eq!(execution.status, ExecutionStatus::Success);
    let sent: Vec<(Value, Value)> = mailer
        .calls()
        .into_iter()
        .map(|(_, params)| (params["to"].clone(), params["position"].clone()))
        .collect();
    assert_eq!(sent, vec![(json!("a@x.io"), json!(0)), (json!("b@x.io"), json!(1))]);
    let written = &report.calls()[0].1;
    assert_eq!(written["second"], json!({"sent": true}));
    assert_eq!(written["count"], json!([{"sent": true}, {"sent": true}]));
    let logs = harness.logs(execution.id).await;
    assert_eq!(
        statuses(&logs),
        vec![
            (1, LogStatus::Success),
            (2, LogStatus::Success),
            (3, LogStatus::Success),
            (3, LogStatus::Success),
            (4, LogStatus::Success)
        ]
    );
}

#[tokio::test]
async fn failing_loop_iteration_aborts_remaining_items() {
    let harness = Harness::new();
    let worker = harness.register(
        "worker",
        Scripted::ok(json!({})).script(vec![
            ProviderResult::ok(json!(1), ""),
            ProviderResult::failure(ProviderErrorKind::Rejected, "item rejected"),
        ]),
    );
    let plan = plan(json!([
        {"order": 1, "type": "loop", "params": {"items": [1, 2, 3]}},
        {"order": 2, "provider": "worker", "action": "process", "params": {"n": "${loop.item}"}}
    ]));

    let execution = harness.engine.run(&plan, json!({}), RunSource::Manual).await.expect("run");

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error_message.as_deref(), Some("item rejected"));
    assert_eq!(worker.calls().len(), 2);
}

#[tokio::test]
async fn optional_step_failure_does_not_fail_the_run() {
    let harness = Harness::new();
    harness.register("flaky", Scripted::new(ProviderResult::failure(ProviderErrorKind::Rejected, "bad request")));
    let plan = plan(json!([
        {"order": 1, "provider": "flaky", "action": "ping", "on_error": {"continue_on_failure": true}},
        {"order": 2, "provider": "logic", "action": "echo", "params": {"value": "after"}}
    ]));

    let execution = harness.engine.run(&plan, json!({}), RunSource::Manual).await.expect("run");

    assert_eq!(execution.status, ExecutionStatus::Success);
    let logs = harness.logs(execution.id).await;
    assert_eq!(statuses(&logs), vec![(1, LogStatus::Error), (2, LogStatus::Success)]);
}

#[tokio::test(start_paused = true)]
async fn slow_provider_times_out() {
    let harness = Harness::new();
    harness.register("slow", Scripted::ok(json!({})).delayed(Duration::from_secs(10)));
    let plan = plan(json!([
        {"order": 1, "provider": "slow", "action": "wait", "on_error": {"max_attempts": 1, "timeout_ms": 500}}
    ]));

    let execution = harness.engine.run(&plan, json!({}), RunSource::Manual).await.expect("run");

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let logs = harness.logs(execution.id).await;
    assert_eq!(statuses(&logs), vec![(1, LogStatus::Timeout)]);
}

#[tokio::test]
async fn unregistered_provider_is_a_configuration_failure() {
    let harness = Harness::new();
    let plan = plan(json!([{"order": 1, "provider": "missing", "action": "run"}]));

    let execution = harness.engine.run(&plan, json!({}), RunSource::Manual).await.expect("run");

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error_code, Some(ExecutionErrorCode::Configuration));
    assert_eq!(statuses(&harness.logs(execution.id).await), vec![(1, LogStatus::Error)]);
}

#[tokio::test]
async fn malformed_plan_fails_before_any_step() {
    let harness = Harness::new();
    let first = harness.register("first", Scripted::ok(json!({})));
    let plan = plan(json!([
        {"order": 1, "provider": "first", "action": "run"},
        {"order": 3, "provider": "first", "action": "run"}
    ]));

    let execution = harness.engine.run(&plan, json!({}), RunSource::Manual).await.expect("run");

    assert_eq!(execution.error_code, Some(ExecutionErrorCode::Configuration));
    assert!(first.calls().is_empty());
    assert!(harness.logs(execution.id).await.is_empty());
}

#[tokio::test]
async fn disabled_or_unapproved_plans_are_rejected() {
    let harness = Harness::new();
    let mut plan = plan(json!([{"order": 1, "provider": "logic", "action": "echo"}]));
    plan.enabled = false;

    let error = harness.engine.run(&plan, json!({}), RunSource::Schedule).await.expect_err("rejected");
    assert!(matches!(error, EngineError::NotRunnable { .. }));
    assert!(harness.recorder.executions_for_user("u1").await.expect("runs").is_empty());
}

#[derive(Default)]
struct Gate {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl ProviderHandler for Gate {
    async fn invoke(&self, _action: &str, _params: &Map<String, Value>, _credentials: &Credentials) -> ProviderResult {
        self.entered.notify_one();
        self.release.notified().await;
        ProviderResult::ok(json!({}), "released")
    }
}

#[tokio::test]
async fn cancellation_stops_the_run_before_the_next_step() {
    let harness = Harness::new();
    let gate = Arc::new(Gate::default());
    harness.registry.register("gate", gate.clone());
    let after = harness.register("after", Scripted::ok(json!({})));
    let plan = plan(json!([
        {"order": 1, "provider": "gate", "action": "hold"},
        {"order": 2, "provider": "after", "action": "run"}
    ]));

    let handle = harness.engine.spawn(plan, json!({}), RunSource::Manual).await.expect("spawn");
    gate.entered.notified().await;
    assert!(harness.engine.cancel(handle.execution_id));
    gate.release.notify_one();
    let execution = handle.wait().await.expect("finished");

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error_code, Some(ExecutionErrorCode::Cancelled));
    assert!(after.calls().is_empty());
    assert!(!harness.engine.cancel(execution.id));
    assert!(harness.engine.active_runs().is_empty());
}

#[tokio::test]
async fn monitor_reports_run_lifecycle() {
    let harness = Harness::new();
    let mut events = harness.engine.monitor().subscribe();
    let plan = plan(json!([{"order": 1, "provider": "logic", "action": "echo"}]));

    let execution = harness.engine.run(&plan, json!({}), RunSource::Manual).await.expect("run");

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(autoflow_engine::RunEvent::RunStarted { .. })));
    assert!(matches!(
        seen.last(),
        Some(autoflow_engine::RunEvent::RunFinished { status: ExecutionStatus::Success, .. })
    ));
    assert!(seen.iter().all(|event| event.execution_id() == execution.id));
}
