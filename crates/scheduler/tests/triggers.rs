use std::sync::Arc;
use std::time::Duration;

use autoflow_engine::{
    CredentialVault, EngineSettings, ExecutionEngine, ExecutionRecorder, LogicProvider, MemoryCredentialRepository, MemoryPlanRepository,
    MemoryRecorder, ProviderRegistry,
};
use autoflow_scheduler::{EngineDispatcher, FileJobStore, JobStore, MemoryJobStore, Scheduler, WebhookRouter, WebhookServer, sync_plan_trigger};
use autoflow_types::{Execution, ExecutionPlan, ExecutionStatus, RunSource};
use autoflow_util::{KEY_SIZE, SchedulerSettings, SecretCipher};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{Value, json};
use uuid::Uuid;

struct Stack {
    plans: Arc<MemoryPlanRepository>,
    recorder: Arc<MemoryRecorder>,
    dispatcher: Arc<EngineDispatcher>,
}

fn stack() -> Stack {
    let registry = Arc::new(ProviderRegistry::new());
    registry.register("logic", Arc::new(LogicProvider));
    let recorder = Arc::new(MemoryRecorder::new());
    let cipher = SecretCipher::new(&[3u8; KEY_SIZE]).expect("cipher");
    let credentials = Arc::new(CredentialVault::new(MemoryCredentialRepository::new(), cipher));
    let engine = ExecutionEngine::new(registry, credentials, recorder.clone(), EngineSettings::default());
    let plans = Arc::new(MemoryPlanRepository::new());
    let dispatcher = Arc::new(EngineDispatcher::new(engine, plans.clone()));
    Stack {
        plans,
        recorder,
        dispatcher,
    }
}

fn plan(id: &str, trigger: Value, enabled: bool) -> ExecutionPlan {
    serde_json::from_value(json!({
        "id": id,
        "user_id": "u1",
        "status": "approved",
        "enabled": enabled,
        "trigger": trigger,
        "steps": [
            {"order": 1, "provider": "logic", "action": "echo", "params": {"value": "${trigger}"}}
        ]
    }))
    .expect("plan")
}

async fn wait_for_finish(recorder: &MemoryRecorder, execution_id: Uuid) -> Execution {
    for _ in 0..200 {
        if let Some(execution) = recorder.execution(execution_id).await.expect("lookup")
            && execution.status.is_terminal()
        {
            return execution;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("execution {execution_id} did not finish");
}

#[tokio::test]
async fn webhook_request_runs_the_bound_plan() {
    let stack = stack();
    let store = Arc::new(MemoryJobStore::new());
    let hooked = plan("on-order", json!({"type": "webhook", "path": "/orders/created"}), true);
    stack.plans.upsert(hooked.clone());
    sync_plan_trigger(store.as_ref(), &hooked, Utc::now()).await.expect("sync");

    let router = WebhookRouter::new(store, stack.dispatcher.clone());
    let server = WebhookServer::new("127.0.0.1:0".parse().expect("addr"), router)
        .start()
        .await
        .expect("start");
    let base = format!("http://{}", server.bound_address());
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/hooks/orders/created"))
        .json(&json!({"order_id": 7}))
        .send()
        .await
        .expect("send");
    assert_eq!(response.status().as_u16(), 202);
    let body: Value = response.json().await.expect("body");
    let execution_id: Uuid = serde_json::from_value(body["execution_id"].clone()).expect("execution id");

    let execution = wait_for_finish(&stack.recorder, execution_id).await;
    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(execution.source, RunSource::Webhook);
    let logs = stack.recorder.logs(execution_id).await.expect("logs");
    assert_eq!(logs[0].output_preview.as_deref(), Some(r#"{"order_id":7}"#));

    let missing = client.post(format!("{base}/hooks/unknown")).send().await.expect("send");
    assert_eq!(missing.status().as_u16(), 404);

    server.stop().await.expect("stop");
}

#[tokio::test]
async fn webhook_for_a_disabled_plan_is_a_conflict() {
    let stack = stack();
    let store = Arc::new(MemoryJobStore::new());
    let hooked = plan("on-order", json!({"type": "webhook", "path": "orders"}), true);
    sync_plan_trigger(store.as_ref(), &hooked, Utc::now()).await.expect("sync");
    let mut disabled = hooked;
    disabled.enabled = false;
    stack.plans.upsert(disabled);

    let router = WebhookRouter::new(store, stack.dispatcher.clone());
    let server = WebhookServer::new("127.0.0.1:0".parse().expect("addr"), router)
        .start()
        .await
        .expect("start");

    let response = reqwest::Client::new()
        .post(format!("http://{}/hooks/orders", server.bound_address()))
        .body("ping")
        .send()
        .await
        .expect("send");
    assert_eq!(response.status().as_u16(), 409);
    assert!(stack.recorder.executions_for_user("u1").await.expect("runs").is_empty());

    server.stop().await.expect("stop");
}

#[tokio::test]
async fn restarted_scheduler_runs_overdue_jobs_immediately() {
    let dir = tempfile::tempdir().expect("tempdir");
    let jobs_path = dir.path().join("jobs.json");
    let stack = stack();
    let scheduled = plan("every-minute", json!({"type": "schedule", "cron": "* * * * *"}), true);
    stack.plans.upsert(scheduled.clone());
    {
        let store = FileJobStore::open(&jobs_path).expect("open");
        sync_plan_trigger(&store, &scheduled, Utc::now() - ChronoDuration::minutes(10))
            .await
            .expect("sync");
    }

    let store: Arc<dyn JobStore> = Arc::new(FileJobStore::open(&jobs_path).expect("reopen"));
    let settings = SchedulerSettings {
        sweep_interval_secs: 3600,
        lease_ttl_secs: 3600,
    };
    let running = Scheduler::new(store.clone(), stack.dispatcher.clone(), settings)
        .start()
        .await
        .expect("start");

    let mut executions = Vec::new();
    for _ in 0..200 {
        executions = stack.recorder.executions_for_user("u1").await.expect("runs");
        if executions.iter().any(|execution| execution.status.is_terminal()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    running.stop().await.expect("stop");

    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].source, RunSource::Schedule);
    assert_eq!(executions[0].status, ExecutionStatus::Success);
    let job = store.job_for_plan("every-minute").await.expect("lookup").expect("job");
    assert!(job.next_run_at.is_some_and(|next| next > Utc::now() - ChronoDuration::seconds(1)));
    assert!(job.last_run_at.is_some());
}
