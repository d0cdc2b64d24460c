//! End-to-end scenarios against the full orchestrator facade: local agents
//! wired over the bus, real timers, real token buckets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cohort_bus::handler_fn;
use cohort_core::error::OrchestratorError;
use cohort_core::lifecycle::{AgentEvent, AgentState};
use cohort_core::protocol::AgentResponse;
use cohort_core::resources::{ResourceConfig, ResourceRequest};
use cohort_core::types::{AgentDescriptor, AgentId, AgentKind, StepId};
use cohort_core::workflow::{ExecutionStatus, FailureKind, StepStatus, Workflow, WorkflowStep};
use cohort_orchestrator::{Orchestrator, OrchestratorConfig, RegionSchedule};

async fn orchestrator() -> Arc<Orchestrator> {
    let orchestrator = Arc::new(
        Orchestrator::from_config(OrchestratorConfig::default())
            .await
            .unwrap(),
    );
    orchestrator.start().await.unwrap();
    orchestrator
}

async fn register_ready_agent(orchestrator: &Orchestrator, id: &str, kind: &str) -> AgentId {
    let descriptor = AgentDescriptor::new(id, AgentKind::new(kind)).with_id(id);
    orchestrator.register_agent(descriptor).await.unwrap();
    let agent_id = AgentId::new(id);
    orchestrator.activate_agent(&agent_id).unwrap();
    agent_id
}

fn step(id: &str, kind: &str, action: &str, deps: &[&str], timeout_ms: u64) -> WorkflowStep {
    let mut step =
        WorkflowStep::new(id, kind, action).timeout(Duration::from_millis(timeout_ms));
    for dep in deps {
        step = step.depends_on(*dep);
    }
    step
}

// ========== SCENARIO A: linear workflow ==========

#[tokio::test]
async fn scenario_a_linear_workflow() {
    let orchestrator = orchestrator().await;
    orchestrator
        .register_resource(ResourceConfig::per_second("compute", 2, 2))
        .await
        .unwrap();

    orchestrator
        .register_handler(
            "tokenize",
            handler_fn(|m| async move {
                AgentResponse::ok_json(&m, &serde_json::json!({"tokens": "7"}))
            }),
        )
        .await
        .unwrap();
    orchestrator
        .register_handler(
            "link",
            handler_fn(|m| async move {
                // The dependent step sees its predecessor's outputs.
                let payload = m.payload_json().unwrap_or_default();
                let tokens = payload
                    .get("s1.tokens")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                AgentResponse::ok_json(&m, &serde_json::json!({"linked": tokens}))
            }),
        )
        .await
        .unwrap();

    register_ready_agent(&orchestrator, "a1", "parse").await;
    register_ready_agent(&orchestrator, "a2", "build").await;

    let workflow = Workflow::new(
        "linear",
        vec![
            step("s1", "parse", "tokenize", &[], 1000),
            step("s2", "build", "link", &["s1"], 1000),
        ],
        HashMap::new(),
    )
    .unwrap();
    let workflow_id = orchestrator.define_workflow(workflow).await;

    let execution_id = orchestrator
        .execute(&workflow_id, HashMap::new(), None)
        .await
        .unwrap();
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.wait(&execution_id),
    )
    .await
    .expect("execution should finish")
    .unwrap();

    assert_eq!(result.status, ExecutionStatus::Succeeded);
    assert_eq!(result.variables["s1.tokens"], "7");
    assert_eq!(result.variables["s2.linked"], "7");

    // S2 started only after S1 completed.
    let s1 = &result.steps[&StepId::new("s1")];
    let s2 = &result.steps[&StepId::new("s2")];
    assert!(s2.started_at.unwrap() >= s1.finished_at.unwrap());

    orchestrator.stop().await.unwrap();
}

// ========== SCENARIO B: fan-out / fan-in ==========

#[tokio::test]
async fn scenario_b_fan_out_fan_in() {
    let orchestrator = orchestrator().await;
    orchestrator
        .register_resource(ResourceConfig::per_second("compute", 2, 2))
        .await
        .unwrap();

    let concurrent = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (now, high) = (concurrent.clone(), peak.clone());
    orchestrator
        .register_handler(
            "work",
            handler_fn(move |m| {
                let now = now.clone();
                let high = high.clone();
                async move {
                    let running = now.fetch_add(1, Ordering::SeqCst) + 1;
                    high.fetch_max(running, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    now.fetch_sub(1, Ordering::SeqCst);
                    AgentResponse::ok_json(&m, &serde_json::json!({"done": "yes"}))
                }
            }),
        )
        .await
        .unwrap();
    orchestrator
        .register_handler(
            "seed",
            handler_fn(|m| async move { AgentResponse::ok(&m, b"{}".to_vec()) }),
        )
        .await
        .unwrap();
    orchestrator
        .register_handler(
            "join",
            handler_fn(|m| async move { AgentResponse::ok(&m, b"{}".to_vec()) }),
        )
        .await
        .unwrap();

    register_ready_agent(&orchestrator, "w1", "worker").await;
    register_ready_agent(&orchestrator, "w2", "worker").await;

    let workflow = Workflow::new(
        "diamond",
        vec![
            step("s1", "worker", "seed", &[], 1000),
            step("s2", "worker", "work", &["s1"], 1000),
            step("s3", "worker", "work", &["s1"], 1000),
            step("s4", "worker", "join", &["s2", "s3"], 1000),
        ],
        HashMap::new(),
    )
    .unwrap();
    let workflow_id = orchestrator.define_workflow(workflow).await;
    let execution_id = orchestrator
        .execute(&workflow_id, HashMap::new(), None)
        .await
        .unwrap();
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.wait(&execution_id),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(result.status, ExecutionStatus::Succeeded);
    // Both branches ran concurrently under a two-token bucket.
    assert_eq!(peak.load(Ordering::SeqCst), 2);

    // Fan-in: s4 started after both branches finished.
    let s2 = &result.steps[&StepId::new("s2")];
    let s3 = &result.steps[&StepId::new("s3")];
    let s4 = &result.steps[&StepId::new("s4")];
    assert!(s4.started_at.unwrap() >= s2.finished_at.unwrap());
    assert!(s4.started_at.unwrap() >= s3.finished_at.unwrap());

    orchestrator.stop().await.unwrap();
}

// ========== SCENARIO C: resource starvation ==========

#[tokio::test]
async fn scenario_c_starvation_serializes_steps() {
    let orchestrator = orchestrator().await;
    orchestrator
        .register_resource(
            ResourceConfig::per_second("compute", 1, 0).burst(0),
        )
        .await
        .unwrap();

    let concurrent = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (now, high) = (concurrent.clone(), peak.clone());
    orchestrator
        .register_handler(
            "solo",
            handler_fn(move |m| {
                let now = now.clone();
                let high = high.clone();
                async move {
                    let running = now.fetch_add(1, Ordering::SeqCst) + 1;
                    high.fetch_max(running, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    now.fetch_sub(1, Ordering::SeqCst);
                    AgentResponse::ok(&m, b"{}".to_vec())
                }
            }),
        )
        .await
        .unwrap();

    register_ready_agent(&orchestrator, "w1", "worker").await;

    let workflow = Workflow::new(
        "independent",
        vec![
            step("s1", "worker", "solo", &[], 2000),
            step("s2", "worker", "solo", &[], 2000),
        ],
        HashMap::new(),
    )
    .unwrap();
    let workflow_id = orchestrator.define_workflow(workflow).await;
    let execution_id = orchestrator
        .execute(&workflow_id, HashMap::new(), None)
        .await
        .unwrap();
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.wait(&execution_id),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(result.status, ExecutionStatus::Succeeded);
    // One token, zero refill: the steps ran one at a time on released tokens.
    assert_eq!(peak.load(Ordering::SeqCst), 1);

    orchestrator.stop().await.unwrap();
}

// ========== SCENARIO D: step timeout ==========

#[tokio::test]
async fn scenario_d_step_timeout_blocks_dependents() {
    let orchestrator = orchestrator().await;
    orchestrator
        .register_resource(ResourceConfig::per_second("compute", 2, 2))
        .await
        .unwrap();

    orchestrator
        .register_handler(
            "slow",
            handler_fn(|m| async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                AgentResponse::ok(&m, b"{}".to_vec())
            }),
        )
        .await
        .unwrap();
    orchestrator
        .register_handler(
            "after",
            handler_fn(|m| async move { AgentResponse::ok(&m, b"{}".to_vec()) }),
        )
        .await
        .unwrap();

    register_ready_agent(&orchestrator, "w1", "worker").await;

    let workflow = Workflow::new(
        "timing-out",
        vec![
            step("s1", "worker", "slow", &[], 100),
            step("s2", "worker", "after", &["s1"], 1000),
        ],
        HashMap::new(),
    )
    .unwrap();
    let workflow_id = orchestrator.define_workflow(workflow).await;
    let execution_id = orchestrator
        .execute(&workflow_id, HashMap::new(), None)
        .await
        .unwrap();
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.wait(&execution_id),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(result.status, ExecutionStatus::Failed);
    let s1 = &result.steps[&StepId::new("s1")];
    assert_eq!(s1.status, StepStatus::Failed);
    assert_eq!(s1.failure, Some(FailureKind::Timeout));
    // The dependent never left Pending.
    assert_eq!(result.steps[&StepId::new("s2")].status, StepStatus::Pending);

    // The timed-out step's tokens came back.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(orchestrator.available_tokens("compute").await, 2);

    orchestrator.stop().await.unwrap();
}

// ========== SCENARIO E: FSM rejection ==========

#[tokio::test]
async fn scenario_e_illegal_transition_rejected() {
    let orchestrator = orchestrator().await;
    let agent_id = register_ready_agent(&orchestrator, "a1", "parse").await;

    let hook_calls = Arc::new(AtomicUsize::new(0));
    let calls = hook_calls.clone();
    orchestrator.set_exit_hook(
        AgentState::Ready,
        Arc::new(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
        }),
    );

    let err = orchestrator
        .trigger_agent_event(&agent_id, AgentEvent::Pause, None)
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::IllegalTransition {
            state: AgentState::Ready,
            event: AgentEvent::Pause
        }
    ));
    assert_eq!(orchestrator.agent_state(&agent_id).unwrap(), AgentState::Ready);
    assert_eq!(hook_calls.load(Ordering::SeqCst), 0, "no hooks on rejection");

    orchestrator.stop().await.unwrap();
}

// ========== SCENARIO F: region partitioning and coloring ==========

#[tokio::test]
async fn scenario_f_region_batches_are_conflict_free() {
    let orchestrator = orchestrator().await;

    // A 6x6 grid of task points: enough to force several leaf regions.
    let mut points = Vec::new();
    for x in 0..6 {
        for y in 0..6 {
            points.push(cohort_geometric::Point::new(
                format!("t{x}-{y}"),
                vec![x as f64, y as f64],
            ));
        }
    }

    let schedule = orchestrator.plan_region_batches(points, 2, 6).unwrap();
    let RegionSchedule::Parallel(batches) = schedule else {
        panic!("2-D partitions always color");
    };
    assert!(batches.len() <= 4);
    let total: usize = batches.iter().map(Vec::len).sum();
    assert!(total >= 9, "expected a multi-region partition, got {total}");

    orchestrator.stop().await.unwrap();
}

// ========== CANCELLATION ==========

#[tokio::test]
async fn cancel_is_idempotent_and_marks_steps() {
    let orchestrator = orchestrator().await;
    orchestrator
        .register_resource(ResourceConfig::per_second("compute", 4, 2))
        .await
        .unwrap();

    orchestrator
        .register_handler(
            "hang",
            handler_fn(|m| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                AgentResponse::ok(&m, b"{}".to_vec())
            }),
        )
        .await
        .unwrap();
    orchestrator
        .register_handler(
            "after",
            handler_fn(|m| async move { AgentResponse::ok(&m, b"{}".to_vec()) }),
        )
        .await
        .unwrap();

    register_ready_agent(&orchestrator, "w1", "worker").await;

    let workflow = Workflow::new(
        "cancellable",
        vec![
            step("s1", "worker", "hang", &[], 60_000),
            step("s2", "worker", "after", &["s1"], 1000),
        ],
        HashMap::new(),
    )
    .unwrap();
    let workflow_id = orchestrator.define_workflow(workflow).await;
    let execution_id = orchestrator
        .execute(&workflow_id, HashMap::new(), None)
        .await
        .unwrap();

    // Let s1 reach Running.
    tokio::time::sleep(Duration::from_millis(200)).await;

    orchestrator.cancel(&execution_id).await.unwrap();
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.wait(&execution_id),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(result.status, ExecutionStatus::Cancelled);
    let s1 = &result.steps[&StepId::new("s1")];
    assert_eq!(s1.status, StepStatus::Failed);
    assert_eq!(s1.failure, Some(FailureKind::Cancelled));
    assert_eq!(
        result.steps[&StepId::new("s2")].status,
        StepStatus::Cancelled
    );

    // Idempotent after completion.
    orchestrator.cancel(&execution_id).await.unwrap();
    orchestrator.cancel(&execution_id).await.unwrap();

    // Cancelled step released its allocation.
    assert_eq!(orchestrator.available_tokens("compute").await, 4);

    orchestrator.stop().await.unwrap();
}

// ========== FACADE GATING AND RESOURCE PROPERTIES ==========

#[tokio::test]
async fn registration_and_execution_require_start() {
    let orchestrator = Arc::new(
        Orchestrator::from_config(OrchestratorConfig::default())
            .await
            .unwrap(),
    );

    let descriptor = AgentDescriptor::new("early", AgentKind::new("parse")).with_id("early");
    assert!(matches!(
        orchestrator.register_agent(descriptor).await,
        Err(OrchestratorError::NotRunning)
    ));

    let workflow = Workflow::new(
        "w",
        vec![step("s1", "parse", "tokenize", &[], 1000)],
        HashMap::new(),
    )
    .unwrap();
    let workflow_id = orchestrator.define_workflow(workflow).await;
    assert!(matches!(
        orchestrator.execute(&workflow_id, HashMap::new(), None).await,
        Err(OrchestratorError::NotRunning)
    ));
}

#[tokio::test]
async fn quota_bounds_grants_through_facade() {
    let orchestrator = orchestrator().await;
    orchestrator
        .register_resource(ResourceConfig::per_second("compute", 10, 0))
        .await
        .unwrap();

    let agent = AgentId::new("a1");
    orchestrator.set_agent_quota(agent.clone(), "compute", 3).await;

    let first = orchestrator
        .allocate_resources(ResourceRequest::new("a1", "compute").tokens(3))
        .await;
    assert!(first.is_granted());
    assert_eq!(orchestrator.agent_allocation(&agent, "compute").await, 3);

    let over = orchestrator
        .allocate_resources(ResourceRequest::new("a1", "compute").tokens(1))
        .await;
    assert!(!over.is_granted(), "grants beyond the quota are denied");

    let allocation = first.granted().unwrap();
    assert!(orchestrator.release_resources(&allocation.id).await);
    assert!(!orchestrator.release_resources(&allocation.id).await);

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn stop_terminates_agents_and_executions() {
    let orchestrator = orchestrator().await;
    orchestrator
        .register_resource(ResourceConfig::per_second("compute", 2, 2))
        .await
        .unwrap();

    orchestrator
        .register_handler(
            "hang",
            handler_fn(|m| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                AgentResponse::ok(&m, b"{}".to_vec())
            }),
        )
        .await
        .unwrap();
    let agent_id = register_ready_agent(&orchestrator, "w1", "worker").await;

    let workflow = Workflow::new(
        "hanging",
        vec![step("s1", "worker", "hang", &[], 60_000)],
        HashMap::new(),
    )
    .unwrap();
    let workflow_id = orchestrator.define_workflow(workflow).await;
    let execution_id = orchestrator
        .execute(&workflow_id, HashMap::new(), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    tokio::time::timeout(Duration::from_secs(5), orchestrator.stop())
        .await
        .expect("stop returns once executions are terminal")
        .unwrap();

    assert!(!orchestrator.is_running());
    assert_eq!(
        orchestrator.agent_state(&agent_id).unwrap(),
        AgentState::Terminated
    );
    let result = orchestrator.results(&execution_id).await.unwrap().unwrap();
    assert_eq!(result.status, ExecutionStatus::Cancelled);

    let stats = orchestrator.statistics().await;
    assert_eq!(stats.active_executions, 0);
    assert_eq!(stats.engine.executions_cancelled, 1);
}

#[tokio::test]
async fn statistics_reflect_activity() {
    let orchestrator = orchestrator().await;
    orchestrator
        .register_resource(ResourceConfig::per_second("compute", 2, 2))
        .await
        .unwrap();
    orchestrator
        .register_handler(
            "tokenize",
            handler_fn(|m| async move { AgentResponse::ok(&m, b"{}".to_vec()) }),
        )
        .await
        .unwrap();
    register_ready_agent(&orchestrator, "a1", "parse").await;

    let workflow = Workflow::new(
        "single",
        vec![step("s1", "parse", "tokenize", &[], 1000)],
        HashMap::new(),
    )
    .unwrap();
    let workflow_id = orchestrator.define_workflow(workflow).await;
    let execution_id = orchestrator
        .execute(&workflow_id, HashMap::new(), None)
        .await
        .unwrap();
    orchestrator.wait(&execution_id).await.unwrap();

    let stats = orchestrator.statistics().await;
    assert_eq!(stats.agents, 1);
    assert_eq!(stats.workflows, 1);
    assert_eq!(stats.engine.executions_started, 1);
    assert_eq!(stats.engine.executions_succeeded, 1);
    assert_eq!(stats.engine.steps_succeeded, 1);
    assert!(stats.messages_sent >= 1);
    assert_eq!(stats.resources["compute"].max_tokens, 2);

    orchestrator.stop().await.unwrap();
}
