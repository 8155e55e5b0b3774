//! End-to-end engine scenarios on the in-memory store.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use orchestrion_types::activity::ActivityState;
use orchestrion_types::command::{
    ApplyMigrationCommand, DefinitionRef, DeployDefinitionCommand, GenerateMigrationPlanCommand,
    PlanMigrationCommand, ScheduleMigrationCommand, StartProcessCommand, SuspendDefinitionCommand,
};
use orchestrion_types::config::EngineConfig;
use orchestrion_types::definition::{
    ActivityDefinition, ActivityKind, MultiInstanceLoopCharacteristics, ProcessDefinition, SequenceFlow,
    VariableMapping,
};
use orchestrion_types::event::EngineEvent;
use orchestrion_types::job::{Job, JobState, job_types};
use orchestrion_types::migration::{ActivityMigrationInstruction, MigrationOutcome};
use orchestrion_types::process::{Process, ProcessState};
use orchestrion_types::task::TaskFailure;
use orchestrion_types::variables::{self, Variables};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::EngineError;
use crate::external::FetchRequest;
use crate::orchestrator::Orchestrator;
use crate::repository::{JobQuery, JobRepository, MemoryStore, ProcessQuery, RuntimeRepository};
use crate::runtime::service_fn;

type Orch = Orchestrator<MemoryStore>;

fn orchestrator() -> Orch {
    let mut config = EngineConfig::default();
    config.engine.activity_backoff.base_delay_ms = 0;
    Orchestrator::new(Arc::new(MemoryStore::new()), config)
}

fn definition(key: &str, activities: Vec<ActivityDefinition>, flows: Vec<SequenceFlow>) -> ProcessDefinition {
    ProcessDefinition {
        id: Uuid::now_v7(),
        key: key.to_string(),
        version: 0,
        name: None,
        activities,
        flows,
        variables: Variables::new(),
        deployed_at: Utc::now(),
    }
}

fn receive(id: &str, message: &str) -> ActivityDefinition {
    ActivityDefinition::new(id, ActivityKind::ReceiveTask {
        message: message.to_string(),
    })
}

fn start() -> ActivityDefinition {
    ActivityDefinition::new("start", ActivityKind::StartEvent)
}

fn end() -> ActivityDefinition {
    ActivityDefinition::new("end", ActivityKind::EndEvent)
}

async fn deploy(orch: &Orch, definition: ProcessDefinition) -> ProcessDefinition {
    orch.execute(DeployDefinitionCommand { definition }).await.unwrap()
}

async fn run(orch: &Orch, key: &str, vars: Value) -> Process {
    orch.execute(StartProcessCommand {
        definition: DefinitionRef::latest(key),
        variables: variables::from_value(vars),
        business_key: None,
    })
    .await
    .unwrap()
}

async fn state_of(orch: &Orch, process_id: Uuid, activity: &str) -> Vec<ActivityState> {
    orch.engine()
        .activities(process_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|a| a.definition_id == activity)
        .map(|a| a.state)
        .collect()
}

// ---------------------------------------------------------------------------
// Gateways
// ---------------------------------------------------------------------------

fn approval_definition(default_flow: Option<&str>) -> ProcessDefinition {
    definition(
        "approval",
        vec![
            start(),
            ActivityDefinition::new("check", ActivityKind::ExclusiveGateway {
                default_flow: default_flow.map(str::to_string),
            }),
            receive("approve", "approved"),
            ActivityDefinition::new("auto", ActivityKind::Task),
            end(),
        ],
        vec![
            SequenceFlow::new("f1", "start", "check"),
            SequenceFlow::new("big", "check", "approve").when("amount > 100"),
            SequenceFlow::new("small", "check", "auto"),
            SequenceFlow::new("f2", "approve", "end"),
            SequenceFlow::new("f3", "auto", "end"),
        ],
    )
}

#[tokio::test]
async fn exclusive_gateway_routes_on_condition() {
    let orch = orchestrator();
    deploy(&orch, approval_definition(Some("small"))).await;

    let small = run(&orch, "approval", json!({ "amount": 50 })).await;
    assert_eq!(small.state, ProcessState::Completed);
    assert_eq!(state_of(&orch, small.id, "auto").await, vec![ActivityState::Completed]);
    assert!(state_of(&orch, small.id, "approve").await.is_empty());

    let big = run(&orch, "approval", json!({ "amount": 200 })).await;
    assert_eq!(big.state, ProcessState::Running);
    assert_eq!(state_of(&orch, big.id, "approve").await, vec![ActivityState::Active]);

    let done = orch
        .engine()
        .correlate_message(big.id, "approved", Variables::new())
        .await
        .unwrap();
    assert_eq!(done.state, ProcessState::Completed);
}

#[tokio::test]
async fn gateway_without_match_or_default_raises_incident() {
    let orch = orchestrator();
    let mut def = approval_definition(None);
    // Without a default every flow needs a guard.
    def.flows[2].condition = Some("amount <= 10".to_string());
    deploy(&orch, def).await;

    let process = run(&orch, "approval", json!({ "amount": 50 })).await;
    assert_eq!(process.state, ProcessState::Incident);
    let incidents = orch.engine().incidents(process.id).await.unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].activity_definition_id, "check");
    assert!(incidents[0].reason.contains("no outgoing flow"));
}

#[tokio::test]
async fn parallel_join_fires_once_after_every_branch() {
    let orch = orchestrator();
    deploy(
        &orch,
        definition(
            "fanout",
            vec![
                start(),
                ActivityDefinition::new("fork", ActivityKind::ParallelGateway),
                receive("a", "a"),
                receive("b", "b"),
                ActivityDefinition::new("join", ActivityKind::ParallelGateway),
                end(),
            ],
            vec![
                SequenceFlow::new("f1", "start", "fork"),
                SequenceFlow::new("fa", "fork", "a"),
                SequenceFlow::new("fb", "fork", "b"),
                SequenceFlow::new("ja", "a", "join"),
                SequenceFlow::new("jb", "b", "join"),
                SequenceFlow::new("f2", "join", "end"),
            ],
        ),
    )
    .await;
    let mut events = orch.events().subscribe();

    let process = run(&orch, "fanout", json!({})).await;
    let after_a = orch
        .engine()
        .correlate_message(process.id, "a", Variables::new())
        .await
        .unwrap();
    assert_eq!(after_a.state, ProcessState::Running);
    assert_eq!(state_of(&orch, process.id, "join").await, vec![ActivityState::Active]);

    let done = orch
        .engine()
        .correlate_message(process.id, "b", Variables::new())
        .await
        .unwrap();
    assert_eq!(done.state, ProcessState::Completed);
    assert_eq!(state_of(&orch, process.id, "join").await, vec![ActivityState::Completed]);

    let mut join_completions = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(&event, EngineEvent::ActivityCompleted { definition_id, .. } if definition_id == "join") {
            join_completions += 1;
        }
    }
    assert_eq!(join_completions, 1);
}

fn notify_definition(default_flow: Option<&str>) -> ProcessDefinition {
    definition(
        "notify",
        vec![
            start(),
            ActivityDefinition::new("split", ActivityKind::InclusiveGateway {
                default_flow: default_flow.map(str::to_string),
            }),
            receive("email", "emailed"),
            receive("sms", "texted"),
            receive("letter", "posted"),
            ActivityDefinition::new("skip", ActivityKind::Task),
            ActivityDefinition::new("join", ActivityKind::InclusiveGateway { default_flow: None }),
            end(),
        ],
        vec![
            SequenceFlow::new("f1", "start", "split"),
            SequenceFlow::new("to-email", "split", "email").when("email == true"),
            SequenceFlow::new("to-sms", "split", "sms").when("sms == true"),
            SequenceFlow::new("to-letter", "split", "letter").when("letter == true"),
            SequenceFlow::new("none", "split", "skip"),
            SequenceFlow::new("j1", "email", "join"),
            SequenceFlow::new("j2", "sms", "join"),
            SequenceFlow::new("j3", "letter", "join"),
            SequenceFlow::new("j4", "skip", "join"),
            SequenceFlow::new("f2", "join", "end"),
        ],
    )
}

#[tokio::test]
async fn inclusive_join_waits_only_for_taken_branches() {
    let orch = orchestrator();
    deploy(&orch, notify_definition(Some("none"))).await;
    let mut events = orch.events().subscribe();

    let process = run(&orch, "notify", json!({ "email": true, "sms": true, "letter": false })).await;
    assert_eq!(state_of(&orch, process.id, "email").await, vec![ActivityState::Active]);
    assert_eq!(state_of(&orch, process.id, "sms").await, vec![ActivityState::Active]);
    assert!(state_of(&orch, process.id, "letter").await.is_empty());
    assert!(state_of(&orch, process.id, "skip").await.is_empty());

    let after_email = orch
        .engine()
        .correlate_message(process.id, "emailed", Variables::new())
        .await
        .unwrap();
    assert_eq!(after_email.state, ProcessState::Running);
    assert_eq!(state_of(&orch, process.id, "join").await, vec![ActivityState::Active]);

    let done = orch
        .engine()
        .correlate_message(process.id, "texted", Variables::new())
        .await
        .unwrap();
    assert_eq!(done.state, ProcessState::Completed);

    let mut join_completions = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(&event, EngineEvent::ActivityCompleted { definition_id, .. } if definition_id == "join") {
            join_completions += 1;
        }
    }
    assert_eq!(join_completions, 1);
}

#[tokio::test]
async fn inclusive_split_falls_back_to_default_flow() {
    let orch = orchestrator();
    deploy(&orch, notify_definition(Some("none"))).await;

    let process = run(&orch, "notify", json!({ "email": false, "sms": false, "letter": false })).await;
    assert_eq!(process.state, ProcessState::Completed);
    assert_eq!(state_of(&orch, process.id, "skip").await, vec![ActivityState::Completed]);
    assert_eq!(state_of(&orch, process.id, "join").await, vec![ActivityState::Completed]);
    assert!(state_of(&orch, process.id, "email").await.is_empty());
}

#[tokio::test]
async fn inclusive_split_without_match_or_default_raises_incident() {
    let orch = orchestrator();
    let mut def = notify_definition(None);
    def.flows[4].condition = Some("urgent == true".to_string());
    deploy(&orch, def).await;

    let process = run(&orch, "notify", json!({ "email": false, "sms": false, "letter": false, "urgent": false })).await;
    assert_eq!(process.state, ProcessState::Incident);
    let incidents = orch.engine().incidents(process.id).await.unwrap();
    assert_eq!(incidents[0].activity_definition_id, "split");
    assert!(incidents[0].reason.contains("no outgoing flow"));
}

#[tokio::test]
async fn inclusive_join_ignores_a_branch_that_ended_elsewhere() {
    let orch = orchestrator();
    let mut def = notify_definition(Some("none"));
    // The letter branch now finishes on its own end event.
    def.activities.push(ActivityDefinition::new("filed", ActivityKind::EndEvent));
    def.flows.retain(|f| f.id != "j3");
    def.flows.push(SequenceFlow::new("j3", "letter", "filed"));
    deploy(&orch, def).await;

    let process = run(&orch, "notify", json!({ "email": true, "sms": false, "letter": true })).await;
    orch.engine()
        .correlate_message(process.id, "emailed", Variables::new())
        .await
        .unwrap();
    // The join can no longer be reached from the letter branch.
    assert_eq!(state_of(&orch, process.id, "join").await, vec![ActivityState::Completed]);

    let done = orch
        .engine()
        .correlate_message(process.id, "posted", Variables::new())
        .await
        .unwrap();
    assert_eq!(done.state, ProcessState::Completed);
}

// ---------------------------------------------------------------------------
// Multi-instance
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sequential_multi_instance_runs_in_collection_order() {
    let orch = orchestrator();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    orch.engine().register_service(
        "record",
        service_fn(move |ctx| {
            let recorder = Arc::clone(&recorder);
            async move {
                let item = ctx.variables.get("item").cloned().unwrap_or(Value::Null);
                recorder.lock().unwrap().push((ctx.loop_index, item));
                Ok(Variables::new())
            }
        }),
    );
    deploy(
        &orch,
        definition(
            "batch",
            vec![
                start(),
                ActivityDefinition {
                    multi_instance: Some(MultiInstanceLoopCharacteristics {
                        collection: "items".to_string(),
                        element_variable: "item".to_string(),
                        sequential: true,
                        completion_condition: None,
                    }),
                    ..ActivityDefinition::new("each", ActivityKind::ServiceTask {
                        handler: "record".to_string(),
                    })
                },
                end(),
            ],
            vec![
                SequenceFlow::new("f1", "start", "each"),
                SequenceFlow::new("f2", "each", "end"),
            ],
        ),
    )
    .await;

    let process = run(&orch, "batch", json!({ "items": ["a", "b", "c"] })).await;
    orch.scheduler().run_pending().await.unwrap();

    let done = orch.engine().process(process.id).await.unwrap();
    assert_eq!(done.state, ProcessState::Completed);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (Some(0), json!("a")),
            (Some(1), json!("b")),
            (Some(2), json!("c")),
        ]
    );
    // Instance variables stay local.
    assert!(!done.variables.contains_key("item"));
}

#[tokio::test]
async fn parallel_multi_instance_offers_every_element_at_once() {
    let orch = orchestrator();
    deploy(
        &orch,
        definition(
            "notify",
            vec![
                start(),
                ActivityDefinition {
                    multi_instance: Some(MultiInstanceLoopCharacteristics {
                        collection: "recipients".to_string(),
                        element_variable: "recipient".to_string(),
                        sequential: false,
                        completion_condition: Some("nrOfCompletedInstances >= 2".to_string()),
                    }),
                    ..ActivityDefinition::new("send", ActivityKind::ExternalTask {
                        topic: "mail".to_string(),
                    })
                },
                end(),
            ],
            vec![
                SequenceFlow::new("f1", "start", "send"),
                SequenceFlow::new("f2", "send", "end"),
            ],
        ),
    )
    .await;
    let process = run(&orch, "notify", json!({ "recipients": ["ann", "bob", "cy"] })).await;

    let tasks = orch
        .gateway()
        .fetch_and_lock(&FetchRequest::new("mail", "w1"))
        .await
        .unwrap();
    assert_eq!(tasks.len(), 3);
    let mut recipients: Vec<_> = tasks.iter().map(|t| t.variables["recipient"].clone()).collect();
    recipients.sort_by_key(|v| v.to_string());
    assert_eq!(recipients, vec![json!("ann"), json!("bob"), json!("cy")]);

    for task in &tasks[..2] {
        orch.gateway().complete(task.id, "w1", Variables::new()).await.unwrap();
    }
    let done = orch.engine().process(process.id).await.unwrap();
    assert_eq!(done.state, ProcessState::Completed);
    let states = state_of(&orch, process.id, "send").await;
    assert_eq!(states.iter().filter(|s| **s == ActivityState::Cancelled).count(), 1);
}

// ---------------------------------------------------------------------------
// Retries and recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn service_retries_are_exhausted_then_recovered() {
    let orch = orchestrator();
    let calls = Arc::new(AtomicU32::new(0));
    let healthy = Arc::new(AtomicBool::new(false));
    {
        let calls = Arc::clone(&calls);
        let healthy = Arc::clone(&healthy);
        orch.engine().register_service(
            "charge",
            service_fn(move |_ctx| {
                let calls = Arc::clone(&calls);
                let healthy = Arc::clone(&healthy);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if healthy.load(Ordering::SeqCst) {
                        Ok(variables::from_value(json!({ "charged": true })))
                    } else {
                        anyhow::bail!("card declined")
                    }
                }
            }),
        );
    }
    deploy(
        &orch,
        definition(
            "payment",
            vec![
                start(),
                ActivityDefinition {
                    retries: Some(3),
                    ..ActivityDefinition::new("charge", ActivityKind::ServiceTask {
                        handler: "charge".to_string(),
                    })
                },
                end(),
            ],
            vec![
                SequenceFlow::new("f1", "start", "charge"),
                SequenceFlow::new("f2", "charge", "end"),
            ],
        ),
    )
    .await;

    let process = run(&orch, "payment", json!({})).await;
    orch.scheduler().run_pending().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let failed = orch.engine().process(process.id).await.unwrap();
    assert_eq!(failed.state, ProcessState::Incident);
    let charge = orch
        .engine()
        .activities(process.id)
        .await
        .unwrap()
        .into_iter()
        .find(|a| a.definition_id == "charge")
        .unwrap();
    assert_eq!(charge.state, ActivityState::Failed);
    assert_eq!(charge.attempts, 3);
    assert!(charge.failure.unwrap().reason.contains("card declined"));

    healthy.store(true, Ordering::SeqCst);
    let recovered = orch.engine().recover(process.id).await.unwrap();
    assert_eq!(recovered.state, ProcessState::Running);
    orch.scheduler().run_pending().await.unwrap();

    let done = orch.engine().process(process.id).await.unwrap();
    assert_eq!(done.state, ProcessState::Completed);
    assert_eq!(done.variables["charged"], json!(true));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn missing_service_handler_fails_without_retry() {
    let orch = orchestrator();
    deploy(
        &orch,
        definition(
            "orphan",
            vec![
                start(),
                ActivityDefinition::new("call", ActivityKind::ServiceTask {
                    handler: "nobody".to_string(),
                }),
                end(),
            ],
            vec![
                SequenceFlow::new("f1", "start", "call"),
                SequenceFlow::new("f2", "call", "end"),
            ],
        ),
    )
    .await;
    let process = run(&orch, "orphan", json!({})).await;
    orch.scheduler().run_pending().await.unwrap();

    let incidents = orch.engine().incidents(process.id).await.unwrap();
    assert_eq!(incidents.len(), 1);
    assert!(incidents[0].reason.contains("nobody"));
}

#[tokio::test]
async fn recover_rejects_healthy_process() {
    let orch = orchestrator();
    deploy(&orch, approval_definition(Some("small"))).await;
    let process = run(&orch, "approval", json!({ "amount": 500 })).await;
    let err = orch.engine().recover(process.id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));
}

fn counting_charge(orch: &Orch) -> Arc<AtomicU32> {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    orch.engine().register_service(
        "charge",
        service_fn(move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(variables::from_value(json!({ "charged": true })))
            }
        }),
    );
    calls
}

fn charge_definition(retries: u32) -> ProcessDefinition {
    definition(
        "charge",
        vec![
            start(),
            ActivityDefinition {
                retries: Some(retries),
                ..ActivityDefinition::new("charge", ActivityKind::ServiceTask {
                    handler: "charge".to_string(),
                })
            },
            end(),
        ],
        vec![
            SequenceFlow::new("f1", "start", "charge"),
            SequenceFlow::new("f2", "charge", "end"),
        ],
    )
}

async fn activity_job(orch: &Orch, process_id: Uuid) -> Job {
    let query = JobQuery {
        process_id: Some(process_id),
        job_type: Some(job_types::ACTIVITY.to_string()),
        state: Some(JobState::Created),
        ..Default::default()
    };
    orch.engine().store().list_jobs(&query).await.unwrap().remove(0)
}

/// Claim the job for a node that dies before reporting back.
async fn lose_lease(orch: &Orch, job: &Job) {
    let past = Utc::now() - chrono::Duration::seconds(5);
    orch.engine()
        .store()
        .claim_job(&job.id, "dead-node/1", past, past)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn lost_service_job_spends_a_retry_and_runs_again() {
    let orch = orchestrator();
    let calls = counting_charge(&orch);
    deploy(&orch, charge_definition(2)).await;
    let process = run(&orch, "charge", json!({})).await;

    let job = activity_job(&orch, process.id).await;
    lose_lease(&orch, &job).await;
    orch.scheduler().run_pending().await.unwrap();

    let lost = orch.engine().store().get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(lost.state, JobState::Failed);
    let done = orch.engine().process(process.id).await.unwrap();
    assert_eq!(done.state, ProcessState::Completed);
    assert_eq!(done.variables["charged"], json!(true));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn lost_service_job_without_retries_raises_incident() {
    let orch = orchestrator();
    let calls = counting_charge(&orch);
    deploy(&orch, charge_definition(1)).await;
    let process = run(&orch, "charge", json!({})).await;

    let job = activity_job(&orch, process.id).await;
    lose_lease(&orch, &job).await;
    orch.scheduler().run_pending().await.unwrap();

    let failed = orch.engine().process(process.id).await.unwrap();
    assert_eq!(failed.state, ProcessState::Incident);
    assert_eq!(state_of(&orch, process.id, "charge").await, vec![ActivityState::Failed]);
    let incidents = orch.engine().incidents(process.id).await.unwrap();
    assert_eq!(incidents[0].reason, "lease expired");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn suspended_process_defers_its_service_job() {
    let orch = orchestrator();
    let calls = counting_charge(&orch);
    deploy(&orch, charge_definition(1)).await;
    let process = run(&orch, "charge", json!({})).await;
    let job = activity_job(&orch, process.id).await;

    orch.engine().set_suspended(process.id, true).await.unwrap();
    let deferred = orch.scheduler().run_now(job.id).await.unwrap();
    assert_eq!(deferred.state, JobState::Created);
    assert_eq!(deferred.attempts, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(orch.scheduler().run_pending().await.unwrap(), 0);

    orch.engine().set_suspended(process.id, false).await.unwrap();
    orch.scheduler().run_pending().await.unwrap();
    let done = orch.engine().process(process.id).await.unwrap();
    assert_eq!(done.state, ProcessState::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn receive_task_timeout_raises_incident() {
    let orch = orchestrator();
    deploy(
        &orch,
        definition(
            "deadline",
            vec![
                start(),
                ActivityDefinition {
                    timeout_secs: Some(0),
                    retries: Some(1),
                    ..receive("reply", "reply")
                },
                end(),
            ],
            vec![
                SequenceFlow::new("f1", "start", "reply"),
                SequenceFlow::new("f2", "reply", "end"),
            ],
        ),
    )
    .await;
    let process = run(&orch, "deadline", json!({})).await;

    assert_eq!(orch.engine().sweep_timeouts(10).await.unwrap(), 1);
    let failed = orch.engine().process(process.id).await.unwrap();
    assert_eq!(failed.state, ProcessState::Incident);
    let incidents = orch.engine().incidents(process.id).await.unwrap();
    assert_eq!(incidents[0].reason, "activity timed out");
}

// ---------------------------------------------------------------------------
// Ending and cancelling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn terminate_end_event_cancels_open_branches() {
    let orch = orchestrator();
    deploy(
        &orch,
        definition(
            "abort",
            vec![
                start(),
                ActivityDefinition::new("fork", ActivityKind::ParallelGateway),
                receive("wait", "never"),
                ActivityDefinition::new("kill", ActivityKind::TerminateEndEvent),
            ],
            vec![
                SequenceFlow::new("f1", "start", "fork"),
                SequenceFlow::new("f2", "fork", "wait"),
                SequenceFlow::new("f3", "fork", "kill"),
            ],
        ),
    )
    .await;

    let process = run(&orch, "abort", json!({})).await;
    assert_eq!(process.state, ProcessState::Terminated);
    assert_eq!(state_of(&orch, process.id, "wait").await, vec![ActivityState::Cancelled]);
    assert!(process.completed_at.is_some());
}

fn child_definition() -> ProcessDefinition {
    definition(
        "child",
        vec![start(), receive("wait", "go"), end()],
        vec![
            SequenceFlow::new("f1", "start", "wait"),
            SequenceFlow::new("f2", "wait", "end"),
        ],
    )
}

fn parent_definition() -> ProcessDefinition {
    definition(
        "parent",
        vec![
            start(),
            ActivityDefinition::new("call", ActivityKind::CallActivity {
                called_element: "child".to_string(),
                version: None,
                inputs: Some(vec![VariableMapping {
                    source: "amount".to_string(),
                    target: "value".to_string(),
                }]),
                outputs: Some(vec![VariableMapping {
                    source: "value * 2".to_string(),
                    target: "doubled".to_string(),
                }]),
            }),
            end(),
        ],
        vec![
            SequenceFlow::new("f1", "start", "call"),
            SequenceFlow::new("f2", "call", "end"),
        ],
    )
}

async fn child_of(orch: &Orch, parent: Uuid) -> Process {
    let query = ProcessQuery {
        parent_process_id: Some(parent),
        ..Default::default()
    };
    let mut children = orch.engine().store().list_processes(&query).await.unwrap();
    assert_eq!(children.len(), 1);
    children.remove(0)
}

#[tokio::test]
async fn call_activity_maps_variables_both_ways() {
    let orch = orchestrator();
    deploy(&orch, child_definition()).await;
    deploy(&orch, parent_definition()).await;

    let parent = run(&orch, "parent", json!({ "amount": 21, "secret": "x" })).await;
    assert_eq!(parent.state, ProcessState::Running);

    let child = child_of(&orch, parent.id).await;
    assert_eq!(child.variables["value"], json!(21));
    assert!(!child.variables.contains_key("secret"));
    assert_eq!(child.root_process_id, parent.id);

    orch.engine()
        .correlate_message(child.id, "go", Variables::new())
        .await
        .unwrap();
    let done = orch.engine().process(parent.id).await.unwrap();
    assert_eq!(done.state, ProcessState::Completed);
    assert_eq!(done.variables["doubled"].as_f64(), Some(42.0));
}

#[tokio::test]
async fn cancelling_parent_cancels_called_process() {
    let orch = orchestrator();
    deploy(&orch, child_definition()).await;
    deploy(&orch, parent_definition()).await;

    let parent = run(&orch, "parent", json!({ "amount": 1 })).await;
    let child = child_of(&orch, parent.id).await;

    let cancelled = orch.engine().cancel(parent.id).await.unwrap();
    assert_eq!(cancelled.state, ProcessState::Cancelled);
    let child = orch.engine().process(child.id).await.unwrap();
    assert_eq!(child.state, ProcessState::Cancelled);
}

#[tokio::test]
async fn unknown_called_element_fails_the_call() {
    let orch = orchestrator();
    deploy(&orch, parent_definition()).await;
    let parent = run(&orch, "parent", json!({ "amount": 1 })).await;

    let parent = orch.engine().process(parent.id).await.unwrap();
    assert_eq!(parent.state, ProcessState::Incident);
    assert_eq!(state_of(&orch, parent.id, "call").await, vec![ActivityState::Failed]);
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

fn inside(parent: &str, mut activity: ActivityDefinition) -> ActivityDefinition {
    activity.parent = Some(parent.to_string());
    activity
}

fn error_end(id: &str, code: &str) -> ActivityDefinition {
    ActivityDefinition::new(id, ActivityKind::ErrorEndEvent {
        error_code: code.to_string(),
    })
}

fn boundary(id: &str, attached_to: &str, code: Option<&str>) -> ActivityDefinition {
    ActivityDefinition::new(id, ActivityKind::ErrorBoundaryEvent {
        attached_to: attached_to.to_string(),
        error_code: code.map(str::to_string),
    })
}

/// A payment sub-process that declines at once while a confirmation waits.
fn checkout_definition(caught_code: &str) -> ProcessDefinition {
    definition(
        "checkout",
        vec![
            start(),
            ActivityDefinition::new("pay", ActivityKind::SubProcess),
            inside("pay", ActivityDefinition::new("pay-start", ActivityKind::StartEvent)),
            inside("pay", ActivityDefinition::new("fork", ActivityKind::ParallelGateway)),
            inside("pay", receive("confirm", "confirmed")),
            inside("pay", error_end("reject", "DECLINED")),
            boundary("declined", "pay", Some(caught_code)),
            ActivityDefinition::new("declined-end", ActivityKind::EndEvent),
            end(),
        ],
        vec![
            SequenceFlow::new("f1", "start", "pay"),
            SequenceFlow::new("p1", "pay-start", "fork"),
            SequenceFlow::new("p2", "fork", "confirm"),
            SequenceFlow::new("p3", "fork", "reject"),
            SequenceFlow::new("f2", "pay", "end"),
            SequenceFlow::new("f3", "declined", "declined-end"),
        ],
    )
}

#[tokio::test]
async fn error_end_event_is_caught_on_the_enclosing_sub_process() {
    let orch = orchestrator();
    deploy(&orch, checkout_definition("DECLINED")).await;
    let mut events = orch.events().subscribe();

    let process = run(&orch, "checkout", json!({})).await;
    assert_eq!(process.state, ProcessState::Completed);
    assert_eq!(state_of(&orch, process.id, "pay").await, vec![ActivityState::Cancelled]);
    assert_eq!(state_of(&orch, process.id, "confirm").await, vec![ActivityState::Cancelled]);
    assert_eq!(state_of(&orch, process.id, "reject").await, vec![ActivityState::Completed]);
    assert_eq!(state_of(&orch, process.id, "declined-end").await, vec![ActivityState::Completed]);
    assert!(state_of(&orch, process.id, "end").await.is_empty());

    let mut caught = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::ErrorThrown { error_code, caught_by, .. } = event {
            caught.push((error_code, caught_by));
        }
    }
    assert_eq!(caught, vec![("DECLINED".to_string(), Some("declined".to_string()))]);
}

#[tokio::test]
async fn uncaught_error_raises_incident_on_the_thrower() {
    let orch = orchestrator();
    deploy(&orch, checkout_definition("FRAUD")).await;

    let process = run(&orch, "checkout", json!({})).await;
    assert_eq!(process.state, ProcessState::Incident);
    let incidents = orch.engine().incidents(process.id).await.unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].activity_definition_id, "reject");
    assert_eq!(incidents[0].reason, "unhandled error 'DECLINED'");
    assert_eq!(state_of(&orch, process.id, "pay").await, vec![ActivityState::Active]);
}

#[tokio::test]
async fn external_task_error_is_caught_on_the_task() {
    let orch = orchestrator();
    let mut def = shipping_definition();
    def.activities.push(boundary("no-stock", "ship", None));
    def.activities.push(ActivityDefinition::new("refund", ActivityKind::Task));
    def.flows.push(SequenceFlow::new("f3", "no-stock", "refund"));
    deploy(&orch, def).await;
    let process = run(&orch, "shipping", json!({ "parcel": 7 })).await;
    let gateway = orch.gateway();

    let tasks = gateway.fetch_and_lock(&FetchRequest::new("ship", "a")).await.unwrap();
    let err = gateway
        .throw_error(tasks[0].id, "b", "NO_STOCK", Variables::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Lock(_)));

    gateway
        .throw_error(tasks[0].id, "a", "NO_STOCK", variables::from_value(json!({ "missing": "A-1" })))
        .await
        .unwrap();
    let done = orch.engine().process(process.id).await.unwrap();
    assert_eq!(done.state, ProcessState::Completed);
    assert_eq!(done.variables["missing"], json!("A-1"));
    assert_eq!(state_of(&orch, process.id, "ship").await, vec![ActivityState::Cancelled]);
    assert_eq!(state_of(&orch, process.id, "refund").await, vec![ActivityState::Completed]);
    assert!(state_of(&orch, process.id, "end").await.is_empty());
}

/// Waits for `go`, then ends with error `REJECTED`.
fn rejecting_child() -> ProcessDefinition {
    definition(
        "rejecting",
        vec![start(), receive("wait", "go"), error_end("reject", "REJECTED")],
        vec![
            SequenceFlow::new("f1", "start", "wait"),
            SequenceFlow::new("f2", "wait", "reject"),
        ],
    )
}

fn calling_definition(catch: bool) -> ProcessDefinition {
    let mut def = definition(
        "calling",
        vec![
            start(),
            ActivityDefinition::new("review", ActivityKind::CallActivity {
                called_element: "rejecting".to_string(),
                version: None,
                inputs: None,
                outputs: None,
            }),
            end(),
        ],
        vec![
            SequenceFlow::new("f1", "start", "review"),
            SequenceFlow::new("f2", "review", "end"),
        ],
    );
    if catch {
        def.activities.push(boundary("rejected", "review", Some("REJECTED")));
        def.activities.push(ActivityDefinition::new("rejected-end", ActivityKind::EndEvent));
        def.flows.push(SequenceFlow::new("f3", "rejected", "rejected-end"));
    }
    def
}

#[tokio::test]
async fn called_process_error_is_caught_on_the_call_activity() {
    let orch = orchestrator();
    deploy(&orch, rejecting_child()).await;
    deploy(&orch, calling_definition(true)).await;

    let parent = run(&orch, "calling", json!({})).await;
    let child = child_of(&orch, parent.id).await;
    orch.engine()
        .correlate_message(child.id, "go", Variables::new())
        .await
        .unwrap();

    let child = orch.engine().process(child.id).await.unwrap();
    assert_eq!(child.state, ProcessState::Terminated);
    let parent = orch.engine().process(parent.id).await.unwrap();
    assert_eq!(parent.state, ProcessState::Completed);
    assert_eq!(state_of(&orch, parent.id, "review").await, vec![ActivityState::Cancelled]);
    assert_eq!(state_of(&orch, parent.id, "rejected-end").await, vec![ActivityState::Completed]);
}

#[tokio::test]
async fn uncaught_called_process_error_fails_the_call_until_recovered() {
    let orch = orchestrator();
    deploy(&orch, rejecting_child()).await;
    deploy(&orch, calling_definition(false)).await;

    let parent = run(&orch, "calling", json!({})).await;
    let first = child_of(&orch, parent.id).await;
    orch.engine()
        .correlate_message(first.id, "go", Variables::new())
        .await
        .unwrap();

    let stuck = orch.engine().process(parent.id).await.unwrap();
    assert_eq!(stuck.state, ProcessState::Incident);
    let incidents = orch.engine().incidents(parent.id).await.unwrap();
    assert_eq!(incidents[0].activity_definition_id, "review");
    assert_eq!(incidents[0].reason, "unhandled error 'REJECTED'");

    // Recovery calls a fresh child.
    let recovered = orch.engine().recover(parent.id).await.unwrap();
    assert_eq!(recovered.state, ProcessState::Running);
    let query = ProcessQuery {
        parent_process_id: Some(parent.id),
        ..Default::default()
    };
    let children = orch.engine().store().list_processes(&query).await.unwrap();
    assert_eq!(children.len(), 2);
    let second = children.iter().find(|c| c.id != first.id).unwrap();
    assert_eq!(second.state, ProcessState::Running);
}

// ---------------------------------------------------------------------------
// External tasks
// ---------------------------------------------------------------------------

fn shipping_definition() -> ProcessDefinition {
    definition(
        "shipping",
        vec![
            start(),
            ActivityDefinition {
                retries: Some(2),
                ..ActivityDefinition::new("ship", ActivityKind::ExternalTask {
                    topic: "ship".to_string(),
                })
            },
            end(),
        ],
        vec![
            SequenceFlow::new("f1", "start", "ship"),
            SequenceFlow::new("f2", "ship", "end"),
        ],
    )
}

#[tokio::test]
async fn locked_task_belongs_to_one_worker() {
    let orch = orchestrator();
    deploy(&orch, shipping_definition()).await;
    let process = run(&orch, "shipping", json!({ "parcel": 7 })).await;
    let gateway = orch.gateway();

    let tasks = gateway.fetch_and_lock(&FetchRequest::new("ship", "a")).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].variables["parcel"], json!(7));
    assert_eq!(tasks[0].definition_key, "shipping");
    assert!(gateway.fetch_and_lock(&FetchRequest::new("ship", "b")).await.unwrap().is_empty());

    let err = gateway.complete(tasks[0].id, "b", Variables::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::Lock(_)));

    // First failure leaves one attempt and releases the lock.
    assert!(gateway.fail(tasks[0].id, "a", TaskFailure::new("truck broke")).await.unwrap());
    let retry = gateway.fetch_and_lock(&FetchRequest::new("ship", "b")).await.unwrap();
    assert_eq!(retry.len(), 1);
    assert_eq!(retry[0].retries, 1);

    gateway
        .complete(retry[0].id, "b", variables::from_value(json!({ "tracking": "T1" })))
        .await
        .unwrap();
    let done = orch.engine().process(process.id).await.unwrap();
    assert_eq!(done.state, ProcessState::Completed);
    assert_eq!(done.variables["tracking"], json!("T1"));
}

#[tokio::test]
async fn exhausted_task_raises_incident() {
    let orch = orchestrator();
    deploy(&orch, shipping_definition()).await;
    let process = run(&orch, "shipping", json!({})).await;
    let gateway = orch.gateway();

    let task = gateway.fetch_and_lock(&FetchRequest::new("ship", "a")).await.unwrap().remove(0);
    let failure = TaskFailure {
        retries_left: Some(0),
        ..TaskFailure::new("address unknown")
    };
    assert!(!gateway.fail(task.id, "a", failure).await.unwrap());

    let failed = orch.engine().process(process.id).await.unwrap();
    assert_eq!(failed.state, ProcessState::Incident);
    assert!(gateway.fetch_and_lock(&FetchRequest::new("ship", "a")).await.unwrap().is_empty());
}

#[tokio::test]
async fn suspended_process_offers_no_tasks() {
    let orch = orchestrator();
    deploy(&orch, shipping_definition()).await;
    let process = run(&orch, "shipping", json!({})).await;

    orch.engine().set_suspended(process.id, true).await.unwrap();
    assert!(orch
        .gateway()
        .fetch_and_lock(&FetchRequest::new("ship", "a"))
        .await
        .unwrap()
        .is_empty());

    orch.engine().set_suspended(process.id, false).await.unwrap();
    let tasks = orch
        .gateway()
        .fetch_and_lock(&FetchRequest::new("ship", "a").for_definition("shipping"))
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
}

#[tokio::test]
async fn suspending_by_key_touches_only_that_definition() {
    let orch = orchestrator();
    deploy(&orch, shipping_definition()).await;
    deploy(&orch, review_v1()).await;
    let a = run(&orch, "shipping", json!({})).await;
    let b = run(&orch, "shipping", json!({})).await;
    let other = run(&orch, "review", json!({})).await;
    orch.engine().cancel(b.id).await.unwrap();

    let changed = orch
        .execute(SuspendDefinitionCommand {
            definition_key: "shipping".to_string(),
            suspended: true,
        })
        .await
        .unwrap();
    assert_eq!(changed.iter().map(|p| p.id).collect::<Vec<_>>(), vec![a.id]);
    assert!(orch.engine().process(a.id).await.unwrap().suspended);
    assert!(!orch.engine().process(other.id).await.unwrap().suspended);
    assert!(orch
        .gateway()
        .fetch_and_lock(&FetchRequest::new("ship", "w"))
        .await
        .unwrap()
        .is_empty());

    let resumed = orch
        .execute(SuspendDefinitionCommand {
            definition_key: "shipping".to_string(),
            suspended: false,
        })
        .await
        .unwrap();
    assert_eq!(resumed.len(), 1);
    assert!(!resumed[0].suspended);
}

// ---------------------------------------------------------------------------
// Migration
// ---------------------------------------------------------------------------

fn review_v1() -> ProcessDefinition {
    definition(
        "review",
        vec![start(), receive("draft", "submit"), end()],
        vec![
            SequenceFlow::new("f1", "start", "draft"),
            SequenceFlow::new("f2", "draft", "end"),
        ],
    )
}

fn review_v2() -> ProcessDefinition {
    definition(
        "review",
        vec![
            start(),
            receive("compose", "submit"),
            ActivityDefinition::new("audit", ActivityKind::Task),
            end(),
        ],
        vec![
            SequenceFlow::new("f1", "start", "compose"),
            SequenceFlow::new("f2", "compose", "audit"),
            SequenceFlow::new("f3", "audit", "end"),
        ],
    )
}

#[tokio::test]
async fn migration_without_mapping_leaves_process_untouched() {
    let orch = orchestrator();
    deploy(&orch, review_v1()).await;
    let process = run(&orch, "review", json!({})).await;
    deploy(&orch, review_v2()).await;

    let plan = orch
        .execute(GenerateMigrationPlanCommand {
            definition_key: "review".to_string(),
            from_version: 1,
            to_version: 2,
        })
        .await
        .unwrap();
    assert!(plan.target_for("draft").is_none());

    let results = orch
        .execute(ApplyMigrationCommand {
            plan_id: plan.id,
            process_ids: vec![process.id],
        })
        .await
        .unwrap();
    assert!(matches!(&results[0].outcome, MigrationOutcome::Failed { reason } if reason.contains("draft")));

    let after = orch.engine().process(process.id).await.unwrap();
    assert_eq!(after.definition_version, 1);
    assert_eq!(after.revision, process.revision);
    assert_eq!(state_of(&orch, process.id, "draft").await, vec![ActivityState::Active]);
}

#[tokio::test]
async fn migration_remaps_open_activities() {
    let orch = orchestrator();
    deploy(&orch, review_v1()).await;
    let process = run(&orch, "review", json!({})).await;
    let finished = run(&orch, "review", json!({})).await;
    orch.engine()
        .correlate_message(finished.id, "submit", Variables::new())
        .await
        .unwrap();
    deploy(&orch, review_v2()).await;

    let plan = orch
        .execute(PlanMigrationCommand {
            definition_key: "review".to_string(),
            from_version: 1,
            to_version: 2,
            instructions: vec![ActivityMigrationInstruction::new("draft", "compose")],
        })
        .await
        .unwrap();
    let results = orch
        .execute(ApplyMigrationCommand {
            plan_id: plan.id,
            process_ids: vec![process.id, finished.id],
        })
        .await
        .unwrap();
    assert_eq!(results[0].outcome, MigrationOutcome::Migrated { remapped: 1 });
    assert!(matches!(results[1].outcome, MigrationOutcome::Skipped { .. }));

    let migrated = orch.engine().process(process.id).await.unwrap();
    assert_eq!(migrated.definition_version, 2);
    assert_eq!(state_of(&orch, process.id, "compose").await, vec![ActivityState::Active]);

    let done = orch
        .engine()
        .correlate_message(process.id, "submit", Variables::new())
        .await
        .unwrap();
    assert_eq!(done.state, ProcessState::Completed);
    assert_eq!(state_of(&orch, process.id, "audit").await, vec![ActivityState::Completed]);
}

#[tokio::test]
async fn scheduled_migration_runs_as_a_job() {
    let orch = orchestrator();
    deploy(&orch, review_v1()).await;
    let first = run(&orch, "review", json!({})).await;
    let second = run(&orch, "review", json!({})).await;
    deploy(&orch, review_v2()).await;

    let plan = orch
        .execute(PlanMigrationCommand {
            definition_key: "review".to_string(),
            from_version: 1,
            to_version: 2,
            instructions: vec![ActivityMigrationInstruction::new("draft", "compose")],
        })
        .await
        .unwrap();
    let job = orch.execute(ScheduleMigrationCommand { plan_id: plan.id }).await.unwrap();
    assert_eq!(job.job_type, job_types::PROCESS_MIGRATION);
    assert_eq!(job.state, JobState::Created);
    assert_eq!(orch.engine().process(first.id).await.unwrap().definition_version, 1);

    let job = orch.scheduler().run_now(job.id).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.output["migrated"], json!(2));
    for id in [first.id, second.id] {
        assert_eq!(orch.engine().process(id).await.unwrap().definition_version, 2);
    }

    let err = orch
        .execute(ScheduleMigrationCommand { plan_id: Uuid::now_v7() })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

#[tokio::test]
async fn plan_rejects_incompatible_mapping() {
    let orch = orchestrator();
    deploy(&orch, review_v1()).await;
    deploy(&orch, review_v2()).await;

    let err = orch
        .execute(PlanMigrationCommand {
            definition_key: "review".to_string(),
            from_version: 1,
            to_version: 2,
            instructions: vec![ActivityMigrationInstruction::new("draft", "audit")],
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Definition(_)));

    let err = orch
        .execute(PlanMigrationCommand {
            definition_key: "review".to_string(),
            from_version: 1,
            to_version: 3,
            instructions: Vec::new(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Definition(_)));
}

#[tokio::test]
async fn deploying_assigns_increasing_versions() {
    let orch = orchestrator();
    let v1 = deploy(&orch, review_v1()).await;
    let v2 = deploy(&orch, review_v2()).await;
    assert_eq!((v1.version, v2.version), (1, 2));

    let mut pinned = review_v1();
    pinned.version = 2;
    let err = orch
        .execute(DeployDefinitionCommand { definition: pinned })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));

    let process = orch
        .execute(StartProcessCommand {
            definition: DefinitionRef::Key {
                key: "review".to_string(),
                version: Some(1),
            },
            variables: Variables::new(),
            business_key: Some("doc-1".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(process.definition_version, 1);
    assert_eq!(process.business_key.as_deref(), Some("doc-1"));
    assert!(orch.engine().store().get_process(&process.id).await.unwrap().is_some());
}
