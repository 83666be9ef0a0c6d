use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use strata_core::config::{
    EngineConfig, ExecutionConfig, GateDenialPolicy, OrganizationSpec, RecoveryStrategy, RoleSpec,
    TeamSpec,
};
use strata_core::error::StrataError;
use strata_core::traits::RunPersistence;
use strata_core::types::{PersistedRunStatus, Routine, RunState, SwarmResources, VarMap};
use strata_engine::{
    RunRequest, SqliteStore, StrategyFactory, SwarmExecutionService, SwarmRequest,
};
use strata_test_utils::{fixtures, FailingBranchStore, InMemoryStore, LogCapture, ScriptedStrategy};

fn service(store: Arc<InMemoryStore>, config: EngineConfig) -> SwarmExecutionService {
    SwarmExecutionService::builder()
        .config(config)
        .store(store)
        .build()
        .expect("build service")
}

fn sqlite_service(store: Arc<SqliteStore>) -> SwarmExecutionService {
    SwarmExecutionService::builder()
        .store(store)
        .build()
        .expect("build service")
}

#[tokio::test]
async fn invalid_user_cannot_start_a_swarm() {
    let service = service(Arc::new(InMemoryStore::new()), EngineConfig::default());

    let err = service
        .start_swarm(SwarmRequest::new("invalid-user", "Research", 100))
        .await
        .unwrap_err();

    assert!(err.is_fatal());
    assert!(err.to_string().contains("User not found"));
    service.shutdown().await;
}

#[tokio::test]
async fn swarm_status_reports_remaining_credits() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(&dir.path().join("strata.db")).unwrap());
    store.add_user("u1").unwrap();
    let service = sqlite_service(store);

    let swarm_id = service
        .start_swarm(SwarmRequest::new("u1", "Audit invoices", 5000).with_resources(
            SwarmResources {
                max_credits: 5000,
                credits_used: 1234,
                ..Default::default()
            },
        ))
        .await
        .unwrap();

    let status = service.get_swarm_status(&swarm_id).await.unwrap();
    assert_eq!(status.resources.credits_remaining, 3766);
    assert_eq!(status.total_runs, 0);

    let rendered = serde_json::to_value(&status).unwrap();
    assert_eq!(rendered["resources"]["creditsRemaining"], json!(3766));
    service.shutdown().await;
}

#[tokio::test]
async fn shutdown_logs_tier_errors_and_completes() {
    let mut config = EngineConfig::default();
    config.shutdown.drain_timeout_ms = 50;
    let mut strategies = StrategyFactory::new();
    strategies.register(
        ScriptedStrategy::echo("deterministic").with_delay(Duration::from_secs(60)),
    );
    let store = Arc::new(InMemoryStore::new().with_user("u1"));
    let service = SwarmExecutionService::builder()
        .config(config)
        .store(store)
        .strategies(strategies)
        .build()
        .unwrap();

    service
        .start_run(RunRequest::new(fixtures::opaque_routine(), "u1"))
        .await
        .unwrap();
    for _ in 0..100 {
        if service.get_system_metrics().tier3.active > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(service.get_system_metrics().tier3.active, 1);

    let logs = LogCapture::new();
    let _guard = logs.install();
    service.shutdown().await;

    assert!(logs.contains("Error during shutdown"));
    assert!(logs.contains("tier3"));
    assert!(service.event_bus().is_closed());
}

#[tokio::test]
async fn unknown_tool_fails_the_run_with_not_found() {
    let store = Arc::new(InMemoryStore::new().with_user("u1"));
    let service = service(store.clone(), EngineConfig::default());
    let routine = Routine {
        id: "lookup-routine".into(),
        name: "Lookup".into(),
        graph_type: "sequential".into(),
        definition: json!({
            "steps": [{"id": "lookup", "strategy": "deterministic", "tool": "nonexistent"}]
        }),
        default_strategy: None,
    };

    let run_id = service.start_run(RunRequest::new(routine, "u1")).await.unwrap();
    let view = service.wait_for_run(&run_id).await.unwrap();

    assert_eq!(view.state, Some(RunState::Failed));
    assert!(view.error.unwrap().contains("Tool 'nonexistent' not found"));
    let stored = store.run(&run_id).unwrap();
    assert_eq!(stored.status, PersistedRunStatus::Failed);
    assert!(stored.steps[0]
        .error
        .as_deref()
        .unwrap()
        .contains("not found"));
    service.shutdown().await;
}

#[tokio::test]
async fn parallel_run_round_trips_through_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(&dir.path().join("strata.db")).unwrap());
    store.add_user("u1").unwrap();
    let service = sqlite_service(store.clone());

    let inputs = VarMap::from([("topic".to_string(), json!("rust"))]);
    let run_id = service
        .start_run(RunRequest::new(fixtures::parallel_routine(), "u1").with_inputs(inputs))
        .await
        .unwrap();
    service.wait_for_run(&run_id).await.unwrap();

    let stored = store.load_run(&run_id).await.unwrap().unwrap();
    assert_eq!(stored.status, PersistedRunStatus::Completed);
    assert_eq!(stored.record.inputs["topic"], json!("rust"));
    assert_eq!(stored.outputs["result"], json!(["left", "right"]));
    assert_eq!(stored.steps.len(), 2);

    let history = service.get_user_run_history("u1", 10, 0).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].run_id, run_id);
    service.shutdown().await;
}

#[tokio::test]
async fn branch_store_outage_does_not_fail_the_run() {
    let store = Arc::new(InMemoryStore::new().with_user("u1"));
    let service = SwarmExecutionService::builder()
        .store(store.clone())
        .branch_store(Arc::new(FailingBranchStore))
        .build()
        .unwrap();

    let logs = LogCapture::new();
    let _guard = logs.install();
    let run_id = service
        .start_run(RunRequest::new(fixtures::parallel_routine(), "u1"))
        .await
        .unwrap();
    let view = service.wait_for_run(&run_id).await.unwrap();

    assert_eq!(view.state, Some(RunState::Completed));
    assert_eq!(view.outputs["result"], json!(["left", "right"]));
    assert!(logs.contains("Failed to persist branch"));
    service.shutdown().await;
}

#[tokio::test]
async fn retry_recovers_a_flaky_step() {
    let mut config = EngineConfig::default();
    config.execution.recovery_strategy = RecoveryStrategy::Retry;
    config.execution.max_retries = 2;
    let flaky = Arc::new(ScriptedStrategy::flaky("deterministic", 2));
    let mut strategies = StrategyFactory::new();
    strategies.register_arc(flaky.clone());
    let service = SwarmExecutionService::builder()
        .config(config)
        .store(Arc::new(InMemoryStore::new().with_user("u1")))
        .strategies(strategies)
        .build()
        .unwrap();

    let run_id = service
        .start_run(RunRequest::new(fixtures::opaque_routine(), "u1"))
        .await
        .unwrap();
    let view = service.wait_for_run(&run_id).await.unwrap();

    assert_eq!(view.state, Some(RunState::Completed));
    assert_eq!(flaky.calls(), 3);
    service.shutdown().await;
}

#[tokio::test]
async fn organization_denial_fails_the_step() {
    let organization = OrganizationSpec {
        roles: HashMap::from([(
            "writer".to_string(),
            RoleSpec {
                strategies: vec!["conversational".into()],
                ..Default::default()
            },
        )]),
        teams: HashMap::from([(
            "core".to_string(),
            TeamSpec {
                members: HashMap::from([("agent-1".to_string(), vec!["writer".to_string()])]),
            },
        )]),
    };
    let execution = ExecutionConfig {
        agent_id: Some("agent-1".into()),
        team_id: Some("core".into()),
        on_gate_denied: GateDenialPolicy::Fail,
        ..Default::default()
    };
    let service = SwarmExecutionService::builder()
        .store(Arc::new(InMemoryStore::new().with_user("u1")))
        .organization(organization)
        .build()
        .unwrap();
    let mut denials = service.subscribe("moise.*");

    let run_id = service
        .start_run(RunRequest::new(fixtures::opaque_routine(), "u1").with_config(execution))
        .await
        .unwrap();
    let view = service.wait_for_run(&run_id).await.unwrap();

    assert_eq!(view.state, Some(RunState::Failed));
    assert!(view.error.unwrap().contains("Denied by organization"));
    assert_eq!(denials.try_recv().unwrap().event_type, "moise.denied");
    service.shutdown().await;
}

#[tokio::test]
async fn exhausted_swarm_rejects_new_runs() {
    let store = Arc::new(InMemoryStore::new().with_user("u1"));
    let service = service(store, EngineConfig::default());
    let swarm_id = service
        .start_swarm(SwarmRequest::new("u1", "Spent", 10).with_resources(SwarmResources {
            max_credits: 10,
            credits_used: 10,
            ..Default::default()
        }))
        .await
        .unwrap();

    let err = service
        .start_run(RunRequest::new(fixtures::opaque_routine(), "u1").in_swarm(swarm_id))
        .await
        .unwrap_err();
    assert!(matches!(err, StrataError::LimitExceeded(_)));
    service.shutdown().await;
}
