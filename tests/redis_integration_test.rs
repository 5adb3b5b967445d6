mod common;

use common::*;
use resumable::runtime::redis_storage::RedisStateManager;
use resumable::{FlowError, FlowState, Orchestrator, OrchestratorConfig, StateManager};
use serde_json::json;
use std::sync::Arc;

// Override with REDIS_URL, e.g. redis://:password@localhost:6379/6
fn redis_client() -> redis::Client {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/6".to_string());
    redis::Client::open(url).expect("Invalid Redis URL")
}

fn redis_orchestrator() -> (Arc<RecordingHost>, Arc<RedisStateManager>, Orchestrator) {
    init_tracing();
    let config = OrchestratorConfig {
        key_prefix: format!("resumable-test-{}", uuid::Uuid::new_v4()),
        ..OrchestratorConfig::default()
    };
    let store = Arc::new(RedisStateManager::from_config(redis_client(), &config));
    let host = Arc::new(RecordingHost::default());
    let orchestrator = Orchestrator::new(host.clone(), store.clone(), registry()).with_config(config);
    (host, store, orchestrator)
}

#[tokio::test]
#[ignore] // Needs a running Redis
async fn test_redis_round_trip() {
    let (host, store, orchestrator) = redis_orchestrator();

    let id1 = orchestrator.start(TwoYields::new()).await.unwrap().suspensions()[0].id;
    assert_eq!(store.depth(id1).await.unwrap(), 2);

    let id2 = orchestrator
        .resume(id1, Some(Ok(json!("a"))))
        .await
        .unwrap()
        .suspensions()[0]
        .id;
    assert!(matches!(orchestrator.resume(id1, None).await, Err(FlowError::UnknownFlow(_))));

    let done = orchestrator.resume(id2, Some(Ok(json!("b")))).await.unwrap();
    assert_eq!(done, FlowState::Succeeded(json!(["a", "b"])));
    assert_eq!(host.successes().len(), 1);
    assert_eq!(store.depth(id2).await.unwrap(), 0);
}

#[tokio::test]
#[ignore] // Needs a running Redis
async fn test_redis_shared_heap_and_branches() {
    let (_host, _store, orchestrator) = redis_orchestrator();

    let cart = Arc::new(Cart {
        items: vec!["tea".into()],
    });
    let id = orchestrator.start(Checkout::new("R-1", cart)).await.unwrap().suspensions()[0].id;
    let done = orchestrator.resume(id, None).await.unwrap();
    assert!(matches!(done, FlowState::Succeeded(v) if v["shared_with_callee"] == json!(true)));

    let state = orchestrator.start(FanOut::new(&["x", "y"])).await.unwrap();
    let ids: Vec<_> = state.suspensions().iter().map(|s| s.id).collect();
    assert!(matches!(
        orchestrator.resume(ids[1], Some(Ok(json!(2)))).await.unwrap(),
        FlowState::Joined { .. }
    ));
    let done = orchestrator.resume(ids[0], Some(Ok(json!(1)))).await.unwrap();
    assert_eq!(done, FlowState::Succeeded(json!([1, 2])));
}
