mod common;

use common::MockNode;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

use stargate_deploy::datacenter::Datacenter;
use stargate_deploy::deployment::{Deployment, DeploymentState};
use stargate_deploy::error::DeployError;
use stargate_deploy::executor::{ApiRequest, Backoff, CallExecutor, RetryPolicy, DEFAULT_TOKEN_HEADER};
use stargate_deploy::loadbalancer::LoadBalancingPolicy;
use stargate_deploy::node::Node;
use stargate_deploy::token::StaticTokenProvider;

fn datacenter(id: &str, nodes: Vec<Node>) -> Datacenter {
    Datacenter::new(
        id,
        Arc::new(StaticTokenProvider::new("static-token")),
        LoadBalancingPolicy::RoundRobin,
        nodes,
    )
    .unwrap()
}

fn executor(deployment: Arc<Deployment>) -> CallExecutor {
    let retry = RetryPolicy {
        max_attempts: 3,
        delay: Duration::from_millis(10),
        backoff: Backoff::Fixed,
    };
    let client = Client::builder().timeout(Duration::from_secs(5)).build().unwrap();
    CallExecutor::new(deployment, client, retry, DEFAULT_TOKEN_HEADER).unwrap()
}

struct TwoDatacenters {
    n1: MockNode,
    n2: MockNode,
    n3: MockNode,
    deployment: Arc<Deployment>,
    executor: CallExecutor,
}

async fn two_datacenters() -> TwoDatacenters {
    let n1 = MockNode::start("n1").await;
    let n2 = MockNode::start("n2").await;
    let n3 = MockNode::start("n3").await;
    let deployment = Arc::new(
        Deployment::new(
            vec![
                datacenter("dc1", vec![n1.node("n1"), n2.node("n2")]),
                datacenter("dc2", vec![n3.node("n3")]),
            ],
            "dc1",
        )
        .unwrap(),
    );
    let executor = executor(deployment.clone());
    TwoDatacenters {
        n1,
        n2,
        n3,
        deployment,
        executor,
    }
}

#[test_log::test(tokio::test)]
async fn test_node_then_datacenter_failover() {
    let t = two_datacenters().await;
    t.n1.respond_with(503);
    t.n2.respond_with(503);

    let response = t.executor.get("/v2/schemas/keyspaces").await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body, "n3");
    assert_eq!(response.datacenter, "dc2");
    assert_eq!(t.n1.hits(), 3);
    assert_eq!(t.n2.hits(), 3);
    assert_eq!(t.n3.hits(), 1);

    assert_eq!(t.deployment.local_datacenter(), "dc2");
    assert_eq!(t.deployment.datacenter_failovers(), 1);
    assert_eq!(t.deployment.is_datacenter_available("dc1"), Some(false));
    let snapshot = t.deployment.snapshot();
    assert_eq!(snapshot.node_failovers, 2);
    assert_eq!(snapshot.state, DeploymentState::Normal("dc2".to_string()));
}

#[tokio::test]
async fn test_failover_persists_for_later_calls() {
    let t = two_datacenters().await;
    t.n1.respond_with(503);
    t.n2.respond_with(503);

    t.executor.get("/v1/keyspaces").await.unwrap();
    t.executor.get("/v1/keyspaces").await.unwrap();

    assert_eq!(t.n1.hits(), 3);
    assert_eq!(t.n2.hits(), 3);
    assert_eq!(t.n3.hits(), 2);
}

#[tokio::test]
async fn test_round_robin_spreads_calls() {
    let t = two_datacenters().await;

    for _ in 0..4 {
        let response = t.executor.get("/v1/keyspaces").await.unwrap();
        assert_eq!(response.datacenter, "dc1");
    }

    assert_eq!(t.n1.hits(), 2);
    assert_eq!(t.n2.hits(), 2);
    assert_eq!(t.n3.hits(), 0);
}

#[tokio::test]
async fn test_transient_failure_recovers_on_same_node() {
    let t = two_datacenters().await;
    t.n1.fail_next(2);

    let response = t.executor.get("/v1/keyspaces").await.unwrap();
    assert_eq!(response.node, "n1");
    assert_eq!(t.n1.hits(), 3);
    assert_eq!(t.deployment.snapshot().node_failovers, 0);
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let t = two_datacenters().await;
    t.n1.respond_with(404);

    let err = t.executor.get("/v2/keyspaces/missing").await.unwrap_err();

    assert!(matches!(err, DeployError::Application { status: 404, .. }));
    assert_eq!(t.n1.hits(), 1);
    assert_eq!(t.n2.hits(), 0);
    assert_eq!(t.deployment.snapshot().node_failovers, 0);
    assert_eq!(t.deployment.local_datacenter(), "dc1");
}

#[tokio::test]
async fn test_deployment_fails_when_every_node_is_down() {
    let t = two_datacenters().await;
    for node in [&t.n1, &t.n2, &t.n3] {
        node.respond_with(503);
    }

    let err = t.executor.get("/v1/keyspaces").await.unwrap_err();
    assert!(matches!(err, DeployError::DeploymentFailed));
    assert_eq!(t.deployment.state(), DeploymentState::Failed);
    assert_eq!(t.n1.hits() + t.n2.hits() + t.n3.hits(), 9);

    // Terminal: later calls fail without touching any node.
    let err = t.executor.get("/v1/keyspaces").await.unwrap_err();
    assert!(matches!(err, DeployError::DeploymentFailed));
    assert_eq!(t.n1.hits() + t.n2.hits() + t.n3.hits(), 9);
}

#[tokio::test]
async fn test_reset_recovers_failed_deployment() {
    let t = two_datacenters().await;
    for node in [&t.n1, &t.n2, &t.n3] {
        node.respond_with(503);
    }
    assert!(t.executor.get("/v1/keyspaces").await.is_err());

    for node in [&t.n1, &t.n2, &t.n3] {
        node.respond_with(200);
    }
    t.deployment.reset_all();

    let response = t.executor.get("/v1/keyspaces").await.unwrap();
    assert_eq!(response.datacenter, "dc1");
    assert_eq!(t.deployment.state(), DeploymentState::Normal("dc1".to_string()));
}

#[tokio::test]
async fn test_concurrent_calls_fail_over_datacenter_once() {
    let t = Arc::new(two_datacenters().await);
    t.n1.respond_with(503);
    t.n2.respond_with(503);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let t = t.clone();
        handles.push(tokio::spawn(async move { t.executor.get("/v1/keyspaces").await }));
    }
    for handle in handles {
        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.datacenter, "dc2");
    }

    assert_eq!(t.deployment.datacenter_failovers(), 1);
    assert_eq!(t.deployment.snapshot().node_failovers, 2);
    assert_eq!(t.deployment.local_datacenter(), "dc2");
}

#[tokio::test]
async fn test_disabled_node_is_skipped() {
    let t = two_datacenters().await;
    assert!(t.deployment.disable_node("dc1", "n1").unwrap());

    for _ in 0..3 {
        assert_eq!(t.executor.get("/v1/keyspaces").await.unwrap().node, "n2");
    }
    assert_eq!(t.n1.hits(), 0);
}

#[tokio::test]
async fn test_request_carries_token_and_body() {
    let t = two_datacenters().await;
    let request = ApiRequest::post(r#"{"name":"ks"}"#).with_header("X-Cassandra-Token", "ignored");

    let response = t
        .executor
        .execute(|node| node.url_for("/v2/schemas/keyspaces"), request)
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(t.n1.seen_tokens(), vec!["static-token".to_string()]);
}

#[tokio::test]
async fn test_malformed_header_fails_only_the_call() {
    let t = two_datacenters().await;
    let request = ApiRequest::get().with_header("X-Trace", "bad\nvalue");

    let err = t
        .executor
        .execute(|node| node.url_for("/v1/keyspaces"), request)
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::InvalidRequest(_)));
    assert_eq!(t.n1.hits() + t.n2.hits() + t.n3.hits(), 0);
    assert_eq!(t.deployment.state(), DeploymentState::Normal("dc1".to_string()));
    assert_eq!(t.deployment.snapshot().node_failovers, 0);

    let response = t.executor.get("/v1/keyspaces").await.unwrap();
    assert_eq!(response.datacenter, "dc1");
}

#[tokio::test]
async fn test_unparsable_url_fails_only_the_call() {
    let t = two_datacenters().await;

    let err = t
        .executor
        .execute(|_| "not a url".to_string(), ApiRequest::get())
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::InvalidRequest(_)));
    assert_eq!(t.deployment.state(), DeploymentState::Normal("dc1".to_string()));
    assert_eq!(t.deployment.datacenter_failovers(), 0);
    assert!(t.executor.get("/v1/keyspaces").await.is_ok());
}
