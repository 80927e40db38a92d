//! Kubernetes resource tests against a mocked Vultr API

use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use terraform_provider_vultr::cancel::{CancelToken, CancellationSource};
use terraform_provider_vultr::client::{ClientError, VultrClient};
use terraform_provider_vultr::resources::{
    KubernetesResource, Resource, ResourceContext, ResourceState, WaitSettings,
    DEFAULT_NODE_POOL_TAG,
};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const CLUSTER_PATH: &str = "/v2/kubernetes/clusters/c-1";
const CONFIG_PATH: &str = "/v2/kubernetes/clusters/c-1/config";

fn cluster_json(status: &str) -> Value {
    json!({
        "vke_cluster": {
            "id": "c-1",
            "label": "prod",
            "date_created": "2024-01-01T00:00:00+00:00",
            "cluster_subnet": "10.244.0.0/16",
            "service_subnet": "10.96.0.0/12",
            "ip": "203.0.113.10",
            "endpoint": "c-1.vultr-k8s.com",
            "version": "v1.28.2+1",
            "region": "ewr",
            "status": status,
            "node_pools": [{
                "id": "np-1",
                "date_created": "2024-01-01T00:00:00+00:00",
                "date_updated": "2024-01-01T00:00:00+00:00",
                "label": "workers",
                "plan": "vc2-2c-4gb",
                "status": status,
                "node_quantity": 2,
                "min_nodes": 2,
                "max_nodes": 2,
                "auto_scaler": false,
                "tag": DEFAULT_NODE_POOL_TAG,
                "nodes": [{
                    "id": "n-1",
                    "date_created": "2024-01-01T00:00:00+00:00",
                    "label": "workers-1",
                    "status": status
                }]
            }]
        }
    })
}

/// Answers GETs with the given statuses in order, repeating the last one
struct StatusSequence {
    calls: AtomicUsize,
    statuses: Vec<&'static str>,
}

impl StatusSequence {
    fn new(statuses: &[&'static str]) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            statuses: statuses.to_vec(),
        }
    }
}

impl Respond for StatusSequence {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let status = self.statuses[call.min(self.statuses.len() - 1)];
        ResponseTemplate::new(200).set_body_json(cluster_json(status))
    }
}

fn fast_wait() -> WaitSettings {
    WaitSettings {
        delay: Duration::ZERO,
        min_interval: Duration::from_millis(10),
        max_interval: Duration::from_millis(20),
        timeout: Duration::from_secs(5),
        not_found_checks: 3,
    }
}

fn context(server: &MockServer, cancel: CancelToken) -> ResourceContext {
    ResourceContext {
        client: VultrClient::new(&server.uri(), "test-key").unwrap(),
        cancel,
        wait: fast_wait(),
    }
}

fn state(value: Value) -> ResourceState {
    ResourceState::from_value(&value).unwrap()
}

async fn mount_kube_config(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(CONFIG_PATH))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"kube_config": "a3ViZWNvbmZpZw=="})),
        )
        .mount(server)
        .await;
}

// ============== Client Tests ==============

#[tokio::test]
async fn test_client_sends_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(CLUSTER_PATH))
        .and(header("authorization", "Bearer test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(cluster_json("active")))
        .expect(1)
        .mount(&server)
        .await;

    let client = VultrClient::new(&server.uri(), "test-key").unwrap();
    let cluster = client.get_cluster("c-1").await.unwrap();

    assert_eq!(cluster.status, "active");
    assert_eq!(cluster.node_pools[0].nodes[0].id, "n-1");
}

#[tokio::test]
async fn test_client_classifies_by_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/kubernetes/clusters/missing"))
        .respond_with(
            ResponseTemplate::new(404)
                .set_body_json(json!({"error": "Invalid resource ID", "status": 404})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/kubernetes/clusters/forbidden"))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_json(json!({"error": "Invalid API token.", "status": 401})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/kubernetes/clusters/broken"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .mount(&server)
        .await;

    let client = VultrClient::new(&server.uri(), "test-key").unwrap();

    match client.get_cluster("missing").await.unwrap_err() {
        ClientError::NotFound(message) => assert_eq!(message, "Invalid resource ID"),
        other => panic!("expected NotFound, got {:?}", other),
    }
    assert!(matches!(
        client.get_cluster("forbidden").await.unwrap_err(),
        ClientError::Unauthorized(_)
    ));
    match client.get_cluster("broken").await.unwrap_err() {
        ClientError::Api { status, message } => {
            assert_eq!(status, 500);
            assert_eq!(message, "upstream exploded");
        }
        other => panic!("expected Api, got {:?}", other),
    }
}

// ============== Resource Lifecycle Tests ==============

#[tokio::test]
async fn test_create_waits_until_active() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/kubernetes/clusters"))
        .and(body_partial_json(json!({"label": "prod", "region": "ewr"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(cluster_json("pending")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(CLUSTER_PATH))
        .respond_with(StatusSequence::new(&["pending", "pending", "active"]))
        .mount(&server)
        .await;
    mount_kube_config(&server).await;

    let ctx = context(&server, CancelToken::never());
    let planned = state(json!({
        "label": "prod",
        "region": "ewr",
        "version": "v1.28.2+1",
        "node_pools": [{
            "node_quantity": 2,
            "plan": "vc2-2c-4gb",
            "label": "workers"
        }]
    }));

    let created = KubernetesResource::new().create(&ctx, &planned).await.unwrap();

    assert_eq!(created.get_string("status").as_deref(), Some("active"));
    assert_eq!(created.get_string("kube_config").as_deref(), Some("a3ViZWNvbmZpZw=="));
    assert_eq!(created.get("node_pools").unwrap()[0]["id"], "np-1");

    let requests = server.received_requests().await.unwrap();
    let create_body: Value = requests
        .iter()
        .find(|r| r.method.as_str() == "POST")
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .unwrap();
    assert_eq!(create_body["node_pools"][0]["tag"], DEFAULT_NODE_POOL_TAG);

    // Three polls until active, one more for the final read
    let polls = requests
        .iter()
        .filter(|r| r.method.as_str() == "GET" && r.url.path() == CLUSTER_PATH)
        .count();
    assert_eq!(polls, 4);
}

#[tokio::test]
async fn test_create_reports_unexpected_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/kubernetes/clusters"))
        .respond_with(ResponseTemplate::new(201).set_body_json(cluster_json("pending")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(CLUSTER_PATH))
        .respond_with(StatusSequence::new(&["pending", "failed"]))
        .mount(&server)
        .await;

    let ctx = context(&server, CancelToken::never());
    let planned = state(json!({"label": "prod", "region": "ewr", "version": "v1.28.2+1"}));

    let failure = KubernetesResource::new()
        .create(&ctx, &planned)
        .await
        .unwrap_err();

    assert!(failure.diagnostics[0].summary.contains("waiting for kubernetes cluster c-1"));
    assert!(failure.diagnostics[0].summary.contains("unexpected state 'failed'"));

    // The cluster exists remotely, so its ID must still reach state
    let partial = failure.partial_state.expect("partial state for created cluster");
    assert_eq!(partial.get_string("id").as_deref(), Some("c-1"));
}

#[tokio::test]
async fn test_create_stops_when_cancelled() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/kubernetes/clusters"))
        .respond_with(ResponseTemplate::new(201).set_body_json(cluster_json("pending")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(CLUSTER_PATH))
        .respond_with(StatusSequence::new(&["pending"]))
        .mount(&server)
        .await;

    let source = CancellationSource::new();
    let ctx = context(&server, source.token());
    let planned = state(json!({"label": "prod", "region": "ewr", "version": "v1.28.2+1"}));

    let canceller = source.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let failure = KubernetesResource::new()
        .create(&ctx, &planned)
        .await
        .unwrap_err();

    assert!(failure.diagnostics[0].summary.contains("cancelled"));
    let partial = failure.partial_state.expect("partial state for created cluster");
    assert_eq!(partial.get_string("id").as_deref(), Some("c-1"));
}

#[tokio::test]
async fn test_create_rejected_by_api_records_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/kubernetes/clusters"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(json!({"error": "invalid region"})),
        )
        .mount(&server)
        .await;

    let ctx = context(&server, CancelToken::never());
    let planned = state(json!({"label": "prod", "region": "nope", "version": "v1.28.2+1"}));

    let failure = KubernetesResource::new()
        .create(&ctx, &planned)
        .await
        .unwrap_err();

    assert!(failure.partial_state.is_none());
    assert!(failure.diagnostics[0].summary.contains("invalid region"));
}

#[tokio::test]
async fn test_read_missing_cluster_returns_empty_state() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(CLUSTER_PATH))
        .respond_with(
            ResponseTemplate::new(404)
                .set_body_json(json!({"error": "Invalid resource ID", "status": 404})),
        )
        .mount(&server)
        .await;

    let ctx = context(&server, CancelToken::never());
    let current = state(json!({"id": "c-1"}));

    let read = KubernetesResource::new().read(&ctx, &current).await.unwrap();
    assert!(read.is_empty());
}

#[tokio::test]
async fn test_read_unauthorized_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(CLUSTER_PATH))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_json(json!({"error": "Invalid API token.", "status": 401})),
        )
        .mount(&server)
        .await;

    let ctx = context(&server, CancelToken::never());
    let current = state(json!({"id": "c-1"}));

    let diagnostics = KubernetesResource::new()
        .read(&ctx, &current)
        .await
        .unwrap_err();
    assert!(diagnostics[0].summary.starts_with("API authorization error"));
}

#[tokio::test]
async fn test_update_scales_node_pool() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path(CLUSTER_PATH))
        .and(body_partial_json(json!({"label": "renamed"})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/v2/kubernetes/clusters/c-1/node-pools/np-1"))
        .and(body_partial_json(json!({"node_quantity": 4})))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({
            "node_pool": {"id": "np-1", "node_quantity": 4, "tag": DEFAULT_NODE_POOL_TAG}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(CLUSTER_PATH))
        .respond_with(StatusSequence::new(&["active"]))
        .mount(&server)
        .await;
    mount_kube_config(&server).await;

    let ctx = context(&server, CancelToken::never());
    let current = state(json!({
        "id": "c-1",
        "label": "prod",
        "node_pools": [{"id": "np-1", "node_quantity": 2, "plan": "vc2-2c-4gb", "label": "workers"}]
    }));
    let planned = state(json!({
        "id": "c-1",
        "label": "renamed",
        "node_pools": [{"id": "np-1", "node_quantity": 4, "plan": "vc2-2c-4gb", "label": "workers"}]
    }));

    let updated = KubernetesResource::new()
        .update(&ctx, &current, &planned)
        .await
        .unwrap();
    assert_eq!(updated.get_string("id").as_deref(), Some("c-1"));
}

#[tokio::test]
async fn test_update_removes_node_pool() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/v2/kubernetes/clusters/c-1/node-pools/np-1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(CLUSTER_PATH))
        .respond_with(StatusSequence::new(&["active"]))
        .mount(&server)
        .await;
    mount_kube_config(&server).await;

    let ctx = context(&server, CancelToken::never());
    let current = state(json!({
        "id": "c-1",
        "label": "prod",
        "node_pools": [{"id": "np-1", "node_quantity": 2}]
    }));
    let planned = state(json!({"id": "c-1", "label": "prod", "node_pools": []}));

    KubernetesResource::new()
        .update(&ctx, &current, &planned)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_update_adds_node_pool_with_default_tag() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/kubernetes/clusters/c-1/node-pools"))
        .and(body_partial_json(json!({"tag": DEFAULT_NODE_POOL_TAG, "plan": "vc2-1c-2gb"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "node_pool": {"id": "np-2", "tag": DEFAULT_NODE_POOL_TAG}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(CLUSTER_PATH))
        .respond_with(StatusSequence::new(&["active"]))
        .mount(&server)
        .await;
    mount_kube_config(&server).await;

    let ctx = context(&server, CancelToken::never());
    let current = state(json!({"id": "c-1", "label": "prod", "node_pools": []}));
    let planned = state(json!({
        "id": "c-1",
        "label": "prod",
        "node_pools": [{"node_quantity": 1, "plan": "vc2-1c-2gb", "label": "extra"}]
    }));

    KubernetesResource::new()
        .update(&ctx, &current, &planned)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_delete_ignores_missing_cluster() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path(CLUSTER_PATH))
        .respond_with(
            ResponseTemplate::new(404)
                .set_body_json(json!({"error": "Invalid resource ID", "status": 404})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let ctx = context(&server, CancelToken::never());
    let current = state(json!({"id": "c-1"}));

    KubernetesResource::new().delete(&ctx, &current).await.unwrap();
}
