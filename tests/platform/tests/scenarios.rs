use std::time::Duration;

use orama_gateway::BlobStore as _;
use orama_registry::{
    DeploymentId, DeploymentKind, DeploymentRecord, NamespaceName, RegistryStore as _,
    model::subdomain_for,
};
use platform_tests::{TEST_BASE_DOMAIN, TestPlatform};
use serde_json::{Value, json};
use tokio::time::{sleep, timeout};

const POLL_BUDGET: Duration = Duration::from_secs(60);

async fn auth_request(platform: &TestPlatform, client: &reqwest::Client, namespace: &str) -> (u16, Value) {
    let response = client
        .post(format!("{}/v1/auth/api-key", platform.base_url))
        .json(&json!({
            "wallet": "0xabc123",
            "nonce": "nonce-1",
            "signature": "sig-1",
            "namespace": namespace,
        }))
        .send()
        .await
        .expect("auth request");
    let status = response.status().as_u16();
    let body: Value = response.json().await.expect("auth body");
    (status, body)
}

async fn poll_until_state(
    platform: &TestPlatform,
    client: &reqwest::Client,
    cluster_id: &str,
    wanted: &str,
) -> Value {
    timeout(POLL_BUDGET, async {
        loop {
            let response = client
                .get(format!(
                    "{}/v1/namespace/status?id={cluster_id}",
                    platform.base_url
                ))
                .send()
                .await
                .expect("status request");
            if response.status().is_success() {
                let body: Value = response.json().await.expect("status body");
                if body["status"] == wanted {
                    return body;
                }
            }
            sleep(Duration::from_millis(250)).await;
        }
    })
    .await
    .expect("cluster did not reach the wanted state in time")
}

#[tokio::test]
async fn auth_flow_provisions_namespace_to_ready() {
    let platform = TestPlatform::start().await;
    let client = reqwest::Client::new();

    let (status, body) = auth_request(&platform, &client, "acme").await;
    assert_eq!(status, 202);
    assert_eq!(body["status"], "provisioning");
    let cluster_id = body["cluster_id"].as_str().expect("cluster id").to_owned();
    assert!(
        body["poll_url"]
            .as_str()
            .expect("poll url")
            .contains(&cluster_id)
    );

    let ready = poll_until_state(&platform, &client, &cluster_id, "ready").await;
    assert_eq!(ready["namespace"], "acme");
    assert_eq!(ready["nodes"].as_array().map(Vec::len), Some(3));
    for bit in ["sql_ready", "cache_ready", "gateway_ready", "dns_ready"] {
        assert_eq!(ready[bit], true, "{bit} should be set");
    }

    // Re-authenticating against a ready namespace yields a key immediately.
    let (status, body) = auth_request(&platform, &client, "acme").await;
    assert_eq!(status, 200);
    assert!(body["api_key"].as_str().expect("api key").starts_with("ok."));
    assert_eq!(body["cluster_id"], Value::String(cluster_id));
}

#[tokio::test]
async fn default_namespace_issues_key_without_provisioning() {
    let platform = TestPlatform::start().await;
    let client = reqwest::Client::new();

    let (status, body) = auth_request(&platform, &client, "default").await;
    assert_eq!(status, 200);
    assert_eq!(body["namespace"], "default");
    let api_key = body["api_key"].as_str().expect("api key").to_owned();

    // The default namespace can never be deleted.
    let response = client
        .delete(format!("{}/v1/namespace/delete", platform.base_url))
        .bearer_auth(&api_key)
        .send()
        .await
        .expect("delete request");
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn status_of_unknown_cluster_is_not_found() {
    let platform = TestPlatform::start().await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!(
            "{}/v1/namespace/status?id=cl_ffffffffffffffff",
            platform.base_url
        ))
        .send()
        .await
        .expect("status request");
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn cross_namespace_requests_are_forbidden_never_not_found() {
    let platform = TestPlatform::start().await;
    let client = reqwest::Client::new();

    for namespace in ["alpha", "bravo"] {
        let (status, body) = auth_request(&platform, &client, namespace).await;
        assert_eq!(status, 202);
        let cluster_id = body["cluster_id"].as_str().unwrap().to_owned();
        poll_until_state(&platform, &client, &cluster_id, "ready").await;
    }

    let (_, alpha_auth) = auth_request(&platform, &client, "alpha").await;
    let alpha_key = alpha_auth["api_key"].as_str().unwrap().to_owned();

    // Alpha's key presented against bravo's namespace host: 403, not 404.
    let response = client
        .get(format!("{}/v1-query", platform.base_url))
        .header("Host", format!("ns-bravo.{TEST_BASE_DOMAIN}"))
        .bearer_auth(&alpha_key)
        .send()
        .await
        .expect("cross-namespace request");
    assert_eq!(response.status().as_u16(), 403);

    // No credentials at all is an auth failure, not an isolation violation.
    let response = client
        .get(format!("{}/v1-query", platform.base_url))
        .header("Host", format!("ns-bravo.{TEST_BASE_DOMAIN}"))
        .send()
        .await
        .expect("anonymous request");
    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
async fn deployments_with_the_same_name_stay_isolated() {
    let platform = TestPlatform::start().await;
    let client = reqwest::Client::new();

    // Two namespaces each deploy an app called "webapp".
    let mut subdomains = Vec::new();
    for (namespace, content) in [("alpha", "alpha site"), ("bravo", "bravo site")] {
        let (status, body) = auth_request(&platform, &client, namespace).await;
        assert_eq!(status, 202);
        let cluster_id = body["cluster_id"].as_str().unwrap().to_owned();
        poll_until_state(&platform, &client, &cluster_id, "ready").await;

        let ns = platform
            .store
            .namespace_by_name(&NamespaceName::parse(namespace).unwrap())
            .await
            .unwrap()
            .unwrap();
        let content_id = platform
            .blobs
            .put(content.as_bytes())
            .await
            .expect("blob upload");
        let subdomain = subdomain_for("webapp");
        platform
            .store
            .insert_deployment(DeploymentRecord {
                id: DeploymentId::generate(),
                namespace_id: ns.id,
                name: "webapp".into(),
                subdomain: subdomain.clone(),
                content_id,
                kind: DeploymentKind::Static,
            })
            .await
            .expect("deployment insert");
        subdomains.push(subdomain);
    }
    platform.routes.refresh().await.expect("route refresh");

    for (subdomain, expected) in subdomains.iter().zip(["alpha site", "bravo site"]) {
        let response = client
            .get(format!("{}/", platform.base_url))
            .header("Host", format!("{subdomain}.{TEST_BASE_DOMAIN}"))
            .send()
            .await
            .expect("deployment request");
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(response.text().await.unwrap(), expected);
    }

    // Unknown subdomains are plain 404s.
    let response = client
        .get(format!("{}/", platform.base_url))
        .header("Host", format!("ghost-000000.{TEST_BASE_DOMAIN}"))
        .send()
        .await
        .expect("unknown deployment request");
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn namespace_delete_tears_the_cluster_down() {
    let platform = TestPlatform::start().await;
    let client = reqwest::Client::new();

    let (status, body) = auth_request(&platform, &client, "acme").await;
    assert_eq!(status, 202);
    let cluster_id = body["cluster_id"].as_str().unwrap().to_owned();
    poll_until_state(&platform, &client, &cluster_id, "ready").await;

    let (_, auth) = auth_request(&platform, &client, "acme").await;
    let api_key = auth["api_key"].as_str().unwrap().to_owned();

    let response = client
        .delete(format!("{}/v1/namespace/delete", platform.base_url))
        .bearer_auth(&api_key)
        .send()
        .await
        .expect("delete request");
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "deleted");
    assert_eq!(body["namespace"], "acme");

    poll_until_state(&platform, &client, &cluster_id, "gone").await;
    assert_eq!(platform.fabric.running_instances().await, 0);

    // All ports came back: a fresh provisioning run succeeds end to end.
    let (status, body) = auth_request(&platform, &client, "acme").await;
    assert_eq!(status, 202);
    let second_id = body["cluster_id"].as_str().unwrap().to_owned();
    assert_ne!(second_id, cluster_id);
    poll_until_state(&platform, &client, &second_id, "ready").await;
}
