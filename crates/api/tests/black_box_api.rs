use std::time::Duration;

use catalog_api::app::{self, services};
use catalog_infra::{AppConfig, RetryPolicy};
use reqwest::StatusCode;
use serde_json::json;

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
    runtime: Option<services::Runtime>,
}

impl TestServer {
    async fn spawn() -> Self {
        // Same wiring as prod (in-memory backend), bound to an ephemeral port.
        let config = AppConfig {
            partitions: 4,
            poll_interval: Duration::from_millis(5),
            retry: RetryPolicy::fixed(3, Duration::from_millis(5)),
            ..AppConfig::default()
        };
        let runtime = services::bootstrap(&config).await.expect("in-memory backend starts");
        let app = app::build_app(runtime.services());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            handle,
            runtime: Some(runtime),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn stop(mut self) {
        self.handle.abort();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown().await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn create(client: &reqwest::Client, srv: &TestServer, body: serde_json::Value) -> serde_json::Value {
    let res = client.post(srv.url("/products")).json(&body).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    res.json().await.unwrap()
}

/// Reads are eventually consistent with commands; poll until `done` holds.
async fn get_eventually<F>(client: &reqwest::Client, url: &str, done: F) -> (StatusCode, serde_json::Value)
where
    F: Fn(StatusCode, &serde_json::Value) -> bool,
{
    for _ in 0..200 {
        let res = client.get(url).send().await.unwrap();
        let status = res.status();
        let body: serde_json::Value = res.json().await.unwrap_or(serde_json::Value::Null);
        if done(status, &body) {
            return (status, body);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("read model did not reach the expected state within timeout: {url}");
}

#[tokio::test]
async fn health_is_public() {
    let srv = TestServer::spawn().await;

    let res = reqwest::get(srv.url("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    srv.stop().await;
}

#[tokio::test]
async fn cross_origin_requests_are_allowed() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .get(srv.url("/health"))
        .header("origin", "http://shop.example")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["access-control-allow-origin"], "*");

    let preflight = client
        .request(reqwest::Method::OPTIONS, srv.url("/products"))
        .header("origin", "http://shop.example")
        .header("access-control-request-method", "POST")
        .header("access-control-request-headers", "content-type")
        .send()
        .await
        .unwrap();
    assert!(preflight.status().is_success());
    assert_eq!(preflight.headers()["access-control-allow-origin"], "*");
    assert!(preflight.headers().contains_key("access-control-allow-methods"));

    srv.stop().await;
}

#[tokio::test]
async fn product_lifecycle_create_update_delete() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let created = create(
        &client,
        &srv,
        json!({"name": "Desk", "description": "oak", "price": 120.5, "stock": 3}),
    )
    .await;
    assert_eq!(created["version"], 0);
    assert_eq!(created["published"], true);
    assert!(created.get("warning").is_none());
    let id = created["id"].as_str().unwrap().to_string();
    let item_url = srv.url(&format!("/products/{id}"));

    let (_, body) = get_eventually(&client, &item_url, |s, _| s == StatusCode::OK).await;
    assert_eq!(body["name"], "Desk");
    assert_eq!(body["description"], "oak");
    assert_eq!(body["stock"], 3);
    assert_eq!(body["version"], 0);

    let res = client
        .put(&item_url)
        .json(&json!({"name": "Standing desk", "price": 300.0, "stock": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let updated: serde_json::Value = res.json().await.unwrap();
    assert_eq!(updated["version"], 1);

    let (_, body) = get_eventually(&client, &item_url, |_, b| b["version"] == 1).await;
    assert_eq!(body["name"], "Standing desk");
    assert!(body["description"].is_null());

    let res = client.delete(&item_url).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let deleted: serde_json::Value = res.json().await.unwrap();
    assert_eq!(deleted["version"], 2);

    let (status, body) = get_eventually(&client, &item_url, |s, _| s == StatusCode::NOT_FOUND).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    // Deleted ids are never reused.
    let res = client
        .post(srv.url("/products"))
        .json(&json!({"id": id, "name": "Desk", "price": 1.0, "stock": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    srv.stop().await;
}

#[tokio::test]
async fn invalid_requests_map_to_json_errors() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(srv.url("/products"))
        .json(&json!({"name": "  ", "price": 1.0, "stock": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");

    let res = client
        .post(srv.url("/products"))
        .json(&json!({"name": "Lamp", "price": -2.0, "stock": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .post(srv.url("/products"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_body");

    let res = client.get(srv.url("/products/not-a-uuid")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_id");

    let missing = uuid::Uuid::now_v7();
    let res = client
        .put(srv.url(&format!("/products/{missing}")))
        .json(&json!({"name": "Ghost", "price": 1.0, "stock": 0}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client.delete(srv.url(&format!("/products/{missing}"))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    srv.stop().await;
}

#[tokio::test]
async fn duplicate_create_with_same_id_conflicts() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let id = uuid::Uuid::now_v7().to_string();

    let created = create(&client, &srv, json!({"id": id, "name": "Chair", "price": 40.0, "stock": 10})).await;
    assert_eq!(created["id"], id.as_str());

    let res = client
        .post(srv.url("/products"))
        .json(&json!({"id": id, "name": "Chair again", "price": 41.0, "stock": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "conflict");

    srv.stop().await;
}

#[tokio::test]
async fn listing_and_pagination_follow_name_order() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    for name in ["echo", "alpha", "delta", "charlie", "bravo"] {
        create(&client, &srv, json!({"name": name, "price": 1.0, "stock": 1})).await;
    }

    let (_, all) = get_eventually(&client, &srv.url("/products"), |_, b| {
        b["items"].as_array().map(|a| a.len() == 5).unwrap_or(false)
    })
    .await;
    assert_eq!(all["items"].as_array().unwrap().len(), 5);

    let names = |page: &serde_json::Value| -> Vec<String> {
        page["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["name"].as_str().unwrap().to_string())
            .collect()
    };

    let first: serde_json::Value = client
        .get(srv.url("/products/page?limit=2&offset=0"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["total"], 5);
    assert_eq!(first["limit"], 2);
    assert_eq!(names(&first), vec!["alpha", "bravo"]);

    let last: serde_json::Value = client
        .get(srv.url("/products/page?limit=2&offset=4"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(names(&last), vec!["echo"]);
    assert_eq!(last["offset"], 4);

    let beyond: serde_json::Value = client
        .get(srv.url("/products/page?limit=2&offset=10"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(beyond["items"].as_array().unwrap().is_empty());
    assert_eq!(beyond["total"], 5);

    let clamped: serde_json::Value = client
        .get(srv.url("/products/page?limit=0"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(clamped["limit"], 1);

    srv.stop().await;
}

#[tokio::test]
async fn dead_letter_admin_endpoints() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.get(srv.url("/admin/dead-letters")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert!(body["items"].as_array().unwrap().is_empty());

    let res = client
        .post(srv.url(&format!("/admin/dead-letters/{}/replay", uuid::Uuid::now_v7())))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    srv.stop().await;
}
