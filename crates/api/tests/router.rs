use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use cairn_api::{router, ApiState, MANIFEST_PATH, RPC_PATH};
use cairn_catalog::{Catalog, Context};
use cairn_core::{CatalogConfig, ComponentDescriptor, ConfigParameter, Error, Settings};
use cairn_kubehub::MemoryStore;
use serde_json::{json, Value};
use tower::ServiceExt;

fn state() -> ApiState {
    let config = CatalogConfig { parameters: vec![ConfigParameter { name: "domain".into(), default: "local.gd".into() }] };
    let mut ctx = Context::new(Catalog::new("img:1", config), Settings::default(), Arc::new(MemoryStore::new()), "cairn");
    ctx.catalog.add_component(
        "test",
        ComponentDescriptor { repo: "https://charts.test.com".into(), chart: "test/test".into(), version: "1.0.0".into(), ..Default::default() },
    );
    ctx.functions.register_fn("echo", |p| async move { Ok(Value::Object(p)) });
    ctx.functions.register_fn("slow", |_| async { Err(Error::Timeout("took too long".into())) });
    ApiState::from_context(&ctx).unwrap()
}

async fn send(req: Request<Body>) -> (StatusCode, Value) {
    let resp = router(state()).oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn rpc(body: &str) -> Request<Body> {
    Request::post(RPC_PATH).header("content-type", "application/json").body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn manifest_lists_components_and_config() {
    let (status, body) = send(Request::get(MANIFEST_PATH).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["hookSource"], "img:1");
    assert_eq!(body["components"]["test"]["chart"], "test/test");
    assert_eq!(body["config"]["parameters"][0]["default"], "local.gd");
}

#[tokio::test]
async fn rpc_returns_result() {
    let (status, body) = send(rpc(r#"{"method": "echo", "params": {"a": "1"}}"#)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"result": {"a": "1"}}));
}

#[tokio::test]
async fn rpc_errors_keep_shape_and_status() {
    let (status, body) = send(rpc("{not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, body) = send(rpc(r#"{"method": "missing"}"#)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "method not found: missing");

    let (status, _) = send(rpc(r#"{"method": "slow"}"#)).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);

    let (status, body) = send(rpc(r#"{"method": "create-oidc-client", "params": {"name": "x", "provider": "keycloak"}}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("keycloak"));

    let (status, _) = send(rpc(r#"{"method": "create-application", "params": {"name": "web"}}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
