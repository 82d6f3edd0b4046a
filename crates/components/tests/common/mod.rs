#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use cairn_core::{Params, Settings};
use cairn_functions::testing::RecordingFunction;
use cairn_functions::{FunctionDispatcher, CREATE_OIDC_CLIENT};
use serde_json::json;

pub async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

pub fn settings(url: &str) -> Settings {
    Settings {
        authentik_url: url.to_string(),
        concourse_url: url.to_string(),
        argocd_url: url.to_string(),
        http_timeout: Duration::from_secs(5),
        health_interval: Duration::from_millis(50),
        health_deadline: Duration::from_secs(5),
        ..Default::default()
    }
}

/// Dispatcher whose OIDC capability hands out fixed credentials.
pub fn functions_with_oidc() -> (Arc<FunctionDispatcher>, Arc<RecordingFunction>) {
    let d = Arc::new(FunctionDispatcher::new());
    let rec = RecordingFunction::returning(json!({"clientId": "fixed-id", "clientSecret": "fixed-secret"}));
    d.register(CREATE_OIDC_CLIENT, rec.clone());
    (d, rec)
}

pub fn params(v: serde_json::Value) -> Params {
    v.as_object().cloned().unwrap()
}
