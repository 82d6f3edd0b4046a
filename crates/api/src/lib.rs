//! Cairn HTTP surface.
//!
//! `GET /.well-known/catalog-manifest` serves the registry the installer reads;
//! `POST /rpc` dispatches `{method, params}` to the function table.

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use cairn_catalog::Context;
use cairn_core::{Error, Params, Result};
use cairn_functions::FunctionDispatcher;
use metrics::{counter, histogram};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

pub const MANIFEST_PATH: &str = "/.well-known/catalog-manifest";
pub const RPC_PATH: &str = "/rpc";

/// Shared handler state; the manifest is rendered once at startup.
#[derive(Clone)]
pub struct ApiState {
    manifest: Arc<Value>,
    functions: Arc<FunctionDispatcher>,
}

impl ApiState {
    pub fn new(manifest: Value, functions: Arc<FunctionDispatcher>) -> Self {
        Self { manifest: Arc::new(manifest), functions }
    }

    pub fn from_context(ctx: &Context) -> Result<Self> {
        Ok(Self::new(ctx.catalog.manifest()?, ctx.functions.clone()))
    }
}

/// HTTP status for each error kind.
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::InvalidParams(_) | Error::ProviderNotSupported { .. } => StatusCode::BAD_REQUEST,
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::AlreadyRegistered(_) | Error::AlreadyExists(_) => StatusCode::CONFLICT,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::Upstream { .. } | Error::Exec { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `{"error": message}` with a mapped status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: message.into() }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self { status: status_for(&err), message: err.to_string() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    method: String,
    #[serde(default)]
    params: Value,
}

fn parse_rpc(body: &[u8]) -> std::result::Result<(String, Params), ApiError> {
    let req: RpcRequest = serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("malformed rpc request: {}", e)))?;
    let params = match req.params {
        Value::Null => Params::new(),
        Value::Object(map) => map,
        _ => return Err(ApiError::bad_request("params must be an object")),
    };
    if req.method.is_empty() {
        return Err(ApiError::bad_request("method is required"));
    }
    Ok((req.method, params))
}

async fn manifest(State(state): State<ApiState>) -> Json<Value> {
    Json(state.manifest.as_ref().clone())
}

async fn rpc(State(state): State<ApiState>, body: Bytes) -> std::result::Result<Json<Value>, ApiError> {
    let (method, params) = parse_rpc(&body)?;
    let started = Instant::now();
    let res = state.functions.call(&method, params).await;
    let ms = started.elapsed().as_secs_f64() * 1000.0;
    histogram!("rpc_latency_ms", ms, "method" => method.clone());
    match res {
        Ok(result) => {
            counter!("rpc_calls_total", 1u64, "method" => method.clone(), "outcome" => "ok");
            info!(method = %method, elapsed_ms = ms as u64, "rpc");
            Ok(Json(json!({ "result": result })))
        }
        Err(e) => {
            counter!("rpc_calls_total", 1u64, "method" => method.clone(), "outcome" => "error");
            warn!(method = %method, error = %e, "rpc failed");
            Err(e.into())
        }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new().route(MANIFEST_PATH, get(manifest)).route(RPC_PATH, post(rpc)).with_state(state)
}

/// Serve until ctrl-c.
pub async fn serve(addr: SocketAddr, state: ApiState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "catalog listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_covers_each_kind() {
        let cases = [
            (Error::invalid_params("name is required"), StatusCode::BAD_REQUEST),
            (Error::ProviderNotSupported { capability: "c".into(), provider: "p".into() }, StatusCode::BAD_REQUEST),
            (Error::not_found("method", "x"), StatusCode::NOT_FOUND),
            (Error::AlreadyRegistered("x".into()), StatusCode::CONFLICT),
            (Error::AlreadyExists("x".into()), StatusCode::CONFLICT),
            (Error::Timeout("x".into()), StatusCode::GATEWAY_TIMEOUT),
            (Error::Upstream { resource: "r".into(), status: 500, body: String::new() }, StatusCode::BAD_GATEWAY),
            (Error::Exec { command: "c".into(), stderr: String::new() }, StatusCode::BAD_GATEWAY),
            (Error::store("boom"), StatusCode::INTERNAL_SERVER_ERROR),
            (Error::crypto("boom"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(status_for(&err), status, "{}", err);
        }
    }

    #[test]
    fn rpc_body_validation() {
        assert!(parse_rpc(b"{").is_err());
        assert!(parse_rpc(br#"{"params": {}}"#).is_err());
        assert!(parse_rpc(br#"{"method": "x", "params": [1]}"#).is_err());
        let (m, p) = parse_rpc(br#"{"method": "x"}"#).unwrap();
        assert_eq!(m, "x");
        assert!(p.is_empty());
    }
}
