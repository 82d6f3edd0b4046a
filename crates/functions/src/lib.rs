//! Cairn functions: named capability handlers invoked by hooks and over RPC.
//!
//! `FunctionDispatcher` maps a capability name to a handler taking a JSON
//! parameter bag. Capabilities with several implementations (OIDC issuance,
//! application bootstrap) go through a typed `ProviderRegistry` keyed by the
//! discriminator parameter.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use cairn_core::{Error, Params, Result};
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{debug, warn};

mod providers;

pub use providers::{
    request_oidc_client, ApplicationRequest, ApplicationToolchain, CreateApplication, CreateOidcClient, OidcClient,
    OidcProvider, ProviderRegistry, CREATE_APPLICATION, CREATE_OIDC_CLIENT,
};

/// A named capability handler.
#[async_trait::async_trait]
pub trait Function: Send + Sync {
    async fn call(&self, params: Params) -> Result<Value>;
}

/// Adapter turning an async closure into a `Function`.
pub struct FnFunction<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut> Function for FnFunction<F>
where
    F: Fn(Params) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn call(&self, params: Params) -> Result<Value> {
        (self.0)(params).await
    }
}

/// Capability name -> handler. Last registration wins.
#[derive(Default)]
pub struct FunctionDispatcher {
    table: RwLock<HashMap<String, Arc<dyn Function>>>,
}

impl FunctionDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, function: Arc<dyn Function>) {
        let name = name.into();
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if table.insert(name.clone(), function).is_some() {
            warn!(function = %name, "function re-registered; previous handler replaced");
        } else {
            debug!(function = %name, "function registered");
        }
    }

    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.register(name, Arc::new(FnFunction(f)));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.read().unwrap_or_else(PoisonError::into_inner).contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.table.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        names.sort();
        names
    }

    /// Invoke `name` exactly once with `params`.
    pub async fn call(&self, name: &str, params: Params) -> Result<Value> {
        let handler = self
            .table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("method", name))?;
        let started = Instant::now();
        let res = handler.call(params).await;
        let ms = started.elapsed().as_secs_f64() * 1000.0;
        histogram!("function_latency_ms", ms, "function" => name.to_string());
        counter!("function_calls_total", 1u64, "function" => name.to_string());
        if let Err(e) = &res {
            counter!("function_errors_total", 1u64, "function" => name.to_string());
            debug!(function = %name, error = %e, "function failed");
        }
        res
    }
}

pub mod testing {
    //! Recording handler for exercising code that calls through the dispatcher.

    use super::*;
    use std::sync::Mutex;

    pub struct RecordingFunction {
        response: Value,
        calls: Mutex<Vec<Params>>,
    }

    impl RecordingFunction {
        pub fn returning(response: Value) -> Arc<Self> {
            Arc::new(Self { response, calls: Mutex::new(Vec::new()) })
        }

        pub fn calls(&self) -> Vec<Params> {
            self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }
    }

    #[async_trait::async_trait]
    impl Function for RecordingFunction {
        async fn call(&self, params: Params) -> Result<Value> {
            self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(params);
            Ok(self.response.clone())
        }
    }
}
