//! Two-level capabilities: a top-level function reads a discriminator and
//! forwards to the provider registered under that name.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use cairn_core::{optional_str, required_str, Error, Params, Result};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::{Function, FunctionDispatcher};

pub const CREATE_OIDC_CLIENT: &str = "create-oidc-client";
pub const CREATE_APPLICATION: &str = "create-application";

/// Provider name -> implementation. Names are never silently overwritten.
pub struct ProviderRegistry<T: ?Sized> {
    capability: &'static str,
    providers: RwLock<HashMap<String, Arc<T>>>,
}

impl<T: ?Sized + Send + Sync> ProviderRegistry<T> {
    pub fn new(capability: &'static str) -> Self {
        Self { capability, providers: RwLock::new(HashMap::new()) }
    }

    pub fn register(&self, name: impl Into<String>, provider: Arc<T>) -> Result<()> {
        let name = name.into();
        let mut map = self.providers.write().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(&name) {
            return Err(Error::AlreadyRegistered(format!("{} provider {}", self.capability, name)));
        }
        map.insert(name, provider);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<T>> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ProviderNotSupported { capability: self.capability.to_string(), provider: name.to_string() })
    }

    /// The single registered provider, if there is exactly one.
    pub fn only(&self) -> Option<(String, Arc<T>)> {
        let map = self.providers.read().unwrap_or_else(PoisonError::into_inner);
        if map.len() != 1 {
            return None;
        }
        map.iter().next().map(|(name, p)| (name.clone(), p.clone()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut v: Vec<String> = self.providers.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        v.sort();
        v
    }
}

/// Credentials of a freshly issued OIDC client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcClient {
    pub client_id: String,
    pub client_secret: String,
}

#[async_trait::async_trait]
pub trait OidcProvider: Send + Sync {
    async fn issue_client(&self, name: &str) -> Result<OidcClient>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationRequest {
    pub name: String,
    /// Toolchain instance; scopes namespaces and the CI team.
    pub toolchain: String,
    /// CI system the request is routed to.
    pub provider: Option<String>,
    /// Everything else the caller passed, for provider-specific options.
    pub params: Params,
}

impl ApplicationRequest {
    pub fn from_params(params: Params) -> Result<Self> {
        let name = required_str(&params, "name")?.to_string();
        let toolchain = required_str(&params, "toolchain")?.to_string();
        let provider = optional_str(&params, "provider")?.map(str::to_string);
        Ok(Self { name, toolchain, provider, params })
    }

    pub fn option(&self, key: &str) -> Result<Option<&str>> {
        optional_str(&self.params, key)
    }
}

#[async_trait::async_trait]
pub trait ApplicationToolchain: Send + Sync {
    async fn create_application(&self, request: ApplicationRequest) -> Result<Value>;
}

/// `create-oidc-client {name, provider}` -> `{clientId, clientSecret}`.
pub struct CreateOidcClient {
    providers: Arc<ProviderRegistry<dyn OidcProvider>>,
}

impl CreateOidcClient {
    pub fn new(providers: Arc<ProviderRegistry<dyn OidcProvider>>) -> Self {
        Self { providers }
    }
}

#[async_trait::async_trait]
impl Function for CreateOidcClient {
    async fn call(&self, params: Params) -> Result<Value> {
        let name = required_str(&params, "name")?;
        let provider_name = required_str(&params, "provider")?;
        let provider = self.providers.resolve(provider_name)?;
        let client = provider.issue_client(name).await?;
        counter!("oidc_clients_issued_total", 1u64, "provider" => provider_name.to_string());
        info!(client = %name, provider = %provider_name, "oidc client issued");
        Ok(serde_json::to_value(client)?)
    }
}

/// `create-application {name, toolchain, provider?, ...}` -> system-defined result.
///
/// Without `provider` the request goes to the only registered CI system.
pub struct CreateApplication {
    toolchains: Arc<ProviderRegistry<dyn ApplicationToolchain>>,
}

impl CreateApplication {
    pub fn new(toolchains: Arc<ProviderRegistry<dyn ApplicationToolchain>>) -> Self {
        Self { toolchains }
    }
}

#[async_trait::async_trait]
impl Function for CreateApplication {
    async fn call(&self, params: Params) -> Result<Value> {
        let request = ApplicationRequest::from_params(params)?;
        let (provider, system) = match request.provider.as_deref() {
            Some(name) => (name.to_string(), self.toolchains.resolve(name)?),
            None => self.toolchains.only().ok_or_else(|| {
                Error::invalid_params(format!("provider is required, registered: {}", self.toolchains.names().join(", ")))
            })?,
        };
        info!(application = %request.name, toolchain = %request.toolchain, provider = %provider, "creating application");
        system.create_application(request).await
    }
}

/// Ask the dispatcher for an OIDC client, the way component hooks do.
pub async fn request_oidc_client(functions: &FunctionDispatcher, name: &str, provider: &str) -> Result<OidcClient> {
    let mut params = Params::new();
    params.insert("name".into(), Value::String(name.to_string()));
    params.insert("provider".into(), Value::String(provider.to_string()));
    let out = functions.call(CREATE_OIDC_CLIENT, params).await?;
    Ok(serde_json::from_value(out)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticProvider {
        issued: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl OidcProvider for StaticProvider {
        async fn issue_client(&self, name: &str) -> Result<OidcClient> {
            self.issued.fetch_add(1, Ordering::SeqCst);
            Ok(OidcClient { client_id: format!("{}-id", name), client_secret: "s3cr3t".into() })
        }
    }

    struct EchoToolchain;

    #[async_trait::async_trait]
    impl ApplicationToolchain for EchoToolchain {
        async fn create_application(&self, request: ApplicationRequest) -> Result<Value> {
            Ok(json!({"name": request.name, "toolchain": request.toolchain, "branch": request.option("branch")?}))
        }
    }

    fn wired() -> (FunctionDispatcher, Arc<StaticProvider>) {
        let oidc: Arc<ProviderRegistry<dyn OidcProvider>> = Arc::new(ProviderRegistry::new(CREATE_OIDC_CLIENT));
        let provider = Arc::new(StaticProvider { issued: AtomicUsize::new(0) });
        oidc.register("authentik", provider.clone()).unwrap();
        let toolchains: Arc<ProviderRegistry<dyn ApplicationToolchain>> = Arc::new(ProviderRegistry::new(CREATE_APPLICATION));
        toolchains.register("concourse", Arc::new(EchoToolchain)).unwrap();
        let d = FunctionDispatcher::new();
        d.register(CREATE_OIDC_CLIENT, Arc::new(CreateOidcClient::new(oidc)));
        d.register(CREATE_APPLICATION, Arc::new(CreateApplication::new(toolchains)));
        (d, provider)
    }

    #[tokio::test]
    async fn oidc_dispatch_resolves_provider() {
        let (d, provider) = wired();
        let client = request_oidc_client(&d, "concourse", "authentik").await.unwrap();
        assert_eq!(client.client_id, "concourse-id");
        assert_eq!(provider.issued.load(Ordering::SeqCst), 1);

        let raw = d.call(CREATE_OIDC_CLIENT, json!({"name": "x", "provider": "authentik"}).as_object().cloned().unwrap()).await.unwrap();
        assert!(raw.get("clientId").is_some() && raw.get("clientSecret").is_some());
    }

    #[tokio::test]
    async fn unknown_provider_is_not_supported() {
        let (d, provider) = wired();
        let err = request_oidc_client(&d, "concourse", "keycloak").await.unwrap_err();
        assert!(matches!(err, Error::ProviderNotSupported { .. }), "err={}", err);
        assert_eq!(provider.issued.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_discriminator_is_invalid_params() {
        let (d, _) = wired();
        let err = d.call(CREATE_APPLICATION, json!({"name": "web"}).as_object().cloned().unwrap()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidParams(_)));
    }

    #[tokio::test]
    async fn application_request_keeps_extra_params() {
        let (d, _) = wired();
        let p = json!({"name": "web", "toolchain": "dev", "branch": "main"});
        let out = d.call(CREATE_APPLICATION, p.as_object().cloned().unwrap()).await.unwrap();
        assert_eq!(out, json!({"name": "web", "toolchain": "dev", "branch": "main"}));
    }

    #[tokio::test]
    async fn application_routes_on_provider_not_toolchain() {
        let (d, _) = wired();
        let p = json!({"name": "web", "toolchain": "dev", "provider": "concourse"});
        let out = d.call(CREATE_APPLICATION, p.as_object().cloned().unwrap()).await.unwrap();
        assert_eq!(out["toolchain"], "dev");

        let p = json!({"name": "web", "toolchain": "dev", "provider": "jenkins"});
        let err = d.call(CREATE_APPLICATION, p.as_object().cloned().unwrap()).await.unwrap_err();
        assert!(matches!(err, Error::ProviderNotSupported { .. }), "err={}", err);
    }

    #[tokio::test]
    async fn provider_is_required_when_ambiguous() {
        let toolchains: Arc<ProviderRegistry<dyn ApplicationToolchain>> = Arc::new(ProviderRegistry::new(CREATE_APPLICATION));
        toolchains.register("concourse", Arc::new(EchoToolchain)).unwrap();
        toolchains.register("tekton", Arc::new(EchoToolchain)).unwrap();
        let f = CreateApplication::new(toolchains);
        let err = f.call(json!({"name": "web", "toolchain": "dev"}).as_object().cloned().unwrap()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidParams(_)), "err={}", err);

        let empty: Arc<ProviderRegistry<dyn ApplicationToolchain>> = Arc::new(ProviderRegistry::new(CREATE_APPLICATION));
        assert!(empty.only().is_none());
    }

    #[test]
    fn provider_names_are_never_overwritten() {
        let reg: ProviderRegistry<dyn ApplicationToolchain> = ProviderRegistry::new(CREATE_APPLICATION);
        reg.register("concourse", Arc::new(EchoToolchain)).unwrap();
        let err = reg.register("concourse", Arc::new(EchoToolchain)).unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(_)));
        assert_eq!(reg.names(), vec!["concourse".to_string()]);
    }
}
