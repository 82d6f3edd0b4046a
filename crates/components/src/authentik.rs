//! Identity provider: admin API token, OIDC client issuance, user groups.

use std::sync::Arc;

use cairn_catalog::Context;
use cairn_core::{Error, Phase, Result, Settings};
use cairn_functions::{OidcClient, OidcProvider};
use cairn_kubehub::{data_from, DataKind, ResourceStore};
use metrics::counter;
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::http::ApiClient;
use crate::random_alphanumeric;

pub const NAME: &str = "authentik";
pub const API_TOKEN_SECRET: &str = "authentik-bootstrap";
pub const API_TOKEN_KEY: &str = "api-token";

const SCOPE_MAPPINGS: [&str; 3] = [
    "goauthentik.io/providers/oauth2/scope-email",
    "goauthentik.io/providers/oauth2/scope-openid",
    "goauthentik.io/providers/oauth2/scope-profile",
];
const AUTHORIZATION_FLOW: &str = "default-provider-authorization-explicit-consent";
const SIGNING_KEY: &str = "authentik Self-signed Certificate";

/// (name, users, superuser)
const GROUPS: [(&str, &[u64], bool); 3] = [("admins", &[1], true), ("editors", &[], false), ("viewers", &[], false)];

pub struct Authentik {
    store: Arc<dyn ResourceStore>,
    namespace: String,
    settings: Arc<Settings>,
    api: ApiClient,
}

fn api_path(resource: &str) -> String {
    format!("/api/v3/{}/", resource)
}

fn results(v: &Value) -> &[Value] {
    v.get("results").and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[])
}

/// `pk` may be a UUID string or an integer depending on the resource.
fn pk_of(v: &Value) -> Option<Value> {
    v.get("pk").filter(|pk| pk.is_string() || pk.is_number()).cloned()
}

impl Authentik {
    pub fn new(store: Arc<dyn ResourceStore>, namespace: impl Into<String>, settings: Arc<Settings>) -> Result<Self> {
        let api = ApiClient::new(settings.authentik_url.clone(), settings.http_timeout)?;
        Ok(Self { store, namespace: namespace.into(), settings, api })
    }

    /// Read the admin token, creating it on first use.
    pub async fn ensure_api_token(&self) -> Result<String> {
        if let Some(token) = self.stored_token().await? {
            return Ok(token);
        }
        let token = random_alphanumeric(32);
        let data = data_from([(API_TOKEN_KEY, token.as_str())]);
        match self.store.create(DataKind::Secret, &self.namespace, API_TOKEN_SECRET, &data).await {
            Ok(()) => {
                info!(ns = %self.namespace, "admin api token created");
                Ok(token)
            }
            Err(e) if e.is_already_exists() => {
                self.stored_token().await?.ok_or_else(|| Error::not_found("secret key", format!("{}/{}", API_TOKEN_SECRET, API_TOKEN_KEY)))
            }
            Err(e) => Err(e),
        }
    }

    /// The token pre-install created; never minted here.
    async fn api_token(&self) -> Result<String> {
        self.stored_token()
            .await?
            .ok_or_else(|| Error::not_found("secret key", format!("{}/{}/{}", self.namespace, API_TOKEN_SECRET, API_TOKEN_KEY)))
    }

    async fn stored_token(&self) -> Result<Option<String>> {
        let data = self.store.get(DataKind::Secret, &self.namespace, API_TOKEN_SECRET).await?;
        Ok(data
            .and_then(|d| d.get(API_TOKEN_KEY).cloned())
            .map(|v| String::from_utf8_lossy(&v).trim().to_string())
            .filter(|t| !t.is_empty()))
    }

    pub async fn wait_reachable(&self) -> Result<()> {
        self.api.wait_reachable(self.settings.health_interval, self.settings.health_deadline).await
    }

    async fn scope_mappings(&self, token: &str) -> Result<Vec<Value>> {
        let listing = self.api.get_json(&api_path("propertymappings/all"), &[], Some(token)).await?;
        SCOPE_MAPPINGS
            .iter()
            .map(|scope| {
                results(&listing)
                    .iter()
                    .find(|m| m.get("managed").and_then(Value::as_str) == Some(scope))
                    .and_then(pk_of)
                    .ok_or_else(|| Error::not_found("property mapping", *scope))
            })
            .collect()
    }

    async fn find_pk(&self, token: &str, resource: &str, field: &str, wanted: &str, kind: &'static str) -> Result<Value> {
        let listing = self.api.get_json(&api_path(resource), &[], Some(token)).await?;
        results(&listing)
            .iter()
            .find(|r| r.get(field).and_then(Value::as_str) == Some(wanted))
            .and_then(pk_of)
            .ok_or_else(|| Error::not_found(kind, wanted))
    }

    /// Create the default groups; existing groups are left alone.
    pub async fn create_groups(&self) -> Result<()> {
        let token = self.api_token().await?;
        let path = api_path("core/groups");
        for (name, users, superuser) in GROUPS {
            let existing = self.api.get_json(&path, &[("name", name)], Some(&token)).await?;
            if !results(&existing).is_empty() {
                debug!(group = %name, "group exists");
                continue;
            }
            let body = json!({"name": name, "users": users, "is_superuser": superuser, "parent": null});
            self.api.send_json(Method::POST, &path, Some(&token), &body).await?;
            counter!("groups_created_total", 1u64);
            info!(group = %name, "group created");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl OidcProvider for Authentik {
    async fn issue_client(&self, name: &str) -> Result<OidcClient> {
        let token = self.api_token().await?;
        self.wait_reachable().await?;

        let mappings = self.scope_mappings(&token).await?;
        let flow = self.find_pk(&token, "flows/instances", "slug", AUTHORIZATION_FLOW, "authorization flow").await?;
        let signing_key = self.find_pk(&token, "crypto/certificatekeypairs", "name", SIGNING_KEY, "certificate").await?;

        let client = OidcClient { client_id: random_alphanumeric(40), client_secret: random_alphanumeric(128) };
        let provider = self
            .api
            .send_json(
                Method::POST,
                &api_path("providers/oauth2"),
                Some(&token),
                &json!({
                    "name": name,
                    "authorization_flow": flow,
                    "client_type": "confidential",
                    "client_id": client.client_id,
                    "client_secret": client.client_secret,
                    "property_mappings": mappings,
                    "signing_key": signing_key,
                }),
            )
            .await?;
        let pk = pk_of(&provider).ok_or_else(|| Error::Upstream {
            resource: api_path("providers/oauth2"),
            status: 200,
            body: format!("response without pk: {}", provider),
        })?;
        self.api
            .send_json(Method::POST, &api_path("core/applications"), Some(&token), &json!({"name": name, "slug": name, "provider": pk}))
            .await?;
        info!(client = %name, "oidc provider and application created");
        Ok(client)
    }
}

pub fn initialize(ctx: &mut Context) -> Result<()> {
    ctx.catalog.add_component(
        NAME,
        crate::descriptor(NAME, include_str!("../assets/authentik/config.yaml"), include_str!("../assets/authentik/hooks.yaml"), "")?,
    );
    let authentik = Arc::new(Authentik::new(ctx.store.clone(), ctx.namespace.clone(), ctx.settings.clone())?);
    ctx.oidc_providers.register(NAME, authentik.clone())?;

    let a = authentik.clone();
    ctx.hooks.add_hook(NAME, Phase::PreInstall, move || {
        let a = a.clone();
        async move { a.ensure_api_token().await.map(|_| ()) }
    })?;
    let a = authentik;
    ctx.hooks.add_hook(NAME, Phase::PostInstall, move || {
        let a = a.clone();
        async move {
            a.wait_reachable().await?;
            a.create_groups().await
        }
    })?;
    Ok(())
}
