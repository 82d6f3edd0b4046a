//! GitOps controller: OIDC client secret before install, service account
//! password after.

use std::sync::Arc;

use cairn_catalog::Context;
use cairn_core::{Error, Phase, Result, Settings};
use cairn_functions::{request_oidc_client, FunctionDispatcher};
use cairn_inputs::{publish_secrets, publish_vars};
use cairn_kubehub::{data_from, DataKind, Labels, ResourceStore};
use metrics::counter;
use reqwest::Method;
use serde_json::{json, Value};
use tracing::info;

use crate::http::ApiClient;
use crate::random_alphanumeric;

pub const NAME: &str = "argo-cd";
pub const OIDC_SECRET: &str = "oidc-client";
pub const INITIAL_ADMIN_SECRET: &str = "argocd-initial-admin-secret";
pub const SERVER_SERVICE: &str = "argo-cd-argocd-server";
/// Account the pipelines log in as.
pub const SERVICE_ACCOUNT: &str = "cairn";

pub struct ArgoCd {
    store: Arc<dyn ResourceStore>,
    namespace: String,
    settings: Arc<Settings>,
    functions: Arc<FunctionDispatcher>,
    api: ApiClient,
}

impl ArgoCd {
    pub fn new(store: Arc<dyn ResourceStore>, namespace: impl Into<String>, settings: Arc<Settings>, functions: Arc<FunctionDispatcher>) -> Result<Self> {
        let api = ApiClient::new(settings.argocd_url.clone(), settings.http_timeout)?;
        Ok(Self { store, namespace: namespace.into(), settings, functions, api })
    }

    pub async fn pre_install(&self) -> Result<()> {
        publish_vars(self.store.as_ref(), NAME, &self.namespace, [("server", SERVER_SERVICE)]).await?;

        if self.store.get(DataKind::Secret, &self.namespace, OIDC_SECRET).await?.is_some() {
            info!(ns = %self.namespace, "oidc client secret already present");
            return Ok(());
        }
        let client = request_oidc_client(&self.functions, NAME, &self.settings.sso_provider).await?;
        let mut labels = Labels::new();
        labels.insert("app.kubernetes.io/part-of".into(), "argocd".into());
        let data = data_from([("id", client.client_id.as_str()), ("secret", client.client_secret.as_str())]);
        match self.store.create_labeled(DataKind::Secret, &self.namespace, OIDC_SECRET, &data, &labels).await {
            Err(e) if e.is_already_exists() => Ok(()),
            other => other,
        }
    }

    pub async fn post_install(&self) -> Result<()> {
        let admin_password = self.initial_admin_password().await?;
        self.api.wait_reachable(self.settings.health_interval, self.settings.health_deadline).await?;

        let session = self
            .api
            .send_json(Method::POST, "/api/v1/session", None, &json!({"username": "admin", "password": admin_password}))
            .await?;
        let token = session
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Upstream { resource: "/api/v1/session".into(), status: 200, body: "response without token".into() })?
            .to_string();

        let password = random_alphanumeric(32);
        self.api
            .send_json(
                Method::PUT,
                "/api/v1/account/password",
                Some(&token),
                &json!({"name": SERVICE_ACCOUNT, "currentPassword": admin_password, "newPassword": password}),
            )
            .await?;
        counter!("password_rotations_total", 1u64, "component" => NAME);
        info!(account = %SERVICE_ACCOUNT, "service account password set");
        publish_secrets(self.store.as_ref(), NAME, &self.namespace, [("password", password.as_str())]).await
    }

    async fn initial_admin_password(&self) -> Result<String> {
        self.store
            .get(DataKind::Secret, &self.namespace, INITIAL_ADMIN_SECRET)
            .await?
            .and_then(|d| d.get("password").map(|v| String::from_utf8_lossy(v).into_owned()))
            .ok_or_else(|| Error::not_found("secret", format!("{}/{}", self.namespace, INITIAL_ADMIN_SECRET)))
    }
}

pub fn initialize(ctx: &mut Context) -> Result<()> {
    ctx.catalog.add_component(
        NAME,
        crate::descriptor(NAME, include_str!("../assets/argo-cd/config.yaml"), include_str!("../assets/argo-cd/hooks.yaml"), "")?,
    );
    let argocd = Arc::new(ArgoCd::new(ctx.store.clone(), ctx.namespace.clone(), ctx.settings.clone(), ctx.functions.clone())?);
    let a = argocd.clone();
    ctx.hooks.add_hook(NAME, Phase::PreInstall, move || {
        let a = a.clone();
        async move { a.pre_install().await }
    })?;
    ctx.hooks.add_hook(NAME, Phase::PostInstall, move || {
        let a = argocd.clone();
        async move { a.post_install().await }
    })?;
    Ok(())
}
