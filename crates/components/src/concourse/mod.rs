//! CI system: key material and OIDC client at install time, per-application
//! pipeline bootstrap as the `concourse` toolchain.

use std::sync::Arc;

use cairn_catalog::Context;
use cairn_core::{application_namespace, toolchain_namespace, Error, Phase, Result, Settings};
use cairn_functions::{request_oidc_client, ApplicationRequest, ApplicationToolchain, FunctionDispatcher};
use cairn_inputs::{grant_driver_access, merge_shared, upsert, APPLICATION_SECRETS, APPLICATION_VARS, SYSTEM_SECRETS, SYSTEM_VARS};
use cairn_kubehub::{data_from, data_to_strings, DataKind, ResourceStore};
use metrics::counter;
use serde_json::{json, Value};
use tracing::info;

use crate::http::ApiClient;
use crate::random_alphanumeric;

pub mod fly;
pub mod keys;
pub mod pipeline;

pub use fly::{CommandOutput, CommandRunner, ProcessRunner, StepResult};

pub const NAME: &str = "concourse";
pub const WEB_SECRET: &str = "concourse-web";
pub const WORKER_SECRET: &str = "concourse-worker";
/// Local user the catalog drives the CLI as.
pub const LOCAL_USER: &str = "cairn";
const DEFAULT_DRIVER_ACCOUNT: &str = "concourse-worker";

pub struct Concourse {
    store: Arc<dyn ResourceStore>,
    namespace: String,
    settings: Arc<Settings>,
    functions: Arc<FunctionDispatcher>,
    runner: Arc<dyn CommandRunner>,
    api: ApiClient,
}

impl Concourse {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        namespace: impl Into<String>,
        settings: Arc<Settings>,
        functions: Arc<FunctionDispatcher>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let api = ApiClient::new(settings.concourse_url.clone(), settings.http_timeout)?;
        Ok(Self { store, namespace: namespace.into(), settings, functions, runner, api })
    }

    /// Issue the OIDC client and create the web and worker secrets.
    pub async fn pre_install(&self) -> Result<()> {
        if self.store.get(DataKind::Secret, &self.namespace, WEB_SECRET).await?.is_some() {
            info!(ns = %self.namespace, "concourse secrets already present");
            return Ok(());
        }
        let client = request_oidc_client(&self.functions, NAME, &self.settings.sso_provider).await?;

        let (host, worker, session) = tokio::task::spawn_blocking(|| -> Result<_> {
            Ok((keys::generate_key_pair()?, keys::generate_key_pair()?, keys::generate_key_pair()?))
        })
        .await
        .map_err(|e| Error::crypto(format!("key generation task: {}", e)))??;

        let local_users = format!("{}:{}", LOCAL_USER, random_alphanumeric(32));
        let web = data_from([
            ("host-key", host.private_pem.as_str()),
            ("session-signing-key", session.private_pem.as_str()),
            ("worker-key-pub", worker.public_ssh.as_str()),
            ("oidc-client-id", client.client_id.as_str()),
            ("oidc-client-secret", client.client_secret.as_str()),
            ("local-users", local_users.as_str()),
        ]);
        let worker_data = data_from([("host-key-pub", host.public_ssh.as_str()), ("worker-key", worker.private_pem.as_str())]);
        // The web secret is the completion marker, so it is written last. A
        // worker secret left by an interrupted run is overwritten to match.
        upsert(self.store.as_ref(), DataKind::Secret, &self.namespace, WORKER_SECRET, &worker_data).await?;
        self.store.create(DataKind::Secret, &self.namespace, WEB_SECRET, &web).await?;
        counter!("ci_secrets_created_total", 1u64, "component" => NAME);
        info!(ns = %self.namespace, "concourse secrets created");
        Ok(())
    }

    async fn local_user_password(&self, namespace: &str) -> Result<String> {
        let web = self
            .store
            .get(DataKind::Secret, namespace, WEB_SECRET)
            .await?
            .ok_or_else(|| Error::not_found("secret", format!("{}/{}", namespace, WEB_SECRET)))?;
        let users = web.get("local-users").map(|v| String::from_utf8_lossy(v).into_owned()).unwrap_or_default();
        users
            .split_once(':')
            .map(|(_, pwd)| pwd.trim().to_string())
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::not_found("local user password", format!("{}/{}", namespace, WEB_SECRET)))
    }
}

#[async_trait::async_trait]
impl ApplicationToolchain for Concourse {
    async fn create_application(&self, request: ApplicationRequest) -> Result<Value> {
        let tc_ns = toolchain_namespace(&request.toolchain);
        let app_ns = application_namespace(&request.toolchain, &request.name);
        let driver = request.option("driverServiceAccount")?.unwrap_or(DEFAULT_DRIVER_ACCOUNT).to_string();

        let vars = merge_shared(self.store.as_ref(), DataKind::ConfigMap, &tc_ns, SYSTEM_VARS, &app_ns, APPLICATION_VARS).await?;
        let secrets = merge_shared(self.store.as_ref(), DataKind::Secret, &tc_ns, SYSTEM_SECRETS, &app_ns, APPLICATION_SECRETS).await?;
        let vars = data_to_strings(&vars);
        let var_keys: Vec<String> = vars.keys().cloned().collect();
        let secret_keys: Vec<String> = secrets.keys().cloned().collect();

        let workdir = tempfile::tempdir()?;
        let pipeline_file = workdir.path().join("pipeline.yml");
        let vars_file = workdir.path().join("vars.yml");
        std::fs::write(&pipeline_file, pipeline::render_pipeline(&var_keys, &secret_keys)?)?;
        std::fs::write(&vars_file, pipeline::render_vars_file(&vars)?)?;

        let password = self.local_user_password(&tc_ns).await?;
        let cli = fly::download_cli(&self.api).await?;
        let team = format!("{}-{}", request.toolchain, request.name);
        let steps = fly::bootstrap_steps(&fly::Bootstrap {
            url: self.api.base(),
            user: LOCAL_USER,
            password: &password,
            team: &team,
            pipeline: &request.name,
            pipeline_file: &pipeline_file,
            vars_file: &vars_file,
        });
        let results = fly::run_steps(self.runner.as_ref(), &cli, &steps).await?;

        grant_driver_access(self.store.as_ref(), &app_ns, &driver, &tc_ns).await?;
        counter!("application_pipelines_total", 1u64, "toolchain" => request.toolchain.clone());
        info!(application = %request.name, team = %team, "application pipeline created");
        Ok(json!({
            "team": team,
            "pipeline": request.name,
            "vars": var_keys,
            "secrets": secret_keys,
            "steps": results,
        }))
    }
}

pub fn initialize(ctx: &mut Context) -> Result<()> {
    initialize_with_runner(ctx, Arc::new(ProcessRunner))
}

pub fn initialize_with_runner(ctx: &mut Context, runner: Arc<dyn CommandRunner>) -> Result<()> {
    ctx.catalog.add_component(
        NAME,
        crate::descriptor(
            NAME,
            include_str!("../../assets/concourse/config.yaml"),
            include_str!("../../assets/concourse/hooks.yaml"),
            include_str!("../../assets/concourse/application-hooks.yaml"),
        )?,
    );
    let concourse = Arc::new(Concourse::new(ctx.store.clone(), ctx.namespace.clone(), ctx.settings.clone(), ctx.functions.clone(), runner)?);
    ctx.toolchains.register(NAME, concourse.clone())?;
    ctx.hooks.add_hook(NAME, Phase::PreInstall, move || {
        let c = concourse.clone();
        async move { c.pre_install().await }
    })?;
    Ok(())
}
