use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use cairn_catalog::{Catalog, Context};
use cairn_core::{Params, Phase, Settings, IN_CLUSTER_NAMESPACE_FILE};
use cairn_kubehub::{KubeStore, MemoryStore, ResourceStore};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "cairnctl", version, about = "Cairn platform catalog")]
struct Cli {
    #[command(flatten)]
    opts: Opts,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct Opts {
    /// Image the installer runs hooks from
    #[arg(long, env = "CATALOG_HOOK_SOURCE", default_value = "", global = true)]
    hook_source: String,

    /// Catalog parameter declarations
    #[arg(long, env = "CATALOG_CONFIG", default_value = "/data/config.yaml", global = true)]
    config: PathBuf,

    #[arg(long, env = "AUTHENTIK_URL", default_value = "http://authentik", global = true)]
    authentik_url: String,

    #[arg(long, env = "CONCOURSE_URL", default_value = "http://concourse-web:8080", global = true)]
    concourse_url: String,

    #[arg(long, env = "ARGOCD_URL", default_value = "http://argo-cd-argocd-server", global = true)]
    argocd_url: String,

    /// OIDC provider components request clients from
    #[arg(long, env = "SSO_PROVIDER", default_value = "authentik", global = true)]
    sso_provider: String,

    #[arg(long, env = "NAMESPACE_FILE", default_value = IN_CLUSTER_NAMESPACE_FILE, global = true)]
    namespace_file: PathBuf,

    /// Per-request timeout for outbound HTTP, in seconds
    #[arg(long, env = "CAIRN_HTTP_TIMEOUT_SECS", default_value_t = 30, global = true)]
    http_timeout_secs: u64,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the catalog manifest and the RPC endpoint
    Serve {
        #[arg(long, env = "CATALOG_ADDR", default_value = "0.0.0.0:80")]
        addr: SocketAddr,
    },
    /// Run one lifecycle hook
    Hook {
        #[arg(env = "HOOK_COMPONENT")]
        component: String,
        /// pre-install, post-install, ...
        #[arg(env = "HOOK_KIND")]
        phase: String,
    },
    /// Call one function with JSON object params
    Call {
        #[arg(env = "FUNCTION_NAME")]
        name: String,
        #[arg(env = "FUNCTION_PARAMS", default_value = "{}")]
        params: String,
    },
    /// Print the catalog manifest (no cluster access)
    Manifest,
}

impl Opts {
    fn settings(&self) -> Settings {
        Settings {
            authentik_url: self.authentik_url.clone(),
            concourse_url: self.concourse_url.clone(),
            argocd_url: self.argocd_url.clone(),
            sso_provider: self.sso_provider.clone(),
            namespace_file: self.namespace_file.clone(),
            http_timeout: Duration::from_secs(self.http_timeout_secs),
            ..Default::default()
        }
    }
}

/// `CAIRN_LOG` directives, then `RUST_LOG`, then `info`.
fn log_filter(cairn_log: Option<&str>, rust_log: Option<&str>) -> tracing_subscriber::EnvFilter {
    cairn_log
        .into_iter()
        .chain(rust_log)
        .find_map(|raw| tracing_subscriber::EnvFilter::try_new(raw).ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("info"))
}

/// Logs go to stderr; stdout carries `call` and `manifest` output.
fn init_tracing() {
    let cairn_log = std::env::var("CAIRN_LOG").ok();
    let rust_log = std::env::var("RUST_LOG").ok();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(cairn_log.as_deref(), rust_log.as_deref()))
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

fn init_metrics() {
    let Ok(raw) = std::env::var("CAIRN_METRICS_ADDR") else {
        return;
    };
    match raw.parse::<SocketAddr>() {
        Ok(addr) => match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr).install() {
            Ok(()) => info!(addr = %addr, "prometheus exporter listening"),
            Err(e) => warn!(error = %e, "metrics exporter not installed"),
        },
        Err(_) => warn!(addr = %raw, "CAIRN_METRICS_ADDR must be host:port"),
    }
}

/// Load the catalog and let every component register into a fresh context.
async fn build_context(opts: &Opts, in_cluster: bool) -> Result<Context> {
    let settings = opts.settings();
    let catalog = Catalog::load(&opts.config, opts.hook_source.clone())?;
    let (store, namespace): (Arc<dyn ResourceStore>, String) = if in_cluster {
        let namespace = settings.namespace()?;
        (Arc::new(KubeStore::try_default().await?), namespace)
    } else {
        (Arc::new(MemoryStore::new()), String::new())
    };
    let mut ctx = Context::new(catalog, settings, store, namespace);
    cairn_components::initialize(&mut ctx)?;
    Ok(ctx)
}

fn parse_params(raw: &str) -> Result<Params> {
    match serde_json::from_str(raw).context("FUNCTION_PARAMS is not valid JSON")? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(anyhow!("FUNCTION_PARAMS must be a JSON object, got {}", other)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { addr } => {
            let ctx = build_context(&cli.opts, true).await?;
            cairn_api::serve(addr, cairn_api::ApiState::from_context(&ctx)?).await?;
        }
        Commands::Hook { component, phase } => {
            let phase = Phase::from_str(&phase)?;
            let ctx = build_context(&cli.opts, true).await?;
            ctx.hooks.call(&component, phase).await.with_context(|| format!("{} {} hook failed", component, phase))?;
            info!(component = %component, phase = %phase, "hook complete");
        }
        Commands::Call { name, params } => {
            let params = parse_params(&params)?;
            let ctx = build_context(&cli.opts, true).await?;
            let out = ctx.functions.call(&name, params).await.with_context(|| format!("function {} failed", name))?;
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Commands::Manifest => {
            let ctx = build_context(&cli.opts, false).await?;
            println!("{}", serde_json::to_string_pretty(&ctx.catalog.manifest()?)?);
        }
    }
    Ok(())
}
