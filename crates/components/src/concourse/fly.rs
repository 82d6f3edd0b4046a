//! The build system CLI: download, then an ordered list of invocations.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use cairn_core::{Error, Result};
use metrics::counter;
use serde::Serialize;
use tempfile::TempPath;
use tracing::{debug, info};

use crate::http::ApiClient;

pub const CLI_DOWNLOAD_PATH: &str = "/api/v1/cli?arch=amd64&platform=linux";
const TARGET: [&str; 2] = ["-t", "default"];

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs an external program to completion.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &Path, args: &[String]) -> Result<CommandOutput>;
}

pub struct ProcessRunner;

#[async_trait::async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &Path, args: &[String]) -> Result<CommandOutput> {
        let out = tokio::process::Command::new(program).args(args).kill_on_drop(true).output().await?;
        Ok(CommandOutput {
            success: out.status.success(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}

/// One CLI invocation; `name` is the subcommand.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub name: &'static str,
    pub args: Vec<String>,
}

impl Step {
    fn new(name: &'static str, rest: &[&str]) -> Self {
        let mut args: Vec<String> = TARGET.iter().map(|s| s.to_string()).collect();
        args.push(name.to_string());
        args.extend(rest.iter().map(|s| s.to_string()));
        Self { name, args }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StepResult {
    pub step: String,
    pub stdout: String,
}

pub struct Bootstrap<'a> {
    pub url: &'a str,
    pub user: &'a str,
    pub password: &'a str,
    pub team: &'a str,
    pub pipeline: &'a str,
    pub pipeline_file: &'a Path,
    pub vars_file: &'a Path,
}

/// login, sync, set-team, set-pipeline, unpause-pipeline.
pub fn bootstrap_steps(b: &Bootstrap<'_>) -> Vec<Step> {
    let pipeline_file = b.pipeline_file.to_string_lossy().into_owned();
    let vars_file = b.vars_file.to_string_lossy().into_owned();
    vec![
        Step::new("login", &["-c", b.url, "--username", b.user, "--password", b.password]),
        Step::new("sync", &[]),
        Step::new("set-team", &["--team-name", b.team, "--local-user", b.user, "--non-interactive"]),
        Step::new(
            "set-pipeline",
            &["--team", b.team, "-p", b.pipeline, "-c", pipeline_file.as_str(), "--non-interactive", "--load-vars-from", vars_file.as_str()],
        ),
        Step::new("unpause-pipeline", &["-p", b.pipeline, "--team", b.team]),
    ]
}

/// Run steps in order; the first failure aborts the rest.
pub async fn run_steps(runner: &dyn CommandRunner, cli: &Path, steps: &[Step]) -> Result<Vec<StepResult>> {
    let mut results = Vec::with_capacity(steps.len());
    for step in steps {
        debug!(step = %step.name, "fly");
        let out = runner.run(cli, &step.args).await?;
        if !out.success {
            counter!("fly_step_failures_total", 1u64, "step" => step.name);
            return Err(Error::Exec { command: format!("fly {}", step.name), stderr: out.stderr.trim().to_string() });
        }
        results.push(StepResult { step: step.name.to_string(), stdout: out.stdout });
    }
    Ok(results)
}

/// Fetch the CLI into an executable temporary file, removed on drop.
pub async fn download_cli(api: &ApiClient) -> Result<TempPath> {
    let bytes = api.download(CLI_DOWNLOAD_PATH).await?;
    let mut file = tempfile::Builder::new().prefix("fly-cli").tempfile()?;
    std::io::Write::write_all(&mut file, &bytes)?;
    // Closing the handle first keeps exec from failing with ETXTBSY.
    let path = file.into_temp_path();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    info!(bytes = bytes.len(), "fly cli downloaded");
    Ok(path)
}
