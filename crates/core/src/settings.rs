//! Process settings shared by the workflows.

use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, Result};

pub const IN_CLUSTER_NAMESPACE_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

#[derive(Debug, Clone)]
pub struct Settings {
    /// Identity provider service base URL.
    pub authentik_url: String,
    /// Build system service base URL.
    pub concourse_url: String,
    pub argocd_url: String,
    /// OIDC provider requested by components that need an SSO client.
    pub sso_provider: String,
    pub namespace_file: PathBuf,
    /// Upper bound for any single outbound HTTP request.
    pub http_timeout: Duration,
    pub health_interval: Duration,
    pub health_deadline: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            authentik_url: "http://authentik".to_string(),
            concourse_url: "http://concourse-web:8080".to_string(),
            argocd_url: "http://argo-cd-argocd-server".to_string(),
            sso_provider: "authentik".to_string(),
            namespace_file: PathBuf::from(IN_CLUSTER_NAMESPACE_FILE),
            http_timeout: Duration::from_secs(30),
            health_interval: Duration::from_secs(2),
            health_deadline: Duration::from_secs(300),
        }
    }
}

impl Settings {
    /// Namespace this process runs in, read from the service account mount.
    pub fn namespace(&self) -> Result<String> {
        let raw = std::fs::read_to_string(&self.namespace_file)
            .map_err(|e| Error::config(format!("reading namespace from {}: {}", self.namespace_file.display(), e)))?;
        let ns = raw.trim();
        if ns.is_empty() {
            return Err(Error::config(format!("namespace file {} is empty", self.namespace_file.display())));
        }
        Ok(ns.to_string())
    }
}
