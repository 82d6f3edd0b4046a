//! Cairn components: the catalog entries and the workflows behind their hooks.
//!
//! Each component module exposes `initialize(&mut Context)`, which adds the
//! descriptor, registers lifecycle hooks, and registers any capability
//! providers the component implements.

#![forbid(unsafe_code)]

use cairn_catalog::Context;
use cairn_core::{ComponentConfig, ComponentDescriptor, Error, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::info;

pub mod argocd;
pub mod authentik;
pub mod charts;
pub mod concourse;
pub mod http;

/// Register every built-in component.
pub fn initialize(ctx: &mut Context) -> Result<()> {
    authentik::initialize(ctx)?;
    concourse::initialize(ctx)?;
    argocd::initialize(ctx)?;
    charts::initialize(ctx)?;
    info!(components = ctx.catalog.components().len(), "catalog initialized");
    Ok(())
}

/// Build a descriptor from an embedded `config.yaml` and hook manifests.
pub(crate) fn descriptor(name: &str, config: &str, hooks: &str, application_hooks: &str) -> Result<ComponentDescriptor> {
    let config: ComponentConfig =
        serde_yaml::from_str(config).map_err(|e| Error::config(format!("{} config: {}", name, e)))?;
    Ok(ComponentDescriptor::from_config(config, hooks, application_hooks))
}

/// Random `[A-Za-z0-9]` string from the thread-local CSPRNG.
pub fn random_alphanumeric(len: usize) -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(len).map(char::from).collect()
}
