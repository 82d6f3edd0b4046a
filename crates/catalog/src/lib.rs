//! Cairn catalog: the component registry served as the install manifest,
//! the lifecycle hook table, and the `Context` components initialize into.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use cairn_core::{CatalogConfig, ComponentDescriptor, Error, Result, Settings};
use cairn_functions::{
    ApplicationToolchain, CreateApplication, CreateOidcClient, FunctionDispatcher, OidcProvider, ProviderRegistry,
    CREATE_APPLICATION, CREATE_OIDC_CLIENT,
};
use cairn_kubehub::ResourceStore;
use serde::Serialize;
use tracing::{info, warn};

mod hooks;

pub use hooks::{HookDispatcher, HookFn};

/// Registered components plus the static catalog configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Catalog {
    #[serde(rename = "hookSource")]
    hook_source: String,
    components: BTreeMap<String, ComponentDescriptor>,
    config: CatalogConfig,
}

impl Catalog {
    pub fn new(hook_source: impl Into<String>, config: CatalogConfig) -> Self {
        Self { hook_source: hook_source.into(), components: BTreeMap::new(), config }
    }

    /// Read parameter declarations from a YAML file; no components yet.
    pub fn load(path: &Path, hook_source: impl Into<String>) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| Error::config(format!("reading {}: {}", path.display(), e)))?;
        let config: CatalogConfig =
            serde_yaml::from_str(&raw).map_err(|e| Error::config(format!("parsing {}: {}", path.display(), e)))?;
        info!(path = %path.display(), parameters = config.parameters.len(), "catalog config loaded");
        Ok(Self::new(hook_source, config))
    }

    /// Register or replace a component. Returns the replaced descriptor.
    pub fn add_component(&mut self, name: impl Into<String>, descriptor: ComponentDescriptor) -> Option<ComponentDescriptor> {
        let name = name.into();
        let prev = self.components.insert(name.clone(), descriptor);
        if prev.is_some() {
            warn!(component = %name, "component registered twice; keeping the last descriptor");
        }
        prev
    }

    pub fn component(&self, name: &str) -> Option<&ComponentDescriptor> {
        self.components.get(name)
    }

    pub fn components(&self) -> &BTreeMap<String, ComponentDescriptor> {
        &self.components
    }

    pub fn hook_source(&self) -> &str {
        &self.hook_source
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    /// The manifest document served to the installer.
    pub fn manifest(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Everything a component needs while registering itself.
///
/// Built once per process; hooks capture clones of the shared handles.
pub struct Context {
    pub catalog: Catalog,
    pub hooks: HookDispatcher,
    pub functions: Arc<FunctionDispatcher>,
    pub oidc_providers: Arc<ProviderRegistry<dyn OidcProvider>>,
    pub toolchains: Arc<ProviderRegistry<dyn ApplicationToolchain>>,
    pub store: Arc<dyn ResourceStore>,
    pub settings: Arc<Settings>,
    /// Namespace the catalog runs in; components install here.
    pub namespace: String,
}

impl Context {
    pub fn new(catalog: Catalog, settings: Settings, store: Arc<dyn ResourceStore>, namespace: impl Into<String>) -> Self {
        let functions = Arc::new(FunctionDispatcher::new());
        let oidc_providers: Arc<ProviderRegistry<dyn OidcProvider>> = Arc::new(ProviderRegistry::new(CREATE_OIDC_CLIENT));
        let toolchains: Arc<ProviderRegistry<dyn ApplicationToolchain>> = Arc::new(ProviderRegistry::new(CREATE_APPLICATION));
        functions.register(CREATE_OIDC_CLIENT, Arc::new(CreateOidcClient::new(oidc_providers.clone())));
        functions.register(CREATE_APPLICATION, Arc::new(CreateApplication::new(toolchains.clone())));
        Self {
            catalog,
            hooks: HookDispatcher::new(),
            functions,
            oidc_providers,
            toolchains,
            store,
            settings: Arc::new(settings),
            namespace: namespace.into(),
        }
    }
}
