//! Lifecycle hook table: (component, phase) -> async callback.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use cairn_core::{Error, Phase, Result};
use futures::future::{BoxFuture, FutureExt};
use metrics::counter;
use tracing::{debug, info};

pub type HookFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Default)]
pub struct HookDispatcher {
    table: HashMap<String, BTreeMap<Phase, HookFn>>,
}

impl HookDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the callback for `(component, phase)`; a pair is registered once.
    pub fn add_hook<F, Fut>(&mut self, component: &str, phase: Phase, hook: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let phases = self.table.entry(component.to_string()).or_default();
        if phases.contains_key(&phase) {
            return Err(Error::AlreadyRegistered(format!("{} hook for {}", phase, component)));
        }
        phases.insert(phase, Arc::new(move || hook().boxed()));
        debug!(component = %component, phase = %phase, "hook registered");
        Ok(())
    }

    pub fn phases(&self, component: &str) -> Vec<Phase> {
        self.table.get(component).map(|p| p.keys().copied().collect()).unwrap_or_default()
    }

    /// Run the hook for `(component, phase)`. Handler errors pass through untouched.
    pub async fn call(&self, component: &str, phase: Phase) -> Result<()> {
        let hook = self
            .table
            .get(component)
            .and_then(|p| p.get(&phase))
            .cloned()
            .ok_or_else(|| Error::not_found("hook", format!("{} {}", component, phase)))?;
        counter!("hook_calls_total", 1u64, "component" => component.to_string(), "phase" => phase.as_str());
        info!(component = %component, phase = %phase, "hook dispatch");
        hook().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn unregistered_pair_is_not_found() {
        let mut d = HookDispatcher::new();
        assert!(d.call("test", Phase::PreInstall).await.unwrap_err().is_not_found());
        d.add_hook("test", Phase::PreInstall, || async { Ok(()) }).unwrap();
        assert!(d.call("test", Phase::PostInstall).await.unwrap_err().is_not_found());
        assert!(d.call("other", Phase::PreInstall).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn duplicate_keeps_first_handler() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut d = HookDispatcher::new();
        let h = hits.clone();
        d.add_hook("test", Phase::PreInstall, move || {
            let h = h.clone();
            async move {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();
        let err = d.add_hook("test", Phase::PreInstall, || async { Err(Error::Timeout("second".into())) }).unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(_)));
        d.call("test", Phase::PreInstall).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_error_is_returned_unchanged() {
        let mut d = HookDispatcher::new();
        d.add_hook("ci", Phase::PostInstall, || async { Err(Error::Exec { command: "fly sync".into(), stderr: "nope".into() }) }).unwrap();
        let err = d.call("ci", Phase::PostInstall).await.unwrap_err();
        assert_eq!(err.to_string(), "exec error: fly sync: nope");
        assert_eq!(d.phases("ci"), vec![Phase::PostInstall]);
    }
}
