//! Cairn inputs: shared key-value inputs published by components and copied
//! into application namespaces.
//!
//! Every write is get-then-create-or-patch. There is no optimistic
//! concurrency; a create that races another writer falls back to a patch.

#![forbid(unsafe_code)]

use cairn_core::Result;
use cairn_kubehub::{data_from, Data, DataKind, ResourceStore, Subject};
use metrics::counter;
use tracing::{debug, info, warn};

pub const SYSTEM_VARS: &str = "system-vars";
pub const SYSTEM_SECRETS: &str = "system-secrets";
pub const APPLICATION_VARS: &str = "application-vars";
pub const APPLICATION_SECRETS: &str = "application-secrets";
/// RoleBinding in each application namespace granting the CI driver access.
pub const CI_DRIVER_ROLE_BINDING: &str = "application-ci-driver";

/// Create `name` with `data`, or merge `data` into it when it exists.
pub async fn upsert(store: &dyn ResourceStore, kind: DataKind, namespace: &str, name: &str, data: &Data) -> Result<()> {
    if store.get(kind, namespace, name).await?.is_some() {
        return store.patch(kind, namespace, name, data).await;
    }
    match store.create(kind, namespace, name, data).await {
        Err(e) if e.is_already_exists() => {
            debug!(%kind, ns = %namespace, name = %name, "created concurrently; patching");
            store.patch(kind, namespace, name, data).await
        }
        other => other,
    }
}

fn prefixed<K, V, I>(component: &str, pairs: I) -> Data
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<[u8]>,
{
    data_from(pairs.into_iter().map(|(k, v)| (format!("{}.{}", component, k.as_ref()), v)))
}

/// Publish `component`'s vars into the `system-vars` ConfigMap of `namespace`.
pub async fn publish_vars<K, V, I>(store: &dyn ResourceStore, component: &str, namespace: &str, pairs: I) -> Result<()>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<[u8]>,
{
    let data = prefixed(component, pairs);
    upsert(store, DataKind::ConfigMap, namespace, SYSTEM_VARS, &data).await?;
    counter!("inputs_published_total", data.len() as u64, "kind" => "vars");
    info!(component = %component, ns = %namespace, keys = data.len(), "system vars published");
    Ok(())
}

/// Publish `component`'s secrets into the `system-secrets` Secret of `namespace`.
pub async fn publish_secrets<K, V, I>(store: &dyn ResourceStore, component: &str, namespace: &str, pairs: I) -> Result<()>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<[u8]>,
{
    let data = prefixed(component, pairs);
    upsert(store, DataKind::Secret, namespace, SYSTEM_SECRETS, &data).await?;
    counter!("inputs_published_total", data.len() as u64, "kind" => "secrets");
    info!(component = %component, ns = %namespace, keys = data.len(), "system secrets published");
    Ok(())
}

/// Copy every key of a shared resource into an application resource.
///
/// Shared values win over what the application already holds. Returns the
/// application resource content after the merge. A missing shared resource
/// merges as empty.
pub async fn merge_shared(
    store: &dyn ResourceStore,
    kind: DataKind,
    from_ns: &str,
    from_name: &str,
    to_ns: &str,
    to_name: &str,
) -> Result<Data> {
    let shared = store.get(kind, from_ns, from_name).await?.unwrap_or_default();
    let mut merged = store.get(kind, to_ns, to_name).await?.unwrap_or_default();
    upsert(store, kind, to_ns, to_name, &shared).await?;
    merged.extend(shared);
    debug!(%kind, from = %format!("{}/{}", from_ns, from_name), to = %format!("{}/{}", to_ns, to_name), keys = merged.len(), "shared inputs merged");
    Ok(merged)
}

/// Append a ServiceAccount subject to the CI driver RoleBinding of `namespace`.
///
/// The list only grows; a subject already present is appended again.
pub async fn grant_driver_access(store: &dyn ResourceStore, namespace: &str, account: &str, account_namespace: &str) -> Result<()> {
    let mut subjects = store.role_binding_subjects(namespace, CI_DRIVER_ROLE_BINDING).await?;
    let subject = Subject {
        kind: "ServiceAccount".to_string(),
        name: account.to_string(),
        namespace: Some(account_namespace.to_string()),
        api_group: None,
    };
    if subjects.contains(&subject) {
        warn!(ns = %namespace, account = %account, "driver subject already bound; appending duplicate");
    }
    subjects.push(subject);
    store.patch_role_binding_subjects(namespace, CI_DRIVER_ROLE_BINDING, &subjects).await?;
    info!(ns = %namespace, account = %format!("{}/{}", account_namespace, account), "ci driver access granted");
    Ok(())
}
